use anyhow::{Context, Result};
use face_train::config::Config;
use std::{env, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tracing::{info_span, Instrument};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Train and export a face or person classifier
struct Args {
    #[structopt(long, default_value = "train.json5")]
    /// configuration file
    pub config_file: PathBuf,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse arguments
    let Args { config_file } = Args::from_args();
    let config = Arc::new(
        Config::open(&config_file)
            .with_context(|| format!("failed to load config file '{}'", config_file.display()))?,
    );

    // start training program
    let outcome = face_train::start(config)
        .instrument(info_span!("face-train"))
        .await?;

    if let Some(report) = &outcome.evaluation {
        println!("{}", report);
    }
    if let Some(export) = &outcome.export {
        println!("serialized model: {}", export.serialized.dir.display());
        println!("quantized model: {}", export.quantized.display());
        if let Some(report) = &export.compilation {
            println!("compilation: {}", report);
        }
        if let Some(warning) = &export.offload_warning {
            println!("warning: {}", warning);
        }
    }

    Ok(())
}
