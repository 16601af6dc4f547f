use anyhow::{bail, Context, Result};
use clap::Parser;
use compiler_report::{CompilationReport, EdgeTpuParser, ReportParser};
use face_train::{
    config::Config,
    export::{self, check_offload, compile_model},
};
use prettytable::{cell, row, Table};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
enum Opts {
    /// Show the class index, split sizes and class weights of a corpus
    Info {
        /// configuration file
        config_file: PathBuf,
    },
    /// Compile an existing quantized model for the accelerator
    Compile {
        /// configuration file
        config_file: PathBuf,
        /// quantized model, derived from the configuration if not set
        #[clap(long)]
        quantized: Option<PathBuf>,
    },
    /// Parse saved compiler output
    Report {
        /// captured compiler stdout and stderr
        output_file: PathBuf,
        /// operation log written by the compiler
        #[clap(long)]
        log_file: Option<PathBuf>,
        /// print the report in JSON
        #[clap(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if std::env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    match Opts::parse() {
        Opts::Info { config_file } => {
            info(config_file)?;
        }
        Opts::Compile {
            config_file,
            quantized,
        } => {
            compile(config_file, quantized).await?;
        }
        Opts::Report {
            output_file,
            log_file,
            json,
        } => {
            report(output_file, log_file, json)?;
        }
    }

    Ok(())
}

fn load_config(config_file: &Path) -> Result<Config> {
    let config = Config::open(config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))?;
    config.validate()?;
    Ok(config)
}

fn info(config_file: impl AsRef<Path>) -> Result<()> {
    let config = load_config(config_file.as_ref())?;
    let partition = face_train::load_partition(&config)?;
    let class_index = &partition.class_index;
    let num_classes = class_index.len();
    let class_weights = face_train::class_weights(&config, &partition)?;

    let train_counts = partition.train.class_counts(num_classes);
    let validation_counts = partition.validation.class_counts(num_classes);
    let test_counts = partition.test.class_counts(num_classes);

    let mut table = Table::new();
    table.add_row(row!["index", "class", "train", "validation", "test", "weight"]);
    for (index, label) in class_index.labels().enumerate() {
        table.add_row(row![
            index,
            label,
            train_counts[index],
            validation_counts[index],
            test_counts[index],
            format!("{:.4}", class_weights.weight(index)?)
        ]);
    }
    table.add_row(row![
        "",
        "total",
        partition.train.len(),
        partition.validation.len(),
        partition.test.len(),
        ""
    ]);
    table.printstd();

    Ok(())
}

async fn compile(config_file: impl AsRef<Path>, quantized: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_file.as_ref())?;
    let export_config = &config.export;
    let compiler = match &export_config.compiler {
        Some(compiler) => compiler,
        None => bail!("no compiler is configured in '{}'", config_file.as_ref().display()),
    };

    let quantized = quantized.unwrap_or_else(|| {
        export::quantized_path(
            &export_config.output_dir,
            config.model.architecture,
            &export_config.task,
            export_config.quantizer.extension(),
        )
    });
    let output_dir = quantized
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| export_config.output_dir.clone());

    let report = compile_model(compiler, &EdgeTpuParser::new(), &quantized, &output_dir).await?;
    print_report(&report);
    if let Some(warning) = check_offload(&report) {
        println!("warning: {}", warning);
    }

    Ok(())
}

fn report(output_file: impl AsRef<Path>, log_file: Option<PathBuf>, json: bool) -> Result<()> {
    let output_file = output_file.as_ref();
    let text = fs::read_to_string(output_file)
        .with_context(|| format!("failed to read '{}'", output_file.display()))?;
    let log = log_file
        .map(|path| {
            fs::read_to_string(&path)
                .with_context(|| format!("failed to read '{}'", path.display()))
        })
        .transpose()?;

    let report = EdgeTpuParser::new().parse_with_log(&text, log.as_deref())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

fn print_report(report: &CompilationReport) {
    println!("compilation {}", report);
    if let Some(version) = &report.compiler_version {
        println!("compiler version: {}", version);
    }
    if let Some(path) = &report.output_model {
        println!("output model: {}", path.display());
    }

    if !report.operations.is_empty() {
        let mut table = Table::new();
        table.add_row(row!["operator", "count", "status"]);
        for op in &report.operations {
            table.add_row(row![op.operator, op.count, op.status]);
        }
        table.printstd();
    }
}
