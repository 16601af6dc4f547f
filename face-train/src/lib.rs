//! The training and export program for face and person classifiers.

pub mod balance;
pub mod common;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod export;
pub mod logging;
pub mod model;
pub mod train;
pub mod utils;

pub use error::{Error, ExportStage, Fallible};

use crate::{
    balance::ClassWeightTable,
    common::*,
    config::Config,
    data::{Partition, PartitionConfig},
    evaluate::{EvaluationReport, Predict},
    export::{ExportOutcome, ExportPipeline, Exportable, PreparedExport},
    logging::LoggingMessage,
    model::{ClassifierModel, ModelSpec, TchEngine},
    train::{PassSchedule, SchedulerOptions, TrainingScheduler, TrainingSummary},
};

pub const CLASS_DICT_FILE_NAME: &str = "class_dict.json";
pub const EVALUATION_FILE_NAME: &str = "evaluation.json";
pub const TRAINING_SUMMARY_FILE_NAME: &str = "training.json";

/// The results of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The logging directory of this run.
    pub logging_dir: PathBuf,
    pub training: TrainingSummary,
    /// Absent if evaluation is disabled.
    pub evaluation: Option<EvaluationReport>,
    /// Absent if export is disabled.
    pub export: Option<ExportOutcome>,
}

/// The entry of the training program.
pub async fn start(config: Arc<Config>) -> Result<RunOutcome> {
    config.validate()?;

    let start_time = Local::now();
    let logging_dir = Arc::new(
        config
            .logging
            .dir
            .join(format!("{}", start_time.format(utils::FILE_STRFTIME))),
    );
    let checkpoint_dir = logging_dir.join("checkpoints");

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&*logging_dir).await?;
        tokio::fs::create_dir_all(&checkpoint_dir).await?;
        let path = logging_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }

    // create channels
    let (logging_tx, logging_rx) = broadcast::channel(16);

    // start logger
    let logging_future =
        logging::logging_worker(config.clone(), logging_dir.clone(), logging_rx).await?;

    // the logger stops when the pipeline drops its sender
    let pipeline_future = run_pipeline(config, logging_dir, checkpoint_dir, logging_tx);

    let (outcome, ()) = futures::try_join!(pipeline_future, logging_future)?;
    Ok(outcome)
}

async fn run_pipeline(
    config: Arc<Config>,
    logging_dir: Arc<PathBuf>,
    checkpoint_dir: PathBuf,
    logging_tx: broadcast::Sender<LoggingMessage>,
) -> Result<RunOutcome> {
    // load dataset
    info!("loading dataset");
    let partition = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || load_partition(&config)).await??
    };
    {
        let path = logging_dir.join(CLASS_DICT_FILE_NAME);
        let text = serde_json::to_string_pretty(&partition.class_index)?;
        tokio::fs::write(&path, text).await?;
    }

    let class_weights = class_weights(&config, &partition)?;
    for (label, weight) in izip!(partition.class_index.labels(), class_weights.as_slice()) {
        info!("class weight {}: {:.4}", label, weight);
    }

    let pipeline = config.export.enabled.then(|| {
        Arc::new(ExportPipeline::new(
            &config.export,
            config.training.batch_size.get(),
            config.seed,
        ))
    });

    // training worker, the model lives in this thread until export artifacts are written
    let (training, evaluation, prepared) = {
        let config = config.clone();
        let pipeline = pipeline.clone();
        let logging_tx = logging_tx.clone();

        tokio::task::spawn_blocking(move || {
            training_worker(
                &config,
                &partition,
                class_weights,
                checkpoint_dir,
                pipeline.as_deref(),
                logging_tx,
            )
        })
        .map(|result| Result::<_>::Ok(result??))
        .await?
    };

    {
        let path = logging_dir.join(TRAINING_SUMMARY_FILE_NAME);
        let text = serde_json::to_string_pretty(&training)?;
        tokio::fs::write(&path, text).await?;
    }
    if let Some(report) = &evaluation {
        let path = logging_dir.join(EVALUATION_FILE_NAME);
        let text = serde_json::to_string_pretty(report)?;
        tokio::fs::write(&path, text).await?;
    }

    // compile worker
    let export = match (pipeline, prepared) {
        (Some(pipeline), Some(prepared)) => {
            let outcome = pipeline.compile(prepared).await?;
            if let Some(report) = &outcome.compilation {
                let _ = logging_tx.send(LoggingMessage::new_compilation("export", report));
            }
            info!(
                "exported '{}' and '{}'",
                outcome.serialized.dir.display(),
                outcome.quantized.display()
            );
            Some(outcome)
        }
        _ => None,
    };

    Ok(RunOutcome {
        logging_dir: (*logging_dir).clone(),
        training,
        evaluation,
        export,
    })
}

/// Lists, relabels and splits the corpus.
pub fn load_partition(config: &Config) -> Fallible<Partition> {
    let dataset = &config.dataset;

    let records = data::data_source(&dataset.kind).load()?;
    info!("loaded {} records", records.len());
    let records = data::label_scheme(&dataset.label_scheme).apply(records);

    data::partition(
        records,
        &PartitionConfig {
            validation_fraction: dataset.validation_fraction,
            test_fraction: dataset.test_fraction,
            test_enabled: config.evaluation.enabled,
            class_order: dataset.class_order,
            unknown_class: dataset.unknown_class.clone(),
            seed: config.seed,
        },
    )
}

/// Inverse-frequency weights of the train split, or uniform weights if balancing is disabled.
pub fn class_weights(config: &Config, partition: &Partition) -> Fallible<ClassWeightTable> {
    if config.training.balance_classes {
        ClassWeightTable::from_split(&partition.train, &partition.class_index)
    } else {
        Ok(ClassWeightTable::uniform(partition.num_classes()))
    }
}

/// Writes the serialized and quantized models, then evaluates the model on the test split.
///
/// A failed evaluation leaves the written export artifacts in place.
pub fn export_and_evaluate<M>(
    model: &M,
    partition: &Partition,
    pipeline: Option<&ExportPipeline>,
    evaluation_enabled: bool,
    batch_size: usize,
) -> Fallible<(Option<PreparedExport>, Option<EvaluationReport>)>
where
    M: Predict + Exportable,
{
    // serialize and quantize
    let prepared = match pipeline {
        Some(pipeline) => Some(pipeline.prepare(model, &partition.class_index, partition)?),
        None => {
            info!("export is disabled");
            None
        }
    };

    // evaluate
    let evaluation = if evaluation_enabled {
        let result = evaluate::evaluate(model, &partition.test, &partition.class_index, batch_size);
        let report = match (result, &prepared) {
            (Ok(report), _) => report,
            (Err(Error::Data(message)), Some(prepared)) => {
                return Err(Error::data(format!(
                    "{}, the exported model is kept at '{}' and '{}'",
                    message,
                    prepared.serialized.dir.display(),
                    prepared.quantized.display()
                )));
            }
            (Err(err), _) => return Err(err),
        };
        Some(report)
    } else {
        info!("evaluation is disabled");
        None
    };

    Ok((prepared, evaluation))
}

type TrainingResult = (
    TrainingSummary,
    Option<EvaluationReport>,
    Option<PreparedExport>,
);

fn training_worker(
    config: &Config,
    partition: &Partition,
    class_weights: ClassWeightTable,
    checkpoint_dir: PathBuf,
    pipeline: Option<&ExportPipeline>,
    logging_tx: broadcast::Sender<LoggingMessage>,
) -> Fallible<TrainingResult> {
    let batch_size = config.training.batch_size.get();

    // init model
    info!("initializing model");
    let spec = ModelSpec::from_config(&config.model, partition.num_classes());
    let mut model = ClassifierModel::new(spec, config.model.device)
        .map_err(|err| Error::configuration(format!("{:#}", err)))?;
    if let Some(path) = &config.model.weights_file {
        model
            .load_base_weights(path)
            .map_err(|err| Error::configuration(format!("{:#}", err)))?;
    }

    // train
    let schedule = PassSchedule::from_config(&config.training)?;
    let options = SchedulerOptions {
        batch_size,
        shuffle: config.training.shuffle,
        seed: config.seed,
        checkpoint_dir: config.training.save_checkpoints.then(|| checkpoint_dir),
    };
    let mut scheduler = TrainingScheduler::new(
        TchEngine::new(model),
        schedule,
        partition.train.clone(),
        partition.validation.clone(),
        class_weights,
        options,
    )?
    .with_logging(logging_tx.clone());

    if let Some(checkpoint) =
        utils::find_checkpoint(&config.logging.dir, &config.training.load_checkpoint)?
    {
        scheduler.resume(&checkpoint)?;
    }
    scheduler.run()?;
    let (engine, summary) = scheduler.finish()?;

    let (prepared, evaluation) = export_and_evaluate(
        &engine,
        partition,
        pipeline,
        config.evaluation.enabled,
        batch_size,
    )?;
    if let Some(report) = &evaluation {
        let _ = logging_tx.send(LoggingMessage::new_evaluation(
            "evaluation",
            summary.history.len(),
            report,
        ));
    }

    Ok((summary, evaluation, prepared))
}
