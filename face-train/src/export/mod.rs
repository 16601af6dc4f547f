//! The export pipeline: serialize, quantize, then compile for the accelerator.

mod compile;
mod quantize;
mod serialize;

pub use compile::*;
pub use quantize::*;
pub use serialize::*;

use crate::{
    common::*,
    config::{CompilerConfig, ExportConfig},
    data::{ClassIndex, Partition, SplitEntry},
    model::{Architecture, ModelSpec},
};
use compiler_report::{CompilationReport, EdgeTpuParser, ReportParser};

/// Read-only access to a trained model for export.
pub trait Exportable {
    fn model_spec(&self) -> &ModelSpec;

    /// Writes the weights in the libtorch variable store format.
    fn write_weights(&self, path: &Path) -> Result<()>;

    /// All parameters and buffers in name order.
    fn named_parameters(&self) -> Result<Vec<NamedParameter>>;

    /// Measures activation ranges over the calibration examples.
    fn activation_ranges(
        &self,
        calibration: &[SplitEntry],
        batch_size: usize,
    ) -> Result<Vec<ActivationRange>>;
}

/// Artifacts of the serialize and quantize stages.
#[derive(Debug, Clone)]
pub struct PreparedExport {
    pub serialized: SerializedModel,
    pub quantized: PathBuf,
}

/// The result of a completed export.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub serialized: SerializedModel,
    pub quantized: PathBuf,
    /// Absent if no compiler is configured.
    pub compilation: Option<CompilationReport>,
    /// Set if the compiled model does not run entirely on the accelerator.
    pub offload_warning: Option<String>,
}

/// Runs the export stages in order.
#[derive(Debug)]
pub struct ExportPipeline {
    output_dir: PathBuf,
    task: String,
    version: Option<u32>,
    calibration_samples: usize,
    batch_size: usize,
    seed: u64,
    quantizer: Box<dyn Quantizer>,
    compiler: Option<CompilerConfig>,
    parser: Arc<dyn ReportParser>,
}

impl ExportPipeline {
    pub fn new(config: &ExportConfig, batch_size: usize, seed: u64) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            task: config.task.clone(),
            version: config.version,
            calibration_samples: config.calibration_samples.get(),
            batch_size,
            seed,
            quantizer: quantizer(&config.quantizer),
            compiler: config.compiler.clone(),
            parser: Arc::new(EdgeTpuParser::new()),
        }
    }

    /// Replaces the compiler output parser.
    pub fn with_parser(mut self, parser: Arc<dyn ReportParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn quantized_path(&self, spec: &ModelSpec) -> PathBuf {
        quantized_path(
            &self.output_dir,
            spec.architecture,
            &self.task,
            self.quantizer.extension(),
        )
    }

    /// Runs the serialize and quantize stages.
    pub fn prepare<M>(
        &self,
        model: &M,
        class_index: &ClassIndex,
        partition: &Partition,
    ) -> Fallible<PreparedExport>
    where
        M: Exportable,
    {
        let span = info_span!("export");
        let _enter = span.enter();

        // serialize
        let serialized = serialize_model(model, class_index, &self.output_dir, self.version)?;
        info!("serialized model to '{}'", serialized.dir.display());

        // quantize
        let calibration = calibration_subset(partition, self.calibration_samples, self.seed);
        let quantized = self.quantized_path(model.model_spec());
        self.quantizer
            .quantize(
                model,
                &QuantizeInput {
                    serialized: &serialized,
                    class_index,
                    calibration: &calibration,
                    batch_size: self.batch_size,
                },
                &quantized,
            )
            .map_err(|err| {
                Error::export(ExportStage::Quantize, err)
                    .with_retained(vec![serialized.dir.clone()])
            })?;
        info!(
            "quantized model to '{}' with {} calibration examples",
            quantized.display(),
            calibration.len()
        );

        Ok(PreparedExport {
            serialized,
            quantized,
        })
    }

    /// Runs the accelerator compile stage on prepared artifacts.
    ///
    /// The serialized and quantized artifacts are kept if compilation fails.
    pub async fn compile(&self, prepared: PreparedExport) -> Fallible<ExportOutcome> {
        let PreparedExport {
            serialized,
            quantized,
        } = prepared;

        let compiler = match &self.compiler {
            Some(compiler) => compiler,
            None => {
                info!("no accelerator compiler is configured, skip compilation");
                return Ok(ExportOutcome {
                    serialized,
                    quantized,
                    compilation: None,
                    offload_warning: None,
                });
            }
        };

        let report = compile_model(compiler, &*self.parser, &quantized, &self.output_dir)
            .instrument(info_span!("compile"))
            .await
            .map_err(|err| err.with_retained(vec![serialized.dir.clone(), quantized.clone()]))?;
        let offload_warning = check_offload(&report);

        Ok(ExportOutcome {
            serialized,
            quantized,
            compilation: Some(report),
            offload_warning,
        })
    }
}

/// `<output_dir>/<architecture>-<task>-quant.<extension>`
pub fn quantized_path(
    output_dir: &Path,
    architecture: Architecture,
    task: &str,
    extension: &str,
) -> PathBuf {
    output_dir.join(format!("{}-{}-quant.{}", architecture, task, extension))
}

/// The first `samples` examples of a seeded shuffle of the train and validation splits.
pub fn calibration_subset(partition: &Partition, samples: usize, seed: u64) -> Vec<SplitEntry> {
    let mut pool: Vec<_> = partition.train_and_validation().cloned().collect();
    let mut rng = StdRng::seed_from_u64(seed);
    pool.shuffle(&mut rng);
    pool.truncate(samples);
    pool
}
