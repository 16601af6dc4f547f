//! Training program configuration format.

use crate::{common::*, model::Architecture, utils::Ratio};

pub use dataset::*;
pub use evaluation::*;
pub use export::*;
pub use model::*;
pub use training::*;

pub static CONFIG_VERSION: Lazy<VersionReq> = Lazy::new(|| VersionReq::parse("0.1").unwrap());

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: Version,
    /// The seed of every random operation in a run.
    #[serde(default = "default_seed")]
    pub seed: u64,
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    pub export: ExportConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        Ok(config)
    }

    /// Checks settings that can be verified without touching the corpus.
    pub fn validate(&self) -> Fallible<()> {
        if !CONFIG_VERSION.matches(&self.version) {
            return Err(Error::configuration(format!(
                "incompatible configuration version {}, expect {}",
                self.version, *CONFIG_VERSION
            )));
        }

        let DatasetConfig {
            validation_fraction,
            test_fraction,
            ..
        } = self.dataset;
        let test_fraction = if self.evaluation.enabled {
            test_fraction
        } else {
            Ratio::zero()
        };
        let held_out = validation_fraction
            .checked_add(test_fraction)
            .map_err(Error::configuration)?;
        if held_out.to_f64() >= 1.0 - f64::default_epsilon() {
            return Err(Error::configuration(format!(
                "validation_fraction + test_fraction must be less than 1.0, but get {}",
                held_out
            )));
        }
        if validation_fraction == 0.0 {
            return Err(Error::configuration("validation_fraction must be positive"));
        }
        if self.evaluation.enabled && test_fraction == 0.0 {
            return Err(Error::configuration(
                "test_fraction must be positive when evaluation is enabled",
            ));
        }

        if self.model.l2_penalty.raw() < 0.0 {
            return Err(Error::configuration("l2_penalty must be non-negative"));
        }
        if self.model.dropout.to_f64() >= 1.0 {
            return Err(Error::configuration("dropout must be less than 1.0"));
        }
        if self.model.freeze_layer_count > self.model.architecture.base_modules().len() {
            return Err(Error::configuration(format!(
                "freeze_layer_count {} exceeds the {} base modules of {}",
                self.model.freeze_layer_count,
                self.model.architecture.base_modules().len(),
                self.model.architecture
            )));
        }

        // the pass list is checked by the scheduler, which owns its semantics
        if self.training.passes.is_empty() {
            return Err(Error::configuration("at least one training pass is required"));
        }

        if self.export.task.is_empty() || self.export.task.contains(std::path::MAIN_SEPARATOR) {
            return Err(Error::configuration(format!(
                "invalid export task name '{}'",
                self.export.task
            )));
        }
        if self.export.enabled && self.export.compiler.is_some() {
            if let QuantizerConfig::Builtin { .. } = self.export.quantizer {
                return Err(Error::configuration(
                    "the builtin quantizer output cannot be compiled, \
                     use an external quantizer or remove the compiler",
                ));
            }
        }

        Ok(())
    }
}

fn default_seed() -> u64 {
    1234
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The data source.
        pub kind: DatasetKind,
        /// The labeling scheme applied to the raw labels.
        #[serde(default)]
        pub label_scheme: LabelSchemeConfig,
        /// The order of label names in the class index.
        #[serde(default)]
        pub class_order: ClassOrder,
        /// The catch-all class placed at index 0 when present.
        pub unknown_class: Option<String>,
        pub validation_fraction: Ratio,
        pub test_fraction: Ratio,
    }

    /// Variants of data sources and options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum DatasetKind {
        /// One directory per class, named after the label.
        Directory {
            dir: PathBuf,
            #[serde(default = "default_extensions")]
            extensions: Vec<String>,
        },
        /// CSV manifest with `image_file` and `label` columns.
        Csv {
            image_dir: PathBuf,
            label_file: PathBuf,
        },
    }

    /// The labeling scheme.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LabelSchemeConfig {
        /// Keep the labels as they are.
        Identity,
        /// The alternate labeling scheme.
        ///
        /// Labels listed in `mapping` are renamed, others are renamed to `fallback` if set.
        /// A label renamed to an empty string is dropped.
        Remap {
            mapping: IndexMap<String, String>,
            fallback: Option<String>,
        },
    }

    impl Default for LabelSchemeConfig {
        fn default() -> Self {
            Self::Identity
        }
    }

    /// The order of label names in the class index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ClassOrder {
        Alphabetical,
        Insertion,
    }

    impl Default for ClassOrder {
        fn default() -> Self {
            Self::Alphabetical
        }
    }

    fn default_extensions() -> Vec<String> {
        vec!["jpg".into(), "jpeg".into(), "png".into()]
    }
}

mod model {
    use super::*;

    /// The model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        /// The convolutional base.
        pub architecture: Architecture,
        /// Pretrained weights of the convolutional base.
        pub weights_file: Option<PathBuf>,
        /// The square input size in pixels.
        pub image_size: NonZeroUsize,
        /// Units of the dense layer in the head.
        pub dense_units: NonZeroUsize,
        pub dropout: Ratio,
        /// L2 penalty on the output layer weight.
        pub l2_penalty: R64,
        /// Leading base modules that stay frozen when the base is unfrozen.
        #[serde(default)]
        pub freeze_layer_count: usize,
        /// The device where the model runs on.
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        /// The batch size.
        pub batch_size: NonZeroUsize,
        /// The number of epochs of a pass that does not set its own.
        pub epochs: NonZeroUsize,
        /// Shuffle the train split at the start of every epoch.
        #[serde(default = "default_true")]
        pub shuffle: bool,
        /// Weight the loss by inverse class frequency.
        #[serde(default = "default_true")]
        pub balance_classes: bool,
        /// The ordered training passes.
        pub passes: Vec<PassConfig>,
        /// Save a checkpoint after every completed pass.
        #[serde(default = "default_true")]
        pub save_checkpoints: bool,
        /// Checkpoint file loading method.
        #[serde(default)]
        pub load_checkpoint: LoadCheckpoint,
    }

    /// One training pass.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PassConfig {
        pub base_frozen: bool,
        pub learning_rate: R64,
        pub epochs: Option<NonZeroUsize>,
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile {
            file: PathBuf,
            /// Overrides the pass number encoded in the file name.
            completed_passes: Option<usize>,
        },
    }

    impl Default for LoadCheckpoint {
        fn default() -> Self {
            Self::Disabled
        }
    }
}

mod evaluation {
    use super::*;

    /// Test split evaluation options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EvaluationConfig {
        pub enabled: bool,
    }

    impl Default for EvaluationConfig {
        fn default() -> Self {
            Self { enabled: true }
        }
    }
}

mod export {
    use super::*;

    /// Export pipeline options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ExportConfig {
        #[serde(default = "default_true")]
        pub enabled: bool,
        pub output_dir: PathBuf,
        /// The task name in the quantized artifact name, e.g. `face` or `person`.
        pub task: String,
        /// The serialized model version. The next free version is used if not set.
        pub version: Option<u32>,
        /// Number of train and validation examples used for calibration.
        pub calibration_samples: NonZeroUsize,
        pub quantizer: QuantizerConfig,
        /// The accelerator compiler. Compilation is skipped if not set.
        pub compiler: Option<CompilerConfig>,
    }

    /// Quantizer options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum QuantizerConfig {
        /// The built-in int8 quantizer.
        Builtin {
            #[serde(default = "default_builtin_extension")]
            extension: String,
        },
        /// An external converter command.
        ///
        /// The `{model_dir}`, `{calibration}` and `{output}` placeholders in `args` are
        /// substituted before the command runs.
        External {
            program: PathBuf,
            args: Vec<String>,
            extension: String,
        },
    }

    impl QuantizerConfig {
        pub fn extension(&self) -> &str {
            match self {
                Self::Builtin { extension } => extension,
                Self::External { extension, .. } => extension,
            }
        }
    }

    /// Accelerator compiler options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CompilerConfig {
        #[serde(default = "default_compiler_program")]
        pub program: PathBuf,
        /// Extra arguments placed before the output options.
        #[serde(default)]
        pub args: Vec<String>,
        #[serde(default = "default_compiler_timeout")]
        pub timeout_secs: u64,
    }

    fn default_builtin_extension() -> String {
        "fqm".into()
    }

    fn default_compiler_program() -> PathBuf {
        "edgetpu_compiler".into()
    }

    fn default_compiler_timeout() -> u64 {
        180
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    /// Write TensorBoard event files.
    #[serde(default)]
    pub enable_tensorboard: bool,
}

fn default_true() -> bool {
    true
}

pub fn deserialize_version<'de, D>(deserializer: D) -> Result<Version, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    let version = Version::parse(&text).map_err(|err| {
        D::Error::custom(format!(
            "failed to parse version number '{}': {:?}",
            text, err
        ))
    })?;
    Ok(version)
}
