//! The stage-level error taxonomy.

use crate::train::EpochMetrics;
use std::{fmt, path::PathBuf};

/// Result type of stage-level operations.
pub type Fallible<T> = std::result::Result<T, Error>;

/// Fatal errors, each naming the stage or pass it occurred in.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or inconsistent settings, detected before a stage spends compute.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Corpus-level problems such as an empty class or an empty split.
    #[error("data error: {0}")]
    Data(String),

    /// Divergence or backend failure in the middle of a pass.
    ///
    /// Checkpoints of previously completed passes stay valid.
    #[error(
        "training failed in pass {pass}{}: {cause:#} ({})",
        .epoch.map(|epoch| format!(", epoch {}", epoch)).unwrap_or_default(),
        HistorySummary(.history)
    )]
    Training {
        pass: usize,
        epoch: Option<usize>,
        history: Vec<EpochMetrics>,
        cause: anyhow::Error,
    },

    /// Serialization, quantization or compiler failure.
    ///
    /// The trained model and artifacts of earlier stages are kept.
    #[error(
        "export failed at {stage} stage: {message}{}",
        RetainedSummary(.retained)
    )]
    Export {
        stage: ExportStage,
        message: String,
        retained: Vec<PathBuf>,
    },
}

impl Error {
    pub fn configuration(message: impl fmt::Display) -> Self {
        Self::Configuration(message.to_string())
    }

    pub fn data(message: impl fmt::Display) -> Self {
        Self::Data(message.to_string())
    }

    pub fn export(stage: ExportStage, error: impl fmt::Display) -> Self {
        Self::Export {
            stage,
            message: format!("{:#}", error),
            retained: vec![],
        }
    }

    /// Attaches the artifact paths that survive an export failure.
    pub fn with_retained(self, paths: Vec<PathBuf>) -> Self {
        match self {
            Self::Export { stage, message, .. } => Self::Export {
                stage,
                message,
                retained: paths,
            },
            other => other,
        }
    }

    /// The epoch metrics accumulated before the failure, if any.
    pub fn history(&self) -> &[EpochMetrics] {
        match self {
            Self::Training { history, .. } => history,
            _ => &[],
        }
    }
}

/// The stages of the export pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ExportStage {
    Serialize,
    Quantize,
    Compile,
}

struct HistorySummary<'a>(&'a [EpochMetrics]);

impl fmt::Display for HistorySummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.last() {
            Some(last) => write!(
                f,
                "{} epochs completed, last: {}",
                self.0.len(),
                last
            ),
            None => write!(f, "no epoch completed"),
        }
    }
}

struct RetainedSummary<'a>(&'a [PathBuf]);

impl fmt::Display for RetainedSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, " (retained artifacts:")?;
        for path in self.0 {
            write!(f, " {}", path.display())?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_error_message_test() {
        let history = vec![EpochMetrics {
            pass: 1,
            epoch: 1,
            learning_rate: 1e-4,
            train_loss: 0.9,
            train_accuracy: 0.5,
            validation_loss: 0.8,
            validation_accuracy: 0.6,
        }];
        let error = Error::Training {
            pass: 2,
            epoch: Some(1),
            history,
            cause: anyhow::anyhow!("loss is NaN"),
        };
        let message = error.to_string();
        assert!(message.contains("pass 2, epoch 1"));
        assert!(message.contains("loss is NaN"));
        assert!(message.contains("1 epochs completed"));
        assert_eq!(error.history().len(), 1);
    }

    #[test]
    fn export_error_message_test() {
        let error = Error::export(ExportStage::Compile, "compiler timeout")
            .with_retained(vec![PathBuf::from("out/tiny-face-quant.fqm")]);
        let message = error.to_string();
        assert!(message.starts_with("export failed at compile stage: compiler timeout"));
        assert!(message.contains("out/tiny-face-quant.fqm"));
    }
}
