//! Data logging toolkit.

use crate::{
    common::*,
    config::{Config, LoggingConfig},
    evaluate::EvaluationReport,
    train::EpochMetrics,
    utils::RateCounter,
};
use async_std::{fs::File, io::BufWriter as AsyncBufWriter};
use compiler_report::CompilationReport;
use std::future::Future;
use tfrecord::{EventWriter, EventWriterInit};

pub use logging_message::*;
pub use logging_worker::*;

mod logging_worker {
    use super::*;

    /// The data logging worker.
    #[derive(Debug)]
    pub struct LoggingWorker {
        event_writer: Option<EventWriter<AsyncBufWriter<File>>>,
        rate_counter: RateCounter,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Create a data logging worker.
        async fn new(
            config: Arc<Config>,
            logging_dir: Arc<PathBuf>,
            rx: broadcast::Receiver<LoggingMessage>,
        ) -> Result<Self> {
            let Config {
                logging: LoggingConfig {
                    enable_tensorboard,
                    ..
                },
                ..
            } = *config;

            let event_writer = if enable_tensorboard {
                let event_dir = logging_dir.join("events");
                let event_path_prefix = event_dir
                    .join("face-train")
                    .into_os_string()
                    .into_string()
                    .map_err(|path| format_err!("non-UTF-8 path {:?}", path))?;

                tokio::fs::create_dir_all(&event_dir).await?;

                let event_writer = EventWriterInit::default()
                    .from_prefix_async(event_path_prefix, None)
                    .await?;
                Some(event_writer)
            } else {
                None
            };

            Ok(Self {
                event_writer,
                rate_counter: RateCounter::with_second_interval(),
                rx,
            })
        }

        /// Start the data logging worker. It stops when all senders are dropped.
        async fn start(mut self) -> Result<()> {
            loop {
                let LoggingMessage { tag, kind } = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!("logging worker lagged behind, {} messages are lost", count);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                self.rate_counter.add(1.0);

                match kind {
                    LoggingMessageKind::Epoch { step, metrics } => {
                        self.log_epoch(&tag, step, metrics).await?;
                    }
                    LoggingMessageKind::Evaluation(msg) => {
                        self.log_evaluation(&tag, msg).await?;
                    }
                    LoggingMessageKind::Compilation(msg) => {
                        self.log_compilation(&tag, msg).await?;
                    }
                }

                if let Some(rate) = self.rate_counter.rate() {
                    debug!("processed {:.2} events/s", rate);
                }
            }

            debug!("logging worker stopped");
            Ok(())
        }

        async fn log_epoch(&mut self, tag: &str, step: usize, metrics: EpochMetrics) -> Result<()> {
            let event_writer = match &mut self.event_writer {
                Some(writer) => writer,
                None => return Ok(()),
            };
            let step = step as i64;
            let EpochMetrics {
                pass,
                learning_rate,
                train_loss,
                train_accuracy,
                validation_loss,
                validation_accuracy,
                ..
            } = metrics;

            let scalars = [
                ("params/pass", pass as f64),
                ("params/learning_rate", learning_rate),
                ("loss/train", train_loss),
                ("loss/validation", validation_loss),
                ("accuracy/train", train_accuracy),
                ("accuracy/validation", validation_accuracy),
            ];
            for (name, value) in scalars {
                event_writer
                    .write_scalar_async(format!("{}/{}", tag, name), step, value as f32)
                    .await?;
            }

            Ok(())
        }

        async fn log_evaluation(&mut self, tag: &str, msg: EvaluationLog) -> Result<()> {
            let event_writer = match &mut self.event_writer {
                Some(writer) => writer,
                None => return Ok(()),
            };
            let EvaluationLog {
                step,
                accuracy,
                macro_f1,
                weighted_f1,
            } = msg;
            let step = step as i64;

            for (name, value) in [
                ("accuracy", accuracy),
                ("macro_f1", macro_f1),
                ("weighted_f1", weighted_f1),
            ] {
                event_writer
                    .write_scalar_async(format!("{}/{}", tag, name), step, value as f32)
                    .await?;
            }

            Ok(())
        }

        async fn log_compilation(&mut self, tag: &str, msg: CompilationLog) -> Result<()> {
            let event_writer = match &mut self.event_writer {
                Some(writer) => writer,
                None => return Ok(()),
            };
            let CompilationLog {
                total_ops,
                ops_on_accelerator,
                ops_on_fallback_cpu,
            } = msg;

            for (name, value) in [
                ("total_ops", total_ops),
                ("ops_on_accelerator", ops_on_accelerator),
                ("ops_on_fallback_cpu", ops_on_fallback_cpu),
            ] {
                event_writer
                    .write_scalar_async(format!("{}/{}", tag, name), 0, value as f32)
                    .await?;
            }

            Ok(())
        }
    }

    /// Start the logging worker. The returned future resolves when the worker stops.
    pub async fn logging_worker(
        config: Arc<Config>,
        logging_dir: Arc<PathBuf>,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<impl Future<Output = Result<()>> + Send> {
        let worker = LoggingWorker::new(config, logging_dir, rx).await?;
        Ok(tokio::task::spawn(worker.start()).map(|result| Result::<_>::Ok(result??)))
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, Clone)]
    pub struct LoggingMessage {
        pub tag: Cow<'static, str>,
        pub kind: LoggingMessageKind,
    }

    impl LoggingMessage {
        pub fn new_epoch<S>(tag: S, step: usize, metrics: EpochMetrics) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Epoch { step, metrics },
            }
        }

        pub fn new_evaluation<S>(tag: S, step: usize, report: &EvaluationReport) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Evaluation(EvaluationLog {
                    step,
                    accuracy: report.accuracy,
                    macro_f1: report.macro_avg.f1,
                    weighted_f1: report.weighted_avg.f1,
                }),
            }
        }

        pub fn new_compilation<S>(tag: S, report: &CompilationReport) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Compilation(CompilationLog {
                    total_ops: report.total_ops,
                    ops_on_accelerator: report.ops_on_accelerator,
                    ops_on_fallback_cpu: report.ops_on_fallback_cpu,
                }),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub enum LoggingMessageKind {
        Epoch { step: usize, metrics: EpochMetrics },
        Evaluation(EvaluationLog),
        Compilation(CompilationLog),
    }

    #[derive(Debug, Clone)]
    pub struct EvaluationLog {
        pub step: usize,
        pub accuracy: f64,
        pub macro_f1: f64,
        pub weighted_f1: f64,
    }

    #[derive(Debug, Clone)]
    pub struct CompilationLog {
        pub total_ops: usize,
        pub ops_on_accelerator: usize,
        pub ops_on_fallback_cpu: usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_message_test() {
        let metrics = EpochMetrics {
            pass: 1,
            epoch: 2,
            learning_rate: 1e-4,
            train_loss: 0.5,
            train_accuracy: 0.8,
            validation_loss: 0.6,
            validation_accuracy: 0.75,
        };
        let msg = LoggingMessage::new_epoch("training", 3, metrics.clone());
        assert_eq!(msg.tag, "training");
        match msg.kind {
            LoggingMessageKind::Epoch { step, metrics: received } => {
                assert_eq!(step, 3);
                assert_eq!(received, metrics);
            }
            _ => unreachable!(),
        }
    }
}
