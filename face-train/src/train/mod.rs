//! The pass-based training scheduler.

mod engine;
mod schedule;

pub use engine::*;
pub use schedule::*;

use crate::{
    balance::ClassWeightTable,
    common::*,
    data::{DatasetSplit, SplitEntry},
    logging::LoggingMessage,
    utils::{self, CheckpointFile, RateCounter},
};

/// The state of the training scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// Running, or finished with more passes to go.
    Pass(usize),
    /// All passes completed. The model is ready for export.
    Exporting,
    Done,
    Failed { pass: usize },
}

/// Metrics recorded after each epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub pass: usize,
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub validation_loss: f64,
    pub validation_accuracy: f64,
}

impl Display for EpochMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pass: {}\tepoch: {}\tlr: {:e}\tloss: {:.5}\tacc: {:.4}\tval_loss: {:.5}\tval_acc: {:.4}",
            self.pass,
            self.epoch,
            self.learning_rate,
            self.train_loss,
            self.train_accuracy,
            self.validation_loss,
            self.validation_accuracy
        )
    }
}

/// The outcome of one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassSummary {
    pub spec: TrainingPassSpec,
    /// Metrics of the last epoch. Not available for passes restored from a checkpoint.
    pub final_metrics: Option<EpochMetrics>,
    pub checkpoint: Option<PathBuf>,
    pub restored: bool,
}

/// The training record handed out with the trained engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub history: Vec<EpochMetrics>,
    pub passes: Vec<PassSummary>,
}

/// Scheduler options.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub batch_size: usize,
    /// Shuffle the train split every epoch.
    pub shuffle: bool,
    pub seed: u64,
    /// Save the weights after each completed pass.
    pub checkpoint_dir: Option<PathBuf>,
}

/// Runs the passes of a schedule in order over an [Engine].
#[derive(Debug)]
pub struct TrainingScheduler<E>
where
    E: Engine,
{
    engine: E,
    schedule: PassSchedule,
    train: DatasetSplit,
    validation: DatasetSplit,
    class_weights: ClassWeightTable,
    options: SchedulerOptions,
    steps_per_epoch: usize,
    validation_steps: usize,
    state: SchedulerState,
    completed_passes: usize,
    history: Vec<EpochMetrics>,
    pass_summaries: Vec<PassSummary>,
    rng: StdRng,
    logging_tx: Option<broadcast::Sender<LoggingMessage>>,
}

impl<E> TrainingScheduler<E>
where
    E: Engine,
{
    /// Creates a scheduler, checking that both splits fill at least one batch.
    pub fn new(
        engine: E,
        schedule: PassSchedule,
        train: DatasetSplit,
        validation: DatasetSplit,
        class_weights: ClassWeightTable,
        options: SchedulerOptions,
    ) -> Fallible<Self> {
        let batch_size = options.batch_size;
        if batch_size == 0 {
            return Err(Error::configuration("batch_size must be positive"));
        }

        let steps_per_epoch = train.len() / batch_size;
        let validation_steps = validation.len() / batch_size;
        for (split, steps) in [(&train, steps_per_epoch), (&validation, validation_steps)] {
            if steps == 0 {
                return Err(Error::configuration(format!(
                    "the {} split has {} examples, fewer than one batch of {}",
                    split.kind,
                    split.len(),
                    batch_size
                )));
            }
        }

        if train
            .iter()
            .chain(validation.iter())
            .any(|entry| entry.class >= class_weights.len())
        {
            return Err(Error::configuration(
                "the class weight table does not cover every class",
            ));
        }

        info!(
            "{} steps per epoch, {} validation steps",
            steps_per_epoch, validation_steps
        );

        let rng = StdRng::seed_from_u64(options.seed);

        Ok(Self {
            engine,
            schedule,
            train,
            validation,
            class_weights,
            options,
            steps_per_epoch,
            validation_steps,
            state: SchedulerState::Idle,
            completed_passes: 0,
            history: vec![],
            pass_summaries: vec![],
            rng,
            logging_tx: None,
        })
    }

    /// Sends epoch metrics to the logging worker.
    pub fn with_logging(mut self, logging_tx: broadcast::Sender<LoggingMessage>) -> Self {
        self.logging_tx = Some(logging_tx);
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    pub fn validation_steps(&self) -> usize {
        self.validation_steps
    }

    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The number of the pass allowed to run next.
    pub fn next_pass(&self) -> Option<usize> {
        let next = self.completed_passes + 1;
        (next <= self.schedule.len()).then(|| next)
    }

    /// Restores weights saved at a pass boundary and skips the passes it covers.
    pub fn resume(&mut self, checkpoint: &CheckpointFile) -> Fallible<()> {
        if self.state != SchedulerState::Idle {
            return Err(Error::configuration(
                "a checkpoint can only be restored before training starts",
            ));
        }
        if checkpoint.pass > self.schedule.len() {
            return Err(Error::configuration(format!(
                "checkpoint '{}' records pass {}, but the schedule has {} passes",
                checkpoint.path.display(),
                checkpoint.pass,
                self.schedule.len()
            )));
        }

        info!(
            "resume from '{}' after pass {}",
            checkpoint.path.display(),
            checkpoint.pass
        );
        self.engine
            .load_weights(&checkpoint.path)
            .map_err(|err| Error::configuration(format!("{:#}", err)))?;

        let restored = self.schedule.iter().take(checkpoint.pass);
        self.pass_summaries.extend(restored.map(|spec| PassSummary {
            spec: *spec,
            final_metrics: None,
            checkpoint: Some(checkpoint.path.clone()),
            restored: true,
        }));
        self.completed_passes = checkpoint.pass;
        self.state = match checkpoint.pass {
            0 => SchedulerState::Idle,
            pass if pass == self.schedule.len() => SchedulerState::Exporting,
            pass => SchedulerState::Pass(pass),
        };

        Ok(())
    }

    /// Runs all remaining passes in order.
    pub fn run(&mut self) -> Fallible<()> {
        while let Some(pass) = self.next_pass() {
            self.run_pass(pass)?;
        }
        Ok(())
    }

    /// Runs pass `pass_number`, which must be the next pass in order.
    pub fn run_pass(&mut self, pass_number: usize) -> Fallible<PassSummary> {
        if let SchedulerState::Failed { pass } = self.state {
            return Err(Error::configuration(format!(
                "the scheduler has failed in pass {}",
                pass
            )));
        }
        match self.next_pass() {
            Some(next) if next == pass_number => {}
            Some(next) => {
                return Err(Error::configuration(format!(
                    "pass {} cannot run, pass {} is the next one",
                    pass_number, next
                )))
            }
            None => {
                return Err(Error::configuration(format!(
                    "pass {} cannot run, all passes are completed",
                    pass_number
                )))
            }
        }

        let spec = *self
            .schedule
            .get(pass_number)
            .ok_or_else(|| Error::configuration(format!("no such pass {}", pass_number)))?;
        let TrainingPassSpec {
            base_frozen,
            learning_rate,
            epochs,
            ..
        } = spec;

        self.state = SchedulerState::Pass(pass_number);
        let span = info_span!("pass", pass = pass_number);
        let _enter = span.enter();
        info!(
            "start pass {}/{}: base {}, lr {:e}, {} epochs",
            pass_number,
            self.schedule.len(),
            if base_frozen { "frozen" } else { "trainable" },
            learning_rate,
            epochs
        );

        self.engine.set_base_trainable(!base_frozen);
        if let Err(err) = self.engine.configure_optimizer(learning_rate) {
            return Err(self.fail(pass_number, None, err));
        }

        let mut last_metrics = None;
        for epoch in 1..=epochs {
            let metrics = self.run_epoch(&spec, epoch)?;
            last_metrics = Some(metrics);
        }

        let checkpoint = match &self.options.checkpoint_dir {
            Some(dir) => {
                let loss = last_metrics
                    .as_ref()
                    .map(|metrics| metrics.validation_loss)
                    .unwrap_or_default();
                let path = utils::checkpoint_path(dir, pass_number, loss);
                if let Err(err) = self.engine.save_weights(&path) {
                    return Err(self.fail(pass_number, None, err));
                }
                info!("saved checkpoint '{}'", path.display());
                Some(path)
            }
            None => None,
        };

        self.completed_passes = pass_number;
        self.state = if pass_number == self.schedule.len() {
            SchedulerState::Exporting
        } else {
            SchedulerState::Pass(pass_number)
        };
        info!("finished pass {}", pass_number);

        let summary = PassSummary {
            spec,
            final_metrics: last_metrics,
            checkpoint,
            restored: false,
        };
        self.pass_summaries.push(summary.clone());
        Ok(summary)
    }

    /// Hands out the trained engine after the last pass.
    pub fn finish(mut self) -> Fallible<(E, TrainingSummary)> {
        if self.state != SchedulerState::Exporting {
            return Err(Error::configuration(format!(
                "training is not completed, the scheduler is in {:?} state",
                self.state
            )));
        }
        self.state = SchedulerState::Done;
        debug!("scheduler is done");

        let summary = TrainingSummary {
            history: self.history,
            passes: self.pass_summaries,
        };
        Ok((self.engine, summary))
    }

    fn run_epoch(&mut self, spec: &TrainingPassSpec, epoch: usize) -> Fallible<EpochMetrics> {
        let pass = spec.pass_number;
        let batch_size = self.options.batch_size;

        // train
        let mut order: Vec<usize> = (0..self.train.len()).collect();
        if self.options.shuffle {
            order.shuffle(&mut self.rng);
        }

        let mut rate_counter = RateCounter::with_second_interval();
        let mut train_stat = EpochStat::default();

        for step in 0..self.steps_per_epoch {
            let batch: Vec<SplitEntry> = order[(step * batch_size)..((step + 1) * batch_size)]
                .iter()
                .map(|&index| self.train.entries[index].clone())
                .collect();

            let output = match self.engine.train_step(&batch, &self.class_weights) {
                Ok(output) => output,
                Err(err) => return Err(self.fail(pass, Some(epoch), err)),
            };
            if !output.loss.is_finite() {
                let err = format_err!("training loss diverged to {} at step {}", output.loss, step);
                return Err(self.fail(pass, Some(epoch), err));
            }
            train_stat.add(&output);

            rate_counter.add(1.0);
            if let Some(batch_rate) = rate_counter.rate() {
                info!(
                    "epoch: {}\tstep: {}/{}\t{:.2} batches/s\t{:.2} records/s",
                    epoch,
                    step + 1,
                    self.steps_per_epoch,
                    batch_rate,
                    batch_rate * batch_size as f64
                );
            }
        }

        // validate, read-only
        let mut validation_stat = EpochStat::default();
        for step in 0..self.validation_steps {
            let batch = &self.validation.entries[(step * batch_size)..((step + 1) * batch_size)];
            let output = match self.engine.eval_step(batch) {
                Ok(output) => output,
                Err(err) => return Err(self.fail(pass, Some(epoch), err)),
            };
            if !output.loss.is_finite() {
                let err = format_err!("validation loss diverged to {}", output.loss);
                return Err(self.fail(pass, Some(epoch), err));
            }
            validation_stat.add(&output);
        }

        let metrics = EpochMetrics {
            pass,
            epoch,
            learning_rate: spec.learning_rate,
            train_loss: train_stat.mean_loss(),
            train_accuracy: train_stat.accuracy(),
            validation_loss: validation_stat.mean_loss(),
            validation_accuracy: validation_stat.accuracy(),
        };
        info!("{}", metrics);

        if let Some(tx) = &self.logging_tx {
            let step = self.history.len();
            if tx
                .send(LoggingMessage::new_epoch("training", step, metrics.clone()))
                .is_err()
            {
                debug!("no logging worker is listening");
            }
        }
        self.history.push(metrics.clone());

        Ok(metrics)
    }

    fn fail(&mut self, pass: usize, epoch: Option<usize>, cause: anyhow::Error) -> Error {
        error!("pass {} failed: {:#}", pass, cause);
        self.state = SchedulerState::Failed { pass };
        Error::Training {
            pass,
            epoch,
            history: self.history.clone(),
            cause,
        }
    }
}

#[derive(Debug, Default)]
struct EpochStat {
    loss_sum: f64,
    steps: usize,
    correct: usize,
    count: usize,
}

impl EpochStat {
    fn add(&mut self, output: &StepOutput) {
        self.loss_sum += output.loss;
        self.steps += 1;
        self.correct += output.correct;
        self.count += output.count;
    }

    fn mean_loss(&self) -> f64 {
        self.loss_sum / self.steps.max(1) as f64
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.count.max(1) as f64
    }
}
