use crate::{balance::ClassWeightTable, common::*, data::SplitEntry};

/// The outcome of one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    pub correct: usize,
    pub count: usize,
}

/// The model-execution engine driven by the training scheduler.
pub trait Engine {
    /// Changes gradient eligibility of the convolutional base without touching its values.
    fn set_base_trainable(&mut self, trainable: bool);

    /// Replaces the optimizer with a fresh one at the given learning rate.
    fn configure_optimizer(&mut self, learning_rate: f64) -> Result<()>;

    /// Runs one class-weighted optimization step.
    fn train_step(
        &mut self,
        batch: &[SplitEntry],
        class_weights: &ClassWeightTable,
    ) -> Result<StepOutput>;

    /// Computes the unweighted loss and accuracy without updating weights.
    fn eval_step(&mut self, batch: &[SplitEntry]) -> Result<StepOutput>;

    fn save_weights(&self, path: &Path) -> Result<()>;

    fn load_weights(&mut self, path: &Path) -> Result<()>;
}
