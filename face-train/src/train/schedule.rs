use crate::{common::*, config::TrainingConfig};

/// Learning rate step-down expected between the first pass and a later unfrozen pass.
const FINE_TUNE_LR_FACTOR: f64 = 10.0;

/// One pass of the training schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingPassSpec {
    /// 1-based pass number.
    pub pass_number: usize,
    pub base_frozen: bool,
    pub learning_rate: f64,
    pub epochs: usize,
}

/// The ordered, validated list of passes.
#[derive(Debug, Clone, PartialEq)]
pub struct PassSchedule {
    passes: Vec<TrainingPassSpec>,
}

impl PassSchedule {
    pub fn new(passes: Vec<TrainingPassSpec>) -> Fallible<Self> {
        if passes.is_empty() {
            return Err(Error::configuration("the pass list is empty"));
        }

        for (index, pass) in passes.iter().enumerate() {
            if pass.pass_number != index + 1 {
                return Err(Error::configuration(format!(
                    "expect pass number {}, but get {}",
                    index + 1,
                    pass.pass_number
                )));
            }
            if !(pass.learning_rate.is_finite() && pass.learning_rate > 0.0) {
                return Err(Error::configuration(format!(
                    "pass {} has invalid learning rate {}",
                    pass.pass_number, pass.learning_rate
                )));
            }
            if pass.epochs == 0 {
                return Err(Error::configuration(format!(
                    "pass {} has zero epochs",
                    pass.pass_number
                )));
            }
        }

        let first = passes[0];
        passes
            .iter()
            .skip(1)
            .filter(|pass| !pass.base_frozen)
            .filter(|pass| pass.learning_rate * FINE_TUNE_LR_FACTOR > first.learning_rate)
            .for_each(|pass| {
                warn!(
                    "pass {} fine-tunes the base at lr {:e}, which is less than {}x below the initial lr {:e}",
                    pass.pass_number, pass.learning_rate, FINE_TUNE_LR_FACTOR, first.learning_rate
                );
            });

        Ok(Self { passes })
    }

    pub fn from_config(config: &TrainingConfig) -> Fallible<Self> {
        let passes = config
            .passes
            .iter()
            .enumerate()
            .map(|(index, pass)| TrainingPassSpec {
                pass_number: index + 1,
                base_frozen: pass.base_frozen,
                learning_rate: pass.learning_rate.raw(),
                epochs: pass.epochs.unwrap_or(config.epochs).get(),
            })
            .collect();
        Self::new(passes)
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Gets the pass by its 1-based number.
    pub fn get(&self, pass_number: usize) -> Option<&TrainingPassSpec> {
        pass_number
            .checked_sub(1)
            .and_then(|index| self.passes.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrainingPassSpec> {
        self.passes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(pass_number: usize, base_frozen: bool, learning_rate: f64) -> TrainingPassSpec {
        TrainingPassSpec {
            pass_number,
            base_frozen,
            learning_rate,
            epochs: 1,
        }
    }

    #[test]
    fn valid_schedule_test() -> Result<()> {
        let schedule = PassSchedule::new(vec![pass(1, true, 1e-4), pass(2, false, 1e-5)])?;
        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule.get(2).map(|pass| pass.learning_rate), Some(1e-5));
        assert!(schedule.get(0).is_none());
        assert!(schedule.get(3).is_none());
        Ok(())
    }

    #[test]
    fn invalid_schedule_test() {
        assert!(matches!(
            PassSchedule::new(vec![]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            PassSchedule::new(vec![pass(2, true, 1e-4)]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            PassSchedule::new(vec![pass(1, true, 0.0)]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            PassSchedule::new(vec![TrainingPassSpec {
                epochs: 0,
                ..pass(1, true, 1e-4)
            }]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn small_step_down_is_only_warned_test() {
        // the step-down is advisory
        assert!(PassSchedule::new(vec![pass(1, true, 1e-4), pass(2, false, 5e-5)]).is_ok());
    }
}
