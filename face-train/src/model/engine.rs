use super::{ClassifierModel, ModelSpec};
use crate::{
    balance::ClassWeightTable,
    common::*,
    data::SplitEntry,
    evaluate::Predict,
    export::{ActivationRange, Exportable, NamedParameter},
    train::{Engine, StepOutput},
};

/// The libtorch execution engine.
#[derive(Debug)]
pub struct TchEngine {
    model: ClassifierModel,
    optimizer: Option<nn::Optimizer>,
}

impl TchEngine {
    pub fn new(model: ClassifierModel) -> Self {
        Self {
            model,
            optimizer: None,
        }
    }

    pub fn model(&self) -> &ClassifierModel {
        &self.model
    }

    pub fn into_model(self) -> ClassifierModel {
        self.model
    }

    /// Loads and stacks the images of a batch, and gathers their class indices.
    fn load_batch(&self, batch: &[SplitEntry]) -> Result<(Tensor, Tensor)> {
        let size = self.model.spec().image_size as i64;
        let device = self.model.device();

        let images: Vec<_> = batch
            .iter()
            .map(|entry| {
                let path = &entry.record.path;
                tch::vision::imagenet::load_image_and_resize(path, size, size)
                    .with_context(|| format!("failed to load image '{}'", path.display()))
            })
            .try_collect()?;
        let images = Tensor::stack(&images, 0).to_device(device);

        let classes: Vec<i64> = batch.iter().map(|entry| entry.class as i64).collect();
        let targets = Tensor::of_slice(&classes).to_device(device);

        Ok((images, targets))
    }
}

impl Engine for TchEngine {
    fn set_base_trainable(&mut self, trainable: bool) {
        self.model.set_base_trainable(trainable);
    }

    fn configure_optimizer(&mut self, learning_rate: f64) -> Result<()> {
        // a fresh optimizer drops the moments of the previous pass
        let optimizer = nn::Adam::default().build(self.model.var_store(), learning_rate)?;
        self.optimizer = Some(optimizer);
        Ok(())
    }

    fn train_step(
        &mut self,
        batch: &[SplitEntry],
        class_weights: &ClassWeightTable,
    ) -> Result<StepOutput> {
        let (images, targets) = self.load_batch(batch)?;
        let example_weights = {
            let classes: Vec<_> = batch.iter().map(|entry| entry.class).collect();
            let weights: Vec<f32> = class_weights
                .example_weights(&classes)?
                .into_iter()
                .map(|weight| weight as f32)
                .collect();
            Tensor::of_slice(&weights).to_device(self.model.device())
        };

        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| format_err!("the optimizer is not configured"))?;

        let logits = self.model.forward_t(&images, true);
        let loss = self.model.loss(&logits, &targets, Some(&example_weights));
        optimizer.backward_step(&loss);

        let correct = tch::no_grad(|| {
            i64::from(&logits.argmax(-1, false).eq_tensor(&targets).sum(Kind::Int64))
        });

        Ok(StepOutput {
            loss: f64::from(&loss),
            correct: correct as usize,
            count: batch.len(),
        })
    }

    fn eval_step(&mut self, batch: &[SplitEntry]) -> Result<StepOutput> {
        let (images, targets) = self.load_batch(batch)?;

        tch::no_grad(|| {
            let logits = self.model.forward_t(&images, false);
            let loss = self.model.loss(&logits, &targets, None);
            let correct = i64::from(&logits.argmax(-1, false).eq_tensor(&targets).sum(Kind::Int64));

            Ok(StepOutput {
                loss: f64::from(&loss),
                correct: correct as usize,
                count: batch.len(),
            })
        })
    }

    fn save_weights(&self, path: &Path) -> Result<()> {
        self.model
            .var_store()
            .save(path)
            .with_context(|| format!("failed to save weights to '{}'", path.display()))?;
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        self.model
            .var_store_mut()
            .load(path)
            .with_context(|| format!("failed to load weights from '{}'", path.display()))?;
        Ok(())
    }
}

impl Predict for TchEngine {
    fn predict(&self, batch: &[SplitEntry]) -> Result<Vec<usize>> {
        let (images, _) = self.load_batch(batch)?;
        let predictions = tch::no_grad(|| self.model.forward_t(&images, false).argmax(-1, false));
        let predictions: Vec<i64> = Vec::from(&predictions.to_device(Device::Cpu));
        Ok(predictions.into_iter().map(|class| class as usize).collect())
    }
}

impl Exportable for TchEngine {
    fn model_spec(&self) -> &ModelSpec {
        self.model.spec()
    }

    fn write_weights(&self, path: &Path) -> Result<()> {
        Engine::save_weights(self, path)
    }

    fn named_parameters(&self) -> Result<Vec<NamedParameter>> {
        let params = tch::no_grad(|| {
            self.model
                .named_variables()
                .into_iter()
                .map(|(name, tensor)| {
                    let tensor = tensor.to_device(Device::Cpu).to_kind(Kind::Float);
                    NamedParameter {
                        name,
                        shape: tensor.size(),
                        values: Vec::<f32>::from(&tensor.flatten(0, -1)),
                    }
                })
                .collect()
        });
        Ok(params)
    }

    fn activation_ranges(
        &self,
        calibration: &[SplitEntry],
        batch_size: usize,
    ) -> Result<Vec<ActivationRange>> {
        ensure!(!calibration.is_empty(), "the calibration subset is empty");

        let mut ranges = vec![
            ActivationRange::empty("input"),
            ActivationRange::empty("features"),
            ActivationRange::empty("dense"),
            ActivationRange::empty("logits"),
        ];

        for batch in calibration.chunks(batch_size.max(1)) {
            let (images, _) = self.load_batch(batch)?;
            let activations = tch::no_grad(|| self.model.forward_activations(&images, false));
            let tensors = [
                &images,
                &activations.features,
                &activations.dense,
                &activations.logits,
            ];

            for (range, tensor) in ranges.iter_mut().zip(tensors) {
                let min = f64::from(&tensor.min()) as f32;
                let max = f64::from(&tensor.max()) as f32;
                range.update(min, max);
            }
        }

        Ok(ranges)
    }
}
