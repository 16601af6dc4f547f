//! The classifier model built on a pretrained convolutional base.

mod engine;
mod loss;

pub use engine::*;
pub use loss::*;

use crate::{common::*, config::ModelConfig};

const HEAD_PREFIX: &str = "head.";

/// The convolutional base architectures.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    StrumDisplay,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Architecture {
    Resnet18,
    Resnet34,
    Resnet50,
    /// A three-convolution base for smoke runs.
    Tiny,
}

impl Architecture {
    /// The feature dimension of the base output.
    pub fn feature_dim(&self) -> i64 {
        match self {
            Self::Resnet18 | Self::Resnet34 => 512,
            Self::Resnet50 => 2048,
            Self::Tiny => 64,
        }
    }

    /// The top-level modules of the base in forward order.
    pub fn base_modules(&self) -> &'static [&'static str] {
        match self {
            Self::Resnet18 | Self::Resnet34 | Self::Resnet50 => {
                &["conv1", "bn1", "layer1", "layer2", "layer3", "layer4"]
            }
            Self::Tiny => &["conv1", "conv2", "conv3"],
        }
    }

    fn build_base(&self, path: &nn::Path) -> nn::FuncT<'static> {
        use tch::vision::resnet;

        match self {
            Self::Resnet18 => resnet::resnet18_no_final_layer(path),
            Self::Resnet34 => resnet::resnet34_no_final_layer(path),
            Self::Resnet50 => resnet::resnet50_no_final_layer(path),
            Self::Tiny => tiny_base(path),
        }
    }
}

fn tiny_base(path: &nn::Path) -> nn::FuncT<'static> {
    let conv = |name: &str, in_c: i64, out_c: i64| {
        nn::conv2d(
            path / name,
            in_c,
            out_c,
            3,
            nn::ConvConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
        )
    };
    let conv1 = conv("conv1", 3, 16);
    let conv2 = conv("conv2", 16, 32);
    let conv3 = conv("conv3", 32, 64);

    nn::func_t(move |xs, _train| {
        xs.apply(&conv1)
            .relu()
            .apply(&conv2)
            .relu()
            .apply(&conv3)
            .relu()
            .adaptive_avg_pool2d(&[1, 1])
            .flat_view()
    })
}

/// The model hyperparameters, stored next to exported weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub architecture: Architecture,
    pub image_size: usize,
    pub dense_units: usize,
    pub dropout: f64,
    pub l2_penalty: f64,
    pub freeze_layer_count: usize,
    pub num_classes: usize,
}

impl ModelSpec {
    pub fn from_config(config: &ModelConfig, num_classes: usize) -> Self {
        Self {
            architecture: config.architecture,
            image_size: config.image_size.get(),
            dense_units: config.dense_units.get(),
            dropout: config.dropout.to_f64(),
            l2_penalty: config.l2_penalty.raw(),
            freeze_layer_count: config.freeze_layer_count,
            num_classes,
        }
    }
}

/// Activations of one forward pass, used to measure quantization ranges.
#[derive(Debug)]
pub struct ForwardActivations {
    pub features: Tensor,
    pub dense: Tensor,
    pub logits: Tensor,
}

/// The convolutional base with a dense classification head.
pub struct ClassifierModel {
    spec: ModelSpec,
    vs: nn::VarStore,
    base: nn::FuncT<'static>,
    dense: nn::Linear,
    output: nn::Linear,
    /// Base variables with gradients, excluding buffers such as batch norm statistics.
    base_parameters: HashSet<String>,
    base_trainable: bool,
}

impl Debug for ClassifierModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierModel")
            .field("spec", &self.spec)
            .field("device", &self.vs.device())
            .field("base_trainable", &self.base_trainable)
            .finish()
    }
}

impl ClassifierModel {
    pub fn new(spec: ModelSpec, device: Device) -> Result<Self> {
        ensure!(spec.num_classes >= 2, "at least 2 classes are required");
        ensure!(
            spec.freeze_layer_count <= spec.architecture.base_modules().len(),
            "freeze_layer_count exceeds the number of base modules"
        );

        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let base = spec.architecture.build_base(&root);
        let head = &root / "head";
        let dense = nn::linear(
            &head / "dense",
            spec.architecture.feature_dim(),
            spec.dense_units as i64,
            Default::default(),
        );
        let output = nn::linear(
            &head / "output",
            spec.dense_units as i64,
            spec.num_classes as i64,
            Default::default(),
        );

        let base_parameters: HashSet<_> = vs
            .variables()
            .into_iter()
            .filter(|(name, tensor)| !name.starts_with(HEAD_PREFIX) && tensor.requires_grad())
            .map(|(name, _)| name)
            .collect();

        Ok(Self {
            spec,
            vs,
            base,
            dense,
            output,
            base_parameters,
            base_trainable: true,
        })
    }

    /// Loads pretrained base weights. Missing variables keep their initial values.
    pub fn load_base_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let missing = self
            .vs
            .load_partial(path)
            .with_context(|| format!("failed to load weights file '{}'", path.display()))?;
        let missing_base = missing
            .iter()
            .filter(|name| !name.starts_with(HEAD_PREFIX))
            .count();
        if missing_base > 0 {
            warn!(
                "{} base variables are missing in '{}'",
                missing_base,
                path.display()
            );
        }
        info!("loaded base weights from '{}'", path.display());
        Ok(())
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    pub fn base_trainable(&self) -> bool {
        self.base_trainable
    }

    /// Changes whether the base parameters receive gradients.
    ///
    /// Parameter values are left untouched. The leading `freeze_layer_count`
    /// base modules stay frozen either way, and the head is always trainable.
    pub fn set_base_trainable(&mut self, trainable: bool) {
        let frozen_modules =
            &self.spec.architecture.base_modules()[..self.spec.freeze_layer_count];

        for (name, tensor) in self.vs.variables() {
            if !self.base_parameters.contains(&name) {
                continue;
            }
            let module = name.split('.').next().unwrap_or_default();
            let requires_grad = trainable && !frozen_modules.iter().any(|&frozen| frozen == module);
            let _ = tensor.set_requires_grad(requires_grad);
        }

        self.base_trainable = trainable;
    }

    /// Names of variables that currently receive gradients.
    pub fn trainable_variables(&self) -> Vec<String> {
        self.vs
            .variables()
            .into_iter()
            .filter(|(_, tensor)| tensor.requires_grad())
            .map(|(name, _)| name)
            .sorted()
            .collect()
    }

    /// Sum of all variable values in name order.
    pub fn parameter_checksum(&self) -> f64 {
        tch::no_grad(|| {
            self.named_variables()
                .iter()
                .map(|(_, tensor)| f64::from(tensor.to_kind(Kind::Double).sum(Kind::Double)))
                .sum()
        })
    }

    /// All variables sorted by name.
    pub fn named_variables(&self) -> Vec<(String, Tensor)> {
        self.vs
            .variables()
            .into_iter()
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .collect()
    }

    /// Computes the logits. A frozen base runs in inference mode.
    pub fn forward_t(&self, images: &Tensor, train: bool) -> Tensor {
        self.forward_activations(images, train).logits
    }

    pub fn forward_activations(&self, images: &Tensor, train: bool) -> ForwardActivations {
        let features = self
            .base
            .forward_t(images, train && self.base_trainable);
        let dense = features.apply(&self.dense).relu();
        let logits = dense
            .dropout(self.spec.dropout, train)
            .apply(&self.output);

        ForwardActivations {
            features,
            dense,
            logits,
        }
    }

    /// The class-weighted loss plus the L2 penalty on the output layer.
    pub fn loss(&self, logits: &Tensor, targets: &Tensor, example_weights: Option<&Tensor>) -> Tensor {
        weighted_cross_entropy(logits, targets, example_weights)
            + l2_penalty(&self.output.ws, self.spec.l2_penalty)
    }
}
