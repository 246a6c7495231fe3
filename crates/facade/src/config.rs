//! Training configuration.
//!
//! Every field has a default, so an empty TOML file describes the published
//! run: ResNet-18 trained with RMSprop at `step_size = 1e-3` for 20 epochs,
//! logical batches of 200 split into physical batches of at most 128, and
//! per-example gradients clipped to 1.2 under a (5, 1e-5) budget.

use std::fs;
use std::path::{Path, PathBuf};

use dpresnet_accounting::AccountantKind;
use dpresnet_core::{DpError, Result, RmsProp, Sgd};
use dpresnet_nn::{NormKind, ResNetConfig, Stem};
use serde::{Deserialize, Serialize};

/// Accounting method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountantChoice {
    /// Rényi DP.
    #[default]
    Rdp,
    /// Gaussian DP.
    Gdp,
}

impl From<AccountantChoice> for AccountantKind {
    fn from(choice: AccountantChoice) -> Self {
        match choice {
            AccountantChoice::Rdp => AccountantKind::Rdp,
            AccountantChoice::Gdp => AccountantKind::Gdp,
        }
    }
}

/// Optimizer applied to the privatized gradient.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerChoice {
    /// RMSprop with PyTorch defaults.
    #[default]
    Rmsprop,
    /// Plain SGD with optional momentum.
    Sgd,
}

/// Stem of the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StemChoice {
    /// torchvision's 7×7 stride-2 convolution and max pool.
    #[default]
    Imagenet,
    /// 3×3 stride-1 convolution.
    Cifar,
}

/// Normalization layers as written in the model definition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormChoice {
    /// BatchNorm, replaced by the module validator before training.
    #[default]
    Batchnorm,
    /// GroupNorm with `groups` groups.
    Groupnorm,
}

/// Model section of the configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Width of the first stage; later stages double it.
    pub base_width: usize,
    /// Basic blocks per stage.
    pub blocks: Vec<usize>,
    /// Input stem.
    pub stem: StemChoice,
    /// Normalization layers.
    pub norm: NormChoice,
    /// Group count when `norm = "groupnorm"`.
    pub groups: usize,
    /// Output classes.
    pub num_classes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_width: 64,
            blocks: vec![2, 2, 2, 2],
            stem: StemChoice::Imagenet,
            norm: NormChoice::Batchnorm,
            groups: 32,
            num_classes: 10,
        }
    }
}

impl ModelConfig {
    /// The architecture as written, before any validator fix.
    pub fn resnet_config(&self) -> ResNetConfig {
        let stages = self.blocks.len();
        ResNetConfig {
            blocks_per_stage: self.blocks.clone(),
            widths: (0..stages).map(|i| self.base_width << i).collect(),
            in_channels: 3,
            num_classes: self.num_classes,
            stem: match self.stem {
                StemChoice::Imagenet => Stem::ImageNet,
                StemChoice::Cifar => Stem::Cifar,
            },
            norm: match self.norm {
                NormChoice::Batchnorm => NormKind::BatchNorm,
                NormChoice::Groupnorm => NormKind::GroupNorm {
                    groups: self.groups,
                },
            },
        }
    }
}

/// Full training configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Learning rate.
    pub step_size: f64,
    /// Passes over the training set.
    pub epochs: usize,
    /// Expected logical batch size; sets the Poisson sample rate.
    pub batch_size: usize,
    /// Largest batch pushed through the model at once.
    pub max_physical_batch_size: usize,
    /// Per-example L2 clipping threshold `C`.
    pub clipping_threshold: f64,
    /// Target epsilon.
    pub epsilon: f64,
    /// Target delta.
    pub delta: f64,
    /// Slack allowed below the target epsilon during calibration.
    pub epsilon_tolerance: f64,
    /// Directory containing the CIFAR-10 binary files.
    pub data_root: PathBuf,
    /// Seed for initialization, sampling and noise.
    pub seed: u64,
    /// Physical-batch interval of the progress line.
    pub log_every: usize,
    /// Accounting method.
    pub accountant: AccountantChoice,
    /// Optimizer.
    pub optimizer: OptimizerChoice,
    /// Momentum of the optimizer.
    pub momentum: f64,
    /// Batch size used for evaluation.
    pub eval_batch_size: usize,
    /// Use only the first N training images.
    pub train_limit: Option<usize>,
    /// Use only the first N test images.
    pub test_limit: Option<usize>,
    /// Architecture.
    pub model: ModelConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            step_size: 1e-3,
            epochs: 20,
            batch_size: 200,
            max_physical_batch_size: 128,
            clipping_threshold: 1.2,
            epsilon: 5.0,
            delta: 1e-5,
            epsilon_tolerance: 0.01,
            data_root: PathBuf::from("../cifar10"),
            seed: 0,
            log_every: 200,
            accountant: AccountantChoice::Rdp,
            optimizer: OptimizerChoice::Rmsprop,
            momentum: 0.0,
            eval_batch_size: 200,
            train_limit: None,
            test_limit: None,
            model: ModelConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Parse a TOML document; missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| DpError::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DpError::config(e.to_string()))
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(DpError::config("epsilon must be positive"));
        }
        if !self.delta.is_finite() || self.delta <= 0.0 || self.delta >= 1.0 {
            return Err(DpError::config("delta must be in (0, 1)"));
        }
        if !self.clipping_threshold.is_finite() || self.clipping_threshold <= 0.0 {
            return Err(DpError::config("clipping_threshold must be positive"));
        }
        if !self.step_size.is_finite() || self.step_size <= 0.0 {
            return Err(DpError::config("step_size must be positive"));
        }
        if !self.epsilon_tolerance.is_finite() || self.epsilon_tolerance <= 0.0 {
            return Err(DpError::config("epsilon_tolerance must be positive"));
        }
        if !self.momentum.is_finite() || self.momentum < 0.0 {
            return Err(DpError::config("momentum must be non-negative"));
        }
        if self.epochs == 0 {
            return Err(DpError::config("epochs must be positive"));
        }
        if self.batch_size == 0 || self.eval_batch_size == 0 {
            return Err(DpError::config("batch sizes must be positive"));
        }
        if self.max_physical_batch_size == 0 {
            return Err(DpError::config("max_physical_batch_size must be positive"));
        }
        if self.log_every == 0 {
            return Err(DpError::config("log_every must be positive"));
        }
        if self.model.base_width == 0 {
            return Err(DpError::config("model.base_width must be positive"));
        }
        self.model.resnet_config().check()
    }

    /// Sample rate `1 / ceil(num_samples / batch_size)`.
    pub fn sample_rate(&self, num_samples: usize) -> f64 {
        1.0 / num_samples.div_ceil(self.batch_size).max(1) as f64
    }

    /// RMSprop configured from this file.
    pub fn rmsprop(&self) -> RmsProp {
        RmsProp {
            momentum: self.momentum,
            ..RmsProp::new(self.step_size)
        }
    }

    /// SGD configured from this file.
    pub fn sgd(&self) -> Sgd {
        Sgd {
            lr: self.step_size,
            momentum: self.momentum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_published_defaults() {
        let config = TrainConfig::from_toml_str("").expect("defaults are valid");
        assert_eq!(config, TrainConfig::default());
        assert_eq!(config.step_size, 1e-3);
        assert_eq!(config.epochs, 20);
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.max_physical_batch_size, 128);
        assert_eq!(config.clipping_threshold, 1.2);
        assert_eq!(config.epsilon, 5.0);
        assert_eq!(config.delta, 1e-5);
        assert_eq!(config.data_root, PathBuf::from("../cifar10"));
        assert_eq!(config.model.resnet_config(), ResNetConfig::resnet18());
    }

    #[test]
    fn partial_documents_override_fields() {
        let config = TrainConfig::from_toml_str(
            r#"
            epsilon = 10.0
            accountant = "gdp"

            [model]
            base_width = 8
            stem = "cifar"
            norm = "groupnorm"
            groups = 4
            "#,
        )
        .expect("valid config");
        assert_eq!(config.epsilon, 10.0);
        assert_eq!(config.accountant, AccountantChoice::Gdp);
        let resnet = config.model.resnet_config();
        assert_eq!(resnet.widths, vec![8, 16, 32, 64]);
        assert_eq!(resnet.norm, NormKind::GroupNorm { groups: 4 });
        assert_eq!(resnet.stem, Stem::Cifar);
    }

    #[test]
    fn rejects_invalid_values() {
        for doc in [
            "epsilon = 0.0",
            "delta = 1.0",
            "clipping_threshold = -1.0",
            "step_size = 0.0",
            "epochs = 0",
            "batch_size = 0",
            "max_physical_batch_size = 0",
            "unknown_field = 1",
            "accountant = \"prv\"",
        ] {
            assert!(TrainConfig::from_toml_str(doc).is_err(), "{doc} accepted");
        }
    }

    #[test]
    fn toml_round_trip() {
        let mut config = TrainConfig::default();
        config.train_limit = Some(1000);
        let text = config.to_toml_string().expect("serializable");
        assert_eq!(TrainConfig::from_toml_str(&text).expect("valid"), config);
    }

    #[test]
    fn sample_rate_uses_steps_per_epoch() {
        let config = TrainConfig::default();
        assert!((config.sample_rate(50_000) - 0.004).abs() < 1e-12);
        assert!((config.sample_rate(50_100) - 1.0 / 251.0).abs() < 1e-12);
    }
}
