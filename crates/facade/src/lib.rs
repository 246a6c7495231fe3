//! Differentially private ResNet training on CIFAR-10.
//!
//! The facade wires the building blocks of the member crates into the
//! training pipeline: [`PrivacyEngine`] calibrates noise and wraps an
//! optimizer in a [`DpOptimizer`], [`BatchMemoryManager`] splits logical
//! batches into physical ones, and [`fit`] runs the whole experiment from a
//! [`TrainConfig`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod memory;
pub mod optimizer;
pub mod report;
pub mod trainer;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use dpresnet_accounting as accounting;
pub use dpresnet_core as core;
pub use dpresnet_data as data;
pub use dpresnet_nn as nn;

pub use config::{
    AccountantChoice, ModelConfig, NormChoice, OptimizerChoice, StemChoice, TrainConfig,
};
pub use engine::{PrivacyEngine, PrivacySettings, PrivateSetup};
pub use memory::{BatchMemoryManager, PhysicalBatch};
pub use optimizer::{DpOptimizer, SharedAccountant};
pub use report::{check_consistency, markdown_table, published_results, ExperimentRecord};
pub use trainer::{
    accuracy, evaluate, fit, EpochMetrics, EvalMetrics, Trainer, TrainingRun,
};

/// Convenience prelude covering the training pipeline.
pub mod prelude {
    pub use crate::{
        evaluate, fit, BatchMemoryManager, DpOptimizer, EpochMetrics, ExperimentRecord,
        PrivacyEngine, PrivacySettings, PrivateSetup, TrainConfig, Trainer, TrainingRun,
    };
    pub use dpresnet_accounting::prelude::*;
    pub use dpresnet_core::prelude::*;
    pub use dpresnet_data::prelude::*;
    pub use dpresnet_nn::prelude::*;
}
