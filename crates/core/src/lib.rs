//! Core differentially private training primitives.
//!
//! This crate provides framework-agnostic building blocks for DP-SGD:
//! per-example clipping, Gaussian noise, Poisson sampling, tree utilities
//! and optimizers expressed as gradient transforms.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch_selection;
pub mod clipping;
pub mod error;
pub mod noise;
pub mod optim;
pub mod pytree;
pub mod sampling;
pub mod tensor;
pub mod transform;

pub use batch_selection::{BatchSelectionStrategy, PoissonSampling, SequentialBatching};
pub use clipping::{clip_and_accumulate, clip_factor, clip_pytree, clipped_fraction, ClipReport};
pub use error::{DpError, Result};
pub use noise::{add_gaussian_noise, add_gaussian_noise_tree, GaussianMechanism};
pub use optim::{apply_updates, RmsProp, RmsPropState, Sgd, SgdState};
pub use pytree::{
    global_l2_norm, leaf_count, map_leaves, num_elements, zeros_like, zip_map_leaves, PyTree,
    TreeSpec,
};
pub use sampling::{
    poisson_sample, sequential_batches, shuffled_batches, split_physical,
    BatchIndices,
};
pub use tensor::{l2_norm, sanitize, squared_norm, Scalar, Tensor};
pub use transform::{DpSgdAggregator, DpSgdState, GradientTransform};

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        add_gaussian_noise, add_gaussian_noise_tree, apply_updates, clip_and_accumulate,
        clip_factor, clip_pytree, global_l2_norm, map_leaves, poisson_sample,
        split_physical, zeros_like, zip_map_leaves, BatchIndices, BatchSelectionStrategy,
        ClipReport, DpError, DpSgdAggregator, DpSgdState, GaussianMechanism, GradientTransform,
        PoissonSampling, PyTree, Result, RmsProp, Scalar, SequentialBatching, Sgd, Tensor,
    };
}
