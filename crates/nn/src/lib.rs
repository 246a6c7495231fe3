//! ResNet building blocks with per-example backpropagation.
//!
//! Examples are processed one at a time, so the gradient returned by
//! [`ResNet::per_example_gradient`] is exactly the per-example gradient
//! DP-SGD needs to clip.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod layers;
pub mod loss;
pub mod resnet;
pub mod validator;

pub use layers::{
    global_avg_pool, relu, Conv2d, Conv2dSpec, Feature, GroupNorm, Linear, MaxPool2d,
};
pub use loss::{argmax, cross_entropy, log_softmax};
pub use resnet::{group_count, NormKind, NormSite, ResNet, ResNetConfig, Stem};
pub use validator::{IssueKind, ModuleValidator, ValidationIssue};

/// Common imports for model code.
pub mod prelude {
    pub use crate::{
        argmax, cross_entropy, Feature, ModuleValidator, NormKind, ResNet, ResNetConfig, Stem,
        ValidationIssue,
    };
}
