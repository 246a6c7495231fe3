//! Gradient transformation interfaces and the DP-SGD aggregator.

use rand::Rng;

use crate::clipping::{clip_and_accumulate, ClipReport};
use crate::error::{DpError, Result};
use crate::noise::GaussianMechanism;
use crate::pytree::{map_leaves, zeros_like, PyTree};
use crate::tensor::{Scalar, Tensor};

/// A stateful transformation turning gradients into parameter updates.
pub trait GradientTransform<T: PyTree<Leaf = Tensor>> {
    /// State maintained across updates.
    type State;

    /// Initialize state based on model structure.
    fn init(&self, params: &T) -> Self::State;

    /// Transform a gradient into an additive update and return the new state.
    fn update(&self, grad: &T, state: Self::State, params: &T) -> Result<(T, Self::State)>;
}

/// Clip-and-noise aggregation of per-example gradients.
///
/// Gradients of one logical batch may arrive over several calls to
/// [`DpSgdAggregator::accumulate`]; [`DpSgdAggregator::finalize`] adds the
/// noise once and normalizes by the expected batch size.
#[derive(Clone, Debug, PartialEq)]
pub struct DpSgdAggregator {
    /// L2 clip norm for per-example gradients.
    pub max_grad_norm: f64,
    /// Noise multiplier (sigma / sensitivity).
    pub noise_multiplier: f64,
    /// Divisor of the noisy sum (sample rate times dataset size).
    pub expected_batch_size: f64,
}

/// Running sum of clipped gradients for one logical batch.
#[derive(Clone, Debug)]
pub struct DpSgdState<T> {
    summed: T,
    num_examples: usize,
    num_clipped: usize,
}

impl<T: PyTree<Leaf = Tensor>> DpSgdState<T> {
    /// Number of examples accumulated since the last finalize.
    pub fn num_examples(&self) -> usize {
        self.num_examples
    }

    /// Number of accumulated examples that were scaled down.
    pub fn num_clipped(&self) -> usize {
        self.num_clipped
    }

    /// The current clipped (noise-free) sum.
    pub fn summed(&self) -> &T {
        &self.summed
    }
}

impl DpSgdAggregator {
    /// Create a new DP-SGD aggregator.
    pub fn new(max_grad_norm: f64, noise_multiplier: f64, expected_batch_size: f64) -> Result<Self> {
        if !max_grad_norm.is_finite() || max_grad_norm <= 0.0 {
            return Err(DpError::invalid("max_grad_norm must be positive"));
        }
        if !noise_multiplier.is_finite() || noise_multiplier < 0.0 {
            return Err(DpError::invalid("noise_multiplier must be non-negative"));
        }
        if !expected_batch_size.is_finite() || expected_batch_size <= 0.0 {
            return Err(DpError::invalid("expected_batch_size must be positive"));
        }
        Ok(Self {
            max_grad_norm,
            noise_multiplier,
            expected_batch_size,
        })
    }

    /// Mechanism used when finalizing.
    pub fn mechanism(&self) -> GaussianMechanism {
        GaussianMechanism::new(self.noise_multiplier, self.max_grad_norm)
    }

    /// Standard deviation of the noise added to the gradient sum.
    pub fn noise_std(&self) -> f64 {
        self.mechanism().std()
    }

    /// Initialize aggregation state shaped like `template`.
    pub fn init_state<T: PyTree<Leaf = Tensor>>(&self, template: &T) -> DpSgdState<T> {
        DpSgdState {
            summed: zeros_like(template),
            num_examples: 0,
            num_clipped: 0,
        }
    }

    /// Clip each per-example gradient and add it into the running sum.
    pub fn accumulate<T: PyTree<Leaf = Tensor>>(
        &self,
        per_example_grads: &[T],
        state: &mut DpSgdState<T>,
    ) -> Result<Vec<ClipReport>> {
        let reports = clip_and_accumulate(per_example_grads, self.max_grad_norm, &mut state.summed)?;
        state.num_examples += reports.len();
        state.num_clipped += reports.iter().filter(|r| r.clipped).count();
        Ok(reports)
    }

    /// Add noise to the running sum, normalize, and reset the state.
    ///
    /// An empty batch still produces a noise-only gradient.
    pub fn finalize<T, R>(&self, state: &mut DpSgdState<T>, rng: &mut R) -> T
    where
        T: PyTree<Leaf = Tensor>,
        R: Rng + ?Sized,
    {
        let noisy = self.mechanism().apply(&state.summed, rng);
        let denom = self.expected_batch_size as Scalar;
        let grad = map_leaves(&noisy, |leaf| leaf.mapv(|v| v / denom));
        state.summed = zeros_like(&state.summed);
        state.num_examples = 0;
        state.num_clipped = 0;
        grad
    }
}
