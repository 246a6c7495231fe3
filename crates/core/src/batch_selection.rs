//! Batch selection strategies.

use rand::Rng;

use crate::error::{DpError, Result};
use crate::sampling::{poisson_sample, sequential_batches, shuffled_batches, BatchIndices};

/// A framework-agnostic batch selection interface.
pub trait BatchSelectionStrategy {
    /// Produce all batches of one pass over `num_examples` using the provided RNG.
    fn batches<R: Rng + ?Sized>(&self, num_examples: usize, rng: &mut R) -> Vec<BatchIndices>;
}

/// Poisson sampling with a fixed number of steps per epoch.
///
/// This is the sampler private training must use: the accountant assumes
/// each example joins each batch independently with `sample_rate`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoissonSampling {
    /// Inclusion probability of each example in each batch.
    pub sample_rate: f64,
    /// Number of batches drawn per epoch.
    pub steps: usize,
}

impl PoissonSampling {
    /// Sampler matching a nominal batch size: `q = 1 / ceil(n / batch_size)`.
    pub fn from_batch_size(num_examples: usize, batch_size: usize) -> Result<Self> {
        if num_examples == 0 {
            return Err(DpError::invalid("dataset must not be empty"));
        }
        if batch_size == 0 {
            return Err(DpError::invalid("batch_size must be positive"));
        }
        let steps = num_examples.div_ceil(batch_size);
        Ok(Self {
            sample_rate: 1.0 / steps as f64,
            steps,
        })
    }

    /// Expected number of examples per batch.
    pub fn expected_batch_size(&self, num_examples: usize) -> f64 {
        self.sample_rate * num_examples as f64
    }
}

impl BatchSelectionStrategy for PoissonSampling {
    fn batches<R: Rng + ?Sized>(&self, num_examples: usize, rng: &mut R) -> Vec<BatchIndices> {
        (0..self.steps)
            .map(|_| poisson_sample(num_examples, self.sample_rate, rng))
            .collect()
    }
}

/// Fixed-size batches over the dataset, optionally shuffled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequentialBatching {
    /// Number of examples per batch (the last may be short).
    pub batch_size: usize,
    /// Whether to shuffle before batching.
    pub shuffle: bool,
}

impl BatchSelectionStrategy for SequentialBatching {
    fn batches<R: Rng + ?Sized>(&self, num_examples: usize, rng: &mut R) -> Vec<BatchIndices> {
        if self.shuffle {
            shuffled_batches(num_examples, self.batch_size, rng)
        } else {
            sequential_batches(num_examples, self.batch_size)
        }
    }
}
