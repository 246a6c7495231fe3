//! Gaussian noise for differentially private aggregation.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::pytree::{map_leaves, PyTree};
use crate::tensor::{Scalar, Tensor};

/// Add Gaussian noise with standard deviation `std` to a tensor in-place.
pub fn add_gaussian_noise<R: Rng + ?Sized>(tensor: &mut Tensor, std: f64, rng: &mut R) {
    if !std.is_finite() || std <= 0.0 || tensor.is_empty() {
        return;
    }

    let dist = match Normal::new(0.0, std) {
        Ok(d) => d,
        Err(_) => return,
    };

    tensor.mapv_inplace(|x| {
        if x.is_finite() {
            x + (dist.sample(rng) as Scalar)
        } else {
            x
        }
    });
}

/// Add i.i.d. Gaussian noise across a tree.
pub fn add_gaussian_noise_tree<R: Rng + ?Sized, T: PyTree<Leaf = Tensor>>(
    tree: &T,
    std: f64,
    rng: &mut R,
) -> T {
    map_leaves(tree, |leaf| {
        let mut out = leaf.clone();
        add_gaussian_noise(&mut out, std, rng);
        out
    })
}

/// Gaussian mechanism over clipped gradient sums.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaussianMechanism {
    /// Noise multiplier (std = noise_multiplier * max_grad_norm).
    pub noise_multiplier: f64,
    /// L2 sensitivity bound, i.e. the clipping threshold.
    pub max_grad_norm: f64,
}

impl GaussianMechanism {
    /// Create a new Gaussian mechanism.
    pub fn new(noise_multiplier: f64, max_grad_norm: f64) -> Self {
        Self {
            noise_multiplier,
            max_grad_norm,
        }
    }

    /// Get the noise standard deviation.
    pub fn std(&self) -> f64 {
        self.noise_multiplier * self.max_grad_norm
    }

    /// Add noise to every leaf of a tree.
    pub fn apply<R: Rng + ?Sized, T: PyTree<Leaf = Tensor>>(&self, tree: &T, rng: &mut R) -> T {
        add_gaussian_noise_tree(tree, self.std(), rng)
    }
}
