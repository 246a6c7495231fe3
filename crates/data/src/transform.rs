//! Pixel-to-tensor conversion.

use dpresnet_core::{DpError, Result, Scalar};
use ndarray::{Array3, Axis};

use crate::cifar::{CHANNELS, CIFAR10_MEAN, CIFAR10_STD_DEV, IMAGE_SIDE};

/// A normalized image, channels × height × width.
pub type Image = Array3<Scalar>;

/// Scale bytes to `[0, 1]`, then standardize each channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Normalize {
    mean: Vec<Scalar>,
    std: Vec<Scalar>,
}

impl Normalize {
    /// Normalization with explicit per-channel statistics.
    pub fn new(mean: &[f64], std: &[f64]) -> Result<Self> {
        if mean.is_empty() || mean.len() != std.len() {
            return Err(DpError::invalid(
                "mean and std must be non-empty and of equal length",
            ));
        }
        if std.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(DpError::invalid("std must be positive and finite"));
        }
        Ok(Self {
            mean: mean.iter().map(|&m| m as Scalar).collect(),
            std: std.iter().map(|&s| s as Scalar).collect(),
        })
    }

    /// The CIFAR-10 statistics.
    pub fn cifar10() -> Self {
        Self {
            mean: CIFAR10_MEAN.iter().map(|&m| m as Scalar).collect(),
            std: CIFAR10_STD_DEV.iter().map(|&s| s as Scalar).collect(),
        }
    }

    /// Number of channels the transform expects.
    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    /// Convert planar bytes of shape `channels × side × side`.
    pub fn apply(&self, pixels: &[u8], side: usize) -> Result<Image> {
        let c = self.channels();
        let mut image = Image::from_shape_vec(
            (c, side, side),
            pixels.iter().map(|&p| p as Scalar / 255.0).collect(),
        )
        .map_err(|_| DpError::shape(&[c, side, side], &[pixels.len()]))?;
        for (ci, mut plane) in image.axis_iter_mut(Axis(0)).enumerate() {
            let (m, s) = (self.mean[ci], self.std[ci]);
            plane.mapv_inplace(|v| (v - m) / s);
        }
        Ok(image)
    }

    /// Convert one CIFAR-10 image.
    pub fn apply_cifar(&self, pixels: &[u8]) -> Result<Image> {
        if self.channels() != CHANNELS {
            return Err(DpError::invalid("CIFAR-10 images have three channels"));
        }
        self.apply(pixels, IMAGE_SIDE)
    }
}

impl Default for Normalize {
    fn default() -> Self {
        Self::cifar10()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cifar::IMAGE_BYTES;

    #[test]
    fn standardizes_each_channel() {
        let norm = Normalize::new(&[0.5, 0.0], &[0.5, 1.0]).expect("valid stats");
        let image = norm.apply(&[255, 0], 1).expect("valid pixels");
        assert_eq!(image.dim(), (2, 1, 1));
        assert!((image[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!(image[[1, 0, 0]].abs() < 1e-6);
    }

    #[test]
    fn cifar_pixels_map_to_expected_range() {
        let norm = Normalize::cifar10();
        let image = norm.apply_cifar(&vec![255u8; IMAGE_BYTES]).expect("valid pixels");
        assert_eq!(image.dim(), (3, 32, 32));
        let expected = (1.0 - 0.4914) / 0.2023;
        assert!((image[[0, 5, 5]] as f64 - expected).abs() < 1e-4);
    }

    #[test]
    fn rejects_wrong_sizes_and_stats() {
        let norm = Normalize::cifar10();
        assert!(norm.apply_cifar(&[0u8; 10]).is_err());
        assert!(Normalize::new(&[0.5], &[0.0]).is_err());
        assert!(Normalize::new(&[0.5, 0.5], &[0.5]).is_err());
    }
}
