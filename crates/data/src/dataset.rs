//! Random-access datasets of labelled images.

use dpresnet_core::{DpError, Result, Scalar};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::cifar::{CifarSplit, CHANNELS, IMAGE_SIDE, NUM_CLASSES};
use crate::transform::{Image, Normalize};

/// A dataset addressed by example index.
pub trait IndexedDataset {
    /// Number of examples.
    fn len(&self) -> usize;

    /// Whether the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Image and label of example `index`.
    fn get(&self, index: usize) -> Result<(Image, usize)>;

    /// Number of label classes.
    fn num_classes(&self) -> usize;
}

fn out_of_range(index: usize, len: usize) -> DpError {
    DpError::invalid(format!("index {index} out of range for dataset of {len}"))
}

/// CIFAR-10 bytes decoded and normalized on access.
#[derive(Clone, Debug)]
pub struct CifarDataset {
    split: CifarSplit,
    normalize: Normalize,
}

impl CifarDataset {
    /// Wrap a loaded split.
    pub fn new(split: CifarSplit, normalize: Normalize) -> Self {
        Self { split, normalize }
    }
}

impl IndexedDataset for CifarDataset {
    fn len(&self) -> usize {
        self.split.len()
    }

    fn get(&self, index: usize) -> Result<(Image, usize)> {
        let pixels = self
            .split
            .pixels(index)
            .ok_or_else(|| out_of_range(index, self.len()))?;
        let image = self.normalize.apply_cifar(pixels)?;
        Ok((image, usize::from(self.split.labels()[index])))
    }

    fn num_classes(&self) -> usize {
        NUM_CLASSES
    }
}

/// Images already held as tensors.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDataset {
    images: Vec<Image>,
    labels: Vec<usize>,
    num_classes: usize,
}

impl InMemoryDataset {
    /// Build from parallel image and label vectors.
    pub fn new(images: Vec<Image>, labels: Vec<usize>, num_classes: usize) -> Result<Self> {
        if images.len() != labels.len() {
            return Err(DpError::invalid(format!(
                "{} images but {} labels",
                images.len(),
                labels.len()
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(DpError::invalid(format!(
                "label {bad} out of range for {num_classes} classes"
            )));
        }
        if let Some(first) = images.first() {
            if let Some(other) = images.iter().find(|im| im.dim() != first.dim()) {
                return Err(DpError::shape(first.shape(), other.shape()));
            }
        }
        Ok(Self {
            images,
            labels,
            num_classes,
        })
    }

    /// Materialize the first `limit` examples of another dataset.
    pub fn collect<D: IndexedDataset + ?Sized>(source: &D, limit: usize) -> Result<Self> {
        let n = limit.min(source.len());
        let mut images = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let (image, label) = source.get(i)?;
            images.push(image);
            labels.push(label);
        }
        Self::new(images, labels, source.num_classes())
    }

    /// Labels in index order.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }
}

impl IndexedDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn get(&self, index: usize) -> Result<(Image, usize)> {
        let image = self
            .images
            .get(index)
            .ok_or_else(|| out_of_range(index, self.len()))?;
        Ok((image.clone(), self.labels[index]))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Deterministic class-conditional images for smoke runs.
///
/// Every class has a fixed random template; example `i` has label
/// `i % num_classes` and is its class template plus Gaussian noise seeded by
/// `(seed, i)`, so the data is learnable and identical across runs.
#[derive(Clone, Debug)]
pub struct SyntheticDataset {
    len: usize,
    seed: u64,
    noise_std: f64,
    templates: Vec<Image>,
}

impl SyntheticDataset {
    /// CIFAR-shaped synthetic data with ten classes.
    pub fn cifar_like(len: usize, seed: u64) -> Result<Self> {
        Self::new(len, NUM_CLASSES, CHANNELS, IMAGE_SIDE, 0.5, seed)
    }

    /// Synthetic data with explicit dimensions.
    pub fn new(
        len: usize,
        num_classes: usize,
        channels: usize,
        side: usize,
        noise_std: f64,
        seed: u64,
    ) -> Result<Self> {
        if num_classes == 0 || channels == 0 || side == 0 {
            return Err(DpError::invalid("synthetic dimensions must be positive"));
        }
        if !(noise_std.is_finite() && noise_std >= 0.0) {
            return Err(DpError::invalid("noise_std must be finite and non-negative"));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).map_err(|e| DpError::numerical(e.to_string()))?;
        let templates = (0..num_classes)
            .map(|_| {
                Image::from_shape_fn((channels, side, side), |_| normal.sample(&mut rng) as Scalar)
            })
            .collect();
        Ok(Self {
            len,
            seed,
            noise_std,
            templates,
        })
    }
}

impl IndexedDataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<(Image, usize)> {
        if index >= self.len {
            return Err(out_of_range(index, self.len));
        }
        let label = index % self.templates.len();
        let mut rng = ChaCha8Rng::seed_from_u64(
            self.seed ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        let noise =
            Normal::new(0.0, self.noise_std).map_err(|e| DpError::numerical(e.to_string()))?;
        let image = self.templates[label].mapv(|v| v + noise.sample(&mut rng) as Scalar);
        Ok((image, label))
    }

    fn num_classes(&self) -> usize {
        self.templates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cifar::parse_records;
    use crate::cifar::RECORD_BYTES;

    #[test]
    fn synthetic_is_deterministic_and_balanced() {
        let data = SyntheticDataset::new(20, 4, 1, 3, 0.1, 7).expect("valid dims");
        let (a, la) = data.get(5).expect("in range");
        let (b, lb) = data.get(5).expect("in range");
        assert_eq!(a, b);
        assert_eq!(la, lb);
        assert_eq!(la, 1);
        assert!(data.get(20).is_err());

        let other = SyntheticDataset::new(20, 4, 1, 3, 0.1, 8).expect("valid dims");
        assert_ne!(other.get(5).expect("in range").0, a);
    }

    #[test]
    fn in_memory_validates_inputs() {
        let im = Image::zeros((1, 2, 2));
        assert!(InMemoryDataset::new(vec![im.clone()], vec![], 2).is_err());
        assert!(InMemoryDataset::new(vec![im.clone()], vec![2], 2).is_err());
        assert!(InMemoryDataset::new(vec![im.clone(), Image::zeros((1, 3, 3))], vec![0, 1], 2).is_err());
        let data = InMemoryDataset::new(vec![im], vec![1], 2).expect("valid");
        assert_eq!(data.len(), 1);
        assert_eq!(data.get(0).expect("in range").1, 1);
    }

    #[test]
    fn cifar_dataset_normalizes_on_access() {
        let mut bytes = vec![0u8; RECORD_BYTES];
        bytes[0] = 6;
        let split = parse_records(&bytes, "mem").expect("valid");
        let data = CifarDataset::new(split, Normalize::cifar10());
        let (image, label) = data.get(0).expect("in range");
        assert_eq!(label, 6);
        assert!(image[[0, 0, 0]] < 0.0);
        assert!(data.get(1).is_err());

        let copy = InMemoryDataset::collect(&data, 10).expect("collect");
        assert_eq!(copy.len(), 1);
        assert_eq!(copy.labels(), &[6]);
    }
}
