//! Batching over an [`IndexedDataset`].

use dpresnet_core::{BatchIndices, BatchSelectionStrategy, Result};
use rand::Rng;

use crate::dataset::IndexedDataset;
use crate::transform::Image;

/// Images and labels of one batch.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    /// Dataset indices of the examples.
    pub indices: Vec<usize>,
    /// Images in index order.
    pub images: Vec<Image>,
    /// Labels in index order.
    pub labels: Vec<usize>,
}

impl Batch {
    /// Number of examples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the batch has no examples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Draws index batches with a selection strategy and fetches their examples.
#[derive(Debug)]
pub struct DataLoader<'a, D: ?Sized, S> {
    dataset: &'a D,
    strategy: S,
}

impl<'a, D, S> DataLoader<'a, D, S>
where
    D: IndexedDataset + ?Sized,
    S: BatchSelectionStrategy,
{
    /// Create a loader.
    pub fn new(dataset: &'a D, strategy: S) -> Self {
        Self { dataset, strategy }
    }

    /// Underlying dataset.
    pub fn dataset(&self) -> &'a D {
        self.dataset
    }

    /// Batch selection strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Index batches for one epoch.
    pub fn epoch_indices<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<BatchIndices> {
        self.strategy.batches(self.dataset.len(), rng)
    }

    /// Fetch the examples at `indices`.
    pub fn fetch(&self, indices: &[usize]) -> Result<Batch> {
        let mut batch = Batch {
            indices: indices.to_vec(),
            images: Vec::with_capacity(indices.len()),
            labels: Vec::with_capacity(indices.len()),
        };
        for &i in indices {
            let (image, label) = self.dataset.get(i)?;
            batch.images.push(image);
            batch.labels.push(label);
        }
        Ok(batch)
    }

    /// All batches of one epoch, fetched lazily.
    pub fn iter<R: Rng + ?Sized>(&self, rng: &mut R) -> impl Iterator<Item = Result<Batch>> + '_ {
        self.epoch_indices(rng)
            .into_iter()
            .map(move |indices| self.fetch(&indices))
    }
}
