//! Splits logical batches into physical batches that fit in memory.

use dpresnet_core::{split_physical, BatchIndices, DpError, Result};

/// A chunk of a logical batch; only the last chunk triggers an optimizer step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalBatch {
    /// Dataset indices in this chunk.
    pub indices: BatchIndices,
    /// Whether this chunk closes its logical batch.
    pub is_last: bool,
}

/// Caps the number of examples processed at once without changing the
/// logical batch seen by the privacy accountant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchMemoryManager {
    max_physical_batch_size: usize,
}

impl BatchMemoryManager {
    /// Manager with the given physical batch cap.
    pub fn new(max_physical_batch_size: usize) -> Result<Self> {
        if max_physical_batch_size == 0 {
            return Err(DpError::invalid("max_physical_batch_size must be positive"));
        }
        Ok(Self {
            max_physical_batch_size,
        })
    }

    /// Physical batch cap.
    pub fn max_physical_batch_size(&self) -> usize {
        self.max_physical_batch_size
    }

    /// Split one logical batch.
    ///
    /// An empty logical batch still yields one empty, last chunk so the
    /// optimizer takes its (noise-only) step.
    pub fn split(&self, logical: &[usize]) -> Vec<PhysicalBatch> {
        let chunks = split_physical(logical, self.max_physical_batch_size);
        if chunks.is_empty() {
            return vec![PhysicalBatch {
                indices: Vec::new(),
                is_last: true,
            }];
        }
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, indices)| PhysicalBatch {
                indices,
                is_last: i == last,
            })
            .collect()
    }

    /// Split every logical batch of an epoch, in order.
    pub fn split_epoch(&self, logical_batches: &[BatchIndices]) -> Vec<PhysicalBatch> {
        logical_batches
            .iter()
            .flat_map(|batch| self.split(batch))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_with_cap_and_marks_last() {
        let manager = BatchMemoryManager::new(128).expect("positive cap");
        let logical: Vec<usize> = (0..300).collect();
        let physical = manager.split(&logical);
        assert_eq!(
            physical.iter().map(|p| p.indices.len()).collect::<Vec<_>>(),
            vec![128, 128, 44]
        );
        assert_eq!(
            physical.iter().map(|p| p.is_last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
    }

    #[test]
    fn empty_logical_batch_still_steps() {
        let manager = BatchMemoryManager::new(4).expect("positive cap");
        assert_eq!(
            manager.split(&[]),
            vec![PhysicalBatch {
                indices: vec![],
                is_last: true
            }]
        );
        assert!(BatchMemoryManager::new(0).is_err());
    }

    #[test]
    fn epoch_has_one_step_per_logical_batch() {
        let manager = BatchMemoryManager::new(2).expect("positive cap");
        let epoch = vec![vec![1, 2, 3], vec![], vec![4]];
        let physical = manager.split_epoch(&epoch);
        assert_eq!(physical.iter().filter(|p| p.is_last).count(), 3);
        assert_eq!(physical.len(), 4);
    }

    proptest! {
        #[test]
        fn split_preserves_order_and_bounds(len in 0usize..500, cap in 1usize..64) {
            let manager = BatchMemoryManager::new(cap).expect("positive cap");
            let logical: Vec<usize> = (0..len).collect();
            let physical = manager.split(&logical);
            let rejoined: Vec<usize> = physical.iter().flat_map(|p| p.indices.clone()).collect();
            prop_assert_eq!(rejoined, logical);
            prop_assert!(physical.iter().all(|p| p.indices.len() <= cap));
            prop_assert_eq!(physical.iter().filter(|p| p.is_last).count(), 1);
            prop_assert!(physical.last().map_or(false, |p| p.is_last));
        }
    }
}
