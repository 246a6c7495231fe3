//! CIFAR-10 data pipeline: binary reader, normalization, datasets and loaders.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cifar;
pub mod dataset;
pub mod loader;
pub mod transform;

pub use cifar::{
    load_split, parse_records, CifarSplit, Split, CIFAR10_MEAN, CIFAR10_STD_DEV, CLASS_NAMES,
    NUM_CLASSES,
};
pub use dataset::{CifarDataset, InMemoryDataset, IndexedDataset, SyntheticDataset};
pub use loader::{Batch, DataLoader};
pub use transform::{Image, Normalize};

/// Common imports for data loading.
pub mod prelude {
    pub use crate::{
        load_split, Batch, CifarDataset, DataLoader, Image, InMemoryDataset, IndexedDataset,
        Normalize, Split, SyntheticDataset,
    };
}
