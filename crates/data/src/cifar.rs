//! Reader for the CIFAR-10 binary distribution.
//!
//! Each record is one label byte followed by 3072 pixel bytes: the red,
//! green and blue planes of a 32×32 image, row-major.

use std::fs;
use std::path::{Path, PathBuf};

use dpresnet_core::{DpError, Result};
use tracing::{debug, info};

/// Image side in pixels.
pub const IMAGE_SIDE: usize = 32;
/// Colour channels.
pub const CHANNELS: usize = 3;
/// Pixel bytes per image.
pub const IMAGE_BYTES: usize = CHANNELS * IMAGE_SIDE * IMAGE_SIDE;
/// Bytes per record, label included.
pub const RECORD_BYTES: usize = IMAGE_BYTES + 1;
/// Number of classes.
pub const NUM_CLASSES: usize = 10;

/// Per-channel mean of the training set.
pub const CIFAR10_MEAN: [f64; 3] = [0.4914, 0.4822, 0.4465];
/// Per-channel standard deviation used for normalization.
pub const CIFAR10_STD_DEV: [f64; 3] = [0.2023, 0.1994, 0.2010];

/// Class names in label order.
pub const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

/// Subdirectory created by extracting `cifar-10-binary.tar.gz`.
pub const BATCHES_DIR: &str = "cifar-10-batches-bin";

/// Which half of the dataset to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    /// 50 000 training images in five files.
    Train,
    /// 10 000 test images.
    Test,
}

impl Split {
    /// Files making up the split, in reading order.
    pub fn file_names(self) -> Vec<String> {
        match self {
            Split::Train => (1..=5).map(|i| format!("data_batch_{i}.bin")).collect(),
            Split::Test => vec!["test_batch.bin".to_string()],
        }
    }
}

/// Raw bytes of a split: labels and pixel planes, one entry per image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CifarSplit {
    labels: Vec<u8>,
    pixels: Vec<u8>,
}

impl CifarSplit {
    /// Number of images.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the split holds no images.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels in file order.
    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// The 3072 pixel bytes of image `index`.
    pub fn pixels(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(IMAGE_BYTES)?;
        self.pixels.get(start..start + IMAGE_BYTES)
    }

    /// Keep only the first `n` images.
    pub fn truncate(&mut self, n: usize) {
        self.labels.truncate(n);
        self.pixels.truncate(n.saturating_mul(IMAGE_BYTES));
    }
}

/// Decode the records of one batch file.
pub fn parse_records(bytes: &[u8], source: &str) -> Result<CifarSplit> {
    if bytes.len() % RECORD_BYTES != 0 {
        return Err(DpError::dataset(format!(
            "{source}: {} bytes is not a whole number of {RECORD_BYTES}-byte records",
            bytes.len()
        )));
    }
    let count = bytes.len() / RECORD_BYTES;
    let mut split = CifarSplit {
        labels: Vec::with_capacity(count),
        pixels: Vec::with_capacity(count * IMAGE_BYTES),
    };
    for (i, record) in bytes.chunks_exact(RECORD_BYTES).enumerate() {
        let label = record[0];
        if usize::from(label) >= NUM_CLASSES {
            return Err(DpError::dataset(format!(
                "{source}: record {i} has label {label}, expected 0..{NUM_CLASSES}"
            )));
        }
        split.labels.push(label);
        split.pixels.extend_from_slice(&record[1..]);
    }
    Ok(split)
}

/// Directory holding the batch files for `split` under `root`.
///
/// Both `<root>/cifar-10-batches-bin/` and `<root>/` itself are accepted.
pub fn resolve_dir(root: &Path, split: Split) -> Result<PathBuf> {
    let first = split
        .file_names()
        .into_iter()
        .next()
        .ok_or_else(|| DpError::dataset("split has no files"))?;
    let candidates = [root.join(BATCHES_DIR), root.to_path_buf()];
    candidates
        .into_iter()
        .find(|dir| dir.join(&first).is_file())
        .ok_or_else(|| {
            DpError::dataset(format!(
                "{first} not found in {} or {}; download and extract the CIFAR-10 binary \
                 version there",
                root.join(BATCHES_DIR).display(),
                root.display()
            ))
        })
}

/// Read every file of `split`.
pub fn load_split(root: &Path, split: Split) -> Result<CifarSplit> {
    let dir = resolve_dir(root, split)?;
    let mut out = CifarSplit::default();
    for name in split.file_names() {
        let path = dir.join(&name);
        let bytes = fs::read(&path).map_err(|e| {
            DpError::dataset(format!("failed to read {}: {e}", path.display()))
        })?;
        let part = parse_records(&bytes, &name)?;
        debug!(file = %name, images = part.len(), "read CIFAR-10 batch");
        out.labels.extend(part.labels);
        out.pixels.extend(part.pixels);
    }
    info!(split = ?split, images = out.len(), dir = %dir.display(), "loaded CIFAR-10");
    Ok(out)
}
