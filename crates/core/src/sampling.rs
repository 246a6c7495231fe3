//! Index sampling primitives for building training batches.

use rand::seq::SliceRandom;
use rand::Rng;

/// Batch indices for a training step.
pub type BatchIndices = Vec<usize>;

/// Sample indices using Poisson sampling.
///
/// Each index is included independently with probability `q`, so the batch
/// size is random and may be zero.
pub fn poisson_sample<R: Rng + ?Sized>(n: usize, q: f64, rng: &mut R) -> BatchIndices {
    if n == 0 || !q.is_finite() || q <= 0.0 {
        return Vec::new();
    }
    if q >= 1.0 {
        return (0..n).collect();
    }

    let mut indices = Vec::new();
    for i in 0..n {
        if rng.gen_bool(q) {
            indices.push(i);
        }
    }
    indices
}

/// Consecutive batches over `0..n`; the last batch may be short.
pub fn sequential_batches(n: usize, batch_size: usize) -> Vec<BatchIndices> {
    assert!(batch_size > 0, "batch_size must be positive");
    let all: Vec<usize> = (0..n).collect();
    all.chunks(batch_size).map(|c| c.to_vec()).collect()
}

/// Consecutive batches over a random permutation of `0..n`.
pub fn shuffled_batches<R: Rng + ?Sized>(
    n: usize,
    batch_size: usize,
    rng: &mut R,
) -> Vec<BatchIndices> {
    assert!(batch_size > 0, "batch_size must be positive");
    let mut all: Vec<usize> = (0..n).collect();
    all.shuffle(rng);
    all.chunks(batch_size).map(|c| c.to_vec()).collect()
}

/// Split a logical batch into chunks of at most `max_physical` indices.
///
/// An empty input yields no chunks.
pub fn split_physical(indices: &[usize], max_physical: usize) -> Vec<BatchIndices> {
    assert!(max_physical > 0, "max_physical must be positive");
    indices.chunks(max_physical).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_poisson_sample_probability() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let n = 10_000;
        let q = 0.1;
        let samples = poisson_sample(n, q, &mut rng);
        let ratio = samples.len() as f64 / n as f64;
        assert!((ratio - q).abs() < 0.02);
        assert!(samples.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_poisson_sample_edges() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(poisson_sample(10, 0.0, &mut rng).is_empty());
        assert_eq!(poisson_sample(4, 1.0, &mut rng), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_sequential_batches() {
        let batches = sequential_batches(5, 2);
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_shuffled_batches_cover_everything() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut flat: Vec<usize> = shuffled_batches(50, 8, &mut rng).concat();
        flat.sort_unstable();
        assert_eq!(flat, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_physical() {
        let indices: Vec<usize> = (0..200).collect();
        let chunks = split_physical(&indices, 128);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 128);
        assert_eq!(chunks[1].len(), 72);
        assert!(split_physical(&[], 128).is_empty());
    }
}
