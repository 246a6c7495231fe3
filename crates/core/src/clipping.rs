//! Per-example gradient clipping for bounded sensitivity.
//!
//! Clipping is "flat": the whole per-example gradient tree is rescaled by a
//! single factor computed from its global L2 norm.

use crate::error::{DpError, Result};
use crate::pytree::{global_l2_norm, map_leaves, scale_tensor, zip_map_leaves, PyTree};
use crate::tensor::{sanitize, Scalar, Tensor};

/// Stabilizer added to the norm before dividing.
pub const CLIP_EPS: f64 = 1e-6;

/// Result of a clipping operation.
#[derive(Clone, Debug, PartialEq)]
pub struct ClipReport {
    /// Original L2 norm before clipping.
    pub original_norm: f64,
    /// Whether the example was scaled down.
    pub clipped: bool,
    /// Scale factor applied (1.0 if not clipped).
    pub scale: f64,
}

fn check_max_norm(max_norm: f64) -> Result<()> {
    if !max_norm.is_finite() || max_norm <= 0.0 {
        return Err(DpError::invalid(format!(
            "max_grad_norm must be positive and finite, got {max_norm}"
        )));
    }
    Ok(())
}

/// Scale factor applied to an example with gradient norm `norm`.
///
/// `min(1, max_norm / (norm + 1e-6))`, or zero when the norm is not finite.
pub fn clip_factor(norm: f64, max_norm: f64) -> f64 {
    if !norm.is_finite() {
        return 0.0;
    }
    (max_norm / (norm + CLIP_EPS)).min(1.0)
}

/// Clip a tree of tensors based on its global L2 norm.
///
/// Non-finite entries are zeroed before the norm is measured.
pub fn clip_pytree<T>(tree: &T, max_norm: f64) -> Result<(T, ClipReport)>
where
    T: PyTree<Leaf = Tensor>,
{
    check_max_norm(max_norm)?;

    let sanitized = map_leaves(tree, |leaf| {
        let mut leaf = leaf.clone();
        sanitize(&mut leaf, 0.0 as Scalar, 0.0 as Scalar);
        leaf
    });
    let norm = global_l2_norm(&sanitized);
    let scale = clip_factor(norm, max_norm);
    let clipped = map_leaves(&sanitized, |leaf| scale_tensor(leaf, scale));

    Ok((
        clipped,
        ClipReport {
            original_norm: norm,
            clipped: scale < 1.0,
            scale,
        },
    ))
}

/// Clip every example and add it into `sum`.
///
/// `sum` must already have the structure of a single example.
pub fn clip_and_accumulate<T>(examples: &[T], max_norm: f64, sum: &mut T) -> Result<Vec<ClipReport>>
where
    T: PyTree<Leaf = Tensor>,
{
    check_max_norm(max_norm)?;
    let mut reports = Vec::with_capacity(examples.len());
    for ex in examples {
        let (clipped, report) = clip_pytree(ex, max_norm)?;
        *sum = zip_map_leaves(sum, &clipped, |a, b| a + b)?;
        reports.push(report);
    }
    Ok(reports)
}

/// Fraction of reports that were scaled down.
pub fn clipped_fraction(reports: &[ClipReport]) -> f64 {
    if reports.is_empty() {
        return 0.0;
    }
    reports.iter().filter(|r| r.clipped).count() as f64 / reports.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pytree::zeros_like;
    use crate::tensor::l2_norm;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn test_no_clipping_needed() {
        let tree = array![0.3, 0.4].into_dyn(); // norm = 0.5
        let (clipped, report) = clip_pytree(&tree, 1.0).expect("valid norm");
        assert!((report.original_norm - 0.5).abs() < 1e-10);
        assert!(!report.clipped);
        assert_eq!(report.scale, 1.0);
        assert_eq!(clipped, tree);
    }

    #[test]
    fn test_clipping_applied() {
        let tree = array![3.0, 4.0].into_dyn(); // norm = 5.0
        let (clipped, report) = clip_pytree(&tree, 1.2).expect("valid norm");
        assert!((report.original_norm - 5.0).abs() < 1e-10);
        assert!(report.clipped);
        assert!((l2_norm(&clipped) - 1.2).abs() < 1e-6);
    }

    #[test]
    fn test_nan_entries_are_zeroed() {
        let tree = vec![array![f64::NAN, 3.0].into_dyn(), array![4.0].into_dyn()];
        let (clipped, report) = clip_pytree(&tree, 10.0).expect("valid norm");
        assert!((report.original_norm - 5.0).abs() < 1e-10);
        assert_eq!(clipped[0][[0]], 0.0);
    }

    #[test]
    fn test_invalid_norm_rejected() {
        let tree = array![1.0].into_dyn();
        assert!(clip_pytree(&tree, 0.0).is_err());
        assert!(clip_pytree(&tree, f64::INFINITY).is_err());
    }

    #[test]
    fn test_clip_and_accumulate() {
        let ex1 = vec![array![3.0, 4.0].into_dyn()];
        let ex2 = vec![array![0.3, 0.4].into_dyn()];
        let mut sum = zeros_like(&ex1);
        let reports = clip_and_accumulate(&[ex1, ex2], 1.0, &mut sum).expect("accumulate");
        assert_eq!(reports.len(), 2);
        assert!((clipped_fraction(&reports) - 0.5).abs() < 1e-12);
        // Same direction: the clipped unit vector plus the untouched half-norm one.
        assert!((l2_norm(&sum[0]) - 1.5).abs() < 1e-5);
    }

    proptest! {
        #[test]
        fn prop_clip_respects_bound(
            vals in prop::collection::vec(-100.0f64..100.0, 1..32),
            max_norm in 0.1f64..50.0,
        ) {
            let t = ndarray::Array1::from_vec(vals).into_dyn();
            let (clipped, _) = clip_pytree(&t, max_norm).expect("valid norm");
            let norm = l2_norm(&clipped);
            prop_assert!(norm.is_finite());
            prop_assert!(norm <= max_norm + 1e-6);
        }
    }
}
