//! Tree-structured collections of parameter tensors.
//!
//! Model parameters, per-example gradients and optimizer state all share the
//! same layout. Flattening a tree yields its leaves in a fixed order plus a
//! [`TreeSpec`] that is enough to rebuild it.

use crate::error::{DpError, Result};
use crate::tensor::{squared_norm, Scalar, Tensor};

/// Structural description of a [`PyTree`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeSpec {
    /// A single leaf value.
    Leaf,
    /// A homogeneous vector of children.
    Vec {
        /// Number of elements.
        len: usize,
        /// Child structure.
        child: Box<TreeSpec>,
    },
}

/// A trait representing tree-structured collections of tensors.
pub trait PyTree: Sized {
    /// Leaf type stored in the tree.
    type Leaf;

    /// Flatten into leaves plus a structural specification.
    fn flatten(&self) -> (Vec<Self::Leaf>, TreeSpec);

    /// Reconstruct from a spec and leaves.
    ///
    /// Implementations may panic if the leaves do not match the spec.
    fn unflatten(spec: &TreeSpec, leaves: Vec<Self::Leaf>) -> Self;
}

impl PyTree for Tensor {
    type Leaf = Tensor;

    fn flatten(&self) -> (Vec<Self::Leaf>, TreeSpec) {
        (vec![self.clone()], TreeSpec::Leaf)
    }

    fn unflatten(spec: &TreeSpec, mut leaves: Vec<Self::Leaf>) -> Self {
        match spec {
            TreeSpec::Leaf => leaves
                .pop()
                .unwrap_or_else(|| panic!("missing leaf for Tensor unflatten")),
            _ => panic!("TreeSpec mismatch for Tensor leaf"),
        }
    }
}

impl<T> PyTree for Vec<T>
where
    T: PyTree<Leaf = Tensor>,
{
    type Leaf = Tensor;

    fn flatten(&self) -> (Vec<Self::Leaf>, TreeSpec) {
        let mut leaves = Vec::new();
        let mut child_spec: Option<TreeSpec> = None;
        for item in self {
            let (mut item_leaves, spec) = item.flatten();
            if let Some(prev) = &child_spec {
                if prev != &spec {
                    panic!("heterogeneous Vec PyTree is not supported");
                }
            } else {
                child_spec = Some(spec);
            }
            leaves.append(&mut item_leaves);
        }

        (
            leaves,
            TreeSpec::Vec {
                len: self.len(),
                child: Box::new(child_spec.unwrap_or(TreeSpec::Leaf)),
            },
        )
    }

    fn unflatten(spec: &TreeSpec, leaves: Vec<Self::Leaf>) -> Self {
        let (len, child_spec) = match spec {
            TreeSpec::Vec { len, child } => (*len, child.as_ref()),
            _ => panic!("TreeSpec mismatch for Vec"),
        };
        if len == 0 {
            return Vec::new();
        }

        let per_elem = leaf_count(child_spec);
        assert_eq!(
            leaves.len(),
            len * per_elem,
            "leaf count does not match Vec TreeSpec"
        );
        let mut out = Vec::with_capacity(len);
        let mut iter = leaves.into_iter();
        for _ in 0..len {
            let chunk: Vec<Tensor> = iter.by_ref().take(per_elem).collect();
            out.push(T::unflatten(child_spec, chunk));
        }
        out
    }
}

/// Apply a function to every leaf tensor.
pub fn map_leaves<T>(tree: &T, mut f: impl FnMut(&Tensor) -> Tensor) -> T
where
    T: PyTree<Leaf = Tensor>,
{
    let (leaves, spec) = tree.flatten();
    let mapped = leaves.iter().map(&mut f).collect();
    T::unflatten(&spec, mapped)
}

/// Combine two trees of identical structure leaf by leaf.
pub fn zip_map_leaves<T>(
    lhs: &T,
    rhs: &T,
    mut f: impl FnMut(&Tensor, &Tensor) -> Tensor,
) -> Result<T>
where
    T: PyTree<Leaf = Tensor>,
{
    let (a, spec_a) = lhs.flatten();
    let (b, spec_b) = rhs.flatten();
    if spec_a != spec_b {
        return Err(DpError::invalid("trees have different structure"));
    }
    let mut out = Vec::with_capacity(a.len());
    for (x, y) in a.iter().zip(b.iter()) {
        if x.shape() != y.shape() {
            return Err(DpError::shape(x.shape(), y.shape()));
        }
        out.push(f(x, y));
    }
    Ok(T::unflatten(&spec_a, out))
}

/// Tree of zeros with the same shapes as `tree`.
pub fn zeros_like<T>(tree: &T) -> T
where
    T: PyTree<Leaf = Tensor>,
{
    map_leaves(tree, |leaf| Tensor::zeros(leaf.raw_dim()))
}

/// Compute the global L2 norm across all leaves.
pub fn global_l2_norm<T>(tree: &T) -> f64
where
    T: PyTree<Leaf = Tensor>,
{
    let (leaves, _) = tree.flatten();
    let mut sum_sq = 0.0_f64;
    for leaf in &leaves {
        let sq = squared_norm(leaf);
        if !sq.is_finite() {
            return sq;
        }
        sum_sq += sq;
    }
    sum_sq.sqrt()
}

/// Count the number of leaves described by a spec.
pub fn leaf_count(spec: &TreeSpec) -> usize {
    match spec {
        TreeSpec::Leaf => 1,
        TreeSpec::Vec { len, child } => len.saturating_mul(leaf_count(child)),
    }
}

/// Total number of scalar entries across all leaves.
pub fn num_elements<T>(tree: &T) -> usize
where
    T: PyTree<Leaf = Tensor>,
{
    tree.flatten().0.iter().map(|leaf| leaf.len()).sum()
}

/// Scale a tensor by a floating-point factor, preserving dtype.
pub(crate) fn scale_tensor(t: &Tensor, scale: f64) -> Tensor {
    let s = scale as Scalar;
    t.mapv(|v| v * s)
}
