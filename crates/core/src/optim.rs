//! First-order optimizers expressed as [`GradientTransform`]s.

use ndarray::Zip;

use crate::error::{DpError, Result};
use crate::pytree::{zip_map_leaves, PyTree, TreeSpec};
use crate::tensor::{Scalar, Tensor};
use crate::transform::GradientTransform;

fn flat_leaves<T: PyTree<Leaf = Tensor>>(tree: &T) -> (Vec<Tensor>, TreeSpec) {
    tree.flatten()
}

fn check_same_layout(grads: &[Tensor], params: &[Tensor]) -> Result<()> {
    if grads.len() != params.len() {
        return Err(DpError::invalid(format!(
            "gradient has {} leaves but parameters have {}",
            grads.len(),
            params.len()
        )));
    }
    for (g, p) in grads.iter().zip(params) {
        if g.shape() != p.shape() {
            return Err(DpError::shape(p.shape(), g.shape()));
        }
    }
    Ok(())
}

/// RMSprop with PyTorch defaults (`alpha = 0.99`, `eps = 1e-8`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RmsProp {
    /// Learning rate.
    pub lr: f64,
    /// Smoothing constant of the squared-gradient average.
    pub alpha: f64,
    /// Term added to the denominator.
    pub eps: f64,
    /// L2 penalty folded into the gradient.
    pub weight_decay: f64,
    /// Momentum factor.
    pub momentum: f64,
    /// Normalize by the estimated gradient variance instead of the raw second moment.
    pub centered: bool,
}

impl RmsProp {
    /// RMSprop with the given learning rate and default hyper-parameters.
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            alpha: 0.99,
            eps: 1e-8,
            weight_decay: 0.0,
            momentum: 0.0,
            centered: false,
        }
    }

    /// Validate hyper-parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(DpError::invalid("learning rate must be positive"));
        }
        if !(0.0..1.0).contains(&self.alpha) {
            return Err(DpError::invalid("alpha must be in [0, 1)"));
        }
        if self.eps < 0.0 || self.weight_decay < 0.0 || self.momentum < 0.0 {
            return Err(DpError::invalid("eps, weight_decay and momentum must be >= 0"));
        }
        Ok(())
    }
}

/// Per-leaf RMSprop buffers.
#[derive(Clone, Debug)]
pub struct RmsPropState {
    square_avg: Vec<Tensor>,
    grad_avg: Option<Vec<Tensor>>,
    momentum_buf: Option<Vec<Tensor>>,
    /// Number of updates applied so far.
    pub step: u64,
}

impl<T: PyTree<Leaf = Tensor>> GradientTransform<T> for RmsProp {
    type State = RmsPropState;

    fn init(&self, params: &T) -> Self::State {
        let (leaves, _) = flat_leaves(params);
        let zeros: Vec<Tensor> = leaves.iter().map(|l| Tensor::zeros(l.raw_dim())).collect();
        RmsPropState {
            square_avg: zeros.clone(),
            grad_avg: self.centered.then(|| zeros.clone()),
            momentum_buf: (self.momentum > 0.0).then_some(zeros),
            step: 0,
        }
    }

    fn update(&self, grad: &T, mut state: Self::State, params: &T) -> Result<(T, Self::State)> {
        let (grads, spec) = flat_leaves(grad);
        let (param_leaves, _) = flat_leaves(params);
        check_same_layout(&grads, &param_leaves)?;
        if state.square_avg.len() != grads.len() {
            return Err(DpError::invalid("optimizer state does not match parameters"));
        }

        let alpha = self.alpha as Scalar;
        let eps = self.eps as Scalar;
        let lr = self.lr as Scalar;
        let wd = self.weight_decay as Scalar;
        let momentum = self.momentum as Scalar;

        let mut updates = Vec::with_capacity(grads.len());
        for (i, (g, p)) in grads.iter().zip(param_leaves.iter()).enumerate() {
            let g = if wd != 0.0 { g + &p.mapv(|v| v * wd) } else { g.clone() };

            Zip::from(&mut state.square_avg[i])
                .and(&g)
                .for_each(|s, &gi| *s = alpha * *s + (1.0 - alpha) * gi * gi);

            let mut denom = state.square_avg[i].clone();
            if let Some(grad_avg) = state.grad_avg.as_mut() {
                Zip::from(&mut grad_avg[i])
                    .and(&g)
                    .for_each(|a, &gi| *a = alpha * *a + (1.0 - alpha) * gi);
                Zip::from(&mut denom)
                    .and(&grad_avg[i])
                    .for_each(|d, &a| *d -= a * a);
            }
            denom.mapv_inplace(|v| v.max(0.0).sqrt() + eps);

            let update = match state.momentum_buf.as_mut() {
                Some(bufs) => {
                    Zip::from(&mut bufs[i])
                        .and(&g)
                        .and(&denom)
                        .for_each(|b, &gi, &d| *b = momentum * *b + gi / d);
                    bufs[i].mapv(|b| -lr * b)
                }
                None => {
                    let mut u = g;
                    Zip::from(&mut u).and(&denom).for_each(|u, &d| *u = -lr * *u / d);
                    u
                }
            };
            updates.push(update);
        }

        state.step += 1;
        Ok((T::unflatten(&spec, updates), state))
    }
}

/// Plain SGD with optional heavy-ball momentum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sgd {
    /// Learning rate.
    pub lr: f64,
    /// Momentum factor.
    pub momentum: f64,
}

/// Momentum buffers for [`Sgd`].
#[derive(Clone, Debug)]
pub struct SgdState {
    momentum_buf: Option<Vec<Tensor>>,
}

impl<T: PyTree<Leaf = Tensor>> GradientTransform<T> for Sgd {
    type State = SgdState;

    fn init(&self, params: &T) -> Self::State {
        let (leaves, _) = flat_leaves(params);
        SgdState {
            momentum_buf: (self.momentum > 0.0)
                .then(|| leaves.iter().map(|l| Tensor::zeros(l.raw_dim())).collect()),
        }
    }

    fn update(&self, grad: &T, mut state: Self::State, params: &T) -> Result<(T, Self::State)> {
        let (grads, spec) = flat_leaves(grad);
        let (param_leaves, _) = flat_leaves(params);
        check_same_layout(&grads, &param_leaves)?;

        let lr = self.lr as Scalar;
        let momentum = self.momentum as Scalar;
        let updates: Vec<Tensor> = match state.momentum_buf.as_mut() {
            Some(bufs) => grads
                .iter()
                .zip(bufs.iter_mut())
                .map(|(g, b)| {
                    Zip::from(&mut *b).and(g).for_each(|b, &gi| *b = momentum * *b + gi);
                    b.mapv(|v| -lr * v)
                })
                .collect(),
            None => grads.iter().map(|g| g.mapv(|v| -lr * v)).collect(),
        };
        Ok((T::unflatten(&spec, updates), state))
    }
}

/// Add `updates` to `params`.
pub fn apply_updates<T: PyTree<Leaf = Tensor>>(params: &T, updates: &T) -> Result<T> {
    zip_map_leaves(params, updates, |p, u| p + u)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn rmsprop_first_step_matches_closed_form() {
        let opt = RmsProp::new(1e-3);
        let params = vec![array![1.0, -1.0].into_dyn()];
        let grad = vec![array![0.5, -2.0].into_dyn()];
        let state = opt.init(&params);
        let (upd, state) = opt.update(&grad, state, &params).expect("update");

        // v = 0.01 g^2, so g / sqrt(v) = 10 * sign(g).
        assert!((upd[0][[0]] + 1e-2).abs() < 1e-6);
        assert!((upd[0][[1]] - 1e-2).abs() < 1e-6);
        assert_eq!(state.step, 1);
    }

    #[test]
    fn rmsprop_steps_shrink_as_average_grows() {
        let opt = RmsProp::new(1e-2);
        let params = vec![array![0.0].into_dyn()];
        let grad = vec![array![1.0].into_dyn()];
        let state = opt.init(&params);
        let (first, state) = opt.update(&grad, state, &params).expect("first");
        let (second, _) = opt.update(&grad, state, &params).expect("second");
        assert!(second[0][[0]].abs() < first[0][[0]].abs());
    }

    #[test]
    fn rmsprop_centered_and_momentum_run() {
        let opt = RmsProp {
            momentum: 0.9,
            centered: true,
            weight_decay: 1e-4,
            ..RmsProp::new(1e-3)
        };
        opt.validate().expect("valid");
        let params = vec![array![1.0, 2.0].into_dyn()];
        let grad = vec![array![0.1, -0.1].into_dyn()];
        let mut state = opt.init(&params);
        for _ in 0..3 {
            let (upd, next) = opt.update(&grad, state, &params).expect("update");
            assert!(upd[0].iter().all(|v| v.is_finite()));
            state = next;
        }
    }

    #[test]
    fn rmsprop_rejects_layout_mismatch() {
        let opt = RmsProp::new(1e-3);
        let params = vec![array![1.0, 2.0].into_dyn()];
        let grad = vec![array![1.0].into_dyn()];
        let state = opt.init(&params);
        assert!(opt.update(&grad, state, &params).is_err());
    }

    #[test]
    fn sgd_with_momentum_accumulates() {
        let opt = Sgd {
            lr: 0.1,
            momentum: 0.5,
        };
        let params = vec![array![0.0].into_dyn()];
        let grad = vec![array![1.0].into_dyn()];
        let state = opt.init(&params);
        let (u1, state) = opt.update(&grad, state, &params).expect("first");
        let (u2, _) = opt.update(&grad, state, &params).expect("second");
        assert!((u1[0][[0]] + 0.1).abs() < 1e-12);
        assert!((u2[0][[0]] + 0.15).abs() < 1e-12);
    }

    #[test]
    fn apply_updates_adds() {
        let params = vec![array![1.0, 2.0].into_dyn()];
        let updates = vec![array![-0.5, 0.5].into_dyn()];
        let out = apply_updates(&params, &updates).expect("same shape");
        assert_eq!(out[0], array![0.5, 2.5].into_dyn());
    }

    #[test]
    fn rmsprop_validation() {
        assert!(RmsProp::new(0.0).validate().is_err());
        assert!(RmsProp {
            alpha: 1.0,
            ..RmsProp::new(1e-3)
        }
        .validate()
        .is_err());
    }
}
