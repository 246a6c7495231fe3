//! Optimizer wrapper that privatizes gradients before the inner update.

use std::sync::{Arc, Mutex, MutexGuard};

use dpresnet_accounting::PrivacyAccountant;
use dpresnet_core::{
    apply_updates, ClipReport, DpError, DpSgdAggregator, DpSgdState, GradientTransform, PyTree,
    Result, Tensor,
};
use rand::Rng;
use tracing::trace;

/// Accountant shared between the privacy engine and its optimizers.
pub type SharedAccountant = Arc<Mutex<Box<dyn PrivacyAccountant>>>;

pub(crate) fn lock(accountant: &SharedAccountant) -> MutexGuard<'_, Box<dyn PrivacyAccountant>> {
    accountant.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// DP-SGD around an inner [`GradientTransform`].
///
/// Per-example gradients are clipped and summed as physical batches arrive.
/// [`DpOptimizer::step`] closes the logical batch: it adds Gaussian noise to
/// the sum, divides by the expected batch size, applies the inner optimizer
/// and records the step with the accountant.
pub struct DpOptimizer<O, T>
where
    O: GradientTransform<T>,
    T: PyTree<Leaf = Tensor>,
{
    inner: O,
    inner_state: Option<O::State>,
    aggregator: DpSgdAggregator,
    pending: DpSgdState<T>,
    sample_rate: f64,
    accountant: SharedAccountant,
    steps: u64,
}

impl<O, T> DpOptimizer<O, T>
where
    O: GradientTransform<T>,
    T: PyTree<Leaf = Tensor>,
{
    /// Wrap `inner` for parameters shaped like `params`.
    pub fn new(
        inner: O,
        params: &T,
        aggregator: DpSgdAggregator,
        sample_rate: f64,
        accountant: SharedAccountant,
    ) -> Result<Self> {
        if sample_rate.is_nan() || sample_rate <= 0.0 || sample_rate > 1.0 {
            return Err(DpError::invalid("sample_rate must be in (0, 1]"));
        }
        Ok(Self {
            inner_state: Some(inner.init(params)),
            inner,
            pending: aggregator.init_state(params),
            aggregator,
            sample_rate,
            accountant,
            steps: 0,
        })
    }

    /// Clip and accumulate per-example gradients of one physical batch.
    pub fn accumulate(&mut self, per_example_grads: &[T]) -> Result<Vec<ClipReport>> {
        self.aggregator
            .accumulate(per_example_grads, &mut self.pending)
    }

    /// Finish the logical batch and return the updated parameters.
    pub fn step<R: Rng + ?Sized>(&mut self, params: &T, rng: &mut R) -> Result<T> {
        let examples = self.pending.num_examples();
        let clipped = self.pending.num_clipped();
        let grad = self.aggregator.finalize(&mut self.pending, rng);

        let state = self
            .inner_state
            .take()
            .ok_or_else(|| DpError::invalid("optimizer state lost after a failed update"))?;
        let (updates, state) = self.inner.update(&grad, state, params)?;
        self.inner_state = Some(state);
        let new_params = apply_updates(params, &updates)?;

        lock(&self.accountant).step(self.aggregator.noise_multiplier, self.sample_rate);
        self.steps += 1;
        trace!(step = self.steps, examples, clipped, "optimizer step");
        Ok(new_params)
    }

    /// Signal the end of a physical batch that does not close a logical batch.
    ///
    /// Accumulated gradients are kept for the next [`DpOptimizer::step`].
    pub fn skip_step(&self) {
        trace!(
            pending = self.pending.num_examples(),
            "deferring step to the end of the logical batch"
        );
    }

    /// Epsilon spent so far according to the shared accountant.
    pub fn epsilon(&self, delta: f64) -> f64 {
        lock(&self.accountant).epsilon(delta)
    }

    /// Noise multiplier.
    pub fn noise_multiplier(&self) -> f64 {
        self.aggregator.noise_multiplier
    }

    /// Clipping threshold.
    pub fn max_grad_norm(&self) -> f64 {
        self.aggregator.max_grad_norm
    }

    /// Divisor applied to the noisy sum.
    pub fn expected_batch_size(&self) -> f64 {
        self.aggregator.expected_batch_size
    }

    /// Poisson sample rate recorded with every step.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Optimizer steps taken.
    pub fn steps_taken(&self) -> u64 {
        self.steps
    }

    /// Examples accumulated since the last step.
    pub fn pending_examples(&self) -> usize {
        self.pending.num_examples()
    }

    /// The wrapped optimizer.
    pub fn inner(&self) -> &O {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpresnet_accounting::AccountantKind;
    use dpresnet_core::Sgd;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn shared() -> SharedAccountant {
        Arc::new(Mutex::new(AccountantKind::Rdp.create()))
    }

    #[test]
    fn noiseless_step_is_clipped_mean_update() {
        let params = vec![array![0.0, 0.0].into_dyn()];
        let agg = DpSgdAggregator::new(1.0, 0.0, 2.0).expect("aggregator");
        let sgd = Sgd {
            lr: 1.0,
            momentum: 0.0,
        };
        let accountant = shared();
        let mut opt = DpOptimizer::new(sgd, &params, agg, 0.5, accountant.clone())
            .expect("optimizer");

        opt.accumulate(&[vec![array![3.0, 4.0].into_dyn()]])
            .expect("same shapes");
        opt.skip_step();
        opt.accumulate(&[vec![array![0.0, 0.5].into_dyn()]])
            .expect("same shapes");
        assert_eq!(opt.pending_examples(), 2);
        assert_eq!(lock(&accountant).num_steps(), 0);

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let new = opt.step(&params, &mut rng).expect("step");
        let expected = [-(0.6 + 0.0) / 2.0, -(0.8 + 0.5) / 2.0];
        assert!((new[0][[0]] - expected[0]).abs() < 1e-5);
        assert!((new[0][[1]] - expected[1]).abs() < 1e-5);
        assert_eq!(opt.pending_examples(), 0);
        assert_eq!(opt.steps_taken(), 1);
        assert_eq!(lock(&accountant).num_steps(), 1);
    }

    #[test]
    fn every_step_is_accounted() {
        let params = vec![array![0.0].into_dyn()];
        let agg = DpSgdAggregator::new(1.0, 1.0, 10.0).expect("aggregator");
        let mut opt = DpOptimizer::new(
            Sgd {
                lr: 0.1,
                momentum: 0.0,
            },
            &params,
            agg,
            0.01,
            shared(),
        )
        .expect("optimizer");
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut eps = Vec::new();
        let mut p = params;
        for _ in 0..3 {
            p = opt.step(&p, &mut rng).expect("empty batches still step");
            eps.push(opt.epsilon(1e-5));
        }
        assert!(eps.windows(2).all(|w| w[1] > w[0]));
        let sgd = Sgd {
            lr: 0.1,
            momentum: 0.0,
        };
        assert!(DpOptimizer::new(sgd, &p, opt.aggregator.clone(), 0.0, shared()).is_err());
    }
}
