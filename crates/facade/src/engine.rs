//! Privacy engine: turns an optimizer and a dataset size into a private setup.

use std::sync::{Arc, Mutex};

use dpresnet_accounting::{
    get_noise_multiplier, steps_for_epochs, AccountantKind, DEFAULT_EPSILON_TOLERANCE,
};
use dpresnet_core::{DpError, DpSgdAggregator, GradientTransform, PoissonSampling, PyTree, Result, Tensor};
use tracing::info;

use crate::optimizer::{lock, DpOptimizer, SharedAccountant};

/// Data and clipping settings shared by both `make_private` variants.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrivacySettings {
    /// Training set size.
    pub num_samples: usize,
    /// Expected logical batch size.
    pub batch_size: usize,
    /// Planned passes over the data.
    pub epochs: usize,
    /// Per-example clipping threshold.
    pub max_grad_norm: f64,
}

impl PrivacySettings {
    fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(DpError::invalid("epochs must be positive"));
        }
        if !self.max_grad_norm.is_finite() || self.max_grad_norm <= 0.0 {
            return Err(DpError::invalid("max_grad_norm must be positive"));
        }
        Ok(())
    }
}

/// Everything needed to train privately.
pub struct PrivateSetup<O, T>
where
    O: GradientTransform<T>,
    T: PyTree<Leaf = Tensor>,
{
    /// Optimizer that clips, noises and accounts.
    pub optimizer: DpOptimizer<O, T>,
    /// Poisson sampler for logical batches.
    pub sampler: PoissonSampling,
    /// Noise multiplier in use.
    pub noise_multiplier: f64,
    /// Poisson sample rate.
    pub sample_rate: f64,
}

/// Owns the accountant that every optimizer it creates reports to.
#[derive(Clone, Debug)]
pub struct PrivacyEngine {
    kind: AccountantKind,
    accountant: SharedAccountant,
    epsilon_tolerance: f64,
}

impl Default for PrivacyEngine {
    fn default() -> Self {
        Self::new(AccountantKind::Rdp)
    }
}

impl PrivacyEngine {
    /// Engine with a fresh accountant of `kind`.
    pub fn new(kind: AccountantKind) -> Self {
        Self {
            kind,
            accountant: Arc::new(Mutex::new(kind.create())),
            epsilon_tolerance: DEFAULT_EPSILON_TOLERANCE,
        }
    }

    /// Calibration tolerance used by [`PrivacyEngine::make_private_with_epsilon`].
    pub fn with_epsilon_tolerance(mut self, tolerance: f64) -> Self {
        self.epsilon_tolerance = tolerance;
        self
    }

    /// Accounting method.
    pub fn accountant_kind(&self) -> AccountantKind {
        self.kind
    }

    /// Handle to the shared accountant.
    pub fn accountant(&self) -> SharedAccountant {
        Arc::clone(&self.accountant)
    }

    /// Calibrate the noise multiplier for a target budget and wrap `optimizer`.
    ///
    /// The sample rate is `1 / ceil(num_samples / batch_size)` and the
    /// calibration assumes `epochs / sample_rate` steps.
    pub fn make_private_with_epsilon<O, T>(
        &self,
        optimizer: O,
        params: &T,
        settings: &PrivacySettings,
        target_epsilon: f64,
        target_delta: f64,
    ) -> Result<PrivateSetup<O, T>>
    where
        O: GradientTransform<T>,
        T: PyTree<Leaf = Tensor>,
    {
        settings.validate()?;
        let sampler = PoissonSampling::from_batch_size(settings.num_samples, settings.batch_size)?;
        let steps = steps_for_epochs(settings.epochs, sampler.sample_rate);
        let noise_multiplier = get_noise_multiplier(
            target_epsilon,
            target_delta,
            sampler.sample_rate,
            steps,
            self.kind,
            self.epsilon_tolerance,
        )?;
        info!(
            noise_multiplier,
            target_epsilon,
            target_delta,
            steps,
            sample_rate = sampler.sample_rate,
            "calibrated noise"
        );
        self.make_private(optimizer, params, settings, noise_multiplier)
    }

    /// Wrap `optimizer` with a fixed noise multiplier.
    pub fn make_private<O, T>(
        &self,
        optimizer: O,
        params: &T,
        settings: &PrivacySettings,
        noise_multiplier: f64,
    ) -> Result<PrivateSetup<O, T>>
    where
        O: GradientTransform<T>,
        T: PyTree<Leaf = Tensor>,
    {
        settings.validate()?;
        let sampler = PoissonSampling::from_batch_size(settings.num_samples, settings.batch_size)?;
        let expected_batch_size = sampler.expected_batch_size(settings.num_samples);
        let aggregator =
            DpSgdAggregator::new(settings.max_grad_norm, noise_multiplier, expected_batch_size)?;
        let optimizer = DpOptimizer::new(
            optimizer,
            params,
            aggregator,
            sampler.sample_rate,
            self.accountant(),
        )?;
        Ok(PrivateSetup {
            optimizer,
            sampler,
            noise_multiplier,
            sample_rate: sampler.sample_rate,
        })
    }

    /// Epsilon spent so far at `delta`.
    pub fn get_epsilon(&self, delta: f64) -> f64 {
        lock(&self.accountant).epsilon(delta)
    }

    /// Optimizer steps recorded so far.
    pub fn steps(&self) -> u64 {
        lock(&self.accountant).num_steps()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpresnet_core::RmsProp;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn settings() -> PrivacySettings {
        PrivacySettings {
            num_samples: 50_000,
            batch_size: 200,
            epochs: 20,
            max_grad_norm: 1.2,
        }
    }

    #[test]
    fn calibrated_setup_matches_budget() {
        let engine = PrivacyEngine::default();
        let params = vec![array![0.0, 0.0].into_dyn()];
        let setup = engine
            .make_private_with_epsilon(RmsProp::new(1e-3), &params, &settings(), 5.0, 1e-5)
            .expect("calibration succeeds");
        assert!((setup.sample_rate - 0.004).abs() < 1e-12);
        assert_eq!(setup.sampler.steps, 250);
        assert!((setup.noise_multiplier - 0.670).abs() < 0.01);
        assert!((setup.optimizer.expected_batch_size() - 200.0).abs() < 1e-9);
        assert_eq!(engine.get_epsilon(1e-5), 0.0);
    }

    #[test]
    fn optimizer_steps_reach_the_engine() {
        let engine = PrivacyEngine::new(AccountantKind::Gdp);
        let params = vec![array![1.0].into_dyn()];
        let small = PrivacySettings {
            num_samples: 10,
            batch_size: 5,
            epochs: 1,
            max_grad_norm: 1.0,
        };
        let mut setup = engine
            .make_private(RmsProp::new(1e-2), &params, &small, 1.0)
            .expect("valid settings");
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        setup
            .optimizer
            .accumulate(&[vec![array![0.5].into_dyn()]])
            .expect("same shapes");
        setup.optimizer.step(&params, &mut rng).expect("step");
        assert_eq!(engine.steps(), 1);
        assert!(engine.get_epsilon(1e-5) > 0.0);
    }

    #[test]
    fn rejects_invalid_settings() {
        let engine = PrivacyEngine::default();
        let params = vec![array![0.0].into_dyn()];
        let mut bad = settings();
        bad.max_grad_norm = 0.0;
        assert!(engine
            .make_private(RmsProp::new(1e-3), &params, &bad, 1.0)
            .is_err());
        let mut bad = settings();
        bad.num_samples = 0;
        assert!(engine
            .make_private(RmsProp::new(1e-3), &params, &bad, 1.0)
            .is_err());
    }
}
