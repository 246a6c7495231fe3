//! Noise calibration for a target privacy budget.

use dpresnet_core::{DpError, Result};
use tracing::debug;

use crate::accountants::AccountantKind;

/// Upper bound on the noise multiplier search.
pub const MAX_SIGMA: f64 = 1e6;

/// Default tolerance on `target_epsilon - epsilon`.
pub const DEFAULT_EPSILON_TOLERANCE: f64 = 0.01;

/// Starting point of the noise multiplier search; doubled before the first evaluation.
const INITIAL_SIGMA_HIGH: f64 = 10.0;

/// Bisection stops after this many halvings even if the tolerance is not met.
const MAX_BISECTIONS: usize = 200;

/// Number of optimizer steps for `epochs` passes at `sample_rate`.
pub fn steps_for_epochs(epochs: usize, sample_rate: f64) -> u64 {
    if sample_rate <= 0.0 {
        return 0;
    }
    (epochs as f64 / sample_rate).floor() as u64
}

/// Epsilon spent after `steps` steps at a fixed noise multiplier and sample rate.
pub fn epsilon_for(
    kind: AccountantKind,
    noise_multiplier: f64,
    sample_rate: f64,
    steps: u64,
    delta: f64,
) -> f64 {
    let mut accountant = kind.create();
    accountant.steps(noise_multiplier, sample_rate, steps);
    accountant.epsilon(delta)
}

/// Smallest-found noise multiplier whose epsilon does not exceed `target_epsilon`.
///
/// The upper bracket is doubled from 10 until it meets the target, then the
/// interval is bisected until the epsilon at the upper end is within
/// `epsilon_tolerance` of the target. The upper end is returned, so the
/// result never overshoots the budget.
pub fn get_noise_multiplier(
    target_epsilon: f64,
    target_delta: f64,
    sample_rate: f64,
    steps: u64,
    kind: AccountantKind,
    epsilon_tolerance: f64,
) -> Result<f64> {
    if !target_epsilon.is_finite() || target_epsilon <= 0.0 {
        return Err(DpError::invalid("target_epsilon must be positive and finite"));
    }
    if !(0.0..1.0).contains(&target_delta) || target_delta == 0.0 {
        return Err(DpError::invalid("target_delta must be in (0, 1)"));
    }
    if !(0.0..=1.0).contains(&sample_rate) || sample_rate == 0.0 {
        return Err(DpError::invalid("sample_rate must be in (0, 1]"));
    }
    if steps == 0 {
        return Err(DpError::invalid("steps must be positive"));
    }
    if epsilon_tolerance.is_nan() || epsilon_tolerance <= 0.0 {
        return Err(DpError::invalid("epsilon_tolerance must be positive"));
    }

    let eps_at = |sigma: f64| epsilon_for(kind, sigma, sample_rate, steps, target_delta);

    let mut sigma_low = 0.0;
    let mut sigma_high = INITIAL_SIGMA_HIGH;
    let mut eps_high = f64::INFINITY;

    while eps_high > target_epsilon {
        sigma_high *= 2.0;
        eps_high = eps_at(sigma_high);
        debug!(sigma_high, eps_high, "bracketing noise multiplier");
        if sigma_high > MAX_SIGMA {
            return Err(DpError::PrivacyBudgetExhausted {
                eps: target_epsilon,
                delta: target_delta,
            });
        }
    }

    let mut iterations = 0;
    while target_epsilon - eps_high > epsilon_tolerance && iterations < MAX_BISECTIONS {
        let sigma = 0.5 * (sigma_low + sigma_high);
        let eps = eps_at(sigma);
        if eps < target_epsilon {
            sigma_high = sigma;
            eps_high = eps;
        } else {
            sigma_low = sigma;
        }
        iterations += 1;
    }
    debug!(
        sigma = sigma_high,
        eps = eps_high,
        iterations,
        "calibrated noise multiplier"
    );

    Ok(sigma_high)
}
