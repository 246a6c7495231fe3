//! Gaussian differential privacy accounting.
//!
//! Uses the central-limit approximation of Poisson-subsampled DP-SGD as a
//! `mu`-GDP mechanism. It is cheap and tends to under-report epsilon for
//! small step counts, so calibration defaults to the RDP accountant.

use statrs::function::erf::erfc;

use crate::rdp::HistoryEntry;

const EPS_UPPER: f64 = 500.0;
const BISECTION_ITERS: usize = 200;

/// GDP accountant recording the same history as the RDP accountant.
#[derive(Clone, Debug, Default)]
pub struct GdpAccountant {
    history: Vec<HistoryEntry>,
}

impl GdpAccountant {
    /// Create an empty accountant.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded steps, with consecutive identical entries merged.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Record `n` identical steps.
    pub fn steps(&mut self, noise_multiplier: f64, sample_rate: f64, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(last) = self.history.last_mut() {
            if last.noise_multiplier == noise_multiplier && last.sample_rate == sample_rate {
                last.num_steps += n;
                return;
            }
        }
        self.history.push(HistoryEntry {
            noise_multiplier,
            sample_rate,
            num_steps: n,
        });
    }

    /// Record one step.
    pub fn step(&mut self, noise_multiplier: f64, sample_rate: f64) {
        self.steps(noise_multiplier, sample_rate, 1);
    }

    /// Composed `mu` of the whole history.
    pub fn mu(&self) -> f64 {
        self.history
            .iter()
            .map(|e| mu_poisson(e.num_steps, e.noise_multiplier, e.sample_rate).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Epsilon spent so far at `delta`.
    pub fn epsilon(&self, delta: f64) -> f64 {
        eps_from_mu(self.mu(), delta)
    }

    /// Forget every recorded step.
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

/// `mu` of `steps` Poisson-subsampled Gaussian steps.
pub fn mu_poisson(steps: u64, noise_multiplier: f64, sample_rate: f64) -> f64 {
    if sample_rate <= 0.0 || steps == 0 {
        return 0.0;
    }
    if noise_multiplier <= 0.0 {
        return f64::INFINITY;
    }
    ((noise_multiplier.powi(-2)).exp() - 1.0).sqrt() * (steps as f64).sqrt() * sample_rate
}

fn std_normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Delta of a `mu`-GDP mechanism at `eps`.
pub fn delta_eps_mu(eps: f64, mu: f64) -> f64 {
    std_normal_cdf(-eps / mu + mu / 2.0) - eps.exp() * std_normal_cdf(-eps / mu - mu / 2.0)
}

/// Smallest epsilon with `delta_eps_mu(eps, mu) <= delta`, searched on `[0, 500]`.
pub fn eps_from_mu(mu: f64, delta: f64) -> f64 {
    if !delta.is_finite() || delta <= 0.0 || delta >= 1.0 {
        return f64::INFINITY;
    }
    if mu == 0.0 {
        return 0.0;
    }
    if !mu.is_finite() {
        return f64::INFINITY;
    }

    let f = |eps: f64| delta_eps_mu(eps, mu) - delta;
    if f(0.0) <= 0.0 {
        return 0.0;
    }
    if f(EPS_UPPER) > 0.0 {
        return f64::INFINITY;
    }

    let (mut lo, mut hi) = (0.0, EPS_UPPER);
    for _ in 0..BISECTION_ITERS {
        let mid = 0.5 * (lo + hi);
        if f(mid) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-12 {
            break;
        }
    }
    hi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_decreasing_in_epsilon() {
        let mu = 1.0;
        assert!(delta_eps_mu(0.5, mu) > delta_eps_mu(1.0, mu));
        assert!(delta_eps_mu(1.0, mu) > delta_eps_mu(2.0, mu));
    }

    #[test]
    fn eps_from_mu_inverts_delta() {
        let mu = 0.8;
        let eps = eps_from_mu(mu, 1e-5);
        assert!(eps.is_finite() && eps > 0.0);
        assert!((delta_eps_mu(eps, mu) - 1e-5).abs() < 1e-9);
    }

    #[test]
    fn composition_adds_in_quadrature() {
        let mut acc = GdpAccountant::new();
        acc.steps(1.0, 0.01, 100);
        acc.steps(2.0, 0.01, 100);
        let expected = (mu_poisson(100, 1.0, 0.01).powi(2) + mu_poisson(100, 2.0, 0.01).powi(2)).sqrt();
        assert!((acc.mu() - expected).abs() < 1e-12);
        assert_eq!(acc.history().len(), 2);
    }

    #[test]
    fn empty_history_spends_nothing() {
        let acc = GdpAccountant::new();
        assert_eq!(acc.epsilon(1e-5), 0.0);
    }

    #[test]
    fn more_steps_spend_more() {
        let mut acc = GdpAccountant::new();
        acc.steps(1.0, 0.004, 1000);
        let e1 = acc.epsilon(1e-5);
        acc.steps(1.0, 0.004, 1000);
        assert!(acc.epsilon(1e-5) > e1);
    }
}
