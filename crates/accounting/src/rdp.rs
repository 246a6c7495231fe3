//! Rényi Differential Privacy accounting for the sampled Gaussian mechanism.

use statrs::function::erf::erfc;
use statrs::function::factorial::ln_binomial;

/// Stop the fractional-order series once both terms fall below `exp(-30)`.
const SERIES_CUTOFF: f64 = -30.0;
const MAX_SERIES_TERMS: usize = 100_000;

/// One homogeneous run of DP-SGD steps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistoryEntry {
    /// Noise multiplier used for these steps.
    pub noise_multiplier: f64,
    /// Poisson sampling rate used for these steps.
    pub sample_rate: f64,
    /// Number of steps taken with these parameters.
    pub num_steps: u64,
}

/// RDP accountant for privacy composition.
#[derive(Clone, Debug)]
pub struct RdpAccountant {
    orders: Vec<f64>,
    history: Vec<HistoryEntry>,
}

impl Default for RdpAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl RdpAccountant {
    /// Create an accountant with default Rényi orders.
    pub fn new() -> Self {
        Self::with_orders(default_orders())
    }

    /// Create an accountant with custom orders.
    ///
    /// Orders that are not finite or not greater than one are dropped; an
    /// empty result falls back to the defaults.
    pub fn with_orders(orders: Vec<f64>) -> Self {
        let mut orders: Vec<f64> = orders
            .into_iter()
            .filter(|&a| a.is_finite() && a > 1.0)
            .collect();
        orders.sort_by(|a, b| a.total_cmp(b));
        orders.dedup_by(|a, b| (*a - *b).abs() < 1e-12);

        if orders.is_empty() {
            orders = default_orders();
        }
        Self {
            orders,
            history: Vec::new(),
        }
    }

    /// Rényi orders evaluated by this accountant.
    pub fn orders(&self) -> &[f64] {
        &self.orders
    }

    /// Recorded steps, with consecutive identical entries merged.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Record one DP-SGD step.
    pub fn step(&mut self, noise_multiplier: f64, sample_rate: f64) {
        self.steps(noise_multiplier, sample_rate, 1);
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

    /// Accumulated RDP at every order.
    pub fn rdp(&self) -> Vec<f64> {
        let mut total = vec![0.0; self.orders.len()];
        for entry in &self.history {
            let rdp = compute_rdp(
                entry.sample_rate,
                entry.noise_multiplier,
                entry.num_steps,
                &self.orders,
            );
            for (t, r) in total.iter_mut().zip(rdp) {
                *t += r;
            }
        }
        total
    }

    /// Convert to (epsilon, delta)-DP and report the optimal order.
    pub fn get_privacy_spent(&self, delta: f64) -> (f64, Option<f64>) {
        if self.history.is_empty() {
            return (0.0, None);
        }
        rdp_to_epsilon(&self.orders, &self.rdp(), delta)
    }

    /// Epsilon spent so far at `delta`.
    pub fn epsilon(&self, delta: f64) -> f64 {
        self.get_privacy_spent(delta).0
    }

    /// Forget every recorded step.
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

/// Default Rényi orders: `1 + x / 10` for `x` in `1..100`, then `12..64`.
pub fn default_orders() -> Vec<f64> {
    let mut orders: Vec<f64> = (1..100).map(|x| 1.0 + x as f64 / 10.0).collect();
    orders.extend((12..64).map(|a| a as f64));
    orders
}

/// RDP of `steps` compositions of the sampled Gaussian mechanism.
pub fn compute_rdp(q: f64, noise_multiplier: f64, steps: u64, orders: &[f64]) -> Vec<f64> {
    orders
        .iter()
        .map(|&alpha| rdp_sampled_gaussian(q, noise_multiplier, alpha) * steps as f64)
        .collect()
}

/// Convert RDP values to epsilon with the tight conversion.
///
/// `eps = rdp - (ln(delta) + ln(alpha)) / (alpha - 1) + ln((alpha - 1) / alpha)`,
/// minimized over orders and clamped at zero. Returns infinity when `delta`
/// is outside `(0, 1)` or no order yields a number.
pub fn rdp_to_epsilon(orders: &[f64], rdp: &[f64], delta: f64) -> (f64, Option<f64>) {
    if !delta.is_finite() || delta <= 0.0 || delta >= 1.0 {
        return (f64::INFINITY, None);
    }
    let log_delta = delta.ln();

    let mut best: Option<(f64, f64)> = None;
    for (&alpha, &r) in orders.iter().zip(rdp) {
        let eps = r - (log_delta + alpha.ln()) / (alpha - 1.0) + ((alpha - 1.0) / alpha).ln();
        if eps.is_nan() {
            continue;
        }
        if best.map_or(true, |(b, _)| eps < b) {
            best = Some((eps, alpha));
        }
    }

    match best {
        Some((eps, alpha)) => (eps.max(0.0), Some(alpha)),
        None => (f64::INFINITY, None),
    }
}

/// RDP of a single step of the sampled Gaussian mechanism at order `alpha`.
fn rdp_sampled_gaussian(q: f64, sigma: f64, alpha: f64) -> f64 {
    if q <= 0.0 {
        return 0.0;
    }
    if sigma <= 0.0 || !sigma.is_finite() {
        return f64::INFINITY;
    }
    if q >= 1.0 {
        return alpha / (2.0 * sigma * sigma);
    }
    if alpha.is_infinite() {
        return f64::INFINITY;
    }

    let log_a = if is_integer(alpha) {
        log_a_int(q, sigma, alpha.round() as u64)
    } else {
        log_a_frac(q, sigma, alpha)
    };
    log_a / (alpha - 1.0)
}

fn is_integer(x: f64) -> bool {
    (x - x.round()).abs() < 1e-12
}

/// `ln A_alpha` for integer alpha via the exact binomial expansion.
fn log_a_int(q: f64, sigma: f64, alpha: u64) -> f64 {
    let log_q = q.ln();
    let log_1mq = (1.0 - q).ln();
    let two_sigma_sq = 2.0 * sigma * sigma;

    let mut log_a = f64::NEG_INFINITY;
    for i in 0..=alpha {
        let i_f = i as f64;
        let log_coef =
            ln_binomial(alpha, i) + i_f * log_q + (alpha - i) as f64 * log_1mq;
        let s = log_coef + (i_f * i_f - i_f) / two_sigma_sq;
        log_a = log_add(log_a, s);
    }
    log_a
}

/// `ln A_alpha` for fractional alpha via the two-sided erfc series.
fn log_a_frac(q: f64, sigma: f64, alpha: f64) -> f64 {
    let sigma_sq = sigma * sigma;
    let log_q = q.ln();
    let log_1mq = (1.0 - q).ln();
    let z0 = sigma_sq * (1.0 / q - 1.0).ln() + 0.5;
    let sqrt2_sigma = std::f64::consts::SQRT_2 * sigma;

    let mut log_a0 = f64::NEG_INFINITY;
    let mut log_a1 = f64::NEG_INFINITY;
    let mut coef = 1.0_f64;

    for i in 0..MAX_SERIES_TERMS {
        let i_f = i as f64;
        if i > 0 {
            coef *= (alpha - (i_f - 1.0)) / i_f;
        }
        if coef == 0.0 {
            break;
        }
        let log_coef = coef.abs().ln();
        let j = alpha - i_f;

        let log_t0 = log_coef + i_f * log_q + j * log_1mq;
        let log_t1 = log_coef + j * log_q + i_f * log_1mq;

        let log_e0 = 0.5_f64.ln() + log_erfc((i_f - z0) / sqrt2_sigma);
        let log_e1 = 0.5_f64.ln() + log_erfc((z0 - j) / sqrt2_sigma);

        let log_s0 = log_t0 + (i_f * i_f - i_f) / (2.0 * sigma_sq) + log_e0;
        let log_s1 = log_t1 + (j * j - j) / (2.0 * sigma_sq) + log_e1;

        if coef > 0.0 {
            log_a0 = log_add(log_a0, log_s0);
            log_a1 = log_add(log_a1, log_s1);
        } else {
            log_a0 = log_sub(log_a0, log_s0);
            log_a1 = log_sub(log_a1, log_s1);
        }

        if log_s0.max(log_s1) < SERIES_CUTOFF {
            break;
        }
    }

    log_add(log_a0, log_a1)
}

/// Numerically stable `ln(exp(a) + exp(b))`.
fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Numerically stable `ln(exp(a) - exp(b))`; NaN when the result would be negative.
fn log_sub(a: f64, b: f64) -> f64 {
    if a < b {
        return f64::NAN;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    if a == b {
        return f64::NEG_INFINITY;
    }
    let diff = (a - b).exp_m1();
    if diff.is_infinite() {
        return a;
    }
    diff.ln() + b
}

/// `ln(erfc(x))`, with an asymptotic expansion once `erfc` underflows.
fn log_erfc(x: f64) -> f64 {
    let e = erfc(x);
    if e > 0.0 && e.is_finite() {
        return e.ln();
    }
    if x <= 0.0 {
        return std::f64::consts::LN_2;
    }
    let x2 = x * x;
    -x2 - x.ln() - 0.5 * std::f64::consts::PI.ln()
        + (1.0 - 1.0 / (2.0 * x2) + 3.0 / (4.0 * x2 * x2)).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_orders_layout() {
        let orders = default_orders();
        assert_eq!(orders.len(), 99 + 52);
        assert!((orders[0] - 1.1).abs() < 1e-12);
        assert!((orders[98] - 10.9).abs() < 1e-9);
        assert_eq!(*orders.last().unwrap_or(&0.0), 63.0);
    }

    #[test]
    fn full_batch_matches_gaussian_rdp() {
        let rdp = compute_rdp(1.0, 2.0, 3, &[2.0, 8.0]);
        assert!((rdp[0] - 3.0 * 2.0 / 8.0).abs() < 1e-12);
        assert!((rdp[1] - 3.0 * 8.0 / 8.0).abs() < 1e-12);
    }

    #[test]
    fn edge_cases() {
        assert_eq!(compute_rdp(0.0, 1.0, 10, &[2.0])[0], 0.0);
        assert!(compute_rdp(0.5, 0.0, 1, &[2.0])[0].is_infinite());
    }

    #[test]
    fn fractional_order_lies_between_integers() {
        let q = 0.01;
        let sigma = 1.1;
        let lo = rdp_sampled_gaussian(q, sigma, 3.0);
        let mid = rdp_sampled_gaussian(q, sigma, 3.5);
        let hi = rdp_sampled_gaussian(q, sigma, 4.0);
        assert!(lo.is_finite() && mid.is_finite() && hi.is_finite());
        assert!(lo <= mid + 1e-12 && mid <= hi + 1e-12);
    }

    #[test]
    fn integer_order_two_closed_form() {
        // A_2 = (1-q)^2 + 2q(1-q) + q^2 e^{1/sigma^2} = 1 + q^2 (e^{1/sigma^2} - 1)
        let q: f64 = 0.1;
        let sigma: f64 = 1.5;
        let expected = (1.0 + q * q * ((1.0 / (sigma * sigma)).exp() - 1.0)).ln();
        assert!((rdp_sampled_gaussian(q, sigma, 2.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn history_merges_identical_steps() {
        let mut acc = RdpAccountant::new();
        acc.step(1.0, 0.01);
        acc.step(1.0, 0.01);
        acc.step(2.0, 0.01);
        assert_eq!(acc.history().len(), 2);
        assert_eq!(acc.history()[0].num_steps, 2);

        let mut merged = RdpAccountant::new();
        merged.steps(1.0, 0.01, 2);
        merged.steps(2.0, 0.01, 1);
        assert!((acc.epsilon(1e-5) - merged.epsilon(1e-5)).abs() < 1e-12);
    }

    #[test]
    fn epsilon_increases_with_steps() {
        let mut acc = RdpAccountant::new();
        acc.step(1.0, 0.01);
        let eps1 = acc.epsilon(1e-5);
        acc.step(1.0, 0.01);
        let eps2 = acc.epsilon(1e-5);
        assert!(eps1 > 0.0);
        assert!(eps2 > eps1);
    }

    #[test]
    fn invalid_delta_is_infinite() {
        let mut acc = RdpAccountant::new();
        acc.step(1.0, 0.01);
        assert!(acc.epsilon(0.0).is_infinite());
        assert!(acc.epsilon(1.0).is_infinite());
        assert_eq!(acc.get_privacy_spent(2.0).1, None);
    }

    #[test]
    fn fresh_accountant_has_spent_nothing() {
        let acc = RdpAccountant::new();
        assert_eq!(acc.get_privacy_spent(1e-5), (0.0, None));
        assert_eq!(acc.epsilon(1e-5), 0.0);
    }

    #[test]
    fn reset_clears_history() {
        let mut acc = RdpAccountant::new();
        acc.steps(1.0, 0.1, 100);
        acc.reset();
        assert!(acc.history().is_empty());
        assert_eq!(acc.epsilon(1e-5), 0.0);
    }

    #[test]
    fn cifar_scale_run_is_in_expected_range() {
        // Noise 1.1, q = 256/60000, 60 epochs: the classic MNIST DP-SGD setting.
        let q = 256.0 / 60_000.0;
        let steps = (60.0 / q) as u64;
        let mut acc = RdpAccountant::new();
        acc.steps(1.1, q, steps);
        let (eps, order) = acc.get_privacy_spent(1e-5);
        assert!(eps > 1.5 && eps < 3.5, "eps = {eps}");
        assert!(order.is_some());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]

        #[test]
        fn more_noise_reduces_epsilon(
            noise_a in 0.5f64..5.0,
            noise_b in 0.5f64..5.0,
            steps in 1u64..500,
            q in 0.001f64..0.2,
        ) {
            let (low, high) = (noise_a.min(noise_b), noise_a.max(noise_b));
            let mut a = RdpAccountant::new();
            a.steps(low, q, steps);
            let mut b = RdpAccountant::new();
            b.steps(high, q, steps);
            prop_assert!(b.epsilon(1e-5) <= a.epsilon(1e-5) + 1e-9);
        }
    }
}
