//! Classification loss.

use dpresnet_core::{DpError, Result, Scalar};
use ndarray::Array1;

/// Numerically stable log-softmax.
pub fn log_softmax(logits: &Array1<Scalar>) -> Array1<Scalar> {
    let max = logits.fold(Scalar::NEG_INFINITY, |m, &v| m.max(v));
    let shifted = logits.mapv(|v| v - max);
    let log_sum = shifted.mapv(Scalar::exp).sum().ln();
    shifted.mapv(|v| v - log_sum)
}

/// Cross-entropy of one example and its gradient with respect to the logits.
///
/// The gradient is `softmax(logits) - onehot(label)`.
pub fn cross_entropy(logits: &Array1<Scalar>, label: usize) -> Result<(f64, Array1<Scalar>)> {
    if label >= logits.len() {
        return Err(DpError::invalid(format!(
            "label {label} out of range for {} classes",
            logits.len()
        )));
    }
    let log_probs = log_softmax(logits);
    let loss = -(log_probs[label] as f64);
    let mut grad = log_probs.mapv(Scalar::exp);
    grad[label] -= 1.0;
    Ok((loss, grad))
}

/// Index of the largest logit; the first one wins ties.
pub fn argmax(logits: &Array1<Scalar>) -> usize {
    let mut best = 0;
    for (i, &v) in logits.iter().enumerate() {
        if v > logits[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn uniform_logits_give_log_classes() {
        let (loss, grad) = cross_entropy(&array![0.0, 0.0, 0.0, 0.0], 2).expect("valid label");
        assert!((loss - 4.0_f64.ln()).abs() < 1e-6);
        assert!((grad[2] + 0.75).abs() < 1e-6);
        assert!((grad[0] - 0.25).abs() < 1e-6);
        assert!(grad.sum().abs() < 1e-6);
    }

    #[test]
    fn large_logits_stay_finite() {
        let (loss, grad) = cross_entropy(&array![1000.0, -1000.0], 1).expect("valid label");
        assert!(loss.is_finite());
        assert!((loss - 2000.0).abs() < 1e-3);
        assert!(grad.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn rejects_out_of_range_label() {
        assert!(cross_entropy(&array![1.0, 2.0], 2).is_err());
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&array![0.1, 0.7, 0.7]), 1);
        assert_eq!(argmax(&array![-1.0]), 0);
    }
}
