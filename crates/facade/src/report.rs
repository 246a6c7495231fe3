//! Experiment records and the published results table.

use std::fs;
use std::path::Path;

use dpresnet_core::{DpError, Result};
use serde::{Deserialize, Serialize};

use crate::trainer::EpochMetrics;

/// Outcome of one training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Target epsilon.
    pub epsilon: f64,
    /// Target delta.
    pub delta: f64,
    /// Per-example clipping threshold.
    pub clipping_threshold: f64,
    /// Learning rate.
    pub step_size: f64,
    /// Mean test loss.
    pub test_loss: f64,
    /// Test accuracy in percent.
    pub test_accuracy: f64,
    /// Calibrated noise multiplier, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_multiplier: Option<f64>,
    /// Training epochs.
    pub epochs: usize,
    /// Epsilon actually spent, from the accountant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spent_epsilon: Option<f64>,
    /// Per-epoch training metrics.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<EpochMetrics>,
}

impl ExperimentRecord {
    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| DpError::config(e.to_string()))
    }

    /// Write the record as JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read a record written by [`ExperimentRecord::write_json`].
    pub fn read_json(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| DpError::config(format!("invalid record: {e}")))
    }
}

fn published(epsilon: f64, test_loss: f64, test_accuracy: f64) -> ExperimentRecord {
    ExperimentRecord {
        epsilon,
        delta: 1e-5,
        clipping_threshold: 1.2,
        step_size: 1e-3,
        test_loss,
        test_accuracy,
        noise_multiplier: None,
        epochs: 20,
        spent_epsilon: None,
        history: Vec::new(),
    }
}

/// The reference runs of ResNet-18 with RMSprop on CIFAR-10.
pub fn published_results() -> Vec<ExperimentRecord> {
    vec![
        published(50.0, 1.743414, 60.09),
        published(10.0, 1.775980, 55.93),
        published(5.0, 1.769377, 51.40),
    ]
}

/// Check that a set of runs is internally consistent.
///
/// Losses must be positive and finite and accuracies inside (0, 100). All
/// runs must share delta and the clipping threshold. Accuracy must fall
/// strictly as epsilon shrinks.
pub fn check_consistency(records: &[ExperimentRecord]) -> Result<()> {
    for r in records {
        if !(r.test_loss.is_finite() && r.test_loss > 0.0) {
            return Err(DpError::invalid(format!(
                "eps={}: test loss {} is not positive",
                r.epsilon, r.test_loss
            )));
        }
        if !(r.test_accuracy > 0.0 && r.test_accuracy < 100.0) {
            return Err(DpError::invalid(format!(
                "eps={}: accuracy {} outside (0, 100)",
                r.epsilon, r.test_accuracy
            )));
        }
    }
    if let Some(first) = records.first() {
        if records
            .iter()
            .any(|r| r.delta != first.delta || r.clipping_threshold != first.clipping_threshold)
        {
            return Err(DpError::invalid("runs use different delta or clipping threshold"));
        }
    }

    let mut sorted: Vec<&ExperimentRecord> = records.iter().collect();
    sorted.sort_by(|a, b| b.epsilon.total_cmp(&a.epsilon));
    for pair in sorted.windows(2) {
        if pair[1].test_accuracy >= pair[0].test_accuracy {
            return Err(DpError::invalid(format!(
                "accuracy at eps={} ({}) is not below accuracy at eps={} ({})",
                pair[1].epsilon, pair[1].test_accuracy, pair[0].epsilon, pair[0].test_accuracy
            )));
        }
    }
    Ok(())
}

/// Render runs as a markdown table, largest epsilon first.
pub fn markdown_table(records: &[ExperimentRecord]) -> String {
    let mut sorted: Vec<&ExperimentRecord> = records.iter().collect();
    sorted.sort_by(|a, b| b.epsilon.total_cmp(&a.epsilon));
    let mut out = String::from("| ε | test loss | test accuracy (%) |\n|---|---|---|\n");
    for r in sorted {
        out.push_str(&format!(
            "| {} | {:.6} | {:.2} |\n",
            r.epsilon, r.test_loss, r.test_accuracy
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_rows_are_consistent() {
        let rows = published_results();
        assert_eq!(rows.len(), 3);
        check_consistency(&rows).expect("published rows are consistent");
        assert!(rows.iter().all(|r| r.delta == 1e-5 && r.clipping_threshold == 1.2));
    }

    #[test]
    fn table_lists_rows_by_decreasing_epsilon() {
        let mut rows = published_results();
        rows.reverse();
        let table = markdown_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[2], "| 50 | 1.743414 | 60.09 |");
        assert_eq!(lines[4], "| 5 | 1.769377 | 51.40 |");
    }

    #[test]
    fn inconsistent_rows_are_rejected() {
        let mut rows = published_results();
        rows[2].test_accuracy = 70.0;
        assert!(check_consistency(&rows).is_err());

        let mut rows = published_results();
        rows[0].delta = 1e-6;
        assert!(check_consistency(&rows).is_err());

        let mut rows = published_results();
        rows[1].test_loss = f64::NAN;
        assert!(check_consistency(&rows).is_err());
    }

    #[test]
    fn json_round_trip_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("record.json");
        let record = published_results().remove(0);
        record.write_json(&path).expect("write");
        assert_eq!(ExperimentRecord::read_json(&path).expect("read"), record);
        let text = record.to_json().expect("json");
        assert!(!text.contains("noise_multiplier"));
    }

    #[test]
    fn json_keeps_every_float_bit() {
        let mut record = published_results().remove(0);
        record.spent_epsilon = Some(49.996928189483484);
        record.noise_multiplier = Some(0.35412345678901234);
        let text = record.to_json().expect("json");
        let back: ExperimentRecord = serde_json::from_str(&text).expect("parse");
        assert_eq!(back.spent_epsilon, Some(49.996928189483484));
        assert_eq!(back, record);
    }
}
