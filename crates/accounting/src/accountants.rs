//! A common interface over the available privacy accountants.

use std::fmt;
use std::str::FromStr;

use dpresnet_core::DpError;

use crate::gdp::GdpAccountant;
use crate::rdp::{HistoryEntry, RdpAccountant};

/// Tracks privacy spent by a sequence of DP-SGD steps.
pub trait PrivacyAccountant: Send + fmt::Debug {
    /// Short name of the accounting method.
    fn mechanism(&self) -> &'static str;

    /// Record `n` steps with the given noise multiplier and sample rate.
    fn steps(&mut self, noise_multiplier: f64, sample_rate: f64, n: u64);

    /// Record one step.
    fn step(&mut self, noise_multiplier: f64, sample_rate: f64) {
        self.steps(noise_multiplier, sample_rate, 1);
    }

    /// Epsilon spent so far at `delta`.
    fn epsilon(&self, delta: f64) -> f64;

    /// Recorded history.
    fn history(&self) -> &[HistoryEntry];

    /// Total number of recorded steps.
    fn num_steps(&self) -> u64 {
        self.history().iter().map(|e| e.num_steps).sum()
    }

    /// Forget every recorded step.
    fn reset(&mut self);
}

impl PrivacyAccountant for RdpAccountant {
    fn mechanism(&self) -> &'static str {
        "rdp"
    }

    fn steps(&mut self, noise_multiplier: f64, sample_rate: f64, n: u64) {
        RdpAccountant::steps(self, noise_multiplier, sample_rate, n);
    }

    fn epsilon(&self, delta: f64) -> f64 {
        RdpAccountant::epsilon(self, delta)
    }

    fn history(&self) -> &[HistoryEntry] {
        RdpAccountant::history(self)
    }

    fn reset(&mut self) {
        RdpAccountant::reset(self);
    }
}

impl PrivacyAccountant for GdpAccountant {
    fn mechanism(&self) -> &'static str {
        "gdp"
    }

    fn steps(&mut self, noise_multiplier: f64, sample_rate: f64, n: u64) {
        GdpAccountant::steps(self, noise_multiplier, sample_rate, n);
    }

    fn epsilon(&self, delta: f64) -> f64 {
        GdpAccountant::epsilon(self, delta)
    }

    fn history(&self) -> &[HistoryEntry] {
        GdpAccountant::history(self)
    }

    fn reset(&mut self) {
        GdpAccountant::reset(self);
    }
}

/// Which accountant to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccountantKind {
    /// Rényi DP with the tight conversion.
    #[default]
    Rdp,
    /// Gaussian DP (central-limit approximation).
    Gdp,
}

impl AccountantKind {
    /// Create a fresh accountant of this kind.
    pub fn create(self) -> Box<dyn PrivacyAccountant> {
        match self {
            AccountantKind::Rdp => Box::new(RdpAccountant::new()),
            AccountantKind::Gdp => Box::new(GdpAccountant::new()),
        }
    }
}

impl fmt::Display for AccountantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountantKind::Rdp => f.write_str("rdp"),
            AccountantKind::Gdp => f.write_str("gdp"),
        }
    }
}

impl FromStr for AccountantKind {
    type Err = DpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rdp" => Ok(AccountantKind::Rdp),
            "gdp" => Ok(AccountantKind::Gdp),
            other => Err(DpError::config(format!("unknown accountant '{other}'"))),
        }
    }
}
