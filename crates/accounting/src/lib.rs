//! Privacy accounting for differentially private training.
//!
//! Two accountants are provided for the Poisson-subsampled Gaussian
//! mechanism: Rényi DP ([`RdpAccountant`]) and Gaussian DP
//! ([`GdpAccountant`]). [`get_noise_multiplier`] searches for the noise
//! level that meets a target budget.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accountants;
pub mod calibrate;
pub mod gdp;
pub mod rdp;

pub use accountants::{AccountantKind, PrivacyAccountant};
pub use calibrate::{
    epsilon_for, get_noise_multiplier, steps_for_epochs, DEFAULT_EPSILON_TOLERANCE, MAX_SIGMA,
};
pub use gdp::{eps_from_mu, mu_poisson, GdpAccountant};
pub use rdp::{compute_rdp, default_orders, rdp_to_epsilon, HistoryEntry, RdpAccountant};

/// Common imports for privacy accounting.
pub mod prelude {
    pub use crate::{
        compute_rdp, default_orders, epsilon_for, get_noise_multiplier, rdp_to_epsilon,
        steps_for_epochs, AccountantKind, GdpAccountant, HistoryEntry, PrivacyAccountant,
        RdpAccountant,
    };
}
