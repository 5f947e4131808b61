//! Domain model: targets, credentials, facts, phase results and verdicts.

pub mod credential;
pub mod error;
pub mod fact;
pub mod phase;
pub mod target;
pub mod verdict;

pub use credential::{is_well_formed_secret, CredentialRecord, Provenance, MIN_SECRET_LEN};
pub use error::{DeployError, Result};
pub use fact::{Expectation, FactSpec, Severity, Snapshot, YES};
pub use phase::{PhaseOutcome, PhaseResult};
pub use target::{LifecycleState, Resolution, ShapeDrift, Target};
pub use verdict::{ReconciliationReport, ReconciliationVerdict, VerdictStatus};
