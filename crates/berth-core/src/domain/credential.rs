//! Credential records and their provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum length of a usable secret.
pub const MIN_SECRET_LEN: usize = 32;

/// Where the secret in force came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Read back from the target's own configuration.
    RecoveredFromTarget,
    /// The target had lost it; the locally escrowed secret was written back.
    RestoredFromEscrow,
    /// Supplied by configuration and written over whatever the target had.
    Configured,
    /// Freshly minted for this target.
    NewlyGenerated,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::RecoveredFromTarget => "recovered-from-target",
            Provenance::RestoredFromEscrow => "restored-from-escrow",
            Provenance::Configured => "configured",
            Provenance::NewlyGenerated => "newly-generated",
        }
    }

    /// Whether resolving this record changed the target.
    pub fn changed_target(&self) -> bool {
        !matches!(self, Provenance::RecoveredFromTarget)
    }
}

/// A secret plus where it came from.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Slot name (`gateway`, `hook`).
    pub slot: String,
    pub identity: String,
    pub secret: String,
    pub provenance: Provenance,
    /// Address of the target when the record was persisted.
    pub address: String,
    pub persisted_at: DateTime<Utc>,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("slot", &self.slot)
            .field("identity", &self.identity)
            .field("secret", &"***")
            .field("provenance", &self.provenance)
            .field("address", &self.address)
            .field("persisted_at", &self.persisted_at)
            .finish()
    }
}

/// Whether `secret` is usable: long enough and limited to `[A-Za-z0-9_-]`.
pub fn is_well_formed_secret(secret: &str) -> bool {
    secret.len() >= MIN_SECRET_LEN
        && secret
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
