//! The managed remote instance.

use serde::{Deserialize, Serialize};

/// Lifecycle of a target as far as this engine knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Absent,
    Creating,
    Reachable,
    Converged,
}

/// The single compute instance behind a deployment identity.
///
/// Lifecycle state is written only by the resolver; everything else reads
/// the address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub identity: String,
    pub instance_id: String,
    pub address: String,
    state: LifecycleState,
}

impl Target {
    pub(crate) fn new(
        identity: impl Into<String>,
        instance_id: impl Into<String>,
        address: impl Into<String>,
        state: LifecycleState,
    ) -> Self {
        Self {
            identity: identity.into(),
            instance_id: instance_id.into(),
            address: address.into(),
            state,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }
}

/// One attribute where an adopted instance differs from the configured shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDrift {
    pub attribute: String,
    pub configured: String,
    pub actual: String,
}

/// Outcome of resolving an identity to a target.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub target: Target,
    /// The instance already existed and was adopted.
    pub existed: bool,
    /// Differences between the adopted instance and the configured shape.
    pub shape_drift: Vec<ShapeDrift>,
}
