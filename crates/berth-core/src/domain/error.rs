//! Domain-level error taxonomy for Berth.

use berth_remote::RemoteError;

use super::phase::PhaseResult;

/// Berth engine errors.
///
/// Prerequisite and connectivity errors stop the whole operation before any
/// mutation; a phase error stops only the remaining phases and never undoes
/// the ones already applied.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("missing prerequisite: {0}")]
    Prerequisite(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no target found for identity {0}")]
    TargetAbsent(String),

    #[error("target {address} unreachable: {reason}")]
    Connectivity { address: String, reason: String },

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("credential {slot} could not be secured: {message}")]
    Credential { slot: String, message: String },

    #[error("phase {phase} failed: {message}")]
    PhaseApply { phase: String, message: String },

    #[error("{} fact(s) still failing: {}", facts.len(), facts.join(", "))]
    ReconciliationFailure { facts: Vec<String> },

    /// A deploy stopped part way; `phases` holds every phase that ran,
    /// the failed one last.
    #[error("{cause}")]
    Halted {
        phases: Vec<PhaseResult>,
        cause: Box<DeployError>,
    },

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Map a failed session on `address`: a dropped or timed out transport
    /// is a connectivity error.
    pub fn from_session(address: &str, err: RemoteError) -> Self {
        match err {
            RemoteError::SessionFailed { message, .. } => DeployError::Connectivity {
                address: address.to_string(),
                reason: message,
            },
            RemoteError::Timeout { secs, .. } => DeployError::Connectivity {
                address: address.to_string(),
                reason: format!("session timed out after {secs}s"),
            },
            other => DeployError::Remote(other),
        }
    }

    /// The error beneath any [`DeployError::Halted`] wrapper.
    pub fn root_cause(&self) -> &DeployError {
        match self {
            DeployError::Halted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Actionable hint printed next to a fatal error.
    pub fn remediation(&self) -> String {
        match self {
            DeployError::Halted { cause, .. } => cause.remediation(),
            DeployError::Prerequisite(_) => {
                "install or configure the missing prerequisite, then re-run the same command"
                    .to_string()
            }
            DeployError::Config(_) => {
                "fix the configuration file or flags, then re-run the same command".to_string()
            }
            DeployError::TargetAbsent(_) => {
                "run `berth deploy` first to create the target".to_string()
            }
            DeployError::Connectivity { .. } => {
                "check the instance and your network, then re-run the same command; it resumes from here"
                    .to_string()
            }
            DeployError::Provisioning(_) => {
                "re-run the same command; an instance that came up late is adopted instead of recreated"
                    .to_string()
            }
            DeployError::Credential { .. } => {
                "fix access to the target or the local state directory and re-run; no phase ran without a stored credential"
                    .to_string()
            }
            DeployError::PhaseApply { .. } => {
                "re-run the same command; completed phases are skipped and it resumes from here"
                    .to_string()
            }
            DeployError::ReconciliationFailure { .. } => {
                "run `berth audit --fix`, or `berth deploy` to re-apply every phase".to_string()
            }
            DeployError::Remote(RemoteError::CloudTokenMissing) => {
                "export DIGITALOCEAN_TOKEN or set cloud.token in the config file".to_string()
            }
            DeployError::Remote(RemoteError::SshNotFound) => {
                "install an OpenSSH client".to_string()
            }
            DeployError::Remote(_) | DeployError::Serialization(_) | DeployError::Io(_) => {
                "re-run the same command; every phase is safe to re-enter".to_string()
            }
        }
    }

    /// Whether the error was raised before any remote mutation could happen.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            DeployError::Prerequisite(_)
                | DeployError::Config(_)
                | DeployError::Remote(RemoteError::CloudTokenMissing)
                | DeployError::Remote(RemoteError::SshNotFound)
        )
    }
}

/// Result type for Berth engine operations.
pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_error_points_at_resume() {
        let err = DeployError::PhaseApply {
            phase: "companion-dashboard".to_string(),
            message: "git clone failed".to_string(),
        };
        assert!(err.to_string().contains("companion-dashboard"));
        assert!(err.remediation().contains("resumes from here"));
    }

    #[test]
    fn test_reconciliation_failure_lists_facts() {
        let err = DeployError::ReconciliationFailure {
            facts: vec!["gateway-active".to_string(), "firewall-active".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 fact(s)"));
        assert!(msg.contains("gateway-active, firewall-active"));
    }

    #[test]
    fn test_dropped_session_is_connectivity() {
        let err = DeployError::from_session(
            "203.0.113.10",
            RemoteError::Timeout {
                address: "203.0.113.10".to_string(),
                secs: 900,
            },
        );
        assert!(matches!(err, DeployError::Connectivity { ref reason, .. } if reason.contains("900s")));
        assert!(err.remediation().contains("resumes from here"));
        assert!(matches!(
            DeployError::from_session("x", RemoteError::MalformedProbe("x".into())),
            DeployError::Remote(_)
        ));
    }

    #[test]
    fn test_halted_reads_as_its_cause() {
        let err = DeployError::Halted {
            phases: vec![PhaseResult::failed("firewall", "ufw missing", 3)],
            cause: Box::new(DeployError::PhaseApply {
                phase: "firewall".to_string(),
                message: "ufw missing".to_string(),
            }),
        };
        assert_eq!(err.to_string(), "phase firewall failed: ufw missing");
        assert!(matches!(err.root_cause(), DeployError::PhaseApply { .. }));
        assert!(err.remediation().contains("resumes from here"));
        assert!(!err.is_preflight());
    }

    #[test]
    fn test_missing_cloud_token_is_preflight() {
        let err = DeployError::from(RemoteError::CloudTokenMissing);
        assert!(err.is_preflight());
        assert!(err.remediation().contains("DIGITALOCEAN_TOKEN"));
        assert!(!DeployError::Provisioning("x".into()).is_preflight());
    }
}
