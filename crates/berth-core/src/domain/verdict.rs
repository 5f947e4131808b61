//! Reconciliation verdicts and their run-level aggregate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Warn,
    Fail,
    Fixed,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Pass => "pass",
            VerdictStatus::Warn => "warn",
            VerdictStatus::Fail => "fail",
            VerdictStatus::Fixed => "fixed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationVerdict {
    pub fact: String,
    pub status: VerdictStatus,
    pub remediation_applied: bool,
    pub expected: String,
    /// Observed value; `None` when it is a secret or was never reported.
    pub observed: Option<String>,
    pub detail: String,
}

/// All verdicts of one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub verdicts: Vec<ReconciliationVerdict>,
}

impl ReconciliationReport {
    fn count(&self, status: VerdictStatus) -> usize {
        self.verdicts.iter().filter(|v| v.status == status).count()
    }

    pub fn pass_count(&self) -> usize {
        self.count(VerdictStatus::Pass)
    }

    pub fn warn_count(&self) -> usize {
        self.count(VerdictStatus::Warn)
    }

    pub fn fail_count(&self) -> usize {
        self.count(VerdictStatus::Fail)
    }

    pub fn fixed_count(&self) -> usize {
        self.count(VerdictStatus::Fixed)
    }

    /// Facts still failing after optional repair.
    pub fn failing(&self) -> Vec<String> {
        self.verdicts
            .iter()
            .filter(|v| v.status == VerdictStatus::Fail)
            .map(|v| v.fact.clone())
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.fail_count() > 0
    }

    /// Process exit code: non-zero iff unresolved `fail` verdicts remain.
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            1
        } else {
            0
        }
    }

    pub fn get(&self, fact: &str) -> Option<&ReconciliationVerdict> {
        self.verdicts.iter().find(|v| v.fact == fact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(fact: &str, status: VerdictStatus) -> ReconciliationVerdict {
        ReconciliationVerdict {
            fact: fact.to_string(),
            status,
            remediation_applied: status == VerdictStatus::Fixed,
            expected: "yes".to_string(),
            observed: Some("yes".to_string()),
            detail: String::new(),
        }
    }

    #[test]
    fn test_exit_code_ignores_warn_and_fixed() {
        let report = ReconciliationReport {
            verdicts: vec![
                verdict("a", VerdictStatus::Pass),
                verdict("b", VerdictStatus::Warn),
                verdict("c", VerdictStatus::Fixed),
            ],
        };
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.warn_count(), 1);
        assert_eq!(report.fixed_count(), 1);
    }

    #[test]
    fn test_exit_code_on_unresolved_fail() {
        let report = ReconciliationReport {
            verdicts: vec![
                verdict("a", VerdictStatus::Pass),
                verdict("gateway-active", VerdictStatus::Fail),
            ],
        };
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failing(), vec!["gateway-active".to_string()]);
    }
}
