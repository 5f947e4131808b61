//! Phase results, reported and never persisted.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    SkippedAlreadySatisfied,
    Applied,
    Failed,
}

impl PhaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseOutcome::SkippedAlreadySatisfied => "skipped-already-satisfied",
            PhaseOutcome::Applied => "applied",
            PhaseOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: String,
    pub outcome: PhaseOutcome,
    pub detail: String,
    pub duration_ms: u64,
}

impl PhaseResult {
    pub fn skipped(phase: &str, duration_ms: u64) -> Self {
        Self {
            phase: phase.to_string(),
            outcome: PhaseOutcome::SkippedAlreadySatisfied,
            detail: "already satisfied".to_string(),
            duration_ms,
        }
    }

    pub fn applied(phase: &str, detail: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            phase: phase.to_string(),
            outcome: PhaseOutcome::Applied,
            detail: detail.into(),
            duration_ms,
        }
    }

    pub fn failed(phase: &str, detail: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            phase: phase.to_string(),
            outcome: PhaseOutcome::Failed,
            detail: detail.into(),
            duration_ms,
        }
    }
}
