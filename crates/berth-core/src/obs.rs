//! Lifecycle events of deploy and audit runs.
//!
//! Every helper logs one `info!` (or `warn!`) line with a stable `event` field
//! so runs can be followed in JSON logs. [`RunSpan`] ties them to a run id.

use tracing::{info, warn};

use crate::domain::{PhaseResult, ReconciliationReport, ReconciliationVerdict, VerdictStatus};

/// RAII guard holding a run-scoped span (`berth.run`, `run_id`, `operation`).
pub struct RunSpan {
    run_id: String,
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Enter a span with a fresh v4 run id.
    pub fn start(operation: &str, identity: &str) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "berth.run",
            run_id = %run_id,
            operation = %operation,
            identity = %identity
        );
        Self {
            run_id,
            _span: span.entered(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

pub fn emit_deploy_started(identity: &str) {
    info!(event = "deploy.started", identity = %identity);
}

pub fn emit_deploy_finished(identity: &str, address: &str, applied: usize, duration_ms: u64) {
    info!(
        event = "deploy.finished",
        identity = %identity,
        address = %address,
        applied = applied,
        duration_ms = duration_ms,
    );
}

pub fn emit_target_resolved(identity: &str, address: &str, existed: bool) {
    info!(event = "target.resolved", identity = %identity, address = %address, existed = existed);
}

pub fn emit_shape_drift(attribute: &str, configured: &str, actual: &str) {
    warn!(
        event = "target.shape_drift",
        attribute = %attribute,
        configured = %configured,
        actual = %actual,
        "adopted instance differs from the configured shape; it is not reshaped"
    );
}

/// Never logs the secret itself.
pub fn emit_credential_resolved(slot: &str, provenance: &str, path: &str) {
    info!(event = "credential.resolved", slot = %slot, provenance = %provenance, path = %path);
}

pub fn emit_phase_started(phase: &str) {
    info!(event = "phase.started", phase = %phase);
}

pub fn emit_phase_finished(result: &PhaseResult) {
    info!(
        event = "phase.finished",
        phase = %result.phase,
        outcome = result.outcome.as_str(),
        elapsed_ms = result.duration_ms,
    );
}

pub fn emit_verdict(verdict: &ReconciliationVerdict) {
    match verdict.status {
        VerdictStatus::Pass | VerdictStatus::Fixed => info!(
            event = "verdict.recorded",
            fact = %verdict.fact,
            status = verdict.status.as_str(),
            remediation_applied = verdict.remediation_applied,
        ),
        VerdictStatus::Warn | VerdictStatus::Fail => warn!(
            event = "verdict.recorded",
            fact = %verdict.fact,
            status = verdict.status.as_str(),
            remediation_applied = verdict.remediation_applied,
            detail = %verdict.detail,
        ),
    }
}

pub fn emit_audit_finished(report: &ReconciliationReport) {
    info!(
        event = "audit.finished",
        pass = report.pass_count(),
        warn = report.warn_count(),
        fail = report.fail_count(),
        fixed = report.fixed_count(),
    );
}

pub fn emit_smoke_result(signal: &str, ready: bool, elapsed_ms: u64) {
    if ready {
        info!(event = "smoke.ready", signal = %signal, elapsed_ms = elapsed_ms);
    } else {
        warn!(
            event = "smoke.warming_up",
            signal = %signal,
            elapsed_ms = elapsed_ms,
            "still warming up; not treated as a failure"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_ids_are_unique() {
        let a = RunSpan::start("deploy", "prod");
        let a_id = a.run_id().to_string();
        drop(a);
        let b = RunSpan::start("audit", "prod");
        assert_ne!(a_id, b.run_id());
        assert_eq!(b.run_id().len(), 36);
    }
}
