//! Diff-and-repair over the fact catalog.
//!
//! One probe session reads every fact. With `auto_fix`, each drifted fact's
//! remedy runs as its own session, then one more probe re-checks everything
//! that was touched.

use berth_remote::RemoteShell;
use tracing::{debug, warn};

use crate::catalog::FactCatalog;
use crate::domain::{
    DeployError, FactSpec, ReconciliationReport, ReconciliationVerdict, Result, Severity, Snapshot,
    VerdictStatus,
};
use crate::obs;
use crate::probe;

pub struct Reconciler<'a> {
    shell: &'a dyn RemoteShell,
    catalog: &'a FactCatalog,
}

impl<'a> Reconciler<'a> {
    pub fn new(shell: &'a dyn RemoteShell, catalog: &'a FactCatalog) -> Self {
        Self { shell, catalog }
    }

    /// Reconcile every fact in the catalog.
    pub async fn reconcile_all(&self, address: &str, auto_fix: bool) -> Result<ReconciliationReport> {
        let specs: Vec<&FactSpec> = self.catalog.iter().collect();
        self.reconcile(address, &specs, auto_fix).await
    }

    /// Compare `desired` against the target and optionally repair.
    pub async fn reconcile(
        &self,
        address: &str,
        desired: &[&FactSpec],
        auto_fix: bool,
    ) -> Result<ReconciliationReport> {
        let before = probe::snapshot(self.shell, address, desired).await?;

        let mut verdicts = Vec::with_capacity(desired.len());
        let mut attempted: Vec<(usize, &FactSpec, Option<String>)> = Vec::new();

        for &spec in desired {
            if before.accepts(spec) {
                verdicts.push(verdict(spec, &before, VerdictStatus::Pass, false, String::new()));
                continue;
            }
            match (&spec.remedy, auto_fix) {
                (Some(remedy), true) => {
                    debug!(fact = spec.name, "applying remedy");
                    let output = self
                        .shell
                        .exec(address, remedy)
                        .await
                        .map_err(|e| DeployError::from_session(address, e))?;
                    if output.transport_failed() {
                        return Err(DeployError::Connectivity {
                            address: address.to_string(),
                            reason: output.stderr_tail(),
                        });
                    }
                    let error = (!output.success()).then(|| output.stderr_tail());
                    if let Some(e) = &error {
                        warn!(fact = spec.name, error = %e, "remedy failed");
                    }
                    attempted.push((verdicts.len(), spec, error));
                    // placeholder until the re-check below
                    verdicts.push(verdict(spec, &before, VerdictStatus::Fail, true, String::new()));
                }
                (remedy, _) => {
                    let detail = if remedy.is_some() {
                        format!("{}; `berth audit --fix` repairs it", spec.summary)
                    } else {
                        format!("{}; no automatic remedy, re-run `berth deploy`", spec.summary)
                    };
                    verdicts.push(verdict(spec, &before, drifted(spec.severity), false, detail));
                }
            }
        }

        if !attempted.is_empty() {
            let touched: Vec<&FactSpec> = attempted.iter().map(|(_, spec, _)| *spec).collect();
            let after = probe::snapshot(self.shell, address, &touched).await?;
            for (index, spec, error) in attempted {
                verdicts[index] = if after.accepts(spec) {
                    verdict(spec, &after, VerdictStatus::Fixed, true, "repaired".to_string())
                } else {
                    let detail = match error {
                        Some(e) if !e.is_empty() => format!("remedy failed: {e}"),
                        _ => "remedy ran but the fact still drifts; re-run `berth deploy`".to_string(),
                    };
                    verdict(spec, &after, drifted(spec.severity), true, detail)
                };
            }
        }

        for v in &verdicts {
            obs::emit_verdict(v);
        }
        let report = ReconciliationReport { verdicts };
        obs::emit_audit_finished(&report);
        Ok(report)
    }
}

fn drifted(severity: Severity) -> VerdictStatus {
    match severity {
        Severity::Warn => VerdictStatus::Warn,
        Severity::Fail => VerdictStatus::Fail,
    }
}

fn verdict(
    spec: &FactSpec,
    snapshot: &Snapshot,
    status: VerdictStatus,
    remediation_applied: bool,
    detail: String,
) -> ReconciliationVerdict {
    ReconciliationVerdict {
        fact: spec.name.to_string(),
        status,
        remediation_applied,
        expected: spec.expected.describe(),
        observed: if spec.reveal_value {
            snapshot.get(spec.name).map(str::to_string)
        } else {
            None
        },
        detail,
    }
}
