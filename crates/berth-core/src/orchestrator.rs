//! Phase orchestrator
//!
//! Runs a fixed, ordered list of phases against one target. Before acting,
//! each phase probes the facts it owns in one session and is skipped when they
//! all read as expected. The first failure stops the remaining phases; nothing
//! already applied is undone.

use async_trait::async_trait;
use berth_remote::{RemoteShell, Script};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::warn;

use crate::catalog::FactCatalog;
use crate::config::Config;
use crate::domain::{DeployError, PhaseResult, Provenance, Result, Snapshot};
use crate::obs;
use crate::probe;

/// Everything a phase may touch.
pub struct PhaseContext<'a> {
    pub shell: &'a dyn RemoteShell,
    pub address: &'a str,
    pub config: &'a Config,
    pub catalog: &'a FactCatalog,
    /// Provenance of every credential slot resolved in this run.
    pub credentials: &'a BTreeMap<String, Provenance>,
}

impl PhaseContext<'_> {
    /// Run `script` as one session on behalf of `phase`. A dropped session is
    /// a connectivity error, anything else the script reports is the phase's.
    pub async fn execute(&self, phase: &str, script: &Script) -> Result<()> {
        let output = self
            .shell
            .exec(self.address, script)
            .await
            .map_err(|e| match DeployError::from_session(self.address, e) {
                DeployError::Remote(other) => phase_error(phase, other.to_string()),
                connectivity => connectivity,
            })?;
        if output.transport_failed() {
            return Err(DeployError::Connectivity {
                address: self.address.to_string(),
                reason: output.stderr_tail(),
            });
        }
        if !output.success() {
            let tail = output.stderr_tail();
            let message = if tail.is_empty() {
                format!("`{}` exited with {}", script.label(), output.exit_code)
            } else {
                format!("`{}`: {tail}", script.label())
            };
            return Err(phase_error(phase, message));
        }
        Ok(())
    }
}

pub(crate) fn phase_error(phase: &str, message: impl Into<String>) -> DeployError {
    DeployError::PhaseApply {
        phase: phase.to_string(),
        message: message.into(),
    }
}

/// One idempotent provisioning step.
#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &'static str;

    /// Catalog facts that say whether this phase is done.
    fn facts(&self) -> Vec<&'static str>;

    /// Every owned fact is accepted in `snapshot`.
    fn is_satisfied(&self, snapshot: &Snapshot, catalog: &FactCatalog) -> bool {
        catalog
            .select(&self.facts())
            .iter()
            .all(|spec| snapshot.accepts(spec))
    }

    /// Bring the owned facts to their expected values; returns a detail line.
    async fn apply(&self, ctx: &PhaseContext<'_>, snapshot: &Snapshot) -> Result<String>;
}

/// Results of one orchestrator run.
#[derive(Debug)]
pub struct OrchestrationReport {
    pub results: Vec<PhaseResult>,
    /// Error that stopped the run, if any.
    pub error: Option<DeployError>,
}

impl OrchestrationReport {
    pub fn applied(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == crate::domain::PhaseOutcome::Applied)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// Results, or the error that stopped the run wrapped with every phase
    /// that ran before it.
    pub fn into_result(self) -> Result<Vec<PhaseResult>> {
        match self.error {
            Some(cause) => Err(DeployError::Halted {
                phases: self.results,
                cause: Box::new(cause),
            }),
            None => Ok(self.results),
        }
    }
}

pub struct Orchestrator {
    phases: Vec<Box<dyn Phase>>,
}

impl Orchestrator {
    pub fn new(phases: Vec<Box<dyn Phase>>) -> Self {
        Self { phases }
    }

    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.name()).collect()
    }

    /// Run every phase in order against `ctx.address`.
    pub async fn run(&self, ctx: &PhaseContext<'_>) -> OrchestrationReport {
        let mut results = Vec::with_capacity(self.phases.len());
        for phase in &self.phases {
            let name = phase.name();
            obs::emit_phase_started(name);
            let start = Instant::now();

            match self.run_phase(phase.as_ref(), ctx).await {
                Ok(Some(detail)) => {
                    let result = PhaseResult::applied(name, detail, elapsed_ms(start));
                    obs::emit_phase_finished(&result);
                    results.push(result);
                }
                Ok(None) => {
                    let result = PhaseResult::skipped(name, elapsed_ms(start));
                    obs::emit_phase_finished(&result);
                    results.push(result);
                }
                Err(e) => {
                    let result = PhaseResult::failed(name, e.to_string(), elapsed_ms(start));
                    obs::emit_phase_finished(&result);
                    warn!(phase = name, error = %e, "phase failed; remaining phases skipped");
                    results.push(result);
                    return OrchestrationReport {
                        results,
                        error: Some(e),
                    };
                }
            }
        }
        OrchestrationReport {
            results,
            error: None,
        }
    }

    /// `Ok(None)` when skipped, `Ok(Some(detail))` when applied.
    async fn run_phase(&self, phase: &dyn Phase, ctx: &PhaseContext<'_>) -> Result<Option<String>> {
        let name = phase.name();
        let specs = ctx.catalog.select(&phase.facts());
        let snapshot = probe::snapshot(ctx.shell, ctx.address, &specs)
            .await
            .map_err(|e| match e {
                DeployError::Connectivity { .. } => e,
                other => phase_error(name, format!("probe failed: {other}")),
            })?;

        if phase.is_satisfied(&snapshot, ctx.catalog) {
            return Ok(None);
        }

        let detail = phase.apply(ctx, &snapshot).await.map_err(|e| match e {
            DeployError::PhaseApply { .. } | DeployError::Connectivity { .. } => e,
            other => phase_error(name, other.to_string()),
        })?;
        Ok(Some(detail))
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
