//! Deploy and audit flows.
//!
//! [`Engine`] wires the resolver, credential policy, orchestrator, reconciler
//! and smoke verifier together for one identity. Every flow validates the
//! configuration before it touches the cloud or the target.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use berth_remote::{CloudApi, Instance, RemoteShell};
use serde::Serialize;
use tracing::info;

use crate::catalog::FactCatalog;
use crate::config::{secs, Config};
use crate::credential::{
    CredentialResolver, CredentialSlot, CredentialStore, ResolvedCredential, SecretGenerator,
};
use crate::domain::{
    CredentialRecord, DeployError, PhaseResult, Provenance, ReconciliationReport,
    ReconciliationVerdict, Result, ShapeDrift, Target, VerdictStatus,
};
use crate::obs::{self, RunSpan};
use crate::orchestrator::{Orchestrator, PhaseContext};
use crate::phases::standard_phases;
use crate::reconciler::Reconciler;
use crate::resolver::Resolver;
use crate::smoke::{deploy_signals, Readiness, SmokeVerifier};

/// Verdict name for the adopted instance's shape.
pub const INSTANCE_SHAPE: &str = "instance-shape";

#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
    /// Replace every generated secret instead of recovering it.
    pub rotate_credentials: bool,
}

/// What one deploy did.
#[derive(Debug)]
pub struct DeploySummary {
    pub run_id: String,
    pub target: Target,
    pub existed: bool,
    pub shape_drift: Vec<ShapeDrift>,
    pub credentials: Vec<ResolvedCredential>,
    pub phases: Vec<PhaseResult>,
    pub smoke: Vec<Readiness>,
    pub duration_ms: u64,
}

impl DeploySummary {
    pub fn applied(&self) -> usize {
        self.phases
            .iter()
            .filter(|r| r.outcome == crate::domain::PhaseOutcome::Applied)
            .count()
    }

    /// Every smoke signal came up inside the window.
    pub fn warmed_up(&self) -> bool {
        self.smoke.iter().all(|r| r.ready)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditSummary {
    pub run_id: String,
    pub target: Target,
    pub report: ReconciliationReport,
}

/// Escrow state of one slot as seen from this machine.
#[derive(Debug, Clone)]
pub struct EscrowEntry {
    pub slot: String,
    pub path: PathBuf,
    pub provenance: Option<Provenance>,
}

#[derive(Debug, Clone)]
pub struct StatusSummary {
    /// `None` when no instance carries the identity tag.
    pub target: Option<Target>,
    pub shape_drift: Vec<ShapeDrift>,
    pub escrow: Vec<EscrowEntry>,
}

pub struct Engine<'a> {
    config: &'a Config,
    cloud: &'a dyn CloudApi,
    shell: &'a dyn RemoteShell,
    generator: &'a dyn SecretGenerator,
    store: CredentialStore,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a Config,
        cloud: &'a dyn CloudApi,
        shell: &'a dyn RemoteShell,
        generator: &'a dyn SecretGenerator,
    ) -> Self {
        Self {
            config,
            cloud,
            shell,
            generator,
            store: CredentialStore::for_config(config),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Resolve the target, secure credentials, run every phase, smoke test.
    pub async fn deploy(&self, options: DeployOptions) -> Result<DeploySummary> {
        self.config.validate()?;
        let identity = self.config.identity.as_str();
        let run = RunSpan::start("deploy", identity);
        let start = Instant::now();
        obs::emit_deploy_started(identity);

        let resolver = Resolver::new(self.cloud, self.config);
        let resolution = resolver.resolve(identity).await?;
        let mut target = resolution.target;
        obs::emit_target_resolved(identity, &target.address, resolution.existed);
        resolver.await_reachable(self.shell, &mut target).await?;

        let credentials = self
            .resolve_credentials(&target.address, options.rotate_credentials)
            .await?;
        let provenance: BTreeMap<String, Provenance> = credentials
            .iter()
            .map(|c| (c.record.slot.clone(), c.record.provenance))
            .collect();

        let catalog = FactCatalog::from_config(self.config);
        let ctx = PhaseContext {
            shell: self.shell,
            address: &target.address,
            config: self.config,
            catalog: &catalog,
            credentials: &provenance,
        };
        let phases = Orchestrator::new(standard_phases(self.config))
            .run(&ctx)
            .await
            .into_result()?;

        let smoke = SmokeVerifier::new(self.shell, secs(self.config.smoke.interval_secs))
            .wait_for_all(
                &target.address,
                &deploy_signals(self.config),
                secs(self.config.smoke.max_wait_secs),
            )
            .await;

        resolver.mark_converged(&mut target);
        let summary = DeploySummary {
            run_id: run.run_id().to_string(),
            target,
            existed: resolution.existed,
            shape_drift: resolution.shape_drift,
            credentials,
            phases,
            smoke,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        obs::emit_deploy_finished(
            identity,
            &summary.target.address,
            summary.applied(),
            summary.duration_ms,
        );
        Ok(summary)
    }

    /// Probe every catalog fact on the existing target; repair with `fix`.
    pub async fn audit(&self, fix: bool) -> Result<AuditSummary> {
        self.config.validate()?;
        let identity = self.config.identity.as_str();
        let run = RunSpan::start("audit", identity);

        let resolver = Resolver::new(self.cloud, self.config);
        let resolution = resolver
            .locate(identity)
            .await?
            .ok_or_else(|| DeployError::TargetAbsent(identity.to_string()))?;
        let mut target = resolution.target;
        resolver.await_reachable(self.shell, &mut target).await?;

        let catalog = FactCatalog::from_config(self.config);
        let mut report = Reconciler::new(self.shell, &catalog)
            .reconcile_all(&target.address, fix)
            .await?;
        report.verdicts.push(shape_verdict(self.config, &resolution.shape_drift));

        Ok(AuditSummary {
            run_id: run.run_id().to_string(),
            target,
            report,
        })
    }

    /// Read-only: where the target is and what is escrowed locally.
    pub async fn status(&self) -> Result<StatusSummary> {
        let resolver = Resolver::new(self.cloud, self.config);
        let located = resolver.locate(&self.config.identity).await?;
        let mut escrow = Vec::new();
        for slot in CredentialSlot::for_config(self.config) {
            let provenance = self.store.load(slot.name)?.map(|r| r.provenance);
            escrow.push(EscrowEntry {
                slot: slot.name.to_string(),
                path: self.store.path(slot.name),
                provenance,
            });
        }
        let (target, shape_drift) = match located {
            Some(resolution) => (Some(resolution.target), resolution.shape_drift),
            None => (None, Vec::new()),
        };
        Ok(StatusSummary {
            target,
            shape_drift,
            escrow,
        })
    }

    /// Delete the instance; escrowed credentials stay on this machine.
    pub async fn teardown(&self) -> Result<Option<Instance>> {
        self.config.validate_identity()?;
        Resolver::new(self.cloud, self.config)
            .teardown(&self.config.identity)
            .await
    }

    /// The escrowed record of `slot`, secret included.
    pub fn credential(&self, slot: &str) -> Result<Option<CredentialRecord>> {
        self.config.validate_identity()?;
        self.store.load(CredentialSlot::check_name(slot)?)
    }

    async fn resolve_credentials(
        &self,
        address: &str,
        rotate: bool,
    ) -> Result<Vec<ResolvedCredential>> {
        let resolver = CredentialResolver::new(self.shell, &self.store, self.generator);
        let mut resolved = Vec::new();
        for slot in CredentialSlot::for_config(self.config) {
            let credential = resolver
                .resolve(&self.config.identity, address, &slot, rotate)
                .await?;
            info!(
                slot = slot.name,
                provenance = credential.record.provenance.as_str(),
                "credential secured"
            );
            resolved.push(credential);
        }
        Ok(resolved)
    }
}

/// `warn` when the adopted instance differs from the configured shape.
fn shape_verdict(config: &Config, drift: &[ShapeDrift]) -> ReconciliationVerdict {
    let cloud = &config.cloud;
    let expected = format!(
        "size={} image={} region={}",
        cloud.size, cloud.image, cloud.region
    );
    let verdict = if drift.is_empty() {
        ReconciliationVerdict {
            fact: INSTANCE_SHAPE.to_string(),
            status: VerdictStatus::Pass,
            remediation_applied: false,
            expected,
            observed: None,
            detail: String::new(),
        }
    } else {
        let observed = drift
            .iter()
            .map(|d| format!("{}={}", d.attribute, d.actual))
            .collect::<Vec<_>>()
            .join(" ");
        ReconciliationVerdict {
            fact: INSTANCE_SHAPE.to_string(),
            status: VerdictStatus::Warn,
            remediation_applied: false,
            expected,
            observed: Some(observed),
            detail: "instance was adopted as is; `berth teardown --yes` then `berth deploy` recreates it"
                .to_string(),
        }
    };
    obs::emit_verdict(&verdict);
    verdict
}
