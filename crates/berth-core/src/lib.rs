//! Berth Core Library
//!
//! The reconciliation engine behind the `berth` CLI: resolve the one target of
//! a deployment identity, secure its credentials, converge it through ordered
//! idempotent phases, and audit or repair drift afterwards.

pub mod catalog;
pub mod config;
pub mod credential;
pub mod deploy;
pub mod domain;
pub mod fakes;
pub mod obs;
pub mod orchestrator;
pub mod phases;
pub mod poll;
pub mod probe;
pub mod reconciler;
pub mod resolver;
pub mod smoke;
pub mod telemetry;
pub mod units;

pub use catalog::FactCatalog;
pub use config::{Config, CONFIG_ENV};
pub use credential::{
    CredentialResolver, CredentialSlot, CredentialStore, RandomSecret, ResolvedCredential,
    SecretGenerator,
};
pub use deploy::{
    AuditSummary, DeployOptions, DeploySummary, Engine, EscrowEntry, StatusSummary,
    INSTANCE_SHAPE,
};
pub use domain::{
    is_well_formed_secret, CredentialRecord, DeployError, Expectation, FactSpec, LifecycleState,
    PhaseOutcome, PhaseResult, Provenance, ReconciliationReport, ReconciliationVerdict,
    Resolution, Result, Severity, ShapeDrift, Snapshot, Target, VerdictStatus,
};
pub use obs::RunSpan;
pub use orchestrator::{OrchestrationReport, Orchestrator, Phase, PhaseContext};
pub use phases::standard_phases;
pub use poll::{await_condition, PollOutcome};
pub use probe::{probe_connectivity, snapshot};
pub use reconciler::Reconciler;
pub use resolver::{tag_for, Resolver};
pub use smoke::{deploy_signals, Readiness, ReadinessSignal, SmokeVerifier};
pub use telemetry::{init_tracing, level_for_verbosity};
