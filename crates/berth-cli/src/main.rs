//! Berth - remote gateway provisioning and drift reconciliation
//!
//! The `berth` command converges one cloud instance per deployment identity.
//!
//! ## Commands
//!
//! - `deploy`: create or adopt the target and apply every phase
//! - `audit`: check every fact on the target, optionally repairing drift
//! - `status`: show where the target is and what is escrowed locally
//! - `teardown`: delete the target instance
//! - `credential show`: print an escrowed credential

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use berth_core::{
    init_tracing, level_for_verbosity, AuditSummary, Config, CredentialSlot, CredentialStore,
    DeployError, DeployOptions, DeploySummary, Engine, PhaseOutcome, PhaseResult, RandomSecret,
    ReconciliationReport, StatusSummary, VerdictStatus,
};
use berth_remote::{is_ssh_available, DigitalOceanApi, SshShell};

#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Provision and reconcile a remote gateway instance", long_about = None)]
struct Cli {
    /// Config file (default: $BERTH_CONFIG, then ~/.config/berth/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Deployment identity (overrides the config file)
    #[arg(long, global = true)]
    identity: Option<String>,

    /// More logging; repeat for trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or adopt the target and converge it
    Deploy {
        /// Replace generated secrets instead of recovering them
        #[arg(long)]
        rotate_credentials: bool,
    },

    /// Compare the target against the fact catalog
    Audit {
        /// Apply the remedy of every drifted fact
        #[arg(long)]
        fix: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the target and local escrow without touching the target
    Status,

    /// Delete the target instance (escrowed credentials are kept)
    Teardown {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },

    /// Inspect escrowed credentials
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Print the escrowed record, secret included
    Show {
        /// Credential slot
        #[arg(long, default_value = CredentialSlot::GATEWAY)]
        slot: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.json_logs, level_for_verbosity(cli.verbose));

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            report_error(&e);
            std::process::exit(1);
        }
    }
}

/// Exit code on success paths; audit reports failing facts through it.
async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(cli.config.as_deref())?.with_identity(cli.identity.as_deref());
    // The identity names the escrow directory and the instance tag.
    config.validate_identity()?;

    if let Commands::Credential { action } = &cli.command {
        let CredentialAction::Show { slot } = action;
        return cmd_credential_show(&CredentialStore::for_config(&config), slot);
    }
    if let Commands::Teardown { yes: false } = &cli.command {
        bail!(
            "refusing to delete the instance of `{}` without --yes",
            config.identity
        );
    }

    let cloud = DigitalOceanApi::new(&config.cloud.api_url, config.cloud.token.as_deref())
        .map_err(DeployError::from)?;
    let shell = SshShell::new(config.ssh.to_options());
    let generator = RandomSecret;
    let engine = Engine::new(&config, &cloud, &shell, &generator);

    match cli.command {
        Commands::Deploy { rotate_credentials } => {
            require_ssh()?;
            cmd_deploy(&engine, rotate_credentials).await
        }
        Commands::Audit { fix, json } => {
            require_ssh()?;
            cmd_audit(&engine, fix, json).await
        }
        Commands::Status => cmd_status(&engine).await,
        Commands::Teardown { .. } => cmd_teardown(&engine, &config.identity).await,
        Commands::Credential { .. } => Ok(0),
    }
}

fn require_ssh() -> Result<()> {
    if !is_ssh_available() {
        return Err(DeployError::Prerequisite("no `ssh` client on PATH".to_string()).into());
    }
    Ok(())
}

fn report_error(error: &anyhow::Error) {
    if let Some(DeployError::Halted { phases, .. }) = error.downcast_ref::<DeployError>() {
        eprintln!("Phases before the stop:");
        eprint!("{}", render_phases(phases));
    }
    eprintln!("error: {error:#}");
    if let Some(deploy) = error.downcast_ref::<DeployError>() {
        eprintln!("hint: {}", deploy.remediation());
    }
}

async fn cmd_deploy(engine: &Engine<'_>, rotate_credentials: bool) -> Result<i32> {
    let summary = engine
        .deploy(DeployOptions { rotate_credentials })
        .await?;
    print!("{}", render_deploy(&summary));
    Ok(0)
}

async fn cmd_audit(engine: &Engine<'_>, fix: bool, json: bool) -> Result<i32> {
    let summary = engine.audit(fix).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", render_audit(&summary));
    }
    let failing = summary.report.failing();
    if !failing.is_empty() {
        return Err(DeployError::ReconciliationFailure { facts: failing }.into());
    }
    Ok(0)
}

async fn cmd_status(engine: &Engine<'_>) -> Result<i32> {
    let status = engine.status().await?;
    print!("{}", render_status(&status));
    Ok(0)
}

async fn cmd_teardown(engine: &Engine<'_>, identity: &str) -> Result<i32> {
    match engine.teardown().await? {
        Some(instance) => println!("Deleted instance {} ({})", instance.id, instance.name),
        None => println!("No instance found for `{identity}`"),
    }
    println!(
        "Escrowed credentials kept in {}",
        engine.store().root().display()
    );
    Ok(0)
}

fn cmd_credential_show(store: &CredentialStore, slot: &str) -> Result<i32> {
    let slot = CredentialSlot::check_name(slot)?;
    match store.load(slot)? {
        Some(record) => {
            println!("slot:        {}", record.slot);
            println!("identity:    {}", record.identity);
            println!("secret:      {}", record.secret);
            println!("provenance:  {}", record.provenance.as_str());
            println!("address:     {}", record.address);
            println!("persisted:   {}", record.persisted_at.to_rfc3339());
            println!("file:        {}", store.path(slot).display());
            Ok(0)
        }
        None => bail!(
            "no escrowed `{slot}` credential in {}; run `berth deploy` first",
            store.root().display()
        ),
    }
}

fn render_deploy(summary: &DeploySummary) -> String {
    let mut out = String::new();
    let verb = if summary.existed { "adopted" } else { "created" };
    out.push_str(&format!(
        "Target {} {verb} at {} (run {})\n",
        summary.target.identity, summary.target.address, summary.run_id
    ));
    for drift in &summary.shape_drift {
        out.push_str(&format!(
            "  ! {} is {} (configured {}); not reshaped\n",
            drift.attribute, drift.actual, drift.configured
        ));
    }

    out.push_str("\nCredentials:\n");
    for credential in &summary.credentials {
        out.push_str(&format!(
            "  {:<8} {:<22} {}\n",
            credential.record.slot,
            credential.record.provenance.as_str(),
            credential.path.display()
        ));
    }

    out.push_str("\nPhases:\n");
    out.push_str(&render_phases(&summary.phases));

    out.push_str("\nSmoke:\n");
    for readiness in &summary.smoke {
        let state = if readiness.ready {
            "ready"
        } else {
            "still warming up"
        };
        out.push_str(&format!(
            "  {:<32} {state} after {}s\n",
            readiness.signal,
            readiness.elapsed.as_secs()
        ));
    }
    out.push_str(&format!(
        "\n{} phase(s) applied in {} ms\n",
        summary.applied(),
        summary.duration_ms
    ));
    out
}

fn render_phases(phases: &[PhaseResult]) -> String {
    let mut out = String::new();
    for result in phases {
        let mark = match result.outcome {
            PhaseOutcome::Applied => "+",
            PhaseOutcome::SkippedAlreadySatisfied => "=",
            PhaseOutcome::Failed => "x",
        };
        out.push_str(&format!(
            "  {mark} {:<20} {} ({} ms)\n",
            result.phase, result.detail, result.duration_ms
        ));
    }
    out
}

fn render_audit(summary: &AuditSummary) -> String {
    let mut out = format!(
        "Audit of {} at {} (run {})\n\n",
        summary.target.identity, summary.target.address, summary.run_id
    );
    out.push_str(&render_report(&summary.report));
    out
}

fn render_report(report: &ReconciliationReport) -> String {
    let mut out = String::new();
    for verdict in &report.verdicts {
        let status = match verdict.status {
            VerdictStatus::Pass => "PASS",
            VerdictStatus::Warn => "WARN",
            VerdictStatus::Fail => "FAIL",
            VerdictStatus::Fixed => "FIXED",
        };
        out.push_str(&format!("  {status:<5} {}", verdict.fact));
        if verdict.status != VerdictStatus::Pass {
            if let Some(observed) = &verdict.observed {
                out.push_str(&format!(" (expected {}, got {observed})", verdict.expected));
            }
            if !verdict.detail.is_empty() {
                out.push_str(&format!(": {}", verdict.detail));
            }
        }
        out.push('\n');
    }
    out.push_str(&format!(
        "\n{} pass, {} warn, {} fail, {} fixed\n",
        report.pass_count(),
        report.warn_count(),
        report.fail_count(),
        report.fixed_count()
    ));
    out
}

fn render_status(status: &StatusSummary) -> String {
    let mut out = String::new();
    match &status.target {
        Some(target) => {
            out.push_str(&format!("identity:  {}\n", target.identity));
            out.push_str(&format!("instance:  {}\n", target.instance_id));
            out.push_str(&format!("address:   {}\n", target.address));
            for drift in &status.shape_drift {
                out.push_str(&format!(
                    "drift:     {} is {} (configured {})\n",
                    drift.attribute, drift.actual, drift.configured
                ));
            }
        }
        None => out.push_str("No target exists; `berth deploy` creates one\n"),
    }
    out.push_str("\nEscrow:\n");
    for entry in &status.escrow {
        let provenance = entry
            .provenance
            .map(|p| p.as_str())
            .unwrap_or("not escrowed");
        out.push_str(&format!(
            "  {:<8} {:<22} {}\n",
            entry.slot,
            provenance,
            entry.path.display()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::fakes::{test_config, CountingGenerator, FakeCloud, FakeTarget};

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["berth", "audit", "--fix", "--identity", "prod", "-vv"])
            .unwrap();
        assert_eq!(cli.identity.as_deref(), Some("prod"));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Audit { fix: true, json: false }));
    }

    #[test]
    fn test_credential_show_defaults_to_gateway() {
        let cli = Cli::try_parse_from(["berth", "credential", "show"]).unwrap();
        match cli.command {
            Commands::Credential {
                action: CredentialAction::Show { slot },
            } => assert_eq!(slot, "gateway"),
            _ => panic!("expected credential show"),
        }
    }

    #[tokio::test]
    async fn test_teardown_requires_yes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "identity = \"test\"\n").unwrap();
        let cli = Cli::try_parse_from([
            "berth",
            "--config",
            path.to_str().unwrap(),
            "teardown",
        ])
        .unwrap();
        let err = run(cli).await.unwrap_err();
        assert!(err.to_string().contains("--yes"));
    }

    #[tokio::test]
    async fn test_audit_exit_code_follows_failures() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cloud = FakeCloud::new();
        let target = FakeTarget::for_config(&config);
        let generator = CountingGenerator::default();
        let engine = Engine::new(&config, &cloud, &target, &generator);

        assert_eq!(cmd_deploy(&engine, false).await.unwrap(), 0);
        assert_eq!(cmd_audit(&engine, false, false).await.unwrap(), 0);

        target.stop_service(&config.gateway.service);
        let err = cmd_audit(&engine, false, true).await.unwrap_err();
        match err.downcast_ref::<DeployError>() {
            Some(DeployError::ReconciliationFailure { facts }) => {
                assert_eq!(facts, &vec!["gateway-active".to_string()]);
            }
            other => panic!("expected a reconciliation failure, got {other:?}"),
        }
        assert_eq!(cmd_audit(&engine, true, false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bad_identity_is_rejected_before_local_state_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "identity = \"test\"\n").unwrap();
        for args in [
            vec!["credential", "show"],
            vec!["teardown", "--yes"],
        ] {
            let mut argv = vec!["berth", "--config", path.to_str().unwrap(), "--identity", "../../x"];
            argv.extend(args);
            let cli = Cli::try_parse_from(argv).unwrap();
            let err = run(cli).await.unwrap_err();
            assert!(
                matches!(err.downcast_ref::<DeployError>(), Some(DeployError::Config(_))),
                "{err:#}"
            );
        }
    }

    #[test]
    fn test_credential_show_rejects_unknown_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let err = cmd_credential_show(&store, "../x").unwrap_err();
        assert!(err.to_string().contains("unknown credential slot"));
    }

    #[test]
    fn test_render_phases_marks_the_failed_phase() {
        let phases = vec![
            PhaseResult::skipped("firewall", 3),
            PhaseResult::failed("gateway-install", "curl: (22) 404", 40),
        ];
        let text = render_phases(&phases);
        assert!(text.contains("= firewall"));
        assert!(text.contains("x gateway-install"));
    }

    #[tokio::test]
    async fn test_render_deploy_lists_phases_and_escrow() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cloud = FakeCloud::new();
        let target = FakeTarget::for_config(&config);
        let generator = CountingGenerator::default();
        let engine = Engine::new(&config, &cloud, &target, &generator);
        let summary = engine.deploy(DeployOptions::default()).await.unwrap();

        let text = render_deploy(&summary);
        assert!(text.contains("created at 203.0.113.10"));
        assert!(text.contains("newly-generated"));
        assert!(text.contains("gateway.credential.json"));
        assert!(text.contains("+ gateway-config"));
        assert!(!text.contains(&summary.credentials[0].record.secret));
    }

    #[test]
    fn test_render_report_counts() {
        let report = ReconciliationReport {
            verdicts: vec![berth_core::ReconciliationVerdict {
                fact: "gateway-active".to_string(),
                status: VerdictStatus::Fail,
                remediation_applied: false,
                expected: "yes".to_string(),
                observed: Some("no".to_string()),
                detail: "gateway service running; `berth audit --fix` repairs it".to_string(),
            }],
        };
        let text = render_report(&report);
        assert!(text.contains("FAIL  gateway-active (expected yes, got no)"));
        assert!(text.ends_with("0 pass, 0 warn, 1 fail, 0 fixed\n"));
    }

    #[test]
    fn test_credential_show_without_escrow_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let err = cmd_credential_show(&store, "gateway").unwrap_err();
        assert!(err.to_string().contains("berth deploy"));
    }
}
