//! The provisioning phases, in the order they run.
//!
//! Most phases repair their facts with the catalog remedies, the same scripts
//! `audit --fix` runs. The gateway, dashboard and push listener phases write
//! their files in one session and restart once.

use async_trait::async_trait;
use berth_remote::{Check, Script, Step, UnitVerb};

use crate::catalog::{self, FactCatalog};
use crate::config::{secs, Config};
use crate::credential::CredentialSlot;
use crate::domain::{Result, Snapshot};
use crate::orchestrator::{phase_error, Phase, PhaseContext};
use crate::poll::await_condition;
use crate::units;

/// Phases for `config`; optional components contribute theirs only when
/// enabled.
pub fn standard_phases(config: &Config) -> Vec<Box<dyn Phase>> {
    let mut phases: Vec<Box<dyn Phase>> = vec![
        Box::new(PlatformReady),
        Box::new(RemedyPhase::new(
            "operator-account",
            vec![catalog::OPERATOR_USER_PRESENT],
        )),
        Box::new(RemedyPhase::new(
            "base-packages",
            vec![catalog::BASE_TOOLS_PRESENT],
        )),
        Box::new(RemedyPhase::new("firewall", vec![catalog::FIREWALL_ACTIVE])),
        Box::new(RemedyPhase::new(
            "gateway-install",
            vec![catalog::GATEWAY_BINARY_PRESENT],
        )),
        Box::new(GatewayConfig),
    ];
    if config.dashboard.enabled {
        phases.push(Box::new(CompanionDashboard));
    }
    if config.mesh.enabled {
        phases.push(Box::new(RemedyPhase::new(
            "mesh-join",
            vec![catalog::OVERLAY_NETWORK_ONLINE],
        )));
        phases.push(Box::new(RemedyPhase::new(
            "mesh-expose",
            vec![
                catalog::OVERLAY_RULE_GATEWAY,
                catalog::OVERLAY_RULE_DASHBOARD,
            ],
        )));
    }
    if config.hook.enabled {
        phases.push(Box::new(PushListener));
    }
    phases
}

/// Concatenate the remedies of every fact in `facts` that `snapshot` does not
/// accept into one script.
pub fn remedy_script(
    label: &str,
    catalog: &FactCatalog,
    snapshot: &Snapshot,
    facts: &[&'static str],
) -> std::result::Result<Script, &'static str> {
    let mut script = Script::new(label);
    for spec in catalog.select(facts) {
        if snapshot.accepts(spec) {
            continue;
        }
        let remedy = spec.remedy.as_ref().ok_or(spec.name)?;
        script.extend(remedy.steps().iter().cloned());
    }
    Ok(script)
}

/// A phase whose apply is the catalog remedies of its drifted facts.
pub struct RemedyPhase {
    name: &'static str,
    facts: Vec<&'static str>,
}

impl RemedyPhase {
    pub fn new(name: &'static str, facts: Vec<&'static str>) -> Self {
        Self { name, facts }
    }
}

#[async_trait]
impl Phase for RemedyPhase {
    fn name(&self) -> &'static str {
        self.name
    }

    fn facts(&self) -> Vec<&'static str> {
        self.facts.clone()
    }

    async fn apply(&self, ctx: &PhaseContext<'_>, snapshot: &Snapshot) -> Result<String> {
        let script = remedy_script(self.name, ctx.catalog, snapshot, &self.facts).map_err(|fact| {
            phase_error(
                self.name,
                format!("{fact} is not satisfied and has no automatic remedy; check the configuration"),
            )
        })?;
        ctx.execute(self.name, &script).await?;
        Ok(format!("{} step(s) applied", script.steps().len()))
    }
}

/// Bounded wait for first-boot initialisation. Read-only.
pub struct PlatformReady;

#[async_trait]
impl Phase for PlatformReady {
    fn name(&self) -> &'static str {
        "platform-ready"
    }

    fn facts(&self) -> Vec<&'static str> {
        vec![catalog::PLATFORM_INITIALIZED]
    }

    async fn apply(&self, ctx: &PhaseContext<'_>, _snapshot: &Snapshot) -> Result<String> {
        let platform = &ctx.config.platform;
        let script =
            Script::new("platform: boot finished").probe(catalog::PLATFORM_INITIALIZED, Check::BootFinished);
        let shell = ctx.shell;
        let address = ctx.address;
        let outcome = await_condition(
            move || {
                let script = script.clone();
                async move {
                    match shell.exec(address, &script).await {
                        Ok(output) => output
                            .facts()
                            .get(catalog::PLATFORM_INITIALIZED)
                            .map(|v| v == crate::domain::YES)
                            .unwrap_or(false),
                        Err(_) => false,
                    }
                }
            },
            secs(platform.poll_interval_secs),
            secs(platform.init_timeout_secs),
        )
        .await;
        if !outcome.ready {
            return Err(phase_error(
                self.name(),
                format!(
                    "first-boot initialisation did not finish within {}s",
                    platform.init_timeout_secs
                ),
            ));
        }
        Ok(format!(
            "initialisation finished after {}s",
            outcome.elapsed.as_secs()
        ))
    }
}

/// Gateway config, unit and restart. Consumes the gateway credential.
pub struct GatewayConfig;

#[async_trait]
impl Phase for GatewayConfig {
    fn name(&self) -> &'static str {
        "gateway-config"
    }

    fn facts(&self) -> Vec<&'static str> {
        vec![
            catalog::GATEWAY_CREDENTIAL_PRESENT,
            catalog::GATEWAY_CONFIG_CURRENT,
            catalog::GATEWAY_UNIT_CURRENT,
            catalog::GATEWAY_ENABLED,
            catalog::GATEWAY_ACTIVE,
            catalog::GATEWAY_SECRET_LOADED,
        ]
    }

    async fn apply(&self, ctx: &PhaseContext<'_>, snapshot: &Snapshot) -> Result<String> {
        let credential = ctx
            .catalog
            .get(catalog::GATEWAY_CREDENTIAL_PRESENT)
            .map(|spec| snapshot.accepts(spec))
            .unwrap_or(false);
        if !credential {
            return Err(phase_error(
                self.name(),
                "gateway secret is missing on the target; it is restored from escrow on the next run",
            ));
        }

        let config = ctx.config;
        let service = &config.gateway.service;
        let mut script = Script::new("gateway: configure").step(Step::WriteFile {
            path: units::gateway_env_path(),
            contents: units::gateway_env(config),
            mode: 0o644,
            owner: "root:root".to_string(),
        });
        script.extend(catalog::install_unit_steps(
            service,
            units::gateway_unit(config),
            UnitVerb::Enable,
        ));
        script.extend(catalog::reload_steps(service, units::gateway_secret_path()));
        ctx.execute(self.name(), &script).await?;

        let provenance = ctx
            .credentials
            .get(CredentialSlot::GATEWAY)
            .map(|p| p.as_str())
            .unwrap_or("unknown");
        Ok(format!(
            "config written, {service} restarted (credential {provenance})"
        ))
    }
}

/// Fetch, build and install the dashboard as a service tied to the gateway.
pub struct CompanionDashboard;

#[async_trait]
impl Phase for CompanionDashboard {
    fn name(&self) -> &'static str {
        "companion-dashboard"
    }

    fn facts(&self) -> Vec<&'static str> {
        vec![
            catalog::DASHBOARD_INSTALLED,
            catalog::DASHBOARD_UNIT_CURRENT,
            catalog::DASHBOARD_ENABLED,
            catalog::DASHBOARD_ACTIVE,
            catalog::DASHBOARD_SECRET_LOADED,
        ]
    }

    async fn apply(&self, ctx: &PhaseContext<'_>, snapshot: &Snapshot) -> Result<String> {
        let config = ctx.config;
        let service = &config.dashboard.service;
        let installed = ctx
            .catalog
            .get(catalog::DASHBOARD_INSTALLED)
            .map(|spec| snapshot.accepts(spec))
            .unwrap_or(false);

        let mut script = Script::new("dashboard: deploy");
        if !installed {
            script.extend(catalog::dashboard_build_steps(config));
        }
        script.extend(catalog::install_unit_steps(
            service,
            units::dashboard_unit(config),
            UnitVerb::Enable,
        ));
        // The dashboard reads the gateway secret file.
        script.extend(catalog::reload_steps(service, units::gateway_secret_path()));
        ctx.execute(self.name(), &script).await?;

        Ok(if installed {
            format!("{service} unit refreshed and restarted")
        } else {
            format!("built {} and started {service}", config.dashboard.rev)
        })
    }
}

/// Optional push listener; guarded by its unit definition.
pub struct PushListener;

#[async_trait]
impl Phase for PushListener {
    fn name(&self) -> &'static str {
        "push-listener"
    }

    fn facts(&self) -> Vec<&'static str> {
        vec![
            catalog::HOOK_UNIT_PRESENT,
            catalog::HOOK_CREDENTIAL_PRESENT,
            catalog::HOOK_ACTIVE,
            catalog::HOOK_SECRET_LOADED,
        ]
    }

    async fn apply(&self, ctx: &PhaseContext<'_>, _snapshot: &Snapshot) -> Result<String> {
        let mut script = Script::new("push listener: deploy");
        script.extend(catalog::hook_install_steps(ctx.config));
        ctx.execute(self.name(), &script).await?;
        Ok(format!(
            "{} listening on :{} for refs/heads/{}",
            ctx.config.hook.service, ctx.config.hook.port, ctx.config.hook.branch
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PhaseOutcome, Provenance};
    use crate::fakes::{test_config, FakeTarget};
    use crate::orchestrator::Orchestrator;
    use std::collections::BTreeMap;

    fn gateway_secret(target: &FakeTarget, config: &Config) {
        let slot = CredentialSlot::gateway(config);
        target.set_file(&slot.path, &format!("{}={}\n", slot.key, "g".repeat(64)));
    }

    #[test]
    fn test_phase_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.mesh.enabled = true;
        config.hook.enabled = true;
        let names: Vec<&str> = standard_phases(&config).iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec![
                "platform-ready",
                "operator-account",
                "base-packages",
                "firewall",
                "gateway-install",
                "gateway-config",
                "companion-dashboard",
                "mesh-join",
                "mesh-expose",
                "push-listener",
            ]
        );

        config.dashboard.enabled = false;
        config.mesh.enabled = false;
        config.hook.enabled = false;
        assert_eq!(standard_phases(&config).len(), 6);
    }

    #[tokio::test]
    async fn test_all_phases_apply_on_fresh_target() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let catalog = FactCatalog::from_config(&config);
        let target = FakeTarget::for_config(&config);
        gateway_secret(&target, &config);
        let credentials = BTreeMap::from([(
            CredentialSlot::GATEWAY.to_string(),
            Provenance::RecoveredFromTarget,
        )]);
        let ctx = PhaseContext {
            shell: &target,
            address: FakeTarget::ADDRESS,
            config: &config,
            catalog: &catalog,
            credentials: &credentials,
        };

        let report = Orchestrator::new(standard_phases(&config)).run(&ctx).await;
        assert!(report.is_complete(), "{:?}", report.error);
        let outcomes: Vec<PhaseOutcome> = report.results.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes[0], PhaseOutcome::SkippedAlreadySatisfied);
        assert!(outcomes[1..].iter().all(|o| *o == PhaseOutcome::Applied));
        assert!(target.service_active("gateway"));
        assert!(target.service_active("gateway-dashboard"));
        assert!(report.results[5].detail.contains("recovered-from-target"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_ready_waits_for_boot() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let catalog = FactCatalog::from_config(&config);
        let target = FakeTarget::for_config(&config);
        target.booting(3);
        let credentials = BTreeMap::new();
        let ctx = PhaseContext {
            shell: &target,
            address: FakeTarget::ADDRESS,
            config: &config,
            catalog: &catalog,
            credentials: &credentials,
        };

        let report = Orchestrator::new(vec![Box::new(PlatformReady)]).run(&ctx).await;
        assert!(report.is_complete());
        assert_eq!(report.results[0].outcome, PhaseOutcome::Applied);
        assert_eq!(target.mutating_execs(), 0);
    }

    #[tokio::test]
    async fn test_missing_gateway_url_fails_install() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.gateway.binary_url = None;
        let catalog = FactCatalog::from_config(&config);
        let target = FakeTarget::for_config(&config);
        let credentials = BTreeMap::new();
        let ctx = PhaseContext {
            shell: &target,
            address: FakeTarget::ADDRESS,
            config: &config,
            catalog: &catalog,
            credentials: &credentials,
        };

        let phase = RemedyPhase::new("gateway-install", vec![catalog::GATEWAY_BINARY_PRESENT]);
        let report = Orchestrator::new(vec![Box::new(phase)]).run(&ctx).await;
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("gateway-binary-present"));
        assert_eq!(target.mutating_execs(), 0);
    }

    #[tokio::test]
    async fn test_dashboard_skips_build_when_installed() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let catalog = FactCatalog::from_config(&config);
        let target = FakeTarget::for_config(&config);
        target.set_file(&units::dashboard_binary_path(&config), "bin");
        target.set_file(
            &units::source_stamp_path(catalog::DASHBOARD_COMPONENT),
            &format!("{}\n", units::dashboard_source(&config)),
        );
        target.fail_url(&config.dashboard.repo_url);
        let credentials = BTreeMap::new();
        let ctx = PhaseContext {
            shell: &target,
            address: FakeTarget::ADDRESS,
            config: &config,
            catalog: &catalog,
            credentials: &credentials,
        };

        let report = Orchestrator::new(vec![Box::new(CompanionDashboard)]).run(&ctx).await;
        assert!(report.is_complete(), "{:?}", report.error);
        assert!(report.results[0].detail.contains("refreshed"));
    }

    #[tokio::test]
    async fn test_dashboard_rebuilds_when_rev_moves() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        let target = FakeTarget::for_config(&config);
        gateway_secret(&target, &config);
        let credentials = BTreeMap::new();
        let phases = || -> Vec<Box<dyn Phase>> { vec![Box::new(CompanionDashboard)] };

        let catalog = FactCatalog::from_config(&config);
        let ctx = PhaseContext {
            shell: &target,
            address: FakeTarget::ADDRESS,
            config: &config,
            catalog: &catalog,
            credentials: &credentials,
        };
        assert!(Orchestrator::new(phases()).run(&ctx).await.is_complete());
        let second = Orchestrator::new(phases()).run(&ctx).await;
        assert_eq!(second.results[0].outcome, PhaseOutcome::SkippedAlreadySatisfied);

        config.dashboard.rev = "v2".to_string();
        let catalog = FactCatalog::from_config(&config);
        let ctx = PhaseContext {
            shell: &target,
            address: FakeTarget::ADDRESS,
            config: &config,
            catalog: &catalog,
            credentials: &credentials,
        };
        let report = Orchestrator::new(phases()).run(&ctx).await;
        assert_eq!(report.results[0].outcome, PhaseOutcome::Applied);
        assert!(report.results[0].detail.contains("built v2"));
        assert_eq!(
            target.file(&units::source_stamp_path(catalog::DASHBOARD_COMPONENT)),
            Some(format!("{}\n", units::dashboard_source(&config)))
        );
    }

    #[tokio::test]
    async fn test_gateway_restarts_after_secret_changes_underneath() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let catalog = FactCatalog::from_config(&config);
        let target = FakeTarget::for_config(&config);
        target.set_file(&units::gateway_binary_path(&config), "bin");
        gateway_secret(&target, &config);
        let credentials = BTreeMap::new();
        let ctx = PhaseContext {
            shell: &target,
            address: FakeTarget::ADDRESS,
            config: &config,
            catalog: &catalog,
            credentials: &credentials,
        };
        let phases = || -> Vec<Box<dyn Phase>> { vec![Box::new(GatewayConfig)] };
        assert!(Orchestrator::new(phases()).run(&ctx).await.is_complete());
        let settled = Orchestrator::new(phases()).run(&ctx).await;
        assert_eq!(settled.results[0].outcome, PhaseOutcome::SkippedAlreadySatisfied);

        let slot = CredentialSlot::gateway(&config);
        target.set_file(&slot.path, &format!("{}={}\n", slot.key, "h".repeat(64)));
        let report = Orchestrator::new(phases()).run(&ctx).await;
        assert_eq!(report.results[0].outcome, PhaseOutcome::Applied);
        let again = Orchestrator::new(phases()).run(&ctx).await;
        assert_eq!(again.results[0].outcome, PhaseOutcome::SkippedAlreadySatisfied);
    }
}
