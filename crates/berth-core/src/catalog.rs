//! The fact table.
//!
//! Built once from [`Config`]. Phases name the facts they own and the
//! reconciler walks the whole table, so provisioning and audit ask the same
//! questions through the same probes and repair through the same remedies.

use berth_remote::{unit_path, Check, Redacted, Script, Step, UnitVerb};

use crate::config::Config;
use crate::domain::{Expectation, FactSpec, Severity};
use crate::units;

pub const PLATFORM_INITIALIZED: &str = "platform-initialized";
pub const OPERATOR_USER_PRESENT: &str = "operator-user-present";
pub const BASE_TOOLS_PRESENT: &str = "base-tools-present";
pub const FIREWALL_ACTIVE: &str = "firewall-active";
pub const GATEWAY_BINARY_PRESENT: &str = "gateway-binary-present";
pub const GATEWAY_CREDENTIAL_PRESENT: &str = "gateway-credential-present";
pub const GATEWAY_CONFIG_CURRENT: &str = "gateway-config-current";
pub const GATEWAY_UNIT_CURRENT: &str = "gateway-unit-current";
pub const GATEWAY_ENABLED: &str = "gateway-enabled";
pub const GATEWAY_ACTIVE: &str = "gateway-active";
pub const GATEWAY_SECRET_LOADED: &str = "gateway-secret-loaded";
pub const DASHBOARD_INSTALLED: &str = "dashboard-installed";
pub const DASHBOARD_UNIT_CURRENT: &str = "dashboard-unit-current";
pub const DASHBOARD_ENABLED: &str = "dashboard-enabled";
pub const DASHBOARD_ACTIVE: &str = "dashboard-active";
pub const DASHBOARD_SECRET_LOADED: &str = "dashboard-secret-loaded";
pub const OVERLAY_NETWORK_ONLINE: &str = "overlay-network-online";
pub const OVERLAY_RULE_GATEWAY: &str = "overlay-rule-gateway";
pub const OVERLAY_RULE_DASHBOARD: &str = "overlay-rule-dashboard";
pub const HOOK_UNIT_PRESENT: &str = "hook-unit-present";
pub const HOOK_CREDENTIAL_PRESENT: &str = "hook-credential-present";
pub const HOOK_ACTIVE: &str = "hook-active";
pub const HOOK_SECRET_LOADED: &str = "hook-secret-loaded";

/// Component names of the source stamps.
pub const GATEWAY_COMPONENT: &str = "gateway";
pub const DASHBOARD_COMPONENT: &str = "dashboard";

const ROOT_OWNER: &str = "root:root";

/// Ordered fact table for one configuration.
#[derive(Debug, Clone)]
pub struct FactCatalog {
    specs: Vec<FactSpec>,
}

impl FactCatalog {
    pub fn from_config(config: &Config) -> Self {
        let mut specs = platform_facts(config);
        specs.extend(gateway_facts(config));
        if config.dashboard.enabled {
            specs.extend(dashboard_facts(config));
        }
        if config.mesh.enabled {
            specs.extend(mesh_facts(config));
        }
        if config.hook.enabled {
            specs.extend(hook_facts(config));
        }
        FactCatalog { specs }
    }

    pub fn get(&self, name: &str) -> Option<&FactSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Specs for `names`, in catalog order. Names not in this catalog (an
    /// optional component that is disabled) are skipped.
    pub fn select(&self, names: &[&str]) -> Vec<&FactSpec> {
        self.specs
            .iter()
            .filter(|s| names.contains(&s.name))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FactSpec> {
        self.specs.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.specs.iter().map(|s| s.name).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Allow-list for the firewall, including the listener port when enabled.
pub fn firewall_rules(config: &Config) -> Vec<String> {
    let mut rules = config.platform.firewall_allow.clone();
    if config.hook.enabled {
        let rule = format!("{}/tcp", config.hook.port);
        if !rules.contains(&rule) {
            rules.push(rule);
        }
    }
    rules
}

/// Write a rendered unit, reload systemd, then `verb` the service.
pub fn install_unit_steps(unit: &str, contents: String, verb: UnitVerb) -> Vec<Step> {
    vec![
        Step::WriteFile {
            path: unit_path(unit),
            contents,
            mode: 0o644,
            owner: ROOT_OWNER.to_string(),
        },
        Step::DaemonReload,
        Step::Systemctl {
            verb,
            unit: unit.to_string(),
        },
    ]
}

/// Fetch, build and install the dashboard binary.
pub fn dashboard_build_steps(config: &Config) -> Vec<Step> {
    let dashboard = &config.dashboard;
    let dir = dashboard.install_dir.trim_end_matches('/');
    vec![
        Step::FetchRepo {
            url: dashboard.repo_url.clone(),
            rev: dashboard.rev.clone(),
            dest: dir.to_string(),
            owner: config.gateway.user.clone(),
        },
        Step::Build {
            dir: dir.to_string(),
            command: dashboard.build_command.clone(),
            user: config.gateway.user.clone(),
            artifact: dashboard.artifact.clone(),
        },
        Step::InstallArtifact {
            src: format!("{dir}/{}", dashboard.artifact),
            dest: units::dashboard_binary_path(config),
        },
        source_stamp(DASHBOARD_COMPONENT, &units::dashboard_source(config)),
    ]
}

/// Restart `unit`, then record the digest of the secret file it loads.
pub fn reload_steps(unit: &str, secret_path: String) -> Vec<Step> {
    vec![
        restart(unit),
        Step::RecordDigest {
            path: secret_path,
            stamp: units::secret_stamp_path(unit),
        },
    ]
}

/// Record what the binary of `component` came from.
pub fn source_stamp(component: &str, source: &str) -> Step {
    Step::WriteFile {
        path: units::source_stamp_path(component),
        contents: format!("{source}\n"),
        mode: 0o644,
        owner: ROOT_OWNER.to_string(),
    }
}

/// Steps that place the push listener (binary, rebuild script, unit) and
/// start it. The secret is written separately.
pub fn hook_install_steps(config: &Config) -> Vec<Step> {
    let mut steps = Vec::new();
    if let Some(url) = &config.hook.binary_url {
        steps.push(Step::Download {
            url: url.clone(),
            dest: units::hook_binary_path(),
            mode: 0o755,
        });
    }
    steps.push(Step::WriteFile {
        path: units::rebuild_script_path(),
        contents: units::rebuild_script(config),
        mode: 0o755,
        owner: ROOT_OWNER.to_string(),
    });
    steps.extend(install_unit_steps(
        &config.hook.service,
        units::hook_unit(config),
        UnitVerb::Enable,
    ));
    steps.extend(reload_steps(&config.hook.service, units::hook_secret_path()));
    steps
}

fn restart(unit: &str) -> Step {
    Step::Systemctl {
        verb: UnitVerb::Restart,
        unit: unit.to_string(),
    }
}

fn try_restart(unit: &str) -> Step {
    Step::Systemctl {
        verb: UnitVerb::TryRestart,
        unit: unit.to_string(),
    }
}

fn enable(unit: &str) -> Step {
    Step::Systemctl {
        verb: UnitVerb::Enable,
        unit: unit.to_string(),
    }
}

fn platform_facts(config: &Config) -> Vec<FactSpec> {
    let user = &config.gateway.user;
    vec![
        FactSpec::new(
            PLATFORM_INITIALIZED,
            "first-boot initialisation finished",
            Check::BootFinished,
        ),
        FactSpec::new(
            OPERATOR_USER_PRESENT,
            format!("operating identity `{user}` exists"),
            Check::UserExists { name: user.clone() },
        )
        .remedy(Script::new("remedy: operator user").step(Step::EnsureUser {
            name: user.clone(),
            home: units::operator_home(config),
        })),
        FactSpec::new(
            BASE_TOOLS_PRESENT,
            format!("{} on PATH", config.platform.required_commands.join(", ")),
            Check::CommandsPresent {
                commands: config.platform.required_commands.clone(),
            },
        )
        .remedy(
            Script::new("remedy: base packages").step(Step::InstallPackages {
                packages: config.platform.packages.clone(),
            }),
        ),
        FactSpec::new(FIREWALL_ACTIVE, "firewall enabled", Check::FirewallActive).remedy(
            Script::new("remedy: firewall").step(Step::EnableFirewall {
                allow: firewall_rules(config),
            }),
        ),
    ]
}

fn gateway_facts(config: &Config) -> Vec<FactSpec> {
    let gateway = &config.gateway;
    let unit = gateway.service.as_str();
    let binary_path = units::gateway_binary_path(config);

    let binary = match &gateway.binary_url {
        Some(url) => FactSpec::new(
            GATEWAY_BINARY_PRESENT,
            format!("{binary_path} installed from {url}"),
            Check::InstalledFrom {
                path: binary_path.clone(),
                stamp: units::source_stamp_path(GATEWAY_COMPONENT),
            },
        )
        .expecting(Expectation::Equals(url.clone()))
        .remedy(
            Script::new("remedy: gateway binary")
                .step(Step::Download {
                    url: url.clone(),
                    dest: binary_path.clone(),
                    mode: 0o755,
                })
                .step(source_stamp(GATEWAY_COMPONENT, url))
                .step(try_restart(unit)),
        ),
        None => FactSpec::new(
            GATEWAY_BINARY_PRESENT,
            format!("{binary_path} installed"),
            Check::FileExists {
                path: binary_path.clone(),
            },
        ),
    };

    let env = units::gateway_env(config);
    let unit_file = units::gateway_unit(config);
    let secret = units::gateway_secret_path();

    let mut config_remedy = Script::new("remedy: gateway config").step(Step::WriteFile {
        path: units::gateway_env_path(),
        contents: env.clone(),
        mode: 0o644,
        owner: ROOT_OWNER.to_string(),
    });
    config_remedy.extend(reload_steps(unit, secret.clone()));

    let mut unit_remedy = Script::new("remedy: gateway unit");
    unit_remedy.extend(install_unit_steps(unit, unit_file.clone(), UnitVerb::Restart));

    let mut reload = Script::new("remedy: gateway secret reload");
    reload.extend(reload_steps(unit, secret.clone()));

    vec![
        binary,
        FactSpec::new(
            GATEWAY_CREDENTIAL_PRESENT,
            "gateway auth secret present on the target",
            Check::EnvValue {
                path: secret.clone(),
                key: gateway.secret_key.clone(),
            },
        )
        .expecting(Expectation::WellFormedSecret)
        .secret(),
        FactSpec::new(
            GATEWAY_CONFIG_CURRENT,
            format!("{} matches the rendered config", units::gateway_env_path()),
            Check::FileDigest {
                path: units::gateway_env_path(),
            },
        )
        .expecting(Expectation::Equals(units::digest(&env)))
        .remedy(config_remedy),
        FactSpec::new(
            GATEWAY_UNIT_CURRENT,
            format!("{} matches the rendered unit", unit_path(unit)),
            Check::FileDigest {
                path: unit_path(unit),
            },
        )
        .expecting(Expectation::Equals(units::digest(&unit_file)))
        .remedy(unit_remedy),
        FactSpec::new(
            GATEWAY_ENABLED,
            format!("{unit} starts on boot"),
            Check::ServiceEnabled {
                unit: unit.to_string(),
            },
        )
        .severity(Severity::Warn)
        .remedy(Script::new("remedy: enable gateway").step(enable(unit))),
        FactSpec::new(
            GATEWAY_ACTIVE,
            format!("{unit} running"),
            Check::ServiceActive {
                unit: unit.to_string(),
            },
        )
        .remedy(Script::new("remedy: restart gateway").step(restart(unit))),
        FactSpec::new(
            GATEWAY_SECRET_LOADED,
            format!("{unit} restarted since its secret last changed"),
            Check::DigestRecorded {
                path: secret,
                stamp: units::secret_stamp_path(unit),
            },
        )
        .remedy(reload),
    ]
}

fn dashboard_facts(config: &Config) -> Vec<FactSpec> {
    let unit = config.dashboard.service.as_str();
    let unit_file = units::dashboard_unit(config);

    let mut build = Script::new("remedy: dashboard build");
    build.extend(dashboard_build_steps(config));
    build.push(try_restart(unit));

    let mut unit_remedy = Script::new("remedy: dashboard unit");
    unit_remedy.extend(install_unit_steps(unit, unit_file.clone(), UnitVerb::Restart));

    let mut reload = Script::new("remedy: dashboard secret reload");
    reload.extend(reload_steps(unit, units::gateway_secret_path()));

    vec![
        FactSpec::new(
            DASHBOARD_INSTALLED,
            format!(
                "{} built from {} at {}",
                units::dashboard_binary_path(config),
                config.dashboard.repo_url,
                config.dashboard.rev
            ),
            Check::InstalledFrom {
                path: units::dashboard_binary_path(config),
                stamp: units::source_stamp_path(DASHBOARD_COMPONENT),
            },
        )
        .expecting(Expectation::Equals(units::dashboard_source(config)))
        .remedy(build),
        FactSpec::new(
            DASHBOARD_UNIT_CURRENT,
            format!("{} matches the rendered unit", unit_path(unit)),
            Check::FileDigest {
                path: unit_path(unit),
            },
        )
        .expecting(Expectation::Equals(units::digest(&unit_file)))
        .remedy(unit_remedy),
        FactSpec::new(
            DASHBOARD_ENABLED,
            format!("{unit} starts on boot"),
            Check::ServiceEnabled {
                unit: unit.to_string(),
            },
        )
        .severity(Severity::Warn)
        .remedy(Script::new("remedy: enable dashboard").step(enable(unit))),
        FactSpec::new(
            DASHBOARD_ACTIVE,
            format!("{unit} running"),
            Check::ServiceActive {
                unit: unit.to_string(),
            },
        )
        .remedy(Script::new("remedy: restart dashboard").step(restart(unit))),
        FactSpec::new(
            DASHBOARD_SECRET_LOADED,
            format!("{unit} restarted since the gateway secret last changed"),
            Check::DigestRecorded {
                path: units::gateway_secret_path(),
                stamp: units::secret_stamp_path(unit),
            },
        )
        .remedy(reload),
    ]
}

fn mesh_facts(config: &Config) -> Vec<FactSpec> {
    let mesh = &config.mesh;
    let mut online = FactSpec::new(
        OVERLAY_NETWORK_ONLINE,
        "mesh overlay joined and running",
        Check::OverlayOnline,
    );
    if let Some(key) = &mesh.auth_key {
        online = online.remedy(Script::new("remedy: mesh join").step(Step::MeshJoin {
            auth_key: Redacted(key.clone()),
            hostname: config.mesh_hostname(),
        }));
    }

    let mut specs = vec![
        online,
        serve_rule(
            OVERLAY_RULE_GATEWAY,
            mesh.gateway_https_port,
            config.gateway.port,
        ),
    ];
    if config.dashboard.enabled {
        specs.push(serve_rule(
            OVERLAY_RULE_DASHBOARD,
            mesh.dashboard_https_port,
            config.dashboard.port,
        ));
    }
    specs
}

fn serve_rule(name: &'static str, https_port: u16, upstream_port: u16) -> FactSpec {
    FactSpec::new(
        name,
        format!("overlay https :{https_port} proxies to 127.0.0.1:{upstream_port}"),
        Check::OverlayServeRule {
            https_port,
            upstream_port,
        },
    )
    .severity(Severity::Warn)
    .remedy(
        Script::new(format!("remedy: {name}")).step(Step::MeshServe {
            https_port,
            upstream_port,
        }),
    )
}

fn hook_facts(config: &Config) -> Vec<FactSpec> {
    let unit = config.hook.service.as_str();
    let mut install = Script::new("remedy: push listener");
    install.extend(hook_install_steps(config));
    let mut reload = Script::new("remedy: push listener secret reload");
    reload.extend(reload_steps(unit, units::hook_secret_path()));

    vec![
        FactSpec::new(
            HOOK_UNIT_PRESENT,
            format!("{} defined", unit_path(unit)),
            Check::UnitPresent {
                unit: unit.to_string(),
            },
        )
        .severity(Severity::Warn)
        .remedy(install),
        FactSpec::new(
            HOOK_CREDENTIAL_PRESENT,
            "push listener secret present on the target",
            Check::EnvValue {
                path: units::hook_secret_path(),
                key: units::HOOK_SECRET_KEY.to_string(),
            },
        )
        .expecting(Expectation::WellFormedSecret)
        .severity(Severity::Warn)
        .secret(),
        FactSpec::new(
            HOOK_ACTIVE,
            format!("{unit} running"),
            Check::ServiceActive {
                unit: unit.to_string(),
            },
        )
        .severity(Severity::Warn)
        .remedy(Script::new("remedy: restart push listener").step(restart(unit))),
        FactSpec::new(
            HOOK_SECRET_LOADED,
            format!("{unit} restarted since its secret last changed"),
            Check::DigestRecorded {
                path: units::hook_secret_path(),
                stamp: units::secret_stamp_path(unit),
            },
        )
        .severity(Severity::Warn)
        .remedy(reload),
    ]
}
