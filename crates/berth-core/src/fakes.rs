//! In-memory fakes for the remote shell and cloud API (testing only)
//!
//! [`FakeTarget`] interprets typed scripts against a simulated machine, so
//! engine tests exercise the same [`Step`]s and [`Check`]s that the SSH
//! channel renders to bash. [`FakeCloud`] keeps instances in a map.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use berth_remote::{
    unit_name, unit_path, CloudApi, ExecOutput, Instance, InstanceSpec, InstanceStatus,
    RemoteError, RemoteShell, Script, Step, UnitVerb, FACT_MARKER,
};

use crate::config::Config;
use crate::credential::SecretGenerator;
use crate::units;

// ---------------------------------------------------------------------------
// FakeTarget
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct Service {
    enabled: bool,
    active: bool,
}

#[derive(Debug)]
struct Machine {
    reachable: bool,
    /// Probes of boot-finished that still answer `no`.
    boot_pending: u32,
    users: BTreeSet<String>,
    commands: BTreeSet<String>,
    files: BTreeMap<String, String>,
    repos: BTreeSet<String>,
    services: BTreeMap<String, Service>,
    ports: BTreeMap<String, u16>,
    firewall: bool,
    overlay_online: bool,
    serve_rules: BTreeSet<(u16, u16)>,
    failing_urls: BTreeSet<String>,
    history: Vec<String>,
    exec_calls: usize,
    mutating_execs: usize,
}

impl Default for Machine {
    fn default() -> Self {
        Machine {
            reachable: true,
            boot_pending: 0,
            users: BTreeSet::from(["root".to_string()]),
            commands: ["bash", "systemctl", "sha256sum"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            files: BTreeMap::new(),
            repos: BTreeSet::new(),
            services: BTreeMap::new(),
            ports: BTreeMap::new(),
            firewall: false,
            overlay_online: false,
            serve_rules: BTreeSet::new(),
            failing_urls: BTreeSet::new(),
            history: Vec::new(),
            exec_calls: 0,
            mutating_execs: 0,
        }
    }
}

/// A freshly booted machine reachable at [`FakeTarget::ADDRESS`].
#[derive(Debug, Default)]
pub struct FakeTarget {
    machine: Mutex<Machine>,
}

impl FakeTarget {
    pub const ADDRESS: &'static str = "203.0.113.10";

    pub fn new() -> Self {
        Self::default()
    }

    /// A machine whose services listen on the ports `config` gives them.
    pub fn for_config(config: &Config) -> Self {
        let target = Self::new();
        target.listen_when_active(&config.gateway.service, config.gateway.port);
        target.listen_when_active(&config.dashboard.service, config.dashboard.port);
        target.listen_when_active(&config.hook.service, config.hook.port);
        target
    }

    pub fn listen_when_active(&self, unit: &str, port: u16) {
        let mut m = self.machine.lock().unwrap();
        m.ports.insert(unit_name(unit), port);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.machine.lock().unwrap().reachable = reachable;
    }

    /// First-boot initialisation reports unfinished for the next `probes`
    /// checks.
    pub fn booting(&self, probes: u32) {
        self.machine.lock().unwrap().boot_pending = probes;
    }

    /// Downloads and clones of `url` fail.
    pub fn fail_url(&self, url: &str) {
        self.machine.lock().unwrap().failing_urls.insert(url.to_string());
    }

    pub fn clear_failures(&self) {
        self.machine.lock().unwrap().failing_urls.clear();
    }

    pub fn set_file(&self, path: &str, contents: &str) {
        let mut m = self.machine.lock().unwrap();
        m.files.insert(path.to_string(), contents.to_string());
    }

    pub fn remove_file(&self, path: &str) {
        self.machine.lock().unwrap().files.remove(path);
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.machine.lock().unwrap().files.get(path).cloned()
    }

    /// Last `KEY=` value in an env file.
    pub fn env_value(&self, path: &str, key: &str) -> Option<String> {
        let m = self.machine.lock().unwrap();
        m.files.get(path).and_then(|c| env_lookup(c, key))
    }

    /// Simulate a crash: the unit stays enabled but stops running.
    pub fn stop_service(&self, unit: &str) {
        let mut m = self.machine.lock().unwrap();
        if let Some(service) = m.services.get_mut(&unit_name(unit)) {
            service.active = false;
        }
    }

    pub fn service_active(&self, unit: &str) -> bool {
        let m = self.machine.lock().unwrap();
        m.services
            .get(&unit_name(unit))
            .map(|s| s.active)
            .unwrap_or(false)
    }

    pub fn disable_firewall(&self) {
        self.machine.lock().unwrap().firewall = false;
    }

    /// Sessions run so far.
    pub fn exec_calls(&self) -> usize {
        self.machine.lock().unwrap().exec_calls
    }

    /// Sessions that contained at least one mutation.
    pub fn mutating_execs(&self) -> usize {
        self.machine.lock().unwrap().mutating_execs
    }

    /// Labels of every session, in order.
    pub fn history(&self) -> Vec<String> {
        self.machine.lock().unwrap().history.clone()
    }
}

#[async_trait]
impl RemoteShell for FakeTarget {
    async fn exec(&self, address: &str, script: &Script) -> berth_remote::Result<ExecOutput> {
        let mut m = self.machine.lock().unwrap();
        m.exec_calls += 1;
        m.history.push(script.label().to_string());
        if !m.reachable || address != Self::ADDRESS {
            return Ok(ExecOutput {
                exit_code: berth_remote::ssh::SSH_TRANSPORT_FAILURE,
                stdout: String::new(),
                stderr: format!("ssh: connect to host {address} port 22: Connection refused"),
                duration_ms: 0,
            });
        }
        if !script.is_read_only() {
            m.mutating_execs += 1;
        }

        let mut stdout = String::new();
        for step in script.steps() {
            if let Step::Probe { fact, check } = step {
                let value = m.check(check);
                stdout.push_str(&format!("{FACT_MARKER} {fact}\t{value}\n"));
                continue;
            }
            if let Err(message) = m.apply(step) {
                return Ok(ExecOutput {
                    exit_code: 1,
                    stdout,
                    stderr: message,
                    duration_ms: 1,
                });
            }
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
            duration_ms: 1,
        })
    }
}

impl Machine {
    fn check(&mut self, check: &berth_remote::Check) -> String {
        use berth_remote::Check;
        let yes_no = |b: bool| if b { "yes" } else { "no" }.to_string();
        match check {
            Check::BootFinished => {
                if self.boot_pending > 0 {
                    self.boot_pending -= 1;
                    yes_no(false)
                } else {
                    yes_no(true)
                }
            }
            Check::UserExists { name } => yes_no(self.users.contains(name)),
            Check::CommandsPresent { commands } => {
                yes_no(commands.iter().all(|c| self.commands.contains(c)))
            }
            Check::FileExists { path } => yes_no(self.files.contains_key(path)),
            Check::FileDigest { path } => self
                .files
                .get(path)
                .map(|c| units::digest(c))
                .unwrap_or_else(|| "absent".to_string()),
            Check::EnvValue { path, key } => self
                .files
                .get(path)
                .and_then(|c| env_lookup(c, key))
                .unwrap_or_default(),
            Check::InstalledFrom { path, stamp } => {
                if !self.files.contains_key(path) {
                    "absent".to_string()
                } else {
                    self.first_line(stamp).unwrap_or_else(|| "none".to_string())
                }
            }
            Check::DigestRecorded { path, stamp } => {
                yes_no(self.first_line(stamp) == Some(self.digest_or_absent(path)))
            }
            Check::UnitPresent { unit } => yes_no(self.files.contains_key(&unit_path(unit))),
            Check::ServiceActive { unit } => yes_no(self.service(unit).active),
            Check::ServiceEnabled { unit } => yes_no(self.service(unit).enabled),
            Check::PortListening { port } => yes_no(
                self.ports
                    .iter()
                    .any(|(unit, p)| p == port && self.service(unit).active),
            ),
            Check::FirewallActive => yes_no(self.firewall),
            Check::OverlayOnline => yes_no(self.overlay_online),
            Check::OverlayServeRule {
                https_port,
                upstream_port,
            } => yes_no(self.serve_rules.contains(&(*https_port, *upstream_port))),
        }
    }

    fn first_line(&self, path: &str) -> Option<String> {
        self.files
            .get(path)
            .map(|c| c.lines().next().unwrap_or_default().to_string())
    }

    fn digest_or_absent(&self, path: &str) -> String {
        self.files
            .get(path)
            .map(|c| units::digest(c))
            .unwrap_or_else(|| "absent".to_string())
    }

    fn service(&self, unit: &str) -> Service {
        self.services
            .get(&unit_name(unit))
            .copied()
            .unwrap_or_default()
    }

    fn apply(&mut self, step: &Step) -> Result<(), String> {
        match step {
            Step::Probe { .. } => {}
            Step::EnsureUser { name, .. } => {
                self.users.insert(name.clone());
            }
            Step::InstallPackages { packages } => {
                self.commands.extend(packages.iter().cloned());
            }
            Step::WriteFile { path, contents, .. } => {
                self.files.insert(path.clone(), contents.clone());
            }
            Step::SetEnvValue { path, key, value } => {
                let current = self.files.get(path).cloned().unwrap_or_default();
                let prefix = format!("{key}=");
                let mut replaced = false;
                let mut lines: Vec<String> = current
                    .lines()
                    .map(|line| {
                        if line.starts_with(&prefix) {
                            replaced = true;
                            format!("{key}={}", value.expose())
                        } else {
                            line.to_string()
                        }
                    })
                    .collect();
                if !replaced {
                    lines.push(format!("{key}={}", value.expose()));
                }
                self.files.insert(path.clone(), format!("{}\n", lines.join("\n")));
            }
            Step::Download { url, dest, .. } => {
                if self.failing_urls.contains(url) {
                    return Err(format!("curl: (22) The requested URL returned error: 404 ({url})"));
                }
                self.files.insert(dest.clone(), format!("binary from {url}"));
            }
            Step::FetchRepo { url, dest, rev, .. } => {
                if self.failing_urls.contains(url) {
                    return Err(format!("fatal: repository '{url}' not found"));
                }
                self.repos.insert(dest.clone());
                self.files.insert(format!("{dest}/.git/HEAD"), rev.clone());
            }
            Step::Build { dir, artifact, .. } => {
                if !self.repos.contains(dir) {
                    return Err(format!("cd: {dir}: No such file or directory"));
                }
                self.files
                    .insert(format!("{}/{artifact}", dir.trim_end_matches('/')), "artifact".into());
            }
            Step::InstallArtifact { src, dest } => {
                let contents = self
                    .files
                    .get(src)
                    .cloned()
                    .ok_or_else(|| format!("install: cannot stat '{src}'"))?;
                self.files.insert(dest.clone(), contents);
            }
            Step::RecordDigest { path, stamp } => {
                let digest = self.digest_or_absent(path);
                self.files.insert(stamp.clone(), format!("{digest}\n"));
            }
            Step::DaemonReload => {}
            Step::Systemctl { verb, unit } => {
                let name = unit_name(unit);
                if *verb == UnitVerb::TryRestart && !self.service(unit).active {
                    return Ok(());
                }
                let definition = self
                    .files
                    .get(&unit_path(unit))
                    .cloned()
                    .ok_or_else(|| format!("Failed to {} {name}: Unit {name} not found.", verb.as_str()))?;
                let mut service = self.service(unit);
                match verb {
                    UnitVerb::Enable => service.enabled = true,
                    UnitVerb::Start | UnitVerb::Restart | UnitVerb::TryRestart => {
                        let binary = exec_start_binary(&definition).unwrap_or_default();
                        if !self.files.contains_key(&binary) {
                            return Err(format!(
                                "Job for {name} failed because the control process exited with error code."
                            ));
                        }
                        service.active = true;
                    }
                }
                self.services.insert(name, service);
            }
            Step::EnableFirewall { .. } => self.firewall = true,
            Step::MeshJoin { .. } => self.overlay_online = true,
            Step::MeshServe {
                https_port,
                upstream_port,
            } => {
                if !self.overlay_online {
                    return Err("tailscale: not logged in".to_string());
                }
                self.serve_rules.insert((*https_port, *upstream_port));
            }
        }
        Ok(())
    }
}

fn env_lookup(contents: &str, key: &str) -> Option<String> {
    let prefix = format!("{key}=");
    contents
        .lines()
        .filter_map(|l| l.strip_prefix(&prefix))
        .last()
        .map(str::to_string)
}

fn exec_start_binary(unit: &str) -> Option<String> {
    unit.lines()
        .find_map(|l| l.strip_prefix("ExecStart="))
        .and_then(|cmd| cmd.split_whitespace().next())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// FakeCloud
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CloudState {
    instances: BTreeMap<String, Instance>,
    /// `get` calls left before a new instance turns active.
    warming: BTreeMap<String, u32>,
    next_id: u64,
    created: usize,
    deleted: usize,
    never_activates: bool,
}

/// Cloud API keeping instances in memory. New instances become active with
/// [`FakeTarget::ADDRESS`] on their first `get`.
#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances created from now on stay in `new`.
    pub fn never_activate(&self) {
        self.state.lock().unwrap().never_activates = true;
    }

    /// Seed an existing instance.
    pub fn insert(&self, instance: Instance) {
        let mut state = self.state.lock().unwrap();
        state.instances.insert(instance.id.clone(), instance);
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn deleted(&self) -> usize {
        self.state.lock().unwrap().deleted
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.state.lock().unwrap().instances.values().cloned().collect()
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn find_by_tag(&self, tag: &str) -> berth_remote::Result<Option<Instance>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .values()
            .find(|i| i.tags.iter().any(|t| t == tag))
            .cloned())
    }

    async fn create(&self, spec: &InstanceSpec) -> berth_remote::Result<Instance> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        state.created += 1;
        let instance = Instance {
            id: format!("{}", 1000 + state.next_id),
            name: spec.name.clone(),
            status: InstanceStatus::New,
            public_ipv4: None,
            region: spec.region.clone(),
            size: spec.size.clone(),
            image: spec.image.clone(),
            tags: spec.tags.clone(),
        };
        let polls = if state.never_activates { u32::MAX } else { 1 };
        state.warming.insert(instance.id.clone(), polls);
        state.instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get(&self, id: &str) -> berth_remote::Result<Instance> {
        let mut state = self.state.lock().unwrap();
        let activate = match state.warming.get_mut(id) {
            Some(left) if *left == u32::MAX => false,
            Some(left) => {
                *left = left.saturating_sub(1);
                *left == 0
            }
            None => false,
        };
        if activate {
            state.warming.remove(id);
        }
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| RemoteError::InstanceNotFound(id.to_string()))?;
        if activate {
            instance.status = InstanceStatus::Active;
            instance.public_ipv4 = Some(FakeTarget::ADDRESS.to_string());
        }
        Ok(instance.clone())
    }

    async fn delete(&self, id: &str) -> berth_remote::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .instances
            .remove(id)
            .ok_or_else(|| RemoteError::InstanceNotFound(id.to_string()))?;
        state.deleted += 1;
        Ok(())
    }
}

/// An already-running instance tagged for `config`, as the cloud would
/// report it.
pub fn running_instance(config: &Config) -> Instance {
    Instance {
        id: "4242".to_string(),
        name: config.identity.clone(),
        status: InstanceStatus::Active,
        public_ipv4: Some(FakeTarget::ADDRESS.to_string()),
        region: config.cloud.region.clone(),
        size: config.cloud.size.clone(),
        image: config.cloud.image.clone(),
        tags: vec![crate::resolver::tag_for(&config.identity)],
    }
}

// ---------------------------------------------------------------------------
// Generators and config
// ---------------------------------------------------------------------------

/// Deterministic generator that counts how often it was asked.
#[derive(Debug, Default)]
pub struct CountingGenerator {
    calls: AtomicUsize,
}

impl CountingGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SecretGenerator for CountingGenerator {
    fn generate(&self) -> String {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{n:064x}")
    }
}

/// Config for tests: local state under `state_dir`, dashboard on, short waits.
pub fn test_config(state_dir: &Path) -> Config {
    let mut config = Config::default();
    config.identity = "test".to_string();
    config.state_dir = state_dir.to_path_buf();
    config.cloud.token = Some("test-token".to_string());
    config.cloud.ssh_keys = vec!["aa:bb:cc".to_string()];
    config.cloud.create_timeout_secs = 5;
    config.cloud.poll_interval_secs = 1;
    config.ssh.connectivity_timeout_secs = 5;
    config.ssh.poll_interval_secs = 1;
    config.platform.init_timeout_secs = 5;
    config.platform.poll_interval_secs = 1;
    config.gateway.binary_url = Some("https://releases.example.com/gateway".to_string());
    config.dashboard.repo_url = "https://git.example.com/dashboard.git".to_string();
    config.hook.binary_url = Some("https://releases.example.com/berthd".to_string());
    config.smoke.max_wait_secs = 5;
    config.smoke.interval_secs = 1;
    config
}
