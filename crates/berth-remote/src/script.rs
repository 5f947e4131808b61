//! Typed remote scripts
//!
//! A [`Script`] is an ordered list of [`Step`]s that is shipped to the target
//! as one session. Steps are either read-only probes (a named [`Check`] whose
//! one-line answer is echoed back behind [`FACT_MARKER`]) or idempotent
//! mutations. Rendering to bash happens in exactly one place so the SSH
//! channel and the in-memory fakes agree on what a script means.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Prefix of every fact line in probe output.
pub const FACT_MARKER: &str = "@@berth-fact@@";

/// Directory holding systemd unit definitions on the target.
pub const UNIT_DIR: &str = "/etc/systemd/system";

/// A string that must never show up in logs or `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Redacted(pub String);

impl Redacted {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Redacted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Redacted(***)")
    }
}

impl From<&str> for Redacted {
    fn from(value: &str) -> Self {
        Redacted(value.to_string())
    }
}

impl From<String> for Redacted {
    fn from(value: String) -> Self {
        Redacted(value)
    }
}

/// A read-only observation about the target. Each check renders to a shell
/// snippet printing exactly one line; boolean checks print `yes` or `no`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    /// cloud-init finished its first boot
    BootFinished,
    UserExists { name: String },
    /// every listed command resolves on PATH
    CommandsPresent { commands: Vec<String> },
    FileExists { path: String },
    /// sha256 of the file, or `absent`
    FileDigest { path: String },
    /// first line of `stamp` when `path` exists, else `absent`
    InstalledFrom { path: String, stamp: String },
    /// `stamp` holds the current sha256 of `path` (`absent` for no file)
    DigestRecorded { path: String, stamp: String },
    /// value of `KEY=` in an env file, empty when missing
    EnvValue { path: String, key: String },
    UnitPresent { unit: String },
    ServiceActive { unit: String },
    ServiceEnabled { unit: String },
    PortListening { port: u16 },
    FirewallActive,
    OverlayOnline,
    /// mesh overlay proxies `https_port` to the loopback `upstream_port`
    OverlayServeRule { https_port: u16, upstream_port: u16 },
}

impl Check {
    /// Render the shell snippet for this check.
    pub fn render(&self) -> String {
        match self {
            Check::BootFinished => {
                "test -f /var/lib/cloud/instance/boot-finished && echo yes || echo no".to_string()
            }
            Check::UserExists { name } => {
                format!("id -u {} >/dev/null 2>&1 && echo yes || echo no", q(name))
            }
            Check::CommandsPresent { commands } => {
                let list = commands.iter().map(|c| q(c)).collect::<Vec<_>>().join(" ");
                format!(
                    "for c in {list}; do command -v \"$c\" >/dev/null 2>&1 || {{ echo no; exit 0; }}; done; echo yes"
                )
            }
            Check::FileExists { path } => format!("test -e {} && echo yes || echo no", q(path)),
            Check::FileDigest { path } => format!(
                "if test -f {p}; then sha256sum {p} | cut -d' ' -f1; else echo absent; fi",
                p = q(path)
            ),
            Check::InstalledFrom { path, stamp } => format!(
                "if test -e {}; then head -n1 {} 2>/dev/null || echo none; else echo absent; fi",
                q(path),
                q(stamp)
            ),
            Check::DigestRecorded { path, stamp } => format!(
                "test \"$({})\" = \"$(head -n1 {} 2>/dev/null)\" && echo yes || echo no",
                digest_or_absent(path),
                q(stamp)
            ),
            Check::EnvValue { path, key } => format!(
                "sed -n {} {} | tail -n1",
                q(&format!("s/^{key}=//p")),
                q(path)
            ),
            Check::UnitPresent { unit } => format!(
                "test -f {} && echo yes || echo no",
                q(&unit_path(unit))
            ),
            Check::ServiceActive { unit } => format!(
                "systemctl is-active --quiet {} && echo yes || echo no",
                q(&unit_name(unit))
            ),
            Check::ServiceEnabled { unit } => format!(
                "systemctl is-enabled --quiet {} && echo yes || echo no",
                q(&unit_name(unit))
            ),
            Check::PortListening { port } => format!(
                "ss -ltnH {} | grep -q . && echo yes || echo no",
                q(&format!("sport = :{port}"))
            ),
            Check::FirewallActive => {
                "ufw status | grep -q '^Status: active' && echo yes || echo no".to_string()
            }
            Check::OverlayOnline => format!(
                "tailscale status --json | tr -d ' \\n\\t' | grep -qF {} && echo yes || echo no",
                q("\"BackendState\":\"Running\"")
            ),
            Check::OverlayServeRule {
                https_port,
                upstream_port,
            } => format!(
                "tailscale serve status --json | tr -d ' \\n\\t' | grep -qF {} && echo yes || echo no",
                q(&format!(
                    ":{https_port}\":{{\"Handlers\":{{\"/\":{{\"Proxy\":\"http://127.0.0.1:{upstream_port}\""
                ))
            ),
        }
    }
}

/// systemctl verbs the engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitVerb {
    Enable,
    Start,
    Restart,
    /// Restart only if running.
    TryRestart,
}

impl UnitVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitVerb::Enable => "enable",
            UnitVerb::Start => "start",
            UnitVerb::Restart => "restart",
            UnitVerb::TryRestart => "try-restart",
        }
    }
}

/// One step of a remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Read-only: print `fact` with the answer of `check`.
    Probe { fact: String, check: Check },
    EnsureUser { name: String, home: String },
    InstallPackages { packages: Vec<String> },
    /// Atomic write; contents travel base64-encoded.
    WriteFile {
        path: String,
        contents: String,
        mode: u32,
        owner: String,
    },
    /// Insert or replace `KEY=value` in a 0600 env file.
    SetEnvValue {
        path: String,
        key: String,
        value: Redacted,
    },
    Download { url: String, dest: String, mode: u32 },
    /// Clone or fetch, then check out `rev` (a branch tracks its remote head).
    FetchRepo {
        url: String,
        rev: String,
        dest: String,
        owner: String,
    },
    /// Run `command` as `user` inside `dir`; `artifact` (relative to `dir`)
    /// must exist afterwards.
    Build {
        dir: String,
        command: String,
        user: String,
        artifact: String,
    },
    InstallArtifact { src: String, dest: String },
    /// Write the sha256 of `path` (or `absent`) to `stamp`.
    RecordDigest { path: String, stamp: String },
    DaemonReload,
    Systemctl { verb: UnitVerb, unit: String },
    EnableFirewall { allow: Vec<String> },
    MeshJoin { auth_key: Redacted, hostname: String },
    MeshServe { https_port: u16, upstream_port: u16 },
}

impl Step {
    /// Whether this step changes the target.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Step::Probe { .. })
    }

    /// Render the bash lines for this step.
    pub fn render(&self) -> String {
        match self {
            Step::Probe { fact, check } => format!(
                "printf '%s %s\\t%s\\n' {} {} \"$( {{ {}; }} 2>/dev/null | head -n1 | tr -d '\\r' )\"",
                q(FACT_MARKER),
                q(fact),
                check.render()
            ),
            Step::EnsureUser { name, home } => format!(
                "id -u {n} >/dev/null 2>&1 || useradd --system --create-home --home-dir {h} --shell /usr/sbin/nologin {n}",
                n = q(name),
                h = q(home)
            ),
            Step::InstallPackages { packages } => {
                let list = packages.iter().map(|p| q(p)).collect::<Vec<_>>().join(" ");
                format!(
                    "export DEBIAN_FRONTEND=noninteractive\napt-get update -qq\napt-get install -y -qq {list}"
                )
            }
            Step::WriteFile {
                path,
                contents,
                mode,
                owner,
            } => {
                let tmp = format!("{path}.berth-tmp");
                format!(
                    "install -d -m 755 {dir}\nprintf '%s' {payload} | base64 -d > {tmp}\nchmod {mode:o} {tmp}\nchown {owner} {tmp}\nmv -f {tmp} {path}",
                    dir = q(&parent_dir(path)),
                    payload = q(&BASE64.encode(contents.as_bytes())),
                    tmp = q(&tmp),
                    owner = q(owner),
                    path = q(path),
                )
            }
            Step::SetEnvValue { path, key, value } => format!(
                "install -d -m 755 {dir}\ntouch {p}\nchmod 600 {p}\nif grep -q {pattern} {p}; then sed -i {expr} {p}; else printf '%s=%s\\n' {k} {v} >> {p}; fi",
                dir = q(&parent_dir(path)),
                p = q(path),
                pattern = q(&format!("^{key}=")),
                expr = q(&format!("s|^{key}=.*|{key}={}|", value.expose())),
                k = q(key),
                v = q(value.expose()),
            ),
            Step::Download { url, dest, mode } => {
                let tmp = format!("{dest}.berth-tmp");
                format!(
                    "install -d -m 755 {dir}\ncurl -fsSL --retry 3 -o {tmp} {url}\nchmod {mode:o} {tmp}\nmv -f {tmp} {dest}",
                    dir = q(&parent_dir(dest)),
                    tmp = q(&tmp),
                    url = q(url),
                    dest = q(dest),
                )
            }
            Step::FetchRepo {
                url,
                rev,
                dest,
                owner,
            } => format!(
                "if [ -d {git_dir} ]; then git -C {d} fetch --quiet origin; else git clone --quiet {u} {d}; fi\ngit -C {d} checkout --quiet --detach {remote_rev} 2>/dev/null || git -C {d} checkout --quiet --detach {r}\nchown -R {o} {d}",
                git_dir = q(&format!("{dest}/.git")),
                d = q(dest),
                u = q(url),
                r = q(rev),
                remote_rev = q(&format!("origin/{rev}")),
                o = q(owner),
            ),
            Step::Build {
                dir,
                command,
                user,
                artifact,
            } => format!(
                "cd {d}\nrunuser -u {u} -- bash -lc {c}\ntest -f {a}\ncd /",
                d = q(dir),
                u = q(user),
                c = q(command),
                a = q(&format!("{}/{}", dir.trim_end_matches('/'), artifact)),
            ),
            Step::InstallArtifact { src, dest } => {
                format!("install -m 755 {} {}", q(src), q(dest))
            }
            Step::RecordDigest { path, stamp } => format!(
                "install -d -m 755 {}\n{} > {}",
                q(&parent_dir(stamp)),
                digest_or_absent(path),
                q(stamp)
            ),
            Step::DaemonReload => "systemctl daemon-reload".to_string(),
            // try-restart fails on a unit that was never loaded
            Step::Systemctl {
                verb: UnitVerb::TryRestart,
                unit,
            } => {
                let unit = q(&unit_name(unit));
                format!("if systemctl is-active --quiet {unit}; then systemctl restart {unit}; fi")
            }
            Step::Systemctl { verb, unit } => {
                format!("systemctl {} {}", verb.as_str(), q(&unit_name(unit)))
            }
            Step::EnableFirewall { allow } => {
                let mut lines: Vec<String> =
                    allow.iter().map(|rule| format!("ufw allow {}", q(rule))).collect();
                lines.push("ufw --force enable".to_string());
                lines.join("\n")
            }
            Step::MeshJoin { auth_key, hostname } => format!(
                "command -v tailscale >/dev/null 2>&1 || curl -fsSL https://tailscale.com/install.sh | sh\ntailscale up {} {}",
                q(&format!("--authkey={}", auth_key.expose())),
                q(&format!("--hostname={hostname}")),
            ),
            Step::MeshServe {
                https_port,
                upstream_port,
            } => format!(
                "tailscale serve --bg --https={https_port} http://127.0.0.1:{upstream_port}"
            ),
        }
    }
}

/// An ordered list of steps executed as one remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    label: String,
    steps: Vec<Step>,
}

impl Script {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            steps: Vec::new(),
        }
    }

    /// Append a probe for `fact`.
    pub fn probe(mut self, fact: impl Into<String>, check: Check) -> Self {
        self.steps.push(Step::Probe {
            fact: fact.into(),
            check,
        });
        self
    }

    /// Append any step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = Step>) {
        self.steps.extend(steps);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True iff every step is a probe.
    pub fn is_read_only(&self) -> bool {
        self.steps.iter().all(|s| !s.is_mutation())
    }

    /// Render the whole script as one bash body for `bash -s`.
    ///
    /// Mutating scripts run under `set -euo pipefail` so the first failing
    /// step aborts the session; probes never abort it.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# berth: {}\n", self.label));
        if self.is_read_only() {
            out.push_str("set -u\n");
        } else {
            out.push_str("set -euo pipefail\n");
        }
        for step in &self.steps {
            out.push_str(&step.render());
            out.push('\n');
        }
        out
    }
}

/// Extract `fact -> value` pairs from probe output. Non-fact lines are ignored.
pub fn parse_facts(stdout: &str) -> BTreeMap<String, String> {
    let mut facts = BTreeMap::new();
    for line in stdout.lines() {
        let Some(rest) = line.strip_prefix(FACT_MARKER) else {
            continue;
        };
        let rest = rest.trim_start_matches(' ');
        let (name, value) = rest.split_once('\t').unwrap_or((rest, ""));
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        facts.insert(name.to_string(), value.trim().to_string());
    }
    facts
}

/// Full unit name for a service (`gateway` -> `gateway.service`).
pub fn unit_name(unit: &str) -> String {
    if unit.ends_with(".service") {
        unit.to_string()
    } else {
        format!("{unit}.service")
    }
}

/// Path of the unit definition for a service.
pub fn unit_path(unit: &str) -> String {
    format!("{UNIT_DIR}/{}", unit_name(unit))
}

fn parent_dir(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

/// sha256 of `path` as `sha256sum` prints it, `absent` when unreadable.
fn digest_or_absent(path: &str) -> String {
    format!(
        "{{ sha256sum {} 2>/dev/null || echo absent; }} | cut -d' ' -f1",
        q(path)
    )
}

fn q(s: &str) -> String {
    shell_words::quote(s).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_probe_only_script_is_read_only() {
        let script = Script::new("probe")
            .probe("gateway-active", Check::ServiceActive { unit: "gateway".into() })
            .probe("firewall-active", Check::FirewallActive);
        assert!(script.is_read_only());
        let body = script.render();
        assert!(body.contains("set -u\n"));
        assert!(!body.contains("set -e"));
        assert_eq!(body.matches(FACT_MARKER).count(), 2);
    }

    #[test]
    fn test_mutating_script_aborts_on_error() {
        let script = Script::new("restart").step(Step::Systemctl {
            verb: UnitVerb::Restart,
            unit: "gateway".into(),
        });
        assert!(!script.is_read_only());
        let body = script.render();
        assert!(body.contains("set -euo pipefail"));
        assert!(body.contains("systemctl restart gateway.service"));

        let guarded = Script::new("try").step(Step::Systemctl {
            verb: UnitVerb::TryRestart,
            unit: "gateway".into(),
        });
        assert!(guarded
            .render()
            .contains("if systemctl is-active --quiet gateway.service; then systemctl restart gateway.service; fi"));
    }

    #[test]
    fn test_write_file_ships_base64_payload() {
        let step = Step::WriteFile {
            path: "/etc/berth/gateway.env".into(),
            contents: "GATEWAY_PORT=18789\n".into(),
            mode: 0o644,
            owner: "root:root".into(),
        };
        let body = step.render();
        assert!(body.contains(&BASE64.encode("GATEWAY_PORT=18789\n")));
        assert!(body.contains("chmod 644"));
        assert!(body.contains("install -d -m 755 /etc/berth"));
        assert!(!body.contains("GATEWAY_PORT=18789"));
    }

    #[test]
    fn test_paths_with_spaces_are_quoted() {
        let check = Check::FileExists {
            path: "/opt/my app/bin".into(),
        };
        assert!(check.render().contains("'/opt/my app/bin'"));
    }

    #[test]
    fn test_secret_values_do_not_leak_through_debug() {
        let step = Step::SetEnvValue {
            path: "/etc/berth/gateway.secret.env".into(),
            key: "GATEWAY_AUTH_TOKEN".into(),
            value: Redacted("s3cr3t-value".into()),
        };
        let debug = format!("{:?}", step);
        assert!(!debug.contains("s3cr3t-value"));
        assert!(step.render().contains("s3cr3t-value"));
    }

    #[test]
    fn test_unit_names() {
        assert_eq!(unit_name("gateway"), "gateway.service");
        assert_eq!(unit_name("gateway.service"), "gateway.service");
        assert_eq!(unit_path("hook"), "/etc/systemd/system/hook.service");
    }

    #[test]
    fn test_parse_facts_ignores_noise() {
        let stdout = format!(
            "motd line\n{m} gateway-active\tyes\n{m} gateway-config-current\tabsent\r\n{m} empty-value\t\nstray\n",
            m = FACT_MARKER
        );
        let facts = parse_facts(&stdout);
        assert_eq!(facts.len(), 3);
        assert_eq!(facts["gateway-active"], "yes");
        assert_eq!(facts["gateway-config-current"], "absent");
        assert_eq!(facts["empty-value"], "");
    }

    #[test]
    fn test_rendered_probe_runs_under_bash() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let env_file = dir.join("gateway.secret.env");
        std::fs::write(&env_file, "OTHER=1\nGATEWAY_AUTH_TOKEN=abc123\n").unwrap();
        let env_path = env_file.to_string_lossy().to_string();

        let script = Script::new("local")
            .probe("present", Check::FileExists { path: env_path.clone() })
            .probe(
                "missing",
                Check::FileExists {
                    path: dir.join("nope").to_string_lossy().to_string(),
                },
            )
            .probe(
                "token",
                Check::EnvValue {
                    path: env_path,
                    key: "GATEWAY_AUTH_TOKEN".into(),
                },
            );

        let output = Command::new("bash")
            .arg("-c")
            .arg(script.render())
            .output()
            .expect("bash available");

        assert!(output.status.success());
        let facts = parse_facts(&String::from_utf8_lossy(&output.stdout));
        assert_eq!(facts["present"], "yes");
        assert_eq!(facts["missing"], "no");
        assert_eq!(facts["token"], "abc123");
    }

    #[test]
    fn test_recorded_digest_tracks_file_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let secret = tmp.path().join("gateway.secret.env");
        let stamp = tmp.path().join("state/gateway.secret.applied");
        std::fs::write(&secret, "GATEWAY_AUTH_TOKEN=one\n").unwrap();
        let path = secret.to_string_lossy().to_string();
        let stamp = stamp.to_string_lossy().to_string();
        let check = Check::DigestRecorded {
            path: path.clone(),
            stamp: stamp.clone(),
        };
        let run = |script: &Script| {
            let output = Command::new("bash")
                .arg("-c")
                .arg(script.render())
                .output()
                .expect("bash available");
            assert!(output.status.success());
            parse_facts(&String::from_utf8_lossy(&output.stdout))
        };
        let probe = Script::new("probe").probe("loaded", check);

        assert_eq!(run(&probe)["loaded"], "no");
        run(&Script::new("record").step(Step::RecordDigest {
            path: path.clone(),
            stamp,
        }));
        assert_eq!(run(&probe)["loaded"], "yes");

        std::fs::write(&secret, "GATEWAY_AUTH_TOKEN=two\n").unwrap();
        assert_eq!(run(&probe)["loaded"], "no");
    }

    #[test]
    fn test_installed_from_reads_stamp_only_with_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = tmp.path().join("gateway");
        let stamp = tmp.path().join("gateway.source");
        std::fs::write(&stamp, "https://releases.example.com/gateway\n").unwrap();
        let script = Script::new("probe").probe(
            "source",
            Check::InstalledFrom {
                path: binary.to_string_lossy().to_string(),
                stamp: stamp.to_string_lossy().to_string(),
            },
        );
        let run = || {
            let output = Command::new("bash")
                .arg("-c")
                .arg(script.render())
                .output()
                .expect("bash available");
            parse_facts(&String::from_utf8_lossy(&output.stdout))
        };

        assert_eq!(run()["source"], "absent");
        std::fs::write(&binary, "bin").unwrap();
        assert_eq!(run()["source"], "https://releases.example.com/gateway");
    }
}
