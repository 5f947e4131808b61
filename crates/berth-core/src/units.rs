//! Files Berth places on the target.
//!
//! Each file is rendered here and nowhere else. The phase that writes it and
//! the fact that digests it use the same bytes, so "is the config current" has
//! one answer.

use berth_remote::unit_name;
use sha2::{Digest, Sha256};

use crate::config::Config;

/// Configuration directory on the target.
pub const CONFIG_DIR: &str = "/etc/berth";
/// Installed binaries.
pub const BIN_DIR: &str = "/usr/local/bin";
/// Mutable state on the target.
pub const STATE_DIR: &str = "/var/lib/berth";

/// Name of the installed push listener binary.
pub const HOOK_BINARY: &str = "berthd";

pub fn gateway_binary_path(config: &Config) -> String {
    format!("{BIN_DIR}/{}", config.gateway.binary)
}

pub fn dashboard_binary_path(config: &Config) -> String {
    format!("{BIN_DIR}/{}", config.dashboard.binary)
}

pub fn hook_binary_path() -> String {
    format!("{BIN_DIR}/{HOOK_BINARY}")
}

/// Home of the operating identity.
pub fn operator_home(config: &Config) -> String {
    format!("{STATE_DIR}/{}", config.gateway.user)
}

pub fn gateway_env_path() -> String {
    format!("{CONFIG_DIR}/gateway.env")
}

/// Holds only the gateway secret, so `gateway.env` digests never cover it.
pub fn gateway_secret_path() -> String {
    format!("{CONFIG_DIR}/gateway.secret.env")
}

pub fn hook_secret_path() -> String {
    format!("{CONFIG_DIR}/hook.secret.env")
}

/// Env key of the hook secret on the target.
pub const HOOK_SECRET_KEY: &str = "BERTH_HOOK_SECRET";

pub fn rebuild_script_path() -> String {
    format!("{BIN_DIR}/berth-rebuild-dashboard")
}

pub fn hook_lock_path() -> String {
    format!("{STATE_DIR}/hook.lock")
}

/// What the installed binary of `component` was fetched or built from.
pub fn source_stamp_path(component: &str) -> String {
    format!("{STATE_DIR}/{component}.source")
}

/// Digest of the secret file `unit` loaded at its last restart.
pub fn secret_stamp_path(unit: &str) -> String {
    format!("{STATE_DIR}/{unit}.secret.applied")
}

/// Identifies one dashboard build: repository, revision, command, artifact.
pub fn dashboard_source(config: &Config) -> String {
    let dashboard = &config.dashboard;
    digest(&format!(
        "{}\n{}\n{}\n{}\n",
        dashboard.repo_url, dashboard.rev, dashboard.build_command, dashboard.artifact
    ))
}

/// Non-secret gateway environment.
pub fn gateway_env(config: &Config) -> String {
    let gateway = &config.gateway;
    let mut out = String::from("# managed by berth\n");
    out.push_str(&format!("GATEWAY_BIND={}\n", gateway.bind));
    out.push_str(&format!("GATEWAY_PORT={}\n", gateway.port));
    for (key, value) in &gateway.env {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}

pub fn gateway_unit(config: &Config) -> String {
    let gateway = &config.gateway;
    let exec = format!("{} {}", gateway_binary_path(config), gateway.args)
        .trim_end()
        .to_string();
    format!(
        "# managed by berth\n\
         [Unit]\n\
         Description=Berth gateway ({identity})\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         User={user}\n\
         WorkingDirectory={home}\n\
         EnvironmentFile={env}\n\
         EnvironmentFile={secret}\n\
         ExecStart={exec}\n\
         Restart=always\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        identity = config.identity,
        user = gateway.user,
        home = operator_home(config),
        env = gateway_env_path(),
        secret = gateway_secret_path(),
    )
}

/// Dashboard unit; it cannot outlive the gateway.
pub fn dashboard_unit(config: &Config) -> String {
    let gateway_unit = unit_name(&config.gateway.service);
    format!(
        "# managed by berth\n\
         [Unit]\n\
         Description=Berth gateway dashboard ({identity})\n\
         Requires={gateway_unit}\n\
         After={gateway_unit}\n\
         \n\
         [Service]\n\
         Type=simple\n\
         User={user}\n\
         Environment=DASHBOARD_PORT={port}\n\
         Environment=GATEWAY_URL=http://{bind}:{gateway_port}\n\
         EnvironmentFile={secret}\n\
         ExecStart={exec}\n\
         Restart=always\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        identity = config.identity,
        user = config.gateway.user,
        port = config.dashboard.port,
        bind = config.gateway.bind,
        gateway_port = config.gateway.port,
        secret = gateway_secret_path(),
        exec = dashboard_binary_path(config),
    )
}

pub fn hook_unit(config: &Config) -> String {
    let hook = &config.hook;
    format!(
        "# managed by berth\n\
         [Unit]\n\
         Description=Berth push listener ({identity})\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         EnvironmentFile={secret}\n\
         ExecStart={exec} --bind 0.0.0.0:{port} --ref refs/heads/{branch} --script {script} --lock {lock} --stale-after-secs {stale}\n\
         Restart=always\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        identity = config.identity,
        secret = hook_secret_path(),
        exec = hook_binary_path(),
        port = hook.port,
        branch = hook.branch,
        script = rebuild_script_path(),
        lock = hook_lock_path(),
        stale = hook.stale_after_secs,
    )
}

/// Script the push listener runs: fetch, build, install, restart.
pub fn rebuild_script(config: &Config) -> String {
    let dashboard = &config.dashboard;
    let dir = &dashboard.install_dir;
    let artifact = format!("{}/{}", dir.trim_end_matches('/'), dashboard.artifact);
    format!(
        "#!/usr/bin/env bash\n\
         # managed by berth\n\
         set -euo pipefail\n\
         git -C {dir} fetch --quiet origin\n\
         git -C {dir} checkout --quiet --detach origin/{branch}\n\
         chown -R {user} {dir}\n\
         cd {dir}\n\
         runuser -u {user} -- bash -lc {build}\n\
         install -m 755 {artifact} {dest}\n\
         systemctl restart {unit}\n",
        dir = quote(dir),
        branch = config.hook.branch,
        user = config.gateway.user,
        build = quote(&dashboard.build_command),
        artifact = quote(&artifact),
        dest = quote(&dashboard_binary_path(config)),
        unit = unit_name(&dashboard.service),
    )
}

/// sha256 hex of rendered contents, as `sha256sum` prints it.
pub fn digest(contents: &str) -> String {
    hex::encode(Sha256::digest(contents.as_bytes()))
}

fn quote(s: &str) -> String {
    shell_words::quote(s).into_owned()
}
