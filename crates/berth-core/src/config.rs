//! Layered configuration.
//!
//! Resolved once at startup: built-in defaults, then the user TOML file, then
//! environment overrides, then CLI flags. The result is immutable and passed
//! by reference to every component; nothing re-reads it mid-run.

use berth_remote::cloud::DIGITALOCEAN_API_URL;
use berth_remote::SshOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{is_well_formed_secret, DeployError, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "BERTH_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deployment identity; one target per identity.
    pub identity: String,
    /// Local durable state (credential escrow).
    pub state_dir: PathBuf,
    pub cloud: CloudConfig,
    pub ssh: SshConfig,
    pub platform: PlatformConfig,
    pub gateway: GatewayConfig,
    pub dashboard: DashboardConfig,
    pub mesh: MeshConfig,
    pub hook: HookConfig,
    pub smoke: SmokeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            identity: "berth".to_string(),
            state_dir: home_dir().join(".berth"),
            cloud: CloudConfig::default(),
            ssh: SshConfig::default(),
            platform: PlatformConfig::default(),
            gateway: GatewayConfig::default(),
            dashboard: DashboardConfig::default(),
            mesh: MeshConfig::default(),
            hook: HookConfig::default(),
            smoke: SmokeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub region: String,
    pub size: String,
    pub image: String,
    /// SSH key fingerprints installed on creation.
    pub ssh_keys: Vec<String>,
    pub create_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            api_url: DIGITALOCEAN_API_URL.to_string(),
            token: None,
            region: "nyc3".to_string(),
            size: "s-2vcpu-4gb".to_string(),
            image: "ubuntu-24-04-x64".to_string(),
            ssh_keys: Vec::new(),
            create_timeout_secs: 300,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// How long to wait for a fresh target to accept sessions.
    pub connectivity_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
            command_timeout_secs: 900,
            connectivity_timeout_secs: 300,
            poll_interval_secs: 5,
        }
    }
}

impl SshConfig {
    pub fn to_options(&self) -> SshOptions {
        SshOptions {
            user: self.user.clone(),
            port: self.port,
            identity_file: self.identity_file.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
            command_timeout_secs: self.command_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub init_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub packages: Vec<String>,
    /// Commands whose presence proves the packages are installed.
    pub required_commands: Vec<String>,
    pub firewall_allow: Vec<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            init_timeout_secs: 600,
            poll_interval_secs: 5,
            packages: ["curl", "git", "ufw", "build-essential", "ca-certificates"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            required_commands: ["curl", "git", "ufw"].iter().map(|s| s.to_string()).collect(),
            firewall_allow: vec!["OpenSSH".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub service: String,
    /// Operating identity the gateway runs as.
    pub user: String,
    pub binary: String,
    /// Where to fetch the gateway binary when it is not installed.
    pub binary_url: Option<String>,
    pub args: String,
    pub bind: String,
    pub port: u16,
    /// Extra `KEY=value` lines for the gateway env file.
    pub env: BTreeMap<String, String>,
    /// Env key holding the auth secret on the target.
    pub secret_key: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            service: "gateway".to_string(),
            user: "gateway".to_string(),
            binary: "gateway".to_string(),
            binary_url: None,
            args: "serve".to_string(),
            bind: "127.0.0.1".to_string(),
            port: 18789,
            env: BTreeMap::new(),
            secret_key: "GATEWAY_AUTH_TOKEN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub service: String,
    pub binary: String,
    pub repo_url: String,
    pub rev: String,
    pub build_command: String,
    /// Build output, relative to the checkout.
    pub artifact: String,
    pub port: u16,
    pub install_dir: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            enabled: true,
            service: "gateway-dashboard".to_string(),
            binary: "gateway-dashboard".to_string(),
            repo_url: String::new(),
            rev: "main".to_string(),
            build_command: "cargo build --release".to_string(),
            artifact: "target/release/gateway-dashboard".to_string(),
            port: 3000,
            install_dir: "/opt/berth/dashboard".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub auth_key: Option<String>,
    pub hostname: Option<String>,
    pub gateway_https_port: u16,
    pub dashboard_https_port: u16,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            enabled: false,
            auth_key: None,
            hostname: None,
            gateway_https_port: 443,
            dashboard_https_port: 8443,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub enabled: bool,
    pub service: String,
    pub binary_url: Option<String>,
    /// Shared webhook secret; generated and escrowed when unset.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub branch: String,
    pub port: u16,
    pub stale_after_secs: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        HookConfig {
            enabled: false,
            service: "berth-hook".to_string(),
            binary_url: None,
            secret: None,
            branch: "main".to_string(),
            port: 9000,
            stale_after_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmokeConfig {
    pub max_wait_secs: u64,
    pub interval_secs: u64,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        SmokeConfig {
            max_wait_secs: 120,
            interval_secs: 5,
        }
    }
}

impl Config {
    /// Resolve defaults, file and environment.
    ///
    /// `path` wins over `$BERTH_CONFIG`, which wins over
    /// `~/.config/berth/config.toml` (used only if it exists).
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match Self::locate_file(path)? {
            Some(file) => Self::from_file(&file)?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn locate_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(DeployError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path.to_path_buf()));
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::locate_file(Some(Path::new(&path)));
        }
        let default = home_dir().join(".config").join("berth").join("config.toml");
        Ok(default.exists().then_some(default))
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
            .map_err(|e| DeployError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(raw: &str) -> Result<Config> {
        toml::from_str(raw).map_err(|e| DeployError::Config(e.to_string()))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(identity) = non_empty("BERTH_IDENTITY") {
            self.identity = identity;
        }
        if let Some(dir) = non_empty("BERTH_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(token) = non_empty("DIGITALOCEAN_TOKEN") {
            self.cloud.token = Some(token);
        }
        if let Some(key) = non_empty("TS_AUTHKEY") {
            self.mesh.auth_key = Some(key);
        }
        if let Some(secret) = non_empty("BERTH_HOOK_SECRET") {
            self.hook.secret = Some(secret);
        }
    }

    /// CLI flag layer.
    pub fn with_identity(mut self, identity: Option<&str>) -> Self {
        if let Some(identity) = identity {
            self.identity = identity.to_string();
        }
        self
    }

    /// Pre-flight checks; no remote action happens before these pass.
    pub fn validate(&self) -> Result<()> {
        self.validate_identity()?;
        if self.gateway.port == 0 || self.gateway.binary.trim().is_empty() {
            return Err(DeployError::Config(
                "gateway.port and gateway.binary must be set".to_string(),
            ));
        }
        if self.dashboard.enabled && self.dashboard.repo_url.trim().is_empty() {
            return Err(DeployError::Config(
                "dashboard.repo_url is required (or set dashboard.enabled = false)".to_string(),
            ));
        }
        if self.mesh.enabled && self.mesh.auth_key.is_none() {
            return Err(DeployError::Prerequisite(
                "mesh is enabled but no auth key is configured (set TS_AUTHKEY or mesh.auth_key)"
                    .to_string(),
            ));
        }
        if self.hook.enabled {
            if !self.dashboard.enabled {
                return Err(DeployError::Config(
                    "hook.enabled requires the dashboard, which is what it rebuilds".to_string(),
                ));
            }
            if self.hook.binary_url.is_none() {
                return Err(DeployError::Config(
                    "hook.binary_url is required when hook.enabled is set".to_string(),
                ));
            }
            if let Some(secret) = &self.hook.secret {
                if !is_well_formed_secret(secret) {
                    return Err(DeployError::Config(
                        "hook.secret must be at least 32 characters of [A-Za-z0-9_-]".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The identity alone; enough for flows that only name local state or
    /// the tagged instance.
    pub fn validate_identity(&self) -> Result<()> {
        if self.identity.is_empty()
            || self.identity.len() > 48
            || !self
                .identity
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(DeployError::Config(format!(
                "identity {:?} must be 1-48 characters of [a-z0-9-]",
                self.identity
            )));
        }
        Ok(())
    }

    /// Local state directory of this identity.
    pub fn identity_dir(&self) -> PathBuf {
        self.state_dir.join(&self.identity)
    }

    pub fn mesh_hostname(&self) -> String {
        self.mesh
            .hostname
            .clone()
            .unwrap_or_else(|| self.identity.clone())
    }
}

/// Seconds to `Duration`.
pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.identity = "prod".to_string();
        config.dashboard.repo_url = "https://github.com/example/dashboard.git".to_string();
        config
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            identity = "staging"

            [gateway]
            port = 19000

            [mesh]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.identity, "staging");
        assert_eq!(config.gateway.port, 19000);
        assert_eq!(config.gateway.service, "gateway");
        assert!(config.mesh.enabled);
        assert_eq!(config.mesh.dashboard_https_port, 8443);
        assert_eq!(config.cloud.region, "nyc3");
    }

    #[test]
    fn test_unparseable_file_is_config_error() {
        let err = Config::from_toml_str("identity = [").unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = valid();
        config.apply_env(|key| match key {
            "BERTH_IDENTITY" => Some("edge".to_string()),
            "DIGITALOCEAN_TOKEN" => Some("dop_v1_token".to_string()),
            "TS_AUTHKEY" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.identity, "edge");
        assert_eq!(config.cloud.token.as_deref(), Some("dop_v1_token"));
        assert!(config.mesh.auth_key.is_none());
    }

    #[test]
    fn test_cli_identity_is_last_layer() {
        let config = valid().with_identity(Some("canary"));
        assert_eq!(config.identity, "canary");
        assert!(config.identity_dir().ends_with("canary"));
    }

    #[test]
    fn test_validate_identity() {
        let mut config = valid();
        assert!(config.validate().is_ok());
        config.identity = "Prod_1".to_string();
        assert!(matches!(config.validate(), Err(DeployError::Config(_))));
        config.identity = "../../etc".to_string();
        assert!(matches!(config.validate_identity(), Err(DeployError::Config(_))));

        let mut partial = valid();
        partial.mesh.enabled = true;
        partial.mesh.auth_key = None;
        assert!(partial.validate().is_err());
        assert!(partial.validate_identity().is_ok());
    }

    #[test]
    fn test_mesh_without_key_is_prerequisite() {
        let mut config = valid();
        config.mesh.enabled = true;
        assert!(matches!(config.validate(), Err(DeployError::Prerequisite(_))));
        config.mesh.auth_key = Some("tskey-auth-123".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hook_requirements() {
        let mut config = valid();
        config.hook.enabled = true;
        assert!(config.validate().is_err());
        config.hook.binary_url = Some("https://example.com/berthd".to_string());
        assert!(config.validate().is_ok());
        config.hook.secret = Some("short".to_string());
        assert!(config.validate().is_err());
        config.hook.secret = Some("k".repeat(40));
        config.dashboard.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secrets_are_not_serialized() {
        let mut config = valid();
        config.cloud.token = Some("dop_v1_secret".to_string());
        config.mesh.auth_key = Some("tskey-secret".to_string());
        let rendered = toml::to_string(&config).unwrap();
        assert!(!rendered.contains("dop_v1_secret"));
        assert!(!rendered.contains("tskey-secret"));
    }
}
