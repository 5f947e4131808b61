//! Credential recovery and persistence.
//!
//! A secret already on the target is recovered, never regenerated. Whatever
//! secret ends up in force is written to the local escrow before any later
//! phase can fail, so a broken run still leaves the operator holding it.

use berth_remote::{Check, Redacted, RemoteShell, Script, Step};
use chrono::Utc;
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::config::Config;
use crate::domain::{is_well_formed_secret, CredentialRecord, DeployError, Provenance, Result};
use crate::obs;
use crate::units;

/// Where one secret lives on the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSlot {
    pub name: &'static str,
    /// Env file holding the secret.
    pub path: String,
    pub key: String,
    /// Catalog fact reporting the secret.
    pub fact: &'static str,
    /// Secret supplied by configuration; it wins over target and escrow.
    pub configured: Option<String>,
}

impl CredentialSlot {
    pub const GATEWAY: &'static str = "gateway";
    pub const HOOK: &'static str = "hook";
    pub const NAMES: [&'static str; 2] = [Self::GATEWAY, Self::HOOK];

    /// `slot` as one of the known slot names.
    pub fn check_name(slot: &str) -> Result<&'static str> {
        Self::NAMES
            .into_iter()
            .find(|name| *name == slot)
            .ok_or_else(|| {
                DeployError::Config(format!(
                    "unknown credential slot {slot:?} (expected one of: {})",
                    Self::NAMES.join(", ")
                ))
            })
    }

    pub fn gateway(config: &Config) -> Self {
        CredentialSlot {
            name: Self::GATEWAY,
            path: units::gateway_secret_path(),
            key: config.gateway.secret_key.clone(),
            fact: catalog::GATEWAY_CREDENTIAL_PRESENT,
            configured: None,
        }
    }

    pub fn hook(config: &Config) -> Self {
        CredentialSlot {
            name: Self::HOOK,
            path: units::hook_secret_path(),
            key: units::HOOK_SECRET_KEY.to_string(),
            fact: catalog::HOOK_CREDENTIAL_PRESENT,
            configured: config.hook.secret.clone(),
        }
    }

    /// Slots in use for `config`.
    pub fn for_config(config: &Config) -> Vec<Self> {
        let mut slots = vec![Self::gateway(config)];
        if config.hook.enabled {
            slots.push(Self::hook(config));
        }
        slots
    }
}

/// Source of new secrets.
pub trait SecretGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// 32 random bytes, hex encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSecret;

impl SecretGenerator for RandomSecret {
    fn generate(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

/// Local escrow: one JSON record per slot, mode 0600, one previous version.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CredentialStore { root: root.into() }
    }

    /// Escrow of the configured identity.
    pub fn for_config(config: &Config) -> Self {
        Self::new(config.identity_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, slot: &str) -> PathBuf {
        self.root.join(format!("{slot}.credential.json"))
    }

    pub fn archive_path(&self, slot: &str) -> PathBuf {
        self.root.join(format!("{slot}.credential.json.prev"))
    }

    pub fn load(&self, slot: &str) -> Result<Option<CredentialRecord>> {
        let path = self.path(slot);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Durably store `record` and return its path.
    ///
    /// Re-persisting the secret already on disk leaves the file untouched. A
    /// different secret moves the current file to `.prev` first.
    pub fn persist(&self, record: &CredentialRecord) -> Result<PathBuf> {
        let path = self.path(&record.slot);
        fs::create_dir_all(&self.root)?;
        restrict(&self.root, 0o700)?;

        if let Some(current) = self.load(&record.slot)? {
            if current.secret == record.secret {
                debug!(slot = %record.slot, "escrow already holds this secret");
                return Ok(path);
            }
            fs::rename(&path, self.archive_path(&record.slot))?;
            info!(slot = %record.slot, "previous escrowed secret archived");
        }

        let mut tmp = NamedTempFile::new_in(&self.root)?;
        restrict(tmp.path(), 0o600)?;
        tmp.write_all(serde_json::to_string_pretty(record)?.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// A resolved and escrowed credential.
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub record: CredentialRecord,
    pub path: PathBuf,
}

impl ResolvedCredential {
    /// The target's secret changed during this run.
    pub fn changed(&self) -> bool {
        self.record.provenance.changed_target()
    }
}

/// Recover-or-generate policy for credential slots.
pub struct CredentialResolver<'a> {
    shell: &'a dyn RemoteShell,
    store: &'a CredentialStore,
    generator: &'a dyn SecretGenerator,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(
        shell: &'a dyn RemoteShell,
        store: &'a CredentialStore,
        generator: &'a dyn SecretGenerator,
    ) -> Self {
        Self {
            shell,
            store,
            generator,
        }
    }

    /// Resolve the secret for `slot` on `address` and escrow it.
    ///
    /// Order: configured, recovered from the target, restored from escrow,
    /// newly generated. `rotate` skips recovery and escrow. Any failure is
    /// fatal; no phase may run without a stored credential.
    pub async fn resolve(
        &self,
        identity: &str,
        address: &str,
        slot: &CredentialSlot,
        rotate: bool,
    ) -> Result<ResolvedCredential> {
        let on_target = if rotate && slot.configured.is_none() {
            None
        } else {
            self.read_remote(address, slot).await?
        };

        let (secret, provenance) = match (&slot.configured, on_target) {
            (Some(configured), Some(current)) if *configured == current => {
                (current, Provenance::RecoveredFromTarget)
            }
            (Some(configured), _) => (configured.clone(), Provenance::Configured),
            (None, Some(current)) if is_well_formed_secret(&current) => {
                (current, Provenance::RecoveredFromTarget)
            }
            (None, _) => match self.escrowed(slot, rotate)? {
                Some(secret) => (secret, Provenance::RestoredFromEscrow),
                None => (self.generator.generate(), Provenance::NewlyGenerated),
            },
        };

        let record = CredentialRecord {
            slot: slot.name.to_string(),
            identity: identity.to_string(),
            secret,
            provenance,
            address: address.to_string(),
            persisted_at: Utc::now(),
        };

        // Escrow first: a failed write to the target must not lose the secret.
        let path = self
            .store
            .persist(&record)
            .map_err(|e| credential_error(slot, format!("local escrow failed: {e}")))?;

        if provenance.changed_target() {
            self.write_remote(address, slot, &record.secret).await?;
        }

        obs::emit_credential_resolved(slot.name, provenance.as_str(), &path.display().to_string());
        Ok(ResolvedCredential { record, path })
    }

    fn escrowed(&self, slot: &CredentialSlot, rotate: bool) -> Result<Option<String>> {
        if rotate {
            return Ok(None);
        }
        let record = self
            .store
            .load(slot.name)
            .map_err(|e| credential_error(slot, format!("local escrow unreadable: {e}")))?;
        Ok(record
            .map(|r| r.secret)
            .filter(|s| is_well_formed_secret(s)))
    }

    async fn read_remote(&self, address: &str, slot: &CredentialSlot) -> Result<Option<String>> {
        let script = Script::new(format!("credential: read {}", slot.name)).probe(
            slot.fact,
            Check::EnvValue {
                path: slot.path.clone(),
                key: slot.key.clone(),
            },
        );
        let output = self
            .shell
            .exec(address, &script)
            .await
            .map_err(|e| credential_error(slot, format!("cannot read target: {e}")))?;
        if !output.success() {
            return Err(credential_error(
                slot,
                format!("cannot read target: {}", output.stderr_tail()),
            ));
        }
        let value = output.facts().remove(slot.fact).unwrap_or_default();
        if value.is_empty() {
            return Ok(None);
        }
        if !is_well_formed_secret(&value) {
            warn!(slot = slot.name, "secret on the target is malformed and will be replaced");
        }
        Ok(Some(value))
    }

    async fn write_remote(&self, address: &str, slot: &CredentialSlot, secret: &str) -> Result<()> {
        let script = Script::new(format!("credential: write {}", slot.name)).step(
            Step::SetEnvValue {
                path: slot.path.clone(),
                key: slot.key.clone(),
                value: Redacted(secret.to_string()),
            },
        );
        let output = self
            .shell
            .exec(address, &script)
            .await
            .map_err(|e| credential_error(slot, format!("cannot write target: {e}")))?;
        if !output.success() {
            return Err(credential_error(
                slot,
                format!("cannot write target: {}", output.stderr_tail()),
            ));
        }
        Ok(())
    }
}

fn credential_error(slot: &CredentialSlot, message: String) -> DeployError {
    DeployError::Credential {
        slot: slot.name.to_string(),
        message,
    }
}
