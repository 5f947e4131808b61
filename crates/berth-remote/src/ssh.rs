//! Remote execution channel
//!
//! Every [`Script`] is sent as one `ssh ... bash -s` session: the rendered body
//! goes over stdin, exit status and captured output come back. Multi-step
//! checks and mutations that belong together therefore cost one handshake.

use crate::error::RemoteError;
use crate::script::{parse_facts, Script};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command as StdCommand, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit code ssh uses for its own (transport) failures.
pub const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Result of one remote session.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Exit code (0 = success, 255 = transport failure).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the failure happened in the transport rather than the script.
    pub fn transport_failed(&self) -> bool {
        self.exit_code == SSH_TRANSPORT_FAILURE
    }

    /// Fact lines printed by probe steps.
    pub fn facts(&self) -> BTreeMap<String, String> {
        parse_facts(&self.stdout)
    }

    /// Last non-empty stderr line, for error messages.
    pub fn stderr_tail(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string()
    }
}

/// Authenticated command execution against a target address.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `script` as a single session on `address`.
    ///
    /// Returns `Err` only when the session could not be run at all (spawn
    /// failure, timeout); a script that ran and failed is an `ExecOutput`
    /// with a non-zero exit code.
    async fn exec(&self, address: &str, script: &Script) -> Result<ExecOutput>;
}

/// SSH connection options
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for SshOptions {
    fn default() -> Self {
        SshOptions {
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
            command_timeout_secs: 900,
        }
    }
}

/// [`RemoteShell`] backed by the system `ssh` client.
pub struct SshShell {
    options: SshOptions,
}

impl SshShell {
    pub fn new(options: SshOptions) -> Self {
        SshShell { options }
    }

    /// Arguments passed to `ssh` for one session against `address`.
    pub fn command_args(&self, address: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout_secs),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-p".to_string(),
            self.options.port.to_string(),
        ];
        if let Some(identity) = &self.options.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        args.push(format!("{}@{}", self.options.user, address));
        args.push("bash".to_string());
        args.push("-s".to_string());
        args
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, address: &str, script: &Script) -> Result<ExecOutput> {
        let start = Instant::now();
        debug!(address = %address, script = %script.label(), steps = script.steps().len(), "opening ssh session");

        let mut child = Command::new("ssh")
            .args(self.command_args(address))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RemoteError::SshNotFound
                } else {
                    RemoteError::SessionFailed {
                        address: address.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.render().as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let secs = self.options.command_timeout_secs;
        let output = tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout {
                address: address.to_string(),
                secs,
            })??;

        let result = ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            address = %address,
            script = %script.label(),
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "ssh session finished"
        );
        Ok(result)
    }
}

/// Check if the ssh client is available
pub fn is_ssh_available() -> bool {
    StdCommand::new("ssh")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
