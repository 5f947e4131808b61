//! Error types for berth-remote

use thiserror::Error;

/// Errors that can occur talking to the target or the cloud API
#[derive(Error, Debug)]
pub enum RemoteError {
    /// ssh client not found
    #[error("ssh is not installed or not in PATH")]
    SshNotFound,

    /// Remote session could not be started or the transport dropped
    #[error("remote session to {address} failed: {message}")]
    SessionFailed { address: String, message: String },

    /// Remote session exceeded its time budget
    #[error("remote session to {address} timed out after {secs}s")]
    Timeout { address: String, secs: u64 },

    /// Cloud API token is not configured
    #[error("cloud API token is not configured (set DIGITALOCEAN_TOKEN or cloud.token)")]
    CloudTokenMissing,

    /// Cloud API answered with a non-success status
    #[error("cloud API returned {status}: {body}")]
    CloudApi { status: u16, body: String },

    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Probe output could not be interpreted
    #[error("malformed probe output: {0}")]
    MalformedProbe(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::Http(err.to_string())
    }
}
