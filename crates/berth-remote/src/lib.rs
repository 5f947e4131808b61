//! Berth-Remote: the leaf collaborators of the Berth engine
//!
//! This crate provides everything that crosses the machine boundary:
//! typed remote scripts, the SSH execution channel that runs them as one
//! session each, and the cloud instance API used to find or create the target.
//!
//! ## Layer 0 - Transport
//!
//! Focus: one script body per session, read-only probes, no hidden retries.

pub mod cloud;
pub mod error;
pub mod script;
pub mod ssh;

pub use cloud::{CloudApi, DigitalOceanApi, Instance, InstanceSpec, InstanceStatus};
pub use error::RemoteError;
pub use script::{
    parse_facts, unit_name, unit_path, Check, Redacted, Script, Step, UnitVerb, FACT_MARKER,
    UNIT_DIR,
};
pub use ssh::{is_ssh_available, ExecOutput, RemoteShell, SshOptions, SshShell};

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;
