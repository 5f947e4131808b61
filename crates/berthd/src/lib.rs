//! Berthd: the push-event listener deployed next to the dashboard.
//!
//! Verifies signed push deliveries, filters them to one ref, and runs the
//! rebuild script under a lock file so overlapping deliveries collapse into a
//! single build.

pub mod lock;
pub mod server;
pub mod signature;

pub use lock::{BuildLock, LockGuard, LockInfo};
pub use server::{router, serve, HookSettings, HookState};
pub use signature::{sign, verify, SignatureError, SIGNATURE_HEADER};
