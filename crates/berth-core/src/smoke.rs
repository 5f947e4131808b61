//! Smoke verifier: bounded waits on externally observable readiness.
//!
//! A signal that never comes up is reported as `ready = false`; deciding how
//! bad that is belongs to the caller. A cold gateway after first deploy often
//! needs longer than the default window.

use berth_remote::{Check, RemoteShell, Script};
use std::fmt;
use std::time::Duration;

use crate::config::Config;
use crate::domain::YES;
use crate::obs;
use crate::poll::await_condition;

const READY_FACT: &str = "ready";

/// Something that can be polled for readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessSignal {
    /// systemd reports the unit active (observed on the target).
    ServiceActive(String),
    /// A socket listens on the port (observed on the target).
    ListeningPort(u16),
}

impl fmt::Display for ReadinessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessSignal::ServiceActive(unit) => write!(f, "{unit} active"),
            ReadinessSignal::ListeningPort(port) => write!(f, "port {port} listening"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub signal: String,
    pub ready: bool,
    pub elapsed: Duration,
}

/// Signals checked after a deploy.
pub fn deploy_signals(config: &Config) -> Vec<ReadinessSignal> {
    let mut signals = vec![
        ReadinessSignal::ServiceActive(config.gateway.service.clone()),
        ReadinessSignal::ListeningPort(config.gateway.port),
    ];
    if config.dashboard.enabled {
        signals.push(ReadinessSignal::ServiceActive(config.dashboard.service.clone()));
        signals.push(ReadinessSignal::ListeningPort(config.dashboard.port));
    }
    signals
}

pub struct SmokeVerifier<'a> {
    shell: &'a dyn RemoteShell,
    interval: Duration,
}

impl<'a> SmokeVerifier<'a> {
    pub fn new(shell: &'a dyn RemoteShell, interval: Duration) -> Self {
        Self { shell, interval }
    }

    /// Poll `signal` on `address` for at most `max_wait`.
    pub async fn wait_for_ready(
        &self,
        address: &str,
        signal: &ReadinessSignal,
        max_wait: Duration,
    ) -> Readiness {
        let shell = self.shell;
        let outcome = await_condition(
            move || async move { check(shell, address, signal).await },
            self.interval,
            max_wait,
        )
        .await;
        let readiness = Readiness {
            signal: signal.to_string(),
            ready: outcome.ready,
            elapsed: outcome.elapsed,
        };
        obs::emit_smoke_result(
            &readiness.signal,
            readiness.ready,
            readiness.elapsed.as_millis() as u64,
        );
        readiness
    }

    /// Wait on each signal in turn; the window is shared.
    pub async fn wait_for_all(
        &self,
        address: &str,
        signals: &[ReadinessSignal],
        max_wait: Duration,
    ) -> Vec<Readiness> {
        let start = tokio::time::Instant::now();
        let mut results = Vec::with_capacity(signals.len());
        for signal in signals {
            let remaining = max_wait.saturating_sub(start.elapsed());
            results.push(self.wait_for_ready(address, signal, remaining).await);
        }
        results
    }
}

async fn check(shell: &dyn RemoteShell, address: &str, signal: &ReadinessSignal) -> bool {
    let check = match signal {
        ReadinessSignal::ServiceActive(unit) => Check::ServiceActive { unit: unit.clone() },
        ReadinessSignal::ListeningPort(port) => Check::PortListening { port: *port },
    };
    let script = Script::new(format!("smoke: {signal}")).probe(READY_FACT, check);
    match shell.exec(address, &script).await {
        Ok(output) => output.facts().get(READY_FACT).map(String::as_str) == Some(YES),
        Err(_) => false,
    }
}
