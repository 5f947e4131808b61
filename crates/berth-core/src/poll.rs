//! Bounded polling shared by every wait in the engine.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// How a bounded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub ready: bool,
    pub elapsed: Duration,
    pub attempts: u32,
}

/// Poll `predicate` every `interval` until it yields `true` or `timeout`
/// passes.
///
/// Each attempt is itself cut off at the deadline, so a hung predicate cannot
/// stretch the wait. The predicate always runs at least once. There is no
/// other way to cancel the wait.
pub async fn await_condition<F, Fut>(
    mut predicate: F,
    interval: Duration,
    timeout: Duration,
) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ready = tokio::time::timeout(remaining, predicate())
            .await
            .unwrap_or(false);
        if ready {
            return PollOutcome {
                ready: true,
                elapsed: start.elapsed(),
                attempts,
            };
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome {
                ready: false,
                elapsed: start.elapsed(),
                attempts,
            };
        }
        trace!(attempts, "condition not met yet");
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
