//! State probe: many facts, one session.

use berth_remote::{RemoteError, RemoteShell, Script};
use std::time::Duration;
use tracing::debug;

use crate::domain::{DeployError, FactSpec, Result, Snapshot};
use crate::poll::{await_condition, PollOutcome};

/// Probe `specs` on `address` in a single remote session.
///
/// The session is read-only. A session that fails to run, or that comes back
/// without one of the requested facts, is an error rather than a partial
/// snapshot. A session the transport drops is [`DeployError::Connectivity`].
pub async fn snapshot(
    shell: &dyn RemoteShell,
    address: &str,
    specs: &[&FactSpec],
) -> Result<Snapshot> {
    if specs.is_empty() {
        return Ok(Snapshot::default());
    }

    let mut script = Script::new(format!("probe {} fact(s)", specs.len()));
    for spec in specs {
        script = script.probe(spec.name, spec.check.clone());
    }

    let output = shell
        .exec(address, &script)
        .await
        .map_err(|e| DeployError::from_session(address, e))?;
    if output.transport_failed() {
        return Err(DeployError::Connectivity {
            address: address.to_string(),
            reason: output.stderr_tail(),
        });
    }
    if !output.success() {
        return Err(RemoteError::SessionFailed {
            address: address.to_string(),
            message: format!(
                "probe exited with {}: {}",
                output.exit_code,
                output.stderr_tail()
            ),
        }
        .into());
    }

    let values = output.facts();
    let missing: Vec<&str> = specs
        .iter()
        .map(|s| s.name)
        .filter(|name| !values.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(RemoteError::MalformedProbe(format!(
            "no value reported for {}",
            missing.join(", ")
        ))
        .into());
    }

    debug!(address = %address, facts = specs.len(), duration_ms = output.duration_ms, "probe complete");
    Ok(Snapshot::new(values))
}

/// Poll until `address` accepts a session or `timeout` passes.
pub async fn probe_connectivity(
    shell: &dyn RemoteShell,
    address: &str,
    timeout: Duration,
    interval: Duration,
) -> PollOutcome {
    let script = Script::new("connectivity");
    await_condition(
        move || {
            let script = script.clone();
            async move {
                match shell.exec(address, &script).await {
                    Ok(output) => output.success(),
                    Err(e) => {
                        debug!(address = %address, error = %e, "target not reachable yet");
                        false
                    }
                }
            }
        },
        interval,
        timeout,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, FactCatalog};
    use crate::fakes::{test_config, FakeTarget};

    #[tokio::test]
    async fn test_snapshot_is_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FactCatalog::from_config(&test_config(dir.path()));
        let target = FakeTarget::new();
        let specs: Vec<&FactSpec> = catalog.iter().collect();

        let snapshot = snapshot(&target, FakeTarget::ADDRESS, &specs).await.unwrap();
        assert_eq!(snapshot.len(), specs.len());
        assert_eq!(target.exec_calls(), 1);
        assert_eq!(target.mutating_execs(), 0);
        assert_eq!(snapshot.get(catalog::PLATFORM_INITIALIZED), Some("yes"));
        assert_eq!(snapshot.get(catalog::GATEWAY_ACTIVE), Some("no"));
    }

    #[tokio::test]
    async fn test_empty_request_skips_session() {
        let target = FakeTarget::new();
        let snapshot = snapshot(&target, FakeTarget::ADDRESS, &[]).await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(target.exec_calls(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FactCatalog::from_config(&test_config(dir.path()));
        let target = FakeTarget::new();
        target.set_reachable(false);
        let specs = catalog.select(&[catalog::FIREWALL_ACTIVE]);
        let err = snapshot(&target, FakeTarget::ADDRESS, &specs)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeployError::Connectivity { ref address, ref reason }
                if address == FakeTarget::ADDRESS && reason.contains("Connection refused")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_waits_for_target() {
        let target = FakeTarget::new();
        target.set_reachable(false);
        let outcome = probe_connectivity(
            &target,
            FakeTarget::ADDRESS,
            Duration::from_secs(3),
            Duration::from_secs(1),
        )
        .await;
        assert!(!outcome.ready);

        target.set_reachable(true);
        let outcome = probe_connectivity(
            &target,
            FakeTarget::ADDRESS,
            Duration::from_secs(3),
            Duration::from_secs(1),
        )
        .await;
        assert!(outcome.ready);
        assert_eq!(outcome.attempts, 1);
    }
}
