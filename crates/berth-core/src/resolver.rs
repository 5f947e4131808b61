//! Target resolver: find the instance of an identity, or create it.
//!
//! An instance that already carries the identity tag is adopted as it is,
//! even when its shape no longer matches the configuration. Recreation only
//! happens through an explicit teardown.

use berth_remote::{CloudApi, Instance, InstanceSpec, RemoteShell};
use tracing::{debug, info};

use crate::config::{secs, Config};
use crate::domain::{DeployError, LifecycleState, Resolution, Result, ShapeDrift, Target};
use crate::obs;
use crate::poll::await_condition;
use crate::probe::probe_connectivity;

/// Cloud tag of `identity`.
pub fn tag_for(identity: &str) -> String {
    format!("berth-{identity}")
}

/// Sole writer of [`Target`] lifecycle state.
pub struct Resolver<'a> {
    cloud: &'a dyn CloudApi,
    config: &'a Config,
}

impl<'a> Resolver<'a> {
    pub fn new(cloud: &'a dyn CloudApi, config: &'a Config) -> Self {
        Self { cloud, config }
    }

    /// Read-only lookup; never creates anything.
    pub async fn locate(&self, identity: &str) -> Result<Option<Resolution>> {
        let Some(instance) = self.cloud.find_by_tag(&tag_for(identity)).await? else {
            return Ok(None);
        };
        let address = instance.public_ipv4.clone().ok_or_else(|| {
            DeployError::Provisioning(format!(
                "instance {} has no public address yet",
                instance.id
            ))
        })?;
        Ok(Some(Resolution {
            shape_drift: self.shape_drift(&instance),
            target: Target::new(identity, instance.id, address, LifecycleState::Creating),
            existed: true,
        }))
    }

    /// Adopt the tagged instance or create one, then wait until the cloud
    /// reports it running.
    pub async fn resolve(&self, identity: &str) -> Result<Resolution> {
        let tag = tag_for(identity);
        if let Some(found) = self.cloud.find_by_tag(&tag).await? {
            let drift = self.shape_drift(&found);
            for d in &drift {
                obs::emit_shape_drift(&d.attribute, &d.configured, &d.actual);
            }
            let instance = if found.is_running() {
                found
            } else {
                info!(instance = %found.id, "adopted instance is still booting");
                self.wait_running(&found.id).await?
            };
            return Ok(self.resolution(identity, instance, true, drift));
        }

        let cloud = &self.config.cloud;
        if cloud.ssh_keys.is_empty() {
            return Err(DeployError::Prerequisite(
                "cloud.ssh_keys is empty; a new instance would not accept any login".to_string(),
            ));
        }
        let spec = InstanceSpec {
            name: identity.to_string(),
            region: cloud.region.clone(),
            size: cloud.size.clone(),
            image: cloud.image.clone(),
            ssh_keys: cloud.ssh_keys.clone(),
            tags: vec![tag],
        };
        let created = self.cloud.create(&spec).await?;
        info!(instance = %created.id, region = %spec.region, size = %spec.size, "instance requested");
        let instance = self.wait_running(&created.id).await?;
        Ok(self.resolution(identity, instance, false, Vec::new()))
    }

    /// Wait until `target` accepts remote sessions.
    pub async fn await_reachable(&self, shell: &dyn RemoteShell, target: &mut Target) -> Result<()> {
        let ssh = &self.config.ssh;
        let outcome = probe_connectivity(
            shell,
            &target.address,
            secs(ssh.connectivity_timeout_secs),
            secs(ssh.poll_interval_secs),
        )
        .await;
        if !outcome.ready {
            return Err(DeployError::Connectivity {
                address: target.address.clone(),
                reason: format!("no session after {}s", outcome.elapsed.as_secs()),
            });
        }
        debug!(address = %target.address, attempts = outcome.attempts, "target reachable");
        target.set_state(LifecycleState::Reachable);
        Ok(())
    }

    pub fn mark_converged(&self, target: &mut Target) {
        target.set_state(LifecycleState::Converged);
    }

    /// Delete the tagged instance. Local escrow is left alone.
    pub async fn teardown(&self, identity: &str) -> Result<Option<Instance>> {
        let Some(instance) = self.cloud.find_by_tag(&tag_for(identity)).await? else {
            return Ok(None);
        };
        self.cloud.delete(&instance.id).await?;
        info!(instance = %instance.id, identity = %identity, "instance deleted");
        Ok(Some(instance))
    }

    /// Attributes where `instance` differs from the configured shape.
    pub fn shape_drift(&self, instance: &Instance) -> Vec<ShapeDrift> {
        let cloud = &self.config.cloud;
        [
            ("size", &cloud.size, &instance.size),
            ("image", &cloud.image, &instance.image),
            ("region", &cloud.region, &instance.region),
        ]
        .into_iter()
        .filter(|(_, configured, actual)| !actual.is_empty() && configured != actual)
        .map(|(attribute, configured, actual)| ShapeDrift {
            attribute: attribute.to_string(),
            configured: configured.clone(),
            actual: actual.clone(),
        })
        .collect()
    }

    fn resolution(
        &self,
        identity: &str,
        instance: Instance,
        existed: bool,
        shape_drift: Vec<ShapeDrift>,
    ) -> Resolution {
        let address = instance.public_ipv4.clone().unwrap_or_default();
        Resolution {
            target: Target::new(identity, instance.id, address, LifecycleState::Creating),
            existed,
            shape_drift,
        }
    }

    async fn wait_running(&self, id: &str) -> Result<Instance> {
        let cloud = self.cloud;
        let timeout = self.config.cloud.create_timeout_secs;
        let outcome = await_condition(
            move || async move {
                match cloud.get(id).await {
                    Ok(instance) => instance.is_running(),
                    Err(e) => {
                        debug!(instance = %id, error = %e, "instance status unavailable");
                        false
                    }
                }
            },
            secs(self.config.cloud.poll_interval_secs),
            secs(timeout),
        )
        .await;
        if !outcome.ready {
            return Err(DeployError::Provisioning(format!(
                "instance {id} did not reach a running state within {timeout}s"
            )));
        }
        Ok(self.cloud.get(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{running_instance, test_config, FakeCloud, FakeTarget};

    #[tokio::test]
    async fn test_creates_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cloud = FakeCloud::new();
        let resolver = Resolver::new(&cloud, &config);

        let resolution = resolver.resolve("test").await.unwrap();
        assert!(!resolution.existed);
        assert_eq!(resolution.target.address, FakeTarget::ADDRESS);
        assert_eq!(cloud.created(), 1);
        assert_eq!(cloud.instances()[0].tags, vec!["berth-test".to_string()]);
    }

    #[tokio::test]
    async fn test_adopts_existing_without_recreating() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cloud = FakeCloud::new();
        let mut existing = running_instance(&config);
        existing.size = "s-1vcpu-1gb".to_string();
        cloud.insert(existing);
        let resolver = Resolver::new(&cloud, &config);

        let resolution = resolver.resolve("test").await.unwrap();
        assert!(resolution.existed);
        assert_eq!(cloud.created(), 0);
        assert_eq!(resolution.shape_drift.len(), 1);
        assert_eq!(resolution.shape_drift[0].attribute, "size");
        assert_eq!(resolution.shape_drift[0].actual, "s-1vcpu-1gb");
    }

    #[tokio::test]
    async fn test_locate_never_creates() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cloud = FakeCloud::new();
        let resolver = Resolver::new(&cloud, &config);
        assert!(resolver.locate("test").await.unwrap().is_none());
        assert_eq!(cloud.created(), 0);
    }

    #[tokio::test]
    async fn test_missing_ssh_keys_is_prerequisite() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.cloud.ssh_keys.clear();
        let cloud = FakeCloud::new();
        let err = Resolver::new(&cloud, &config).resolve("test").await.unwrap_err();
        assert!(matches!(err, DeployError::Prerequisite(_)));
        assert_eq!(cloud.created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_that_never_runs_is_provisioning_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cloud = FakeCloud::new();
        cloud.never_activate();
        let err = Resolver::new(&cloud, &config).resolve("test").await.unwrap_err();
        assert!(matches!(err, DeployError::Provisioning(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cloud = FakeCloud::new();
        let shell = FakeTarget::new();
        let resolver = Resolver::new(&cloud, &config);

        let mut target = resolver.resolve("test").await.unwrap().target;
        assert_eq!(target.state(), LifecycleState::Creating);
        resolver.await_reachable(&shell, &mut target).await.unwrap();
        assert_eq!(target.state(), LifecycleState::Reachable);
        resolver.mark_converged(&mut target);
        assert_eq!(target.state(), LifecycleState::Converged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_target_is_connectivity_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cloud = FakeCloud::new();
        let shell = FakeTarget::new();
        shell.set_reachable(false);
        let resolver = Resolver::new(&cloud, &config);
        let mut target = resolver.resolve("test").await.unwrap().target;

        let err = resolver.await_reachable(&shell, &mut target).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Connectivity { ref reason, .. } if reason == "no session after 5s"
        ));
        assert_eq!(target.state(), LifecycleState::Creating);
    }

    #[tokio::test]
    async fn test_teardown_deletes_tagged_instance() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cloud = FakeCloud::new();
        cloud.insert(running_instance(&config));
        let resolver = Resolver::new(&cloud, &config);

        assert!(resolver.teardown("test").await.unwrap().is_some());
        assert_eq!(cloud.deleted(), 1);
        assert!(resolver.teardown("test").await.unwrap().is_none());
    }
}
