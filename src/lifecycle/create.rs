//! Instance creation.

use tracing::{info, warn};

use super::{InstanceOrchestrator, InstanceReport, poll_server};
use crate::boot::{resolve_flavor, resolve_image, resolve_network};
use crate::compute::Cloud;
use crate::error::{LifecycleError, Step};
use crate::instance::{DesiredPowerState, InstanceConfig};
use crate::poll::{StatusRefresh, retry_transient};
use crate::request::{BootSource, NetworkRequest, compose_create_request};

impl<C> InstanceOrchestrator<C>
where
    C: Cloud,
{
    /// Creates an instance and waits until it is running in the requested
    /// power state.
    ///
    /// Validation and boot-source resolution happen before anything is
    /// submitted. Once the control plane has assigned an ID, every later
    /// failure carries it so the caller can resume with [`Self::read`]
    /// rather than creating a second instance.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidConfig`] or
    /// [`LifecycleError::BootSource`] before submission,
    /// [`LifecycleError::Submit`] when the create call fails, and an
    /// instance-scoped variant for anything after.
    pub async fn create(&self, config: &InstanceConfig) -> Result<InstanceReport, LifecycleError> {
        let validated = config.validate()?;
        for warning in &validated.warnings {
            warn!(%warning, "questionable block device configuration");
        }

        let image_id = resolve_image(config, &self.defaults, &self.cloud).await?;
        let flavor_id = resolve_flavor(config, &self.defaults, &self.cloud).await?;
        let networks = self.resolve_networks(config).await?;
        let submission = compose_create_request(
            config,
            BootSource {
                image_id,
                flavor_id,
            },
            networks,
            validated.block_devices,
        );

        let created = self
            .cloud
            .create_server(&submission)
            .await
            .map_err(|source| LifecycleError::Submit {
                step: Step::Submit,
                source,
            })?;
        let server_id = created.id;
        info!(
            instance_id = %server_id,
            endpoint = submission.endpoint.path(),
            "instance submitted"
        );

        let timeout = config.timeouts.create;
        let refresh = StatusRefresh::new(&self.cloud, server_id.as_str(), poll_server::<C>);
        let change = self.state_change(&["BUILD"], &["ACTIVE"], timeout);
        let server = retry_transient(
            self.polling.retry_attempts,
            self.polling.retry_backoff,
            || change.wait(&refresh),
        )
        .await
        .map_err(|err| LifecycleError::from_wait(&server_id, Step::WaitForBuild, err))?;

        if config.power_state != DesiredPowerState::Active {
            self.apply_power_state(&server, config.power_state, timeout)
                .await?;
        }

        let instance = self.read_present(&server_id, config).await?;
        info!(instance_id = %server_id, status = %instance.status, "instance created");
        Ok(InstanceReport {
            instance,
            warnings: validated.warnings,
        })
    }

    async fn resolve_networks(
        &self,
        config: &InstanceConfig,
    ) -> Result<Vec<NetworkRequest>, LifecycleError> {
        let mut requests = Vec::with_capacity(config.networks.len());
        for network in &config.networks {
            let uuid = match (&network.uuid, &network.name) {
                (Some(uuid), _) => Some(uuid.clone()),
                (None, Some(name)) if network.port.is_none() => {
                    Some(resolve_network(name, &self.cloud).await?)
                }
                (None, _) => None,
            };
            requests.push(NetworkRequest {
                uuid,
                port: network.port.clone(),
                fixed_ip: network.fixed_ip_v4,
            });
        }
        Ok(requests)
    }
}
