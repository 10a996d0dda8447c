//! Instance deletion.

use tracing::{info, warn};

use super::{DELETED, InstanceOrchestrator, VOLUME_DELETED, poll_volume};
use crate::compute::{Cloud, ServerAction, VolumeAttachmentRecord};
use crate::error::{LifecycleError, Step};
use crate::instance::InstanceConfig;
use crate::poll::StatusRefresh;

const RELEASING: [&str; 3] = ["in-use", "detaching", "deleting"];

impl<C> InstanceOrchestrator<C>
where
    C: Cloud,
{
    /// Deletes an instance and waits until it is gone.
    ///
    /// Optionally stops it first (failures there are logged and ignored) and
    /// detaches its explicit ports (failures there are fatal). Exactly one
    /// delete request is submitted; a missing instance counts as deleted.
    /// Volumes attached beforehand are then awaited until released.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when port detachment, the delete request,
    /// or a wait fails. Volume release is only awaited when the attachments
    /// can be listed and volume status can be queried.
    pub async fn delete(
        &self,
        server_id: &str,
        config: &InstanceConfig,
    ) -> Result<(), LifecycleError> {
        let timeout = config.timeouts.delete;

        if config.stop_before_destroy {
            self.stop_before_delete(server_id, config).await;
        }

        if config.detach_ports_before_destroy {
            for port_id in config.ports() {
                self.detach_port(server_id, port_id, timeout).await?;
            }
        }

        let volumes = self.volumes_to_release(server_id).await;

        info!(
            instance_id = server_id,
            force = config.force_delete,
            "deleting instance"
        );
        let submitted = if config.force_delete {
            self.cloud.force_delete_server(server_id).await
        } else {
            self.cloud.delete_server(server_id).await
        };
        match submitted {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                info!(instance_id = server_id, "instance already deleted");
                return Ok(());
            }
            Err(err) => return Err(LifecycleError::api(server_id, Step::Delete, err)),
        }

        let change =
            self.state_change(&["ACTIVE", "SHUTOFF"], &[DELETED, "SOFT_DELETED"], timeout);
        self.wait_for_server(server_id, Step::WaitForDelete, change)
            .await?;

        for volume in &volumes {
            let refresh =
                StatusRefresh::new(&self.cloud, volume.volume_id.as_str(), poll_volume::<C>);
            self.state_change(&RELEASING, &["available", VOLUME_DELETED], timeout)
                .wait(&refresh)
                .await
                .map_err(|err| LifecycleError::from_wait(server_id, Step::VolumeRelease, err))?;
        }
        Ok(())
    }

    /// Lists the volumes whose release is awaited after deletion. Failures
    /// here only cost that wait.
    async fn volumes_to_release(&self, server_id: &str) -> Vec<VolumeAttachmentRecord> {
        match self.cloud.list_volume_attachments(server_id).await {
            Ok(volumes) if volumes.is_empty() || self.cloud.tracks_volumes() => volumes,
            Ok(volumes) => {
                warn!(
                    instance_id = server_id,
                    volumes = volumes.len(),
                    "no block-storage endpoint configured; not waiting for volume release"
                );
                Vec::new()
            }
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => {
                warn!(
                    instance_id = server_id,
                    error = %err,
                    "listing volume attachments failed; not waiting for volume release"
                );
                Vec::new()
            }
        }
    }

    async fn stop_before_delete(&self, server_id: &str, config: &InstanceConfig) {
        let result = async {
            self.cloud
                .server_action(server_id, &ServerAction::Stop)
                .await
                .map_err(|err| LifecycleError::api(server_id, Step::Stop, err))?;
            let change = self.state_change(&["ACTIVE"], &["SHUTOFF"], config.timeouts.delete);
            self.wait_for_server(server_id, Step::Stop, change).await
        }
        .await;
        if let Err(err) = result {
            warn!(
                instance_id = server_id,
                error = %err,
                "stop before delete failed; deleting anyway"
            );
        }
    }
}
