//! Reconciling an existing instance towards a new document.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::{InstanceOrchestrator, InstanceReport};
use crate::boot::resolve_flavor;
use crate::compute::{Cloud, ServerAction, ServerRecord, ServerUpdate};
use crate::error::{LifecycleError, Step};
use crate::instance::InstanceConfig;

impl<C> InstanceOrchestrator<C>
where
    C: Cloud,
{
    /// Moves an instance from the `old` document to the `new` one.
    ///
    /// Sub-steps run in a fixed order: rename, power state, metadata,
    /// security groups, admin password, resize, tags, ports, then a final
    /// read. Every sub-step shares the update timeout.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Gone`] when the instance has vanished, and
    /// the failing sub-step's error otherwise.
    pub async fn update(
        &self,
        server_id: &str,
        old: &InstanceConfig,
        new: &InstanceConfig,
    ) -> Result<InstanceReport, LifecycleError> {
        let validated = new.validate()?;
        for warning in &validated.warnings {
            warn!(%warning, "questionable block device configuration");
        }
        let timeout = new.timeouts.update;
        let server = self.fetch_for_update(server_id).await?;

        if old.name != new.name {
            let update = ServerUpdate {
                name: Some(new.name.clone()),
            };
            self.cloud
                .update_server(server_id, &update)
                .await
                .map_err(|err| LifecycleError::api(server_id, Step::Rename, err))?;
        }

        if old.power_state != new.power_state {
            self.apply_power_state(&server, new.power_state, timeout)
                .await?;
        }

        self.reconcile_metadata(server_id, &old.metadata, &new.metadata)
            .await?;
        self.reconcile_security_groups(server_id, &old.security_groups, &new.security_groups)
            .await?;

        let password_changed = old.admin_pass != new.admin_pass;
        if let Some(password) = new.admin_pass.as_ref().filter(|_| password_changed) {
            let action = ServerAction::ChangePassword {
                admin_pass: password.clone(),
            };
            self.cloud
                .server_action(server_id, &action)
                .await
                .map_err(|err| LifecycleError::api(server_id, Step::ChangePassword, err))?;
        }

        if let Some(flavor_id) = self.flavor_change(old, new).await? {
            self.resize(server_id, &flavor_id, new.ignore_resize_confirmation, timeout)
                .await?;
        }

        self.reconcile_tags(server_id, &old.tags, &new.tags).await?;

        let old_ports: BTreeSet<String> = old.ports().into_iter().map(str::to_owned).collect();
        let new_ports: BTreeSet<String> = new.ports().into_iter().map(str::to_owned).collect();
        self.reconcile_ports(server_id, &old_ports, &new_ports, timeout)
            .await?;

        let instance = self.read_present(server_id, new).await?;
        info!(instance_id = server_id, status = %instance.status, "instance updated");
        Ok(InstanceReport {
            instance,
            warnings: validated.warnings,
        })
    }

    async fn fetch_for_update(&self, server_id: &str) -> Result<ServerRecord, LifecycleError> {
        match self.cloud.get_server(server_id).await {
            Ok(server) => Ok(server),
            Err(err) if err.is_not_found() => Err(LifecycleError::Gone {
                instance_id: server_id.to_owned(),
                step: Step::Lookup,
            }),
            Err(err) => Err(LifecycleError::api(server_id, Step::Lookup, err)),
        }
    }

    /// Returns the new flavor ID when the documents resolve to different
    /// flavors.
    async fn flavor_change(
        &self,
        old: &InstanceConfig,
        new: &InstanceConfig,
    ) -> Result<Option<String>, LifecycleError> {
        if old.flavor_id == new.flavor_id && old.flavor_name == new.flavor_name {
            return Ok(None);
        }
        let wanted = resolve_flavor(new, &self.defaults, &self.cloud).await?;
        match resolve_flavor(old, &self.defaults, &self.cloud).await {
            Ok(current) if current == wanted => {
                debug!(flavor_id = %wanted, "flavor reference resolves to the current flavor");
                Ok(None)
            }
            _ => Ok(Some(wanted)),
        }
    }
}
