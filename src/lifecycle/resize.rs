//! Resize and confirm protocol.

use std::time::Duration;

use tracing::info;

use super::InstanceOrchestrator;
use crate::compute::{Cloud, ServerAction};
use crate::error::{LifecycleError, Step};

const SETTLED: [&str; 2] = ["ACTIVE", "SHUTOFF"];

impl<C> InstanceOrchestrator<C>
where
    C: Cloud,
{
    /// Resizes `server_id` to `flavor_id`.
    ///
    /// With `auto_confirm` the control plane is trusted to confirm on its
    /// own and the wait runs straight through `VERIFY_RESIZE`. Otherwise the
    /// resize is confirmed explicitly once `VERIFY_RESIZE` is reached. A
    /// resize that never leaves `RESIZE` fails with a timeout and is not
    /// reverted.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when either action is rejected or a wait
    /// fails.
    pub async fn resize(
        &self,
        server_id: &str,
        flavor_id: &str,
        auto_confirm: bool,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        info!(instance_id = server_id, flavor_id, auto_confirm, "resizing instance");
        let action = ServerAction::Resize {
            flavor_ref: flavor_id.to_owned(),
        };
        self.cloud
            .server_action(server_id, &action)
            .await
            .map_err(|err| LifecycleError::api(server_id, Step::Resize, err))?;

        if auto_confirm {
            let change = self.state_change(&["RESIZE", "VERIFY_RESIZE"], &SETTLED, timeout);
            self.wait_for_server(server_id, Step::Resize, change).await?;
            return Ok(());
        }

        let change = self.state_change(&["RESIZE"], &["VERIFY_RESIZE"], timeout);
        self.wait_for_server(server_id, Step::Resize, change).await?;

        self.cloud
            .server_action(server_id, &ServerAction::ConfirmResize)
            .await
            .map_err(|err| LifecycleError::api(server_id, Step::ConfirmResize, err))?;
        let confirmed = self.state_change(&["VERIFY_RESIZE"], &SETTLED, timeout);
        self.wait_for_server(server_id, Step::ConfirmResize, confirmed)
            .await?;
        Ok(())
    }
}
