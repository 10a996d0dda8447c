//! Instance lifecycle orchestration.
//!
//! [`InstanceOrchestrator`] drives one instance at a time through create,
//! read, update, and delete against a [`Cloud`]. Each operation is a single
//! call chain; every remote mutation is followed by a bounded wait through
//! [`crate::poll`]. The operations live in their own modules and extend the
//! orchestrator with separate `impl` blocks.

mod create;
mod delete;
mod power;
mod read;
mod reconcile;
mod resize;
mod update;

use std::time::Duration;

use crate::block_device::BlockDeviceWarning;
use crate::boot::BootDefaults;
use crate::compute::{BlockStorageApi, Cloud, ComputeApi, ServerRecord};
use crate::error::{LifecycleError, Step};
use crate::instance::Instance;
use crate::poll::{Observation, RefreshFuture, StateChange, StatusRefresh};

pub use power::PowerTransition;
pub use read::ReadOutcome;
pub use reconcile::{MetadataDelta, SetDelta};

/// Status reported for a server that no longer exists.
pub const DELETED: &str = "DELETED";
const DETACHED: &str = "DETACHED";
const ATTACHING: &str = "ATTACHING";
const ATTACHED: &str = "ATTACHED";
const STILL_ATTACHED: &str = "";
const VOLUME_DELETED: &str = "deleted";

/// Poll cadence and transient-retry policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSettings {
    /// Delay between refreshes.
    pub interval: Duration,
    /// Minimum delay before the first re-poll.
    pub min_delay: Duration,
    /// Attempts for waits wrapped in a transient retry.
    pub retry_attempts: u32,
    /// Pause between those attempts.
    pub retry_backoff: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: StateChange::DEFAULT_POLL_INTERVAL,
            min_delay: Duration::from_secs(10),
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Result of a create or update: the authoritative instance plus any
/// non-fatal warnings raised while validating the document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceReport {
    /// Instance as read back after the operation.
    pub instance: Instance,
    /// Soft block-device inconsistencies.
    pub warnings: Vec<BlockDeviceWarning>,
}

/// Drives instances through their lifecycle against a [`Cloud`].
#[derive(Debug)]
pub struct InstanceOrchestrator<C> {
    cloud: C,
    defaults: BootDefaults,
    polling: PollSettings,
}

impl<C> InstanceOrchestrator<C>
where
    C: Cloud,
{
    /// Creates an orchestrator with the default poll settings.
    #[must_use]
    pub fn new(cloud: C, defaults: BootDefaults) -> Self {
        Self {
            cloud,
            defaults,
            polling: PollSettings::default(),
        }
    }

    /// Overrides the poll cadence.
    ///
    /// Tests use this to keep wait scenarios fast.
    #[must_use]
    pub const fn with_poll_settings(mut self, polling: PollSettings) -> Self {
        self.polling = polling;
        self
    }

    /// Returns the underlying cloud handle.
    #[must_use]
    pub const fn cloud(&self) -> &C {
        &self.cloud
    }

    fn state_change(&self, pending: &[&str], target: &[&str], timeout: Duration) -> StateChange {
        StateChange::new(pending, target, timeout)
            .poll_interval(self.polling.interval)
            .min_delay(self.polling.min_delay)
    }

    async fn wait_for_server(
        &self,
        server_id: &str,
        step: Step,
        change: StateChange,
    ) -> Result<ServerRecord, LifecycleError> {
        let refresh = StatusRefresh::new(&self.cloud, server_id, poll_server::<C>);
        change
            .wait(&refresh)
            .await
            .map_err(|err| LifecycleError::from_wait(server_id, step, err))
    }
}

/// Server plus port, the key for interface polls.
pub(crate) struct InterfaceKey {
    server_id: String,
    port_id: String,
}

impl InterfaceKey {
    pub(crate) fn new(server_id: &str, port_id: &str) -> Self {
        Self {
            server_id: server_id.to_owned(),
            port_id: port_id.to_owned(),
        }
    }
}

/// Refreshes a server; a vanished server reports [`DELETED`].
fn poll_server<'a, C>(cloud: &'a C, server_id: &'a str) -> RefreshFuture<'a, ServerRecord>
where
    C: ComputeApi,
{
    Box::pin(async move {
        match cloud.get_server(server_id).await {
            Ok(server) => {
                let status = server.status.clone();
                Ok(Observation::new(server, status))
            }
            Err(err) if err.is_not_found() => {
                let gone = ServerRecord {
                    id: server_id.to_owned(),
                    status: DELETED.to_owned(),
                    ..ServerRecord::default()
                };
                Ok(Observation::new(gone, DELETED))
            }
            Err(err) => Err(err),
        }
    })
}

fn poll_interface_detached<'a, C>(cloud: &'a C, key: &'a InterfaceKey) -> RefreshFuture<'a, ()>
where
    C: ComputeApi,
{
    Box::pin(async move {
        match cloud.get_interface(&key.server_id, &key.port_id).await {
            Ok(_) => Ok(Observation::new((), STILL_ATTACHED)),
            Err(err) if err.is_not_found() => Ok(Observation::new((), DETACHED)),
            Err(err) => Err(err),
        }
    })
}

fn poll_interface_attached<'a, C>(cloud: &'a C, key: &'a InterfaceKey) -> RefreshFuture<'a, ()>
where
    C: ComputeApi,
{
    Box::pin(async move {
        match cloud.get_interface(&key.server_id, &key.port_id).await {
            Ok(interface) if interface.port_state == "ACTIVE" => {
                Ok(Observation::new((), ATTACHED))
            }
            Ok(_) => Ok(Observation::new((), ATTACHING)),
            Err(err) if err.is_not_found() => Ok(Observation::new((), ATTACHING)),
            Err(err) => Err(err),
        }
    })
}

fn poll_volume<'a, C>(cloud: &'a C, volume_id: &'a str) -> RefreshFuture<'a, ()>
where
    C: BlockStorageApi,
{
    Box::pin(async move {
        match cloud.volume_status(volume_id).await {
            Ok(status) => Ok(Observation::new((), status)),
            Err(err) if err.is_not_found() => Ok(Observation::new((), VOLUME_DELETED)),
            Err(err) => Err(err),
        }
    })
}
