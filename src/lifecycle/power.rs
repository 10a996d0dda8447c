//! Power-state transitions.

use std::time::Duration;

use tracing::info;

use super::InstanceOrchestrator;
use crate::compute::{Cloud, ServerAction, ServerRecord};
use crate::error::{LifecycleError, Step};
use crate::instance::{DesiredPowerState, PowerState};

/// Action needed to move an instance towards a desired power state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerTransition {
    /// Power off.
    Stop,
    /// Power on.
    Start,
    /// Shelve and offload.
    Shelve,
    /// Restore from a shelved state.
    Unshelve,
}

impl PowerTransition {
    /// Picks the transition from `current` to `desired`, or `None` when the
    /// instance is already there.
    #[must_use]
    pub const fn plan(current: &PowerState, desired: DesiredPowerState) -> Option<Self> {
        if desired.matches(current) {
            return None;
        }
        Some(match desired {
            DesiredPowerState::ShelvedOffloaded => Self::Shelve,
            DesiredPowerState::Shutoff => Self::Stop,
            DesiredPowerState::Active if current.is_shelved() => Self::Unshelve,
            DesiredPowerState::Active => Self::Start,
        })
    }

    /// Returns the step reported on failure.
    #[must_use]
    pub const fn step(self) -> Step {
        match self {
            Self::Stop => Step::Stop,
            Self::Start => Step::Start,
            Self::Shelve => Step::Shelve,
            Self::Unshelve => Step::Unshelve,
        }
    }

    /// Statuses tolerated while the transition is in flight.
    #[must_use]
    pub const fn pending(self) -> &'static [&'static str] {
        match self {
            Self::Stop => &["ACTIVE"],
            Self::Start => &["SHUTOFF"],
            Self::Shelve => &["ACTIVE", "SHUTOFF", "SHELVED"],
            Self::Unshelve => &["SHELVED", "SHELVED_OFFLOADED"],
        }
    }

    /// Status that completes the transition.
    #[must_use]
    pub const fn target(self) -> &'static str {
        match self {
            Self::Stop => "SHUTOFF",
            Self::Start | Self::Unshelve => "ACTIVE",
            Self::Shelve => "SHELVED_OFFLOADED",
        }
    }

    fn action(self, availability_zone: Option<&str>) -> ServerAction {
        match self {
            Self::Stop => ServerAction::Stop,
            Self::Start => ServerAction::Start,
            Self::Shelve => ServerAction::Shelve,
            Self::Unshelve => ServerAction::Unshelve {
                availability_zone: availability_zone.map(str::to_owned),
            },
        }
    }
}

impl<C> InstanceOrchestrator<C>
where
    C: Cloud,
{
    /// Moves `server` to `desired`, waiting for the target status.
    ///
    /// Does nothing when the observed state already matches. Unshelving
    /// carries the instance's availability zone.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the action is rejected or the wait
    /// fails. Submission failures are not retried here.
    pub async fn apply_power_state(
        &self,
        server: &ServerRecord,
        desired: DesiredPowerState,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let current = PowerState::from_status(&server.status);
        let Some(transition) = PowerTransition::plan(&current, desired) else {
            return Ok(());
        };
        self.run_transition(
            &server.id,
            transition,
            server.availability_zone.as_deref(),
            timeout,
        )
        .await
    }

    pub(super) async fn run_transition(
        &self,
        server_id: &str,
        transition: PowerTransition,
        availability_zone: Option<&str>,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let step = transition.step();
        info!(instance_id = server_id, %step, "changing power state");
        let action = transition.action(availability_zone);
        self.cloud
            .server_action(server_id, &action)
            .await
            .map_err(|err| LifecycleError::api(server_id, step, err))?;
        let change = self.state_change(transition.pending(), &[transition.target()], timeout);
        self.wait_for_server(server_id, step, change).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::offload_from_active("ACTIVE", DesiredPowerState::ShelvedOffloaded, Some(PowerTransition::Shelve))]
    #[case::offload_from_shelved("SHELVED", DesiredPowerState::ShelvedOffloaded, Some(PowerTransition::Shelve))]
    #[case::stop_active("ACTIVE", DesiredPowerState::Shutoff, Some(PowerTransition::Stop))]
    #[case::stop_shelved("SHELVED_OFFLOADED", DesiredPowerState::Shutoff, Some(PowerTransition::Stop))]
    #[case::unshelve("SHELVED", DesiredPowerState::Active, Some(PowerTransition::Unshelve))]
    #[case::unshelve_offloaded("SHELVED_OFFLOADED", DesiredPowerState::Active, Some(PowerTransition::Unshelve))]
    #[case::start("SHUTOFF", DesiredPowerState::Active, Some(PowerTransition::Start))]
    #[case::start_from_error("ERROR", DesiredPowerState::Active, Some(PowerTransition::Start))]
    #[case::already_active("ACTIVE", DesiredPowerState::Active, None)]
    #[case::already_off("SHUTOFF", DesiredPowerState::Shutoff, None)]
    #[case::already_offloaded("SHELVED_OFFLOADED", DesiredPowerState::ShelvedOffloaded, None)]
    fn transition_table(
        #[case] status: &str,
        #[case] desired: DesiredPowerState,
        #[case] expected: Option<PowerTransition>,
    ) {
        assert_eq!(
            PowerTransition::plan(&PowerState::from_status(status), desired),
            expected
        );
    }

    #[test]
    fn unshelve_carries_zone() {
        assert_eq!(
            PowerTransition::Unshelve.action(Some("nova-2")),
            ServerAction::Unshelve {
                availability_zone: Some(String::from("nova-2")),
            }
        );
    }
}
