//! Error types shared by the lifecycle orchestrator and its collaborators.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::boot::BootSourceError;
use crate::instance::ValidationErrors;
use crate::poll::WaitError;

/// Classified failure returned by a control-plane call.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ApiError {
    /// The referenced resource no longer exists remotely.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Kind of resource that was looked up (for example `server`).
        resource: String,
        /// Identifier used for the lookup.
        id: String,
    },
    /// The call is not valid in the resource's current remote state.
    #[error("conflict: {message}")]
    Conflict {
        /// Message returned by the control plane.
        message: String,
    },
    /// The control plane is temporarily unable to serve the call.
    #[error("service unavailable (HTTP {status}): {message}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Message returned by the control plane.
        message: String,
    },
    /// The control plane rejected the call as invalid.
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Message returned by the control plane.
        message: String,
    },
    /// The call never produced a response.
    #[error("transport error: {message}")]
    Transport {
        /// Message from the HTTP client.
        message: String,
    },
    /// The response body could not be decoded.
    #[error("failed to decode {what}: {message}")]
    Decode {
        /// Payload being decoded.
        what: String,
        /// Decoder error message.
        message: String,
    },
}

impl ApiError {
    /// Builds a [`ApiError::NotFound`] for the given resource kind and ID.
    #[must_use]
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Returns `true` when the remote resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for conflicts and transient unavailability, the only
    /// classes a caller may safely retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable { .. })
    }
}

/// Named sub-step of a lifecycle operation, reported with every failure.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Step {
    /// Submitting the create request.
    Submit,
    /// Waiting for the instance to leave `BUILD`.
    WaitForBuild,
    /// Stopping the instance.
    Stop,
    /// Starting the instance.
    Start,
    /// Shelving the instance.
    Shelve,
    /// Unshelving the instance.
    Unshelve,
    /// Resizing to a new flavor.
    Resize,
    /// Confirming a pending resize.
    ConfirmResize,
    /// Renaming the instance.
    Rename,
    /// Changing the admin password.
    ChangePassword,
    /// Reconciling metadata.
    Metadata,
    /// Replacing tags.
    Tags,
    /// Reconciling security-group membership.
    SecurityGroups,
    /// Attaching a port.
    AttachPort,
    /// Detaching a port.
    DetachPort,
    /// Submitting the delete request.
    Delete,
    /// Waiting for the instance to disappear.
    WaitForDelete,
    /// Waiting for a formerly attached volume to be released.
    VolumeRelease,
    /// Looking up the instance before reconciling it.
    Lookup,
    /// Reading back authoritative state.
    Read,
}

impl Step {
    /// Returns the stable snake-case name of the step.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::WaitForBuild => "wait_for_build",
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Shelve => "shelve",
            Self::Unshelve => "unshelve",
            Self::Resize => "resize",
            Self::ConfirmResize => "confirm_resize",
            Self::Rename => "rename",
            Self::ChangePassword => "change_password",
            Self::Metadata => "metadata",
            Self::Tags => "tags",
            Self::SecurityGroups => "security_groups",
            Self::AttachPort => "attach_port",
            Self::DetachPort => "detach_port",
            Self::Delete => "delete",
            Self::WaitForDelete => "wait_for_delete",
            Self::VolumeRelease => "volume_release",
            Self::Lookup => "lookup",
            Self::Read => "read",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Errors surfaced by the instance lifecycle orchestrator.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The desired-state document failed validation.
    #[error("invalid instance configuration: {0}")]
    InvalidConfig(#[from] ValidationErrors),
    /// Image or flavor references could not be determined.
    #[error("boot source resolution failed: {0}")]
    BootSource(#[from] BootSourceError),
    /// A call failed before the control plane assigned an instance ID.
    #[error("{step} failed before an instance id was assigned: {source}")]
    Submit {
        /// Failing sub-step.
        step: Step,
        /// Classified control-plane error.
        #[source]
        source: ApiError,
    },
    /// A control-plane call failed for a known instance.
    #[error("{step} failed for instance {instance_id}: {source}")]
    Api {
        /// Instance the call targeted.
        instance_id: String,
        /// Failing sub-step.
        step: Step,
        /// Classified control-plane error.
        #[source]
        source: ApiError,
    },
    /// A wait exceeded its deadline.
    #[error(
        "timed out after {timeout:?} during {step} for instance {instance_id} (last status: {})",
        .last_status.as_deref().unwrap_or("none")
    )]
    Timeout {
        /// Instance being waited on.
        instance_id: String,
        /// Failing sub-step.
        step: Step,
        /// Budget that elapsed.
        timeout: Duration,
        /// Last status observed before the deadline, if any.
        last_status: Option<String>,
    },
    /// A wait observed a status outside both the pending and target sets.
    #[error("{step} for instance {instance_id} observed unexpected status {status}")]
    UnexpectedStatus {
        /// Instance being waited on.
        instance_id: String,
        /// Failing sub-step.
        step: Step,
        /// Offending status string.
        status: String,
    },
    /// The instance vanished while an operation was still using it.
    #[error("instance {instance_id} no longer exists (during {step})")]
    Gone {
        /// Instance that could not be found.
        instance_id: String,
        /// Sub-step that found it missing.
        step: Step,
    },
}

impl LifecycleError {
    pub(crate) fn api(instance_id: &str, step: Step, source: ApiError) -> Self {
        Self::Api {
            instance_id: instance_id.to_owned(),
            step,
            source,
        }
    }

    pub(crate) fn from_wait(instance_id: &str, step: Step, error: WaitError) -> Self {
        let instance_id = instance_id.to_owned();
        match error {
            WaitError::Refresh(source) => Self::Api {
                instance_id,
                step,
                source,
            },
            WaitError::UnexpectedStatus { status, .. } => Self::UnexpectedStatus {
                instance_id,
                step,
                status,
            },
            WaitError::Timeout {
                timeout,
                last_status,
            } => Self::Timeout {
                instance_id,
                step,
                timeout,
                last_status,
            },
        }
    }

    /// Returns the remote instance ID when the failure happened after the
    /// control plane assigned one, so callers can resume with a read.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::Api { instance_id, .. }
            | Self::Timeout { instance_id, .. }
            | Self::UnexpectedStatus { instance_id, .. }
            | Self::Gone { instance_id, .. } => Some(instance_id),
            Self::InvalidConfig(_) | Self::BootSource(_) | Self::Submit { .. } => None,
        }
    }

    /// Returns the failing sub-step, when the error is tied to one.
    #[must_use]
    pub const fn step(&self) -> Option<Step> {
        match self {
            Self::Submit { step, .. }
            | Self::Api { step, .. }
            | Self::Timeout { step, .. }
            | Self::UnexpectedStatus { step, .. }
            | Self::Gone { step, .. } => Some(*step),
            Self::InvalidConfig(_) | Self::BootSource(_) => None,
        }
    }

    /// Returns `true` when a wait ran out of time; callers may retry the
    /// whole operation.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::lookup(Step::Lookup, "instance srv-1 no longer exists (during lookup)")]
    #[case::read_back(Step::Read, "instance srv-1 no longer exists (during read)")]
    fn vanished_instance_names_the_step(#[case] step: Step, #[case] message: &str) {
        let err = LifecycleError::Gone {
            instance_id: String::from("srv-1"),
            step,
        };

        assert_eq!(err.step(), Some(step));
        assert_eq!(err.instance_id(), Some("srv-1"));
        assert_eq!(err.to_string(), message);
    }

    #[rstest]
    #[case::conflict(ApiError::Conflict { message: String::from("busy") }, true)]
    #[case::unavailable(ApiError::Unavailable { status: 503, message: String::new() }, true)]
    #[case::not_found(ApiError::not_found("server", "srv-1"), false)]
    #[case::transport(ApiError::Transport { message: String::from("reset") }, false)]
    fn only_conflicts_and_unavailability_are_retryable(
        #[case] error: ApiError,
        #[case] retryable: bool,
    ) {
        assert_eq!(error.is_retryable(), retryable);
    }
}
