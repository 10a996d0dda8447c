//! Instance data model and the desired-state document.
//!
//! [`InstanceConfig`] is the only inbound structure: a typed rendition of the
//! declarative document an operator writes. It is validated once, at the
//! boundary, by [`InstanceConfig::validate`], which accumulates every fatal
//! problem before any remote call is made. [`Instance`] is the record handed
//! back after create, read, and update.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::block_device::{
    BlockDeviceConfig, BlockDeviceError, BlockDeviceMapping, BlockDeviceWarning,
    validate_block_devices,
};

/// Write-only admin password.
///
/// The value is only reachable through [`Password::expose`]; `Debug` output is
/// redacted.
#[derive(Clone, Default, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    /// Wraps a secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Returns the secret for inclusion in a request body.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Password(<redacted>)")
    }
}

impl Serialize for Password {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

/// Observed power state.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PowerState {
    /// Running.
    Active,
    /// Powered off.
    Shutoff,
    /// Shelved but still on its host.
    Shelved,
    /// Shelved and removed from its host.
    ShelvedOffloaded,
    /// Failed.
    Error,
    /// Being migrated.
    Migrating,
    /// Still building.
    Build,
    /// Any other status (for example `RESIZE`).
    Other(String),
}

impl PowerState {
    /// Classifies a raw status string.
    #[must_use]
    pub fn from_status(status: &str) -> Self {
        match status {
            "ACTIVE" => Self::Active,
            "SHUTOFF" => Self::Shutoff,
            "SHELVED" => Self::Shelved,
            "SHELVED_OFFLOADED" => Self::ShelvedOffloaded,
            "ERROR" => Self::Error,
            "MIGRATING" => Self::Migrating,
            "BUILD" => Self::Build,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Returns the status string this state was classified from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "ACTIVE",
            Self::Shutoff => "SHUTOFF",
            Self::Shelved => "SHELVED",
            Self::ShelvedOffloaded => "SHELVED_OFFLOADED",
            Self::Error => "ERROR",
            Self::Migrating => "MIGRATING",
            Self::Build => "BUILD",
            Self::Other(status) => status,
        }
    }

    /// Returns `true` for either shelved state.
    #[must_use]
    pub const fn is_shelved(&self) -> bool {
        matches!(self, Self::Shelved | Self::ShelvedOffloaded)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl Serialize for PowerState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Power state an operator may request.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredPowerState {
    /// Running.
    #[default]
    Active,
    /// Powered off.
    Shutoff,
    /// Shelved and offloaded.
    ShelvedOffloaded,
}

impl DesiredPowerState {
    /// Returns `true` when `observed` already satisfies this request.
    #[must_use]
    pub const fn matches(self, observed: &PowerState) -> bool {
        matches!(
            (self, observed),
            (Self::Active, PowerState::Active)
                | (Self::Shutoff, PowerState::Shutoff)
                | (Self::ShelvedOffloaded, PowerState::ShelvedOffloaded)
        )
    }
}

/// Reserved network keyword.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Let the control plane pick a network.
    Auto,
    /// Boot without networking.
    None,
}

/// One configured network attachment.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network ID.
    pub uuid: Option<String>,
    /// Network name, resolved to an ID before submission.
    pub name: Option<String>,
    /// Pre-created port to attach.
    pub port: Option<String>,
    /// Requested fixed IPv4 address.
    pub fixed_ip_v4: Option<Ipv4Addr>,
    /// Marks the network whose address is reported as the access address.
    pub access_network: bool,
}

impl NetworkConfig {
    fn has_target(&self) -> bool {
        [&self.uuid, &self.name, &self.port]
            .into_iter()
            .any(|field| field.as_deref().is_some_and(|value| !value.trim().is_empty()))
    }
}

/// File injected into the guest at boot.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct PersonalityFile {
    /// Guest path.
    pub file: String,
    /// Plain-text content; encoded before submission.
    pub content: String,
}

/// Placement hints passed to the scheduler.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SchedulerHints {
    /// Server group the instance joins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Instances whose hosts must be avoided.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub different_host: Vec<String>,
    /// Instances whose hosts must be shared.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub same_host: Vec<String>,
    /// Cell to schedule into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_cell: Option<String>,
}

impl SchedulerHints {
    /// Returns `true` when no hint is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.group.is_none()
            && self.different_host.is_empty()
            && self.same_host.is_empty()
            && self.target_cell.is_none()
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Longest budget accepted for a single operation: one week.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Per-operation time budgets, given in seconds in the document.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct Timeouts {
    /// Create budget, shared by the build wait and initial power state.
    #[serde(default = "default_timeout", deserialize_with = "seconds")]
    pub create: Duration,
    /// Update budget, shared by every update sub-step.
    #[serde(default = "default_timeout", deserialize_with = "seconds")]
    pub update: Duration,
    /// Delete budget, shared by every delete sub-step.
    #[serde(default = "default_timeout", deserialize_with = "seconds")]
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: DEFAULT_TIMEOUT,
            update: DEFAULT_TIMEOUT,
            delete: DEFAULT_TIMEOUT,
        }
    }
}

impl Timeouts {
    fn over_limit(&self) -> impl Iterator<Item = ValidationError> {
        [
            ("create", self.create),
            ("update", self.update),
            ("delete", self.delete),
        ]
        .into_iter()
        .filter(|(_, budget)| *budget > MAX_TIMEOUT)
        .map(|(operation, budget)| ValidationError::TimeoutTooLong {
            operation,
            seconds: budget.as_secs(),
        })
    }
}

/// Desired state of one instance.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceConfig {
    /// Display name.
    pub name: String,
    /// Explicit image ID.
    pub image_id: Option<String>,
    /// Image name, resolved through the image catalog.
    pub image_name: Option<String>,
    /// Explicit flavor ID.
    pub flavor_id: Option<String>,
    /// Flavor name, resolved through the flavor catalog.
    pub flavor_name: Option<String>,
    /// Security group names.
    pub security_groups: BTreeSet<String>,
    /// Availability zone.
    pub availability_zone: Option<String>,
    /// Reserved network keyword; excludes `networks`.
    pub network_mode: Option<NetworkMode>,
    /// Explicit network attachments in order.
    pub networks: Vec<NetworkConfig>,
    /// Metadata key/value pairs.
    pub metadata: BTreeMap<String, String>,
    /// Attach a configuration drive.
    pub config_drive: Option<bool>,
    /// Admin password; never read back.
    pub admin_pass: Option<Password>,
    /// Plain-text user data; encoded before submission.
    pub user_data: Option<String>,
    /// Files injected at boot.
    pub personality: Vec<PersonalityFile>,
    /// Server tags.
    pub tags: BTreeSet<String>,
    /// Key pair injected at boot.
    pub key_pair: Option<String>,
    /// Block devices; a non-empty list switches to boot-from-volume.
    pub block_devices: Vec<BlockDeviceConfig>,
    /// Scheduler placement hints.
    pub scheduler_hints: SchedulerHints,
    /// Desired power state.
    pub power_state: DesiredPowerState,
    /// Stop the instance before deleting it.
    pub stop_before_destroy: bool,
    /// Bypass soft-delete retention.
    pub force_delete: bool,
    /// Detach explicit ports before deleting the instance.
    pub detach_ports_before_destroy: bool,
    /// Trust the control plane to confirm resizes on its own.
    pub ignore_resize_confirmation: bool,
    /// Per-operation time budgets.
    pub timeouts: Timeouts,
}

/// Fatal problems found while validating an [`InstanceConfig`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidationError {
    /// The instance has no name.
    #[error("name must not be empty")]
    EmptyName,
    /// A network keyword was combined with explicit networks.
    #[error("network_mode cannot be combined with an explicit networks list")]
    NetworkModeConflict,
    /// A network entry names no network, port, or ID.
    #[error("networks[{index}]: one of uuid, name, or port must be set")]
    NetworkTarget {
        /// Position of the entry in the list.
        index: usize,
    },
    /// More than one network is flagged as the access network.
    #[error("access_network may only be set on one network ({count} found)")]
    MultipleAccessNetworks {
        /// Number of flagged entries.
        count: usize,
    },
    /// An operation timeout exceeds [`MAX_TIMEOUT`].
    #[error("timeouts.{operation} must be at most {max} seconds, got {seconds}", max = MAX_TIMEOUT.as_secs())]
    TimeoutTooLong {
        /// Operation the budget applies to.
        operation: &'static str,
        /// Requested budget.
        seconds: u64,
    },
    /// A block-device problem.
    #[error(transparent)]
    BlockDevice(#[from] BlockDeviceError),
}

/// Every fatal problem in a document, plus the warnings found alongside.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationErrors {
    /// Fatal problems.
    pub errors: Vec<ValidationError>,
    /// Soft block-device inconsistencies.
    pub warnings: Vec<BlockDeviceWarning>,
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        formatter.write_str(&messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Boundary-validated view of an [`InstanceConfig`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidatedConfig {
    /// Block-device mappings; `None` when no devices are configured.
    pub block_devices: Option<Vec<BlockDeviceMapping>>,
    /// Soft inconsistencies worth surfacing to the operator.
    pub warnings: Vec<BlockDeviceWarning>,
}

impl InstanceConfig {
    /// Creates a document with `name` and every other field defaulted.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Validates the document, collecting every fatal problem.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationErrors`] when any check fails.
    pub fn validate(&self) -> Result<ValidatedConfig, ValidationErrors> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::EmptyName);
        }
        if self.network_mode.is_some() && !self.networks.is_empty() {
            errors.push(ValidationError::NetworkModeConflict);
        }
        errors.extend(
            self.networks
                .iter()
                .enumerate()
                .filter(|(_, network)| !network.has_target())
                .map(|(index, _)| ValidationError::NetworkTarget { index }),
        );
        let access = self
            .networks
            .iter()
            .filter(|network| network.access_network)
            .count();
        if access > 1 {
            errors.push(ValidationError::MultipleAccessNetworks { count: access });
        }
        errors.extend(self.timeouts.over_limit());

        let (block_devices, warnings) = if self.block_devices.is_empty() {
            (None, Vec::new())
        } else {
            match validate_block_devices(&self.block_devices) {
                Ok(validated) => (Some(validated.devices), validated.warnings),
                Err(failure) => {
                    errors.extend(failure.errors.into_iter().map(ValidationError::from));
                    (None, failure.warnings)
                }
            }
        };

        if errors.is_empty() {
            Ok(ValidatedConfig {
                block_devices,
                warnings,
            })
        } else {
            Err(ValidationErrors { errors, warnings })
        }
    }

    /// Returns the ports named by explicit network entries, in order.
    #[must_use]
    pub fn ports(&self) -> Vec<&str> {
        self.networks
            .iter()
            .filter_map(|network| network.port.as_deref())
            .filter(|port| !port.trim().is_empty())
            .collect()
    }
}

/// One network attachment as observed remotely.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct NetworkAttachment {
    /// Network ID.
    pub network_id: String,
    /// Network name, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port backing the attachment.
    pub port_id: String,
    /// First fixed IPv4 address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_ip_v4: Option<Ipv4Addr>,
    /// First fixed IPv6 address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_ip_v6: Option<Ipv6Addr>,
    /// Remote-assigned MAC address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Whether this attachment supplies the access address.
    pub access_network: bool,
}

/// Authoritative view of one instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Instance {
    /// Remote-assigned ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Raw status string.
    pub status: String,
    /// Classified power state.
    pub power_state: PowerState,
    /// Boot image, absent for volume-backed instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Current flavor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flavor_id: Option<String>,
    /// Availability zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Network attachments.
    pub networks: Vec<NetworkAttachment>,
    /// IPv4 access address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_ip_v4: Option<Ipv4Addr>,
    /// IPv6 access address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_ip_v6: Option<Ipv6Addr>,
    /// Metadata key/value pairs.
    pub metadata: BTreeMap<String, String>,
    /// Server tags.
    pub tags: BTreeSet<String>,
    /// Security group names.
    pub security_groups: BTreeSet<String>,
    /// IDs of attached volumes.
    pub volume_attachments: Vec<String>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::block_device::{DestinationType, SourceType};

    fn parse(value: serde_json::Value) -> InstanceConfig {
        serde_json::from_value(value).unwrap_or_else(|err| panic!("document should parse: {err}"))
    }

    #[test]
    fn document_defaults_are_applied() {
        let config = parse(json!({ "name": "web-1", "image_id": "img-1" }));

        assert_eq!(config.power_state, DesiredPowerState::Active);
        assert_eq!(config.timeouts, Timeouts::default());
        assert!(!config.ignore_resize_confirmation);
        assert!(config.block_devices.is_empty());
    }

    #[test]
    fn timeouts_are_read_as_seconds() {
        let config = parse(json!({
            "name": "web-1",
            "timeouts": { "create": 90, "delete": 5 },
        }));

        assert_eq!(config.timeouts.create, Duration::from_secs(90));
        assert_eq!(config.timeouts.update, DEFAULT_TIMEOUT);
        assert_eq!(config.timeouts.delete, Duration::from_secs(5));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_value::<InstanceConfig>(json!({
            "name": "web-1",
            "flavour": "m1.small",
        }));

        assert!(result.is_err());
    }

    #[test]
    fn validation_accumulates_errors() {
        let config = InstanceConfig {
            network_mode: Some(NetworkMode::Auto),
            networks: vec![
                NetworkConfig {
                    access_network: true,
                    ..NetworkConfig::default()
                },
                NetworkConfig {
                    uuid: Some(String::from("net-1")),
                    access_network: true,
                    ..NetworkConfig::default()
                },
            ],
            block_devices: vec![
                BlockDeviceConfig::new(SourceType::Volume, DestinationType::Volume),
                BlockDeviceConfig {
                    uuid: Some(String::from("vol-2")),
                    ..BlockDeviceConfig::new(SourceType::Volume, DestinationType::Volume)
                },
            ],
            ..InstanceConfig::default()
        };

        let failure = config.validate().expect_err("validation should fail");

        assert_eq!(
            failure.errors,
            vec![
                ValidationError::EmptyName,
                ValidationError::NetworkModeConflict,
                ValidationError::NetworkTarget { index: 0 },
                ValidationError::MultipleAccessNetworks { count: 2 },
                ValidationError::BlockDevice(BlockDeviceError::MissingUuid {
                    index: 0,
                    source_type: SourceType::Volume,
                }),
                ValidationError::BlockDevice(BlockDeviceError::NoBootDevice),
            ]
        );
        assert!(failure.to_string().contains("name must not be empty; "));
    }

    #[test]
    fn oversized_timeouts_are_rejected() {
        let config = parse(json!({
            "name": "vm",
            "timeouts": { "create": u64::MAX, "delete": 600 }
        }));

        let failure = config.validate().expect_err("validation should fail");

        assert_eq!(
            failure.errors,
            vec![ValidationError::TimeoutTooLong {
                operation: "create",
                seconds: u64::MAX,
            }]
        );
        assert!(failure.to_string().contains("timeouts.create must be at most 604800 seconds"));
    }

    #[test]
    fn empty_block_device_list_is_absent() {
        let validated = InstanceConfig::named("vm")
            .validate()
            .unwrap_or_else(|err| panic!("document should validate: {err}"));

        assert_eq!(validated.block_devices, None);
    }

    #[rstest]
    #[case::active(DesiredPowerState::Active, "ACTIVE", true)]
    #[case::shutoff(DesiredPowerState::Shutoff, "SHUTOFF", true)]
    #[case::offloaded(DesiredPowerState::ShelvedOffloaded, "SHELVED_OFFLOADED", true)]
    #[case::shelved_is_not_offloaded(DesiredPowerState::ShelvedOffloaded, "SHELVED", false)]
    #[case::active_vs_shutoff(DesiredPowerState::Active, "SHUTOFF", false)]
    fn desired_state_matching(
        #[case] desired: DesiredPowerState,
        #[case] status: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(desired.matches(&PowerState::from_status(status)), expected);
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let config = parse(json!({ "name": "vm", "admin_pass": "hunter2" }));

        assert_eq!(
            config.admin_pass.as_ref().map(Password::expose),
            Some("hunter2")
        );
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn ports_lists_explicit_ports_in_order() {
        let config = InstanceConfig {
            networks: vec![
                NetworkConfig {
                    port: Some(String::from("port-b")),
                    ..NetworkConfig::default()
                },
                NetworkConfig {
                    uuid: Some(String::from("net-1")),
                    ..NetworkConfig::default()
                },
                NetworkConfig {
                    port: Some(String::from("port-a")),
                    ..NetworkConfig::default()
                },
            ],
            ..InstanceConfig::named("vm")
        };

        assert_eq!(config.ports(), vec!["port-b", "port-a"]);
    }
}
