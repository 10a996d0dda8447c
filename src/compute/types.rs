//! Records exchanged with the compute control plane.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Serialize;
use serde_json::{Value, json};

use super::Microversion;
use crate::instance::Password;

/// Response to a create submission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedServer {
    /// Remote-assigned instance ID.
    pub id: String,
    /// Status reported with the acceptance, when the control plane sends one.
    pub status: Option<String>,
}

/// Authoritative server state as reported by the control plane.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerRecord {
    /// Instance ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Raw status string (for example `ACTIVE` or `VERIFY_RESIZE`).
    pub status: String,
    /// Availability zone the instance landed in.
    pub availability_zone: Option<String>,
    /// Image the instance booted from; absent for volume-backed instances.
    pub image_id: Option<String>,
    /// Current flavor.
    pub flavor_id: Option<String>,
    /// Operator-assigned IPv4 access address.
    pub access_ip_v4: Option<String>,
    /// Operator-assigned IPv6 access address.
    pub access_ip_v6: Option<String>,
    /// Metadata key/value pairs.
    pub metadata: BTreeMap<String, String>,
    /// Names of security groups the instance belongs to.
    pub security_groups: Vec<String>,
    /// Addresses grouped under their network name.
    pub addresses: Vec<AddressRecord>,
}

/// One address reported on a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressRecord {
    /// Network name the address belongs to.
    pub network_name: String,
    /// The address itself.
    pub addr: IpAddr,
    /// MAC of the interface carrying it.
    pub mac: Option<String>,
}

/// Directly updatable server fields.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ServerUpdate {
    /// New display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Attached network interface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InterfaceRecord {
    /// Port backing the interface.
    pub port_id: String,
    /// Network the port belongs to.
    pub network_id: String,
    /// Remote-assigned MAC address.
    pub mac: Option<String>,
    /// Port state (for example `ACTIVE` or `DOWN`).
    pub port_state: String,
    /// Fixed addresses on the port.
    pub fixed_ips: Vec<IpAddr>,
}

/// Request to attach an existing port as a network interface.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InterfaceRequest {
    /// Port to attach.
    pub port_id: String,
}

/// Volume attached to a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeAttachmentRecord {
    /// Attached volume.
    pub volume_id: String,
    /// Guest device path, when reported.
    pub device: Option<String>,
}

/// Asynchronous server action submitted to the action endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerAction {
    /// Power the instance off.
    Stop,
    /// Power the instance on.
    Start,
    /// Shelve and offload the instance.
    Shelve,
    /// Restore a shelved instance, optionally into a specific zone.
    Unshelve {
        /// Target availability zone.
        availability_zone: Option<String>,
    },
    /// Move the instance to a new flavor.
    Resize {
        /// Flavor ID to resize to.
        flavor_ref: String,
    },
    /// Confirm a resize sitting in `VERIFY_RESIZE`.
    ConfirmResize,
    /// Set a new admin password.
    ChangePassword {
        /// The new password.
        admin_pass: Password,
    },
    /// Add the instance to a security group.
    AddSecurityGroup {
        /// Group name.
        name: String,
    },
    /// Remove the instance from a security group.
    RemoveSecurityGroup {
        /// Group name.
        name: String,
    },
}

impl ServerAction {
    /// Returns the action key used in the request body.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Stop => "os-stop",
            Self::Start => "os-start",
            Self::Shelve => "shelve",
            Self::Unshelve { .. } => "unshelve",
            Self::Resize { .. } => "resize",
            Self::ConfirmResize => "confirmResize",
            Self::ChangePassword { .. } => "changePassword",
            Self::AddSecurityGroup { .. } => "addSecurityGroup",
            Self::RemoveSecurityGroup { .. } => "removeSecurityGroup",
        }
    }

    /// Builds the JSON request body for the action endpoint.
    #[must_use]
    pub fn body(&self) -> Value {
        let argument = match self {
            Self::Stop | Self::Start | Self::Shelve | Self::ConfirmResize => Value::Null,
            Self::Unshelve { availability_zone } => availability_zone
                .as_ref()
                .map_or(Value::Null, |zone| json!({ "availability_zone": zone })),
            Self::Resize { flavor_ref } => json!({ "flavorRef": flavor_ref }),
            Self::ChangePassword { admin_pass } => json!({ "adminPass": admin_pass.expose() }),
            Self::AddSecurityGroup { name } | Self::RemoveSecurityGroup { name } => {
                json!({ "name": name })
            }
        };
        let mut body = serde_json::Map::new();
        body.insert(self.name().to_owned(), argument);
        Value::Object(body)
    }

    /// Returns the microversion the action requires, if any.
    #[must_use]
    pub const fn microversion(&self) -> Option<Microversion> {
        match self {
            Self::Unshelve {
                availability_zone: Some(_),
            } => Some(Microversion::UNSHELVE_TO_ZONE),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_body_carries_null_argument() {
        assert_eq!(ServerAction::Stop.body(), json!({ "os-stop": null }));
    }

    #[test]
    fn unshelve_into_zone_requires_microversion() {
        let action = ServerAction::Unshelve {
            availability_zone: Some(String::from("nova-2")),
        };
        assert_eq!(
            action.body(),
            json!({ "unshelve": { "availability_zone": "nova-2" } })
        );
        assert_eq!(action.microversion(), Some(Microversion::UNSHELVE_TO_ZONE));

        let plain = ServerAction::Unshelve {
            availability_zone: None,
        };
        assert_eq!(plain.body(), json!({ "unshelve": null }));
        assert_eq!(plain.microversion(), None);
    }

    #[test]
    fn change_password_exposes_secret_only_in_body() {
        let action = ServerAction::ChangePassword {
            admin_pass: Password::new("s3cret"),
        };
        assert_eq!(
            action.body(),
            json!({ "changePassword": { "adminPass": "s3cret" } })
        );
        assert!(!format!("{action:?}").contains("s3cret"));
    }
}
