//! Wire payloads for the compute, image, network, and block-storage APIs.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compute::{
    AddressRecord, CreatedServer, InterfaceRecord, InterfaceRequest, ServerRecord, ServerUpdate,
    VolumeAttachmentRecord,
};
use crate::error::ApiError;

/// Resource a call addresses, used to label `NotFound` errors.
#[derive(Clone, Copy, Debug)]
pub(super) struct Target<'a> {
    pub(super) resource: &'static str,
    pub(super) id: &'a str,
}

impl<'a> Target<'a> {
    pub(super) const fn new(resource: &'static str, id: &'a str) -> Self {
        Self { resource, id }
    }
}

/// Maps a non-success HTTP status to an [`ApiError`].
pub(super) fn classify_status(status: u16, body: &str, target: Target<'_>) -> ApiError {
    let message = error_message(body);
    match status {
        404 => ApiError::not_found(target.resource, target.id),
        409 => ApiError::Conflict { message },
        429 | 500..=599 => ApiError::Unavailable { status, message },
        _ => ApiError::Rejected { status, message },
    }
}

/// Extracts the human-readable message from a fault body.
///
/// Faults arrive wrapped in a single named object, for example
/// `{"itemNotFound": {"message": "...", "code": 404}}`; anything else is
/// returned as-is.
pub(super) fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    parsed
        .as_ref()
        .and_then(Value::as_object)
        .and_then(|fault| {
            fault
                .values()
                .find_map(|inner| inner.get("message").and_then(Value::as_str))
        })
        .map_or_else(|| body.trim().to_owned(), str::to_owned)
}

#[derive(Debug, Deserialize)]
pub(super) struct CreatedEnvelope {
    pub(super) server: CreatedWire,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreatedWire {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

impl From<CreatedWire> for CreatedServer {
    fn from(wire: CreatedWire) -> Self {
        Self {
            id: wire.id,
            status: wire.status,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerEnvelope {
    pub(super) server: ServerWire,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerWire {
    id: String,
    #[serde(default)]
    name: String,
    status: String,
    #[serde(rename = "OS-EXT-AZ:availability_zone", default)]
    availability_zone: Option<String>,
    // Volume-backed servers report an empty string instead of an object.
    #[serde(default)]
    image: Value,
    #[serde(default)]
    flavor: Value,
    #[serde(rename = "accessIPv4", default)]
    access_ip_v4: Option<String>,
    #[serde(rename = "accessIPv6", default)]
    access_ip_v6: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    security_groups: Vec<NamedWire>,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<AddressWire>>,
}

#[derive(Debug, Deserialize)]
struct NamedWire {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AddressWire {
    addr: IpAddr,
    #[serde(rename = "OS-EXT-IPS-MAC:mac_addr", default)]
    mac: Option<String>,
}

fn linked_id(reference: &Value) -> Option<String> {
    reference
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

impl From<ServerWire> for ServerRecord {
    fn from(wire: ServerWire) -> Self {
        let mut security_groups: Vec<String> = wire
            .security_groups
            .into_iter()
            .map(|group| group.name)
            .collect();
        security_groups.sort();
        security_groups.dedup();

        let addresses = wire
            .addresses
            .into_iter()
            .flat_map(|(network_name, entries)| {
                entries.into_iter().map(move |entry| AddressRecord {
                    network_name: network_name.clone(),
                    addr: entry.addr,
                    mac: entry.mac,
                })
            })
            .collect();

        Self {
            id: wire.id,
            name: wire.name,
            status: wire.status,
            availability_zone: non_empty(wire.availability_zone),
            image_id: linked_id(&wire.image),
            flavor_id: linked_id(&wire.flavor),
            access_ip_v4: non_empty(wire.access_ip_v4),
            access_ip_v6: non_empty(wire.access_ip_v6),
            metadata: wire.metadata,
            security_groups,
            addresses,
        }
    }
}

#[derive(Debug, Serialize)]
pub(super) struct ServerUpdateBody<'a> {
    pub(super) server: &'a ServerUpdate,
}

#[derive(Debug, Deserialize, Serialize)]
pub(super) struct MetadataEnvelope<M> {
    pub(super) metadata: M,
}

#[derive(Debug, Deserialize, Serialize)]
pub(super) struct TagsEnvelope<T> {
    pub(super) tags: T,
}

#[derive(Debug, Deserialize)]
pub(super) struct InterfaceListEnvelope {
    #[serde(rename = "interfaceAttachments")]
    pub(super) interfaces: Vec<InterfaceWire>,
}

#[derive(Debug, Deserialize)]
pub(super) struct InterfaceEnvelope {
    #[serde(rename = "interfaceAttachment")]
    pub(super) interface: InterfaceWire,
}

#[derive(Debug, Serialize)]
pub(super) struct InterfaceAttachBody<'a> {
    #[serde(rename = "interfaceAttachment")]
    pub(super) interface: &'a InterfaceRequest,
}

#[derive(Debug, Deserialize)]
pub(super) struct InterfaceWire {
    port_id: String,
    #[serde(default)]
    net_id: String,
    #[serde(default)]
    mac_addr: Option<String>,
    #[serde(default)]
    port_state: String,
    #[serde(default)]
    fixed_ips: Vec<FixedIpWire>,
}

#[derive(Debug, Deserialize)]
struct FixedIpWire {
    ip_address: IpAddr,
}

impl From<InterfaceWire> for InterfaceRecord {
    fn from(wire: InterfaceWire) -> Self {
        Self {
            port_id: wire.port_id,
            network_id: wire.net_id,
            mac: wire.mac_addr,
            port_state: wire.port_state,
            fixed_ips: wire.fixed_ips.into_iter().map(|ip| ip.ip_address).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeAttachmentsEnvelope {
    #[serde(rename = "volumeAttachments")]
    pub(super) attachments: Vec<VolumeAttachmentWire>,
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeAttachmentWire {
    #[serde(rename = "volumeId")]
    volume_id: String,
    #[serde(default)]
    device: Option<String>,
}

impl From<VolumeAttachmentWire> for VolumeAttachmentRecord {
    fn from(wire: VolumeAttachmentWire) -> Self {
        Self {
            volume_id: wire.volume_id,
            device: non_empty(wire.device),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct IdWire {
    pub(super) id: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct ImagesEnvelope {
    pub(super) images: Vec<IdWire>,
}

#[derive(Debug, Deserialize)]
pub(super) struct NetworksEnvelope {
    pub(super) networks: Vec<IdWire>,
}

#[derive(Debug, Deserialize)]
pub(super) struct FlavorsEnvelope {
    pub(super) flavors: Vec<FlavorWire>,
}

#[derive(Debug, Deserialize)]
pub(super) struct FlavorWire {
    pub(super) id: String,
    pub(super) name: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeEnvelope {
    pub(super) volume: VolumeWire,
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeWire {
    pub(super) status: String,
}
