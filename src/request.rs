//! Create request composition.
//!
//! A single concrete request type carries every optional extension (key pair,
//! block-device mapping, scheduler hints). [`CreateServerBuilder`] sets them
//! conditionally and decides the endpoint and microversion the submission
//! needs.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use crate::block_device::BlockDeviceMapping;
use crate::compute::Microversion;
use crate::instance::{InstanceConfig, NetworkMode, Password, SchedulerHints};

/// Security group reference inside a create request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SecurityGroupRef {
    /// Group name.
    pub name: String,
}

/// File injected at boot, with base64 content.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PersonalityEntry {
    /// Guest path.
    pub path: String,
    /// Base64-encoded content.
    pub contents: String,
}

/// One explicit network request.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct NetworkRequest {
    /// Network ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Pre-created port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Requested fixed IPv4 address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_ip: Option<Ipv4Addr>,
}

/// Network section of a create request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NetworkSpec {
    /// Reserved keyword (`auto` or `none`).
    Keyword(NetworkMode),
    /// Explicit ordered list.
    Explicit(Vec<NetworkRequest>),
}

/// Server section of a create request.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ServerCreate {
    /// Display name.
    pub name: String,
    /// Image to boot; absent when booting from a volume.
    #[serde(rename = "imageRef", skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    /// Flavor ID.
    #[serde(rename = "flavorRef")]
    pub flavor_ref: String,
    /// Security groups.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<SecurityGroupRef>,
    /// Availability zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Networks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworkSpec>,
    /// Metadata.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Configuration drive flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_drive: Option<bool>,
    /// Admin password.
    #[serde(rename = "adminPass", skip_serializing_if = "Option::is_none")]
    pub admin_pass: Option<Password>,
    /// Base64-encoded user data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Injected files.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub personality: Vec<PersonalityEntry>,
    /// Tags.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Key pair extension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    /// Boot-from-volume extension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_device_mapping_v2: Option<Vec<BlockDeviceMapping>>,
}

/// Full JSON body of a create request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CreateServerBody {
    /// Server section.
    pub server: ServerCreate,
    /// Scheduler-hints extension.
    #[serde(rename = "os:scheduler_hints", skip_serializing_if = "Option::is_none")]
    pub scheduler_hints: Option<SchedulerHints>,
}

/// Endpoint a create request is posted to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreateEndpoint {
    /// Plain create.
    Servers,
    /// Boot-from-volume create.
    BootFromVolume,
}

impl CreateEndpoint {
    /// Returns the path relative to the compute endpoint.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Servers => "servers",
            Self::BootFromVolume => "os-volumes_boot",
        }
    }
}

/// Ready-to-send create request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateSubmission {
    /// JSON body.
    pub body: CreateServerBody,
    /// Target endpoint.
    pub endpoint: CreateEndpoint,
    /// Microversion the body needs, if any.
    pub microversion: Option<Microversion>,
}

/// Conditionally applies the create extensions to a base request.
#[derive(Clone, Debug)]
pub struct CreateServerBuilder {
    server: ServerCreate,
    scheduler_hints: Option<SchedulerHints>,
}

impl CreateServerBuilder {
    /// Starts from a base request.
    #[must_use]
    pub const fn new(server: ServerCreate) -> Self {
        Self {
            server,
            scheduler_hints: None,
        }
    }

    /// Injects a key pair when one is named.
    #[must_use]
    pub fn key_pair(mut self, key_pair: Option<&str>) -> Self {
        self.server.key_name = key_pair
            .filter(|name| !name.trim().is_empty())
            .map(str::to_owned);
        self
    }

    /// Attaches a validated block-device list and switches to the
    /// boot-from-volume endpoint.
    #[must_use]
    pub fn block_devices(mut self, devices: Option<Vec<BlockDeviceMapping>>) -> Self {
        self.server.block_device_mapping_v2 = devices;
        self
    }

    /// Adds scheduler hints unless they are empty.
    #[must_use]
    pub fn scheduler_hints(mut self, hints: &SchedulerHints) -> Self {
        self.scheduler_hints = (!hints.is_empty()).then(|| hints.clone());
        self
    }

    /// Finalises the submission.
    #[must_use]
    pub fn build(self) -> CreateSubmission {
        let endpoint = if self.server.block_device_mapping_v2.is_some() {
            CreateEndpoint::BootFromVolume
        } else {
            CreateEndpoint::Servers
        };
        let microversion = if !self.server.tags.is_empty() {
            Some(Microversion::CREATE_WITH_TAGS)
        } else if matches!(self.server.networks, Some(NetworkSpec::Keyword(_))) {
            Some(Microversion::AUTO_NETWORKS)
        } else {
            None
        };
        CreateSubmission {
            body: CreateServerBody {
                server: self.server,
                scheduler_hints: self.scheduler_hints,
            },
            endpoint,
            microversion,
        }
    }
}

/// Resolved boot references.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootSource {
    /// Image ID, absent when booting from a volume.
    pub image_id: Option<String>,
    /// Flavor ID.
    pub flavor_id: String,
}

/// Builds the create submission for `config`.
///
/// `networks` holds the explicit network requests with names already
/// resolved to IDs; it is ignored when the document uses a network keyword.
#[must_use]
pub fn compose_create_request(
    config: &InstanceConfig,
    boot: BootSource,
    networks: Vec<NetworkRequest>,
    block_devices: Option<Vec<BlockDeviceMapping>>,
) -> CreateSubmission {
    let network_spec = match config.network_mode {
        Some(mode) => Some(NetworkSpec::Keyword(mode)),
        None if networks.is_empty() => None,
        None => Some(NetworkSpec::Explicit(networks)),
    };
    let server = ServerCreate {
        name: config.name.clone(),
        image_ref: boot.image_id,
        flavor_ref: boot.flavor_id,
        security_groups: config
            .security_groups
            .iter()
            .map(|name| SecurityGroupRef { name: name.clone() })
            .collect(),
        availability_zone: config.availability_zone.clone(),
        networks: network_spec,
        metadata: config.metadata.clone(),
        config_drive: config.config_drive,
        admin_pass: config.admin_pass.clone(),
        user_data: config.user_data.as_deref().map(|data| STANDARD.encode(data)),
        personality: config
            .personality
            .iter()
            .map(|file| PersonalityEntry {
                path: file.file.clone(),
                contents: STANDARD.encode(&file.content),
            })
            .collect(),
        tags: config.tags.iter().cloned().collect(),
        key_name: None,
        block_device_mapping_v2: None,
    };

    CreateServerBuilder::new(server)
        .key_pair(config.key_pair.as_deref())
        .block_devices(block_devices)
        .scheduler_hints(&config.scheduler_hints)
        .build()
}
