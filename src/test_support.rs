//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedCloud`] is an in-memory control plane implementing every
//! collaborator trait. Mutating calls update the fake server immediately
//! (a stop leaves it `SHUTOFF`, a resize leaves it `VERIFY_RESIZE`), while
//! tests can script the statuses returned by subsequent reads, pin a status
//! forever, or inject one-shot failures for specific operations. Every call
//! is recorded for assertions.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::compute::{
    AddressRecord, ApiFuture, BlockStorageApi, CatalogLookup, ComputeApi, CreatedServer,
    InterfaceRecord, InterfaceRequest, Microversion, ServerAction, ServerRecord, ServerUpdate,
    VolumeAttachmentRecord,
};
use crate::error::ApiError;
use crate::request::{CreateEndpoint, CreateSubmission, NetworkSpec};

/// One call received by [`ScriptedCloud`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    /// Create request.
    CreateServer {
        /// Endpoint the request was posted to.
        endpoint: CreateEndpoint,
        /// Microversion sent with the request.
        microversion: Option<Microversion>,
        /// Serialised body.
        body: serde_json::Value,
    },
    /// Server read.
    GetServer(String),
    /// Server field update.
    UpdateServer {
        /// Target server.
        server_id: String,
        /// Requested update.
        update: ServerUpdate,
    },
    /// Graceful delete.
    DeleteServer(String),
    /// Forced delete.
    ForceDeleteServer(String),
    /// Server action.
    Action {
        /// Target server.
        server_id: String,
        /// Submitted action.
        action: ServerAction,
    },
    /// Bulk metadata upsert.
    UpdateMetadata {
        /// Target server.
        server_id: String,
        /// Submitted map.
        metadata: BTreeMap<String, String>,
    },
    /// Single metadata key delete.
    DeleteMetadataKey {
        /// Target server.
        server_id: String,
        /// Deleted key.
        key: String,
    },
    /// Tag listing.
    ListTags(String),
    /// Tag replacement.
    ReplaceTags {
        /// Target server.
        server_id: String,
        /// Submitted tags.
        tags: BTreeSet<String>,
        /// Microversion sent with the request.
        microversion: Microversion,
    },
    /// Interface listing.
    ListInterfaces(String),
    /// Single interface read.
    GetInterface {
        /// Target server.
        server_id: String,
        /// Port looked up.
        port_id: String,
    },
    /// Interface attach.
    AttachInterface {
        /// Target server.
        server_id: String,
        /// Submitted request.
        request: InterfaceRequest,
    },
    /// Interface detach.
    DetachInterface {
        /// Target server.
        server_id: String,
        /// Port detached.
        port_id: String,
    },
    /// Volume attachment listing.
    ListVolumeAttachments(String),
    /// Volume status read.
    VolumeStatus(String),
    /// Image name lookup.
    ImageLookup(String),
    /// Flavor name lookup.
    FlavorLookup(String),
    /// Network name lookup.
    NetworkLookup(String),
}

impl Call {
    /// Returns `true` for calls that change remote state.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::CreateServer { .. }
                | Self::UpdateServer { .. }
                | Self::DeleteServer(_)
                | Self::ForceDeleteServer(_)
                | Self::Action { .. }
                | Self::UpdateMetadata { .. }
                | Self::DeleteMetadataKey { .. }
                | Self::ReplaceTags { .. }
                | Self::AttachInterface { .. }
                | Self::DetachInterface { .. }
        )
    }
}

/// Operation a scripted failure applies to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    /// `create_server`.
    CreateServer,
    /// `get_server`.
    GetServer,
    /// `update_server`.
    UpdateServer,
    /// `delete_server`.
    DeleteServer,
    /// `force_delete_server`.
    ForceDeleteServer,
    /// `server_action` for the named action (for example `os-stop`).
    Action(&'static str),
    /// `update_metadata`.
    UpdateMetadata,
    /// `delete_metadata_key`.
    DeleteMetadataKey,
    /// `replace_tags`.
    ReplaceTags,
    /// `attach_interface`.
    AttachInterface,
    /// `detach_interface`.
    DetachInterface,
    /// `list_volume_attachments`.
    ListVolumeAttachments,
}

#[derive(Clone, Debug, Default)]
struct FakeServer {
    record: ServerRecord,
    tags: BTreeSet<String>,
    interfaces: Vec<InterfaceRecord>,
    volumes: Vec<VolumeAttachmentRecord>,
    scripted: VecDeque<String>,
    pinned: Option<String>,
}

#[derive(Debug, Default)]
struct CloudState {
    servers: BTreeMap<String, FakeServer>,
    next_ids: VecDeque<String>,
    created: u32,
    images: Vec<(String, String)>,
    flavors: Vec<(String, String)>,
    networks: Vec<(String, String)>,
    volumes: BTreeMap<String, VecDeque<String>>,
    failures: Vec<(Operation, ApiError)>,
    calls: Vec<Call>,
    untracked_volumes: bool,
}

impl CloudState {
    fn take_failure(&mut self, operation: &Operation) -> Result<(), ApiError> {
        let position = self.failures.iter().position(|(op, _)| op == operation);
        match position {
            Some(index) => Err(self.failures.remove(index).1),
            None => Ok(()),
        }
    }

    fn server_mut(&mut self, server_id: &str) -> Result<&mut FakeServer, ApiError> {
        self.servers
            .get_mut(server_id)
            .ok_or_else(|| ApiError::not_found("server", server_id))
    }

    fn allocate_id(&mut self) -> String {
        self.created += 1;
        self.next_ids
            .pop_front()
            .unwrap_or_else(|| format!("srv-{}", self.created))
    }
}

/// In-memory control plane for orchestrator tests.
#[derive(Clone, Debug, Default)]
pub struct ScriptedCloud {
    state: Arc<Mutex<CloudState>>,
}

impl ScriptedCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn respond<T, F>(&self, call: Call, body: F) -> ApiFuture<'_, T>
    where
        T: Send + 'static,
        F: FnOnce(&mut CloudState) -> Result<T, ApiError>,
    {
        let result = {
            let mut state = self.state();
            state.calls.push(call);
            body(&mut *state)
        };
        Box::pin(async move { result })
    }

    /// Registers an image name.
    pub fn add_image(&self, name: &str, id: &str) {
        self.state().images.push((name.to_owned(), id.to_owned()));
    }

    /// Registers a flavor name.
    pub fn add_flavor(&self, name: &str, id: &str) {
        self.state().flavors.push((name.to_owned(), id.to_owned()));
    }

    /// Registers a network name.
    pub fn add_network(&self, name: &str, id: &str) {
        self.state().networks.push((name.to_owned(), id.to_owned()));
    }

    /// Sets the ID handed to the next created server.
    pub fn next_server_id(&self, id: &str) {
        self.state().next_ids.push_back(id.to_owned());
    }

    /// Seeds an existing server.
    pub fn insert_server(&self, record: ServerRecord) {
        let id = record.id.clone();
        self.state().servers.insert(
            id,
            FakeServer {
                record,
                ..FakeServer::default()
            },
        );
    }

    /// Queues statuses returned by the next reads of `server_id`, creating
    /// the server entry if needed so scripts can precede the create call.
    pub fn script_statuses(&self, server_id: &str, statuses: &[&str]) {
        let mut state = self.state();
        let server = state.servers.entry(server_id.to_owned()).or_default();
        server
            .scripted
            .extend(statuses.iter().map(|status| (*status).to_owned()));
    }

    /// Makes every read of `server_id` report `status`.
    pub fn pin_status(&self, server_id: &str, status: &str) {
        let mut state = self.state();
        let server = state.servers.entry(server_id.to_owned()).or_default();
        server.pinned = Some(status.to_owned());
    }

    /// Seeds an attached interface.
    pub fn add_interface(&self, server_id: &str, port_id: &str, network_id: &str, ip: Ipv4Addr) {
        let mut state = self.state();
        let server = state.servers.entry(server_id.to_owned()).or_default();
        server.interfaces.push(interface(port_id, network_id, ip));
    }

    /// Seeds an attached volume reported as `in-use`.
    pub fn attach_volume(&self, server_id: &str, volume_id: &str) {
        let mut state = self.state();
        let server = state.servers.entry(server_id.to_owned()).or_default();
        server.volumes.push(VolumeAttachmentRecord {
            volume_id: volume_id.to_owned(),
            device: None,
        });
        state
            .volumes
            .insert(volume_id.to_owned(), VecDeque::from([String::from("in-use")]));
    }

    /// Queues statuses returned by the next reads of `volume_id`.
    pub fn script_volume(&self, volume_id: &str, statuses: &[&str]) {
        self.state()
            .volumes
            .insert(
                volume_id.to_owned(),
                statuses.iter().map(|status| (*status).to_owned()).collect(),
            );
    }

    /// Behaves like a control plane without a block-storage endpoint.
    pub fn without_block_storage(&self) {
        self.state().untracked_volumes = true;
    }

    /// Makes the next call of `operation` fail with `error`.
    pub fn fail_with(&self, operation: Operation, error: ApiError) {
        self.state().failures.push((operation, error));
    }

    /// Returns every call received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Returns only the calls that change remote state.
    #[must_use]
    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(Call::is_mutating)
            .collect()
    }

    /// Returns the current record of `server_id`, if it exists.
    #[must_use]
    pub fn server(&self, server_id: &str) -> Option<ServerRecord> {
        self.state()
            .servers
            .get(server_id)
            .map(|server| server.record.clone())
    }

    /// Returns the stored tags of `server_id`.
    #[must_use]
    pub fn tags(&self, server_id: &str) -> BTreeSet<String> {
        self.state()
            .servers
            .get(server_id)
            .map(|server| server.tags.clone())
            .unwrap_or_default()
    }
}

fn interface(port_id: &str, network_id: &str, ip: Ipv4Addr) -> InterfaceRecord {
    InterfaceRecord {
        port_id: port_id.to_owned(),
        network_id: network_id.to_owned(),
        mac: Some(format!("fa:16:3e:00:00:{:02x}", ip.octets()[3])),
        port_state: String::from("ACTIVE"),
        fixed_ips: vec![IpAddr::V4(ip)],
    }
}

fn lookup(catalog: &[(String, String)], name: &str) -> Vec<String> {
    catalog
        .iter()
        .filter(|(entry, _)| entry == name)
        .map(|(_, id)| id.clone())
        .collect()
}

fn observed(server: &mut FakeServer) -> ServerRecord {
    if let Some(pinned) = &server.pinned {
        let mut record = server.record.clone();
        record.status.clone_from(pinned);
        return record;
    }
    if let Some(status) = server.scripted.pop_front() {
        server.record.status = status;
    }
    server.record.clone()
}

fn apply_action(server: &mut FakeServer, action: &ServerAction) {
    let record = &mut server.record;
    match action {
        ServerAction::Stop => record.status = String::from("SHUTOFF"),
        ServerAction::Start | ServerAction::Unshelve { .. } | ServerAction::ConfirmResize => {
            record.status = String::from("ACTIVE");
        }
        ServerAction::Shelve => record.status = String::from("SHELVED_OFFLOADED"),
        ServerAction::Resize { flavor_ref } => {
            record.flavor_id = Some(flavor_ref.clone());
            record.status = String::from("VERIFY_RESIZE");
        }
        ServerAction::ChangePassword { .. } => {}
        ServerAction::AddSecurityGroup { name } => {
            if !record.security_groups.contains(name) {
                record.security_groups.push(name.clone());
            }
        }
        ServerAction::RemoveSecurityGroup { name } => {
            record.security_groups.retain(|group| group != name);
        }
    }
}

fn create(state: &mut CloudState, submission: &CreateSubmission) -> CreatedServer {
    let id = state.allocate_id();
    let request = &submission.body.server;
    let mut interfaces = Vec::new();
    let mut addresses = Vec::new();
    if let Some(NetworkSpec::Explicit(networks)) = &request.networks {
        for (position, network) in (1_u8..).zip(networks) {
            let ip = network.fixed_ip.unwrap_or(Ipv4Addr::new(10, 0, 0, position));
            let port_id = network
                .port
                .clone()
                .unwrap_or_else(|| format!("port-{id}-{position}"));
            let network_id = network.uuid.clone().unwrap_or_default();
            addresses.push(AddressRecord {
                network_name: network_id.clone(),
                addr: IpAddr::V4(ip),
                mac: None,
            });
            interfaces.push(interface(&port_id, &network_id, ip));
        }
    }

    let server = state.servers.entry(id.clone()).or_default();
    server.record = ServerRecord {
        id: id.clone(),
        name: request.name.clone(),
        status: String::from("ACTIVE"),
        availability_zone: request.availability_zone.clone(),
        image_id: request.image_ref.clone(),
        flavor_id: Some(request.flavor_ref.clone()),
        access_ip_v4: None,
        access_ip_v6: None,
        metadata: request.metadata.clone(),
        security_groups: request
            .security_groups
            .iter()
            .map(|group| group.name.clone())
            .collect(),
        addresses,
    };
    server.tags = request.tags.iter().cloned().collect();
    server.interfaces = interfaces;
    CreatedServer {
        id,
        status: Some(String::from("BUILD")),
    }
}

fn remove_server(state: &mut CloudState, server_id: &str) -> Result<(), ApiError> {
    let server = state
        .servers
        .remove(server_id)
        .ok_or_else(|| ApiError::not_found("server", server_id))?;
    for volume in server.volumes {
        state
            .volumes
            .entry(volume.volume_id)
            .or_default()
            .push_back(String::from("available"));
    }
    Ok(())
}

impl ComputeApi for ScriptedCloud {
    fn create_server<'a>(
        &'a self,
        submission: &'a CreateSubmission,
    ) -> ApiFuture<'a, CreatedServer> {
        let call = Call::CreateServer {
            endpoint: submission.endpoint,
            microversion: submission.microversion,
            body: serde_json::to_value(&submission.body).unwrap_or_default(),
        };
        self.respond(call, |state| {
            state.take_failure(&Operation::CreateServer)?;
            Ok(create(state, submission))
        })
    }

    fn get_server<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, ServerRecord> {
        self.respond(Call::GetServer(server_id.to_owned()), |state| {
            state.take_failure(&Operation::GetServer)?;
            let server = state.server_mut(server_id)?;
            Ok(observed(server))
        })
    }

    fn update_server<'a>(
        &'a self,
        server_id: &'a str,
        update: &'a ServerUpdate,
    ) -> ApiFuture<'a, ServerRecord> {
        let call = Call::UpdateServer {
            server_id: server_id.to_owned(),
            update: update.clone(),
        };
        self.respond(call, |state| {
            state.take_failure(&Operation::UpdateServer)?;
            let server = state.server_mut(server_id)?;
            if let Some(name) = &update.name {
                server.record.name.clone_from(name);
            }
            Ok(server.record.clone())
        })
    }

    fn delete_server<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, ()> {
        self.respond(Call::DeleteServer(server_id.to_owned()), |state| {
            state.take_failure(&Operation::DeleteServer)?;
            remove_server(state, server_id)
        })
    }

    fn force_delete_server<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, ()> {
        self.respond(Call::ForceDeleteServer(server_id.to_owned()), |state| {
            state.take_failure(&Operation::ForceDeleteServer)?;
            remove_server(state, server_id)
        })
    }

    fn server_action<'a>(
        &'a self,
        server_id: &'a str,
        action: &'a ServerAction,
    ) -> ApiFuture<'a, ()> {
        let call = Call::Action {
            server_id: server_id.to_owned(),
            action: action.clone(),
        };
        self.respond(call, |state| {
            state.take_failure(&Operation::Action(action.name()))?;
            let server = state.server_mut(server_id)?;
            apply_action(server, action);
            Ok(())
        })
    }

    fn update_metadata<'a>(
        &'a self,
        server_id: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> ApiFuture<'a, BTreeMap<String, String>> {
        let call = Call::UpdateMetadata {
            server_id: server_id.to_owned(),
            metadata: metadata.clone(),
        };
        self.respond(call, |state| {
            state.take_failure(&Operation::UpdateMetadata)?;
            let server = state.server_mut(server_id)?;
            server
                .record
                .metadata
                .extend(metadata.iter().map(|(key, value)| (key.clone(), value.clone())));
            Ok(server.record.metadata.clone())
        })
    }

    fn delete_metadata_key<'a>(
        &'a self,
        server_id: &'a str,
        key: &'a str,
    ) -> ApiFuture<'a, ()> {
        let call = Call::DeleteMetadataKey {
            server_id: server_id.to_owned(),
            key: key.to_owned(),
        };
        self.respond(call, |state| {
            state.take_failure(&Operation::DeleteMetadataKey)?;
            let server = state.server_mut(server_id)?;
            server
                .record
                .metadata
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| ApiError::not_found("metadata key", key))
        })
    }

    fn list_tags<'a>(
        &'a self,
        server_id: &'a str,
        _microversion: Microversion,
    ) -> ApiFuture<'a, BTreeSet<String>> {
        self.respond(Call::ListTags(server_id.to_owned()), |state| {
            Ok(state.server_mut(server_id)?.tags.clone())
        })
    }

    fn replace_tags<'a>(
        &'a self,
        server_id: &'a str,
        tags: &'a BTreeSet<String>,
        microversion: Microversion,
    ) -> ApiFuture<'a, BTreeSet<String>> {
        let call = Call::ReplaceTags {
            server_id: server_id.to_owned(),
            tags: tags.clone(),
            microversion,
        };
        self.respond(call, |state| {
            state.take_failure(&Operation::ReplaceTags)?;
            let server = state.server_mut(server_id)?;
            server.tags.clone_from(tags);
            Ok(server.tags.clone())
        })
    }

    fn list_interfaces<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, Vec<InterfaceRecord>> {
        self.respond(Call::ListInterfaces(server_id.to_owned()), |state| {
            Ok(state.server_mut(server_id)?.interfaces.clone())
        })
    }

    fn get_interface<'a>(
        &'a self,
        server_id: &'a str,
        port_id: &'a str,
    ) -> ApiFuture<'a, InterfaceRecord> {
        let call = Call::GetInterface {
            server_id: server_id.to_owned(),
            port_id: port_id.to_owned(),
        };
        self.respond(call, |state| {
            state
                .server_mut(server_id)?
                .interfaces
                .iter()
                .find(|interface| interface.port_id == port_id)
                .cloned()
                .ok_or_else(|| ApiError::not_found("interface", port_id))
        })
    }

    fn attach_interface<'a>(
        &'a self,
        server_id: &'a str,
        request: &'a InterfaceRequest,
    ) -> ApiFuture<'a, InterfaceRecord> {
        let call = Call::AttachInterface {
            server_id: server_id.to_owned(),
            request: request.clone(),
        };
        self.respond(call, |state| {
            state.take_failure(&Operation::AttachInterface)?;
            let server = state.server_mut(server_id)?;
            let position = u8::try_from(server.interfaces.len() + 100).unwrap_or(u8::MAX);
            let attached = interface(
                &request.port_id,
                "net-attached",
                Ipv4Addr::new(10, 0, 9, position),
            );
            server.interfaces.push(attached.clone());
            Ok(attached)
        })
    }

    fn detach_interface<'a>(
        &'a self,
        server_id: &'a str,
        port_id: &'a str,
    ) -> ApiFuture<'a, ()> {
        let call = Call::DetachInterface {
            server_id: server_id.to_owned(),
            port_id: port_id.to_owned(),
        };
        self.respond(call, |state| {
            state.take_failure(&Operation::DetachInterface)?;
            let server = state.server_mut(server_id)?;
            let before = server.interfaces.len();
            server
                .interfaces
                .retain(|interface| interface.port_id != port_id);
            if server.interfaces.len() == before {
                return Err(ApiError::not_found("interface", port_id));
            }
            Ok(())
        })
    }

    fn list_volume_attachments<'a>(
        &'a self,
        server_id: &'a str,
    ) -> ApiFuture<'a, Vec<VolumeAttachmentRecord>> {
        self.respond(Call::ListVolumeAttachments(server_id.to_owned()), |state| {
            state.take_failure(&Operation::ListVolumeAttachments)?;
            Ok(state.server_mut(server_id)?.volumes.clone())
        })
    }
}

impl CatalogLookup for ScriptedCloud {
    fn image_ids_by_name<'a>(&'a self, name: &'a str) -> ApiFuture<'a, Vec<String>> {
        self.respond(Call::ImageLookup(name.to_owned()), |state| {
            Ok(lookup(&state.images, name))
        })
    }

    fn flavor_ids_by_name<'a>(&'a self, name: &'a str) -> ApiFuture<'a, Vec<String>> {
        self.respond(Call::FlavorLookup(name.to_owned()), |state| {
            Ok(lookup(&state.flavors, name))
        })
    }

    fn network_ids_by_name<'a>(&'a self, name: &'a str) -> ApiFuture<'a, Vec<String>> {
        self.respond(Call::NetworkLookup(name.to_owned()), |state| {
            Ok(lookup(&state.networks, name))
        })
    }
}

impl BlockStorageApi for ScriptedCloud {
    fn volume_status<'a>(&'a self, volume_id: &'a str) -> ApiFuture<'a, String> {
        self.respond(Call::VolumeStatus(volume_id.to_owned()), |state| {
            let statuses = state
                .volumes
                .get_mut(volume_id)
                .ok_or_else(|| ApiError::not_found("volume", volume_id))?;
            let status = if statuses.len() > 1 {
                statuses.pop_front()
            } else {
                statuses.front().cloned()
            };
            status.ok_or_else(|| ApiError::not_found("volume", volume_id))
        })
    }

    fn tracks_volumes(&self) -> bool {
        !self.state().untracked_volumes
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and removes environment variables while holding a global mutex.
    ///
    /// `None` values remove the variable for the guard's lifetime.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
