//! Contracts for the remote collaborators the orchestrator drives.
//!
//! The orchestrator never talks HTTP directly. It consumes three narrow
//! traits: [`ComputeApi`] for the instance itself, [`CatalogLookup`] for
//! name-to-ID resolution, and [`BlockStorageApi`] for volume status. The
//! [`crate::openstack::NovaClient`] implements all three against a live
//! control plane, and [`crate::test_support::ScriptedCloud`] implements them in
//! memory for tests.

mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;

use crate::error::ApiError;
use crate::request::CreateSubmission;

pub use types::{
    AddressRecord, CreatedServer, InterfaceRecord, InterfaceRequest, ServerAction, ServerRecord,
    ServerUpdate, VolumeAttachmentRecord,
};

/// Future returned by collaborator calls.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Compute API protocol version sent alongside the calls that need one.
///
/// Passed explicitly per call rather than stored on the client so that
/// concurrent operations against different instances never observe each
/// other's protocol negotiation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Microversion(&'static str);

impl Microversion {
    /// Server tags: list and replace-all.
    pub const TAGS: Self = Self("2.26");
    /// `auto` and `none` network keywords in create requests.
    pub const AUTO_NETWORKS: Self = Self("2.37");
    /// Tags supplied in the create request body.
    pub const CREATE_WITH_TAGS: Self = Self("2.52");
    /// Unshelve into an explicit availability zone.
    pub const UNSHELVE_TO_ZONE: Self = Self("2.77");

    /// Returns the version string sent on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

/// Instance-level calls against the compute control plane.
///
/// Every mutating call returns as soon as the control plane has accepted it;
/// convergence is observed separately through [`crate::poll`].
pub trait ComputeApi: Send + Sync {
    /// Submits a create request and returns the remote-assigned ID.
    fn create_server<'a>(
        &'a self,
        submission: &'a CreateSubmission,
    ) -> ApiFuture<'a, CreatedServer>;

    /// Fetches the current server record.
    fn get_server<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, ServerRecord>;

    /// Updates directly mutable server fields.
    fn update_server<'a>(
        &'a self,
        server_id: &'a str,
        update: &'a ServerUpdate,
    ) -> ApiFuture<'a, ServerRecord>;

    /// Requests a graceful delete.
    fn delete_server<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, ()>;

    /// Requests an immediate delete that bypasses soft-delete retention.
    fn force_delete_server<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, ()>;

    /// Submits a server action such as stop, resize, or `addSecurityGroup`.
    fn server_action<'a>(
        &'a self,
        server_id: &'a str,
        action: &'a ServerAction,
    ) -> ApiFuture<'a, ()>;

    /// Upserts the given metadata keys and returns the resulting map.
    fn update_metadata<'a>(
        &'a self,
        server_id: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> ApiFuture<'a, BTreeMap<String, String>>;

    /// Deletes a single metadata key.
    fn delete_metadata_key<'a>(&'a self, server_id: &'a str, key: &'a str)
    -> ApiFuture<'a, ()>;

    /// Lists server tags.
    fn list_tags<'a>(
        &'a self,
        server_id: &'a str,
        microversion: Microversion,
    ) -> ApiFuture<'a, BTreeSet<String>>;

    /// Replaces the full tag set.
    fn replace_tags<'a>(
        &'a self,
        server_id: &'a str,
        tags: &'a BTreeSet<String>,
        microversion: Microversion,
    ) -> ApiFuture<'a, BTreeSet<String>>;

    /// Lists attached network interfaces.
    fn list_interfaces<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, Vec<InterfaceRecord>>;

    /// Fetches a single attached interface by port ID.
    fn get_interface<'a>(
        &'a self,
        server_id: &'a str,
        port_id: &'a str,
    ) -> ApiFuture<'a, InterfaceRecord>;

    /// Attaches a network interface.
    fn attach_interface<'a>(
        &'a self,
        server_id: &'a str,
        request: &'a InterfaceRequest,
    ) -> ApiFuture<'a, InterfaceRecord>;

    /// Requests detachment of the interface bound to `port_id`.
    fn detach_interface<'a>(&'a self, server_id: &'a str, port_id: &'a str)
    -> ApiFuture<'a, ()>;

    /// Lists attached volumes.
    fn list_volume_attachments<'a>(
        &'a self,
        server_id: &'a str,
    ) -> ApiFuture<'a, Vec<VolumeAttachmentRecord>>;
}

/// Name-to-ID resolution used by the boot source resolver.
pub trait CatalogLookup: Send + Sync {
    /// Returns the IDs of every image carrying `name`.
    fn image_ids_by_name<'a>(&'a self, name: &'a str) -> ApiFuture<'a, Vec<String>>;

    /// Returns the IDs of every flavor carrying `name`.
    fn flavor_ids_by_name<'a>(&'a self, name: &'a str) -> ApiFuture<'a, Vec<String>>;

    /// Returns the IDs of every network carrying `name`.
    fn network_ids_by_name<'a>(&'a self, name: &'a str) -> ApiFuture<'a, Vec<String>>;
}

/// Block-storage calls consumed by the deletion path.
pub trait BlockStorageApi: Send + Sync {
    /// Returns the volume's current status string (for example `in-use`).
    fn volume_status<'a>(&'a self, volume_id: &'a str) -> ApiFuture<'a, String>;

    /// Returns `false` when volume status cannot be queried at all; volume
    /// release waits are skipped then.
    fn tracks_volumes(&self) -> bool {
        true
    }
}

/// Everything the orchestrator needs from the remote side.
pub trait Cloud: ComputeApi + CatalogLookup + BlockStorageApi {}

impl<T> Cloud for T where T: ComputeApi + CatalogLookup + BlockStorageApi {}
