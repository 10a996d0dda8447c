//! Core library for the Stratus instance lifecycle orchestrator.
//!
//! Stratus drives one compute instance at a time to the state described by a
//! declarative document. The control plane is asynchronous: every mutation
//! returns as soon as it is accepted, so each one is followed by a bounded
//! wait on the instance's reported status. The crate exposes the document
//! model ([`InstanceConfig`]), the orchestrator ([`InstanceOrchestrator`]),
//! the collaborator traits it drives ([`ComputeApi`], [`CatalogLookup`],
//! [`BlockStorageApi`]), and an HTTP implementation of them
//! ([`NovaClient`]).

pub mod block_device;
pub mod boot;
pub mod compute;
pub mod config;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod openstack;
pub mod poll;
pub mod request;
pub mod test_support;

pub use block_device::{
    BlockDeviceConfig, BlockDeviceError, BlockDeviceMapping, BlockDeviceWarning, DestinationType,
    SourceType,
};
pub use boot::{BootDefaults, BootSourceError};
pub use compute::{BlockStorageApi, CatalogLookup, Cloud, ComputeApi, Microversion};
pub use config::{CloudConfig, ConfigError, DocumentError, load_instance_document};
pub use error::{ApiError, LifecycleError, Step};
pub use instance::{
    DesiredPowerState, Instance, InstanceConfig, NetworkAttachment, NetworkConfig, NetworkMode,
    Password, PowerState, ValidationError, ValidationErrors,
};
pub use lifecycle::{DELETED, InstanceOrchestrator, InstanceReport, PollSettings, ReadOutcome};
pub use openstack::NovaClient;
pub use poll::{StateChange, StatusRefresh, WaitError};
