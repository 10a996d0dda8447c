//! Command-line interface definitions for the `stratus` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use camino::Utf8PathBuf;
use clap::Parser;

/// Top-level CLI for the `stratus` binary.
#[derive(Debug, Parser)]
#[command(
    name = "stratus",
    about = "Drive compute instances to the state described by a JSON document",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create an instance and wait until it reaches its power state.
    #[command(name = "create", about = "Create an instance from a document")]
    Create(CreateCommand),
    /// Read the current state of an instance.
    #[command(name = "show", about = "Show the observed state of an instance")]
    Show(ShowCommand),
    /// Reconcile an instance from one document to another.
    #[command(name = "update", about = "Reconcile an instance towards a new document")]
    Update(UpdateCommand),
    /// Delete an instance and wait until it is gone.
    #[command(name = "delete", about = "Delete an instance")]
    Delete(DeleteCommand),
}

/// Arguments for `stratus create`.
#[derive(Debug, Parser)]
pub(crate) struct CreateCommand {
    /// Instance document (JSON).
    #[arg(long, short = 'f', value_name = "PATH")]
    pub(crate) file: Utf8PathBuf,
}

/// Arguments for `stratus show`.
#[derive(Debug, Parser)]
pub(crate) struct ShowCommand {
    /// Instance ID.
    pub(crate) id: String,
    /// Document the instance was created from; supplies the access-network
    /// flags used to pick the access address.
    #[arg(long, short = 'f', value_name = "PATH")]
    pub(crate) file: Option<Utf8PathBuf>,
}

/// Arguments for `stratus update`.
#[derive(Debug, Parser)]
pub(crate) struct UpdateCommand {
    /// Instance ID.
    pub(crate) id: String,
    /// Document the instance currently reflects.
    #[arg(long, value_name = "PATH")]
    pub(crate) old: Utf8PathBuf,
    /// Document to reconcile towards.
    #[arg(long, value_name = "PATH")]
    pub(crate) new: Utf8PathBuf,
}

/// Arguments for `stratus delete`.
#[derive(Debug, Parser)]
pub(crate) struct DeleteCommand {
    /// Instance ID.
    pub(crate) id: String,
    /// Document carrying the delete options (stop first, force, detach
    /// ports, timeout).
    #[arg(long, short = 'f', value_name = "PATH")]
    pub(crate) file: Option<Utf8PathBuf>,
}
