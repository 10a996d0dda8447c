//! Binary entry point for the Stratus CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use stratus::{
    CloudConfig, ConfigError, DocumentError, InstanceConfig, InstanceOrchestrator, LifecycleError,
    NovaClient, ReadOutcome, load_instance_document,
};

mod cli;

use cli::{Cli, CreateCommand, DeleteCommand, ShowCommand, UpdateCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("instance {0} no longer exists")]
    Gone(String),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn orchestrator() -> Result<InstanceOrchestrator<NovaClient>, CliError> {
    let config = CloudConfig::load_without_cli_args()?;
    config.validate()?;
    let client = NovaClient::new(&config);
    Ok(InstanceOrchestrator::new(client, config.boot_defaults())
        .with_poll_settings(config.poll_settings()))
}

fn optional_document(path: Option<&Utf8Path>) -> Result<InstanceConfig, CliError> {
    path.map_or_else(
        || Ok(InstanceConfig::default()),
        |file| load_instance_document(file).map_err(CliError::from),
    )
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Create(command) => create(command).await,
        Cli::Show(command) => show(command).await,
        Cli::Update(command) => update(command).await,
        Cli::Delete(command) => delete(command).await,
    }
}

async fn create(command: CreateCommand) -> Result<(), CliError> {
    let document = load_instance_document(&command.file)?;
    let report = orchestrator()?.create(&document).await?;
    emit(&report.instance)
}

async fn show(command: ShowCommand) -> Result<(), CliError> {
    let document = optional_document(command.file.as_deref())?;
    match orchestrator()?.read(&command.id, &document).await? {
        ReadOutcome::Present(instance) => emit(&instance),
        ReadOutcome::Gone => Err(CliError::Gone(command.id)),
    }
}

async fn update(command: UpdateCommand) -> Result<(), CliError> {
    let old = load_instance_document(&command.old)?;
    let new = load_instance_document(&command.new)?;
    let report = orchestrator()?.update(&command.id, &old, &new).await?;
    emit(&report.instance)
}

async fn delete(command: DeleteCommand) -> Result<(), CliError> {
    let document = optional_document(command.file.as_deref())?;
    orchestrator()?.delete(&command.id, &document).await?;
    emit(&json!({ "id": command.id, "status": stratus::DELETED }))
}

fn emit(value: &impl Serialize) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    writeln!(io::stdout(), "{rendered}")?;
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
