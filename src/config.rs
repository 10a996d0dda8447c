//! Configuration loading via `ortho-config`, plus reading instance documents.

use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::boot::BootDefaults;
use crate::instance::InstanceConfig;
use crate::lifecycle::PollSettings;

const CONFIG_FILE: &str = "stratus.toml";
const MAX_POLL_SECS: u64 = 3600;

/// Cloud connection settings and environment-style boot defaults, merged
/// from defaults, `stratus.toml`, and `OS_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "OS",
    discovery(
        app_name = "stratus",
        env_var = "STRATUS_CONFIG_PATH",
        config_file_name = "stratus.toml",
        dotfile_name = ".stratus.toml",
        project_file_name = "stratus.toml"
    )
)]
pub struct CloudConfig {
    /// Pre-issued token sent as `X-Auth-Token`. Required.
    pub auth_token: String,
    /// Base URL of the compute API, including any project path. Required.
    pub compute_endpoint: String,
    /// Base URL of the image API; image names cannot be resolved without it.
    pub image_endpoint: Option<String>,
    /// Base URL of the network API; network names cannot be resolved without
    /// it.
    pub network_endpoint: Option<String>,
    /// Base URL of the block-storage API, used to wait for volume release.
    pub volume_endpoint: Option<String>,
    /// Default image ID for documents that name none.
    pub image_id: Option<String>,
    /// Default image name for documents that name none.
    pub image_name: Option<String>,
    /// Default flavor ID for documents that name none.
    pub flavor_id: Option<String>,
    /// Default flavor name for documents that name none.
    pub flavor_name: Option<String>,
    /// Seconds between status refreshes.
    #[ortho_config(default = 3)]
    pub poll_interval_secs: u64,
    /// Minimum seconds before the first re-poll of a wait.
    #[ortho_config(default = 10)]
    pub poll_min_delay_secs: u64,
    /// Attempts granted to the post-create build wait when it fails
    /// transiently.
    #[ortho_config(default = 3)]
    pub build_retry_attempts: u32,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE}",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl CloudConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    fn require_url(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        Self::require_field(value, metadata)?;
        if !(value.starts_with("http://") || value.starts_with("https://")) {
            return Err(ConfigError::InvalidEndpoint {
                env_var: metadata.env_var,
                value: value.to_owned(),
            });
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("stratus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is empty, an endpoint is
    /// not an HTTP(S) URL, or a poll setting is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.auth_token,
            &FieldMetadata::new("API token", "OS_AUTH_TOKEN", "auth_token"),
        )?;
        Self::require_url(
            &self.compute_endpoint,
            &FieldMetadata::new(
                "compute endpoint",
                "OS_COMPUTE_ENDPOINT",
                "compute_endpoint",
            ),
        )?;
        let optional = [
            (
                self.image_endpoint.as_deref(),
                FieldMetadata::new("image endpoint", "OS_IMAGE_ENDPOINT", "image_endpoint"),
            ),
            (
                self.network_endpoint.as_deref(),
                FieldMetadata::new(
                    "network endpoint",
                    "OS_NETWORK_ENDPOINT",
                    "network_endpoint",
                ),
            ),
            (
                self.volume_endpoint.as_deref(),
                FieldMetadata::new("volume endpoint", "OS_VOLUME_ENDPOINT", "volume_endpoint"),
            ),
        ];
        for (value, metadata) in &optional {
            if let Some(url) = value {
                Self::require_url(url, metadata)?;
            }
        }
        Self::require_range(self.poll_interval_secs, 1, "OS_POLL_INTERVAL_SECS")?;
        Self::require_range(self.poll_min_delay_secs, 0, "OS_POLL_MIN_DELAY_SECS")
    }

    fn require_range(value: u64, min: u64, env_var: &'static str) -> Result<(), ConfigError> {
        if (min..=MAX_POLL_SECS).contains(&value) {
            return Ok(());
        }
        Err(ConfigError::PollOutOfRange {
            env_var,
            value,
            min,
            max: MAX_POLL_SECS,
        })
    }

    /// Returns the boot defaults applied to documents that name no image or
    /// flavor.
    #[must_use]
    pub fn boot_defaults(&self) -> BootDefaults {
        BootDefaults {
            image_id: self.image_id.clone(),
            image_name: self.image_name.clone(),
            flavor_id: self.flavor_id.clone(),
            flavor_name: self.flavor_name.clone(),
        }
    }

    /// Returns the poll cadence for the orchestrator.
    #[must_use]
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.poll_interval_secs),
            min_delay: Duration::from_secs(self.poll_min_delay_secs),
            retry_attempts: self.build_retry_attempts,
            ..PollSettings::default()
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// An endpoint is not an HTTP(S) URL.
    #[error("{env_var} must be an http:// or https:// URL, got {value:?}")]
    InvalidEndpoint {
        /// Variable that supplies the endpoint.
        env_var: &'static str,
        /// Offending value.
        value: String,
    },
    /// A poll interval or delay lies outside the accepted range.
    #[error("{env_var} must be between {min} and {max} seconds, got {value}")]
    PollOutOfRange {
        /// Variable that supplies the setting.
        env_var: &'static str,
        /// Offending value.
        value: u64,
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Errors raised while reading an instance document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The file could not be read.
    #[error("failed to read instance document {path}: {message}")]
    Read {
        /// Document path.
        path: Utf8PathBuf,
        /// Underlying I/O failure.
        message: String,
    },
    /// The file is not a valid instance document.
    #[error("invalid instance document {path}: {source}")]
    Parse {
        /// Document path.
        path: Utf8PathBuf,
        /// Underlying parse failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Reads and parses a JSON instance document.
///
/// Only syntax and field names are checked here; semantic validation
/// happens in [`InstanceConfig::validate`].
///
/// # Errors
///
/// Returns [`DocumentError`] when the file cannot be read or parsed.
pub fn load_instance_document(path: &Utf8Path) -> Result<InstanceConfig, DocumentError> {
    let read_error = |message: String| DocumentError::Read {
        path: path.to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| read_error(String::from("path has no file name")))?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| read_error(err.to_string()))?;
    let contents = dir
        .read_to_string(file_name)
        .map_err(|err| read_error(err.to_string()))?;
    serde_json::from_str(&contents).map_err(|source| DocumentError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
