//! Boot source resolution: which image and flavor a new instance uses.
//!
//! Both resolvers walk the same priority chain: an explicit ID in the
//! instance document, then the environment-style default ID, then a name
//! lookup (the document's name, falling back to the default name). A
//! configured block-device list that never boots an image onto local disk
//! removes the need for an image altogether.

use thiserror::Error;

use crate::block_device::needs_image;
use crate::compute::CatalogLookup;
use crate::error::ApiError;
use crate::instance::InstanceConfig;

/// Environment-style defaults consulted when the document leaves a boot
/// reference unset (`OS_IMAGE_ID`, `OS_IMAGE_NAME`, `OS_FLAVOR_ID`,
/// `OS_FLAVOR_NAME`).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BootDefaults {
    /// Default image ID.
    pub image_id: Option<String>,
    /// Default image name.
    pub image_name: Option<String>,
    /// Default flavor ID.
    pub flavor_id: Option<String>,
    /// Default flavor name.
    pub flavor_name: Option<String>,
}

/// Catalog entries resolved by name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CatalogKind {
    /// Boot images.
    Image,
    /// Compute flavors.
    Flavor,
    /// Networks.
    Network,
}

impl CatalogKind {
    /// Returns the lowercase kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Flavor => "flavor",
            Self::Network => "network",
        }
    }
}

impl std::fmt::Display for CatalogKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Fatal configuration errors raised while resolving boot references.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BootSourceError {
    /// No image source could be determined and one is required.
    #[error("neither a boot device, image ID, or image name could be determined")]
    ImageUnresolved,
    /// No flavor source could be determined.
    #[error("neither a flavor ID or flavor name could be determined")]
    FlavorUnresolved,
    /// A name lookup returned no match.
    #[error("no {kind} found with name {name:?}")]
    NotFound {
        /// Catalog that was searched.
        kind: CatalogKind,
        /// Name that was looked up.
        name: String,
    },
    /// A name lookup matched more than one entry.
    #[error("{count} {kind}s found with name {name:?}; use an ID instead")]
    Ambiguous {
        /// Catalog that was searched.
        kind: CatalogKind,
        /// Name that was looked up.
        name: String,
        /// Number of matches.
        count: usize,
    },
    /// The lookup call itself failed.
    #[error("{kind} lookup for {name:?} failed: {source}")]
    Lookup {
        /// Catalog that was searched.
        kind: CatalogKind,
        /// Name that was looked up.
        name: String,
        /// Underlying error.
        #[source]
        source: ApiError,
    },
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|value| !value.trim().is_empty())
}

/// Resolves the image reference for a create request.
///
/// Returns `Ok(None)` when block devices are configured and none of them
/// boots an image onto local disk.
///
/// # Errors
///
/// Returns [`BootSourceError`] when no source yields an image, or when a name
/// lookup fails or is ambiguous.
pub async fn resolve_image<L>(
    config: &InstanceConfig,
    defaults: &BootDefaults,
    catalog: &L,
) -> Result<Option<String>, BootSourceError>
where
    L: CatalogLookup + ?Sized,
{
    if !config.block_devices.is_empty() && !needs_image(&config.block_devices) {
        return Ok(None);
    }

    if let Some(id) = non_empty(config.image_id.as_ref()) {
        return Ok(Some(id.to_owned()));
    }
    if let Some(id) = non_empty(defaults.image_id.as_ref()) {
        return Ok(Some(id.to_owned()));
    }

    let name = non_empty(config.image_name.as_ref())
        .or_else(|| non_empty(defaults.image_name.as_ref()))
        .ok_or(BootSourceError::ImageUnresolved)?;
    let ids = catalog.image_ids_by_name(name).await;
    single_match(CatalogKind::Image, name, ids).map(Some)
}

/// Resolves the flavor reference for a create or resize request.
///
/// # Errors
///
/// Returns [`BootSourceError`] when no source yields a flavor, or when a name
/// lookup fails or is ambiguous.
pub async fn resolve_flavor<L>(
    config: &InstanceConfig,
    defaults: &BootDefaults,
    catalog: &L,
) -> Result<String, BootSourceError>
where
    L: CatalogLookup + ?Sized,
{
    if let Some(id) = non_empty(config.flavor_id.as_ref()) {
        return Ok(id.to_owned());
    }
    if let Some(id) = non_empty(defaults.flavor_id.as_ref()) {
        return Ok(id.to_owned());
    }

    let name = non_empty(config.flavor_name.as_ref())
        .or_else(|| non_empty(defaults.flavor_name.as_ref()))
        .ok_or(BootSourceError::FlavorUnresolved)?;
    let ids = catalog.flavor_ids_by_name(name).await;
    single_match(CatalogKind::Flavor, name, ids)
}

/// Resolves a network name to its ID.
///
/// # Errors
///
/// Returns [`BootSourceError`] when the name matches zero or several
/// networks, or the lookup fails.
pub async fn resolve_network<L>(name: &str, catalog: &L) -> Result<String, BootSourceError>
where
    L: CatalogLookup + ?Sized,
{
    let ids = catalog.network_ids_by_name(name).await;
    single_match(CatalogKind::Network, name, ids)
}

fn single_match(
    kind: CatalogKind,
    name: &str,
    lookup: Result<Vec<String>, ApiError>,
) -> Result<String, BootSourceError> {
    let mut ids = lookup.map_err(|source| BootSourceError::Lookup {
        kind,
        name: name.to_owned(),
        source,
    })?;
    match ids.len() {
        0 => Err(BootSourceError::NotFound {
            kind,
            name: name.to_owned(),
        }),
        1 => Ok(ids.remove(0)),
        count => Err(BootSourceError::Ambiguous {
            kind,
            name: name.to_owned(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::block_device::{BlockDeviceConfig, DestinationType, SourceType};
    use crate::test_support::ScriptedCloud;

    #[fixture]
    fn catalog() -> ScriptedCloud {
        let cloud = ScriptedCloud::new();
        cloud.add_image("ubuntu", "img-by-name");
        cloud.add_image("ubuntu-env", "img-env-name");
        cloud.add_flavor("m1.small", "flv-by-name");
        cloud.add_flavor("m1.env", "flv-env-name");
        cloud
    }

    fn all_defaults() -> BootDefaults {
        BootDefaults {
            image_id: Some(String::from("img-env")),
            image_name: Some(String::from("ubuntu-env")),
            flavor_id: Some(String::from("flv-env")),
            flavor_name: Some(String::from("m1.env")),
        }
    }

    fn volume_device(source_type: SourceType, destination_type: DestinationType) -> BlockDeviceConfig {
        BlockDeviceConfig {
            uuid: Some(String::from("vol-1")),
            boot_index: Some(0),
            ..BlockDeviceConfig::new(source_type, destination_type)
        }
    }

    #[rstest]
    #[case::explicit_wins(Some("img-1"), Some("ubuntu"), all_defaults(), Some("img-1"))]
    #[case::env_id_beats_name(None, Some("ubuntu"), all_defaults(), Some("img-env"))]
    #[case::document_name(None, Some("ubuntu"), BootDefaults::default(), Some("img-by-name"))]
    #[case::env_name_fallback(
        None,
        None,
        BootDefaults { image_name: Some(String::from("ubuntu-env")), ..BootDefaults::default() },
        Some("img-env-name")
    )]
    #[case::blank_id_ignored(Some("  "), Some("ubuntu"), BootDefaults::default(), Some("img-by-name"))]
    #[tokio::test]
    async fn image_priority_chain(
        catalog: ScriptedCloud,
        #[case] image_id: Option<&str>,
        #[case] image_name: Option<&str>,
        #[case] defaults: BootDefaults,
        #[case] expected: Option<&str>,
    ) {
        let config = InstanceConfig {
            image_id: image_id.map(str::to_owned),
            image_name: image_name.map(str::to_owned),
            ..InstanceConfig::named("vm")
        };

        let resolved = resolve_image(&config, &defaults, &catalog)
            .await
            .unwrap_or_else(|err| panic!("image should resolve: {err}"));

        assert_eq!(resolved.as_deref(), expected);
    }

    #[rstest]
    #[case::explicit_wins(Some("flv-1"), Some("m1.small"), all_defaults(), "flv-1")]
    #[case::env_id_beats_name(None, Some("m1.small"), all_defaults(), "flv-env")]
    #[case::document_name(None, Some("m1.small"), BootDefaults::default(), "flv-by-name")]
    #[case::env_name_fallback(
        None,
        None,
        BootDefaults { flavor_name: Some(String::from("m1.env")), ..BootDefaults::default() },
        "flv-env-name"
    )]
    #[tokio::test]
    async fn flavor_priority_chain(
        catalog: ScriptedCloud,
        #[case] flavor_id: Option<&str>,
        #[case] flavor_name: Option<&str>,
        #[case] defaults: BootDefaults,
        #[case] expected: &str,
    ) {
        let config = InstanceConfig {
            flavor_id: flavor_id.map(str::to_owned),
            flavor_name: flavor_name.map(str::to_owned),
            ..InstanceConfig::named("vm")
        };

        let resolved = resolve_flavor(&config, &defaults, &catalog)
            .await
            .unwrap_or_else(|err| panic!("flavor should resolve: {err}"));

        assert_eq!(resolved, expected);
    }

    #[rstest]
    #[tokio::test]
    async fn volume_boot_needs_no_image(catalog: ScriptedCloud) {
        let config = InstanceConfig {
            image_name: Some(String::from("missing")),
            block_devices: vec![volume_device(SourceType::Volume, DestinationType::Volume)],
            ..InstanceConfig::named("vm")
        };

        let resolved = resolve_image(&config, &all_defaults(), &catalog).await;

        assert_eq!(resolved, Ok(None));
        assert!(catalog.calls().is_empty(), "no lookup should be issued");
    }

    #[rstest]
    #[tokio::test]
    async fn image_to_local_block_device_still_needs_image(catalog: ScriptedCloud) {
        let config = InstanceConfig {
            block_devices: vec![volume_device(SourceType::Image, DestinationType::Local)],
            ..InstanceConfig::named("vm")
        };

        let resolved = resolve_image(&config, &BootDefaults::default(), &catalog).await;

        assert_eq!(resolved, Err(BootSourceError::ImageUnresolved));
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_names_are_fatal(catalog: ScriptedCloud) {
        let config = InstanceConfig {
            image_name: Some(String::from("nope")),
            flavor_name: Some(String::from("nope")),
            ..InstanceConfig::named("vm")
        };
        let defaults = BootDefaults::default();

        let image = resolve_image(&config, &defaults, &catalog).await;
        let flavor = resolve_flavor(&config, &defaults, &catalog).await;

        assert!(matches!(
            image,
            Err(BootSourceError::NotFound { kind: CatalogKind::Image, .. })
        ));
        assert!(matches!(
            flavor,
            Err(BootSourceError::NotFound { kind: CatalogKind::Flavor, .. })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn duplicate_names_are_ambiguous(catalog: ScriptedCloud) {
        catalog.add_flavor("m1.small", "flv-other");
        let config = InstanceConfig {
            flavor_name: Some(String::from("m1.small")),
            ..InstanceConfig::named("vm")
        };

        let flavor = resolve_flavor(&config, &BootDefaults::default(), &catalog).await;

        assert!(matches!(
            flavor,
            Err(BootSourceError::Ambiguous { count: 2, .. })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn missing_flavor_is_unresolved(catalog: ScriptedCloud) {
        let flavor =
            resolve_flavor(&InstanceConfig::named("vm"), &BootDefaults::default(), &catalog).await;

        assert_eq!(flavor, Err(BootSourceError::FlavorUnresolved));
    }
}
