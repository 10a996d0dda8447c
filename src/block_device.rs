//! Block device validation.
//!
//! Turns the configured block-device list into the wire-form mappings sent
//! with a boot-from-volume request. Every fatal problem is collected before
//! returning so operators see all of them at once; soft inconsistencies are
//! reported as warnings alongside either outcome.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a block device's content comes from.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// An empty disk.
    Blank,
    /// A boot image.
    Image,
    /// An existing volume.
    Volume,
    /// A volume snapshot.
    Snapshot,
}

impl SourceType {
    /// Returns the lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blank => "blank",
            Self::Image => "image",
            Self::Volume => "volume",
            Self::Snapshot => "snapshot",
        }
    }

    /// Returns the delete-on-termination value expected for this source.
    ///
    /// Devices created for the instance (blank, image, snapshot) should go
    /// away with it; pre-existing volumes should survive it.
    #[must_use]
    pub const fn expected_delete_on_termination(self) -> bool {
        !matches!(self, Self::Volume)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Where a block device is materialised.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    /// Ephemeral disk on the hypervisor.
    #[default]
    Local,
    /// Block-storage volume.
    Volume,
}

/// One configured block device.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct BlockDeviceConfig {
    /// Content source.
    pub source_type: SourceType,
    /// Materialisation target.
    #[serde(default)]
    pub destination_type: DestinationType,
    /// Source identifier; required for every source except `blank`.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Size in GiB; zero means unset.
    #[serde(default)]
    pub volume_size: u32,
    /// Boot order; `0` marks the boot device.
    #[serde(default)]
    pub boot_index: Option<i32>,
    /// Whether the device is removed together with the instance.
    #[serde(default)]
    pub delete_on_termination: bool,
    /// Filesystem to format a blank device with.
    #[serde(default)]
    pub guest_format: Option<String>,
    /// Block-storage volume type.
    #[serde(default)]
    pub volume_type: Option<String>,
    /// Guest device type (for example `disk` or `cdrom`).
    #[serde(default)]
    pub device_type: Option<String>,
    /// Guest bus (for example `virtio` or `scsi`).
    #[serde(default)]
    pub disk_bus: Option<String>,
}

impl BlockDeviceConfig {
    /// Creates an entry with every optional field unset.
    #[must_use]
    pub const fn new(source_type: SourceType, destination_type: DestinationType) -> Self {
        Self {
            source_type,
            destination_type,
            uuid: None,
            volume_size: 0,
            boot_index: None,
            delete_on_termination: false,
            guest_format: None,
            volume_type: None,
            device_type: None,
            disk_bus: None,
        }
    }

    fn boots_image_locally(&self) -> bool {
        self.source_type == SourceType::Image && self.destination_type == DestinationType::Local
    }
}

/// Validated block device in the form sent to the control plane.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BlockDeviceMapping {
    /// Content source.
    pub source_type: SourceType,
    /// Materialisation target.
    pub destination_type: DestinationType,
    /// Source identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Size in GiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<u32>,
    /// Boot order; `-1` marks a non-bootable device.
    pub boot_index: i32,
    /// Whether the device is removed together with the instance.
    pub delete_on_termination: bool,
    /// Filesystem to format a blank device with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_format: Option<String>,
    /// Block-storage volume type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    /// Guest device type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Guest bus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_bus: Option<String>,
}

/// Boot index sent for devices that are not bootable.
pub const NON_BOOTABLE: i32 = -1;

/// Fatal block-device configuration problems.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BlockDeviceError {
    /// A non-blank device has no source UUID.
    #[error("block_devices[{index}]: a uuid must be provided for source_type {source_type}")]
    MissingUuid {
        /// Position of the device in the list.
        index: usize,
        /// Source type of the device.
        source_type: SourceType,
    },
    /// An image copied to a volume needs an explicit size.
    #[error(
        "block_devices[{index}]: volume_size must be set when source_type is image and \
         destination_type is volume"
    )]
    MissingImageVolumeSize {
        /// Position of the device in the list.
        index: usize,
    },
    /// A blank ephemeral disk needs an explicit size.
    #[error(
        "block_devices[{index}]: volume_size must be set when source_type is blank and \
         destination_type is local"
    )]
    MissingBlankLocalSize {
        /// Position of the device in the list.
        index: usize,
    },
    /// Several devices and none marked as the boot device.
    #[error("you must set boot_index to 0 for one of block_devices")]
    NoBootDevice,
    /// Several devices claim to be the boot device.
    #[error("boot_index 0 may only be set on one of block_devices ({count} found)")]
    MultipleBootDevices {
        /// Number of devices pinned to boot index 0.
        count: usize,
    },
}

/// Soft inconsistency reported without failing validation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockDeviceWarning {
    /// Position of the device in the list.
    pub index: usize,
    /// Source type of the device.
    pub source_type: SourceType,
    /// Configured delete-on-termination value.
    pub delete_on_termination: bool,
}

impl fmt::Display for BlockDeviceWarning {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "block_devices[{}]: delete_on_termination is {} for source_type {}; expected {}",
            self.index,
            self.delete_on_termination,
            self.source_type,
            self.source_type.expected_delete_on_termination(),
        )
    }
}

/// Successful validation result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidatedBlockDevices {
    /// Mappings in configured order, boot indexes defaulted.
    pub devices: Vec<BlockDeviceMapping>,
    /// Soft inconsistencies.
    pub warnings: Vec<BlockDeviceWarning>,
}

/// Failed validation result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockDeviceErrors {
    /// Every fatal problem found.
    pub errors: Vec<BlockDeviceError>,
    /// Soft inconsistencies found along the way.
    pub warnings: Vec<BlockDeviceWarning>,
}

/// Returns `true` when any device boots an image onto local disk, which is
/// the only layout that still needs an image reference on the request.
#[must_use]
pub fn needs_image(devices: &[BlockDeviceConfig]) -> bool {
    devices.iter().any(BlockDeviceConfig::boots_image_locally)
}

/// Validates and defaults the configured block devices.
///
/// # Errors
///
/// Returns [`BlockDeviceErrors`] carrying every fatal problem when any check
/// fails.
pub fn validate_block_devices(
    devices: &[BlockDeviceConfig],
) -> Result<ValidatedBlockDevices, BlockDeviceErrors> {
    let mut errors = Vec::new();

    for (index, device) in devices.iter().enumerate() {
        let has_uuid = device
            .uuid
            .as_deref()
            .is_some_and(|uuid| !uuid.trim().is_empty());
        if device.source_type != SourceType::Blank && !has_uuid {
            errors.push(BlockDeviceError::MissingUuid {
                index,
                source_type: device.source_type,
            });
        }
        if device.source_type == SourceType::Image
            && device.destination_type == DestinationType::Volume
            && device.volume_size == 0
        {
            errors.push(BlockDeviceError::MissingImageVolumeSize { index });
        }
        if device.source_type == SourceType::Blank
            && device.destination_type == DestinationType::Local
            && device.volume_size == 0
        {
            errors.push(BlockDeviceError::MissingBlankLocalSize { index });
        }
    }

    if devices.len() > 1 {
        let pinned = devices
            .iter()
            .filter(|device| device.boot_index == Some(0))
            .count();
        match pinned {
            0 => errors.push(BlockDeviceError::NoBootDevice),
            1 => {}
            count => errors.push(BlockDeviceError::MultipleBootDevices { count }),
        }
    }

    let warnings = devices
        .iter()
        .enumerate()
        .filter(|(_, device)| {
            device.delete_on_termination != device.source_type.expected_delete_on_termination()
        })
        .map(|(index, device)| BlockDeviceWarning {
            index,
            source_type: device.source_type,
            delete_on_termination: device.delete_on_termination,
        })
        .collect();

    if !errors.is_empty() {
        return Err(BlockDeviceErrors { errors, warnings });
    }

    let single = devices.len() == 1;
    let mapped = devices
        .iter()
        .map(|device| to_mapping(device, single))
        .collect();
    Ok(ValidatedBlockDevices {
        devices: mapped,
        warnings,
    })
}

fn to_mapping(device: &BlockDeviceConfig, single: bool) -> BlockDeviceMapping {
    let boot_index = if single {
        0
    } else {
        device.boot_index.unwrap_or(NON_BOOTABLE)
    };
    BlockDeviceMapping {
        source_type: device.source_type,
        destination_type: device.destination_type,
        uuid: device.uuid.clone().filter(|uuid| !uuid.trim().is_empty()),
        volume_size: (device.volume_size > 0).then_some(device.volume_size),
        boot_index,
        delete_on_termination: device.delete_on_termination,
        guest_format: device.guest_format.clone(),
        volume_type: device.volume_type.clone(),
        device_type: device.device_type.clone(),
        disk_bus: device.disk_bus.clone(),
    }
}
