use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;

pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";

/// Prefix under which device-mapper nodes (opened encryption containers) appear.
pub const MAPPER_PREFIX: &str = "/dev/mapper/";

/// `TYPE` value blkid reports for a LUKS container.
pub const LUKS_TYPE: &str = "crypto_LUKS";

pub const DEFAULT_SNAPSHOT: &str = "latest";

/// One line of captured `blkid` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentifierRecord {
    pub device_path: String,
    pub fs_type: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    /// Every key="value" pair of the line, including the ones lifted above.
    pub attributes: BTreeMap<String, String>,
}

impl DeviceIdentifierRecord {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_encryption_container(&self) -> bool {
        self.fs_type.as_deref() == Some(LUKS_TYPE)
    }
}

/// Serialized partition table as captured by `sgdisk --backup`.
#[derive(Debug, Clone)]
pub struct PartitionTableBlob {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// Structural metadata captured at backup time, read back from the store.
#[derive(Debug, Clone)]
pub struct CapturedSnapshot {
    pub snapshot_id: String,
    pub original_disk_path: String,
    /// Older captures may not carry a size record.
    pub original_size_bytes: Option<u64>,
    pub partition_table: PartitionTableBlob,
    pub identifier_records: Vec<DeviceIdentifierRecord>,
    pub mount_table_text: String,
    pub boot_archive: Option<PathBuf>,
    pub esp_archive: Option<PathBuf>,
}

impl CapturedSnapshot {
    /// First record whose device path matches wins.
    pub fn find_record(&self, device_path: &str) -> Option<&DeviceIdentifierRecord> {
        self.identifier_records
            .iter()
            .find(|record| record.device_path == device_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Ext4,
    Btrfs,
    Xfs,
}

impl FilesystemType {
    pub const SUPPORTED: [FilesystemType; 3] =
        [FilesystemType::Ext4, FilesystemType::Btrfs, FilesystemType::Xfs];

    /// Maps a blkid `TYPE` value onto the supported set.
    pub fn from_blkid_type(value: &str) -> Option<Self> {
        match value {
            "ext4" => Some(FilesystemType::Ext4),
            "btrfs" => Some(FilesystemType::Btrfs),
            "xfs" => Some(FilesystemType::Xfs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Btrfs => "btrfs",
            FilesystemType::Xfs => "xfs",
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LuksVersion {
    Luks1,
    Luks2,
}

impl LuksVersion {
    /// blkid reports `VERSION="1"` or `VERSION="2"` for LUKS headers.
    pub fn from_record(record: &DeviceIdentifierRecord) -> Self {
        match record.attribute("VERSION") {
            Some("1") => LuksVersion::Luks1,
            _ => LuksVersion::Luks2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LuksVersion::Luks1 => "luks1",
            LuksVersion::Luks2 => "luks2",
        }
    }
}

/// Derived layout of the original disk, mapped onto the target's device nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTopology {
    pub efi_partition_path: PathBuf,
    pub root_partition_path: PathBuf,
    pub encrypted: bool,
    pub inner_filesystem_type: FilesystemType,
    pub inner_filesystem_uuid: String,
    pub inner_filesystem_label: Option<String>,
    pub encryption_container_uuid: Option<String>,
    pub encryption_container_name: Option<String>,
    pub encryption_container_version: Option<LuksVersion>,
    /// FAT volume id of the original ESP (`XXXX-XXXX`), when captured.
    pub efi_volume_id: Option<String>,
    /// ESP mount point relative to the root filesystem, e.g. `boot/efi`.
    pub esp_mount_point: PathBuf,
}

impl PartitionTopology {
    /// Device the inner filesystem lives on: the mapper node when encrypted.
    pub fn inner_device_path(&self) -> PathBuf {
        match (&self.encrypted, &self.encryption_container_name) {
            (true, Some(name)) => PathBuf::from(format!("{}{}", MAPPER_PREFIX, name)),
            _ => self.root_partition_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreTarget {
    pub device_path: PathBuf,
    pub size_bytes: u64,
}

/// Root mount plus the ESP nested beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetMountPlan {
    pub root: PathBuf,
    pub esp: PathBuf,
}

impl TargetMountPlan {
    pub fn new(root: impl AsRef<Path>, esp_relative: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let relative = esp_relative.as_ref();
        let relative = relative.strip_prefix("/").unwrap_or(relative);
        Self {
            esp: root.join(relative),
            root,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("no identifier record for {device}")]
    MissingRecord { device: String },
    #[error("identifier record for {device} has no {field}")]
    MissingField { device: String, field: &'static str },
    #[error("cannot resolve encrypted root mapper name ({})", describe_mapper_candidates(.found))]
    AmbiguousMapperName { found: Vec<String> },
    #[error("unsupported filesystem {fs_type} on {device} (supported: ext4, btrfs, xfs)")]
    UnsupportedFilesystem { device: String, fs_type: String },
}

fn describe_mapper_candidates(found: &[String]) -> String {
    if found.is_empty() {
        "no /dev/mapper source mounted at / in the mount table".to_string()
    } else {
        format!("multiple candidates: {}", found.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnsafeReason {
    NotBlockDevice,
    ConfirmationMismatch,
    ExistingPartitions { count: usize },
    TooSmall { target_bytes: u64, required_bytes: u64 },
    ProbeFailed { detail: String },
}

impl fmt::Display for UnsafeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsafeReason::NotBlockDevice => write!(f, "not a block device"),
            UnsafeReason::ConfirmationMismatch => write!(f, "confirmation did not match"),
            UnsafeReason::ExistingPartitions { count } => {
                write!(f, "target already has {} partition(s)", count)
            }
            UnsafeReason::TooSmall {
                target_bytes,
                required_bytes,
            } => write!(
                f,
                "target is {} bytes, original disk was {} bytes",
                target_bytes, required_bytes
            ),
            UnsafeReason::ProbeFailed { detail } => write!(f, "probe failed: {}", detail),
        }
    }
}

/// Terminal failures of a restore run. None of them is retried.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("metadata unavailable: {reason}")]
    MetadataUnavailable { reason: String },
    #[error("malformed metadata ({file}): {reason}")]
    MalformedMetadata { file: String, reason: String },
    #[error("unsupported topology: {0}")]
    UnsupportedTopology(#[from] TopologyError),
    #[error("unsafe target {device}: {reason}")]
    UnsafeTarget { device: String, reason: UnsafeReason },
    #[error("structure creation failed at {step}: {reason}")]
    StructureCreationFailed { step: String, reason: String },
    #[error("content restore failed: {reason}")]
    ContentRestoreFailed { reason: String },
    /// A stage ran before the one that produces its input.
    #[error("pipeline out of order: {stage} ran before {missing} was available")]
    StageOrder { stage: String, missing: String },
}

impl RestoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            RestoreError::MetadataUnavailable { .. } => "metadata_unavailable",
            RestoreError::MalformedMetadata { .. } => "malformed_metadata",
            RestoreError::UnsupportedTopology(_) => "unsupported_topology",
            RestoreError::UnsafeTarget { .. } => "unsafe_target",
            RestoreError::StructureCreationFailed { .. } => "structure_creation_failed",
            RestoreError::ContentRestoreFailed { .. } => "content_restore_failed",
            RestoreError::StageOrder { .. } => "stage_order",
        }
    }

    pub fn malformed(file: impl Into<String>, reason: impl Into<String>) -> Self {
        RestoreError::MalformedMetadata {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub fn unsafe_target(device: &Path, reason: UnsafeReason) -> Self {
        RestoreError::UnsafeTarget {
            device: device.display().to_string(),
            reason,
        }
    }

    pub fn structure(step: impl Into<String>, err: impl fmt::Display) -> Self {
        RestoreError::StructureCreationFailed {
            step: step.into(),
            reason: err.to_string(),
        }
    }

    pub fn content(err: impl fmt::Display) -> Self {
        RestoreError::ContentRestoreFailed {
            reason: err.to_string(),
        }
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
