//! Infers the original disk's partition, encryption and filesystem layout from
//! captured identifier records and maps it onto the target's device nodes.

pub mod fstab;
pub mod naming;
pub mod records;

use reforge_core::{
    CapturedSnapshot, DeviceIdentifierRecord, FilesystemType, LuksVersion, PartitionTopology,
    TopologyError, MAPPER_PREFIX,
};
use std::path::Path;
use tracing::{debug, info};

pub use fstab::{esp_mount_point, parse_mount_table, resolve_mapper_name, MountEntry};
pub use naming::{
    partition_path, partition_path_for, NamingScheme, PartitionPaths, EFI_PARTITION_NUMBER,
    ROOT_PARTITION_NUMBER,
};
pub use records::{parse_identifier_records, RecordParseError};

pub fn infer_topology(
    snapshot: &CapturedSnapshot,
    target: &PartitionPaths,
) -> Result<PartitionTopology, TopologyError> {
    let original_disk = Path::new(&snapshot.original_disk_path);
    let original = PartitionPaths::for_disk(original_disk);
    let original_root = original.root.display().to_string();

    let root_record = snapshot
        .find_record(&original_root)
        .ok_or_else(|| TopologyError::MissingRecord {
            device: original_root.clone(),
        })?;
    let mount_entries = parse_mount_table(&snapshot.mount_table_text);

    let (inner_record, encryption) = if root_record.is_encryption_container() {
        let container_uuid = root_record.uuid.clone();
        let name = resolve_mapper_name(&mount_entries)?;
        let mapped_path = format!("{}{}", MAPPER_PREFIX, name);
        debug!(
            "root {} is a LUKS container mapped as {}",
            original_root, mapped_path
        );
        let inner = snapshot
            .find_record(&mapped_path)
            .ok_or(TopologyError::MissingRecord {
                device: mapped_path,
            })?;
        let encryption = Encryption {
            name,
            uuid: container_uuid,
            version: LuksVersion::from_record(root_record),
        };
        (inner, Some(encryption))
    } else {
        (root_record, None)
    };

    let inner_filesystem_type = supported_type(inner_record)?;
    let inner_filesystem_uuid = inner_record
        .uuid
        .clone()
        .ok_or_else(|| TopologyError::MissingField {
            device: inner_record.device_path.clone(),
            field: "UUID",
        })?;

    let efi_volume_id = snapshot
        .find_record(&original.efi.display().to_string())
        .filter(|record| record.fs_type.as_deref() == Some("vfat"))
        .and_then(|record| record.uuid.clone())
        .filter(|uuid| is_fat_volume_id(uuid));

    let topology = PartitionTopology {
        efi_partition_path: target.efi.clone(),
        root_partition_path: target.root.clone(),
        encrypted: encryption.is_some(),
        inner_filesystem_type,
        inner_filesystem_uuid,
        inner_filesystem_label: inner_record.label.clone(),
        encryption_container_uuid: encryption.as_ref().and_then(|enc| enc.uuid.clone()),
        encryption_container_version: encryption.as_ref().map(|enc| enc.version),
        encryption_container_name: encryption.map(|enc| enc.name),
        efi_volume_id,
        esp_mount_point: esp_mount_point(&mount_entries),
    };

    info!(
        "topology: root {} ({}, uuid {}){}",
        topology.root_partition_path.display(),
        topology.inner_filesystem_type,
        topology.inner_filesystem_uuid,
        match &topology.encryption_container_name {
            Some(name) => format!(" inside LUKS container {}", name),
            None => String::new(),
        }
    );
    Ok(topology)
}

struct Encryption {
    name: String,
    uuid: Option<String>,
    version: LuksVersion,
}

fn supported_type(record: &DeviceIdentifierRecord) -> Result<FilesystemType, TopologyError> {
    let fs_type = record
        .fs_type
        .as_deref()
        .ok_or_else(|| TopologyError::MissingField {
            device: record.device_path.clone(),
            field: "TYPE",
        })?;
    FilesystemType::from_blkid_type(fs_type).ok_or_else(|| TopologyError::UnsupportedFilesystem {
        device: record.device_path.clone(),
        fs_type: fs_type.to_string(),
    })
}

/// `XXXX-XXXX` hex, the form blkid uses for FAT serial numbers.
fn is_fat_volume_id(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 9
        && bytes[4] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(idx, b)| idx == 4 || b.is_ascii_hexdigit())
}
