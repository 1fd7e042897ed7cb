//! Reads the structural metadata captured at backup time.

use crate::store::{SnapshotStore, StoreError};
use reforge_core::{CapturedSnapshot, PartitionTableBlob, RestoreError};
use reforge_topology::parse_identifier_records;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Where the capture phase stores metadata inside each snapshot.
pub const DEFAULT_METADATA_PATH: &str = "/var/lib/reforge/metadata";

pub const DISK_FILE: &str = "disk";
pub const DISK_SIZE_FILE: &str = "disk-size";
pub const PARTITION_TABLE_FILE: &str = "gpt.bin";
pub const IDENTIFIERS_FILE: &str = "blkid.txt";
pub const MOUNT_TABLE_FILE: &str = "fstab";
pub const BOOT_ARCHIVES: [&str; 2] = ["boot.tar", "boot.tar.zst"];
pub const ESP_ARCHIVES: [&str; 2] = ["esp.tar", "esp.tar.zst"];

/// Wipes `staging`, restores only the metadata subtree into it and loads it.
pub fn fetch_captured_snapshot(
    store: &dyn SnapshotStore,
    snapshot: &str,
    metadata_path: &Path,
    staging: &Path,
) -> Result<CapturedSnapshot, RestoreError> {
    reset_staging(staging)?;

    store
        .restore(snapshot, staging, Some(metadata_path))
        .map_err(|err| RestoreError::MetadataUnavailable {
            reason: match err {
                StoreError::NotFound { .. } | StoreError::AuthFailed { .. } => err.to_string(),
                StoreError::Failed { .. } => format!("metadata restore: {}", err),
            },
        })?;

    let relative = metadata_path.strip_prefix("/").unwrap_or(metadata_path);
    let dir = staging.join(relative);
    if !dir.is_dir() {
        return Err(RestoreError::MetadataUnavailable {
            reason: format!(
                "snapshot {} has no metadata subtree at {}",
                snapshot,
                metadata_path.display()
            ),
        });
    }
    load_captured_snapshot(&dir, snapshot)
}

fn reset_staging(staging: &Path) -> Result<(), RestoreError> {
    let unavailable = |action: &str, err: std::io::Error| RestoreError::MetadataUnavailable {
        reason: format!("{} staging {}: {}", action, staging.display(), err),
    };
    match fs::remove_dir_all(staging) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(unavailable("wipe", err)),
    }
    fs::create_dir_all(staging).map_err(|err| unavailable("create", err))
}

/// Loads a metadata directory that is already on local disk.
pub fn load_captured_snapshot(
    dir: &Path,
    snapshot_id: &str,
) -> Result<CapturedSnapshot, RestoreError> {
    let disk_text = read_required_text(dir, DISK_FILE)?;
    let original_disk_path = disk_text.trim().to_string();
    if !original_disk_path.starts_with("/dev/") {
        return Err(RestoreError::malformed(
            DISK_FILE,
            format!("expected a /dev path, found {:?}", original_disk_path),
        ));
    }

    let original_size_bytes = read_size(dir)?;

    let table_path = dir.join(PARTITION_TABLE_FILE);
    let table_bytes = read_required(dir, PARTITION_TABLE_FILE)?;
    if table_bytes.is_empty() {
        return Err(RestoreError::malformed(PARTITION_TABLE_FILE, "partition table blob is empty"));
    }

    let records_text = read_required_text(dir, IDENTIFIERS_FILE)?;
    let identifier_records = parse_identifier_records(&records_text)
        .map_err(|err| RestoreError::malformed(IDENTIFIERS_FILE, err.to_string()))?;
    if identifier_records.is_empty() {
        return Err(RestoreError::malformed(IDENTIFIERS_FILE, "no identifier records"));
    }

    let mount_table_text = match fs::read_to_string(dir.join(MOUNT_TABLE_FILE)) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("metadata has no {}; encrypted roots cannot be resolved", MOUNT_TABLE_FILE);
            String::new()
        }
        Err(err) => return Err(RestoreError::malformed(MOUNT_TABLE_FILE, err.to_string())),
    };

    let snapshot = CapturedSnapshot {
        snapshot_id: snapshot_id.to_string(),
        original_disk_path,
        original_size_bytes,
        partition_table: PartitionTableBlob {
            path: table_path,
            bytes: table_bytes,
        },
        identifier_records,
        mount_table_text,
        boot_archive: first_existing(dir, &BOOT_ARCHIVES),
        esp_archive: first_existing(dir, &ESP_ARCHIVES),
    };

    info!(
        "captured disk {} ({}), {} identifier records, boot archive: {}, esp archive: {}",
        snapshot.original_disk_path,
        snapshot
            .original_size_bytes
            .map(|size| format!("{} bytes", size))
            .unwrap_or_else(|| "size unknown".to_string()),
        snapshot.identifier_records.len(),
        snapshot.boot_archive.is_some(),
        snapshot.esp_archive.is_some()
    );
    Ok(snapshot)
}

fn read_size(dir: &Path) -> Result<Option<u64>, RestoreError> {
    let text = match fs::read_to_string(dir.join(DISK_SIZE_FILE)) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(RestoreError::malformed(DISK_SIZE_FILE, err.to_string())),
    };
    let value = text.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value.parse::<u64>().map(Some).map_err(|_| {
        RestoreError::malformed(DISK_SIZE_FILE, format!("not a byte count: {:?}", value))
    })
}

fn read_required(dir: &Path, name: &str) -> Result<Vec<u8>, RestoreError> {
    fs::read(dir.join(name)).map_err(|err| match err.kind() {
        ErrorKind::NotFound => RestoreError::malformed(name, "required file is missing"),
        _ => RestoreError::malformed(name, err.to_string()),
    })
}

fn read_required_text(dir: &Path, name: &str) -> Result<String, RestoreError> {
    let bytes = read_required(dir, name)?;
    String::from_utf8(bytes).map_err(|_| RestoreError::malformed(name, "not valid UTF-8"))
}

fn first_existing(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    names.iter().map(|name| dir.join(name)).find(|path| path.is_file())
}
