use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const EFI_PARTITION_NUMBER: u32 = 1;
pub const ROOT_PARTITION_NUMBER: u32 = 2;

/// Disk name prefixes whose partitions take a `p` separator (`nvme0n1p1`).
const SEPARATED_PREFIXES: [&str; 4] = ["nvme", "mmcblk", "nbd", "loop"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingScheme {
    /// `<disk>p<n>`
    Separated,
    /// `<disk><n>`
    Appended,
}

impl NamingScheme {
    pub fn for_disk(disk: &Path) -> Self {
        let name = disk
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("");
        if SEPARATED_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            NamingScheme::Separated
        } else {
            NamingScheme::Appended
        }
    }
}

pub fn partition_path(disk: &Path, scheme: NamingScheme, number: u32) -> PathBuf {
    let mut path = OsString::from(disk.as_os_str());
    if scheme == NamingScheme::Separated {
        path.push("p");
    }
    path.push(number.to_string());
    PathBuf::from(path)
}

/// Partition path using the scheme the disk's own name implies.
pub fn partition_path_for(disk: &Path, number: u32) -> PathBuf {
    partition_path(disk, NamingScheme::for_disk(disk), number)
}

/// Device nodes of the two partitions a restore lays out on a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPaths {
    pub efi: PathBuf,
    pub root: PathBuf,
}

impl PartitionPaths {
    pub fn for_disk(disk: &Path) -> Self {
        Self {
            efi: partition_path_for(disk, EFI_PARTITION_NUMBER),
            root: partition_path_for(disk, ROOT_PARTITION_NUMBER),
        }
    }
}
