//! Per-filesystem creation commands that pin the filesystem UUID.

use reforge_core::FilesystemType;
use reforge_host_linux::CommandSpec;
use std::path::Path;

/// Commands that create `fs` on `device` carrying `uuid`.
///
/// ext4 and btrfs take the UUID at creation time; `mkfs.xfs` does not, so
/// the filesystem is relabelled with `xfs_admin` afterwards.
pub fn format_commands(
    fs: FilesystemType,
    device: &Path,
    uuid: &str,
    label: Option<&str>,
) -> Vec<CommandSpec> {
    let with_label = |spec: CommandSpec| match label {
        Some(label) if !label.is_empty() => spec.arg("-L").arg(label),
        _ => spec,
    };
    match fs {
        FilesystemType::Ext4 => {
            let spec = CommandSpec::new("mkfs.ext4").arg("-F").arg("-U").arg(uuid);
            vec![with_label(spec).path(device)]
        }
        FilesystemType::Btrfs => {
            let spec = CommandSpec::new("mkfs.btrfs").arg("-f").arg("-U").arg(uuid);
            vec![with_label(spec).path(device)]
        }
        FilesystemType::Xfs => vec![
            with_label(CommandSpec::new("mkfs.xfs").arg("-f")).path(device),
            CommandSpec::new("xfs_admin").arg("-U").arg(uuid).path(device),
        ],
    }
}

/// FAT32 for the ESP, reusing the captured volume id when there is one.
pub fn esp_format_command(efi: &Path, volume_id: Option<&str>) -> CommandSpec {
    let spec = CommandSpec::new("mkfs.vfat").arg("-F").arg("32");
    let spec = match volume_id {
        // mkfs.vfat wants the serial as 8 hex digits without the dash
        Some(id) => spec.arg("-i").arg(id.replace('-', "")),
        None => spec,
    };
    spec.path(efi)
}

pub fn uuid_query(device: &Path) -> CommandSpec {
    CommandSpec::new("blkid")
        .args(["-s", "UUID", "-o", "value"])
        .path(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(fs: FilesystemType, label: Option<&str>) -> Vec<String> {
        format_commands(fs, Path::new("/dev/sdb2"), "AAAA-1111", label)
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn ext4_and_btrfs_inject_at_creation() {
        assert_eq!(
            rendered(FilesystemType::Ext4, Some("root")),
            ["mkfs.ext4 -F -U AAAA-1111 -L root /dev/sdb2"]
        );
        assert_eq!(
            rendered(FilesystemType::Btrfs, None),
            ["mkfs.btrfs -f -U AAAA-1111 /dev/sdb2"]
        );
    }

    #[test]
    fn xfs_is_relabelled_after_creation() {
        assert_eq!(
            rendered(FilesystemType::Xfs, Some("")),
            ["mkfs.xfs -f /dev/sdb2", "xfs_admin -U AAAA-1111 /dev/sdb2"]
        );
    }

    #[test]
    fn esp_volume_id_drops_dash() {
        let spec = esp_format_command(Path::new("/dev/sdb1"), Some("7A1B-22C3"));
        assert_eq!(spec.to_string(), "mkfs.vfat -F 32 -i 7A1B22C3 /dev/sdb1");
        let spec = esp_format_command(Path::new("/dev/sdb1"), None);
        assert_eq!(spec.to_string(), "mkfs.vfat -F 32 /dev/sdb1");
    }
}
