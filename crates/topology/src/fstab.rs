use reforge_core::{TopologyError, MAPPER_PREFIX};
use std::path::PathBuf;

/// ESP mount points recognised in the mount table, most specific first.
const ESP_MOUNT_POINTS: [&str; 3] = ["/boot/efi", "/efi", "/boot"];

pub const DEFAULT_ESP_MOUNT_POINT: &str = "boot/efi";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: String,
    pub fs_type: String,
}

/// Parses fstab-formatted text. Comment and short lines are skipped.
pub fn parse_mount_table(text: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(source), Some(mount_point), Some(fs_type)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        entries.push(MountEntry {
            source: unescape_mount(source),
            mount_point: unescape_mount(mount_point),
            fs_type: fs_type.to_string(),
        });
    }
    entries
}

/// Name of the device-mapper node mounted at `/`.
///
/// Exactly one distinct name must be present; none or several is an error.
pub fn resolve_mapper_name(entries: &[MountEntry]) -> Result<String, TopologyError> {
    let mut names: Vec<String> = Vec::new();
    for entry in entries {
        if entry.mount_point != "/" {
            continue;
        }
        let Some(name) = entry.source.strip_prefix(MAPPER_PREFIX) else {
            continue;
        };
        if !name.is_empty() && !names.iter().any(|known| known == name) {
            names.push(name.to_string());
        }
    }
    match names.len() {
        1 => Ok(names.remove(0)),
        _ => Err(TopologyError::AmbiguousMapperName { found: names }),
    }
}

/// ESP mount point relative to `/`, falling back to `boot/efi`.
pub fn esp_mount_point(entries: &[MountEntry]) -> PathBuf {
    for candidate in ESP_MOUNT_POINTS {
        let hit = entries
            .iter()
            .any(|entry| entry.fs_type == "vfat" && entry.mount_point == candidate);
        if hit {
            return PathBuf::from(candidate.trim_start_matches('/'));
        }
    }
    PathBuf::from(DEFAULT_ESP_MOUNT_POINT)
}

/// Decodes the octal escapes (`\040` for space) fstab and mtab use. Escaped
/// bytes are reassembled before decoding so multi-byte UTF-8 names survive.
fn unescape_mount(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let escaped = bytes
            .get(idx + 1..idx + 4)
            .filter(|_| bytes[idx] == b'\\')
            .filter(|digits| digits.iter().all(|d| (b'0'..=b'7').contains(d)))
            .and_then(|digits| std::str::from_utf8(digits).ok())
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());
        match escaped {
            Some(byte) => {
                output.push(byte);
                idx += 4;
            }
            None => {
                output.push(bytes[idx]);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&output).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FSTAB: &str = "\
# /etc/fstab: static file system information.
/dev/mapper/cryptroot  /          ext4  errors=remount-ro 0 1
UUID=7A1B-22C3         /boot/efi  vfat  umask=0077        0 1
/swapfile              none       swap  sw                0 0
tmpfs /tmp tmpfs
";

    #[test]
    fn parses_entries_and_skips_comments() {
        let entries = parse_mount_table(FSTAB);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].source, "UUID=7A1B-22C3");
        assert_eq!(entries[1].fs_type, "vfat");
    }

    #[test]
    fn resolves_single_mapper_name() {
        let entries = parse_mount_table(FSTAB);
        assert_eq!(resolve_mapper_name(&entries).unwrap(), "cryptroot");
    }

    #[test]
    fn duplicate_entries_with_same_name_are_not_ambiguous() {
        let text = "/dev/mapper/root / ext4 defaults\n/dev/mapper/root / ext4 ro\n";
        assert_eq!(resolve_mapper_name(&parse_mount_table(text)).unwrap(), "root");
    }

    #[test]
    fn missing_mapper_source_is_ambiguous() {
        let text = "UUID=abcd / ext4 defaults 0 1\n";
        let err = resolve_mapper_name(&parse_mount_table(text)).unwrap_err();
        match err {
            TopologyError::AmbiguousMapperName { found } => assert!(found.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn distinct_mapper_names_are_ambiguous() {
        let text = "/dev/mapper/a / ext4 defaults\n/dev/mapper/b / btrfs defaults\n";
        let err = resolve_mapper_name(&parse_mount_table(text)).unwrap_err();
        match err {
            TopologyError::AmbiguousMapperName { found } => {
                assert_eq!(found, vec!["a".to_string(), "b".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn esp_mount_point_from_table_or_default() {
        assert_eq!(esp_mount_point(&parse_mount_table(FSTAB)), PathBuf::from("boot/efi"));
        let systemd_boot = "UUID=1 / xfs defaults\nUUID=2 /efi vfat defaults\n";
        assert_eq!(esp_mount_point(&parse_mount_table(systemd_boot)), PathBuf::from("efi"));
        assert_eq!(esp_mount_point(&[]), PathBuf::from("boot/efi"));
    }

    #[test]
    fn decodes_octal_escapes() {
        let entries = parse_mount_table("LABEL=data /mnt/my\\040disk ext4 defaults\n");
        assert_eq!(entries[0].mount_point, "/mnt/my disk");
    }

    #[test]
    fn escaped_utf8_mapper_name_is_rebuilt() {
        let entries = parse_mount_table("/dev/mapper/caf\\303\\251 / ext4 defaults 0 1\n");
        assert_eq!(entries[0].source, "/dev/mapper/café");
        assert_eq!(resolve_mapper_name(&entries).unwrap(), "café");
    }

    #[test]
    fn incomplete_escape_is_kept() {
        let entries = parse_mount_table("UUID=1 /mnt/a\\04 ext4 defaults\n");
        assert_eq!(entries[0].mount_point, "/mnt/a\\04");
    }
}
