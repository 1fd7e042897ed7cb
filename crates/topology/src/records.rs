//! Parser for captured `blkid` output.
//!
//! Each non-empty line has the shape `<device>: KEY="value" KEY="value" ...`.
//! blkid escapes `"` and `\` inside values with a backslash.

use reforge_core::DeviceIdentifierRecord;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordParseError {
    #[error("line {line}: missing ':' after device path")]
    MissingDevice { line: usize },
    #[error("line {line}: malformed key/value pair near {near:?}")]
    MalformedPair { line: usize, near: String },
    #[error("line {line}: unterminated value for {key}")]
    UnterminatedValue { line: usize, key: String },
}

pub fn parse_identifier_records(
    text: &str,
) -> Result<Vec<DeviceIdentifierRecord>, RecordParseError> {
    let mut records = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        records.push(parse_line(line, index + 1)?);
    }
    Ok(records)
}

fn parse_line(line: &str, line_no: usize) -> Result<DeviceIdentifierRecord, RecordParseError> {
    let (device, rest) = line
        .split_once(':')
        .ok_or(RecordParseError::MissingDevice { line: line_no })?;
    let device = device.trim();
    if device.is_empty() {
        return Err(RecordParseError::MissingDevice { line: line_no });
    }

    let attributes = parse_pairs(rest, line_no)?;
    Ok(DeviceIdentifierRecord {
        device_path: device.to_string(),
        fs_type: attributes.get("TYPE").cloned(),
        uuid: attributes.get("UUID").cloned(),
        label: attributes.get("LABEL").cloned(),
        attributes,
    })
}

fn parse_pairs(input: &str, line_no: usize) -> Result<BTreeMap<String, String>, RecordParseError> {
    let mut pairs = BTreeMap::new();
    let mut chars = input.char_indices().peekable();

    loop {
        while matches!(chars.peek(), Some((_, ch)) if ch.is_whitespace()) {
            chars.next();
        }
        let Some(&(start, _)) = chars.peek() else {
            break;
        };

        let mut key = String::new();
        while let Some(&(_, ch)) = chars.peek() {
            if ch == '=' || ch.is_whitespace() {
                break;
            }
            key.push(ch);
            chars.next();
        }
        let malformed = || RecordParseError::MalformedPair {
            line: line_no,
            near: input[start..].chars().take(24).collect(),
        };
        if key.is_empty() || chars.next().map(|(_, ch)| ch) != Some('=') {
            return Err(malformed());
        }
        if chars.next().map(|(_, ch)| ch) != Some('"') {
            return Err(malformed());
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some((_, ch)) = chars.next() {
            match ch {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => {
                    closed = true;
                    break;
                }
                _ => value.push(ch),
            }
        }
        if !closed {
            return Err(RecordParseError::UnterminatedValue { line: line_no, key });
        }
        // first occurrence of a key on a line wins
        pairs.entry(key).or_insert(value);
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"/dev/nvme0n1p1: UUID="7A1B-22C3" BLOCK_SIZE="512" TYPE="vfat" PARTLABEL="EFI System Partition" PARTUUID="0f1e2d3c-0000-4000-8000-000000000001"
/dev/nvme0n1p2: UUID="5d0c1c6e-2f77-4c1e-9a1d-0e6f9a3b7d11" TYPE="crypto_LUKS" PARTUUID="0f1e2d3c-0000-4000-8000-000000000002"

/dev/mapper/cryptroot: LABEL="root fs" UUID="c2b8a7a4-1d5e-4c0b-8d8e-5b8f6f0e4b21" BLOCK_SIZE="4096" TYPE="ext4"
/dev/nvme0n1: PTUUID="0f1e2d3c-0000-4000-8000-000000000000" PTTYPE="gpt"
"#;

    #[test]
    fn parses_blkid_listing() {
        let records = parse_identifier_records(SAMPLE).unwrap();
        assert_eq!(records.len(), 4);

        assert_eq!(records[0].device_path, "/dev/nvme0n1p1");
        assert_eq!(records[0].fs_type.as_deref(), Some("vfat"));
        assert_eq!(records[0].uuid.as_deref(), Some("7A1B-22C3"));
        assert_eq!(records[0].attribute("PARTLABEL"), Some("EFI System Partition"));

        assert!(records[1].is_encryption_container());
        assert_eq!(records[2].label.as_deref(), Some("root fs"));

        assert_eq!(records[3].fs_type, None);
        assert_eq!(records[3].attribute("PTTYPE"), Some("gpt"));
    }

    #[test]
    fn unescapes_quoted_values() {
        let records = parse_identifier_records(r#"/dev/sda1: LABEL="say \"hi\"" TYPE="ext4""#).unwrap();
        assert_eq!(records[0].label.as_deref(), Some(r#"say "hi""#));
    }

    #[test]
    fn rejects_line_without_device() {
        let err = parse_identifier_records("UUID=\"x\"\n").unwrap_err();
        assert_eq!(err, RecordParseError::MissingDevice { line: 1 });
    }

    #[test]
    fn rejects_unquoted_value() {
        let err = parse_identifier_records("/dev/sda1: TYPE=ext4").unwrap_err();
        assert!(matches!(err, RecordParseError::MalformedPair { line: 1, .. }));
    }

    #[test]
    fn rejects_unterminated_value() {
        let err = parse_identifier_records("/dev/sda1: TYPE=\"ext4").unwrap_err();
        assert_eq!(
            err,
            RecordParseError::UnterminatedValue {
                line: 1,
                key: "TYPE".to_string()
            }
        );
    }
}
