//! Overlays captured boot and ESP archives onto restored content.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayStats {
    pub entries: usize,
    pub skipped: usize,
}

/// Unpacks a tar (optionally zstd-compressed) over `dest`, replacing
/// whatever the snapshot restore put at the same paths.
pub fn overlay_archive(archive: &Path, dest: &Path) -> Result<OverlayStats> {
    let compressed = is_zstd(archive)?;
    info!(
        "overlaying {} onto {}{}",
        archive.display(),
        dest.display(),
        if compressed { " (zstd)" } else { "" }
    );
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let reader = BufReader::new(file);
    let stats = if compressed {
        let decoder = zstd::Decoder::new(reader)
            .with_context(|| format!("zstd {}", archive.display()))?;
        unpack(decoder, dest)
    } else {
        unpack(reader, dest)
    }
    .with_context(|| format!("unpack {} into {}", archive.display(), dest.display()))?;
    debug!("{} entries written, {} skipped", stats.entries, stats.skipped);
    Ok(stats)
}

fn is_zstd(path: &Path) -> Result<bool> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let read = file.read(&mut magic[filled..])?;
        if read == 0 {
            return Ok(false);
        }
        filled += read;
    }
    Ok(magic == ZSTD_MAGIC)
}

fn unpack<R: Read>(reader: R, dest: &Path) -> Result<OverlayStats> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let mut stats = OverlayStats::default();
    for entry in archive.entries()? {
        let mut entry = entry?;
        // unpack_in refuses paths that would escape dest
        if entry.unpack_in(dest)? {
            stats.entries += 1;
        } else {
            debug!("skipped entry {}", entry.path()?.display());
            stats.skipped += 1;
        }
    }
    Ok(stats)
}
