use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How deep below the ESP root the last-resort search looks for loaders.
const SEARCH_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BootArch {
    X64,
    Aarch64,
    Ia32,
    RiscV64,
}

impl BootArch {
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(BootArch::X64)
        } else if cfg!(target_arch = "aarch64") {
            Some(BootArch::Aarch64)
        } else if cfg!(target_arch = "x86") {
            Some(BootArch::Ia32)
        } else if cfg!(target_arch = "riscv64") {
            Some(BootArch::RiscV64)
        } else {
            None
        }
    }

    /// Suffix firmware and distributions use in loader file names.
    pub fn efi_suffix(&self) -> &'static str {
        match self {
            BootArch::X64 => "x64",
            BootArch::Aarch64 => "aa64",
            BootArch::Ia32 => "ia32",
            BootArch::RiscV64 => "riscv64",
        }
    }

    /// Firmware-default removable-media path, e.g. `EFI/BOOT/BOOTX64.EFI`.
    pub fn fallback_path(&self) -> PathBuf {
        PathBuf::from(format!("EFI/BOOT/BOOT{}.EFI", self.efi_suffix().to_ascii_uppercase()))
    }

    /// Known loader locations, most preferred first.
    pub fn known_candidates(&self) -> Vec<PathBuf> {
        let suffix = self.efi_suffix();
        let mut paths = vec![format!("EFI/systemd/systemd-boot{}.efi", suffix)];
        for vendor in ["ubuntu", "debian", "fedora", "centos", "redhat", "opensuse", "arch"] {
            paths.push(format!("EFI/{}/shim{}.efi", vendor, suffix));
            paths.push(format!("EFI/{}/grub{}.efi", vendor, suffix));
        }
        paths.push(format!("EFI/GRUB/grub{}.efi", suffix));
        paths.push(format!("EFI/refind/refind_{}.efi", suffix));
        paths.into_iter().map(PathBuf::from).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FallbackOutcome {
    AlreadyPresent { path: PathBuf },
    Installed { source: PathBuf, path: PathBuf },
    NoCandidate,
}

/// Makes sure the ESP mounted at `esp_root` has a firmware-default loader.
pub fn ensure_fallback_loader(esp_root: &Path, arch: BootArch) -> Result<FallbackOutcome> {
    let fallback = arch.fallback_path();
    if let Some(existing) = find_case_insensitive(esp_root, &fallback) {
        info!("fallback loader present at {}", existing.display());
        return Ok(FallbackOutcome::AlreadyPresent { path: existing });
    }

    let source = arch
        .known_candidates()
        .iter()
        .find_map(|candidate| find_case_insensitive(esp_root, candidate))
        .or_else(|| search_loader(esp_root, SEARCH_DEPTH));

    let Some(source) = source else {
        warn!(
            "no EFI loader found under {}; {} not created",
            esp_root.display(),
            fallback.display()
        );
        return Ok(FallbackOutcome::NoCandidate);
    };

    let dest = place_case_insensitive(esp_root, &fallback);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::copy(&source, &dest)
        .with_context(|| format!("copy {} to {}", source.display(), dest.display()))?;
    info!("installed fallback loader {} from {}", dest.display(), source.display());
    Ok(FallbackOutcome::Installed { source, path: dest })
}

/// Resolves `relative` under `root` ignoring case, as FAT does.
pub fn find_case_insensitive(root: &Path, relative: &Path) -> Option<PathBuf> {
    let parts: Vec<&str> = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect::<Option<_>>()?;
    resolve_parts(root, &parts)
}

fn resolve_parts(dir: &Path, parts: &[&str]) -> Option<PathBuf> {
    let Some((first, rest)) = parts.split_first() else {
        return dir.is_file().then(|| dir.to_path_buf());
    };
    children_ignoring_case(dir, first)
        .into_iter()
        .find_map(|child| resolve_parts(&child, rest))
}

/// Entries of `dir` named `wanted` in any case, exact match first.
fn children_ignoring_case(dir: &Path, wanted: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut matches: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.eq_ignore_ascii_case(wanted))
        })
        .map(|entry| entry.path())
        .collect();
    matches.sort_by_key(|path| {
        let exact = path.file_name().and_then(|n| n.to_str()) == Some(wanted);
        (!exact, path.clone())
    });
    matches
}

/// Destination for `relative`, reusing existing directories whatever their case.
fn place_case_insensitive(root: &Path, relative: &Path) -> PathBuf {
    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        let name = component.as_os_str();
        let is_dir = components.peek().is_some();
        current = match (is_dir, name.to_str()) {
            (true, Some(wanted)) => children_ignoring_case(&current, wanted)
                .into_iter()
                .find(|path| path.is_dir())
                .unwrap_or_else(|| current.join(name)),
            _ => current.join(name),
        };
    }
    current
}

/// Shim's fallback (`fb*.efi`) and MokManager (`mm*.efi`) do not boot an OS.
fn is_shim_helper(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.to_ascii_lowercase())
        .is_some_and(|stem| stem.starts_with("fb") || stem.starts_with("mm"))
}

/// First `*.efi` loader in sorted walk order, at most `depth` levels down.
fn search_loader(root: &Path, depth: usize) -> Option<PathBuf> {
    if depth == 0 {
        return None;
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(root).ok()?.flatten().map(|e| e.path()).collect();
    entries.sort();
    for path in &entries {
        let is_efi = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("efi"));
        if path.is_file() && is_efi && !is_shim_helper(path) {
            debug!("search found loader {}", path.display());
            return Some(path.clone());
        }
    }
    entries
        .iter()
        .filter(|path| path.is_dir())
        .find_map(|dir| search_loader(dir, depth - 1))
}
