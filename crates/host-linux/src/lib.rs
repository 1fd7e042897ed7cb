pub mod command;

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub use command::{run_checked, CommandOutput, CommandRunner, CommandSpec, SystemRunner};

const SECTOR_BYTES: u64 = 512;

/// Read-only view of block devices on the host.
pub trait DeviceProbe {
    fn is_block_device(&self, path: &Path) -> Result<bool>;
    fn size_bytes(&self, path: &Path) -> Result<u64>;
    /// Partitions the kernel currently exposes for the disk (GPT or MBR).
    fn partition_count(&self, path: &Path) -> Result<usize>;
    fn node_exists(&self, path: &Path) -> bool;

    /// Follows `/dev/disk/by-*` symlinks to the kernel device node.
    fn resolve(&self, path: &Path) -> PathBuf {
        fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Probe backed by `/sys/class/block`.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    sys_block: PathBuf,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/class/block"),
        }
    }
}

impl SysfsProbe {
    pub fn with_root(sys_block: impl Into<PathBuf>) -> Self {
        Self {
            sys_block: sys_block.into(),
        }
    }

    fn sys_entry(&self, path: &Path) -> Result<PathBuf> {
        let resolved = self.resolve(path);
        let name = resolved
            .file_name()
            .and_then(|value| value.to_str())
            .ok_or_else(|| anyhow!("invalid device path {}", path.display()))?;
        Ok(self.sys_block.join(name))
    }
}

impl DeviceProbe for SysfsProbe {
    fn is_block_device(&self, path: &Path) -> Result<bool> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.file_type().is_block_device()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
        }
    }

    fn size_bytes(&self, path: &Path) -> Result<u64> {
        let entry = self.sys_entry(path)?;
        read_u64(entry.join("size"))
            .map(|sectors| sectors.saturating_mul(SECTOR_BYTES))
            .ok_or_else(|| anyhow!("no size for {} in {}", path.display(), entry.display()))
    }

    fn partition_count(&self, path: &Path) -> Result<usize> {
        let entry = self.sys_entry(path)?;
        let mut count = 0;
        let entries = fs::read_dir(&entry).with_context(|| format!("read {}", entry.display()))?;
        for child in entries {
            let child = child?;
            if child.path().join("partition").exists() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn node_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Bounded window for device nodes to appear after a partition-table reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleWindow {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SettleWindow {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Polls until every path exists or the window closes.
pub fn wait_for_nodes(
    probe: &dyn DeviceProbe,
    paths: &[PathBuf],
    window: SettleWindow,
) -> Result<()> {
    let started = Instant::now();
    loop {
        let missing: Vec<&PathBuf> = paths.iter().filter(|path| !probe.node_exists(path)).collect();
        if missing.is_empty() {
            debug!("device nodes present after {:?}", started.elapsed());
            return Ok(());
        }
        if started.elapsed() >= window.timeout {
            let names: Vec<String> =
                missing.iter().map(|path| path.display().to_string()).collect();
            return Err(anyhow!(
                "device nodes did not appear within {:?}: {}",
                window.timeout,
                names.join(", ")
            ));
        }
        thread::sleep(window.poll_interval);
    }
}

pub fn mount(runner: &dyn CommandRunner, device: &Path, mount_point: &Path) -> Result<()> {
    fs::create_dir_all(mount_point)
        .with_context(|| format!("create mount point {}", mount_point.display()))?;
    info!("mounting {} at {}", device.display(), mount_point.display());
    run_checked(runner, &CommandSpec::new("mount").path(device).path(mount_point))?;
    Ok(())
}

pub fn unmount(runner: &dyn CommandRunner, mount_point: &Path) -> Result<()> {
    info!("unmounting {}", mount_point.display());
    run_checked(runner, &CommandSpec::new("umount").path(mount_point))?;
    Ok(())
}

pub fn sync(runner: &dyn CommandRunner) -> Result<()> {
    run_checked(runner, &CommandSpec::new("sync"))?;
    Ok(())
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|value| value.trim().to_string())
}

fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    read_string(path).and_then(|value| value.parse::<u64>().ok())
}
