use anyhow::{anyhow, Context, Result};
use clap::Parser;
use reforge_content::{StoreKind, StoreLocation};
use reforge_workflow_engine::RestoreParams;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Rebuild a disk's partition, encryption and filesystem layout from a
/// backup snapshot, then restore its contents.
#[derive(Parser, Debug, Default)]
#[command(name = "reforge", version, about)]
pub struct Args {
    /// JSON file with default settings; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Backup store type: local, sftp, rest, s3 or b2
    #[arg(long)]
    pub store_kind: Option<StoreKind>,
    #[arg(long)]
    pub store_endpoint: Option<String>,
    #[arg(long)]
    pub store_bucket: Option<String>,
    /// Path inside the bucket, or the repository path for a local store
    #[arg(long)]
    pub store_prefix: Option<String>,
    #[arg(long)]
    pub password_file: Option<PathBuf>,

    /// Disk to rebuild, e.g. /dev/sdb. Everything on it is destroyed.
    #[arg(long)]
    pub target: Option<PathBuf>,
    /// Snapshot id, or "latest"
    #[arg(long)]
    pub snapshot: Option<String>,
    #[arg(long)]
    pub metadata_path: Option<PathBuf>,
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,
    #[arg(long)]
    pub mount_root: Option<PathBuf>,
    /// Write reports/<run-id>/run.json under this directory
    #[arg(long)]
    pub report_base: Option<PathBuf>,

    /// Check and print the plan without touching the disk
    #[arg(long)]
    pub dry_run: bool,
    /// Leave the restored filesystems mounted
    #[arg(long)]
    pub keep_mounted: bool,

    /// Log filter, e.g. "debug" or "reforge_structure=trace"; RUST_LOG also works
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Why the command line did not produce [`Args`].
#[derive(Debug)]
pub enum ArgsError {
    /// `--help` or `--version`; clap renders it and the process succeeds.
    Info(clap::Error),
    /// A flag or value clap rejected.
    Invalid(String),
}

impl ArgsError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ArgsError::Info(_) => 0,
            ArgsError::Invalid(_) => 1,
        }
    }
}

pub fn parse_args<I, T>(argv: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Args::try_parse_from(argv).map_err(|err| {
        if !err.use_stderr() {
            return ArgsError::Info(err);
        }
        let rendered = err.to_string();
        let reason = rendered.lines().next().unwrap_or_default();
        ArgsError::Invalid(reason.trim_start_matches("error: ").to_string())
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub kind: Option<StoreKind>,
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub store: StoreSection,
    pub password_file: Option<PathBuf>,
    pub target: Option<PathBuf>,
    pub snapshot: Option<String>,
    pub metadata_path: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub mount_root: Option<PathBuf>,
    pub report_base: Option<PathBuf>,
    pub dry_run: Option<bool>,
    pub keep_mounted: Option<bool>,
}

pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let data = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))
}

#[derive(Debug)]
pub struct RestoreConfig {
    pub store: StoreLocation,
    pub password_file: Option<PathBuf>,
    pub params: RestoreParams,
}

/// Merges flags over the file config and checks the required keys.
pub fn resolve(args: &Args, file: FileConfig) -> Result<RestoreConfig> {
    let kind = args
        .store_kind
        .or(file.store.kind)
        .ok_or_else(|| anyhow!("store kind is required (--store-kind or store.kind)"))?;
    let store = StoreLocation {
        kind,
        endpoint: args.store_endpoint.clone().or(file.store.endpoint),
        bucket: args.store_bucket.clone().or(file.store.bucket),
        prefix: args.store_prefix.clone().or(file.store.prefix).unwrap_or_default(),
    };
    // validates the location components for the kind
    store.repository()?;

    let target = args
        .target
        .clone()
        .or(file.target)
        .ok_or_else(|| anyhow!("target device is required (--target or target)"))?;

    let mut params = RestoreParams::new(target);
    if let Some(snapshot) = args.snapshot.clone().or(file.snapshot) {
        params.snapshot = snapshot;
    }
    if let Some(path) = args.metadata_path.clone().or(file.metadata_path) {
        params.metadata_path = path;
    }
    if let Some(path) = args.staging_dir.clone().or(file.staging_dir) {
        params.staging_dir = path;
    }
    if let Some(path) = args.mount_root.clone().or(file.mount_root) {
        params.mount_root = path;
    }
    params.report_base = args.report_base.clone().or(file.report_base);
    params.dry_run = args.dry_run || file.dry_run.unwrap_or(false);
    params.keep_mounted = args.keep_mounted || file.keep_mounted.unwrap_or(false);

    Ok(RestoreConfig {
        store,
        password_file: args.password_file.clone().or(file.password_file),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"{
        "store": { "kind": "b2", "bucket": "backups", "prefix": "host1" },
        "password_file": "/etc/reforge/restic.pass",
        "target": "/dev/sdb",
        "snapshot": "4f2a9c1e",
        "report_base": "/var/log/reforge",
        "keep_mounted": true
    }"#;

    #[test]
    fn file_values_fill_defaults() {
        let file: FileConfig = serde_json::from_str(FILE).unwrap();
        let config = resolve(&Args::default(), file).unwrap();
        assert_eq!(config.store.repository().unwrap(), "b2:backups:host1");
        assert_eq!(config.params.target, PathBuf::from("/dev/sdb"));
        assert_eq!(config.params.snapshot, "4f2a9c1e");
        assert_eq!(config.params.mount_root, PathBuf::from("/mnt/reforge"));
        assert!(config.params.keep_mounted);
        assert!(!config.params.dry_run);
    }

    #[test]
    fn flags_override_file() {
        let file: FileConfig = serde_json::from_str(FILE).unwrap();
        let args = Args::parse_from([
            "reforge",
            "--target",
            "/dev/nvme1n1",
            "--store-prefix",
            "host2",
            "--dry-run",
        ]);
        let config = resolve(&args, file).unwrap();
        assert_eq!(config.params.target, PathBuf::from("/dev/nvme1n1"));
        assert_eq!(config.store.repository().unwrap(), "b2:backups:host2");
        assert!(config.params.dry_run);
    }

    #[test]
    fn target_is_required() {
        let args = parse_args(["reforge", "--store-kind", "local", "--store-prefix", "/srv/restic"])
            .unwrap();
        let err = resolve(&args, FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("target"));
    }

    #[test]
    fn store_is_required() {
        let args = Args::parse_from(["reforge", "--target", "/dev/sdb"]);
        assert!(resolve(&args, FileConfig::default()).is_err());
    }

    #[test]
    fn bad_flag_value_exits_one() {
        let argv = ["reforge", "--store-kind", "ftp", "--target", "/dev/sdb"];
        let err = parse_args(argv).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        match err {
            ArgsError::Invalid(reason) => {
                assert!(reason.contains("ftp"));
                assert!(!reason.starts_with("error:"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_flag_exits_one() {
        let err = parse_args(["reforge", "--tagret", "/dev/sdb"]).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn help_and_version_exit_zero() {
        for flag in ["--help", "--version"] {
            let err = parse_args(["reforge", flag]).unwrap_err();
            assert!(matches!(err, ArgsError::Info(_)), "{flag}");
            assert_eq!(err.exit_code(), 0);
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<FileConfig>(r#"{ "targte": "/dev/sdb" }"#).is_err());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore.json");
        std::fs::write(&path, FILE).unwrap();
        let file = load_file_config(&path).unwrap();
        assert_eq!(file.store.bucket.as_deref(), Some("backups"));
    }
}
