use anyhow::{anyhow, Result};
use reforge_host_linux::{CommandRunner, CommandSpec, SystemRunner};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// restic exit status for a repository that does not exist.
const RESTIC_EXIT_NO_REPOSITORY: i32 = 10;
/// restic exit status for a wrong password.
const RESTIC_EXIT_WRONG_PASSWORD: i32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot {snapshot} not found: {detail}")]
    NotFound { snapshot: String, detail: String },
    #[error("authentication to the backup store failed: {detail}")]
    AuthFailed { detail: String },
    #[error("backup store restore failed: {detail}")]
    Failed { detail: String },
}

/// Remote content-addressed backup store.
pub trait SnapshotStore {
    /// Restores `snapshot` under `target`, limited to `include` when given.
    fn restore(
        &self,
        snapshot: &str,
        target: &Path,
        include: Option<&Path>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Local,
    Sftp,
    Rest,
    S3,
    B2,
}

impl std::str::FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(StoreKind::Local),
            "sftp" => Ok(StoreKind::Sftp),
            "rest" => Ok(StoreKind::Rest),
            "s3" => Ok(StoreKind::S3),
            "b2" => Ok(StoreKind::B2),
            other => Err(anyhow!("unknown store kind: {}", other)),
        }
    }
}

/// Location components of a restic repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLocation {
    pub kind: StoreKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: String,
}

impl StoreLocation {
    /// Repository string in restic's `-r` syntax.
    pub fn repository(&self) -> Result<String> {
        let prefix = self.prefix.trim_matches('/');
        let repo = match self.kind {
            StoreKind::Local => {
                if self.prefix.is_empty() {
                    return Err(anyhow!("local store requires a path prefix"));
                }
                self.prefix.clone()
            }
            StoreKind::Sftp => format!("sftp:{}:/{}", self.require_endpoint()?, prefix),
            StoreKind::Rest => {
                let endpoint = self.require_endpoint()?.trim_end_matches('/');
                format!("rest:{}/{}", endpoint, prefix)
            }
            StoreKind::S3 => {
                let endpoint = self.endpoint.as_deref().unwrap_or("s3.amazonaws.com");
                let endpoint = endpoint.trim_end_matches('/');
                join_non_empty(format!("s3:{}/{}", endpoint, self.require_bucket()?), '/', prefix)
            }
            StoreKind::B2 => format!("b2:{}:{}", self.require_bucket()?, prefix),
        };
        Ok(repo)
    }

    fn require_endpoint(&self) -> Result<&str> {
        self.endpoint
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("{:?} store requires an endpoint", self.kind))
    }

    fn require_bucket(&self) -> Result<&str> {
        self.bucket
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("{:?} store requires a bucket", self.kind))
    }
}

fn join_non_empty(base: String, sep: char, tail: &str) -> String {
    if tail.is_empty() {
        base
    } else {
        format!("{}{}{}", base, sep, tail)
    }
}

/// Store backed by the `restic` command line client.
pub struct ResticStore<R: CommandRunner = SystemRunner> {
    repository: String,
    password_file: Option<PathBuf>,
    runner: R,
}

impl ResticStore<SystemRunner> {
    pub fn new(repository: impl Into<String>, password_file: Option<PathBuf>) -> Self {
        Self::with_runner(repository, password_file, SystemRunner)
    }
}

impl<R: CommandRunner> ResticStore<R> {
    pub fn with_runner(
        repository: impl Into<String>,
        password_file: Option<PathBuf>,
        runner: R,
    ) -> Self {
        Self {
            repository: repository.into(),
            password_file,
            runner,
        }
    }

    pub fn restore_command(
        &self,
        snapshot: &str,
        target: &Path,
        include: Option<&Path>,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new("restic").arg("-r").arg(self.repository.as_str());
        if let Some(file) = &self.password_file {
            spec = spec.arg("--password-file").path(file);
        }
        spec = spec.arg("restore").arg(snapshot).arg("--target").path(target);
        if let Some(include) = include {
            spec = spec.arg("--include").path(include);
        }
        spec
    }
}

impl<R: CommandRunner> SnapshotStore for ResticStore<R> {
    fn restore(
        &self,
        snapshot: &str,
        target: &Path,
        include: Option<&Path>,
    ) -> Result<(), StoreError> {
        let spec = self.restore_command(snapshot, target, include);
        info!(
            "restoring snapshot {} into {}{}",
            snapshot,
            target.display(),
            include
                .map(|path| format!(" (only {})", path.display()))
                .unwrap_or_default()
        );
        let output = self.runner.run(&spec).map_err(|err| StoreError::Failed {
            detail: format!("{:#}", err),
        })?;
        if output.success() {
            debug!("restic: {}", output.stdout.lines().last().unwrap_or(""));
            return Ok(());
        }
        Err(classify_failure(snapshot, output.status, output.stderr.trim()))
    }
}

fn classify_failure(snapshot: &str, status: i32, stderr: &str) -> StoreError {
    let detail = if stderr.is_empty() {
        format!("restic exited with status {}", status)
    } else {
        stderr.to_string()
    };
    let lowered = stderr.to_ascii_lowercase();
    if status == RESTIC_EXIT_WRONG_PASSWORD || lowered.contains("wrong password") {
        StoreError::AuthFailed { detail }
    } else if status == RESTIC_EXIT_NO_REPOSITORY
        || lowered.contains("no matching id found")
        || lowered.contains("no snapshot found")
    {
        StoreError::NotFound {
            snapshot: snapshot.to_string(),
            detail,
        }
    } else {
        StoreError::Failed { detail }
    }
}
