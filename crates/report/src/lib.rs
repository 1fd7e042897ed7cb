use anyhow::{Context, Result};
use reforge_core::{PartitionTopology, RestoreError, REPORT_SCHEMA_VERSION};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Planned,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedError {
    pub kind: String,
    pub message: String,
}

impl From<&RestoreError> for ReportedError {
    fn from(err: &RestoreError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: String,
    pub started_at_utc: String,
    pub finished_at_utc: String,
    pub status: RunStatus,
    pub snapshot: String,
    pub target: String,
    pub dry_run: bool,
    pub topology: Option<PartitionTopology>,
    pub partition_table_sha256: Option<String>,
    pub steps: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<ReportedError>,
}

impl RunReport {
    pub fn new(run_id: &str, started_at_utc: &str, snapshot: &str, target: &Path) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            run_id: run_id.to_string(),
            started_at_utc: started_at_utc.to_string(),
            finished_at_utc: started_at_utc.to_string(),
            status: RunStatus::Failed,
            snapshot: snapshot.to_string(),
            target: target.display().to_string(),
            dry_run: false,
            topology: None,
            partition_table_sha256: None,
            steps: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub root: PathBuf,
    pub run_json: PathBuf,
    pub steps_txt: PathBuf,
}

/// Writes `reports/<run_id>/run.json` and `steps.txt` under `base`.
pub fn write_report(base: impl AsRef<Path>, report: &RunReport) -> Result<ReportPaths> {
    let root = base.as_ref().join("reports").join(&report.run_id);
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;

    let run_json = root.join("run.json");
    let steps_txt = root.join("steps.txt");

    let data = serde_json::to_string_pretty(report)?;
    std::fs::write(&run_json, data).with_context(|| format!("write {}", run_json.display()))?;

    let mut lines = report.steps.join("\n");
    if !lines.is_empty() {
        lines.push('\n');
    }
    std::fs::write(&steps_txt, lines).with_context(|| format!("write {}", steps_txt.display()))?;

    Ok(ReportPaths {
        root,
        run_json,
        steps_txt,
    })
}
