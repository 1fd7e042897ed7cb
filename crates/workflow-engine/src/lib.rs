//! Restore pipeline: metadata, topology, safety gate, structure, content,
//! boot continuity. Stages run strictly in order against one
//! [`RestoreContext`]; the first error ends the run.

use anyhow::Result;
use reforge_bootloader_core::{ensure_fallback_loader, BootArch, FallbackOutcome};
use reforge_content::{
    fetch_captured_snapshot, overlay_archive, SnapshotStore, DEFAULT_METADATA_PATH,
};
use reforge_core::{
    now_utc_rfc3339, CapturedSnapshot, PartitionTopology, RestoreError, RestoreTarget,
    TargetMountPlan, DEFAULT_SNAPSHOT,
};
use reforge_host_linux::{
    mount, run_checked, sync, unmount, CommandRunner, CommandSpec, DeviceProbe, SettleWindow,
};
use reforge_report::{
    new_run_id, sha256_hex, write_report, ReportPaths, ReportedError, RunReport, RunStatus,
};
use reforge_safety::{check_target, Confirmer, SafetyContext};
use reforge_structure::{apply_structure, plan_structure, StructurePlan};
use reforge_topology::{infer_topology, PartitionPaths};
use std::path::PathBuf;
use tracing::{info, warn};

pub const DEFAULT_STAGING_DIR: &str = "/var/tmp/reforge/staging";
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt/reforge";

#[derive(Debug, Clone)]
pub struct RestoreParams {
    pub target: PathBuf,
    pub snapshot: String,
    pub metadata_path: PathBuf,
    pub staging_dir: PathBuf,
    pub mount_root: PathBuf,
    pub report_base: Option<PathBuf>,
    pub dry_run: bool,
    pub keep_mounted: bool,
    pub settle: SettleWindow,
    /// Firmware architecture for the fallback loader; host architecture when unset.
    pub arch: Option<BootArch>,
}

impl RestoreParams {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            snapshot: DEFAULT_SNAPSHOT.to_string(),
            metadata_path: PathBuf::from(DEFAULT_METADATA_PATH),
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            report_base: None,
            dry_run: false,
            keep_mounted: false,
            settle: SettleWindow::default(),
            arch: None,
        }
    }
}

/// Host seams the pipeline acts through.
pub struct RestoreEnv<'a> {
    pub runner: &'a dyn CommandRunner,
    pub probe: &'a dyn DeviceProbe,
    pub store: &'a dyn SnapshotStore,
    pub confirmer: &'a dyn Confirmer,
}

/// State threaded through the stages. Each stage fills in what it produced.
#[derive(Debug, Default)]
pub struct RestoreContext {
    pub run_id: String,
    pub started_at_utc: String,
    pub device: PathBuf,
    pub snapshot: Option<CapturedSnapshot>,
    pub topology: Option<PartitionTopology>,
    pub target: Option<RestoreTarget>,
    pub plan: Option<StructurePlan>,
    pub mounts: Option<TargetMountPlan>,
    /// Mount points currently held, in mount order.
    pub mounted: Vec<PathBuf>,
    pub container_open: bool,
    pub fallback: Option<FallbackOutcome>,
    pub steps: Vec<String>,
    pub warnings: Vec<String>,
}

impl RestoreContext {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn snapshot(&self, stage: &str) -> Result<&CapturedSnapshot, RestoreError> {
        self.snapshot.as_ref().ok_or_else(|| out_of_order(stage, "captured snapshot"))
    }

    fn topology(&self, stage: &str) -> Result<&PartitionTopology, RestoreError> {
        self.topology.as_ref().ok_or_else(|| out_of_order(stage, "topology"))
    }
}

fn out_of_order(stage: &str, missing: &str) -> RestoreError {
    RestoreError::StageOrder {
        stage: stage.to_string(),
        missing: missing.to_string(),
    }
}

#[derive(Debug)]
pub struct RestoreSummary {
    pub run_id: String,
    pub dry_run: bool,
    pub topology: Option<PartitionTopology>,
    /// Rendered structure plan, in execution order.
    pub plan: Vec<String>,
    pub steps: Vec<String>,
    pub warnings: Vec<String>,
    pub fallback: Option<FallbackOutcome>,
    pub report: Option<ReportPaths>,
}

pub fn run_restore(
    params: &RestoreParams,
    env: &RestoreEnv<'_>,
) -> Result<RestoreSummary, RestoreError> {
    let mut ctx = RestoreContext {
        run_id: new_run_id(),
        started_at_utc: now_utc_rfc3339(),
        device: env.probe.resolve(&params.target),
        ..RestoreContext::default()
    };
    info!(
        "run {}: restoring snapshot {} onto {}{}",
        ctx.run_id,
        params.snapshot,
        ctx.device.display(),
        if params.dry_run { " (dry run)" } else { "" }
    );

    let result = run_stages(&mut ctx, params, env);
    let report = finish_report(&ctx, params, result.as_ref().err());
    result?;

    Ok(RestoreSummary {
        run_id: ctx.run_id,
        dry_run: params.dry_run,
        plan: ctx
            .plan
            .as_ref()
            .map(|plan| plan.steps.iter().map(ToString::to_string).collect())
            .unwrap_or_default(),
        topology: ctx.topology,
        steps: ctx.steps,
        warnings: ctx.warnings,
        fallback: ctx.fallback,
        report,
    })
}

fn run_stages(
    ctx: &mut RestoreContext,
    params: &RestoreParams,
    env: &RestoreEnv<'_>,
) -> Result<(), RestoreError> {
    read_metadata(ctx, params, env)?;
    infer(ctx)?;
    gate(ctx, params, env)?;
    plan(ctx)?;
    if params.dry_run {
        info!("dry run: stopping before any change to {}", ctx.device.display());
        return Ok(());
    }
    recreate(ctx, params, env)?;
    restore_content(ctx, params, env)?;
    ensure_boot(ctx, params);
    if params.keep_mounted {
        info!("leaving {} mounted", params.mount_root.display());
    } else {
        teardown(ctx, env);
    }
    info!("restore of {} complete", ctx.device.display());
    Ok(())
}

fn read_metadata(
    ctx: &mut RestoreContext,
    params: &RestoreParams,
    env: &RestoreEnv<'_>,
) -> Result<(), RestoreError> {
    let snapshot = fetch_captured_snapshot(
        env.store,
        &params.snapshot,
        &params.metadata_path,
        &params.staging_dir,
    )?;
    ctx.steps.push(format!(
        "read metadata: snapshot {}, original disk {}",
        snapshot.snapshot_id, snapshot.original_disk_path
    ));
    ctx.snapshot = Some(snapshot);
    Ok(())
}

fn infer(ctx: &mut RestoreContext) -> Result<(), RestoreError> {
    let paths = PartitionPaths::for_disk(&ctx.device);
    let topology = infer_topology(ctx.snapshot("infer")?, &paths)?;
    ctx.steps.push(format!(
        "infer topology: {} root{}",
        topology.inner_filesystem_type,
        if topology.encrypted { " in LUKS" } else { "" }
    ));
    ctx.topology = Some(topology);
    Ok(())
}

fn gate(
    ctx: &mut RestoreContext,
    params: &RestoreParams,
    env: &RestoreEnv<'_>,
) -> Result<(), RestoreError> {
    let safety = SafetyContext {
        skip_confirmation: params.dry_run,
        ..SafetyContext::for_snapshot(&ctx.device, ctx.snapshot("gate")?)
    };
    let (target, warnings) = check_target(&safety, env.probe, env.confirmer)?;
    ctx.steps.push(format!(
        "safety gate: {} ({} bytes) accepted",
        target.device_path.display(),
        target.size_bytes
    ));
    ctx.warnings.extend(warnings);
    ctx.target = Some(target);
    Ok(())
}

fn plan(ctx: &mut RestoreContext) -> Result<(), RestoreError> {
    let snapshot = ctx.snapshot("plan")?;
    let target = ctx
        .target
        .as_ref()
        .ok_or_else(|| out_of_order("plan", "restore target"))?;
    let plan = plan_structure(
        ctx.topology("plan")?,
        target,
        &snapshot.partition_table,
        snapshot.original_size_bytes,
    );
    ctx.warnings.extend(plan.warnings.iter().cloned());
    ctx.plan = Some(plan);
    Ok(())
}

fn recreate(
    ctx: &mut RestoreContext,
    params: &RestoreParams,
    env: &RestoreEnv<'_>,
) -> Result<(), RestoreError> {
    let plan = ctx
        .plan
        .take()
        .ok_or_else(|| out_of_order("recreate", "structure plan"))?;
    let result = apply_structure(&plan, env.runner, env.probe, params.settle, &mut ctx.steps);
    ctx.plan = Some(plan);
    result?;
    ctx.container_open = ctx.topology("recreate")?.encrypted;
    Ok(())
}

fn restore_content(
    ctx: &mut RestoreContext,
    params: &RestoreParams,
    env: &RestoreEnv<'_>,
) -> Result<(), RestoreError> {
    let topology = ctx.topology("restore content")?.clone();
    let mounts = TargetMountPlan::new(&params.mount_root, &topology.esp_mount_point);
    ctx.mounts = Some(mounts.clone());

    mount(env.runner, &topology.inner_device_path(), &mounts.root).map_err(content_error)?;
    ctx.mounted.push(mounts.root.clone());
    mount(env.runner, &topology.efi_partition_path, &mounts.esp).map_err(content_error)?;
    ctx.mounted.push(mounts.esp.clone());
    ctx.steps.push(format!(
        "mount: {} at {}, {} at {}",
        topology.inner_device_path().display(),
        mounts.root.display(),
        topology.efi_partition_path.display(),
        mounts.esp.display()
    ));

    env.store
        .restore(&params.snapshot, &mounts.root, None)
        .map_err(RestoreError::content)?;
    ctx.steps.push(format!(
        "restore content: snapshot {} into {}",
        params.snapshot,
        mounts.root.display()
    ));

    let snapshot = ctx.snapshot("restore content")?;
    let overlays = [
        (snapshot.boot_archive.clone(), mounts.root.join("boot")),
        (snapshot.esp_archive.clone(), mounts.esp.clone()),
    ];
    for (archive, dest) in overlays {
        let Some(archive) = archive else { continue };
        let stats = overlay_archive(&archive, &dest).map_err(content_error)?;
        ctx.steps.push(format!(
            "overlay {} onto {}: {} entries",
            archive.display(),
            dest.display(),
            stats.entries
        ));
    }

    Ok(())
}

fn content_error(err: anyhow::Error) -> RestoreError {
    RestoreError::content(format!("{:#}", err))
}

/// Never fails the run; problems become warnings.
fn ensure_boot(ctx: &mut RestoreContext, params: &RestoreParams) {
    let Some(esp) = ctx.mounts.as_ref().map(|mounts| mounts.esp.clone()) else {
        return;
    };
    let Some(arch) = params.arch.or_else(BootArch::host) else {
        ctx.warn("unknown firmware architecture; fallback loader not checked".to_string());
        return;
    };
    match ensure_fallback_loader(&esp, arch) {
        Ok(outcome) => {
            match &outcome {
                FallbackOutcome::AlreadyPresent { path } => {
                    ctx.steps.push(format!("boot continuity: {} present", path.display()))
                }
                FallbackOutcome::Installed { source, path } => ctx.steps.push(format!(
                    "boot continuity: copied {} to {}",
                    source.display(),
                    path.display()
                )),
                FallbackOutcome::NoCandidate => ctx.warn(format!(
                    "no EFI loader on {}; the restored system may need a firmware boot entry",
                    esp.display()
                )),
            }
            ctx.fallback = Some(outcome);
        }
        Err(err) => ctx.warn(format!("fallback loader not installed: {:#}", err)),
    }
}

fn teardown(ctx: &mut RestoreContext, env: &RestoreEnv<'_>) {
    if let Err(err) = sync(env.runner) {
        ctx.warn(format!("sync failed: {:#}", err));
    }
    while let Some(mount_point) = ctx.mounted.pop() {
        match unmount(env.runner, &mount_point) {
            Ok(()) => ctx.steps.push(format!("unmount {}", mount_point.display())),
            Err(err) => ctx.warn(format!("unmount {} failed: {:#}", mount_point.display(), err)),
        }
    }
    if !ctx.container_open {
        return;
    }
    let Some(name) = ctx
        .topology
        .as_ref()
        .and_then(|t| t.encryption_container_name.clone())
    else {
        return;
    };
    let close = CommandSpec::new("cryptsetup").arg("close").arg(name.as_str());
    match run_checked(env.runner, &close) {
        Ok(_) => {
            ctx.container_open = false;
            ctx.steps.push(format!("close LUKS container {}", name));
        }
        Err(err) => ctx.warn(format!("closing {} failed: {:#}", name, err)),
    }
}

fn finish_report(
    ctx: &RestoreContext,
    params: &RestoreParams,
    error: Option<&RestoreError>,
) -> Option<ReportPaths> {
    let base = params.report_base.as_ref()?;
    let mut report =
        RunReport::new(&ctx.run_id, &ctx.started_at_utc, &params.snapshot, &ctx.device);
    report.finished_at_utc = now_utc_rfc3339();
    report.dry_run = params.dry_run;
    report.status = match (error, params.dry_run) {
        (Some(_), _) => RunStatus::Failed,
        (None, true) => RunStatus::Planned,
        (None, false) => RunStatus::Succeeded,
    };
    report.topology = ctx.topology.clone();
    report.partition_table_sha256 = ctx
        .snapshot
        .as_ref()
        .map(|snapshot| sha256_hex(&snapshot.partition_table.bytes));
    report.steps = ctx.steps.clone();
    report.warnings = ctx.warnings.clone();
    report.error = error.map(ReportedError::from);

    match write_report(base, &report) {
        Ok(paths) => {
            info!("report written to {}", paths.root.display());
            Some(paths)
        }
        Err(err) => {
            warn!("could not write report under {}: {:#}", base.display(), err);
            None
        }
    }
}
