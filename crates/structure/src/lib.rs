//! Recreates the captured partition, encryption and filesystem layout on the
//! target disk with the original identifiers.
//!
//! Planning is pure: [`plan_structure`] turns a topology into an ordered list
//! of steps that can be printed for a dry run or handed to
//! [`apply_structure`]. No step is retried.

pub mod mkfs;

use reforge_core::{
    LuksVersion, PartitionTableBlob, PartitionTopology, RestoreError, RestoreTarget, MAPPER_PREFIX,
};
use reforge_host_linux::{
    run_checked, wait_for_nodes, CommandRunner, CommandSpec, DeviceProbe, SettleWindow,
};
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

pub use mkfs::{esp_format_command, format_commands, uuid_query};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Run(CommandSpec),
    /// Poll until the device nodes exist.
    WaitForNodes(Vec<PathBuf>),
    /// Read the UUID back and compare.
    VerifyUuid { device: PathBuf, expected: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub label: String,
    pub action: StepAction,
}

impl PlannedStep {
    fn run(label: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            label: label.into(),
            action: StepAction::Run(spec),
        }
    }
}

impl fmt::Display for PlannedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            StepAction::Run(spec) => write!(f, "{}: {}", self.label, spec),
            StepAction::WaitForNodes(paths) => {
                let names: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                write!(f, "{}: wait for {}", self.label, names.join(", "))
            }
            StepAction::VerifyUuid { device, expected } => {
                write!(f, "{}: expect UUID {} on {}", self.label, expected, device.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructurePlan {
    pub steps: Vec<PlannedStep>,
    pub warnings: Vec<String>,
}

pub fn plan_structure(
    topology: &PartitionTopology,
    target: &RestoreTarget,
    table: &PartitionTableBlob,
    original_size_bytes: Option<u64>,
) -> StructurePlan {
    let disk = &target.device_path;
    let mut steps = Vec::new();
    let mut warnings = Vec::new();

    steps.push(PlannedStep::run(
        "apply partition table",
        CommandSpec::new("sgdisk")
            .arg(format!("--load-backup={}", table.path.display()))
            .path(disk),
    ));
    // sgdisk leaves a same-size disk untouched, so an unknown original size moves too
    let grows = match original_size_bytes {
        Some(original) => target.size_bytes > original,
        None => true,
    };
    if grows {
        steps.push(PlannedStep::run(
            "move backup GPT header",
            CommandSpec::new("sgdisk").arg("--move-second-header").path(disk),
        ));
    }
    steps.push(PlannedStep::run(
        "reread partition table",
        CommandSpec::new("partprobe").path(disk),
    ));
    steps.push(PlannedStep::run("settle udev", CommandSpec::new("udevadm").arg("settle")));
    steps.push(PlannedStep {
        label: "wait for partitions".to_string(),
        action: StepAction::WaitForNodes(vec![
            topology.efi_partition_path.clone(),
            topology.root_partition_path.clone(),
        ]),
    });

    steps.push(PlannedStep::run(
        "format ESP",
        esp_format_command(&topology.efi_partition_path, topology.efi_volume_id.as_deref()),
    ));
    if let Some(volume_id) = &topology.efi_volume_id {
        steps.push(PlannedStep {
            label: "verify ESP volume id".to_string(),
            action: StepAction::VerifyUuid {
                device: topology.efi_partition_path.clone(),
                expected: volume_id.clone(),
            },
        });
    }

    if let (true, Some(name)) = (topology.encrypted, &topology.encryption_container_name) {
        let version = topology.encryption_container_version.unwrap_or(LuksVersion::Luks2);
        let mut format = CommandSpec::new("cryptsetup")
            .args(["luksFormat", "--batch-mode", "--verify-passphrase", "--type"])
            .arg(version.as_str());
        match &topology.encryption_container_uuid {
            Some(uuid) => format = format.arg("--uuid").arg(uuid.as_str()),
            None => {
                let message = format!(
                    "no captured LUKS UUID for {}; the container gets a fresh UUID and \
                     crypttab entries that reference the old one will not match",
                    topology.root_partition_path.display()
                );
                warn!("{}", message);
                warnings.push(message);
            }
        }
        steps.push(PlannedStep::run(
            "create LUKS container",
            format.path(&topology.root_partition_path).interactive(),
        ));
        steps.push(PlannedStep::run(
            "open LUKS container",
            CommandSpec::new("cryptsetup")
                .arg("open")
                .path(&topology.root_partition_path)
                .arg(name.as_str())
                .interactive(),
        ));
        steps.push(PlannedStep {
            label: "wait for mapper".to_string(),
            action: StepAction::WaitForNodes(vec![PathBuf::from(format!(
                "{}{}",
                MAPPER_PREFIX, name
            ))]),
        });
    }

    let inner = topology.inner_device_path();
    let fs = topology.inner_filesystem_type;
    for spec in format_commands(
        fs,
        &inner,
        &topology.inner_filesystem_uuid,
        topology.inner_filesystem_label.as_deref(),
    ) {
        let label = if spec.program == "xfs_admin" {
            "set xfs UUID".to_string()
        } else {
            format!("create {}", fs)
        };
        steps.push(PlannedStep::run(label, spec));
    }
    steps.push(PlannedStep {
        label: format!("verify {} UUID", fs),
        action: StepAction::VerifyUuid {
            device: inner,
            expected: topology.inner_filesystem_uuid.clone(),
        },
    });

    StructurePlan { steps, warnings }
}

/// Executes the plan, appending each finished step to `executed`.
pub fn apply_structure(
    plan: &StructurePlan,
    runner: &dyn CommandRunner,
    probe: &dyn DeviceProbe,
    window: SettleWindow,
    executed: &mut Vec<String>,
) -> Result<(), RestoreError> {
    for step in &plan.steps {
        info!("{}", step);
        match &step.action {
            StepAction::Run(spec) => {
                run_checked(runner, spec)
                    .map_err(|err| RestoreError::structure(&step.label, format!("{:#}", err)))?;
            }
            StepAction::WaitForNodes(paths) => {
                wait_for_nodes(probe, paths, window)
                    .map_err(|err| RestoreError::structure(&step.label, format!("{:#}", err)))?;
            }
            StepAction::VerifyUuid { device, expected } => {
                let output = run_checked(runner, &uuid_query(device))
                    .map_err(|err| RestoreError::structure(&step.label, format!("{:#}", err)))?;
                let actual = output.stdout.trim();
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(RestoreError::structure(
                        &step.label,
                        format!(
                            "{} carries UUID {:?}, expected {:?}",
                            device.display(),
                            actual,
                            expected
                        ),
                    ));
                }
            }
        }
        executed.push(step.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use reforge_core::{FilesystemType, LuksVersion};
    use reforge_host_linux::CommandOutput;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;

    /// Records commands and remembers the UUID each mkfs/xfs_admin assigned.
    #[derive(Default)]
    struct FakeDisk {
        commands: RefCell<Vec<String>>,
        uuids: RefCell<HashMap<String, String>>,
        fail_program: Option<&'static str>,
    }

    impl CommandRunner for FakeDisk {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.commands.borrow_mut().push(spec.to_string());
            if self.fail_program == Some(spec.program.as_str()) {
                return Ok(CommandOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: "boom".to_string(),
                });
            }
            let device = spec.args.last().cloned().unwrap_or_default();
            let flag_value = |flag: &str| {
                spec.args
                    .iter()
                    .position(|arg| arg == flag)
                    .and_then(|idx| spec.args.get(idx + 1))
                    .cloned()
            };
            match spec.program.as_str() {
                "mkfs.ext4" | "mkfs.btrfs" | "xfs_admin" => {
                    if let Some(uuid) = flag_value("-U") {
                        self.uuids.borrow_mut().insert(device, uuid);
                    }
                }
                "mkfs.xfs" => {
                    self.uuids.borrow_mut().insert(device, "fresh-xfs-uuid".to_string());
                }
                "mkfs.vfat" => {
                    if let Some(id) = flag_value("-i") {
                        self.uuids
                            .borrow_mut()
                            .insert(device, format!("{}-{}", &id[..4], &id[4..]));
                    }
                }
                "blkid" => {
                    let uuid = self.uuids.borrow().get(&device).cloned().unwrap_or_default();
                    return Ok(CommandOutput::with_stdout(format!("{}\n", uuid)));
                }
                _ => {}
            }
            Ok(CommandOutput::ok())
        }
    }

    struct AllNodes;

    impl DeviceProbe for AllNodes {
        fn is_block_device(&self, _path: &Path) -> Result<bool> {
            Ok(true)
        }
        fn size_bytes(&self, _path: &Path) -> Result<u64> {
            Ok(0)
        }
        fn partition_count(&self, _path: &Path) -> Result<usize> {
            Ok(0)
        }
        fn node_exists(&self, _path: &Path) -> bool {
            true
        }
    }

    fn window() -> SettleWindow {
        SettleWindow {
            timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
        }
    }

    fn topology(fs: FilesystemType, encrypted: bool) -> PartitionTopology {
        PartitionTopology {
            efi_partition_path: PathBuf::from("/dev/sdb1"),
            root_partition_path: PathBuf::from("/dev/sdb2"),
            encrypted,
            inner_filesystem_type: fs,
            inner_filesystem_uuid: "AAAA-1111".to_string(),
            inner_filesystem_label: None,
            encryption_container_uuid: encrypted.then(|| "c0ffee00-0000-4000-8000-000000000001".to_string()),
            encryption_container_name: encrypted.then(|| "cryptroot".to_string()),
            encryption_container_version: encrypted.then_some(LuksVersion::Luks2),
            efi_volume_id: Some("7A1B-22C3".to_string()),
            esp_mount_point: PathBuf::from("boot/efi"),
        }
    }

    fn target(size: u64) -> RestoreTarget {
        RestoreTarget {
            device_path: PathBuf::from("/dev/sdb"),
            size_bytes: size,
        }
    }

    fn table() -> PartitionTableBlob {
        PartitionTableBlob {
            path: PathBuf::from("/var/tmp/reforge/staging/gpt.bin"),
            bytes: vec![1, 2, 3],
        }
    }

    fn plan_for(
        fs: FilesystemType,
        encrypted: bool,
        size: u64,
        original: Option<u64>,
    ) -> StructurePlan {
        plan_structure(&topology(fs, encrypted), &target(size), &table(), original)
    }

    #[test]
    fn uuid_round_trips_for_every_supported_type() {
        for fs in FilesystemType::SUPPORTED {
            let plan = plan_for(fs, false, 20, Some(20));
            let disk = FakeDisk::default();
            let mut executed = Vec::new();
            apply_structure(&plan, &disk, &AllNodes, window(), &mut executed).unwrap();
            assert_eq!(
                disk.uuids.borrow().get("/dev/sdb2").map(String::as_str),
                Some("AAAA-1111"),
                "{fs}"
            );
            assert_eq!(executed.len(), plan.steps.len());
        }
    }

    #[test]
    fn plain_plan_order() {
        let plan = plan_for(FilesystemType::Ext4, false, 20, Some(20));
        let rendered: Vec<String> = plan.steps.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            [
                "apply partition table: sgdisk --load-backup=/var/tmp/reforge/staging/gpt.bin /dev/sdb",
                "reread partition table: partprobe /dev/sdb",
                "settle udev: udevadm settle",
                "wait for partitions: wait for /dev/sdb1, /dev/sdb2",
                "format ESP: mkfs.vfat -F 32 -i 7A1B22C3 /dev/sdb1",
                "verify ESP volume id: expect UUID 7A1B-22C3 on /dev/sdb1",
                "create ext4: mkfs.ext4 -F -U AAAA-1111 /dev/sdb2",
                "verify ext4 UUID: expect UUID AAAA-1111 on /dev/sdb2",
            ]
        );
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn larger_target_moves_backup_header() {
        let plan = plan_for(FilesystemType::Ext4, false, 25, Some(20));
        assert_eq!(plan.steps[1].label, "move backup GPT header");
        let same = plan_for(FilesystemType::Ext4, false, 20, Some(20));
        assert!(same.steps.iter().all(|step| step.label != "move backup GPT header"));
    }

    #[test]
    fn unknown_original_size_still_moves_backup_header() {
        let plan = plan_for(FilesystemType::Ext4, false, 25, None);
        assert_eq!(
            plan.steps[1].to_string(),
            "move backup GPT header: sgdisk --move-second-header /dev/sdb"
        );
    }

    #[test]
    fn encrypted_plan_formats_inside_mapper() {
        let plan = plan_for(FilesystemType::Btrfs, true, 20, Some(20));
        let rendered: Vec<String> = plan.steps.iter().map(ToString::to_string).collect();
        assert!(rendered.contains(
            &"create LUKS container: cryptsetup luksFormat --batch-mode --verify-passphrase --type luks2 --uuid c0ffee00-0000-4000-8000-000000000001 /dev/sdb2"
                .to_string()
        ));
        assert!(rendered.contains(&"open LUKS container: cryptsetup open /dev/sdb2 cryptroot".to_string()));
        assert!(rendered.contains(&"create btrfs: mkfs.btrfs -f -U AAAA-1111 /dev/mapper/cryptroot".to_string()));
        let luks = plan
            .steps
            .iter()
            .find(|step| step.label == "create LUKS container")
            .unwrap();
        assert!(matches!(&luks.action, StepAction::Run(spec) if spec.interactive));
    }

    #[test]
    fn missing_luks_uuid_warns() {
        let mut topo = topology(FilesystemType::Ext4, true);
        topo.encryption_container_uuid = None;
        let plan = plan_structure(&topo, &target(20), &table(), Some(20));
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("fresh UUID"));
        assert!(plan
            .steps
            .iter()
            .all(|step| !step.to_string().contains("--uuid")));
    }

    #[test]
    fn failed_step_stops_the_run() {
        let plan = plan_for(FilesystemType::Xfs, false, 20, Some(20));
        let disk = FakeDisk {
            fail_program: Some("partprobe"),
            ..FakeDisk::default()
        };
        let mut executed = Vec::new();
        let err = apply_structure(&plan, &disk, &AllNodes, window(), &mut executed).unwrap_err();
        match err {
            RestoreError::StructureCreationFailed { step, reason } => {
                assert_eq!(step, "reread partition table");
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(executed.len(), 1);
        assert_eq!(disk.commands.borrow().len(), 2);
    }

    #[test]
    fn uuid_mismatch_is_reported() {
        let mut plan = plan_for(FilesystemType::Xfs, false, 20, Some(20));
        // drop the relabel so the fresh mkfs.xfs UUID survives
        plan.steps.retain(|step| step.label != "set xfs UUID");
        let mut executed = Vec::new();
        let err = apply_structure(&plan, &FakeDisk::default(), &AllNodes, window(), &mut executed)
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("fresh-xfs-uuid"));
        assert!(text.contains("AAAA-1111"));
    }
}
