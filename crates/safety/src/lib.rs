use anyhow::{Context, Result};
use reforge_core::{CapturedSnapshot, RestoreError, RestoreTarget, UnsafeReason};
use reforge_host_linux::DeviceProbe;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::{info, warn};

/// Exact text the operator must type before the target is touched.
pub fn confirmation_literal(target: &Path) -> String {
    format!("YES, ERASE {}", target.display())
}

/// Source of the operator's single confirmation line.
pub trait Confirmer {
    /// Shows `expected` to the operator and returns the line they typed.
    fn confirm(&self, expected: &str) -> Result<String>;
}

/// Prompts on stderr and reads one line from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, expected: &str) -> Result<String> {
        let mut stderr = io::stderr();
        writeln!(stderr, "All data on the target will be destroyed.")?;
        write!(stderr, "Type `{}` to continue: ", expected)?;
        stderr.flush()?;
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("read confirmation")?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SafetyContext<'a> {
    pub target: &'a Path,
    /// Original disk size; `None` for captures that predate the size record.
    pub required_bytes: Option<u64>,
    /// Dry runs never prompt.
    pub skip_confirmation: bool,
}

impl<'a> SafetyContext<'a> {
    pub fn for_snapshot(target: &'a Path, snapshot: &CapturedSnapshot) -> Self {
        Self {
            target,
            required_bytes: snapshot.original_size_bytes,
            skip_confirmation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow {
        target: RestoreTarget,
        warnings: Vec<String>,
    },
    Deny(UnsafeReason),
}

/// Runs the checks in order and stops at the first refusal. Nothing here
/// writes to the device.
pub fn evaluate_target(
    ctx: &SafetyContext<'_>,
    probe: &dyn DeviceProbe,
    confirmer: &dyn Confirmer,
) -> SafetyDecision {
    let probe_failed = |err: anyhow::Error| {
        SafetyDecision::Deny(UnsafeReason::ProbeFailed {
            detail: format!("{:#}", err),
        })
    };

    match probe.is_block_device(ctx.target) {
        Ok(true) => {}
        Ok(false) => return SafetyDecision::Deny(UnsafeReason::NotBlockDevice),
        Err(err) => return probe_failed(err),
    }

    if !ctx.skip_confirmation {
        let expected = confirmation_literal(ctx.target);
        match confirmer.confirm(&expected) {
            Ok(typed) if typed == expected => {}
            Ok(_) => return SafetyDecision::Deny(UnsafeReason::ConfirmationMismatch),
            Err(err) => {
                warn!("confirmation could not be read: {:#}", err);
                return SafetyDecision::Deny(UnsafeReason::ConfirmationMismatch);
            }
        }
    }

    match probe.partition_count(ctx.target) {
        Ok(0) => {}
        Ok(count) => return SafetyDecision::Deny(UnsafeReason::ExistingPartitions { count }),
        Err(err) => return probe_failed(err),
    }

    let size_bytes = match probe.size_bytes(ctx.target) {
        Ok(size) => size,
        Err(err) => return probe_failed(err),
    };

    let mut warnings = Vec::new();
    match ctx.required_bytes {
        Some(required) if size_bytes < required => {
            return SafetyDecision::Deny(UnsafeReason::TooSmall {
                target_bytes: size_bytes,
                required_bytes: required,
            })
        }
        Some(_) => {}
        None => {
            let message = format!(
                "original disk size was not captured; skipping size check for {}",
                ctx.target.display()
            );
            warn!("{}", message);
            warnings.push(message);
        }
    }

    SafetyDecision::Allow {
        target: RestoreTarget {
            device_path: ctx.target.to_path_buf(),
            size_bytes,
        },
        warnings,
    }
}

/// [`evaluate_target`] folded into the restore error taxonomy.
pub fn check_target(
    ctx: &SafetyContext<'_>,
    probe: &dyn DeviceProbe,
    confirmer: &dyn Confirmer,
) -> Result<(RestoreTarget, Vec<String>), RestoreError> {
    match evaluate_target(ctx, probe, confirmer) {
        SafetyDecision::Allow { target, warnings } => {
            info!(
                "target {} accepted ({} bytes)",
                target.device_path.display(),
                target.size_bytes
            );
            Ok((target, warnings))
        }
        SafetyDecision::Deny(reason) => Err(RestoreError::unsafe_target(ctx.target, reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::cell::Cell;

    struct Disk {
        block: bool,
        size: u64,
        partitions: usize,
    }

    impl DeviceProbe for Disk {
        fn is_block_device(&self, _path: &Path) -> Result<bool> {
            Ok(self.block)
        }
        fn size_bytes(&self, _path: &Path) -> Result<u64> {
            Ok(self.size)
        }
        fn partition_count(&self, _path: &Path) -> Result<usize> {
            Ok(self.partitions)
        }
        fn node_exists(&self, _path: &Path) -> bool {
            true
        }
    }

    struct Typed {
        line: String,
        asked: Cell<usize>,
    }

    impl Typed {
        fn new(line: &str) -> Self {
            Self {
                line: line.to_string(),
                asked: Cell::new(0),
            }
        }
    }

    impl Confirmer for Typed {
        fn confirm(&self, _expected: &str) -> Result<String> {
            self.asked.set(self.asked.get() + 1);
            Ok(self.line.clone())
        }
    }

    struct ClosedStdin;

    impl Confirmer for ClosedStdin {
        fn confirm(&self, _expected: &str) -> Result<String> {
            Err(anyhow!("stdin closed"))
        }
    }

    const GB: u64 = 1_000_000_000;

    fn ctx(required: Option<u64>) -> SafetyContext<'static> {
        SafetyContext {
            target: Path::new("/dev/sdb"),
            required_bytes: required,
            skip_confirmation: false,
        }
    }

    fn disk(size: u64, partitions: usize) -> Disk {
        Disk {
            block: true,
            size,
            partitions,
        }
    }

    #[test]
    fn literal_names_the_target() {
        assert_eq!(confirmation_literal(Path::new("/dev/sdb")), "YES, ERASE /dev/sdb");
    }

    #[test]
    fn accepts_empty_large_enough_disk() {
        let typed = Typed::new("YES, ERASE /dev/sdb");
        match evaluate_target(&ctx(Some(20 * GB)), &disk(25 * GB, 0), &typed) {
            SafetyDecision::Allow { target, warnings } => {
                assert_eq!(target.size_bytes, 25 * GB);
                assert!(warnings.is_empty());
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn rejects_partitioned_disk_regardless_of_size() {
        let typed = Typed::new("YES, ERASE /dev/sdb");
        let decision = evaluate_target(&ctx(Some(GB)), &disk(100 * GB, 1), &typed);
        assert_eq!(
            decision,
            SafetyDecision::Deny(UnsafeReason::ExistingPartitions { count: 1 })
        );
    }

    #[test]
    fn rejects_smaller_disk_regardless_of_partitions() {
        let typed = Typed::new("YES, ERASE /dev/sdb");
        let decision = evaluate_target(&ctx(Some(20 * GB)), &disk(10 * GB, 0), &typed);
        assert_eq!(
            decision,
            SafetyDecision::Deny(UnsafeReason::TooSmall {
                target_bytes: 10 * GB,
                required_bytes: 20 * GB
            })
        );
    }

    #[test]
    fn confirmation_must_match_exactly() {
        for line in ["yes, erase /dev/sdb", "YES, ERASE /dev/sdb ", "YES", ""] {
            let typed = Typed::new(line);
            let decision = evaluate_target(&ctx(Some(GB)), &disk(2 * GB, 0), &typed);
            assert_eq!(decision, SafetyDecision::Deny(UnsafeReason::ConfirmationMismatch));
            assert_eq!(typed.asked.get(), 1);
        }
        let decision = evaluate_target(&ctx(Some(GB)), &disk(2 * GB, 0), &ClosedStdin);
        assert_eq!(decision, SafetyDecision::Deny(UnsafeReason::ConfirmationMismatch));
    }

    #[test]
    fn non_block_device_is_refused_before_prompting() {
        let typed = Typed::new("YES, ERASE /dev/sdb");
        let probe = Disk {
            block: false,
            size: 100 * GB,
            partitions: 0,
        };
        let decision = evaluate_target(&ctx(None), &probe, &typed);
        assert_eq!(decision, SafetyDecision::Deny(UnsafeReason::NotBlockDevice));
        assert_eq!(typed.asked.get(), 0);
    }

    #[test]
    fn missing_size_record_only_warns() {
        let typed = Typed::new("YES, ERASE /dev/sdb");
        match evaluate_target(&ctx(None), &disk(GB, 0), &typed) {
            SafetyDecision::Allow { warnings, .. } => {
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].contains("size"));
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn dry_run_skips_prompt_but_keeps_checks() {
        let typed = Typed::new("");
        let mut context = ctx(Some(20 * GB));
        context.skip_confirmation = true;
        assert!(matches!(
            evaluate_target(&context, &disk(25 * GB, 0), &typed),
            SafetyDecision::Allow { .. }
        ));
        assert_eq!(
            evaluate_target(&context, &disk(25 * GB, 2), &typed),
            SafetyDecision::Deny(UnsafeReason::ExistingPartitions { count: 2 })
        );
        assert_eq!(typed.asked.get(), 0);
    }

    #[test]
    fn check_target_maps_to_unsafe_target() {
        let typed = Typed::new("no");
        let err = check_target(&ctx(None), &disk(GB, 0), &typed).unwrap_err();
        assert_eq!(err.kind(), "unsafe_target");
        assert!(err.to_string().contains("/dev/sdb"));
    }
}
