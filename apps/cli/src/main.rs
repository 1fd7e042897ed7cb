mod config;

use anyhow::Result;
use config::{load_file_config, parse_args, resolve, Args, ArgsError, FileConfig};
use reforge_bootloader_core::FallbackOutcome;
use reforge_content::ResticStore;
use reforge_core::RestoreError;
use reforge_host_linux::{SysfsProbe, SystemRunner};
use reforge_safety::StdinConfirmer;
use reforge_workflow_engine::{run_restore, RestoreEnv, RestoreSummary};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = match parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(err) => {
            let code = err.exit_code();
            match err {
                ArgsError::Info(info) => {
                    let _ = info.print();
                }
                ArgsError::Invalid(reason) => {
                    init_logging(None);
                    error!("invalid arguments: {}", reason);
                }
            }
            return ExitCode::from(code);
        }
    };
    init_logging(args.log_level.as_deref());

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<RestoreError>() {
                Some(restore) => error!("restore failed ({}): {}", restore.kind(), restore),
                None => error!("{:#}", err),
            }
            ExitCode::from(1)
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &Args) -> Result<()> {
    let file = match &args.config {
        Some(path) => load_file_config(path)?,
        None => FileConfig::default(),
    };
    let config = resolve(args, file)?;
    let repository = config.store.repository()?;
    info!("backup store {}", repository);

    let store = ResticStore::new(repository, config.password_file.clone());
    let runner = SystemRunner;
    let probe = SysfsProbe::default();
    let confirmer = StdinConfirmer;
    let env = RestoreEnv {
        runner: &runner,
        probe: &probe,
        store: &store,
        confirmer: &confirmer,
    };

    let summary = run_restore(&config.params, &env).map_err(|err| {
        if matches!(err, RestoreError::ContentRestoreFailed { .. }) {
            warn!(
                "filesystems under {} are left mounted for inspection",
                config.params.mount_root.display()
            );
        }
        err
    })?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RestoreSummary) {
    if summary.dry_run {
        println!("dry run {}: planned steps", summary.run_id);
        for (idx, step) in summary.plan.iter().enumerate() {
            println!("{:>3}. {}", idx + 1, step);
        }
    } else {
        println!("restore {} complete, {} steps", summary.run_id, summary.steps.len());
        match &summary.fallback {
            Some(FallbackOutcome::Installed { path, .. }) => {
                println!("installed fallback loader {}", path.display())
            }
            Some(FallbackOutcome::AlreadyPresent { path }) => {
                println!("fallback loader present at {}", path.display())
            }
            _ => {}
        }
    }
    for warning in &summary.warnings {
        println!("warning: {}", warning);
    }
    if let Some(report) = &summary.report {
        println!("report: {}", report.run_json.display());
    }
}
