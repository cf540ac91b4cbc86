//! Conversion-job wrapper binary.
//!
//! Startup is strictly two-phase. Everything that can reject the job
//! (request parsing, validation, identity resolution, output-file
//! setup) happens in the foreground, where a failure is an ordinary
//! nonzero exit with a message on standard error. Once the bootstrap
//! line has been written and the process has detached, the exit code
//! carries no information anymore; from then on the state file is the
//! only protocol.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, Config as SimpleLogConfig, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use v2v_rs::api::{BootstrapInfo, JobRequest, Secret, TransportMethod};

mod daemon;
mod error;
mod privileges;
mod progress;
mod request;
mod state;
mod supervisor;

use privileges::RunAs;
use state::StateStore;
use supervisor::SecretFiles;

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Supervises a virt-v2v conversion job")]
struct WrapperArgs {
    /// Directory for the conversion and wrapper logs.
    #[arg(long, default_value = daemon::DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Directory for the polled job state file.
    #[arg(long, default_value = daemon::DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Conversion binary to execute.
    #[arg(long, default_value = supervisor::VIRT_V2V)]
    v2v_binary: PathBuf,
}

fn main() -> ExitCode {
    let args = WrapperArgs::parse();

    // Phase 1: anything failing in here happens before the bootstrap
    // line, so the caller sees a plain error exit.
    let request = match request::load(std::io::stdin().lock()) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Invalid job request: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let run_as = match privileges::resolve(privileges::decide(&request)) {
        Ok(run_as) => run_as,
        Err(e) => {
            eprintln!("Cannot prepare subprocess identity: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let tag = daemon::job_tag();
    let (log_dir, state_dir) = match prepare_output_dirs(&args.log_dir, &args.state_dir) {
        Ok(dirs) => dirs,
        Err(e) => {
            eprintln!("Failed to prepare output directories: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let paths = daemon::output_paths(&log_dir, &state_dir, &tag);
    if let Err(e) = foreground_setup(&args, &request, &run_as, &paths, &tag) {
        eprintln!("Failed to start conversion job: {:#}", e);
        return ExitCode::FAILURE;
    }

    // Phase 2: detached (unless the request opts out). The exit code no
    // longer matters; outcomes travel through the state file.
    ExitCode::SUCCESS
}

/// Everything between a validated request and the end of the job.
///
/// Returns an error only for failures that precede the bootstrap line;
/// later failures are committed to the state file instead.
fn foreground_setup(
    args: &WrapperArgs,
    request: &JobRequest,
    run_as: &RunAs,
    paths: &BootstrapInfo,
    tag: &str,
) -> Result<()> {
    init_logging(&paths.wrapper_log, request.daemonize())?;
    info!("Job tag: {}", tag);

    let secrets = write_secret_files(request, run_as)?;

    let mut store = StateStore::new(paths.state_file.clone());
    if let Some(disks) = &request.source_disks {
        store.seed_disks(disks);
    }
    // The state file must exist before the caller learns its path.
    store
        .persist()
        .context("Writing the initial state file")?;

    daemon::emit_bootstrap(paths)?;

    // From here on the caller is reading the state file, not the exit
    // code: every failure must be committed there, including a failed
    // detach or runtime build.
    if let Err(e) = supervised_phase(args, request, run_as, paths, &mut store, &secrets) {
        error!("Conversion job failed: {:#}", e);
        commit_failure(&mut store, "Conversion job failed unexpectedly");
    }

    remove_secret_files(&secrets);
    Ok(())
}

/// Create and canonicalize the output directories. The daemon changes
/// its working directory to `/`, so the paths the bootstrap line
/// promises must be absolute.
fn prepare_output_dirs(log_dir: &Path, state_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Creating log directory {:?}", log_dir))?;
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Creating state directory {:?}", state_dir))?;
    let log_dir = log_dir
        .canonicalize()
        .with_context(|| format!("Resolving log directory {:?}", log_dir))?;
    let state_dir = state_dir
        .canonicalize()
        .with_context(|| format!("Resolving state directory {:?}", state_dir))?;
    Ok((log_dir, state_dir))
}

/// Detach, build the runtime and supervise the conversion. Runs after
/// the bootstrap line, so errors out of here never reach the caller
/// directly.
fn supervised_phase(
    args: &WrapperArgs,
    request: &JobRequest,
    run_as: &RunAs,
    paths: &BootstrapInfo,
    store: &mut StateStore,
    secrets: &SecretFiles,
) -> Result<()> {
    if request.daemonize() {
        daemon::detach()?;
    }
    let runtime = daemon::runtime()?;
    runtime.block_on(supervisor::run(
        &args.v2v_binary,
        request,
        run_as,
        &paths.v2v_log,
        store,
        secrets,
    ))?;
    Ok(())
}

/// Terminal commit for failures the supervise loop did not already
/// record itself.
fn commit_failure(store: &mut StateStore, message: &str) {
    if store.is_finished() {
        return;
    }
    store.record_error(message);
    store.finalize(None, true);
    store.persist_terminal();
}

fn init_logging(wrapper_log: &std::path::Path, daemonized: bool) -> Result<()> {
    let log_file = std::fs::File::create(wrapper_log)
        .with_context(|| format!("Creating wrapper log {:?}", wrapper_log))?;
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![WriteLogger::new(
        LevelFilter::Debug,
        SimpleLogConfig::default(),
        log_file,
    )];
    if !daemonized {
        // Foreground runs mirror the log to stderr; stdout stays
        // reserved for the bootstrap line.
        loggers.push(TermLogger::new(
            LevelFilter::Info,
            SimpleLogConfig::default(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ));
    }
    CombinedLogger::init(loggers).context("Initializing logging")?;
    Ok(())
}

/// Materialize request secrets as files owned by the subprocess
/// identity. Secrets never appear on the command line or in logs.
fn write_secret_files(request: &JobRequest, run_as: &RunAs) -> Result<SecretFiles> {
    let vmware_password = match (&request.transport_method, &request.vmware_password) {
        (TransportMethod::Vddk, Some(password)) => Some(
            write_secret_file(password, run_as).context("Writing VMware password file")?,
        ),
        _ => None,
    };
    let ssh_key = match (&request.transport_method, &request.ssh_key) {
        (TransportMethod::Ssh, Some(key)) => {
            Some(write_secret_file(key, run_as).context("Writing SSH key file")?)
        }
        _ => None,
    };
    Ok(SecretFiles {
        vmware_password,
        ssh_key,
    })
}

fn write_secret_file(secret: &Secret, run_as: &RunAs) -> Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("v2v-")
        .suffix(".secret")
        .tempfile()
        .context("Creating secret file")?;
    file.write_all(secret.0.as_bytes())
        .context("Writing secret file")?;
    file.flush().context("Flushing secret file")?;
    let (_file, path) = file.keep().map_err(|e| e.error).context("Keeping secret file")?;
    privileges::chown_to(&path, run_as)?;
    Ok(path)
}

fn remove_secret_files(secrets: &SecretFiles) {
    for path in [&secrets.vmware_password, &secrets.ssh_key]
        .into_iter()
        .flatten()
    {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove secret file {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_after_the_bootstrap_line_finalize_the_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path().join("job.state"));
        store.persist().unwrap();

        commit_failure(&mut store, "Conversion job failed unexpectedly");

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(json["finished"], true);
        assert_eq!(json["failed"], true);
        assert_eq!(
            json["last_message"]["message"],
            "Conversion job failed unexpectedly"
        );
        assert!(json.get("return_code").is_none());
    }

    #[test]
    fn an_already_finalized_state_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::new(dir.path().join("job.state"));
        store.finalize(Some(2), true);
        store.persist().unwrap();

        commit_failure(&mut store, "late failure");

        assert_eq!(store.state().return_code, Some(2));
        assert!(store.state().last_message.is_none());
    }

    #[test]
    fn output_directories_are_absolute_after_preparation() {
        let dir = tempfile::tempdir().unwrap();
        let (log_dir, state_dir) =
            prepare_output_dirs(&dir.path().join("a/../logs"), &dir.path().join("state"))
                .unwrap();
        assert!(log_dir.is_absolute());
        assert!(!log_dir
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir)));
        assert!(log_dir.ends_with("logs"));
        assert!(state_dir.is_absolute());
        assert!(state_dir.ends_with("state"));
    }
}
