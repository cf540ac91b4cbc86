//! Two-phase startup: announce the output files, then detach.
//!
//! Phase 1 runs in the foreground and communicates with the caller
//! exactly once, through a single JSON line on standard output. Phase 2
//! turns the process into a daemon (new session, stdio on /dev/null) so
//! the caller's read of standard output reliably ends after that line.
//! Everything after the fork reports through the wrapper log and the
//! state file only.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use daemonize::Daemonize;
use v2v_rs::api::BootstrapInfo;

/// Where the two log files go by default (oVirt host convention).
pub const DEFAULT_LOG_DIR: &str = "/var/log/vdsm/import";
/// Where the polled state file goes by default.
pub const DEFAULT_STATE_DIR: &str = "/tmp";

/// Unique per-job tag used in every output file name.
pub fn job_tag() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S"),
        std::process::id()
    )
}

/// Deterministically derive the three promised output paths.
pub fn output_paths(log_dir: &Path, state_dir: &Path, tag: &str) -> BootstrapInfo {
    BootstrapInfo {
        v2v_log: log_dir.join(format!("v2v-import-{}.log", tag)),
        wrapper_log: log_dir.join(format!("v2v-import-{}-wrapper.log", tag)),
        state_file: state_dir.join(format!("v2v-import-{}.state", tag)),
    }
}

/// Emit the bootstrap line and make sure it actually left the process
/// before we detach.
pub fn emit_bootstrap(info: &BootstrapInfo) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, info).context("Serializing bootstrap line")?;
    stdout.write_all(b"\n").context("Writing bootstrap line")?;
    stdout.flush().context("Flushing bootstrap line")?;
    Ok(())
}

/// Detach from the caller. The parent exits 0 in here; only the
/// daemonized child returns.
pub fn detach() -> Result<()> {
    Daemonize::new()
        .working_directory("/")
        .umask(0o000)
        .start()
        .context("Daemonizing")?;
    Ok(())
}

/// Build the tokio runtime for the supervised phase.
///
/// Constructed by hand rather than via a runtime macro: the runtime
/// must not exist before `detach()`, since worker threads do not
/// survive a fork.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Building tokio runtime")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_import_naming_scheme() {
        let paths = output_paths(
            Path::new("/var/log/vdsm/import"),
            Path::new("/tmp"),
            "20240101T120000-17",
        );
        assert_eq!(
            paths.v2v_log,
            Path::new("/var/log/vdsm/import/v2v-import-20240101T120000-17.log")
        );
        assert_eq!(
            paths.wrapper_log,
            Path::new("/var/log/vdsm/import/v2v-import-20240101T120000-17-wrapper.log")
        );
        assert_eq!(
            paths.state_file,
            Path::new("/tmp/v2v-import-20240101T120000-17.state")
        );
    }

    #[test]
    fn bootstrap_line_is_single_line_json() {
        let info = output_paths(Path::new("/logs"), Path::new("/state"), "t-1");
        let line = serde_json::to_string(&info).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(parsed.get("wrapper_log").is_some());
        assert!(parsed.get("v2v_log").is_some());
        assert!(parsed.get("state_file").is_some());
    }
}
