//! Spawns and owns the conversion subprocess.
//!
//! The supervise loop is the single writer of the job state: it reads
//! both output pipes, feeds the progress parser, mirrors every line
//! into the conversion log and persists snapshots on a housekeeping
//! interval. Terminal state is committed only after the subprocess has
//! exited and both pipes were drained to EOF.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use v2v_rs::api::{JobRequest, TransportMethod};

use crate::error::WrapperError;
use crate::privileges::RunAs;
use crate::progress::{Grammar, OutputParser, Stream, Update};
use crate::state::StateStore;

/// Conversion binary and its fixed VDDK library location.
pub const VIRT_V2V: &str = "/usr/bin/virt-v2v";
const VDDK_LIBDIR: &str = "/opt/vmware-vix-disklib-distrib";

/// Pipe reader capacity, shared by the scratch buffers the pipes are
/// read into.
const READER_BUF_CAPACITY: usize = 16 * 1024;

/// How often dirty state snapshots are flushed to the state file.
const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

/// Secret files handed to the subprocess out of argv.
pub struct SecretFiles {
    pub vmware_password: Option<PathBuf>,
    pub ssh_key: Option<PathBuf>,
}

/// Build the full conversion command for a request.
///
/// `agent_sock` is the ssh-agent socket for the ssh transport; secrets
/// travel via files and the environment, never argv.
pub fn build_command(
    binary: &Path,
    request: &JobRequest,
    run_as: &RunAs,
    secrets: &SecretFiles,
    agent_sock: Option<&str>,
) -> Command {
    let mut args: Vec<String> = vec![
        "-v".into(),
        "-x".into(),
        request.vm_name.clone(),
        "--root".into(),
        "first".into(),
    ];

    match request.transport_method {
        TransportMethod::Vddk => {
            args.extend([
                "-i".into(),
                "libvirt".into(),
                "-ic".into(),
                request.vmware_uri.clone().unwrap_or_default(),
                "-it".into(),
                "vddk".into(),
                "-io".into(),
                format!("vddk-libdir={}", VDDK_LIBDIR),
                "-io".into(),
                format!(
                    "vddk-thumbprint={}",
                    request.vmware_fingerprint.clone().unwrap_or_default()
                ),
            ]);
            if let Some(password_file) = &secrets.vmware_password {
                args.push("--password-file".into());
                args.push(password_file.display().to_string());
            }
        }
        TransportMethod::Ssh => {
            args.extend(["-i".into(), "vmx".into(), "-it".into(), "ssh".into()]);
        }
    }

    for mapping in request.network_mappings.iter().flatten() {
        match &mapping.mac_address {
            Some(mac) => {
                args.push("--mac".into());
                args.push(format!("{}:bridge:{}", mac, mapping.destination));
            }
            None => {
                args.push("--bridge".into());
                args.push(format!("{}:{}", mapping.source, mapping.destination));
            }
        }
    }

    args.push("-of".into());
    args.push(request.output_format.as_str().into());
    match &request.export_domain {
        Some(domain) => {
            args.extend(["-o".into(), "rhv".into(), "-os".into(), domain.clone()]);
        }
        None => {
            // No export domain: write converted disks into the local
            // data volume, one directory per disk.
            args.extend([
                "-o".into(),
                "json".into(),
                "-os".into(),
                "/data/vm".into(),
                "-oo".into(),
                "json-disks-pattern=disk%{DiskNo}/disk.img".into(),
            ]);
        }
    }

    let mut env: Vec<(String, String)> = vec![
        ("LANG".into(), "C".into()),
        // The libvirt backend cannot be used here: it breaks under the
        // dropped identity and does not pass SSH_AUTH_SOCK through to
        // qemu.
        ("LIBGUESTFS_BACKEND".into(), "direct".into()),
    ];
    if let Some(sock) = agent_sock {
        env.push(("SSH_AUTH_SOCK".into(), sock.to_string()));
    }

    log_command_safe(binary, &args, &env);

    let mut cmd = Command::new(binary);
    cmd.args(&args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    apply_identity(&mut cmd, run_as);
    cmd
}

fn apply_identity(cmd: &mut Command, run_as: &RunAs) {
    if let RunAs::User { uid, gid } = run_as {
        cmd.uid(*uid).gid(*gid);
    }
}

/// Log the command line with password-carrying values masked.
fn log_command_safe(binary: &Path, args: &[String], env: &[(String, String)]) {
    static PASSWORD_ARG: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)^([^=]*password[^=]*)=(.*)$").unwrap());
    static PASSWORD_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)password").unwrap());

    let safe_args: Vec<String> = args
        .iter()
        .map(|arg| {
            PASSWORD_ARG
                .replace(arg, "${1}=*****")
                .into_owned()
        })
        .collect();
    let safe_env: Vec<String> = env
        .iter()
        .map(|(k, v)| {
            if PASSWORD_KEY.is_match(k) {
                format!("{}=*****", k)
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect();
    info!(
        "Executing command: {:?} {:?}, environment: {:?}",
        binary, safe_args, safe_env
    );
}

/// A private ssh-agent for the ssh transport, loaded with the job's key
/// and terminated after the run.
pub struct SshAgent {
    pid: u32,
    pub sock: String,
}

impl SshAgent {
    pub async fn spawn(key_file: &Path, run_as: &RunAs) -> Result<SshAgent> {
        static SOCK_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?m)^SSH_AUTH_SOCK=([^;]+);").unwrap());
        static PID_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?m)echo Agent pid ([0-9]+);").unwrap());

        let mut cmd = Command::new("ssh-agent");
        cmd.stdin(Stdio::null());
        apply_identity(&mut cmd, run_as);
        let out = cmd.output().await.context("Spawning ssh-agent")?;
        if !out.status.success() {
            bail!(
                "ssh-agent failed with {:?}: {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr)
            );
        }
        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let sock = SOCK_RE
            .captures(&stdout)
            .map(|c| c[1].to_string())
            .context("Parsing SSH_AUTH_SOCK from ssh-agent output")?;
        let pid: u32 = PID_RE
            .captures(&stdout)
            .and_then(|c| c[1].parse().ok())
            .context("Parsing agent pid from ssh-agent output")?;
        info!("SSH agent started with PID {}", pid);
        let agent = SshAgent { pid, sock };

        let mut add = Command::new("ssh-add");
        add.arg(key_file)
            .env("SSH_AUTH_SOCK", &agent.sock)
            .stdin(Stdio::null());
        apply_identity(&mut add, run_as);
        let add_out = add.output().await.context("Spawning ssh-add")?;
        if !add_out.status.success() {
            let stderr = String::from_utf8_lossy(&add_out.stderr).into_owned();
            agent.terminate();
            bail!("Failed to add SSH key to the agent: {}", stderr);
        }
        Ok(agent)
    }

    pub fn terminate(&self) {
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            warn!("Failed to terminate ssh-agent (pid {}): {}", self.pid, e);
        }
    }
}

/// Spawn the prepared command and supervise it to completion,
/// committing terminal state before returning.
///
/// Returns the decoded return code (negative signal number for death
/// by signal, matching the state-file convention).
pub async fn run_conversion(
    mut cmd: Command,
    v2v_log: &Path,
    store: &mut StateStore,
) -> Result<i32> {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let err = WrapperError::Spawn(e);
            error!("{}", err);
            store.record_error("Failed to start virt-v2v");
            store.finalize(None, true);
            store.persist_terminal();
            return Err(err.into());
        }
    };

    // Publish the pid immediately so external actors can stop the job.
    if let Some(pid) = child.id() {
        store.mark_started(pid);
        persist_logged(store);
    }

    let stdout = child
        .stdout
        .take()
        .context("Acquiring stdout of the conversion process")?;
    let stderr = child
        .stderr
        .take()
        .context("Acquiring stderr of the conversion process")?;
    let mut stdout_reader = BufReader::with_capacity(READER_BUF_CAPACITY, stdout);
    let mut stderr_reader = BufReader::with_capacity(READER_BUF_CAPACITY, stderr);
    let mut stdout_buf = vec![0u8; READER_BUF_CAPACITY];
    let mut stderr_buf = vec![0u8; READER_BUF_CAPACITY];
    let mut stdout_closed = false;
    let mut stderr_closed = false;

    let mut log_writer = BufWriter::new(
        tokio::fs::File::create(v2v_log)
            .await
            .with_context(|| format!("Creating conversion log {:?}", v2v_log))?,
    );

    let mut parser = OutputParser::new(Grammar::virt_v2v());
    let mut persist_tick = tokio::time::interval(PERSIST_INTERVAL);
    let mut dirty = false;
    let mut fatal_seen = false;

    enum ReadRes {
        Data(Stream, Vec<u8>),
        Closed(Stream),
        ReadError(Stream, std::io::Error),
        Tick,
    }

    while !(stdout_closed && stderr_closed) {
        let res = tokio::select! {
            read_res = stdout_reader.read(&mut stdout_buf), if !stdout_closed => {
                match read_res {
                    Ok(0) => ReadRes::Closed(Stream::Stdout),
                    Ok(n) => ReadRes::Data(Stream::Stdout, stdout_buf[..n].to_vec()),
                    Err(e) => ReadRes::ReadError(Stream::Stdout, e),
                }
            }

            read_res = stderr_reader.read(&mut stderr_buf), if !stderr_closed => {
                match read_res {
                    Ok(0) => ReadRes::Closed(Stream::Stderr),
                    Ok(n) => ReadRes::Data(Stream::Stderr, stderr_buf[..n].to_vec()),
                    Err(e) => ReadRes::ReadError(Stream::Stderr, e),
                }
            }

            _ = persist_tick.tick() => ReadRes::Tick,
        };

        match res {
            ReadRes::Data(stream, data) => {
                for parsed in parser.feed(stream, &data) {
                    log_writer.write_all(parsed.raw.as_bytes()).await.ok();
                    log_writer.write_all(b"\n").await.ok();
                    if let Some(update) = parsed.update {
                        fatal_seen |= apply_update(store, update);
                        dirty = true;
                    }
                }
            }
            ReadRes::Closed(stream) => match stream {
                Stream::Stdout => stdout_closed = true,
                Stream::Stderr => stderr_closed = true,
            },
            ReadRes::ReadError(stream, e) => {
                warn!("Error reading conversion process {:?}: {}", stream, e);
                match stream {
                    Stream::Stdout => stdout_closed = true,
                    Stream::Stderr => stderr_closed = true,
                }
            }
            ReadRes::Tick => {
                if dirty {
                    persist_logged(store);
                    dirty = false;
                }
                log_writer.flush().await.ok();
            }
        }
    }

    // Both pipes hit EOF; drain the parser's partial-line buffers
    // before looking at the exit status.
    for parsed in parser.finish() {
        log_writer.write_all(parsed.raw.as_bytes()).await.ok();
        log_writer.write_all(b"\n").await.ok();
        if let Some(update) = parsed.update {
            fatal_seen |= apply_update(store, update);
        }
    }
    log_writer.flush().await.ok();

    let status = child
        .wait()
        .await
        .context("Waiting for the conversion process")?;
    let return_code = decode_status(status);
    info!("virt-v2v terminated with return code {}", return_code);

    let failed = return_code != 0 || fatal_seen;
    if failed && return_code != 0 {
        store.record_error(&format!(
            "virt-v2v terminated with return code {}",
            return_code
        ));
    }
    store.finalize(Some(return_code), failed);
    store.persist_terminal();
    Ok(return_code)
}

/// Glue for a full request: ssh-agent setup, command building, and the
/// supervise loop.
pub async fn run(
    binary: &Path,
    request: &JobRequest,
    run_as: &RunAs,
    v2v_log: &Path,
    store: &mut StateStore,
    secrets: &SecretFiles,
) -> Result<i32> {
    let agent = match (&request.transport_method, &secrets.ssh_key) {
        (TransportMethod::Ssh, Some(key_file)) => {
            Some(SshAgent::spawn(key_file, run_as).await?)
        }
        _ => None,
    };

    let cmd = build_command(
        binary,
        request,
        run_as,
        secrets,
        agent.as_ref().map(|a| a.sock.as_str()),
    );
    let result = run_conversion(cmd, v2v_log, store).await;

    if let Some(agent) = agent {
        agent.terminate();
    }
    result
}

/// Map an update onto the store; returns true for fatal markers.
fn apply_update(store: &mut StateStore, update: Update) -> bool {
    match update {
        Update::CopyDisk { index, total } => {
            info!("Copying disk {}/{}", index, total);
            store.set_disk_count(total);
            false
        }
        Update::DiskPath { path } => {
            info!("Copying path: {}", path);
            store.touch_disk(&path);
            false
        }
        Update::Progress { path, percent } => {
            debug!("Updated progress: {} ({})", percent, path);
            store.set_progress(&path, percent);
            false
        }
        Update::FatalError { message } => {
            error!("virt-v2v error: {}", message);
            store.record_error(&message);
            true
        }
    }
}

/// Negative signal number for death by signal, exit code otherwise.
fn decode_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(1),
    }
}

fn persist_logged(store: &StateStore) {
    if let Err(e) = store.persist() {
        // A single failed write is survivable; the next successful one
        // restores poller visibility.
        error!("{}", e);
    }
}
