//! Launching and terminating inference server processes
//!
//! Each server is started in its own session (and therefore its own process
//! group) with stdout and stderr redirected into a truncated per-model log
//! file. Termination signals the whole group so helper workers forked by the
//! server exit with it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};

use crate::config::ModelSpec;
use crate::error::{MlxAdminError, Result};

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One launched server, owned by the supervisor while it is tracked
#[derive(Debug)]
pub struct ProcessRecord {
    /// Model id the process serves
    pub id: String,
    /// Port the process was told to bind
    pub port: u16,
    /// OS process id of the server
    pub pid: u32,
    /// Process group id; equal to `pid` because the server leads its session
    pub pgid: i32,
    /// Combined stdout/stderr destination
    pub log_path: PathBuf,
    /// When the process was launched
    pub started_at: DateTime<Utc>,
    child: Option<Child>,
}

impl ProcessRecord {
    /// Non-blocking check for an exited child
    ///
    /// Returns the exit status once the server has exited. A record without
    /// a child handle never reports an exit.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(id = %self.id, "try_wait failed: {}", e);
                None
            }
        }
    }

    /// Wait for the child to exit in the background so it never lingers as
    /// a zombie after being signaled.
    pub(crate) fn reap_in_background(&mut self) {
        if let Some(mut child) = self.child.take() {
            let id = self.id.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => tracing::debug!(id = %id, "server exited: {}", status),
                    Err(e) => tracing::debug!(id = %id, "failed to reap server: {}", e),
                }
            });
        }
    }

    /// Take the child handle, leaving the record without one
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }
}

/// Command line arguments for the inference server
///
/// # Examples
///
/// ```
/// use mlxadmin::config::ModelSpec;
/// use mlxadmin::supervisor::process::build_server_args;
///
/// let spec = ModelSpec {
///     id: "qwen".to_string(),
///     name: "Qwen".to_string(),
///     model_ref: "mlx-community/Qwen".to_string(),
///     port: 9000,
///     draft_model_ref: None,
///     draft_token_count: None,
/// };
/// assert_eq!(
///     build_server_args(&spec),
///     vec!["--model", "mlx-community/Qwen", "--port", "9000"]
/// );
/// ```
pub fn build_server_args(spec: &ModelSpec) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        spec.model_ref.clone(),
        "--port".to_string(),
        spec.port.to_string(),
    ];
    if let Some(draft) = &spec.draft_model_ref {
        args.push("--draft-model".to_string());
        args.push(draft.clone());
        if let Some(count) = spec.draft_token_count {
            args.push("--num-draft-tokens".to_string());
            args.push(count.to_string());
        }
    }
    args
}

/// Launch the server for `spec`, logging to `log_path`
///
/// The log file (and its directory) is created, truncating any previous
/// run's output. The call returns as soon as the process is spawned; it does
/// not wait for the server to bind its port.
///
/// # Errors
///
/// Returns [`MlxAdminError::Launch`] if the log file cannot be created or the
/// binary cannot be executed. Nothing is left running in either case.
pub fn launch(spec: &ModelSpec, binary: &str, log_path: &Path) -> Result<ProcessRecord> {
    let launch_err = |reason: String| MlxAdminError::Launch {
        id: spec.id.clone(),
        reason,
    };

    if let Some(dir) = log_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| {
            launch_err(format!("cannot create log directory {}: {}", dir.display(), e))
        })?;
    }

    let stdout_log = File::create(log_path)
        .map_err(|e| launch_err(format!("cannot create {}: {}", log_path.display(), e)))?;
    let stderr_log = stdout_log
        .try_clone()
        .map_err(|e| launch_err(format!("cannot share {}: {}", log_path.display(), e)))?;

    let args = build_server_args(spec);
    let mut cmd = Command::new(binary);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_log))
        .stderr(Stdio::from(stderr_log));

    #[cfg(unix)]
    {
        // SAFETY: setsid is async-signal-safe and is the only call made
        // between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = cmd
        .spawn()
        .map_err(|e| launch_err(format!("cannot execute `{}`: {}", binary, e)))?;
    let pid = child
        .id()
        .ok_or_else(|| launch_err("process exited before its pid was read".to_string()))?;

    tracing::info!(
        id = %spec.id,
        port = spec.port,
        pid,
        log = %log_path.display(),
        "launched {} {}",
        binary,
        args.join(" ")
    );

    Ok(ProcessRecord {
        id: spec.id.clone(),
        port: spec.port,
        pid,
        pgid: pid as i32,
        log_path: log_path.to_path_buf(),
        started_at: Utc::now(),
        child: Some(child),
    })
}

/// What a termination signal is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    /// Every process in the group
    Group(i32),
    /// A single process
    Process(i32),
}

impl SignalTarget {
    /// Pick the target for a pid discovered through the port probe
    ///
    /// A process whose group leads its session (how this tool launches
    /// servers, workers included) is signaled as that whole group. Anything
    /// else, such as a job in the operator's interactive shell, is signaled
    /// alone. Our own group is never targeted.
    pub fn for_pid(pid: u32) -> std::io::Result<Option<Self>> {
        let pid = pid as i32;
        let Some(pgid) = group_of(pid)? else {
            return Ok(None);
        };
        let Some(sid) = session_of(pid)? else {
            return Ok(None);
        };
        if sid == pgid && Some(pgid) != own_group() {
            Ok(Some(SignalTarget::Group(pgid)))
        } else {
            Ok(Some(SignalTarget::Process(pid)))
        }
    }
}

#[cfg(unix)]
fn own_group() -> Option<i32> {
    // SAFETY: getpgrp has no preconditions and cannot fail.
    Some(unsafe { libc::getpgrp() })
}

#[cfg(not(unix))]
fn own_group() -> Option<i32> {
    None
}

/// Process group of `pid`, or `None` if the process no longer exists
#[cfg(unix)]
pub fn group_of(pid: i32) -> std::io::Result<Option<i32>> {
    // SAFETY: getpgid only reads kernel state for the given pid.
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid >= 0 {
        return Ok(Some(pgid));
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(None)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn group_of(_pid: i32) -> std::io::Result<Option<i32>> {
    Err(unsupported())
}

/// Session of `pid`, or `None` if the process no longer exists
#[cfg(unix)]
pub fn session_of(pid: i32) -> std::io::Result<Option<i32>> {
    // SAFETY: getsid only reads kernel state for the given pid.
    let sid = unsafe { libc::getsid(pid as libc::pid_t) };
    if sid >= 0 {
        return Ok(Some(sid));
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(None)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn session_of(_pid: i32) -> std::io::Result<Option<i32>> {
    Err(unsupported())
}

/// Send `signal` to `target`; `Ok(false)` if nothing by that id exists
#[cfg(unix)]
fn send_signal(target: SignalTarget, signal: libc::c_int) -> std::io::Result<bool> {
    let raw = match target {
        SignalTarget::Group(pgid) | SignalTarget::Process(pgid) if pgid <= 1 => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("refusing to signal id {}", pgid),
            ));
        }
        SignalTarget::Group(pgid) => -pgid,
        SignalTarget::Process(pid) => pid,
    };

    // SAFETY: kill(2) only delivers a signal; raw is never 0, -1 or 1.
    if unsafe { libc::kill(raw as libc::pid_t, signal) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Whether any process still answers to `target`
#[cfg(unix)]
pub fn is_alive(target: SignalTarget) -> bool {
    matches!(send_signal(target, 0), Ok(true))
}

#[cfg(not(unix))]
pub fn is_alive(_target: SignalTarget) -> bool {
    false
}

/// Ask `target` to shut down with SIGTERM
///
/// Terminating something that has already exited is not an error. Without
/// `kill_after` the call returns as soon as the signal is delivered; with it,
/// the call waits up to that long and then sends SIGKILL to whatever is left.
#[cfg(unix)]
pub async fn terminate(target: SignalTarget, kill_after: Option<Duration>) -> std::io::Result<()> {
    if !send_signal(target, libc::SIGTERM)? {
        tracing::debug!(?target, "nothing to terminate, already exited");
        return Ok(());
    }
    tracing::info!(?target, "sent SIGTERM");

    let Some(grace) = kill_after else {
        return Ok(());
    };

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(target) {
            return Ok(());
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL).await;
    }

    if send_signal(target, libc::SIGKILL)? {
        tracing::warn!(?target, "still running after {:?}, sent SIGKILL", grace);
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn terminate(
    _target: SignalTarget,
    _kill_after: Option<Duration>,
) -> std::io::Result<()> {
    Err(unsupported())
}

#[cfg(not(unix))]
fn unsupported() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are only supported on unix",
    )
}
