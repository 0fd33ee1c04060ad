//! Supervision of local inference server processes
//!
//! The [`Supervisor`] owns the configured [`ModelSpec`]s and a map of the
//! processes it launched, keyed by port. That map is a cache: whether a model
//! is online is always re-derived from the OS through a [`PortHealthProbe`],
//! because servers outlive the supervisor that started them and a restarted
//! supervisor starts with an empty map.
//!
//! # Concurrency
//!
//! Start and stop for the same port are serialized by a per-port async lock,
//! so two concurrent starts cannot both pass the "not running" check. The
//! lock is held across the probe and the spawn; operations on different ports
//! never wait on each other.

pub mod probe;
pub mod process;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::config::{validate_specs, Config, ModelSpec, SupervisorConfig};
use crate::error::{MlxAdminError, Result};

use probe::{CachedProbe, LsofProbe, PortHealth, PortHealthProbe};
use process::{ProcessRecord, SignalTarget};

/// Settings the supervisor runs with
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Inference server executable
    pub server_binary: String,
    /// Directory for per-model log files
    pub logs_dir: PathBuf,
    /// Default bound for [`Supervisor::start_and_wait`]
    pub readiness_timeout: Duration,
    /// Interval between readiness probes
    pub readiness_poll: Duration,
    /// Reuse window for status probes
    pub probe_cache_ttl: Duration,
    /// Escalate to SIGKILL after this long, if set
    pub kill_after: Option<Duration>,
}

impl From<&SupervisorConfig> for SupervisorOptions {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            server_binary: config.server_binary.clone(),
            logs_dir: config.logs_dir.clone(),
            readiness_timeout: Duration::from_secs(config.readiness_timeout_seconds),
            readiness_poll: Duration::from_millis(config.readiness_poll_millis),
            probe_cache_ttl: Duration::from_millis(config.probe_cache_ttl_millis),
            kill_after: config.kill_after_seconds.map(Duration::from_secs),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

/// Displayed state of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    /// A process is listening on the model's port
    Online,
    /// Nothing is listening, or the probe could not tell
    Offline,
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelStatus::Online => write!(f, "ONLINE"),
            ModelStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// One row of the status overview
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Model id
    pub id: String,
    /// Display name
    pub name: String,
    /// Model reference served
    pub model_ref: String,
    /// Configured port
    pub port: u16,
    /// Online or offline
    pub status: ModelStatus,
    /// Listening pid when online
    pub pid: Option<u32>,
    /// Set when the probe failed; the status is then shown as offline
    pub probe_error: Option<String>,
}

/// A model that could not be stopped by [`Supervisor::stop_all`]
#[derive(Debug, Clone, Serialize)]
pub struct StopFailure {
    /// Model id
    pub id: String,
    /// Error description
    pub error: String,
}

/// Outcome of [`Supervisor::stop_all`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopAllReport {
    /// Models that were signaled
    pub stopped: Vec<String>,
    /// Models that were already offline
    pub not_running: Vec<String>,
    /// Models whose stop failed
    pub failures: Vec<StopFailure>,
}

impl StopAllReport {
    /// `true` when no stop failed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owner of the configured models and the processes serving them
#[derive(Debug)]
pub struct Supervisor {
    specs: RwLock<Arc<Vec<ModelSpec>>>,
    tracked: tokio::sync::Mutex<HashMap<u16, ProcessRecord>>,
    port_locks: Mutex<HashMap<u16, Arc<tokio::sync::Mutex<()>>>>,
    probe: Arc<dyn PortHealthProbe>,
    status_probe: CachedProbe,
    options: SupervisorOptions,
}

impl Supervisor {
    /// Build a supervisor over `specs`
    ///
    /// # Errors
    ///
    /// Returns [`MlxAdminError::Config`] if two specs share an id or a port,
    /// before anything is probed or launched.
    pub fn new(
        specs: Vec<ModelSpec>,
        probe: Arc<dyn PortHealthProbe>,
        options: SupervisorOptions,
    ) -> Result<Self> {
        validate_specs(&specs)?;
        let status_probe = CachedProbe::new(Arc::clone(&probe), options.probe_cache_ttl);

        Ok(Self {
            specs: RwLock::new(Arc::new(specs)),
            tracked: tokio::sync::Mutex::new(HashMap::new()),
            port_locks: Mutex::new(HashMap::new()),
            probe,
            status_probe,
            options,
        })
    }

    /// Build a supervisor from configuration using the `lsof` probe
    pub fn from_config(config: &Config) -> Result<Self> {
        let probe = Arc::new(LsofProbe::new(config.supervisor.lsof_binary.clone()));
        Self::new(
            config.models.clone(),
            probe,
            SupervisorOptions::from(&config.supervisor),
        )
    }

    /// Supervisor settings
    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Snapshot of the configured models
    pub fn specs(&self) -> Arc<Vec<ModelSpec>> {
        match self.specs.read() {
            Ok(specs) => Arc::clone(&specs),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Configured model by id
    ///
    /// # Errors
    ///
    /// Returns [`MlxAdminError::UnknownModel`] if `id` is not configured.
    pub fn spec(&self, id: &str) -> Result<ModelSpec> {
        self.specs()
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| MlxAdminError::UnknownModel(id.to_string()).into())
    }

    /// Replace the configured models after the store was re-read
    ///
    /// Tracked processes are kept; they are keyed by port, not by spec.
    pub fn reload(&self, specs: Vec<ModelSpec>) -> Result<()> {
        validate_specs(&specs)?;
        let count = specs.len();
        match self.specs.write() {
            Ok(mut guard) => *guard = Arc::new(specs),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(specs),
        }
        tracing::info!("Reloaded {} model specs", count);
        Ok(())
    }

    /// Log file for a model id
    pub fn log_path(&self, id: &str) -> PathBuf {
        self.options.logs_dir.join(format!("{}.log", id))
    }

    /// Three-way port health of a model, through the status cache
    pub async fn health(&self, id: &str) -> Result<PortHealth> {
        let spec = self.spec(id)?;
        self.prune_exited(spec.port).await;
        Ok(self.status_probe.probe(spec.port).await)
    }

    /// Online iff the OS reports a listener on the model's port
    pub async fn status(&self, id: &str) -> Result<ModelStatus> {
        Ok(if self.health(id).await?.is_live() {
            ModelStatus::Online
        } else {
            ModelStatus::Offline
        })
    }

    /// Status of every configured model, in configuration order
    pub async fn status_all(&self) -> Vec<StatusReport> {
        let specs = self.specs();
        let mut reports = Vec::with_capacity(specs.len());
        for spec in specs.iter() {
            self.prune_exited(spec.port).await;
            let health = self.status_probe.probe(spec.port).await;
            let probe_error = match &health {
                PortHealth::Unknown { reason } => Some(reason.clone()),
                _ => None,
            };
            reports.push(StatusReport {
                id: spec.id.clone(),
                name: spec.name.clone(),
                model_ref: spec.model_ref.clone(),
                port: spec.port,
                status: if health.is_live() {
                    ModelStatus::Online
                } else {
                    ModelStatus::Offline
                },
                pid: health.pid(),
                probe_error,
            });
        }
        reports
    }

    /// Launch the server for `id`
    ///
    /// Returns once the process is spawned; use [`Supervisor::wait_ready`]
    /// or [`Supervisor::start_and_wait`] for readiness.
    ///
    /// # Errors
    ///
    /// - [`MlxAdminError::UnknownModel`] if `id` is not configured
    /// - [`MlxAdminError::AlreadyRunning`] if the port is live, or a server
    ///   this supervisor launched for the port has not exited yet
    /// - [`MlxAdminError::ProbeUnavailable`] if the port health is unknown
    /// - [`MlxAdminError::Launch`] if the process cannot be started
    pub async fn start(&self, id: &str) -> Result<()> {
        let spec = self.spec(id)?;
        let lock = self.port_lock(spec.port);
        let _guard = lock.lock().await;

        if self.tracked_running(spec.port).await {
            return Err(MlxAdminError::AlreadyRunning(spec.id).into());
        }

        match self.probe.probe(spec.port).await {
            PortHealth::Live { pids } => {
                tracing::info!(id = %spec.id, port = spec.port, ?pids, "port already live");
                return Err(MlxAdminError::AlreadyRunning(spec.id).into());
            }
            PortHealth::Unknown { reason } => {
                return Err(MlxAdminError::ProbeUnavailable {
                    port: spec.port,
                    reason,
                }
                .into());
            }
            PortHealth::NotLive => {}
        }

        let record = process::launch(&spec, &self.options.server_binary, &self.log_path(&spec.id))?;
        self.tracked.lock().await.insert(spec.port, record);
        self.status_probe.invalidate(spec.port);
        Ok(())
    }

    /// Start `id` and wait until its port is live
    ///
    /// `timeout` defaults to the configured readiness bound.
    pub async fn start_and_wait(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        self.start(id).await?;
        self.wait_ready(id, timeout.unwrap_or(self.options.readiness_timeout))
            .await
    }

    /// Poll the probe until the port of `id` is live
    ///
    /// # Errors
    ///
    /// - [`MlxAdminError::StartTimeout`] if the port is not live in time; the
    ///   process is left running since it may still be loading weights
    /// - [`MlxAdminError::Launch`] if the tracked server exits first
    pub async fn wait_ready(&self, id: &str, timeout: Duration) -> Result<()> {
        let spec = self.spec(id)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(record) = self.take_exited(spec.port).await {
                return Err(MlxAdminError::Launch {
                    id: spec.id,
                    reason: format!(
                        "server exited before binding port {}; see {}",
                        spec.port,
                        record.log_path.display()
                    ),
                }
                .into());
            }

            match self.probe.probe(spec.port).await {
                PortHealth::Live { pids } => {
                    tracing::info!(id = %spec.id, port = spec.port, ?pids, "model is ready");
                    self.status_probe.invalidate(spec.port);
                    return Ok(());
                }
                PortHealth::Unknown { reason } => {
                    tracing::debug!(id = %spec.id, "readiness probe inconclusive: {}", reason);
                }
                PortHealth::NotLive => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(MlxAdminError::StartTimeout {
                    id: spec.id,
                    port: spec.port,
                    seconds: timeout.as_secs(),
                }
                .into());
            }
            tokio::time::sleep(self.options.readiness_poll.min(deadline - now)).await;
        }
    }

    /// Stop the server for `id`
    ///
    /// Signals the tracked process group when this supervisor launched the
    /// server; otherwise resolves the listener from the port, which covers
    /// servers launched by an earlier supervisor instance.
    ///
    /// # Errors
    ///
    /// - [`MlxAdminError::UnknownModel`] if `id` is not configured
    /// - [`MlxAdminError::NotRunning`] if nothing is serving the model
    /// - [`MlxAdminError::ProbeUnavailable`] if the port health is unknown
    /// - [`MlxAdminError::Terminate`] if the signal cannot be delivered
    pub async fn stop(&self, id: &str) -> Result<()> {
        let spec = self.spec(id)?;
        let lock = self.port_lock(spec.port);
        let _guard = lock.lock().await;

        let record = self.take_running(spec.port).await;

        let targets = match record {
            Some(mut record) => {
                // Reap concurrently so an exited leader does not linger as a
                // zombie and keep the group looking alive.
                record.reap_in_background();
                vec![SignalTarget::Group(record.pgid)]
            }
            None => match self.probe.probe(spec.port).await {
                PortHealth::NotLive => return Err(MlxAdminError::NotRunning(spec.id).into()),
                PortHealth::Unknown { reason } => {
                    return Err(MlxAdminError::ProbeUnavailable {
                        port: spec.port,
                        reason,
                    }
                    .into());
                }
                PortHealth::Live { pids } => {
                    if pids.is_empty() {
                        return Err(MlxAdminError::Terminate {
                            id: spec.id,
                            reason: format!("no pid reported for port {}", spec.port),
                        }
                        .into());
                    }
                    let mut targets = Vec::with_capacity(pids.len());
                    for pid in pids {
                        match SignalTarget::for_pid(pid) {
                            Ok(Some(target)) => {
                                if !targets.contains(&target) {
                                    targets.push(target);
                                }
                            }
                            Ok(None) => {
                                tracing::debug!(id = %spec.id, pid, "listener exited before stop");
                            }
                            Err(e) => {
                                return Err(MlxAdminError::Terminate {
                                    id: spec.id,
                                    reason: format!(
                                        "cannot resolve process group of {}: {}",
                                        pid, e
                                    ),
                                }
                                .into());
                            }
                        }
                    }
                    if targets.is_empty() {
                        tracing::info!(id = %spec.id, "listeners exited before stop");
                        self.status_probe.invalidate(spec.port);
                        return Ok(());
                    }
                    targets
                }
            },
        };

        // Signal every target even if one fails; report the first failure.
        let results = futures::future::join_all(
            targets
                .into_iter()
                .map(|target| process::terminate(target, self.options.kill_after)),
        )
        .await;
        if let Some(e) = results.into_iter().find_map(|r| r.err()) {
            self.status_probe.invalidate(spec.port);
            return Err(MlxAdminError::Terminate {
                id: spec.id,
                reason: e.to_string(),
            }
            .into());
        }

        self.status_probe.invalidate(spec.port);
        tracing::info!(id = %spec.id, port = spec.port, "stopped");
        Ok(())
    }

    /// Best-effort stop of every configured model
    ///
    /// Each model is stopped independently; a failure is recorded in the
    /// report and does not prevent the others from being stopped.
    pub async fn stop_all(&self) -> StopAllReport {
        let specs = self.specs();
        let results = futures::future::join_all(
            specs
                .iter()
                .map(|spec| async move { (spec.id.clone(), self.stop(&spec.id).await) }),
        )
        .await;

        let mut report = StopAllReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.stopped.push(id),
                Err(e) => match crate::error::kind(&e) {
                    Some(MlxAdminError::NotRunning(_)) => report.not_running.push(id),
                    _ => {
                        tracing::warn!(id = %id, "stop failed: {}", e);
                        report.failures.push(StopFailure {
                            id,
                            error: e.to_string(),
                        });
                    }
                },
            }
        }
        report
    }

    /// Last `max_lines` lines of the model's log, oldest first
    ///
    /// A model that has never been started has no log; that yields an empty
    /// list rather than an error.
    pub async fn tail_log(&self, id: &str, max_lines: usize) -> Result<Vec<String>> {
        let spec = self.spec(id)?;
        let path = self.log_path(&spec.id);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(tail_lines(tokio::io::BufReader::new(file), max_lines).await?)
    }

    fn port_lock(&self, port: u16) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.port_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(port).or_default())
    }

    /// Whether a server launched here for `port` is still running
    async fn tracked_running(&self, port: u16) -> bool {
        self.prune_exited(port).await;
        self.tracked.lock().await.contains_key(&port)
    }

    /// Drop the record for `port` if its process has exited
    async fn prune_exited(&self, port: u16) {
        if self.take_exited(port).await.is_some() {
            self.status_probe.invalidate(port);
        }
    }

    async fn take_exited(&self, port: u16) -> Option<ProcessRecord> {
        let mut tracked = self.tracked.lock().await;
        let status = tracked.get_mut(&port)?.try_exit_status()?;
        let record = tracked.remove(&port)?;
        tracing::info!(id = %record.id, port, pid = record.pid, "server exited: {}", status);
        Some(record)
    }

    async fn take_running(&self, port: u16) -> Option<ProcessRecord> {
        self.prune_exited(port).await;
        self.tracked.lock().await.remove(&port)
    }
}

/// Last `max` lines of `reader`, in their original order
///
/// Lines are streamed so only `max` of them are held at once, however long
/// the log has grown. Invalid UTF-8 is replaced.
pub(crate) async fn tail_lines<R>(mut reader: R, max: usize) -> std::io::Result<Vec<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut tail = VecDeque::with_capacity(max.min(1024));
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if max == 0 {
            continue;
        }
        if tail.len() == max {
            tail.pop_front();
        }
        let raw = line.strip_suffix(b"\n").unwrap_or(&line);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        tail.push_back(String::from_utf8_lossy(raw).into_owned());
    }
    Ok(tail.into())
}
