//! Port health probing
//!
//! Liveness of a managed model is derived from the operating system, not from
//! supervisor bookkeeping: a model is online iff some process owns a listening
//! socket on its port. This keeps status correct across supervisor restarts,
//! at the cost of an OS query per lookup. [`CachedProbe`] rate-limits those
//! queries for status rendering.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

/// Result of asking the OS who owns a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortHealth {
    /// At least one process is listening; pids of the owners
    Live {
        /// Listening process ids, in the order the OS reported them
        pids: Vec<u32>,
    },
    /// Nothing is listening on the port
    NotLive,
    /// The OS query itself failed
    Unknown {
        /// Diagnostic for the operator
        reason: String,
    },
}

impl PortHealth {
    /// `true` only for [`PortHealth::Live`]; unknown counts as not live
    pub fn is_live(&self) -> bool {
        matches!(self, PortHealth::Live { .. })
    }

    /// First listening pid, if any
    pub fn pid(&self) -> Option<u32> {
        match self {
            PortHealth::Live { pids } => pids.first().copied(),
            _ => None,
        }
    }
}

/// Capability to determine whether a TCP port has a listening process
///
/// Implementations may shell out, use native APIs or read a proc filesystem;
/// callers only rely on the three-way [`PortHealth`] contract.
#[async_trait]
pub trait PortHealthProbe: Send + Sync + std::fmt::Debug {
    /// Query the current owner(s) of `port`
    async fn probe(&self, port: u16) -> PortHealth;
}

/// Probe backed by `lsof -nP -t -iTCP:<port> -sTCP:LISTEN`
#[derive(Debug, Clone)]
pub struct LsofProbe {
    binary: String,
}

impl LsofProbe {
    /// Create a probe invoking the given `lsof` executable
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for LsofProbe {
    fn default() -> Self {
        Self::new("lsof")
    }
}

#[async_trait]
impl PortHealthProbe for LsofProbe {
    async fn probe(&self, port: u16) -> PortHealth {
        let output = Command::new(&self.binary)
            .arg("-nP")
            .arg("-t")
            .arg(format!("-iTCP:{}", port))
            .arg("-sTCP:LISTEN")
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) => {
                let health = parse_lsof_output(
                    out.status.success(),
                    &String::from_utf8_lossy(&out.stdout),
                    &String::from_utf8_lossy(&out.stderr),
                );
                if let PortHealth::Unknown { reason } = &health {
                    tracing::warn!(port, "lsof probe failed: {}", reason);
                }
                health
            }
            Err(e) => {
                tracing::warn!(port, binary = %self.binary, "failed to run lsof: {}", e);
                PortHealth::Unknown {
                    reason: format!("failed to run {}: {}", self.binary, e),
                }
            }
        }
    }
}

/// Interpret the output of `lsof -t`
///
/// `lsof` exits non-zero both when nothing matched and when it failed; only
/// the presence of diagnostics on stderr tells the two apart.
pub(crate) fn parse_lsof_output(success: bool, stdout: &str, stderr: &str) -> PortHealth {
    let pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();

    if !pids.is_empty() {
        return PortHealth::Live { pids };
    }

    let stderr = stderr.trim();
    if success || stderr.is_empty() {
        PortHealth::NotLive
    } else {
        PortHealth::Unknown {
            reason: stderr.to_string(),
        }
    }
}

/// Short-TTL cache in front of another probe
///
/// Only definite answers are cached; [`PortHealth::Unknown`] always goes back
/// to the inner probe. The supervisor invalidates a port whenever it starts or
/// stops something there.
#[derive(Debug)]
pub struct CachedProbe {
    inner: Arc<dyn PortHealthProbe>,
    ttl: Duration,
    entries: Mutex<HashMap<u16, (PortHealth, Instant)>>,
}

impl CachedProbe {
    /// Wrap `inner`, reusing answers for `ttl`
    pub fn new(inner: Arc<dyn PortHealthProbe>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Forget the cached answer for `port`
    pub fn invalidate(&self, port: u16) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&port);
        }
    }

    fn cached(&self, port: u16) -> Option<PortHealth> {
        let entries = self.entries.lock().ok()?;
        let (health, at) = entries.get(&port)?;
        if at.elapsed() < self.ttl {
            Some(health.clone())
        } else {
            None
        }
    }
}

#[async_trait]
impl PortHealthProbe for CachedProbe {
    async fn probe(&self, port: u16) -> PortHealth {
        if let Some(health) = self.cached(port) {
            tracing::trace!(port, "using cached port health");
            return health;
        }

        let health = self.inner.probe(port).await;
        if !self.ttl.is_zero() && !matches!(health, PortHealth::Unknown { .. }) {
            if let Ok(mut entries) = self.entries.lock() {
                entries.insert(port, (health.clone(), Instant::now()));
            }
        }
        health
    }
}
