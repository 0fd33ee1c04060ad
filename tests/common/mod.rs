use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mlxadmin::config::ModelSpec;
use mlxadmin::supervisor::probe::{PortHealth, PortHealthProbe};
use mlxadmin::supervisor::SupervisorOptions;
use tempfile::TempDir;

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("models.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

#[allow(dead_code)]
pub fn spec(id: &str, port: u16) -> ModelSpec {
    ModelSpec {
        id: id.to_string(),
        name: id.to_uppercase(),
        model_ref: format!("mlx-community/{}", id),
        port,
        draft_model_ref: None,
        draft_token_count: None,
    }
}

/// Stand-in for the inference server
///
/// Parses `--port`, appends its pid to `launches`, waits `delay` (model
/// loading), then "binds" the port by writing `<port>.pid` into the state
/// directory. SIGTERM removes the marker. [`MarkerProbe`] reads the markers.
#[allow(dead_code)]
pub fn write_fake_server(dir: &Path, delay: &str) -> PathBuf {
    let state = dir.display();
    let script = format!(
        r#"#!/bin/sh
port=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--port" ]; then port="$2"; fi
  shift
done
echo "fake server pid $$ loading for port $port"
echo $$ >> "{state}/launches"
trap 'rm -f "{state}/$port.pid"; echo "fake server shutting down"; exit 0' TERM
sleep {delay}
echo $$ > "{state}/$port.pid"
echo "listening on $port"
while true; do sleep 1; done
"#
    );
    write_executable(dir, "fake_server.sh", &script)
}

#[allow(dead_code)]
pub fn write_executable(dir: &Path, name: &str, contents: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, contents).expect("failed to write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("failed to chmod script");
    path
}

/// Number of times the fake server was launched
#[allow(dead_code)]
pub fn launch_count(dir: &Path) -> usize {
    fs::read_to_string(dir.join("launches"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Probe that treats `<dir>/<port>.pid` of a live process as a listener
///
/// Individual ports can be pinned to a fixed answer.
#[derive(Debug)]
pub struct MarkerProbe {
    dir: PathBuf,
    overrides: Mutex<HashMap<u16, PortHealth>>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl MarkerProbe {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            overrides: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn pin(&self, port: u16, health: PortHealth) {
        self.overrides.lock().unwrap().insert(port, health);
    }

    pub fn unpin(&self, port: u16) {
        self.overrides.lock().unwrap().remove(&port);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortHealthProbe for MarkerProbe {
    async fn probe(&self, port: u16) -> PortHealth {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(health) = self.overrides.lock().unwrap().get(&port) {
            return health.clone();
        }

        let pid: Option<u32> = fs::read_to_string(self.dir.join(format!("{}.pid", port)))
            .ok()
            .and_then(|s| s.trim().parse().ok());
        match pid {
            // SAFETY: signal 0 only checks that the process exists.
            Some(pid) if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 => {
                PortHealth::Live { pids: vec![pid] }
            }
            _ => PortHealth::NotLive,
        }
    }
}

/// Fast supervisor settings pointing at `server`
#[allow(dead_code)]
pub fn options(dir: &Path, server: &Path) -> SupervisorOptions {
    SupervisorOptions {
        server_binary: server.to_string_lossy().to_string(),
        logs_dir: dir.join("logs"),
        readiness_timeout: Duration::from_secs(10),
        readiness_poll: Duration::from_millis(50),
        probe_cache_ttl: Duration::ZERO,
        kill_after: None,
    }
}

/// Poll `check` until it holds or `timeout` elapses
#[allow(dead_code)]
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
