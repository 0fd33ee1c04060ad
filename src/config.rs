//! Configuration management for mlxadmin
//!
//! This module handles loading, parsing, validating, persisting and
//! overriding the declarative model list and the supervisor, relay,
//! logging and catalog settings.

use crate::error::{MlxAdminError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Main configuration structure for mlxadmin
///
/// The `models` list is the external declarative store the supervisor is
/// built from. Every other section is optional and defaulted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Managed models, in display order
    #[serde(default)]
    pub models: Vec<ModelSpec>,

    /// Process supervision settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Chat relay settings
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Remote model hub settings
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Declarative description of one manageable inference-server instance
///
/// Field names on disk follow the `models.yaml` layout (`repo_id`,
/// `draft_model`, `num_draft_tokens`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Stable slug, unique across all specs; also names the log file
    pub id: String,

    /// Human readable label
    pub name: String,

    /// Reference the server resolves to load weights
    #[serde(rename = "repo_id", alias = "model_ref")]
    pub model_ref: String,

    /// TCP port the server listens on; unique across all specs
    pub port: u16,

    /// Speculative-decoding assist model
    #[serde(
        rename = "draft_model",
        alias = "draft_model_ref",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub draft_model_ref: Option<String>,

    /// Number of speculative tokens; requires `draft_model_ref`
    #[serde(
        rename = "num_draft_tokens",
        alias = "draft_token_count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub draft_token_count: Option<u32>,
}

/// Process supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Inference server executable
    #[serde(default = "default_server_binary")]
    pub server_binary: String,

    /// Directory receiving one `<id>.log` per model
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// `lsof` executable used by the port probe
    #[serde(default = "default_lsof_binary")]
    pub lsof_binary: String,

    /// How long `start` waits for the port to go live (seconds)
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_seconds: u64,

    /// Interval between readiness probes (milliseconds)
    #[serde(default = "default_readiness_poll")]
    pub readiness_poll_millis: u64,

    /// Per-port probe result reuse window (milliseconds, 0 disables)
    #[serde(default = "default_probe_cache_ttl")]
    pub probe_cache_ttl_millis: u64,

    /// Escalate to SIGKILL if the group survives this long after SIGTERM
    #[serde(default)]
    pub kill_after_seconds: Option<u64>,
}

fn default_server_binary() -> String {
    "mlx_lm.server".to_string()
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_lsof_binary() -> String {
    "lsof".to_string()
}

fn default_readiness_timeout() -> u64 {
    60
}

fn default_readiness_poll() -> u64 {
    500
}

fn default_probe_cache_ttl() -> u64 {
    500
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server_binary: default_server_binary(),
            logs_dir: default_logs_dir(),
            lsof_binary: default_lsof_binary(),
            readiness_timeout_seconds: default_readiness_timeout(),
            readiness_poll_millis: default_readiness_poll(),
            probe_cache_ttl_millis: default_probe_cache_ttl(),
            kill_after_seconds: None,
        }
    }
}

/// Chat relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Scheme and host the supervised servers are reached at
    #[serde(default = "default_relay_host")]
    pub host: String,

    /// Overall bound on one streamed chat request (seconds)
    #[serde(default = "default_relay_timeout")]
    pub timeout_seconds: u64,

    /// Bound on establishing the connection (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

fn default_relay_host() -> String {
    "http://localhost".to_string()
}

fn default_relay_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            timeout_seconds: default_relay_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl RelayConfig {
    /// Base endpoint of the server listening on `port`
    pub fn endpoint_for(&self, port: u16) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), port)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json_format: bool,

    /// Also append log output to this file
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

/// Remote model hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Hub base URL
    #[serde(default = "default_catalog_url")]
    pub base_url: String,

    /// Maximum number of search results
    #[serde(default = "default_catalog_limit")]
    pub limit: usize,

    /// Request timeout (seconds)
    #[serde(default = "default_catalog_timeout")]
    pub timeout_seconds: u64,
}

fn default_catalog_url() -> String {
    "https://huggingface.co".to_string()
}

fn default_catalog_limit() -> usize {
    20
}

fn default_catalog_timeout() -> u64 {
    15
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_catalog_url(),
            limit: default_catalog_limit(),
            timeout_seconds: default_catalog_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file yields the default (empty) configuration so a fresh
    /// checkout can still run `add`.
    ///
    /// # Errors
    ///
    /// Returns [`MlxAdminError::Config`] if the file exists but cannot be
    /// read or parsed.
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    /// Parse a configuration file without applying any overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MlxAdminError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_yaml::from_str(&contents)
            .map_err(|e| MlxAdminError::Config(format!("Failed to parse config: {}", e)).into())
    }

    /// Persist the configuration back to `path`
    ///
    /// The file is written next to its destination and renamed into place so
    /// a concurrent reader never sees a half-written store.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        tracing::info!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Append a model after checking the resulting set is still valid
    ///
    /// # Errors
    ///
    /// Returns [`MlxAdminError::Config`] on a duplicate id or port, or if
    /// the new model is malformed. The configuration is left untouched.
    pub fn add_model(&mut self, spec: ModelSpec) -> Result<()> {
        let mut candidate = self.models.clone();
        candidate.push(spec);
        validate_specs(&candidate)?;
        self.models = candidate;
        Ok(())
    }

    /// Look up a model by id
    pub fn model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }

    fn apply_env_vars(&mut self) {
        if let Ok(binary) = std::env::var("MLXADMIN_SERVER_BINARY") {
            self.supervisor.server_binary = binary;
        }

        if let Ok(dir) = std::env::var("MLXADMIN_LOGS_DIR") {
            self.supervisor.logs_dir = PathBuf::from(dir);
        }

        if let Ok(lsof) = std::env::var("MLXADMIN_LSOF_BINARY") {
            self.supervisor.lsof_binary = lsof;
        }

        if let Ok(timeout) = std::env::var("MLXADMIN_READINESS_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.supervisor.readiness_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid MLXADMIN_READINESS_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(host) = std::env::var("MLXADMIN_RELAY_HOST") {
            self.relay.host = host;
        }

        if let Ok(timeout) = std::env::var("MLXADMIN_RELAY_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.relay.timeout_seconds = value;
            } else {
                tracing::warn!("Invalid MLXADMIN_RELAY_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(level) = std::env::var("MLXADMIN_LOG_LEVEL") {
            tracing::debug!(level = %level, "Env override: MLXADMIN_LOG_LEVEL");
            self.logging.level = level;
        }

        if let Ok(url) = std::env::var("MLXADMIN_CATALOG_URL") {
            self.catalog.base_url = url;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
        if let Some(dir) = &cli.logs_dir {
            self.supervisor.logs_dir = dir.clone();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`MlxAdminError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        validate_specs(&self.models)?;

        if self.supervisor.server_binary.trim().is_empty() {
            return Err(MlxAdminError::Config(
                "supervisor.server_binary cannot be empty".to_string(),
            )
            .into());
        }

        if self.supervisor.readiness_timeout_seconds == 0 {
            return Err(MlxAdminError::Config(
                "supervisor.readiness_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.supervisor.readiness_poll_millis == 0 {
            return Err(MlxAdminError::Config(
                "supervisor.readiness_poll_millis must be greater than 0".to_string(),
            )
            .into());
        }

        if self.relay.timeout_seconds == 0 {
            return Err(MlxAdminError::Config(
                "relay.timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if url::Url::parse(&self.relay.endpoint_for(1)).is_err() {
            return Err(MlxAdminError::Config(format!(
                "relay.host is not a valid URL base: {}",
                self.relay.host
            ))
            .into());
        }

        Ok(())
    }
}

const ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]*$";

/// Compiled model id pattern, built once
fn id_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(ID_PATTERN))
        .as_ref()
        .map_err(|e| MlxAdminError::Config(format!("invalid model id pattern: {}", e)).into())
}

/// Check a set of model specs for the invariants the supervisor relies on
///
/// Ids and ports must be unique, ids must be usable as file names and draft
/// token counts require a draft model.
///
/// # Errors
///
/// Returns [`MlxAdminError::Config`] describing the first violation.
pub fn validate_specs(specs: &[ModelSpec]) -> Result<()> {
    let id_pattern = id_pattern()?;
    let mut ids = HashSet::new();
    let mut ports = HashSet::new();

    for spec in specs {
        if spec.id.is_empty() {
            return Err(MlxAdminError::Config("model id cannot be empty".to_string()).into());
        }
        if !id_pattern.is_match(&spec.id) {
            return Err(MlxAdminError::Config(format!(
                "model id {:?} must contain only letters, digits, '.', '_' or '-'",
                spec.id
            ))
            .into());
        }
        if !ids.insert(spec.id.as_str()) {
            return Err(
                MlxAdminError::Config(format!("duplicate model id: {}", spec.id)).into(),
            );
        }
        if spec.name.trim().is_empty() {
            return Err(
                MlxAdminError::Config(format!("model {} has an empty name", spec.id)).into(),
            );
        }
        if spec.model_ref.trim().is_empty() {
            return Err(
                MlxAdminError::Config(format!("model {} has an empty repo_id", spec.id)).into(),
            );
        }
        if spec.port == 0 {
            return Err(MlxAdminError::Config(format!("model {} has port 0", spec.id)).into());
        }
        if !ports.insert(spec.port) {
            return Err(MlxAdminError::Config(format!(
                "duplicate port {} (model {})",
                spec.port, spec.id
            ))
            .into());
        }
        match (&spec.draft_model_ref, spec.draft_token_count) {
            (None, Some(_)) => {
                return Err(MlxAdminError::Config(format!(
                    "model {} sets num_draft_tokens without draft_model",
                    spec.id
                ))
                .into());
            }
            (Some(_), Some(0)) => {
                return Err(MlxAdminError::Config(format!(
                    "model {} sets num_draft_tokens to 0",
                    spec.id
                ))
                .into());
            }
            _ => {}
        }
    }

    Ok(())
}
