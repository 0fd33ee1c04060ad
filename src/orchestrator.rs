//! Composition root
//!
//! [`App`] wires the configuration store, the [`Supervisor`] and the
//! [`RelayClient`] together for the command handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{Config, ModelSpec};
use crate::error::{MlxAdminError, Result};
use crate::relay::{ChatMessage, RelayClient, RelayStream};
use crate::supervisor::{ModelStatus, StopAllReport, Supervisor};

/// Application state shared by all commands
#[derive(Debug)]
pub struct App {
    config_path: PathBuf,
    config: Config,
    supervisor: Arc<Supervisor>,
    relay: RelayClient,
}

impl App {
    /// Build the application from a loaded configuration
    pub fn new(config_path: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let supervisor = Arc::new(Supervisor::from_config(&config)?);
        Self::with_supervisor(config_path, config, supervisor)
    }

    /// Build the application around an existing supervisor
    pub fn with_supervisor(
        config_path: impl Into<PathBuf>,
        config: Config,
        supervisor: Arc<Supervisor>,
    ) -> Result<Self> {
        let relay = RelayClient::new(&config.relay)?;
        Ok(Self {
            config_path: config_path.into(),
            config,
            supervisor,
            relay,
        })
    }

    /// Effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Path of the models file
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// The supervisor
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Base URL of the server for `id`
    pub fn endpoint(&self, id: &str) -> Result<String> {
        let spec = self.supervisor.spec(id)?;
        Ok(self.config.relay.endpoint_for(spec.port))
    }

    /// Append a model to the store, persist it and reload the supervisor
    ///
    /// The store is re-read from disk first so edits made since startup are
    /// kept. Environment and CLI overrides are not written back.
    pub fn add_model(&mut self, spec: ModelSpec) -> Result<()> {
        let mut stored = if self.config_path.exists() {
            Config::from_file(&self.config_path)?
        } else {
            Config::default()
        };

        stored.add_model(spec.clone())?;
        stored.save(&self.config_path)?;

        self.supervisor.reload(stored.models.clone())?;
        self.config.models = stored.models;
        tracing::info!(id = %spec.id, port = spec.port, "added model");
        Ok(())
    }

    /// Models whose port is currently live, in configuration order
    pub async fn running_models(&self) -> Vec<ModelSpec> {
        let mut running = Vec::new();
        for spec in self.supervisor.specs().iter() {
            if matches!(self.supervisor.status(&spec.id).await, Ok(ModelStatus::Online)) {
                running.push(spec.clone());
            }
        }
        running
    }

    /// Relay a chat turn to the running server for `id`
    ///
    /// # Errors
    ///
    /// - [`MlxAdminError::UnknownModel`] if `id` is not configured
    /// - [`MlxAdminError::NotRunning`] if the model is offline
    pub async fn chat(&self, id: &str, history: &[ChatMessage]) -> Result<RelayStream> {
        let spec = self.supervisor.spec(id)?;
        if self.supervisor.status(id).await? != ModelStatus::Online {
            return Err(MlxAdminError::NotRunning(spec.id).into());
        }
        let endpoint = self.config.relay.endpoint_for(spec.port);
        Ok(self.relay.relay(&endpoint, &spec.model_ref, history))
    }

    /// Stop every model before exit
    pub async fn shutdown(&self) -> StopAllReport {
        tracing::info!("Stopping all models before exit");
        self.supervisor.stop_all().await
    }
}

/// Cancel `token` on SIGINT or SIGTERM
///
/// Cleanup happens wherever the token is awaited, in normal control flow,
/// not inside the signal handler.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received interrupt"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}
