//! mlxadmin - supervisor and streaming chat relay for local MLX inference servers
//!
//! This library runs one inference server process per configured model,
//! derives their health from the operating system and relays streamed chat
//! completions to whichever of them is running.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `supervisor`: Process launch and termination, port health probing, the `Supervisor`
//! - `relay`: Streaming chat completion client and event-stream decoding
//! - `orchestrator`: Composition root and shutdown signal handling
//! - `catalog`: Remote model hub search
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use mlxadmin::{Config, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("models.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let supervisor = Supervisor::from_config(&config)?;
//!     for report in supervisor.status_all().await {
//!         println!("{} {}", report.id, report.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod relay;
pub mod supervisor;

// Re-export commonly used types
pub use config::{Config, ModelSpec};
pub use error::{MlxAdminError, RelayFailure, Result};
pub use orchestrator::App;
pub use relay::{ChatMessage, RelayClient, RelayEvent};
pub use supervisor::{ModelStatus, Supervisor};

#[cfg(test)]
pub mod test_utils;
