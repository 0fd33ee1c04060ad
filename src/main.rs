//! mlxadmin - supervise local MLX inference servers
//!
#![doc = "Main entry point for the mlxadmin command-line tool."]

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use mlxadmin::cli::{Cli, Commands};
use mlxadmin::commands;
use mlxadmin::config::{Config, ModelSpec};
use mlxadmin::logging::init_logging;
use mlxadmin::orchestrator::{shutdown_signal, App};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration, then initialize logging from it
    let config = Config::load(&cli.config, &cli)?;
    init_logging(&config.logging)?;
    tracing::debug!(
        path = %cli.config,
        models = config.models.len(),
        "Loaded configuration"
    );

    // Validate configuration
    config.validate()?;

    if let Commands::List { json } = cli.command {
        return commands::list_models(&config, json);
    }
    if let Commands::Search { query, tag, json } = &cli.command {
        return commands::search_catalog(&config, query, tag, *json).await;
    }

    let mut app = App::new(&cli.config, config)?;

    match cli.command {
        Commands::Status { json } => commands::show_status(&app, json).await,
        Commands::Start {
            id,
            no_wait,
            timeout,
        } => commands::start_model(&app, &id, !no_wait, timeout).await,
        Commands::Stop { id } => commands::stop_model(&app, &id).await,
        Commands::StopAll => commands::stop_all(&app).await,
        Commands::Logs { id, lines } => commands::show_logs(&app, &id, lines).await,
        Commands::Serve { ids } => {
            tracing::info!("Starting serve mode");
            let token = CancellationToken::new();
            tokio::spawn(shutdown_signal(token.clone()));
            commands::serve::run_serve(&app, ids, token).await
        }
        Commands::Chat { id, prompt, system } => {
            tracing::info!("Starting chat with {}", id);
            commands::chat::run_chat(&app, &id, prompt, system).await
        }
        Commands::Add {
            id,
            name,
            repo_id,
            port,
            draft_model,
            num_draft_tokens,
        } => {
            let spec = ModelSpec {
                name: name.unwrap_or_else(|| id.clone()),
                id,
                model_ref: repo_id,
                port,
                draft_model_ref: draft_model,
                draft_token_count: num_draft_tokens,
            };
            commands::add_model(&mut app, spec)
        }
        Commands::List { .. } | Commands::Search { .. } => Ok(()),
    }
}
