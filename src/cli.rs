//! Command-line interface definition for mlxadmin
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to supervise model servers and chat with them.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// mlxadmin - supervise local MLX inference servers
///
/// Start, stop and inspect one `mlx_lm.server` process per configured
/// model, and chat with whichever of them is running.
#[derive(Parser, Debug, Clone)]
#[command(name = "mlxadmin")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the models file
    #[arg(short, long, env = "MLXADMIN_CONFIG", default_value = "models.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the directory for per-model server logs
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for mlxadmin
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List configured models
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show which models are online
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start the server for a model
    Start {
        /// Model id
        id: String,

        /// Return once the process is spawned instead of waiting for its port
        #[arg(long)]
        no_wait: bool,

        /// Readiness timeout in seconds (defaults to the configured value)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Stop the server for a model
    Stop {
        /// Model id
        id: String,
    },

    /// Stop every configured model
    StopAll,

    /// Show the tail of a model's server log
    Logs {
        /// Model id
        id: String,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },

    /// Start models and keep them running until interrupted
    ///
    /// On SIGINT or SIGTERM every configured model is stopped before exit.
    Serve {
        /// Model ids to start; all configured models when omitted
        ids: Vec<String>,
    },

    /// Chat with a running model
    Chat {
        /// Model id
        id: String,

        /// Send a single prompt and exit instead of starting a session
        #[arg(short, long)]
        prompt: Option<String>,

        /// System prompt placed at the start of the conversation
        #[arg(short, long)]
        system: Option<String>,
    },

    /// Add a model to the models file
    Add {
        /// Model id (letters, digits, '.', '_' or '-')
        #[arg(long)]
        id: String,

        /// Display name (defaults to the id)
        #[arg(long)]
        name: Option<String>,

        /// Hub repository or local path of the weights
        #[arg(long)]
        repo_id: String,

        /// Port the server listens on
        #[arg(long)]
        port: u16,

        /// Draft model for speculative decoding
        #[arg(long)]
        draft_model: Option<String>,

        /// Number of speculative tokens (requires --draft-model)
        #[arg(long, requires = "draft_model")]
        num_draft_tokens: Option<u32>,
    },

    /// Search the model hub for candidate repositories
    Search {
        /// Search text
        query: String,

        /// Restrict results to this tag
        #[arg(long, default_value = "mlx")]
        tag: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: "models.yaml".to_string(),
            verbose: false,
            logs_dir: None,
            command: Commands::List { json: false },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default() {
        let cli = Cli::default();
        assert_eq!(cli.config, "models.yaml");
        assert!(!cli.verbose);
        assert!(cli.logs_dir.is_none());
        assert!(matches!(cli.command, Commands::List { json: false }));
    }

    #[test]
    fn test_cli_parse_start() {
        let cli = Cli::try_parse_from(["mlxadmin", "start", "qwen"]).unwrap();
        if let Commands::Start {
            id,
            no_wait,
            timeout,
        } = cli.command
        {
            assert_eq!(id, "qwen");
            assert!(!no_wait);
            assert_eq!(timeout, None);
        } else {
            panic!("Expected Start command");
        }
    }

    #[test]
    fn test_cli_parse_start_no_wait_with_timeout() {
        let cli =
            Cli::try_parse_from(["mlxadmin", "start", "qwen", "--no-wait", "--timeout", "5"])
                .unwrap();
        if let Commands::Start {
            no_wait, timeout, ..
        } = cli.command
        {
            assert!(no_wait);
            assert_eq!(timeout, Some(5));
        } else {
            panic!("Expected Start command");
        }
    }

    #[test]
    fn test_cli_parse_logs_default_lines() {
        let cli = Cli::try_parse_from(["mlxadmin", "logs", "qwen"]).unwrap();
        if let Commands::Logs { id, lines } = cli.command {
            assert_eq!(id, "qwen");
            assert_eq!(lines, 20);
        } else {
            panic!("Expected Logs command");
        }

        let cli = Cli::try_parse_from(["mlxadmin", "logs", "qwen", "-n", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Logs { lines: 5, .. }));
    }

    #[test]
    fn test_cli_parse_serve_ids() {
        let cli = Cli::try_parse_from(["mlxadmin", "serve"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { ref ids } if ids.is_empty()));

        let cli = Cli::try_parse_from(["mlxadmin", "serve", "a", "b"]).unwrap();
        if let Commands::Serve { ids } = cli.command {
            assert_eq!(ids, vec!["a", "b"]);
        } else {
            panic!("Expected Serve command");
        }
    }

    #[test]
    fn test_cli_parse_chat_with_prompt() {
        let cli = Cli::try_parse_from(["mlxadmin", "chat", "qwen", "--prompt", "hi"]).unwrap();
        if let Commands::Chat { id, prompt, system } = cli.command {
            assert_eq!(id, "qwen");
            assert_eq!(prompt, Some("hi".to_string()));
            assert_eq!(system, None);
        } else {
            panic!("Expected Chat command");
        }
    }

    #[test]
    fn test_cli_parse_add() {
        let cli = Cli::try_parse_from([
            "mlxadmin",
            "add",
            "--id",
            "qwen",
            "--repo-id",
            "mlx-community/Qwen",
            "--port",
            "9000",
            "--draft-model",
            "mlx-community/Qwen-small",
            "--num-draft-tokens",
            "3",
        ])
        .unwrap();
        if let Commands::Add {
            id,
            name,
            repo_id,
            port,
            draft_model,
            num_draft_tokens,
        } = cli.command
        {
            assert_eq!(id, "qwen");
            assert_eq!(name, None);
            assert_eq!(repo_id, "mlx-community/Qwen");
            assert_eq!(port, 9000);
            assert_eq!(draft_model.as_deref(), Some("mlx-community/Qwen-small"));
            assert_eq!(num_draft_tokens, Some(3));
        } else {
            panic!("Expected Add command");
        }
    }

    #[test]
    fn test_cli_parse_add_draft_tokens_require_draft_model() {
        let cli = Cli::try_parse_from([
            "mlxadmin",
            "add",
            "--id",
            "qwen",
            "--repo-id",
            "r",
            "--port",
            "9000",
            "--num-draft-tokens",
            "3",
        ]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_cli_parse_search_default_tag() {
        let cli = Cli::try_parse_from(["mlxadmin", "search", "qwen"]).unwrap();
        if let Commands::Search { query, tag, json } = cli.command {
            assert_eq!(query, "qwen");
            assert_eq!(tag, "mlx");
            assert!(!json);
        } else {
            panic!("Expected Search command");
        }
    }

    #[test]
    fn test_cli_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "mlxadmin",
            "--config",
            "custom.yaml",
            "-v",
            "--logs-dir",
            "/tmp/mlx-logs",
            "stop-all",
        ])
        .unwrap();
        assert_eq!(cli.config, "custom.yaml");
        assert!(cli.verbose);
        assert_eq!(cli.logs_dir, Some(PathBuf::from("/tmp/mlx-logs")));
        assert!(matches!(cli.command, Commands::StopAll));
    }

    #[test]
    fn test_cli_parse_missing_command() {
        assert!(Cli::try_parse_from(["mlxadmin"]).is_err());
    }

    #[test]
    fn test_cli_parse_invalid_command() {
        assert!(Cli::try_parse_from(["mlxadmin", "invalid"]).is_err());
    }
}
