//! Foreground serving
//!
//! Starts the requested models, then waits for the shutdown token and stops
//! every configured model before returning.

use colored::Colorize;
use tokio_util::sync::CancellationToken;

use crate::commands::{print_stop_report, start_model};
use crate::error::Result;
use crate::orchestrator::App;

/// Start `ids` (all models when empty) and serve until `shutdown` fires
///
/// A model that fails to start is reported and skipped. On shutdown all
/// configured models are stopped, including ones started elsewhere.
pub async fn run_serve(app: &App, ids: Vec<String>, shutdown: CancellationToken) -> Result<()> {
    let targets = if ids.is_empty() {
        app.supervisor()
            .specs()
            .iter()
            .map(|s| s.id.clone())
            .collect()
    } else {
        for id in &ids {
            app.supervisor().spec(id)?;
        }
        ids
    };

    for id in &targets {
        tokio::select! {
            result = start_model(app, id, true, None) => {
                if let Err(e) = result {
                    println!("{}", format!("Failed to start {}: {}", id, e).red());
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    if !shutdown.is_cancelled() {
        println!("\nServing. Press Ctrl-C to stop all models and exit.");
        shutdown.cancelled().await;
    }

    let report = app.shutdown().await;
    print_stop_report(&report);
    Ok(())
}
