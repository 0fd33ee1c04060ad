//! Command handlers for the CLI
//!
//! Each handler renders its result for a terminal: tables via
//! `prettytable`, messages via `colored`, and JSON on request. Misuse
//! results such as starting a model that is already running are reported
//! as a message, not as a failure.

use std::time::Duration;

use colored::Colorize;
use prettytable::{cell, row, Cell, Row, Table};
use serde::Serialize;

use crate::catalog::{CatalogEntry, CatalogSearch, HubCatalog};
use crate::config::{Config, ModelSpec};
use crate::error::{self, MlxAdminError, Result};
use crate::orchestrator::App;
use crate::supervisor::{ModelStatus, StatusReport, StopAllReport};

pub mod chat;
pub mod serve;

/// Print the configured models
pub fn list_models(config: &Config, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config.models)?);
        return Ok(());
    }

    if config.models.is_empty() {
        println!("No models configured. Add one with `mlxadmin add`.");
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(row!["ID", "Name", "Repository", "Port", "Draft Model"]);
    for model in &config.models {
        let draft = match (&model.draft_model_ref, model.draft_token_count) {
            (Some(draft), Some(n)) => format!("{} ({} tokens)", draft, n),
            (Some(draft), None) => draft.clone(),
            _ => "-".to_string(),
        };
        table.add_row(row![model.id, model.name, model.model_ref, model.port, draft]);
    }

    println!();
    table.printstd();
    println!();
    Ok(())
}

#[derive(Serialize)]
struct StatusRow {
    #[serde(flatten)]
    report: StatusReport,
    endpoint: String,
}

/// Print online/offline state of every configured model
pub async fn show_status(app: &App, json: bool) -> Result<()> {
    let rows: Vec<StatusRow> = app
        .supervisor()
        .status_all()
        .await
        .into_iter()
        .map(|report| StatusRow {
            endpoint: app.config().relay.endpoint_for(report.port),
            report,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No models configured. Add one with `mlxadmin add`.");
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(row!["ID", "Name", "Port", "Status", "PID", "Endpoint"]);
    for row in &rows {
        let status = match (&row.report.status, &row.report.probe_error) {
            (ModelStatus::Online, _) => Cell::new("ONLINE").style_spec("Fg"),
            (ModelStatus::Offline, None) => Cell::new("OFFLINE").style_spec("Fr"),
            (ModelStatus::Offline, Some(_)) => Cell::new("UNKNOWN").style_spec("Fy"),
        };
        let pid = row
            .report
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(Row::new(vec![
            Cell::new(&row.report.id),
            Cell::new(&row.report.name),
            Cell::new(&row.report.port.to_string()),
            status,
            Cell::new(&pid),
            Cell::new(&row.endpoint),
        ]));
    }

    println!();
    table.printstd();

    for row in &rows {
        if let Some(reason) = &row.report.probe_error {
            println!(
                "{}",
                format!("Could not probe {}: {}", row.report.id, reason).yellow()
            );
        }
    }

    let online: Vec<&StatusRow> = rows
        .iter()
        .filter(|r| r.report.status == ModelStatus::Online)
        .collect();
    if !online.is_empty() {
        println!("\nConnect OpenAI-compatible clients to:");
        for row in online {
            println!("  {}  {}/v1", row.report.id.cyan(), row.endpoint);
        }
    }
    println!();
    Ok(())
}

/// Start a model, optionally waiting until its port is live
pub async fn start_model(app: &App, id: &str, wait: bool, timeout: Option<u64>) -> Result<()> {
    let supervisor = app.supervisor();
    let spec = supervisor.spec(id)?;

    let result = if wait {
        println!("Starting {} on port {}...", spec.id, spec.port);
        supervisor
            .start_and_wait(id, timeout.map(Duration::from_secs))
            .await
    } else {
        supervisor.start(id).await
    };

    match result {
        Ok(()) if wait => {
            println!(
                "{}",
                format!("{} is online at {}", spec.id, app.endpoint(id)?).green()
            );
            Ok(())
        }
        Ok(()) => {
            println!(
                "Launched {}; logs at {}",
                spec.id,
                supervisor.log_path(id).display()
            );
            Ok(())
        }
        Err(e) => match error::kind(&e) {
            Some(MlxAdminError::AlreadyRunning(_)) => {
                println!("{}", format!("{} is already running", spec.id).yellow());
                Ok(())
            }
            Some(MlxAdminError::StartTimeout { .. }) => {
                println!(
                    "{}",
                    format!(
                        "{} is still loading; check `mlxadmin logs {}` or run `mlxadmin status` later",
                        spec.id, spec.id
                    )
                    .yellow()
                );
                Err(e)
            }
            _ => Err(e),
        },
    }
}

/// Stop a model
pub async fn stop_model(app: &App, id: &str) -> Result<()> {
    match app.supervisor().stop(id).await {
        Ok(()) => {
            println!("{}", format!("Stopped {}", id).green());
            Ok(())
        }
        Err(e) => match error::kind(&e) {
            Some(MlxAdminError::NotRunning(_)) => {
                println!("{}", format!("{} is not running", id).yellow());
                Ok(())
            }
            _ => Err(e),
        },
    }
}

/// Stop every model and print what happened
///
/// # Errors
///
/// Returns an error after printing the report if any model failed to stop.
pub async fn stop_all(app: &App) -> Result<()> {
    let report = app.supervisor().stop_all().await;
    print_stop_report(&report);

    if report.is_clean() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "{} model(s) could not be stopped",
            report.failures.len()
        ))
    }
}

pub(crate) fn print_stop_report(report: &StopAllReport) {
    for id in &report.stopped {
        println!("{}", format!("Stopped {}", id).green());
    }
    if report.stopped.is_empty() && report.failures.is_empty() {
        println!("No models were running");
    }
    for failure in &report.failures {
        println!(
            "{}",
            format!("Failed to stop {}: {}", failure.id, failure.error).red()
        );
    }
}

/// Print the tail of a model's server log
pub async fn show_logs(app: &App, id: &str, lines: usize) -> Result<()> {
    let tail = app.supervisor().tail_log(id, lines).await?;
    if tail.is_empty() {
        println!("No logs yet.");
    } else {
        for line in tail {
            println!("{}", line);
        }
    }
    Ok(())
}

/// Append a model to the models file
pub fn add_model(app: &mut App, spec: ModelSpec) -> Result<()> {
    let id = spec.id.clone();
    let port = spec.port;
    app.add_model(spec)?;
    println!(
        "{}",
        format!(
            "Added {} on port {} to {}",
            id,
            port,
            app.config_path().display()
        )
        .green()
    );
    Ok(())
}

/// Search the model hub
pub async fn search_catalog(config: &Config, query: &str, tag: &str, json: bool) -> Result<()> {
    let catalog = HubCatalog::new(&config.catalog)?;
    let entries = catalog.search(query, tag).await?;
    print_catalog_entries(&entries, json)
}

fn print_catalog_entries(entries: &[CatalogEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No matching models found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(row!["Repository", "Downloads", "Likes"]);
    for entry in entries {
        table.add_row(row![
            entry.id,
            format_count(entry.downloads),
            format_count(entry.likes)
        ]);
    }
    println!();
    table.printstd();
    println!();
    Ok(())
}

fn format_count(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
