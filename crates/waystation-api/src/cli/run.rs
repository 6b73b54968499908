//! CLI run inspection subcommands.
//!
//! Reads the local ledger directly; cancellation goes through the gateway
//! so timers are disarmed the same way the HTTP endpoint does it.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use waystation_types::run::{RunStatus, WorkflowRun};
use waystation_types::step::StepOutcome;

use crate::inspect::{StepView, clamp_limit, load_steps};
use crate::state::AppState;

/// Longest result excerpt shown in the steps table.
const RESULT_PREVIEW_CHARS: usize = 48;

#[derive(Subcommand)]
pub enum RunCommand {
    /// List recent runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Only runs of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one run.
    Show {
        run_id: String,
    },

    /// Show the step ledger of a run.
    Steps {
        run_id: String,
    },

    /// Cancel a pending or suspended run.
    Cancel {
        run_id: String,
    },
}

pub async fn handle_run_command(cmd: RunCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        RunCommand::List { workflow, limit } => {
            handle_list(state, workflow.as_deref(), limit, json).await
        }
        RunCommand::Show { run_id } => handle_show(state, &run_id, json).await,
        RunCommand::Steps { run_id } => handle_steps(state, &run_id, json).await,
        RunCommand::Cancel { run_id } => handle_cancel(state, &run_id, json).await,
    }
}

/// Registered workflow names.
pub fn list_workflows(state: &AppState, json: bool) -> Result<()> {
    let names = state.gateway.registry().names();
    if json {
        println!("{}", serde_json::to_string_pretty(&names)?);
        return Ok(());
    }

    println!();
    for name in &names {
        println!(
            "  {}  {}",
            style(name).cyan(),
            style(format!("POST /api/v1/workflows/{name}")).dim()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(
    state: &AppState,
    workflow: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let runs = state
        .gateway
        .repo()
        .list_runs(workflow, clamp_limit(limit))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list runs: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Retries"),
            Cell::new("Created"),
            Cell::new("Updated"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(&r.id),
            Cell::new(&r.workflow_name),
            format_status(r.status),
            Cell::new(r.retry_count),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(r.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run = state
        .gateway
        .repo()
        .get_run(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get run: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Run '{run_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }
    display_run(&run)
}

fn display_run(run: &WorkflowRun) -> Result<()> {
    println!();
    println!("  {} {}", style("Run").bold(), style(&run.id).cyan());
    println!("  Workflow: {}", style(&run.workflow_name).cyan());
    println!("  Status:   {}", style_status(run.status));
    println!("  Created:  {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:  {}", run.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if run.retry_count > 0 {
        println!("  Retries:  {}", run.retry_count);
    }
    if let Some(payload) = &run.payload {
        println!("  Payload:  {}", serde_json::to_string(payload)?);
    }
    if let Some(result) = &run.final_result {
        println!("  Result:   {}", serde_json::to_string(result)?);
    }
    if let Some(err) = &run.error {
        match run.failed_step {
            Some(step) => println!("  Error:    {} (step {step})", style(err).red()),
            None => println!("  Error:    {}", style(err).red()),
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

async fn handle_steps(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let (_, steps) = load_steps(state.gateway.repo(), run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load steps: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Run '{run_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    if steps.is_empty() {
        println!();
        println!("  Run '{run_id}' has not recorded any steps yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Kind"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Result"),
            Cell::new("Completed"),
        ]);

    for step in &steps {
        table.add_row(step_row(step));
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn step_row(step: &StepView) -> Vec<Cell> {
    let record = &step.record;
    let status = match (record.outcome, record.result_status) {
        (StepOutcome::Failed, _) => Cell::new("failed").fg(Color::Red),
        (StepOutcome::Succeeded, Some(code)) if code >= 400 => {
            Cell::new(code).fg(Color::DarkYellow)
        }
        (StepOutcome::Succeeded, Some(code)) => Cell::new(code).fg(Color::Green),
        (StepOutcome::Succeeded, None) => Cell::new("ok").fg(Color::Green),
    };
    let attempts = if step.attempts.is_empty() {
        "-".to_string()
    } else {
        step.attempts.len().to_string()
    };

    vec![
        Cell::new(record.index),
        Cell::new(&record.name),
        Cell::new(record.kind),
        status,
        Cell::new(attempts),
        Cell::new(preview(&record.result_body)),
        Cell::new(record.completed_at.format("%H:%M:%S%.3f").to_string()),
    ]
}

fn preview(body: &str) -> String {
    if body.chars().count() <= RESULT_PREVIEW_CHARS {
        return body.to_string();
    }
    let cut: String = body.chars().take(RESULT_PREVIEW_CHARS).collect();
    format!("{cut}...")
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

async fn handle_cancel(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let before = state
        .gateway
        .repo()
        .get_run(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get run: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Run '{run_id}' not found"))?;
    if before.status.is_terminal() {
        bail!("Run has already finished (status: {}). Cannot cancel.", before.status);
    }

    let run = state
        .gateway
        .cancel(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to cancel run: {e}"))?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "cancelled": run.id, "status": run.status })
        );
    } else {
        println!();
        println!(
            "  {} Cancelled run {}",
            style("*").yellow().bold(),
            style(&run.id).cyan()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn format_status(status: RunStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        RunStatus::Pending => cell.fg(Color::Yellow),
        RunStatus::Suspended => cell.fg(Color::Blue),
        RunStatus::Completed => cell.fg(Color::Green),
        RunStatus::Failed => cell.fg(Color::Red),
        RunStatus::Cancelled => cell.fg(Color::DarkYellow),
    }
}

fn style_status(status: RunStatus) -> console::StyledObject<&'static str> {
    let styled = style(status.as_str());
    match status {
        RunStatus::Pending => styled.yellow(),
        RunStatus::Suspended => styled.blue(),
        RunStatus::Completed => styled.green(),
        RunStatus::Failed => styled.red(),
        RunStatus::Cancelled => styled.yellow().dim(),
    }
}
