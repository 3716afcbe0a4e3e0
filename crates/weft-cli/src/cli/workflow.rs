//! Workflow subcommands: validate, run, status, resume, list and purge.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;
use weft_core::workflow::dag::WorkflowPlan;
use weft_core::workflow::definition::{DefinitionError, load_workflow_file};
use weft_core::workflow::executor::{ExecutionResult, ExecutorError, WorkflowExecutor};
use weft_types::event::WorkflowEvent;
use weft_types::workflow::RunStatus;

use super::AgentTarget;
use super::output::{print_run, run_status_color, styled_run_status, transition_line, truncate};
use crate::state::{AppState, ConcreteEngine};

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = match load_workflow_file(file) {
        Ok(def) => def,
        Err(DefinitionError::Invalid(err)) => {
            if json {
                let out = json!({
                    "valid": false,
                    "violations": err.violations.iter().map(ToString::to_string).collect::<Vec<_>>(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!(
                    "  {} {} is not a valid workflow",
                    style("✗").red().bold(),
                    style(file.display()).cyan()
                );
                for violation in &err.violations {
                    println!("    - {violation}");
                }
                println!();
            }
            bail!("{} violation(s) in {}", err.violations.len(), file.display());
        }
        Err(other) => {
            return Err(other).with_context(|| format!("Failed to load {}", file.display()));
        }
    };

    let plan = WorkflowPlan::new(&def);
    let waves: Vec<Vec<String>> = plan
        .waves()
        .unwrap_or_default()
        .into_iter()
        .map(|wave| wave.into_iter().map(|s| s.id.clone()).collect())
        .collect();

    if json {
        let out = json!({
            "valid": true,
            "id": def.id.to_string(),
            "name": def.name,
            "steps": def.steps.len(),
            "waves": waves,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} '{}' is valid ({} steps)",
        style("✓").green().bold(),
        style(&def.name).cyan(),
        def.steps.len()
    );
    println!();
    for (i, wave) in waves.iter().enumerate() {
        println!("  {} {}", style(format!("wave {}", i + 1)).dim(), wave.join(", "));
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub struct RunArgs {
    pub file: PathBuf,
    pub input: Option<String>,
    pub input_file: Option<PathBuf>,
    pub target: AgentTarget,
}

pub async fn handle_run(state: &AppState, args: RunArgs, json: bool, quiet: bool) -> Result<()> {
    let def = load_workflow_file(&args.file)
        .with_context(|| format!("Failed to load {}", args.file.display()))?;
    let input = parse_input(args.input.as_deref(), args.input_file.as_deref()).await?;
    let engine = state.engine(&args.target)?;

    let progress = (!json && !quiet).then(|| spawn_progress(&engine));
    let run_id = engine.start(def, input)?;
    if !json && !quiet {
        println!();
        println!("  Started run {}", style(run_id).bold());
        println!();
    }

    let result = interruptible(&engine, run_id, engine.wait(run_id)).await;
    if let Some(progress) = progress {
        progress.abort();
    }
    report(result?, json, quiet)
}

/// Parse run input from `--input` or `--input-file`, defaulting to `{}`.
pub async fn parse_input(inline: Option<&str>, file: Option<&Path>) -> Result<Value> {
    if let Some(text) = inline {
        return serde_json::from_str(text).context("--input is not valid JSON");
    }
    if let Some(path) = file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return serde_json::from_str(&text)
            .with_context(|| format!("{} is not valid JSON", path.display()));
    }
    Ok(json!({}))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let engine = state.engine(&AgentTarget::Echo)?;
    let ctx = match engine.get_status(run_id).await {
        Ok(ctx) => ctx,
        Err(ExecutorError::RunNotFound(_)) => bail!("No checkpoint for run {run_id}"),
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&ctx)?);
    } else {
        print_run(&ctx);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn handle_resume(
    state: &AppState,
    run_id: Uuid,
    target: AgentTarget,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let engine = state.engine(&target)?;
    let progress = (!json && !quiet).then(|| spawn_progress(&engine));
    if !json && !quiet {
        println!();
        println!("  Resuming run {}", style(run_id).bold());
        println!();
    }

    let result = interruptible(&engine, run_id, engine.resume(run_id)).await;
    if let Some(progress) = progress {
        progress.abort();
    }
    let result = match result {
        Err(ExecutorError::NotResumable { status, .. }) => {
            bail!("Run {run_id} is {status}; only running or cancelled runs can be resumed")
        }
        Err(ExecutorError::RunNotFound(_)) => bail!("No checkpoint for run {run_id}"),
        other => other?,
    };
    report(result, json, quiet)
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list(state: &AppState, all: bool, json: bool) -> Result<()> {
    let engine = state.engine(&AgentTarget::Echo)?;
    let records = if all {
        engine.checkpoints().all().await?
    } else {
        engine.unfinished().await?
    };

    if json {
        let out: Vec<_> = records
            .iter()
            .map(|r| {
                json!({
                    "run_id": r.run_id.to_string(),
                    "workflow": r.workflow_name,
                    "status": r.status,
                    "completed_steps": r.context.completed_steps.len(),
                    "total_steps": r.definition.steps.len(),
                    "error": r.context.error,
                    "updated_at": r.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        if all {
            println!("  No checkpointed runs.");
        } else {
            println!("  No resumable runs.");
        }
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
            Cell::new("Steps"),
            Cell::new("Updated"),
            Cell::new("Error"),
        ]);

    for r in &records {
        table.add_row(vec![
            Cell::new(r.run_id),
            Cell::new(&r.workflow_name),
            Cell::new(r.status).fg(run_status_color(r.status)),
            Cell::new(format!(
                "{}/{}",
                r.context.completed_steps.len(),
                r.definition.steps.len()
            )),
            Cell::new(r.updated_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(truncate(r.context.error.as_deref().unwrap_or(""), 60)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Purge
// ---------------------------------------------------------------------------

pub async fn handle_purge(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let engine = state.engine(&AgentTarget::Echo)?;
    let existed = engine.checkpoints().discard(run_id).await?;
    if !existed {
        bail!("No checkpoint for run {run_id}");
    }

    if json {
        println!("{}", json!({ "run_id": run_id.to_string(), "purged": true }));
    } else {
        println!();
        println!("  {} Purged checkpoint of run {}", style("*").green().bold(), run_id);
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Print settled step transitions as they happen.
fn spawn_progress(engine: &ConcreteEngine) -> JoinHandle<()> {
    let mut events = engine.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkflowEvent::StepTransition(t)) if t.ended_at.is_some() => {
                    println!("{}", transition_line(&t));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress printer lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Await `run`, cancelling the run on Ctrl-C and waiting for it to wind down.
async fn interruptible<F>(
    engine: &ConcreteEngine,
    run_id: Uuid,
    run: F,
) -> Result<ExecutionResult, ExecutorError>
where
    F: Future<Output = Result<ExecutionResult, ExecutorError>>,
{
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("  {} cancelling run {run_id}...", style("!").yellow().bold());
            if let Err(e) = engine.cancel(run_id).await {
                tracing::warn!(run_id = %run_id, error = %e, "cancel request not delivered");
            }
            run.await
        }
    }
}

fn report(result: ExecutionResult, json: bool, quiet: bool) -> Result<()> {
    if json {
        let out = json!({
            "run_id": result.run_id.to_string(),
            "status": result.status,
            "error": result.error,
            "output": result.context.output,
            "step_results": result.context.step_results,
            "messages": result.context.messages,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if !quiet {
        print_run(&result.context);
    }

    match result.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => bail!(
            "Run {} cancelled; continue it with `weft resume {}`",
            result.run_id,
            result.run_id
        ),
        status => bail!(
            "Run {} {}: {}",
            result.run_id,
            styled_run_status(status),
            result.error.unwrap_or_default()
        ),
    }
}
