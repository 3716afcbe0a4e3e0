//! Styled terminal rendering shared by the workflow commands.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use weft_core::workflow::context::ExecutionContext;
use weft_types::event::StepTransition;
use weft_types::workflow::{RunStatus, StepMessage, StepStatus};

/// Longest summary shown in a table cell.
const SUMMARY_WIDTH: usize = 80;

pub fn run_status_color(status: RunStatus) -> Color {
    match status {
        RunStatus::Running => Color::Blue,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Cancelled => Color::Yellow,
    }
}

pub fn styled_run_status(status: RunStatus) -> String {
    let s = status.to_string();
    match status {
        RunStatus::Running => style(s).blue().to_string(),
        RunStatus::Completed => style(s).green().bold().to_string(),
        RunStatus::Failed => style(s).red().bold().to_string(),
        RunStatus::Cancelled => style(s).yellow().to_string(),
    }
}

fn step_status_color(status: StepStatus) -> Color {
    match status {
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
        StepStatus::Running => Color::Blue,
        StepStatus::Pending => Color::Reset,
    }
}

fn status_marker(status: StepStatus) -> String {
    match status {
        StepStatus::Completed => style("✓").green().to_string(),
        StepStatus::Failed => style("✗").red().to_string(),
        StepStatus::Skipped => style("-").dim().to_string(),
        StepStatus::Running => style("▸").blue().to_string(),
        StepStatus::Pending => style("·").dim().to_string(),
    }
}

/// Shorten `text` to at most `width` characters.
pub fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// One line per step transition, printed while a run progresses.
pub fn transition_line(transition: &StepTransition) -> String {
    let detail = transition
        .error_summary
        .as_deref()
        .or(transition.result_summary.as_deref())
        .map(|s| format!("  {}", style(truncate(s, SUMMARY_WIDTH)).dim()))
        .unwrap_or_default();
    format!(
        "  {} {} {}{}",
        status_marker(transition.status),
        style(&transition.step_id).cyan(),
        style(format!("({})", transition.kind)).dim(),
        detail
    )
}

/// Table of a run's message log.
pub fn messages_table(messages: &[StepMessage]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("Status"),
            Cell::new("Backends"),
            Cell::new("Summary"),
            Cell::new("At"),
        ]);

    for (i, message) in messages.iter().enumerate() {
        let backends = message
            .attempts
            .iter()
            .map(|a| a.backend.to_string())
            .collect::<Vec<_>>()
            .join(" → ");
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&message.step_id),
            Cell::new(message.kind),
            Cell::new(message.status).fg(step_status_color(message.status)),
            Cell::new(backends),
            Cell::new(truncate(
                message.summary.as_deref().unwrap_or(""),
                SUMMARY_WIDTH,
            )),
            Cell::new(message.timestamp.format("%H:%M:%S%.3f")),
        ]);
    }
    table
}

/// Human-readable report of a run.
pub fn print_run(ctx: &ExecutionContext) {
    println!();
    println!(
        "  Run {} of '{}': {}",
        style(ctx.run_id).bold(),
        style(&ctx.workflow_name).cyan(),
        styled_run_status(ctx.status)
    );
    println!(
        "  Steps: {} completed, {} failed, {} skipped  (version {})",
        ctx.completed_steps.len(),
        ctx.failed_steps.len(),
        ctx.skipped_steps.len(),
        ctx.version
    );
    if let Some(error) = &ctx.error {
        println!("  Error: {}", style(error).red());
    }

    if !ctx.messages.is_empty() {
        println!();
        println!("{}", messages_table(&ctx.messages));
    }

    if let Some(output) = &ctx.output {
        let variables = output.get("variables").cloned().unwrap_or_default();
        if variables.as_object().is_some_and(|v| !v.is_empty()) {
            println!();
            println!("  {}", style("Variables").bold());
            match serde_json::to_string_pretty(&variables) {
                Ok(text) => {
                    for line in text.lines() {
                        println!("    {line}");
                    }
                }
                Err(_) => println!("    {variables}"),
            }
        }
    }
    println!();
}
