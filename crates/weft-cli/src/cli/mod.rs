//! CLI command definitions for the `weft` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod output;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

/// Run agent workflows defined as dependency graphs.
#[derive(Parser)]
#[command(name = "weft", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow file and print its execution plan.
    Validate {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },

    /// Run a workflow to completion.
    Run {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,

        /// Input data as a JSON document.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read input data from a JSON file.
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Agent endpoint URL (overrides `[agent].url` in weft.toml).
        #[arg(long, env = "WEFT_AGENT_URL")]
        agent_url: Option<String>,

        /// Answer agent calls locally with their input instead of calling the endpoint.
        #[arg(long)]
        echo: bool,
    },

    /// Show the state of a run.
    Status {
        /// Run UUID.
        run_id: Uuid,
    },

    /// Resume a crashed or cancelled run from its last checkpoint.
    Resume {
        /// Run UUID.
        run_id: Uuid,

        /// Agent endpoint URL (overrides `[agent].url` in weft.toml).
        #[arg(long, env = "WEFT_AGENT_URL")]
        agent_url: Option<String>,

        /// Answer agent calls locally with their input.
        #[arg(long)]
        echo: bool,
    },

    /// List checkpointed runs (resumable ones unless --all).
    #[command(alias = "ls")]
    List {
        /// Include completed and failed runs.
        #[arg(long)]
        all: bool,
    },

    /// Delete the checkpoint of a run.
    Purge {
        /// Run UUID.
        run_id: Uuid,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Where agent calls go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentTarget {
    /// Use `[agent].url` from the configuration, or echo if it is unset.
    Configured,
    Url(String),
    Echo,
}

impl AgentTarget {
    pub fn from_flags(agent_url: Option<String>, echo: bool) -> Self {
        match (agent_url, echo) {
            (_, true) => AgentTarget::Echo,
            (Some(url), false) => AgentTarget::Url(url),
            (None, false) => AgentTarget::Configured,
        }
    }
}
