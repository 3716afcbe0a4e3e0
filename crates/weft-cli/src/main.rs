//! Weft CLI entry point.
//!
//! Binary name: `weft`
//!
//! Parses CLI arguments, initializes tracing, configuration and the checkpoint
//! database, then dispatches to the workflow command handlers.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use weft_observe::tracing_setup::{
    TracingOptions, filter_for_verbosity, init_tracing, shutdown_tracing,
};

use cli::workflow::RunArgs;
use cli::{AgentTarget, Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        default_filter: filter_for_verbosity(cli.verbose, cli.quiet).to_string(),
        json: cli.json,
        otel: cli.otel,
    };
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Commands that need no application state
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::workflow::handle_validate(file, cli.json),
        _ => {}
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Run {
            file,
            input,
            input_file,
            agent_url,
            echo,
        } => {
            let args = RunArgs {
                file,
                input,
                input_file,
                target: AgentTarget::from_flags(agent_url, echo),
            };
            cli::workflow::handle_run(&state, args, cli.json, cli.quiet).await
        }
        Commands::Status { run_id } => cli::workflow::handle_status(&state, run_id, cli.json).await,
        Commands::Resume {
            run_id,
            agent_url,
            echo,
        } => {
            let target = AgentTarget::from_flags(agent_url, echo);
            cli::workflow::handle_resume(&state, run_id, target, cli.json, cli.quiet).await
        }
        Commands::List { all } => cli::workflow::handle_list(&state, all, cli.json).await,
        Commands::Purge { run_id } => cli::workflow::handle_purge(&state, run_id, cli.json).await,
        Commands::Completions { .. } | Commands::Validate { .. } => Ok(()),
    }
}
