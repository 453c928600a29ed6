//! chatflow command-line entry point.
//!
//! Binary name: `chatflow`
//!
//! Parses CLI arguments, sets up tracing, loads the data directory, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;

use chatflow_observe::tracing_setup::{filter_for_verbosity, init_tracing, shutdown_tracing};
use chatflow_types::llm::ProviderType;

use cli::preview::PreviewOptions;
use cli::{Cli, Commands, SessionCommand};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.otel, filter_for_verbosity(cli.verbose))
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let state = AppState::init(cli.data_dir.clone()).await?;
    let result = run(cli, &state).await;

    shutdown_tracing();
    result
}

async fn run(cli: Cli, state: &AppState) -> anyhow::Result<()> {
    match cli.command {
        Commands::Sessions { action } => match action {
            SessionCommand::List => cli::session::list_sessions(state, cli.json).await,
            SessionCommand::Show { chat_id } => {
                cli::session::show_session(state, &chat_id, cli.json).await
            }
            SessionCommand::Delete { chat_id } => {
                cli::session::delete_session(state, &chat_id, cli.json).await
            }
        },

        Commands::Preview {
            chat_id,
            model,
            provider,
            tools,
            style,
        } => {
            let provider = provider
                .parse::<ProviderType>()
                .map_err(|e| anyhow::anyhow!(e))?;
            let options = PreviewOptions {
                model,
                provider,
                tools,
                style,
            };
            cli::preview::preview(state, &chat_id, options, cli.json).await
        }

        Commands::Config => cli::config::show_config(state, cli.json),
    }
}
