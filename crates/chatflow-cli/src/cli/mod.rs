//! CLI command definitions for the `chatflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are offline: they
//! read the data directory and never contact a provider.

pub mod config;
pub mod preview;
pub mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Inspect chatflow sessions and preview outbound requests.
#[derive(Parser)]
#[command(name = "chatflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory (defaults to ~/.chatflow).
    #[arg(long, global = true, env = "CHATFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Browse saved sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionCommand,
    },

    /// Show the payload that would be sent for a saved session.
    Preview {
        /// Chat id of the session.
        chat_id: String,

        /// Model name placed in the payload.
        #[arg(long, default_value = "gpt-4o-mini")]
        model: String,

        /// Provider type (openai, openai_compatible, anthropic, ollama, deepseek).
        #[arg(long, default_value = "openai_compatible")]
        provider: String,

        /// Offer a tool with this name (repeatable).
        #[arg(long = "tool")]
        tools: Vec<String>,

        /// One-off style instruction for the next reply.
        #[arg(long)]
        style: Option<String>,
    },

    /// Print the effective configuration.
    Config,
}

#[derive(Subcommand)]
pub enum SessionCommand {
    /// List saved sessions, newest first.
    #[command(alias = "ls")]
    List,

    /// Print the messages of a session.
    Show {
        /// Chat id of the session.
        chat_id: String,
    },

    /// Delete a saved session.
    #[command(alias = "rm")]
    Delete {
        /// Chat id of the session.
        chat_id: String,
    },
}

/// Shorten `text` to at most `max` characters, marking the cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max {
        return single_line;
    }
    let kept: String = single_line.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}
