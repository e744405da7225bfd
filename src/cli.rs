//! CLI argument parsing via clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Streaming agent runtime for the terminal.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Prompt to run.
    pub prompt: Option<String>,

    /// Path to config file (default: ./relay.toml or ~/.config/relay/relay.toml).
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,

    /// Override model name.
    #[arg(short = 'm', long = "model")]
    pub model: Option<String>,

    /// Override API base URL.
    #[arg(long = "base-url")]
    pub base_url: Option<String>,

    /// Override the model-call cap per run.
    #[arg(long = "max-iterations")]
    pub max_iterations: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect the conversation log.
    Log {
        /// Log directory (default: `[wal].dir` from config).
        #[arg(long = "dir")]
        dir: Option<PathBuf>,

        /// Keep only the newest N entries.
        #[arg(long = "prune", value_name = "N")]
        prune: Option<usize>,
    },
}
