//! CLI command definitions using clap.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// runonce - at-most-once activities on an at-least-once orchestrator
#[derive(Parser, Debug)]
#[command(name = "runonce")]
#[command(version)]
#[command(about = "Patient onboarding service with idempotent, asynchronously completed activities")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP server and the ledger collector
    Serve {
        /// Configuration file (TOML)
        #[arg(short, long, env = "RUNONCE_CONFIG")]
        config: Option<PathBuf>,

        /// Address to listen on, overrides the configuration
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Log filter used when RUST_LOG is unset (e.g. "debug", "runonce_guard=trace")
        #[arg(long, default_value = "info")]
        log_level: String,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (TOML)
        #[arg(short, long, env = "RUNONCE_CONFIG")]
        config: Option<PathBuf>,
    },
}
