//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Server URL, overriding the configuration file
    #[arg(short, long)]
    pub url: Option<String>,

    /// Static authentication token
    #[arg(short, long)]
    pub token: Option<String>,

    /// Persist the outbound queue to this file between runs
    #[arg(long)]
    pub queue_file: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect and print incoming messages until interrupted
    Listen {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Print raw JSON envelopes instead of a summary line
        #[arg(long)]
        json: bool,
    },
    /// Send one message and exit
    Send {
        /// Message type, e.g. `notification`
        kind: String,
        /// JSON payload
        #[arg(default_value = "{}")]
        data: String,
    },
    /// Connect briefly and print connection metrics
    Status,
    /// Print the effective configuration as TOML
    Config {
        /// Start from a named preset instead of the loaded file
        #[arg(long, value_enum)]
        preset: Option<Preset>,
    },
}

/// Named configuration presets
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    Default,
    Testing,
    LowLatency,
}
