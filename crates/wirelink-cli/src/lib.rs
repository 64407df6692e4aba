//! Wirelink CLI library
//!
//! Argument parsing, configuration loading and the command handlers behind
//! the `wirelink` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands, Preset};
pub use commands::CommandDispatcher;
pub use config::{AppConfig, CliConfig};
pub use error::{CliError, Result};
