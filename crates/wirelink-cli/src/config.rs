//! Wirelink CLI Configuration Management
//!
//! The configuration file is TOML with two tables: `[client]` holds a full
//! `ClientConfig`, `[cli]` holds settings for this binary. Command-line flags
//! override both.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use wirelink_core::{AuthConfig, ClientConfig, MessageQueueConfig};

use crate::cli::{Cli, Preset};
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the Wirelink CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Client configuration handed to the connection manager
    pub client: ClientConfig,

    /// CLI-specific configuration
    pub cli: CliConfig,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Static token used when no `--token` flag is given
    pub token: Option<String>,

    /// File the outbound queue is persisted to
    pub queue_file: Option<String>,

    /// How long `status` stays connected before reporting (milliseconds)
    pub status_wait_ms: u64,

    /// How long `send` waits for the queue to drain (milliseconds)
    pub send_timeout_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            token: None,
            queue_file: None,
            status_wait_ms: 2_000,
            send_timeout_ms: 5_000,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(toml::from_str(&contents)?)
    }

    /// Configuration seeded from a named preset
    pub fn from_preset(preset: Preset, url: &str) -> Self {
        let client = match preset {
            Preset::Default => ClientConfig::new(url),
            Preset::Testing => ClientConfig::testing(url),
            Preset::LowLatency => ClientConfig::low_latency(url),
        };
        Self {
            client,
            cli: CliConfig::default(),
        }
    }

    /// Apply command-line overrides
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(url) = &cli.url {
            self.client.url = url.clone();
        }
        if let Some(token) = &cli.token {
            self.cli.token = Some(token.clone());
        }
        if let Some(queue_file) = &cli.queue_file {
            self.cli.queue_file = Some(queue_file.clone());
        }

        if self.cli.token.is_some() && self.client.authentication.is_none() {
            self.client.authentication = Some(AuthConfig::default());
        }
        if self.cli.queue_file.is_some() {
            self.client.message_queue = MessageQueueConfig {
                persist_offline: true,
                ..self.client.message_queue.clone()
            };
        }
    }

    /// Check the configuration is usable for connecting
    pub fn validate(&self) -> Result<()> {
        if self.client.url.trim().is_empty() {
            return Err(CliError::Config(
                "no server URL; pass --url or set client.url".to_string(),
            ));
        }
        self.client.validate().map_err(wirelink_core::WirelinkError::from)?;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
