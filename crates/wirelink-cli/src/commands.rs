//! Command handlers for the Wirelink CLI

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use wirelink_client::{
    token_provider_fn, AuthToken, ClientBuilder, ClientErrorEvent, ConnectionStatus, Message,
    SendOutcome, WirelinkClient,
};
use wirelink_core::{JsonFileStore, MessageType};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Listen { duration, json } => {
                Self::handle_listen_command(config, duration, json).await
            }
            Commands::Send { kind, data } => Self::handle_send_command(config, kind, data).await,
            Commands::Status => Self::handle_status_command(config).await,
            Commands::Config { preset } => {
                let config = match preset {
                    Some(preset) => {
                        let mut seeded = AppConfig::from_preset(preset, &config.client.url);
                        seeded.cli = config.cli;
                        seeded
                    }
                    None => config,
                };
                print!("{}", config.to_toml()?);
                Ok(())
            }
        }
    }

    /// Print incoming messages until Ctrl-C or the optional duration passes
    async fn handle_listen_command(config: AppConfig, duration: Option<u64>, json: bool) -> Result<()> {
        let builder = Self::client_builder(&config)?
            .on_message(move |message| print_message(message, json))
            .on_batch(|batch| {
                println!("[batch {}] {} messages ({:?})", batch.key, batch.len(), batch.reason);
            })
            .on_state_change(|state| info!(status = %state.status, "Connection state"));
        let client = builder.build()?;
        client.connect().await?;
        info!(url = %config.client.url, "Listening; press Ctrl-C to stop");

        let until = async {
            match duration {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            _ = until => info!("Listen duration elapsed"),
            state = client.wait_for_status(ConnectionStatus::Failed) => {
                if state.is_ok() {
                    warn!("Gave up reconnecting");
                }
            }
        }

        Self::report_metrics(&client).await?;
        client.disconnect().await?;
        client.destroy().await?;
        Ok(())
    }

    /// Send one message, waiting for it to leave the queue
    async fn handle_send_command(config: AppConfig, kind: String, data: String) -> Result<()> {
        let data: serde_json::Value =
            serde_json::from_str(&data).map_err(|e| CliError::InvalidPayload(e.to_string()))?;
        let kind = MessageType::from(kind);
        if !kind.is_known() {
            warn!(%kind, "Sending a message type the server may not accept");
        }

        let client = Self::client_builder(&config)?.build()?;
        if let Err(e) = client.connect().await {
            warn!(error = %e, "Not connected; message will be queued");
        }

        let outcome = client.send(Message::new(kind, data)).await?;
        match outcome {
            SendOutcome::Sent => println!("sent"),
            SendOutcome::Dropped => println!("dropped by middleware"),
            SendOutcome::Queued => {
                let drained = Self::wait_for_drain(&client, config.cli.send_timeout_ms).await?;
                if drained {
                    println!("sent");
                } else {
                    println!("queued ({} pending)", client.queue_len().await?);
                }
            }
        }

        client.disconnect().await?;
        client.destroy().await?;
        Ok(())
    }

    /// Connect, let traffic settle and print the metrics snapshot
    async fn handle_status_command(config: AppConfig) -> Result<()> {
        let client = Self::client_builder(&config)?
            .on_error(|event| warn!(?event, "Client error"))
            .build()?;

        if let Err(e) = client.connect().await {
            warn!(error = %e, "Connect failed");
        }
        tokio::time::sleep(Duration::from_millis(config.cli.status_wait_ms)).await;

        let state = client.state();
        println!("{}", serde_json::to_string_pretty(&state)?);
        Self::report_metrics(&client).await?;

        client.disconnect().await?;
        client.destroy().await?;
        Ok(())
    }

    fn client_builder(config: &AppConfig) -> Result<ClientBuilder> {
        config.validate()?;
        let mut builder = ClientBuilder::new(config.client.clone())
            .on_error(|event| match event {
                ClientErrorEvent::RetriesExhausted { attempts } => {
                    warn!(attempts, "Reconnect attempts exhausted")
                }
                other => warn!(event = ?other, "Connection problem"),
            });

        if let Some(token) = config.cli.token.clone() {
            builder = builder.with_shared_token_provider(token_provider_fn(move || {
                let token = token.clone();
                async move { Ok(AuthToken::new(token)) }
            }));
        }
        if let Some(path) = &config.cli.queue_file {
            builder = builder.with_offline_store(Arc::new(JsonFileStore::new(path)));
        }
        Ok(builder)
    }

    async fn wait_for_drain(client: &WirelinkClient, timeout_ms: u64) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if client.queue_len().await? == 0 && client.status() == ConnectionStatus::Connected {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(false)
    }

    async fn report_metrics(client: &WirelinkClient) -> Result<()> {
        let metrics = client.metrics().await?;
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        Ok(())
    }
}

fn print_message(message: &Message, json: bool) {
    if json {
        match message.encode() {
            Ok(raw) => println!("{}", raw),
            Err(e) => warn!(error = %e, "Cannot render message"),
        }
        return;
    }

    let data = message
        .data
        .as_ref()
        .map(|data| data.to_string())
        .unwrap_or_default();
    println!(
        "[{}] {} {}",
        message.kind,
        message.id.as_deref().unwrap_or("-"),
        data
    );
}
