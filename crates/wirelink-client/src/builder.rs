//! Client Builder API
//!
//! Assembles the default middleware chain, the outbound queue and the
//! connection manager task from a [`ClientConfig`], then hands back a
//! [`WirelinkClient`] handle.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;
use wirelink_core::{
    AuthError, Batch, BatchHandler, BatchingMiddleware, ClientConfig, CompressionMiddleware,
    DeduplicationMiddleware, LoggingMiddleware, MemoryStore, MessageMiddleware, MessageQueue,
    MiddlewareChain, OfflineStore, RateLimitMiddleware, Result, SharedTimeSource,
    SystemTimeSource, TransformMiddleware, WirelinkError,
};

use crate::auth::{SharedTokenProvider, TokenProvider};
use crate::client::{
    ClientErrorEvent, Command, ConnectionManager, Handlers, ManagerParts, WirelinkClient,
    COMMAND_CHANNEL_CAPACITY,
};
use crate::state::ConnectionState;
use crate::transport::Transport;

// ----------------------------------------------------------------------------
// Default Chain
// ----------------------------------------------------------------------------

/// The standard middleware stack for a configuration
///
/// Order: compression, transform, deduplication, rate limiting, then logging
/// and batching when configured.
pub fn default_chain(
    config: &ClientConfig,
    time_source: SharedTimeSource,
    batch_handler: Option<BatchHandler>,
) -> MiddlewareChain {
    let mut chain = MiddlewareChain::new();
    chain.add(Box::new(CompressionMiddleware::new(config.compression)));
    chain.add(Box::new(TransformMiddleware::new(
        config.middleware.transform.clone(),
        time_source.clone(),
    )));
    chain.add(Box::new(DeduplicationMiddleware::new(
        config.middleware.dedup_cache_size,
    )));
    chain.add(Box::new(RateLimitMiddleware::from_config(
        &config.rate_limiting,
        time_source.clone(),
    )));
    if let Some(level) = config.middleware.log_level {
        chain.add(Box::new(LoggingMiddleware::new(level)));
    }
    if let Some(batching) = &config.middleware.batching {
        let mut unit = BatchingMiddleware::new(batching, time_source);
        if let Some(handler) = batch_handler {
            unit = unit.with_handler(handler);
        }
        chain.add(Box::new(unit));
    }
    chain
}

// ----------------------------------------------------------------------------
// Client Builder
// ----------------------------------------------------------------------------

/// Builder for a [`WirelinkClient`]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    token_provider: Option<SharedTokenProvider>,
    time_source: SharedTimeSource,
    offline_store: Option<Arc<dyn OfflineStore>>,
    extra_middleware: Vec<Box<dyn MessageMiddleware>>,
    handlers: Handlers,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            token_provider: None,
            time_source: SystemTimeSource::shared(),
            offline_store: None,
            extra_middleware: Vec::new(),
            handlers: Handlers::default(),
        }
    }

    /// Use a custom transport instead of the WebSocket default
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use a transport that is shared with the caller
    pub fn with_shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_shared_token_provider(mut self, provider: SharedTokenProvider) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Clock used for message timestamps, rate windows and metrics
    pub fn with_time_source(mut self, time_source: SharedTimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    /// Where the outbound queue is persisted when `persist_offline` is set
    pub fn with_offline_store(mut self, store: Arc<dyn OfflineStore>) -> Self {
        self.offline_store = Some(store);
        self
    }

    /// Append a unit after the default stack
    pub fn add_middleware(mut self, unit: impl MessageMiddleware + 'static) -> Self {
        self.extra_middleware.push(Box::new(unit));
        self
    }

    /// Called for each incoming message that survives the chain
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&wirelink_core::Message) + Send + Sync + 'static,
    {
        self.handlers.message.push(Arc::new(handler));
        self
    }

    /// Called on every connection state change
    pub fn on_state_change<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.handlers.state.push(Arc::new(handler));
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ClientErrorEvent) + Send + Sync + 'static,
    {
        self.handlers.error.push(Arc::new(handler));
        self
    }

    /// Called for each batch emitted by the batching unit
    pub fn on_batch<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Batch) + Send + Sync + 'static,
    {
        self.handlers.batch.push(Arc::new(handler));
        self
    }

    /// Validate the configuration and spawn the connection manager
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<WirelinkClient> {
        self.config.validate()?;
        if self.config.authentication.is_some() && self.token_provider.is_none() {
            return Err(AuthError::ProviderMissing.into());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            WirelinkError::Scheduling {
                reason: e.to_string(),
            }
        })?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let batch_handler: BatchHandler = Arc::new(move |batch: Batch| {
            let _ = batch_tx.send(batch);
        });
        let mut chain = default_chain(&self.config, self.time_source.clone(), Some(batch_handler));
        for unit in self.extra_middleware {
            chain.add(unit);
        }

        let store = match (self.config.message_queue.persist_offline, self.offline_store) {
            (true, None) => Some(Arc::new(MemoryStore::new()) as Arc<dyn OfflineStore>),
            (_, store) => store,
        };
        let queue = MessageQueue::from_config(
            &self.config.message_queue,
            store,
            self.time_source.clone(),
        );

        let (command_tx, command_rx) = mpsc::channel::<Command>(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        info!(
            url = %self.config.url,
            middleware = ?chain.names(),
            restored = queue.len(),
            "Building client"
        );
        let manager = ConnectionManager::new(ManagerParts {
            config: self.config,
            transport,
            token_provider: self.token_provider,
            time_source: self.time_source,
            chain,
            queue,
            handlers: self.handlers,
            commands: command_rx,
            state: state_tx,
            batches: batch_rx,
        });
        runtime.spawn(manager.run());

        Ok(WirelinkClient::new(command_tx, state_rx))
    }
}

#[cfg(feature = "websocket")]
fn default_transport() -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(crate::websocket::WebSocketTransport::new()))
}

#[cfg(not(feature = "websocket"))]
fn default_transport() -> Result<Arc<dyn Transport>> {
    Err(WirelinkError::invalid_config(
        "transport",
        "no transport supplied and the websocket feature is disabled",
    ))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
