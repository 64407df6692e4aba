//! Client handle and connection manager
//!
//! Each client is one tokio task (the connection manager) that owns the
//! transport, the connection state machine, the middleware chain, the outbound
//! queue, the metrics collector and every connection timer. Callers hold a
//! cloneable [`WirelinkClient`] that talks to the task over a command channel;
//! connection state is published through a `watch` channel.
//!
//! Timers are deadlines polled by the task's `select!` loop, so disconnecting
//! or destroying the client cancels them by simply dropping them.

use core::future::Future;
use core::pin::Pin;
use core::time::Duration;
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, error, info, warn};
use wirelink_core::{
    AuthConfig, AuthError, Batch, ClientConfig, ErrorKind, Message, MessageQueue, MessageType,
    MetricsCollector, MetricsSnapshot, MiddlewareChain, QueuePush, ReconnectPolicy, Result,
    SharedTimeSource, TransportError, WirelinkError,
};

use crate::auth::{fetch_token, AuthToken, SharedTokenProvider};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
use crate::state::{ConnectionEvent, ConnectionState, ConnectionStatus, StateMachine};
use crate::transport::{
    OpenRequest, Transport, TransportEvent, TransportEvents, TransportHandle, CLOSE_AUTH_REQUIRED,
    CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL,
};

/// Capacity of the command channel between handles and the manager
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Public Types
// ----------------------------------------------------------------------------

/// What happened to a message passed to [`WirelinkClient::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the transport
    Sent,
    /// Held in the outbound queue until the connection is usable
    Queued,
    /// Dropped by the middleware chain
    Dropped,
}

/// Connection-level problems reported to error handlers
#[derive(Debug, Clone, PartialEq)]
pub enum ClientErrorEvent {
    Transport(TransportError),
    /// The server demanded (re-)authentication
    AuthRequired { reason: String },
    /// The token provider failed
    Auth(AuthError),
    HeartbeatMissed { consecutive: u32 },
    /// Reconnection gave up; the client is in `failed`
    RetriesExhausted { attempts: u32 },
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(&ConnectionState) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&ClientErrorEvent) + Send + Sync>;
pub type BatchCallback = Arc<dyn Fn(&Batch) + Send + Sync>;

/// Callbacks registered through the builder
#[derive(Default, Clone)]
pub(crate) struct Handlers {
    pub message: Vec<MessageHandler>,
    pub state: Vec<StateHandler>,
    pub error: Vec<ErrorHandler>,
    pub batch: Vec<BatchCallback>,
}

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

pub(crate) enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Send(Message, oneshot::Sender<SendOutcome>),
    UpdateConfig(Box<ClientConfig>, oneshot::Sender<Result<()>>),
    Metrics(oneshot::Sender<MetricsSnapshot>),
    QueueLen(oneshot::Sender<usize>),
    Destroy(oneshot::Sender<()>),
}

// ----------------------------------------------------------------------------
// Client Handle
// ----------------------------------------------------------------------------

/// Cloneable handle to a running client
///
/// Dropping the last handle shuts the client down as [`destroy`] would.
///
/// [`destroy`]: WirelinkClient::destroy
#[derive(Clone)]
pub struct WirelinkClient {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl WirelinkClient {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { commands, state }
    }

    /// Connect, resolving once the transport is open
    ///
    /// Connecting while already connected or connecting is a no-op. A failed
    /// attempt returns its error; automatic reconnection continues in the
    /// background if enabled.
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await?
    }

    /// Close the connection and stop reconnecting; idempotent
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Run a message through the outgoing chain and send or queue it
    pub async fn send(&self, message: Message) -> Result<SendOutcome> {
        self.request(|reply| Command::Send(message, reply)).await
    }

    /// Convenience for `send(Message::new(kind, data))`
    pub async fn send_data(
        &self,
        kind: impl Into<MessageType>,
        data: serde_json::Value,
    ) -> Result<SendOutcome> {
        self.send(Message::new(kind, data)).await
    }

    /// Validate and apply a new configuration
    pub async fn update_config(&self, config: ClientConfig) -> Result<()> {
        self.request(|reply| Command::UpdateConfig(Box::new(config), reply))
            .await?
    }

    pub async fn metrics(&self) -> Result<MetricsSnapshot> {
        self.request(Command::Metrics).await
    }

    /// Messages waiting in the outbound queue
    pub async fn queue_len(&self) -> Result<usize> {
        self.request(Command::QueueLen).await
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    /// Receiver that observes every published state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection state satisfies `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut receiver = self.state.clone();
        let state = receiver
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| WirelinkError::ClientClosed)?;
        Ok(state.clone())
    }

    /// Wait until the connection reaches `status`
    pub async fn wait_for_status(&self, status: ConnectionStatus) -> Result<ConnectionState> {
        self.wait_for(|state| state.status == status).await
    }

    /// Stop the client: timers cancelled, pending batches discarded,
    /// transport closed, handlers dropped
    pub async fn destroy(&self) -> Result<()> {
        match self.request(Command::Destroy).await {
            Ok(()) | Err(WirelinkError::ClientClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Whether the connection manager has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| WirelinkError::ClientClosed)?;
        response.await.map_err(|_| WirelinkError::ClientClosed)
    }
}

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

type Deadline = Option<Pin<Box<Sleep>>>;
type Pending<T> = Option<Pin<Box<dyn Future<Output = T> + Send>>>;

struct Connection {
    link: Box<dyn TransportHandle>,
    token: Option<AuthToken>,
}

enum AttemptError {
    Auth(AuthError),
    Transport(TransportError),
}

type AttemptResult = core::result::Result<Connection, AttemptError>;

/// Everything the builder hands to the manager
pub(crate) struct ManagerParts {
    pub config: ClientConfig,
    pub transport: Arc<dyn Transport>,
    pub token_provider: Option<SharedTokenProvider>,
    pub time_source: SharedTimeSource,
    pub chain: MiddlewareChain,
    pub queue: MessageQueue,
    pub handlers: Handlers,
    pub commands: mpsc::Receiver<Command>,
    pub state: watch::Sender<ConnectionState>,
    pub batches: mpsc::UnboundedReceiver<Batch>,
}

/// The task behind a [`WirelinkClient`]
pub(crate) struct ConnectionManager {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    token_provider: Option<SharedTokenProvider>,
    time_source: SharedTimeSource,
    chain: MiddlewareChain,
    queue: MessageQueue,
    metrics: MetricsCollector,
    machine: StateMachine,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatMonitor,
    handlers: Handlers,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    batches: mpsc::UnboundedReceiver<Batch>,

    link: Option<Box<dyn TransportHandle>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    attempt: Pending<AttemptResult>,
    attempt_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    refresh: Pending<core::result::Result<AuthToken, AuthError>>,
    token: Option<AuthToken>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    reconnecting: bool,
    auth_retry_used: bool,

    reconnect_at: Deadline,
    heartbeat_at: Deadline,
    heartbeat_deadline: Deadline,
    refresh_at: Deadline,
    flush_at: Deadline,
}

impl ConnectionManager {
    pub(crate) fn new(parts: ManagerParts) -> Self {
        let ManagerParts {
            config,
            transport,
            token_provider,
            time_source,
            chain,
            queue,
            handlers,
            commands,
            state,
            batches,
        } = parts;

        let mut metrics = MetricsCollector::new(config.quality.clone(), time_source.clone());
        metrics.set_queue_depth(queue.len());

        Self {
            transport,
            token_provider,
            chain,
            queue,
            metrics,
            machine: StateMachine::new(time_source.clone()),
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            heartbeat: HeartbeatMonitor::new(config.heartbeat.clone()),
            handlers,
            commands,
            state_tx: state,
            batches,
            time_source,
            config,
            link: None,
            events: None,
            attempt: None,
            attempt_events: None,
            refresh: None,
            token: None,
            connect_waiters: Vec::new(),
            reconnecting: false,
            auth_retry_used: false,
            reconnect_at: None,
            heartbeat_at: None,
            heartbeat_deadline: None,
            refresh_at: None,
            flush_at: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(url = %self.config.url, "Connection manager started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Destroy(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All client handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },

                Some(batch) = self.batches.recv() => self.dispatch_batch(&batch),

                result = settle(&mut self.attempt) => {
                    self.attempt = None;
                    self.finish_attempt(result).await;
                }

                event = next_event(&mut self.events) => self.handle_transport_event(event).await,

                result = settle(&mut self.refresh) => {
                    self.refresh = None;
                    self.finish_refresh(result).await;
                }

                _ = expire(&mut self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.retry();
                }

                _ = expire(&mut self.heartbeat_at) => {
                    self.heartbeat_at = None;
                    self.send_heartbeat().await;
                }

                _ = expire(&mut self.heartbeat_deadline) => {
                    self.heartbeat_deadline = None;
                    self.heartbeat_missed().await;
                }

                _ = expire(&mut self.refresh_at) => {
                    self.refresh_at = None;
                    self.start_refresh();
                }

                _ = expire(&mut self.flush_at) => {
                    self.flush_at = None;
                    self.flush_queue_slice().await;
                }
            }
        }

        info!("Connection manager stopped");
    }

    // ---- Commands ----

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.connect(reply),
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Send(message, reply) => {
                let outcome = self.send(message).await;
                let _ = reply.send(outcome);
            }
            Command::UpdateConfig(config, reply) => {
                let _ = reply.send(self.update_config(*config));
            }
            Command::Metrics(reply) => {
                self.metrics.set_queue_depth(self.queue.len());
                let _ = reply.send(self.metrics.snapshot(self.chain.stats()));
            }
            Command::QueueLen(reply) => {
                let _ = reply.send(self.queue.len());
            }
            // Handled by the run loop
            Command::Destroy(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.machine.status() {
            ConnectionStatus::Connected | ConnectionStatus::RateLimited => {
                let _ = reply.send(Ok(()));
            }
            ConnectionStatus::Connecting => self.connect_waiters.push(reply),
            ConnectionStatus::Disconnected
            | ConnectionStatus::Failed
            | ConnectionStatus::Reconnecting
            | ConnectionStatus::Disconnecting => {
                // An explicit connect starts a fresh retry budget
                self.reconnect_at = None;
                self.policy.reset();
                self.machine.set_reconnect_attempts(0);
                self.reconnecting = false;
                self.auth_retry_used = false;
                self.connect_waiters.push(reply);
                if self.transition(ConnectionEvent::Connect) {
                    self.start_attempt();
                } else {
                    self.fail_waiters(|| TransportError::NotConnected.into());
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.machine.status() == ConnectionStatus::Disconnected {
            self.chain.flush_all();
            return;
        }

        info!("Disconnecting");
        self.transition(ConnectionEvent::DisconnectRequested);
        self.reconnect_at = None;
        self.attempt = None;
        self.attempt_events = None;
        self.chain.flush_all();
        self.teardown_link(Some(CLOSE_NORMAL), "client disconnect").await;
        self.transition(ConnectionEvent::Closed);
        self.fail_waiters(|| {
            TransportError::Closed {
                code: Some(CLOSE_NORMAL),
                reason: "disconnected by client".into(),
            }
            .into()
        });
    }

    async fn send(&mut self, message: Message) -> SendOutcome {
        let Some(mut message) = self.chain.process_outgoing(message) else {
            return SendOutcome::Dropped;
        };
        message.ensure_envelope(self.time_source.now());

        // Older queued messages go first
        let writable = self.machine.status() == ConnectionStatus::Connected
            && self.link.is_some()
            && self.queue.is_empty();
        if !writable {
            self.enqueue(message);
            if self.machine.status() == ConnectionStatus::Connected && self.flush_at.is_none() {
                self.flush_at = Some(Box::pin(sleep(Duration::ZERO)));
            }
            return SendOutcome::Queued;
        }

        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, kind = %message.kind, "Cannot encode outgoing message");
                return SendOutcome::Dropped;
            }
        };
        match self.write(text).await {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                warn!(error = %e, "Send failed, queueing message");
                self.metrics.record_error(ErrorKind::Send, e.to_string());
                self.enqueue(message);
                self.connection_failed(e).await;
                SendOutcome::Queued
            }
        }
    }

    fn update_config(&mut self, config: ClientConfig) -> Result<()> {
        config.validate()?;

        self.chain.reconfigure(&config);
        self.policy.set_config(config.reconnect.clone());
        self.queue.resize(config.message_queue.max_size);
        self.metrics.set_thresholds(config.quality.clone());
        self.metrics.set_queue_depth(self.queue.len());
        self.heartbeat.set_config(config.heartbeat.clone());
        self.config = config;

        if !self.heartbeat.is_enabled() {
            self.heartbeat_at = None;
            self.heartbeat_deadline = None;
            self.heartbeat.reset();
        } else if self.machine.status().is_open() && self.heartbeat_at.is_none() {
            self.arm_heartbeat();
        }
        debug!("Configuration updated");
        Ok(())
    }

    // ---- Connection Attempts ----

    fn start_attempt(&mut self) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.attempt_events = Some(events_rx);

        let transport = self.transport.clone();
        let provider = self.token_provider.clone();
        let auth = self.config.authentication.clone();
        let url = self.config.url.clone();
        let protocols = self.config.protocols.clone();
        let connect_timeout = self.config.connection_timeout();

        debug!(url = %url, "Opening transport");
        self.attempt = Some(Box::pin(open_connection(
            transport,
            provider,
            auth,
            url,
            protocols,
            connect_timeout,
            events_tx,
        )));
    }

    async fn finish_attempt(&mut self, result: AttemptResult) {
        let events = self.attempt_events.take();
        match result {
            Ok(Connection { link, token }) => {
                self.link = Some(link);
                self.events = events;
                self.token = token;
                self.on_connected();
            }
            Err(AttemptError::Auth(e)) => self.auth_failed(e).await,
            Err(AttemptError::Transport(e @ TransportError::InvalidUrl { .. })) => {
                error!(error = %e, "Cannot connect to an invalid URL");
                self.metrics.record_error(ErrorKind::Transport, e.to_string());
                self.emit_error(ClientErrorEvent::Transport(e.clone()));
                self.transition(ConnectionEvent::ConnectionAbandoned {
                    reason: e.to_string(),
                });
                self.fail_waiters(|| e.clone().into());
            }
            Err(AttemptError::Transport(e)) => self.connection_failed(e).await,
        }
    }

    fn on_connected(&mut self) {
        self.transition(ConnectionEvent::Opened);
        self.policy.reset();
        self.heartbeat.reset();
        if self.reconnecting {
            self.metrics.record_reconnection();
        }
        self.reconnecting = false;
        self.metrics.mark_recovered();
        info!(url = %self.config.url, "Connected");

        self.arm_heartbeat();
        self.arm_refresh();
        if !self.queue.is_empty() {
            self.flush_at = Some(Box::pin(sleep(Duration::ZERO)));
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn retry(&mut self) {
        if self.machine.status() != ConnectionStatus::Reconnecting {
            return;
        }
        info!(attempt = self.policy.attempt_count(), "Reconnecting");
        self.reconnecting = true;
        if self.transition(ConnectionEvent::Connect) {
            self.start_attempt();
        }
    }

    /// Handle a lost or failed connection: schedule a retry, give up, or stop
    async fn connection_failed(&mut self, error: TransportError) {
        let status = self.machine.status();
        if !matches!(
            status,
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::RateLimited
        ) {
            return;
        }

        let reason = error.to_string();
        warn!(error = %reason, %status, "Connection lost");
        self.teardown_link(None, "connection lost").await;
        self.metrics.record_error(ErrorKind::Transport, reason.clone());
        self.emit_error(ClientErrorEvent::Transport(error.clone()));

        if !self.config.reconnect.enabled {
            self.transition(ConnectionEvent::ConnectionAbandoned { reason });
        } else if let Some(delay) = self.policy.next_delay() {
            self.machine.set_reconnect_attempts(self.policy.attempt_count());
            self.transition(ConnectionEvent::ConnectionLost { reason });
            info!(
                attempt = self.policy.attempt_count(),
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.reconnect_at = Some(Box::pin(sleep(delay)));
        } else {
            let attempts = self.policy.attempt_count();
            if status.is_open() {
                self.transition(ConnectionEvent::ConnectionLost {
                    reason: reason.clone(),
                });
            }
            error!(attempts, "Reconnect attempts exhausted");
            self.transition(ConnectionEvent::RetriesExhausted { attempts });
            self.emit_error(ClientErrorEvent::RetriesExhausted { attempts });
        }

        self.fail_waiters(|| error.clone().into());
    }

    /// Close the transport and drop everything tied to the current connection
    async fn teardown_link(&mut self, code: Option<u16>, reason: &str) {
        self.heartbeat_at = None;
        self.heartbeat_deadline = None;
        self.refresh_at = None;
        self.refresh = None;
        self.flush_at = None;
        self.heartbeat.reset();
        self.events = None;
        if let Some(mut link) = self.link.take() {
            link.close(code, Some(reason.to_string())).await;
        }
    }

    // ---- Authentication ----

    async fn auth_failed(&mut self, error: AuthError) {
        warn!(error = %error, "Authentication failed");
        self.teardown_link(Some(CLOSE_NORMAL), "authentication failed").await;
        self.metrics.record_error(ErrorKind::Auth, error.to_string());
        self.transition(ConnectionEvent::AuthFailed {
            reason: error.to_string(),
        });
        self.emit_error(ClientErrorEvent::Auth(error.clone()));
        self.fail_waiters(|| error.clone().into());
    }

    async fn auth_required(&mut self, reason: String) {
        if !self.machine.status().is_open() {
            return;
        }
        warn!(%reason, "Server requires authentication");
        self.teardown_link(Some(CLOSE_NORMAL), "authentication required").await;
        self.metrics.record_error(ErrorKind::Auth, reason.clone());
        self.transition(ConnectionEvent::AuthFailed {
            reason: reason.clone(),
        });
        self.emit_error(ClientErrorEvent::AuthRequired { reason });

        let can_retry = self
            .config
            .authentication
            .as_ref()
            .is_some_and(|auth| auth.retry_on_auth_failure)
            && self.token_provider.is_some()
            && !self.auth_retry_used;
        if can_retry {
            info!("Fetching a fresh token and reconnecting");
            self.auth_retry_used = true;
            if self.transition(ConnectionEvent::Connect) {
                self.start_attempt();
            }
        }
    }

    fn arm_refresh(&mut self) {
        let (Some(auth), Some(token)) = (&self.config.authentication, &self.token) else {
            return;
        };
        let Some(refresh_at) = token.refresh_at(auth.refresh_threshold()) else {
            return;
        };
        let delay = refresh_at - self.time_source.now();
        debug!(delay_ms = delay, "Token refresh scheduled");
        self.refresh_at = Some(Box::pin(sleep(Duration::from_millis(delay))));
    }

    fn start_refresh(&mut self) {
        if !self.machine.status().is_open() {
            return;
        }
        let (Some(provider), Some(auth)) = (self.token_provider.clone(), &self.config.authentication)
        else {
            return;
        };
        let timeout = auth.token_timeout();
        debug!("Refreshing token");
        self.refresh = Some(Box::pin(async move {
            fetch_token(provider.as_ref(), timeout).await
        }));
    }

    async fn finish_refresh(&mut self, result: core::result::Result<AuthToken, AuthError>) {
        let token = match result {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                self.metrics.record_error(ErrorKind::Auth, e.to_string());
                self.emit_error(ClientErrorEvent::Auth(e));
                return;
            }
        };

        let mut refresh = Message::new(MessageType::AuthRefresh, json!({ "token": token.value }));
        refresh.ensure_envelope(self.time_source.now());
        if let Ok(text) = refresh.encode() {
            if let Err(e) = self.write(text).await {
                self.connection_failed(e).await;
                return;
            }
        }

        let already_due = token
            .refresh_at(
                self.config
                    .authentication
                    .as_ref()
                    .map_or(Duration::ZERO, |auth| auth.refresh_threshold()),
            )
            .is_some_and(|at| at <= self.time_source.now());
        self.token = Some(token);
        self.auth_retry_used = false;
        if already_due {
            warn!("Refreshed token is already inside the refresh window");
        } else {
            self.arm_refresh();
        }
    }

    // ---- Transport Events ----

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Opened) => debug!("Transport reported open"),
            Some(TransportEvent::Message(raw)) => self.handle_frame(raw).await,
            Some(TransportEvent::Closed { code, reason }) if code == Some(CLOSE_AUTH_REQUIRED) => {
                self.auth_required(reason).await;
            }
            Some(TransportEvent::Closed { code, reason }) => {
                self.connection_failed(TransportError::Closed { code, reason })
                    .await;
            }
            Some(TransportEvent::Error(reason)) => {
                let url = self.config.url.clone();
                self.connection_failed(TransportError::ConnectionFailed { url, reason })
                    .await;
            }
            None => {
                self.events = None;
                if self.link.is_some() {
                    self.connection_failed(TransportError::Closed {
                        code: None,
                        reason: "transport event stream ended".into(),
                    })
                    .await;
                }
            }
        }
    }

    async fn handle_frame(&mut self, raw: String) {
        let message = match Message::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                self.metrics.record_error(ErrorKind::Validation, e.to_string());
                return;
            }
        };

        match message.kind {
            MessageType::Heartbeat | MessageType::HeartbeatAck => self.heartbeat_reply(),
            MessageType::AuthRequired => {
                let reason = control_reason(&message)
                    .unwrap_or_else(|| "server requires authentication".to_string());
                self.auth_required(reason).await;
            }
            MessageType::RateLimited => {
                if self.machine.status() == ConnectionStatus::Connected {
                    warn!("Server is rate limiting, queueing sends");
                    self.flush_at = None;
                    self.transition(ConnectionEvent::Throttled);
                }
            }
            MessageType::RateLimitCleared => {
                if self.machine.status() == ConnectionStatus::RateLimited {
                    info!("Server lifted rate limiting");
                    self.transition(ConnectionEvent::ThrottleCleared);
                    if !self.queue.is_empty() {
                        self.flush_at = Some(Box::pin(sleep(Duration::ZERO)));
                    }
                }
            }
            _ => {
                if let Some(message) = self.chain.process_incoming(message) {
                    self.metrics.record_received(raw.len());
                    self.dispatch_message(&message);
                }
            }
        }
    }

    // ---- Heartbeat ----

    fn arm_heartbeat(&mut self) {
        if self.heartbeat.is_enabled() {
            self.heartbeat_at = Some(Box::pin(sleep(self.heartbeat.config().interval())));
        }
    }

    async fn send_heartbeat(&mut self) {
        if !self.machine.status().is_open() || !self.heartbeat.is_enabled() {
            return;
        }
        // One probe at a time; the reply window settles it before the next
        if self.heartbeat.awaiting_reply() {
            debug!("Heartbeat still outstanding, skipping probe");
            self.arm_heartbeat();
            return;
        }

        let probe = Message::heartbeat(self.time_source.now());
        let text = match probe.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Cannot encode heartbeat");
                return;
            }
        };
        if let Err(e) = self.write(text).await {
            self.connection_failed(e).await;
            return;
        }

        self.heartbeat.probe_sent(Instant::now());
        self.heartbeat_deadline = Some(Box::pin(sleep(self.heartbeat.config().timeout())));
        self.arm_heartbeat();
    }

    fn heartbeat_reply(&mut self) {
        let Some(rtt) = self.heartbeat.reply_received(Instant::now()) else {
            return;
        };
        self.heartbeat_deadline = None;
        self.metrics.record_latency(rtt);
        if let Some(latency) = self.heartbeat.latency_ms() {
            self.machine.set_latency(latency);
            self.state_tx.send_replace(self.machine.state().clone());
        }
    }

    async fn heartbeat_missed(&mut self) {
        let verdict = self.heartbeat.timeout_elapsed();
        let consecutive = match verdict {
            HeartbeatVerdict::Missed { consecutive } | HeartbeatVerdict::Dead { consecutive } => {
                consecutive
            }
        };
        warn!(consecutive, "Heartbeat reply missed");
        self.metrics
            .record_error(ErrorKind::Heartbeat, format!("{} heartbeats missed", consecutive));
        self.emit_error(ClientErrorEvent::HeartbeatMissed { consecutive });

        if let HeartbeatVerdict::Dead { .. } = verdict {
            let timeout_ms = self.heartbeat.config().timeout_ms;
            self.teardown_link(Some(CLOSE_HEARTBEAT_TIMEOUT), "heartbeat timeout")
                .await;
            self.connection_failed(TransportError::Timeout {
                duration_ms: timeout_ms,
            })
            .await;
        }
    }

    // ---- Outbound Queue ----

    fn enqueue(&mut self, message: Message) {
        if let QueuePush::DroppedOldest { .. } = self.queue.push(message) {
            self.metrics.record_queue_drop(1);
        }
        self.metrics.set_queue_depth(self.queue.len());
    }

    async fn flush_queue_slice(&mut self) {
        if self.machine.status() != ConnectionStatus::Connected || self.link.is_none() {
            return;
        }

        let slice = self.queue.take_batch(self.config.message_queue.batch_size);
        debug!(count = slice.len(), remaining = self.queue.len(), "Flushing queued messages");

        let mut pending = slice.into_iter();
        while let Some(message) = pending.next() {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Dropping queued message that cannot be encoded");
                    continue;
                }
            };
            if let Err(e) = self.write(text).await {
                let mut unsent = vec![message];
                unsent.extend(pending);
                let dropped = self.queue.requeue(unsent);
                self.metrics.record_queue_drop(dropped as u64);
                self.metrics.set_queue_depth(self.queue.len());
                self.connection_failed(e).await;
                return;
            }
        }

        self.metrics.set_queue_depth(self.queue.len());
        if !self.queue.is_empty() {
            self.flush_at = Some(Box::pin(sleep(self.config.message_queue.flush_interval())));
        }
    }

    // ---- Output ----

    async fn write(&mut self, text: String) -> core::result::Result<(), TransportError> {
        let Some(link) = self.link.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        let size = text.len();
        link.send(text).await?;
        self.metrics.record_sent(size);
        Ok(())
    }

    /// Apply a state machine event and publish the new state
    fn transition(&mut self, event: ConnectionEvent) -> bool {
        match self.machine.apply(event) {
            Ok(status) => {
                debug!(%status, "Connection state changed");
                let state = self.machine.state().clone();
                self.state_tx.send_replace(state.clone());
                for handler in &self.handlers.state {
                    guarded("state", || handler(&state));
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Ignoring invalid connection transition");
                false
            }
        }
    }

    fn dispatch_message(&self, message: &Message) {
        for handler in &self.handlers.message {
            guarded("message", || handler(message));
        }
    }

    fn dispatch_batch(&mut self, batch: &Batch) {
        for message in &batch.messages {
            let bytes = message.encode().map(|text| text.len()).unwrap_or_default();
            self.metrics.record_received(bytes);
        }
        for handler in &self.handlers.batch {
            guarded("batch", || handler(batch));
        }
    }

    fn emit_error(&self, event: ClientErrorEvent) {
        for handler in &self.handlers.error {
            guarded("error", || handler(&event));
        }
    }

    fn fail_waiters(&mut self, error: impl Fn() -> WirelinkError) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error()));
        }
    }

    // ---- Shutdown ----

    async fn shutdown(&mut self) {
        info!("Destroying client");
        // No callback may fire from here on
        self.handlers = Handlers::default();

        self.reconnect_at = None;
        self.attempt = None;
        self.attempt_events = None;
        self.chain.destroy();
        self.teardown_link(Some(CLOSE_NORMAL), "client destroyed").await;
        self.batches.close();

        match self.machine.status() {
            ConnectionStatus::Disconnected => {}
            ConnectionStatus::Disconnecting => {
                self.transition(ConnectionEvent::Closed);
            }
            _ => {
                self.transition(ConnectionEvent::DisconnectRequested);
                self.transition(ConnectionEvent::Closed);
            }
        }
        self.fail_waiters(|| WirelinkError::ClientClosed);
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// One connection attempt: fetch a token if needed, then open the transport
async fn open_connection(
    transport: Arc<dyn Transport>,
    provider: Option<SharedTokenProvider>,
    auth: Option<AuthConfig>,
    url: String,
    protocols: Vec<String>,
    connect_timeout: Duration,
    events: TransportEvents,
) -> AttemptResult {
    let mut request = OpenRequest::new(&url, &protocols).map_err(AttemptError::Transport)?;

    let mut token = None;
    if let Some(auth) = auth {
        let provider = provider.ok_or(AttemptError::Auth(AuthError::ProviderMissing))?;
        let fetched = fetch_token(provider.as_ref(), auth.token_timeout())
            .await
            .map_err(AttemptError::Auth)?;
        request = request
            .with_token(&fetched, auth.token_type)
            .map_err(AttemptError::Transport)?;
        token = Some(fetched);
    }

    let link = match tokio::time::timeout(connect_timeout, transport.open(request, events)).await {
        Ok(opened) => opened.map_err(AttemptError::Transport)?,
        Err(_) => {
            return Err(AttemptError::Transport(TransportError::Timeout {
                duration_ms: connect_timeout.as_millis() as u64,
            }))
        }
    };
    Ok(Connection { link, token })
}

/// Resolve when the deadline passes; never if there is none
async fn expire(deadline: &mut Deadline) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => core::future::pending().await,
    }
}

/// Resolve with the pending future's output; never if there is none
async fn settle<T>(slot: &mut Pending<T>) -> T {
    match slot {
        Some(future) => future.as_mut().await,
        None => core::future::pending().await,
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => core::future::pending().await,
    }
}

fn control_reason(message: &Message) -> Option<String> {
    let data = message.data.as_ref()?;
    data.get("reason")
        .or_else(|| data.get("message"))
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

fn guarded(kind: &'static str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        error!(handler = kind, "Handler panicked");
    }
}
