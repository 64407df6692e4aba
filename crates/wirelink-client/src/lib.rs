//! Wirelink Client
//!
//! The connection side of Wirelink: a per-client connection manager task that
//! owns the transport, reconnects with backoff, monitors liveness with
//! heartbeats, refreshes authentication tokens and drains the outbound queue.
//! Applications interact with it through a cloneable [`WirelinkClient`]
//! handle built by [`ClientBuilder`].

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod auth;
pub mod builder;
pub mod client;
pub mod heartbeat;
pub mod state;
pub mod transport;

#[cfg(feature = "websocket")]
pub mod websocket;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use auth::{fetch_token, token_provider_fn, AuthToken, SharedTokenProvider, TokenProvider};
pub use builder::{default_chain, ClientBuilder};
pub use client::{
    BatchCallback, ClientErrorEvent, ErrorHandler, MessageHandler, SendOutcome, StateHandler,
    WirelinkClient,
};
pub use heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
pub use state::{AuditEntry, ConnectionEvent, ConnectionState, ConnectionStatus, StateMachine};
pub use transport::{
    OpenRequest, Transport, TransportEvent, TransportEvents, TransportHandle, CLOSE_AUTH_REQUIRED,
    CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

// Core types callers need alongside the client
pub use wirelink_core::{
    ClientConfig, ConnectionQuality, Message, MessageType, MetricsSnapshot, Result, WirelinkError,
};
