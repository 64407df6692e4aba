//! Connection state machine
//!
//! The connection manager never assigns a status directly; it feeds
//! [`ConnectionEvent`]s into a [`StateMachine`], which rejects edges that make
//! no sense (for example `Opened` while `Disconnected`) and keeps a bounded
//! audit trail of every transition.

use core::fmt;
use serde::Serialize;
use std::collections::VecDeque;
use wirelink_core::{SharedTimeSource, StateTransitionError, Timestamp};

/// Transitions retained in the audit trail
pub const AUDIT_TRAIL_CAPACITY: usize = 100;

// ----------------------------------------------------------------------------
// Status and State
// ----------------------------------------------------------------------------

/// Connection status as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
    /// Connected, but the server asked us to slow down; sends are queued
    RateLimited,
    /// Reconnect attempts exhausted; only `connect()` leaves this state
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::RateLimited => "rate_limited",
            ConnectionStatus::Failed => "failed",
        }
    }

    /// Whether a transport is open in this status
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::RateLimited)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of the connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_connected: Option<Timestamp>,
    pub last_disconnected: Option<Timestamp>,
    /// Smoothed heartbeat round trip
    pub latency_ms: Option<f64>,
    pub last_error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_connected: None,
            last_disconnected: None,
            latency_ms: None,
            last_error: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Start a connection attempt
    Connect,
    /// The transport opened
    Opened,
    /// The transport failed or closed; a retry is scheduled
    ConnectionLost { reason: String },
    /// The transport failed and reconnection is disabled
    ConnectionAbandoned { reason: String },
    /// Authentication failed or the server demanded it
    AuthFailed { reason: String },
    /// No reconnect attempts left
    RetriesExhausted { attempts: u32 },
    /// The server signalled throttling
    Throttled,
    /// The server lifted throttling
    ThrottleCleared,
    /// The caller asked to disconnect
    DisconnectRequested,
    /// The transport finished closing
    Closed,
}

impl ConnectionEvent {
    fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connect => "connect",
            ConnectionEvent::Opened => "opened",
            ConnectionEvent::ConnectionLost { .. } => "connection_lost",
            ConnectionEvent::ConnectionAbandoned { .. } => "connection_abandoned",
            ConnectionEvent::AuthFailed { .. } => "auth_failed",
            ConnectionEvent::RetriesExhausted { .. } => "retries_exhausted",
            ConnectionEvent::Throttled => "throttled",
            ConnectionEvent::ThrottleCleared => "throttle_cleared",
            ConnectionEvent::DisconnectRequested => "disconnect_requested",
            ConnectionEvent::Closed => "closed",
        }
    }

    fn error(&self) -> Option<String> {
        match self {
            ConnectionEvent::ConnectionLost { reason }
            | ConnectionEvent::ConnectionAbandoned { reason }
            | ConnectionEvent::AuthFailed { reason } => Some(reason.clone()),
            ConnectionEvent::RetriesExhausted { attempts } => {
                Some(format!("gave up after {} reconnect attempts", attempts))
            }
            _ => None,
        }
    }
}

/// Audit trail entry for one transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub from_state: ConnectionStatus,
    pub to_state: ConnectionStatus,
    pub event: &'static str,
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

/// Validated connection state transitions
pub struct StateMachine {
    state: ConnectionState,
    audit_trail: VecDeque<AuditEntry>,
    time_source: SharedTimeSource,
}

impl StateMachine {
    pub fn new(time_source: SharedTimeSource) -> Self {
        Self {
            state: ConnectionState::default(),
            audit_trail: VecDeque::with_capacity(AUDIT_TRAIL_CAPACITY),
            time_source,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    pub fn audit_trail(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit_trail.iter()
    }

    /// Status an event leads to from `from`, if the edge is legal
    pub fn next_status(from: ConnectionStatus, event: &ConnectionEvent) -> Option<ConnectionStatus> {
        use ConnectionEvent as E;
        use ConnectionStatus as S;

        let to = match (from, event) {
            (S::Disconnected | S::Failed | S::Reconnecting, E::Connect) => S::Connecting,
            (S::Connecting, E::Opened) => S::Connected,
            (S::Connecting | S::Connected | S::RateLimited, E::ConnectionLost { .. }) => {
                S::Reconnecting
            }
            (
                S::Connecting | S::Connected | S::RateLimited | S::Reconnecting,
                E::ConnectionAbandoned { .. } | E::AuthFailed { .. },
            ) => S::Disconnected,
            (S::Connecting | S::Reconnecting, E::RetriesExhausted { .. }) => S::Failed,
            (S::Connected, E::Throttled) => S::RateLimited,
            (S::RateLimited, E::ThrottleCleared) => S::Connected,
            (
                S::Connecting | S::Connected | S::RateLimited | S::Reconnecting | S::Failed,
                E::DisconnectRequested,
            ) => S::Disconnecting,
            (S::Disconnecting, E::Closed) => S::Disconnected,
            _ => return None,
        };
        Some(to)
    }

    /// Apply an event, returning the new status
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionStatus, StateTransitionError> {
        let from = self.state.status;
        let to = Self::next_status(from, &event).ok_or_else(|| {
            StateTransitionError::InvalidTransition {
                from_state: from.to_string(),
                event: event.name().to_string(),
            }
        })?;

        let now = self.time_source.now();
        match to {
            ConnectionStatus::Connected if from == ConnectionStatus::Connecting => {
                self.state.last_connected = Some(now);
                self.state.reconnect_attempts = 0;
                self.state.last_error = None;
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting | ConnectionStatus::Failed
                if from.is_open() || from == ConnectionStatus::Disconnecting =>
            {
                self.state.last_disconnected = Some(now);
            }
            _ => {}
        }
        if let Some(error) = event.error() {
            self.state.last_error = Some(error);
        }
        if !to.is_open() {
            self.state.latency_ms = None;
        }
        self.state.status = to;

        if self.audit_trail.len() == AUDIT_TRAIL_CAPACITY {
            self.audit_trail.pop_front();
        }
        self.audit_trail.push_back(AuditEntry {
            timestamp: now,
            from_state: from,
            to_state: to,
            event: event.name(),
        });

        Ok(to)
    }

    pub fn set_reconnect_attempts(&mut self, attempts: u32) {
        self.state.reconnect_attempts = attempts;
    }

    pub fn set_latency(&mut self, latency_ms: f64) {
        self.state.latency_ms = Some(latency_ms);
    }

    pub fn set_last_error(&mut self, error: impl Into<String>) {
        self.state.last_error = Some(error.into());
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wirelink_core::ManualTimeSource;

    fn machine() -> (StateMachine, ManualTimeSource) {
        let clock = ManualTimeSource::new_at(1_000);
        (StateMachine::new(Arc::new(clock.clone())), clock)
    }

    fn lost() -> ConnectionEvent {
        ConnectionEvent::ConnectionLost {
            reason: "socket reset".into(),
        }
    }

    #[test]
    fn test_connect_lifecycle() {
        let (mut machine, clock) = machine();

        assert_eq!(machine.apply(ConnectionEvent::Connect), Ok(ConnectionStatus::Connecting));
        clock.advance(10);
        assert_eq!(machine.apply(ConnectionEvent::Opened), Ok(ConnectionStatus::Connected));
        assert_eq!(machine.state().last_connected, Some(Timestamp::new(1_010)));

        assert_eq!(
            machine.apply(ConnectionEvent::DisconnectRequested),
            Ok(ConnectionStatus::Disconnecting)
        );
        clock.advance(5);
        assert_eq!(machine.apply(ConnectionEvent::Closed), Ok(ConnectionStatus::Disconnected));
        assert_eq!(machine.state().last_disconnected, Some(Timestamp::new(1_015)));
        assert_eq!(machine.audit_trail().count(), 4);
    }

    #[test]
    fn test_reconnect_until_failed() {
        let (mut machine, _) = machine();
        machine.apply(ConnectionEvent::Connect).unwrap();
        machine.apply(ConnectionEvent::Opened).unwrap();

        assert_eq!(machine.apply(lost()), Ok(ConnectionStatus::Reconnecting));
        machine.set_reconnect_attempts(1);
        assert_eq!(machine.apply(ConnectionEvent::Connect), Ok(ConnectionStatus::Connecting));
        assert_eq!(
            machine.apply(ConnectionEvent::RetriesExhausted { attempts: 1 }),
            Ok(ConnectionStatus::Failed)
        );
        assert_eq!(
            machine.state().last_error.as_deref(),
            Some("gave up after 1 reconnect attempts")
        );

        // Only an explicit connect leaves `failed`
        assert!(machine.apply(lost()).is_err());
        assert_eq!(machine.apply(ConnectionEvent::Connect), Ok(ConnectionStatus::Connecting));
        machine.apply(ConnectionEvent::Opened).unwrap();
        assert_eq!(machine.state().reconnect_attempts, 0);
        assert_eq!(machine.state().last_error, None);
    }

    #[test]
    fn test_throttling() {
        let (mut machine, _) = machine();
        machine.apply(ConnectionEvent::Connect).unwrap();
        assert!(machine.apply(ConnectionEvent::Throttled).is_err());

        machine.apply(ConnectionEvent::Opened).unwrap();
        assert_eq!(machine.apply(ConnectionEvent::Throttled), Ok(ConnectionStatus::RateLimited));
        assert!(machine.status().is_open());
        assert_eq!(machine.apply(ConnectionEvent::ThrottleCleared), Ok(ConnectionStatus::Connected));
    }

    #[test]
    fn test_invalid_edges_are_rejected() {
        let (mut machine, _) = machine();

        let error = machine.apply(ConnectionEvent::Opened).unwrap_err();
        assert_eq!(
            error,
            StateTransitionError::InvalidTransition {
                from_state: "disconnected".into(),
                event: "opened".into(),
            }
        );
        assert!(machine.apply(ConnectionEvent::DisconnectRequested).is_err());
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);
        assert_eq!(machine.audit_trail().count(), 0);
    }

    #[test]
    fn test_auth_failure_disconnects() {
        let (mut machine, _) = machine();
        machine.apply(ConnectionEvent::Connect).unwrap();
        machine.apply(ConnectionEvent::Opened).unwrap();
        machine.set_latency(42.0);

        let status = machine
            .apply(ConnectionEvent::AuthFailed {
                reason: "token expired".into(),
            })
            .unwrap();
        assert_eq!(status, ConnectionStatus::Disconnected);
        assert_eq!(machine.state().latency_ms, None);
        assert_eq!(machine.state().last_error.as_deref(), Some("token expired"));
    }
}
