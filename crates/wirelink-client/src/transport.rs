//! Transport interface
//!
//! The connection manager talks to the socket through two small traits:
//! [`Transport`] opens a connection and [`TransportHandle`] writes to and
//! closes it. Everything the socket reports (frames, closure, errors) arrives
//! as [`TransportEvent`]s on a channel handed to `open`, one channel per
//! connection.

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;
use wirelink_core::{AuthTokenType, TransportError};

use crate::auth::AuthToken;

/// Close code sent when the client disconnects on purpose
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent when heartbeats go unanswered
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;
/// Close code a server uses to demand re-authentication
pub const CLOSE_AUTH_REQUIRED: u16 = 4001;

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Something the socket reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is open
    Opened,
    /// A text frame arrived
    Message(String),
    /// The connection closed
    Closed { code: Option<u16>, reason: String },
    /// The socket failed; a `Closed` event may or may not follow
    Error(String),
}

/// Sender half given to a transport for one connection
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

// ----------------------------------------------------------------------------
// Open Request
// ----------------------------------------------------------------------------

/// Everything needed to open one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub url: String,
    pub protocols: Vec<String>,
    /// Extra handshake headers, e.g. `Authorization`
    pub headers: Vec<(String, String)>,
}

impl OpenRequest {
    /// Validate the URL and build a request without credentials
    pub fn new(url: &str, protocols: &[String]) -> Result<Self, TransportError> {
        let parsed = Url::parse(url).map_err(|_| TransportError::InvalidUrl {
            url: url.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss" | "http" | "https" | "memory") {
            return Err(TransportError::InvalidUrl {
                url: url.to_string(),
            });
        }

        Ok(Self {
            url: parsed.to_string(),
            protocols: protocols.to_vec(),
            headers: Vec::new(),
        })
    }

    /// Attach a token the way the server expects it
    pub fn with_token(
        mut self,
        token: &AuthToken,
        token_type: AuthTokenType,
    ) -> Result<Self, TransportError> {
        match token_type {
            AuthTokenType::Bearer => {
                self.headers
                    .push(("Authorization".to_string(), format!("Bearer {}", token.value)));
            }
            AuthTokenType::Query => {
                let mut url = Url::parse(&self.url).map_err(|_| TransportError::InvalidUrl {
                    url: self.url.clone(),
                })?;
                let existing: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(key, _)| key != "token")
                    .map(|(key, value)| (key.into_owned(), value.into_owned()))
                    .collect();
                url.query_pairs_mut()
                    .clear()
                    .extend_pairs(existing)
                    .append_pair("token", &token.value);
                self.url = url.to_string();
            }
        }
        Ok(self)
    }

    /// Value of a handshake header, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Factory for connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection; resolves once it is usable
    async fn open(
        &self,
        request: OpenRequest,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// An open connection
#[async_trait]
pub trait TransportHandle: Send {
    /// Write one text frame
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection; never fails
    async fn close(&mut self, code: Option<u16>, reason: Option<String>);
}
