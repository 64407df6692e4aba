//! WebSocket transport over tokio-tungstenite

use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use std::borrow::Cow;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use wirelink_core::TransportError;

use crate::transport::{OpenRequest, Transport, TransportEvent, TransportEvents, TransportHandle};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(
        &self,
        request: OpenRequest,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let url = request.url.clone();
        let connect_failed = |reason: String| TransportError::ConnectionFailed {
            url: url.clone(),
            reason,
        };

        let mut handshake = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| connect_failed(e.to_string()))?;
        let headers = handshake.headers_mut();
        for (name, value) in &request.headers {
            let value = HeaderValue::from_str(value).map_err(|e| connect_failed(e.to_string()))?;
            let name = tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| connect_failed(e.to_string()))?;
            headers.insert(name, value);
        }
        if !request.protocols.is_empty() {
            let protocols = HeaderValue::from_str(&request.protocols.join(", "))
                .map_err(|e| connect_failed(e.to_string()))?;
            headers.insert("Sec-WebSocket-Protocol", protocols);
        }

        let (stream, response) = connect_async(handshake)
            .await
            .map_err(|e| connect_failed(e.to_string()))?;
        debug!(url = %request.url, status = %response.status(), "WebSocket connected");

        let (sink, source) = stream.split();
        let _ = events.send(TransportEvent::Opened);
        let reader = tokio::spawn(read_frames(source, events));

        Ok(Box::new(WebSocketHandle { sink, reader }))
    }
}

/// Forward incoming frames as transport events until the socket closes
async fn read_frames(mut source: futures::stream::SplitStream<WsStream>, events: TransportEvents) {
    while let Some(frame) = source.next().await {
        let event = match frame {
            Ok(WsMessage::Text(text)) => TransportEvent::Message(text),
            Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => TransportEvent::Message(text),
                Err(_) => {
                    warn!("Ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(WsMessage::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (None, String::new()),
                };
                let _ = events.send(TransportEvent::Closed { code, reason });
                return;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string()));
                break;
            }
        };
        if events.send(event).is_err() {
            trace!("Event receiver dropped, stopping WebSocket reader");
            return;
        }
    }

    let _ = events.send(TransportEvent::Closed {
        code: None,
        reason: "stream ended".into(),
    });
}

/// Write half of an open WebSocket
struct WebSocketHandle {
    sink: SplitSink<WsStream, WsMessage>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl TransportHandle for WebSocketHandle {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })
    }

    async fn close(&mut self, code: Option<u16>, reason: Option<String>) {
        let frame = code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.unwrap_or_default()),
        });
        if let Err(e) = self.sink.send(WsMessage::Close(frame)).await {
            debug!(error = %e, "Close frame not delivered");
        }
        let _ = self.sink.close().await;
        self.reader.abort();
    }
}

impl Drop for WebSocketHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
