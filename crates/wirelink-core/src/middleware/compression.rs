//! Payload compression
//!
//! Outgoing payloads whose JSON form exceeds [`COMPRESSION_THRESHOLD`] bytes
//! are replaced by a base64 string of their zlib-compressed JSON, and the
//! message is flagged through `metadata.compressed`. Incoming flagged messages
//! are restored to their original payload.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};
use tracing::{error, trace};

use super::{MessageMiddleware, MiddlewareResult, MiddlewareStats};
use crate::config::ClientConfig;
use crate::errors::CompressionError;
use crate::message::{Message, META_COMPRESSED, META_ORIGINAL_SIZE};

/// Payloads larger than this many serialized bytes are compressed
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Largest payload an incoming compressed message may expand to
pub const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Payload Codec
// ----------------------------------------------------------------------------

/// Compress a payload; returns the encoded text and the original size
pub fn compress_payload(data: &Value) -> Result<(String, usize), CompressionError> {
    let json = serde_json::to_vec(data).map_err(|e| CompressionError::Encode {
        reason: e.to_string(),
    })?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| CompressionError::Encode {
            reason: e.to_string(),
        })?;
    let compressed = encoder.finish().map_err(|e| CompressionError::Encode {
        reason: format!("finalization failed: {}", e),
    })?;

    Ok((STANDARD.encode(compressed), json.len()))
}

/// Restore a payload produced by [`compress_payload`]
///
/// Fails when the payload expands past `limit` bytes.
pub fn decompress_payload(encoded: &str, limit: usize) -> Result<Value, CompressionError> {
    let compressed = STANDARD
        .decode(encoded)
        .map_err(|e| CompressionError::Decode {
            reason: e.to_string(),
        })?;

    let decoder = ZlibDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut json)
        .map_err(|e| CompressionError::Decode {
            reason: e.to_string(),
        })?;
    if json.len() > limit {
        return Err(CompressionError::Decode {
            reason: format!("payload expands past {} bytes", limit),
        });
    }

    serde_json::from_slice(&json).map_err(|e| CompressionError::Decode {
        reason: e.to_string(),
    })
}

// ----------------------------------------------------------------------------
// Compression Middleware
// ----------------------------------------------------------------------------

/// Compresses large outgoing payloads and restores flagged incoming ones
pub struct CompressionMiddleware {
    enabled: bool,
    threshold: usize,
    max_decompressed: usize,
    stats: MiddlewareStats,
}

impl CompressionMiddleware {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            threshold: COMPRESSION_THRESHOLD,
            max_decompressed: MAX_DECOMPRESSED_SIZE,
            stats: MiddlewareStats::default(),
        }
    }

    /// Override the size threshold
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Override the expansion limit for incoming payloads
    pub fn with_max_decompressed(mut self, limit: usize) -> Self {
        self.max_decompressed = limit;
        self
    }

    fn compress(&self, mut message: Message) -> Message {
        let Some(data) = message.data.as_ref() else {
            return message;
        };
        if message.payload_size() <= self.threshold {
            return message;
        }

        match compress_payload(data) {
            Ok((encoded, original_size)) => {
                trace!(
                    original_size,
                    compressed_size = encoded.len(),
                    "Compressed outgoing payload"
                );
                message.data = Some(Value::String(encoded));
                message
                    .metadata
                    .insert(META_COMPRESSED.to_string(), Value::Bool(true));
                message
                    .metadata
                    .insert(META_ORIGINAL_SIZE.to_string(), Value::from(original_size));
                message
            }
            Err(e) => {
                error!(error = %e, "Compression failed, sending payload uncompressed");
                message
            }
        }
    }

    fn decompress(&mut self, mut message: Message) -> Option<Message> {
        let restored = match message.data.as_ref() {
            Some(Value::String(encoded)) => decompress_payload(encoded, self.max_decompressed),
            _ => Err(CompressionError::Decode {
                reason: "compressed payload is not a string".into(),
            }),
        };

        match restored {
            Ok(data) => {
                message.data = Some(data);
                message.metadata.remove(META_COMPRESSED);
                message.metadata.remove(META_ORIGINAL_SIZE);
                Some(message)
            }
            Err(e) => {
                error!(
                    error = %e,
                    kind = %message.kind,
                    id = message.id.as_deref().unwrap_or_default(),
                    "Dropping message with undecodable payload"
                );
                self.stats.errors += 1;
                None
            }
        }
    }
}

impl Default for CompressionMiddleware {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MessageMiddleware for CompressionMiddleware {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn incoming(&mut self, message: Message) -> MiddlewareResult {
        if !message.metadata_flag(META_COMPRESSED) {
            return Ok(self.stats.pass(Some(message)));
        }
        let restored = self.decompress(message);
        Ok(self.stats.pass(restored))
    }

    fn outgoing(&mut self, message: Message) -> MiddlewareResult {
        if !self.enabled || message.metadata_flag(META_COMPRESSED) {
            return Ok(self.stats.pass(Some(message)));
        }
        let message = self.compress(message);
        Ok(self.stats.pass(Some(message)))
    }

    fn reconfigure(&mut self, config: &ClientConfig) {
        self.enabled = config.compression;
    }

    fn stats(&self) -> MiddlewareStats {
        self.stats.clone()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn large_payload() -> Value {
        json!({ "body": "lorem ipsum ".repeat(200), "tags": ["a", "b"] })
    }

    #[test]
    fn test_small_payload_is_untouched() {
        let mut compression = CompressionMiddleware::default();
        let message = Message::new("notification", json!({"text": "short"}));

        let out = compression.outgoing(message.clone()).unwrap().unwrap();
        assert_eq!(out, message);
        assert!(!out.metadata_flag(META_COMPRESSED));
    }

    #[test]
    fn test_large_payload_round_trip() {
        let mut compression = CompressionMiddleware::default();
        let original = Message::new("document_change", large_payload()).with_id("doc-1");

        let wire = compression.outgoing(original.clone()).unwrap().unwrap();
        assert!(wire.metadata_flag(META_COMPRESSED));
        assert!(matches!(wire.data, Some(Value::String(_))));
        assert_eq!(
            wire.metadata.get(META_ORIGINAL_SIZE).and_then(Value::as_u64),
            Some(original.payload_size() as u64)
        );

        let restored = compression.incoming(wire).unwrap().unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_disabled_compression_still_decodes() {
        let mut sender = CompressionMiddleware::default();
        let mut receiver = CompressionMiddleware::new(false);
        let original = Message::new("notification", large_payload());

        assert_eq!(receiver.outgoing(original.clone()).unwrap(), Some(original.clone()));

        let wire = sender.outgoing(original.clone()).unwrap().unwrap();
        assert_eq!(receiver.incoming(wire).unwrap(), Some(original));
    }

    #[test]
    fn test_oversized_expansion_is_dropped() {
        let mut sender = CompressionMiddleware::default();
        let mut receiver = CompressionMiddleware::default().with_max_decompressed(256);
        let original = Message::new("document_change", large_payload());

        let wire = sender.outgoing(original.clone()).unwrap().unwrap();
        assert!(wire.payload_size() < original.payload_size());
        assert_eq!(receiver.incoming(wire).unwrap(), None);
        assert_eq!(receiver.stats().errors, 1);
    }

    #[test]
    fn test_corrupt_payload_is_dropped() {
        let mut compression = CompressionMiddleware::default();
        let corrupt = Message::new("notification", json!("not-base64!!"))
            .with_metadata(META_COMPRESSED, Value::Bool(true));

        assert_eq!(compression.incoming(corrupt).unwrap(), None);
        let stats = compression.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.errors, 1);
    }
}
