// ── Transport collaborator ──
//
// The shepherd never owns a broker connection. It publishes through a
// `Transport` and is fed inbound messages by whoever does.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },

    #[error("transport closed")]
    Closed,

    #[error("payload rejected by security hook: {0}")]
    Crypto(String),
}

/// One message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;
}

/// Payload crypto and client authorization hooks.
///
/// Every method has a pass-through default: identity crypto, allow all.
pub trait SecurityHooks: Send + Sync + 'static {
    fn encrypt(&self, _device_id: &str, payload: Bytes) -> Result<Bytes, TransportError> {
        Ok(payload)
    }

    fn decrypt(&self, _device_id: &str, payload: Bytes) -> Result<Bytes, TransportError> {
        Ok(payload)
    }

    fn authorize_connect(&self, _client_id: &str, _username: Option<&str>) -> bool {
        true
    }

    fn authorize_publish(&self, _client_id: &str, _topic: &str) -> bool {
        true
    }

    fn authorize_subscribe(&self, _client_id: &str, _topic: &str) -> bool {
        true
    }
}

/// The default [`SecurityHooks`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl SecurityHooks for PassThrough {}
