//! Message bus seam
//!
//! The dispatcher only needs to subscribe and publish; connection handling
//! lives in the transport (see [`crate::mqtt`]), which reports what happens
//! on the wire as [`BusEvent`]s.

use async_trait::async_trait;
use bytes::Bytes;

/// Something that happened on the bus connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The broker accepted the connection (also after a reconnect)
    Connected,

    /// An inbound publish on a subscribed topic
    Message { topic: String, payload: Bytes },
}

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The broker rejected the connection
    #[error("Cannot connect to broker: {0}")]
    Refused(String),

    #[error("Bus client error: {0}")]
    Client(String),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Publish/subscribe operations used by the dispatcher
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}
