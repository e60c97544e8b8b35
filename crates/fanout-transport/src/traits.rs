//! Transport abstraction traits.
//!
//! These traits define the interface the engine consumes, allowing it to be
//! backend-agnostic: one publisher connection, one subscriber connection, and
//! a stream of raw events arriving on the latter.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid channel or pattern name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Physical subscribe/unsubscribe failed.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A raw event emitted by the subscriber connection.
///
/// Pattern subscriptions produce [`TransportEvent::PatternMessage`], carrying
/// both the pattern that matched and the concrete channel the payload arrived
/// on. A connection subscribed to a channel exactly *and* through a covering
/// pattern receives the payload once per subscription, matching Redis
/// semantics.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message on an exactly-subscribed channel.
    Message {
        /// The channel the payload arrived on.
        channel: String,
        /// Raw payload bytes.
        payload: Bytes,
    },

    /// A message delivered through a pattern subscription.
    PatternMessage {
        /// The pattern that matched.
        pattern: String,
        /// The concrete channel the payload arrived on.
        channel: String,
        /// Raw payload bytes.
        payload: Bytes,
    },

    /// A connection-level error.
    ///
    /// These are reported out-of-band; they never terminate delivery.
    Error(String),
}

/// The outbound half of the transport: a single shared publisher connection.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish raw bytes to a channel.
    ///
    /// Completes when the transport has acknowledged the send.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Close the publisher connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// The control surface of the single shared subscriber connection.
///
/// Implementations must keep exact and pattern subscriptions independent:
/// unsubscribing a channel never touches a pattern of the same spelling, and
/// vice versa.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to a channel by exact name.
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Subscribe to every channel matching a glob pattern.
    async fn psubscribe(&self, pattern: &str) -> Result<(), TransportError>;

    /// Drop an exact channel subscription.
    ///
    /// Unsubscribing a channel that was never subscribed is a no-op.
    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Drop a pattern subscription.
    async fn punsubscribe(&self, pattern: &str) -> Result<(), TransportError>;

    /// Close the subscriber connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// The stream of raw events arriving on the subscriber connection.
///
/// Events are yielded in transport arrival order. `None` means the connection
/// closed and no further events will arrive.
#[async_trait]
pub trait EventSource: Send {
    /// Receive the next raw event.
    async fn recv(&mut self) -> Option<TransportEvent>;
}
