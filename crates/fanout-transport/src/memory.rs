//! In-process broker transport.
//!
//! [`MemoryBroker`] is a complete backend for the transport traits: many
//! publisher and subscriber handles share one broker, and every published
//! payload fans out to each subscriber whose exact-channel set or pattern set
//! covers the channel. A subscriber covered by both an exact subscription and
//! a matching pattern receives the payload once per subscription, matching
//! Redis semantics.

use crate::config::BrokerConfig;
use crate::pattern;
use crate::traits::{EventSource, Publisher, Subscriber, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// An in-process pub/sub broker.
///
/// Cheap to clone; all clones share the same subscriber table.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

struct BrokerShared {
    config: BrokerConfig,
    subscribers: DashMap<u64, SubscriberState>,
    next_id: AtomicU64,
}

struct SubscriberState {
    exact: HashSet<String>,
    patterns: HashSet<String>,
    tx: mpsc::Sender<TransportEvent>,
}

impl MemoryBroker {
    /// Create a broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        debug!("Creating memory broker with config: {:?}", config);
        Self {
            shared: Arc::new(BrokerShared {
                config,
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Create a publisher handle.
    #[must_use]
    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach a subscriber connection.
    ///
    /// Returns the control handle and the event stream for the connection.
    #[must_use]
    pub fn subscriber(&self) -> (MemorySubscriber, MemoryEvents) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.config.event_capacity);
        self.shared.subscribers.insert(
            id,
            SubscriberState {
                exact: HashSet::new(),
                patterns: HashSet::new(),
                tx,
            },
        );
        debug!(subscriber = id, "Attached subscriber connection");

        (
            MemorySubscriber {
                shared: Arc::clone(&self.shared),
                id,
                closed: AtomicBool::new(false),
            },
            MemoryEvents { rx },
        )
    }

    /// Number of attached subscriber connections.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerShared {
    fn fan_out(&self, channel: &str, payload: &Bytes) {
        for entry in self.subscribers.iter() {
            let state = entry.value();
            if state.exact.contains(channel) {
                deliver(
                    &state.tx,
                    TransportEvent::Message {
                        channel: channel.to_string(),
                        payload: payload.clone(),
                    },
                );
            }
            for pat in &state.patterns {
                if pattern::matches(pat, channel) {
                    deliver(
                        &state.tx,
                        TransportEvent::PatternMessage {
                            pattern: pat.clone(),
                            channel: channel.to_string(),
                            payload: payload.clone(),
                        },
                    );
                }
            }
        }
    }
}

fn deliver(tx: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            // At-most-once: a subscriber that cannot keep up loses events.
            warn!(?event, "Subscriber event buffer full, dropping event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            trace!("Subscriber event stream closed, dropping event");
        }
    }
}

/// Publisher handle for a [`MemoryBroker`].
pub struct MemoryPublisher {
    shared: Arc<BrokerShared>,
    closed: AtomicBool,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared
            .config
            .validate_channel_name(channel)
            .map_err(TransportError::InvalidChannel)?;

        trace!(channel = %channel, bytes = payload.len(), "Publishing");
        self.shared.fan_out(channel, &payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Subscriber control handle for a [`MemoryBroker`].
pub struct MemorySubscriber {
    shared: Arc<BrokerShared>,
    id: u64,
    closed: AtomicBool,
}

impl MemorySubscriber {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut SubscriberState) -> T,
    ) -> Result<T, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut state = self
            .shared
            .subscribers
            .get_mut(&self.id)
            .ok_or(TransportError::ConnectionClosed)?;
        Ok(f(state.value_mut()))
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.shared
            .config
            .validate_channel_name(channel)
            .map_err(TransportError::InvalidChannel)?;
        self.with_state(|state| {
            state.exact.insert(channel.to_string());
        })?;
        debug!(subscriber = self.id, channel = %channel, "Subscribed");
        Ok(())
    }

    async fn psubscribe(&self, pat: &str) -> Result<(), TransportError> {
        self.shared
            .config
            .validate_channel_name(pat)
            .map_err(TransportError::InvalidChannel)?;
        self.with_state(|state| {
            state.patterns.insert(pat.to_string());
        })?;
        debug!(subscriber = self.id, pattern = %pat, "Pattern subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.with_state(|state| {
            state.exact.remove(channel);
        })?;
        debug!(subscriber = self.id, channel = %channel, "Unsubscribed");
        Ok(())
    }

    async fn punsubscribe(&self, pat: &str) -> Result<(), TransportError> {
        self.with_state(|state| {
            state.patterns.remove(pat);
        })?;
        debug!(subscriber = self.id, pattern = %pat, "Pattern unsubscribed");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender ends the event stream.
        self.shared.subscribers.remove(&self.id);
        debug!(subscriber = self.id, "Subscriber connection closed");
        Ok(())
    }
}

/// Event stream for an attached subscriber connection.
pub struct MemoryEvents {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl EventSource for MemoryEvents {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_delivery() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        let (subscriber, mut events) = broker.subscriber();

        subscriber.subscribe("chat.room1").await.unwrap();
        publisher
            .publish("chat.room1", Bytes::from_static(b"hi"))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Message { channel, payload } => {
                assert_eq!(channel, "chat.room1");
                assert_eq!(&payload[..], b"hi");
            }
            other => panic!("Expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pattern_delivery() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        let (subscriber, mut events) = broker.subscriber();

        subscriber.psubscribe("chat.*").await.unwrap();
        publisher
            .publish("chat.room2", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::PatternMessage {
                pattern, channel, ..
            } => {
                assert_eq!(pattern, "chat.*");
                assert_eq!(channel, "chat.room2");
            }
            other => panic!("Expected PatternMessage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exact_and_pattern_deliver_independently() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        let (subscriber, mut events) = broker.subscriber();

        subscriber.subscribe("chat.room1").await.unwrap();
        subscriber.psubscribe("chat.*").await.unwrap();
        publisher
            .publish("chat.room1", Bytes::from_static(b"x"))
            .await
            .unwrap();

        // One copy per subscription, like Redis.
        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        let kinds = [&first, &second]
            .iter()
            .map(|e| matches!(e, TransportEvent::PatternMessage { .. }))
            .collect::<Vec<_>>();
        assert!(kinds.contains(&true) && kinds.contains(&false));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        let (subscriber, mut events) = broker.subscriber();

        subscriber.subscribe("news").await.unwrap();
        subscriber.unsubscribe("news").await.unwrap();
        // Unsubscribing again is a no-op.
        subscriber.unsubscribe("news").await.unwrap();

        publisher
            .publish("news", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_closed_connections_reject_operations() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        let (subscriber, mut events) = broker.subscriber();

        subscriber.close().await.unwrap();
        assert!(matches!(
            subscriber.subscribe("x").await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(events.recv().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);

        publisher.close().await.unwrap();
        assert!(matches!(
            publisher.publish("x", Bytes::new()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        let (subscriber, _events) = broker.subscriber();

        assert!(matches!(
            subscriber.subscribe("").await,
            Err(TransportError::InvalidChannel(_))
        ));
        assert!(matches!(
            publisher.publish("", Bytes::new()).await,
            Err(TransportError::InvalidChannel(_))
        ));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_events() {
        let broker = MemoryBroker::with_config(BrokerConfig {
            event_capacity: 2,
            ..BrokerConfig::default()
        });
        let publisher = broker.publisher();
        let (subscriber, mut events) = broker.subscriber();

        subscriber.subscribe("burst").await.unwrap();
        for i in 0..5u8 {
            publisher.publish("burst", Bytes::from(vec![i])).await.unwrap();
        }

        // The first two fit; the rest were dropped.
        let mut received = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), events.recv()).await
        {
            received.push(event);
        }
        assert_eq!(received.len(), 2);
    }
}
