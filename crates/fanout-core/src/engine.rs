//! The pub/sub engine: subscription registry plus transport adapter.
//!
//! One [`PubSub`] instance owns the publisher handle, the subscriber handle
//! and the registry, and is shared by every consumer in the process. Many
//! logical subscriptions multiplex over one physical subscription per
//! channel: the first subscriber to a channel triggers the physical
//! subscribe, later ones just join its ref-set, and the last one out triggers
//! the physical unsubscribe.

use crate::codec::{DecodeContext, Deserializer, Payload, PayloadCodec, Reviver, Serializer};
use crate::stream::EventStream;
use crate::trigger::{default_transform, SubscribeMode, Trigger, TriggerTransform};
use bytes::Bytes;
use fanout_transport::{EventSource, Publisher, Subscriber, TransportError, TransportEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Process-unique identifier of one logical subscription. Never reused.
pub type SubscriptionId = u64;

/// Callback invoked with each decoded payload for a subscription.
pub type OnMessage = Arc<dyn Fn(Payload) + Send + Sync>;

/// Engine errors.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Reviver and deserializer were both supplied at construction.
    #[error("Reviver and deserializer can't be used together")]
    Config,

    /// `unsubscribe` was called with an id that was never issued or was
    /// already released.
    #[error("There is no subscription of id {0}")]
    UnknownSubscription(SubscriptionId),

    /// The physical subscribe failed; no id was registered.
    #[error("Physical subscribe failed: {0}")]
    Subscribe(#[source] TransportError),

    /// The transport send failed.
    #[error("Publish failed: {0}")]
    Publish(#[source] TransportError),

    /// Payload encoding failed.
    #[error("Payload encoding failed: {0}")]
    Encode(#[source] crate::codec::HookError),
}

/// Engine construction options.
///
/// `reviver` and `deserializer` are mutually exclusive; supplying both makes
/// construction fail with [`PubSubError::Config`] before any transport
/// activity.
#[derive(Clone, Default)]
pub struct PubSubOptions {
    trigger_transform: Option<TriggerTransform>,
    serializer: Option<Serializer>,
    deserializer: Option<Deserializer>,
    reviver: Option<Reviver>,
}

impl PubSubOptions {
    /// Start from defaults: identity transform, JSON both ways.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the trigger-to-channel transform.
    #[must_use]
    pub fn trigger_transform(mut self, transform: TriggerTransform) -> Self {
        self.trigger_transform = Some(transform);
        self
    }

    /// Install a custom encoder for `publish`.
    #[must_use]
    pub fn serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Install a custom decoder for dispatch.
    #[must_use]
    pub fn deserializer(mut self, deserializer: Deserializer) -> Self {
        self.deserializer = Some(deserializer);
        self
    }

    /// Install a post-parse reviver applied during JSON decoding.
    #[must_use]
    pub fn reviver(mut self, reviver: Reviver) -> Self {
        self.reviver = Some(reviver);
        self
    }
}

struct Subscription {
    channel: String,
    mode: SubscribeMode,
    callback: OnMessage,
}

#[derive(Default)]
struct Registry {
    /// id -> subscription. Owned exclusively by the registry.
    subscriptions: HashMap<SubscriptionId, Subscription>,
    /// channel -> ids sharing its physical subscription, in registration
    /// order. Non-empty iff the physical subscription is live.
    refs: HashMap<String, Vec<SubscriptionId>>,
}

pub(crate) struct PubSubInner {
    publisher: Arc<dyn Publisher>,
    subscriber: Arc<dyn Subscriber>,
    transform: TriggerTransform,
    codec: PayloadCodec,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    dispatch_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// The pub/sub engine handle.
///
/// Cheap to clone; all clones share one engine instance.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<PubSubInner>,
}

impl PubSub {
    /// Build an engine over pre-built transport handles and spawn its
    /// dispatch task.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Config`] if both a reviver and a deserializer
    /// were supplied.
    pub fn with_handles(
        options: PubSubOptions,
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
        events: Box<dyn EventSource>,
    ) -> Result<Self, PubSubError> {
        if options.reviver.is_some() && options.deserializer.is_some() {
            return Err(PubSubError::Config);
        }

        let inner = Arc::new(PubSubInner {
            publisher,
            subscriber,
            transform: options.trigger_transform.unwrap_or_else(default_transform),
            codec: PayloadCodec::new(options.serializer, options.deserializer, options.reviver),
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(0),
            dispatch_task: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), events));
        *inner.dispatch_task.lock().expect("dispatch mutex poisoned") = Some(handle);

        Ok(Self { inner })
    }

    /// Publish a payload to a trigger.
    ///
    /// Completes when the transport has acknowledged the send.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the transport send fails.
    pub async fn publish<T: Serialize>(
        &self,
        trigger: &Trigger,
        payload: &T,
    ) -> Result<(), PubSubError> {
        let channel = (self.inner.transform)(trigger, SubscribeMode::Exact);
        let value = serde_json::to_value(payload).map_err(|e| PubSubError::Encode(e.into()))?;
        let bytes = self.inner.codec.encode(&value).map_err(PubSubError::Encode)?;

        trace!(channel = %channel, bytes = bytes.len(), "Publishing");
        self.inner
            .publisher
            .publish(&channel, bytes)
            .await
            .map_err(PubSubError::Publish)
    }

    /// Register a callback for a trigger.
    ///
    /// If the trigger's channel already has subscribers the new id joins the
    /// existing physical subscription; otherwise a physical subscribe (exact
    /// or pattern, per `mode`) is issued first. On transport failure nothing
    /// is registered.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Subscribe`] if the physical subscribe fails.
    pub async fn subscribe(
        &self,
        trigger: &Trigger,
        callback: OnMessage,
        mode: SubscribeMode,
    ) -> Result<SubscriptionId, PubSubError> {
        let channel = (self.inner.transform)(trigger, mode);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.inner.registry.lock().await;

        if let Some(refs) = registry.refs.get_mut(&channel) {
            if !refs.is_empty() {
                refs.push(id);
                registry.subscriptions.insert(
                    id,
                    Subscription {
                        channel: channel.clone(),
                        mode,
                        callback,
                    },
                );
                debug!(channel = %channel, id, shared = true, "Subscribed");
                return Ok(id);
            }
        }

        // First subscriber on this channel: issue the physical subscribe
        // while holding the registry lock, so concurrent subscribers to the
        // same channel cannot race it.
        let result = match mode {
            SubscribeMode::Exact => self.inner.subscriber.subscribe(&channel).await,
            SubscribeMode::Pattern => self.inner.subscriber.psubscribe(&channel).await,
        };
        result.map_err(PubSubError::Subscribe)?;

        registry.refs.insert(channel.clone(), vec![id]);
        registry.subscriptions.insert(
            id,
            Subscription {
                channel: channel.clone(),
                mode,
                callback,
            },
        );
        debug!(channel = %channel, id, shared = false, "Subscribed");
        Ok(id)
    }

    /// Release one logical subscription.
    ///
    /// The physical unsubscribe is issued only when the last id on the
    /// channel is released; a transport failure there is logged and does not
    /// fail the call.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::UnknownSubscription`] if `id` was never issued
    /// or was already released.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), PubSubError> {
        let mut registry = self.inner.registry.lock().await;

        let (channel, mode) = match registry.subscriptions.get(&id) {
            Some(sub) => (sub.channel.clone(), sub.mode),
            None => return Err(PubSubError::UnknownSubscription(id)),
        };

        let sole = registry
            .refs
            .get(&channel)
            .map(|refs| refs.len() == 1)
            .unwrap_or(false);

        if sole {
            let result = match mode {
                SubscribeMode::Exact => self.inner.subscriber.unsubscribe(&channel).await,
                SubscribeMode::Pattern => self.inner.subscriber.punsubscribe(&channel).await,
            };
            if let Err(err) = result {
                warn!(channel = %channel, error = %err, "Physical unsubscribe failed");
            }
            registry.refs.remove(&channel);
        } else if let Some(refs) = registry.refs.get_mut(&channel) {
            refs.retain(|&r| r != id);
        }

        // Always last, so a dispatch racing this call still sees a
        // consistent pair of maps.
        registry.subscriptions.remove(&id);
        debug!(channel = %channel, id, "Unsubscribed");
        Ok(())
    }

    /// Create a lazy, cancelable event stream over one or more triggers.
    ///
    /// Nothing is subscribed until the first pull. The stream is finite only
    /// on cancellation and not restartable; call again for a fresh stream.
    #[must_use]
    pub fn stream(
        &self,
        triggers: impl IntoIterator<Item = impl Into<Trigger>>,
        mode: SubscribeMode,
    ) -> EventStream {
        EventStream::new(
            self.clone(),
            triggers.into_iter().map(Into::into).collect(),
            mode,
        )
    }

    /// Stop the dispatch task and release both transport connections.
    pub async fn close(&self) {
        let handle = self
            .inner
            .dispatch_task
            .lock()
            .expect("dispatch mutex poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Err(err) = self.inner.subscriber.close().await {
            warn!(error = %err, "Closing subscriber connection failed");
        }
        if let Err(err) = self.inner.publisher.close().await {
            warn!(error = %err, "Closing publisher connection failed");
        }
        debug!("Engine closed");
    }

    /// The shared publisher connection.
    #[must_use]
    pub fn publisher(&self) -> &Arc<dyn Publisher> {
        &self.inner.publisher
    }

    /// The shared subscriber connection.
    #[must_use]
    pub fn subscriber(&self) -> &Arc<dyn Subscriber> {
        &self.inner.subscriber
    }
}

/// Drains the transport event stream and fans each event out through the
/// registry. Holds only a weak reference so an engine with no remaining
/// handles shuts down instead of being kept alive by its own task.
async fn dispatch_loop(
    inner: std::sync::Weak<PubSubInner>,
    mut events: Box<dyn EventSource>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match event {
            TransportEvent::Message { channel, payload } => {
                inner.dispatch(None, &channel, payload).await;
            }
            TransportEvent::PatternMessage {
                pattern,
                channel,
                payload,
            } => {
                inner.dispatch(Some(&pattern), &channel, payload).await;
            }
            TransportEvent::Error(message) => {
                // Side channel only: active streams stay listening.
                warn!(error = %message, "Transport connection error");
            }
        }
    }
    trace!("Dispatch loop ended");
}

impl PubSubInner {
    /// Deliver one raw event to every subscription on its key.
    ///
    /// The key is the pattern for pattern deliveries, the channel otherwise.
    /// An empty or absent ref-set drops the event silently; that is the
    /// normal race during teardown, never an error.
    async fn dispatch(&self, pattern: Option<&str>, channel: &str, raw: Bytes) {
        let registry = self.registry.lock().await;

        let key = pattern.unwrap_or(channel);
        let Some(ids) = registry.refs.get(key) else {
            trace!(key = %key, "No subscribers, dropping event");
            return;
        };
        if ids.is_empty() {
            return;
        }

        let payload = self.codec.decode(&raw, DecodeContext { channel, pattern });

        for id in ids {
            if let Some(sub) = registry.subscriptions.get(id) {
                (sub.callback)(payload.clone());
            }
        }
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub").finish_non_exhaustive()
    }
}
