//! # fanout-core
//!
//! A pub/sub multiplexing engine: a handful of physical channel
//! subscriptions on one shared transport connection pair fan out to many
//! independent, cancelable, pull-based event streams.
//!
//! The building blocks:
//!
//! - **Trigger** - logical event name or path, mapped to a physical channel
//! - **PayloadCodec** - pluggable encode/decode hooks (default: UTF-8 JSON)
//! - **PubSub** - subscription registry plus transport adapter
//! - **EventStream** - per-consumer push/pull queue bridge
//! - **FilteredStream** - predicate filtering over a stream
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐ publish ┌──────────┐          ┌─────────────┐
//! │ Producer  │────────▶│  PubSub  │─────────▶│  Transport  │
//! └───────────┘         │ registry │◀─────────│ (2 handles) │
//!                       └────┬─────┘ dispatch └─────────────┘
//!                            │ callbacks, registration order
//!                  ┌─────────┴─────────┐
//!                  ▼                   ▼
//!           ┌─────────────┐     ┌─────────────┐
//!           │ EventStream │     │ EventStream │   one per consumer
//!           └─────────────┘     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use fanout_core::{PubSub, PubSubOptions, SubscribeMode};
//! use fanout_transport::MemoryBroker;
//! use std::sync::Arc;
//!
//! let broker = MemoryBroker::new();
//! let (subscriber, events) = broker.subscriber();
//! let pubsub = PubSub::with_handles(
//!     PubSubOptions::new(),
//!     Arc::new(broker.publisher()),
//!     Arc::new(subscriber),
//!     Box::new(events),
//! )?;
//!
//! let stream = pubsub.stream(["MESSAGE_SEND"], SubscribeMode::Exact);
//! pubsub.publish(&"MESSAGE_SEND".into(), &payload).await?;
//! let next = stream.next().await?;
//! ```

pub mod codec;
pub mod engine;
pub mod filter;
pub mod stream;
pub mod trigger;

pub use codec::{DecodeContext, Deserializer, HookError, Payload, Reviver, Serializer};
pub use engine::{OnMessage, PubSub, PubSubError, PubSubOptions, SubscriptionId};
pub use filter::{with_filter, FilterArgs, FilterPredicate, FilteredStream, FnPredicate};
pub use stream::EventStream;
pub use trigger::{default_transform, PathSegment, SubscribeMode, Trigger, TriggerTransform};
