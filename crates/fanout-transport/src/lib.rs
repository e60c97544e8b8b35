//! # fanout-transport
//!
//! Transport abstraction layer for the fanout pub/sub engine.
//!
//! The engine talks to the wire through three object-safe traits:
//!
//! - **`Publisher`** - the single outbound connection, `publish(channel, bytes)`
//! - **`Subscriber`** - the single inbound connection's control surface
//!   (subscribe/unsubscribe, exact and pattern)
//! - **`EventSource`** - the stream of raw [`TransportEvent`]s arriving on the
//!   subscriber connection
//!
//! Any backend that can publish bytes to a named channel and emit
//! message / pattern-message events can sit behind these traits. The crate
//! ships one backend, [`MemoryBroker`], an in-process broker with Redis-style
//! glob pattern subscriptions, used for tests, benchmarks and single-process
//! deployments.
//!
//! ```rust,ignore
//! use fanout_transport::MemoryBroker;
//!
//! let broker = MemoryBroker::new();
//! let publisher = broker.publisher();
//! let (subscriber, events) = broker.subscriber();
//! ```

pub mod config;
pub mod memory;
pub mod pattern;
pub mod traits;

pub use config::BrokerConfig;
pub use memory::{MemoryBroker, MemoryEvents, MemoryPublisher, MemorySubscriber};
pub use traits::{EventSource, Publisher, Subscriber, TransportError, TransportEvent};
