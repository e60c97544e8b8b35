//! Predicate filtering layered over event streams.
//!
//! [`with_filter`] wraps a stream factory and a predicate into a factory of
//! [`FilteredStream`]s: each pull keeps pulling the underlying stream until
//! the predicate accepts a payload. A predicate error counts as a non-match,
//! never as stream termination.

use crate::codec::{HookError, Payload};
use crate::engine::PubSubError;
use crate::stream::EventStream;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

/// The arguments a subscription resolver would receive alongside the
/// payload.
///
/// This mirrors the resolver calling convention (`args`, `context`, `info`)
/// without depending on any protocol layer; callers that have no such
/// context pass the default.
#[derive(Debug, Clone, Default)]
pub struct FilterArgs {
    /// Field arguments of the subscription request.
    pub args: Value,
    /// Per-request context.
    pub context: Value,
    /// Resolver info.
    pub info: Value,
}

/// An async-capable, fallible predicate over payloads.
#[async_trait]
pub trait FilterPredicate: Send + Sync {
    /// Decide whether `payload` should be emitted.
    ///
    /// # Errors
    ///
    /// Any error is treated by the filter as a non-match.
    async fn matches(&self, payload: &Payload, args: &FilterArgs) -> Result<bool, HookError>;
}

/// Adapter turning a plain closure into a [`FilterPredicate`].
pub struct FnPredicate<F>(pub F);

#[async_trait]
impl<F> FilterPredicate for FnPredicate<F>
where
    F: Fn(&Payload, &FilterArgs) -> bool + Send + Sync,
{
    async fn matches(&self, payload: &Payload, args: &FilterArgs) -> Result<bool, HookError> {
        Ok((self.0)(payload, args))
    }
}

/// Wrap a stream factory and a predicate into a factory of filtered streams.
///
/// Intended to be installed where a subscription's event stream is
/// requested: the returned closure is called once per subscription request
/// with that request's [`FilterArgs`].
pub fn with_filter<F>(
    factory: F,
    predicate: Arc<dyn FilterPredicate>,
) -> impl Fn(FilterArgs) -> FilteredStream
where
    F: Fn() -> EventStream,
{
    move |args| FilteredStream {
        inner: factory(),
        predicate: Arc::clone(&predicate),
        args,
    }
}

/// An [`EventStream`] that transparently skips payloads rejected by a
/// predicate.
///
/// Holds no queue state of its own; one external pull may drive any number
/// of underlying pulls before returning.
pub struct FilteredStream {
    inner: EventStream,
    predicate: Arc<dyn FilterPredicate>,
    args: FilterArgs,
}

impl FilteredStream {
    /// Build a filtered stream directly, without the factory indirection.
    #[must_use]
    pub fn new(inner: EventStream, predicate: Arc<dyn FilterPredicate>, args: FilterArgs) -> Self {
        Self {
            inner,
            predicate,
            args,
        }
    }

    /// Pull until the predicate accepts a payload or the underlying stream
    /// ends.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying stream's pull.
    pub async fn next(&self) -> Result<Option<Payload>, PubSubError> {
        loop {
            let Some(payload) = self.inner.next().await? else {
                return Ok(None);
            };
            match self.predicate.matches(&payload, &self.args).await {
                Ok(true) => return Ok(Some(payload)),
                Ok(false) => {}
                Err(err) => {
                    // Coerced to a non-match; the stream continues.
                    trace!(error = %err, "Filter predicate failed, skipping payload");
                }
            }
        }
    }

    /// Cancel the underlying stream.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Tear down the underlying stream and hand `error` back to the caller.
    ///
    /// # Errors
    ///
    /// Always returns `Err(error)`.
    pub async fn fail(&self, error: PubSubError) -> Result<(), PubSubError> {
        self.inner.fail(error).await
    }

    /// Whether the underlying stream has been cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PubSub, PubSubOptions};
    use crate::trigger::SubscribeMode;
    use fanout_transport::MemoryBroker;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::sleep;

    fn engine() -> PubSub {
        let broker = MemoryBroker::new();
        let publisher = Arc::new(broker.publisher());
        let (subscriber, events) = broker.subscriber();
        PubSub::with_handles(
            PubSubOptions::new(),
            publisher,
            Arc::new(subscriber),
            Box::new(events),
        )
        .unwrap()
    }

    fn author_is_system() -> Arc<dyn FilterPredicate> {
        Arc::new(FnPredicate(|payload: &Payload, _args: &FilterArgs| {
            payload
                .as_value()
                .and_then(|v| v.get("author"))
                .and_then(Value::as_str)
                == Some("system")
        }))
    }

    #[tokio::test]
    async fn test_filter_skips_non_matching() {
        let pubsub = engine();
        let factory = {
            let pubsub = pubsub.clone();
            move || pubsub.stream(["messages"], SubscribeMode::Exact)
        };
        let subscribe = with_filter(factory, author_is_system());
        let stream = subscribe(FilterArgs::default());

        let (first, _) = tokio::join!(stream.next(), async {
            sleep(Duration::from_millis(20)).await;
            for (author, content) in [
                ("alice", "one"),
                ("system", "two"),
                ("bob", "three"),
                ("system", "four"),
            ] {
                pubsub
                    .publish(&"messages".into(), &json!({"author": author, "content": content}))
                    .await
                    .unwrap();
            }
        });

        // Only matching payloads, in original relative order.
        assert_eq!(
            first.unwrap().unwrap().as_value(),
            Some(&json!({"author": "system", "content": "two"}))
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap().as_value(),
            Some(&json!({"author": "system", "content": "four"}))
        );
        stream.close().await;
    }

    #[tokio::test]
    async fn test_predicate_error_is_non_match() {
        struct Failing;

        #[async_trait]
        impl FilterPredicate for Failing {
            async fn matches(
                &self,
                payload: &Payload,
                _args: &FilterArgs,
            ) -> Result<bool, HookError> {
                match payload.as_value() {
                    Some(value) if value == &json!("boom") => Err("predicate exploded".into()),
                    Some(value) => Ok(value == &json!("keep")),
                    None => Ok(false),
                }
            }
        }

        let pubsub = engine();
        let stream = FilteredStream::new(
            pubsub.stream(["mixed"], SubscribeMode::Exact),
            Arc::new(Failing),
            FilterArgs::default(),
        );

        let (first, _) = tokio::join!(stream.next(), async {
            sleep(Duration::from_millis(20)).await;
            pubsub.publish(&"mixed".into(), &json!("boom")).await.unwrap();
            pubsub.publish(&"mixed".into(), &json!("keep")).await.unwrap();
        });

        // The failing payload was skipped, not fatal.
        assert_eq!(first.unwrap().unwrap().as_value(), Some(&json!("keep")));
        stream.close().await;
    }

    #[tokio::test]
    async fn test_filter_sees_request_args() {
        let predicate: Arc<dyn FilterPredicate> =
            Arc::new(FnPredicate(|payload: &Payload, args: &FilterArgs| {
                payload.as_value().and_then(|v| v.get("room")) == args.args.get("room")
            }));

        let pubsub = engine();
        let factory = {
            let pubsub = pubsub.clone();
            move || pubsub.stream(["rooms"], SubscribeMode::Exact)
        };
        let subscribe = with_filter(factory, predicate);
        let stream = subscribe(FilterArgs {
            args: json!({"room": "lobby"}),
            ..FilterArgs::default()
        });

        let (first, _) = tokio::join!(stream.next(), async {
            sleep(Duration::from_millis(20)).await;
            pubsub
                .publish(&"rooms".into(), &json!({"room": "kitchen"}))
                .await
                .unwrap();
            pubsub
                .publish(&"rooms".into(), &json!({"room": "lobby"}))
                .await
                .unwrap();
        });

        assert_eq!(
            first.unwrap().unwrap().as_value(),
            Some(&json!({"room": "lobby"}))
        );
        stream.close().await;
    }

    #[tokio::test]
    async fn test_close_delegates() {
        let pubsub = engine();
        let stream = FilteredStream::new(
            pubsub.stream(["quiet"], SubscribeMode::Exact),
            author_is_system(),
            FilterArgs::default(),
        );

        stream.close().await;
        assert!(stream.is_done());
        assert!(stream.next().await.unwrap().is_none());
    }
}
