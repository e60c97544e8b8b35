//! The bridge from callback-driven dispatch to pull-based consumption.
//!
//! Each [`EventStream`] owns a push/pull queue pair: the push queue buffers
//! produced-but-unconsumed payloads, the pull queue holds unresolved consumer
//! requests as oneshot senders. At most one of the two is ever non-empty.
//! Awaiting an empty pull is the sole suspension point; it resumes exactly
//! when a dispatch callback pushes a value or when the stream is torn down.
//!
//! Lifecycle is `Init -> Listening -> Done`: the first `next` lazily
//! subscribes every configured trigger, `close`/`fail` tear everything down,
//! and `Done` is terminal.

use crate::codec::Payload;
use crate::engine::{OnMessage, PubSub, PubSubError, SubscriptionId};
use crate::trigger::{SubscribeMode, Trigger};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

enum PullSignal {
    Item(Payload),
    End,
}

#[derive(Default)]
struct Queues {
    /// Produced-but-unconsumed payloads. Unbounded by design: there is no
    /// backpressure signal to the producer, a slow consumer grows memory.
    push: VecDeque<Payload>,
    /// Unresolved consumer requests, oldest first.
    pull: VecDeque<oneshot::Sender<PullSignal>>,
    done: bool,
}

struct StreamShared {
    queues: Mutex<Queues>,
}

impl StreamShared {
    /// Resolve the oldest pending pull, or buffer the payload.
    fn push_value(&self, payload: Payload) {
        let mut queues = self.queues.lock().expect("queue mutex poisoned");
        if queues.done {
            return;
        }
        let mut payload = payload;
        while let Some(tx) = queues.pull.pop_front() {
            match tx.send(PullSignal::Item(payload)) {
                Ok(()) => return,
                // The pull was abandoned (its future dropped); try the next.
                Err(PullSignal::Item(returned)) => payload = returned,
                Err(PullSignal::End) => unreachable!("push never sends End"),
            }
        }
        queues.push.push_back(payload);
    }

    /// Mark the stream done and clear both queues, resolving every pending
    /// pull with end-of-stream. Idempotent.
    fn finish(&self) {
        let pending = {
            let mut queues = self.queues.lock().expect("queue mutex poisoned");
            queues.done = true;
            queues.push.clear();
            queues.pull.drain(..).collect::<Vec<_>>()
        };
        for tx in pending {
            let _ = tx.send(PullSignal::End);
        }
    }

    fn is_done(&self) -> bool {
        self.queues.lock().expect("queue mutex poisoned").done
    }
}

#[derive(Default)]
struct ListenState {
    listening: bool,
    ids: Vec<SubscriptionId>,
}

/// A lazy, cancelable, pull-based stream of decoded payloads over one or
/// more triggers.
///
/// Created by [`PubSub::stream`]. Nothing is subscribed until the first call
/// to [`next`](Self::next). The stream ends only when cancelled via
/// [`close`](Self::close) or [`fail`](Self::fail); once ended it is terminal
/// and every further `next` returns `Ok(None)`.
///
/// All operations take `&self`: several pulls may be outstanding at once
/// (they resolve oldest-first), and `close` may run while a pull is pending.
pub struct EventStream {
    pubsub: PubSub,
    triggers: Vec<Trigger>,
    mode: SubscribeMode,
    shared: Arc<StreamShared>,
    listen: tokio::sync::Mutex<ListenState>,
}

impl EventStream {
    pub(crate) fn new(pubsub: PubSub, triggers: Vec<Trigger>, mode: SubscribeMode) -> Self {
        Self {
            pubsub,
            triggers,
            mode,
            shared: Arc::new(StreamShared {
                queues: Mutex::new(Queues::default()),
            }),
            listen: tokio::sync::Mutex::new(ListenState::default()),
        }
    }

    /// Pull the next payload.
    ///
    /// The first call subscribes every configured trigger. Returns `Ok(None)`
    /// once the stream has been cancelled; that result is idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the lazy fan-out subscribe fails; no partial
    /// subscriptions are left behind in that case.
    pub async fn next(&self) -> Result<Option<Payload>, PubSubError> {
        if self.shared.is_done() {
            return Ok(None);
        }

        {
            let mut listen = self.listen.lock().await;
            // A concurrent close may have finished the stream while we
            // waited for the lock.
            if self.shared.is_done() {
                return Ok(None);
            }
            if !listen.listening {
                self.subscribe_all(&mut listen).await?;
            }
        }

        let rx = {
            let mut queues = self.shared.queues.lock().expect("queue mutex poisoned");
            if queues.done {
                return Ok(None);
            }
            if let Some(payload) = queues.push.pop_front() {
                return Ok(Some(payload));
            }
            let (tx, rx) = oneshot::channel();
            queues.pull.push_back(tx);
            rx
        };

        match rx.await {
            Ok(PullSignal::Item(payload)) => Ok(Some(payload)),
            // End, or the sender was dropped during teardown.
            Ok(PullSignal::End) | Err(_) => Ok(None),
        }
    }

    /// Cancel the stream (the iterator's `return`).
    ///
    /// Unsubscribes every trigger best-effort, resolves every pending pull
    /// with end-of-stream and clears both queues. Safe to call repeatedly
    /// and before any `next`; unsubscribing a trigger never subscribed is a
    /// no-op.
    pub async fn close(&self) {
        self.shared.finish();
        self.unsubscribe_all().await;
        debug!("Event stream closed");
    }

    /// Tear down like [`close`](Self::close) and hand `error` back to the
    /// caller.
    ///
    /// Pending pulls are resolved with end-of-stream, never retroactively
    /// failed; only the `fail` caller sees the error.
    pub async fn fail(&self, error: PubSubError) -> Result<(), PubSubError> {
        self.shared.finish();
        self.unsubscribe_all().await;
        debug!(error = %error, "Event stream failed");
        Err(error)
    }

    /// Whether the stream has been cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// Fan-out subscribe to every configured trigger, one callback per
    /// trigger. On failure, roll back the subscriptions made so far.
    async fn subscribe_all(&self, listen: &mut ListenState) -> Result<(), PubSubError> {
        for trigger in &self.triggers {
            let shared = Arc::clone(&self.shared);
            let callback: OnMessage = Arc::new(move |payload| shared.push_value(payload));
            match self.pubsub.subscribe(trigger, callback, self.mode).await {
                Ok(id) => listen.ids.push(id),
                Err(err) => {
                    for id in listen.ids.drain(..) {
                        if let Err(rollback) = self.pubsub.unsubscribe(id).await {
                            warn!(id, error = %rollback, "Rollback unsubscribe failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        listen.listening = true;
        trace!(triggers = self.triggers.len(), "Event stream listening");
        Ok(())
    }

    /// Best-effort release of every subscription this stream created. An
    /// individual failure never aborts the others.
    async fn unsubscribe_all(&self) {
        let ids = {
            let mut listen = self.listen.lock().await;
            std::mem::take(&mut listen.ids)
        };
        for id in ids {
            if let Err(err) = self.pubsub.unsubscribe(id).await {
                warn!(id, error = %err, "Unsubscribe during stream teardown failed");
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.shared.finish();
        let ids = std::mem::take(&mut self.listen.get_mut().ids);
        if ids.is_empty() {
            return;
        }
        // Explicit close() is the supported path; on plain drop the physical
        // unsubscribes can only happen if a runtime is still around.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pubsub = self.pubsub.clone();
            handle.spawn(async move {
                for id in ids {
                    if let Err(err) = pubsub.unsubscribe(id).await {
                        trace!(id, error = %err, "Unsubscribe on drop failed");
                    }
                }
            });
        } else {
            warn!(
                count = ids.len(),
                "Event stream dropped outside a runtime, leaking subscriptions"
            );
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("triggers", &self.triggers)
            .field("mode", &self.mode)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}
