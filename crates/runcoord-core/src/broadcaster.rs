//! Live event fan-out to stream subscribers.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{event::Event, traits::SessionId};

/// Default per-subscriber buffer.
pub const DEFAULT_CAPACITY: usize = 256;

/// Which events a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamScope {
    /// Every session.
    All,
    /// A single session.
    Session(SessionId),
}

/// Item yielded to a live subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(Event),
    /// The subscriber fell behind and this many events were dropped (oldest
    /// first). It should refetch history to fill the gap.
    Lagged(u64),
}

/// Fans persisted events out to live subscribers.
///
/// Only the live tail is delivered: a subscriber sees events published after
/// it subscribed. Each subscriber has a bounded buffer; a subscriber that falls
/// behind loses the oldest events instead of slowing the publisher down.
pub struct EventBroadcaster {
    capacity: usize,
    disconnect_on_lag: bool,
    sessions: RwLock<HashMap<SessionId, broadcast::Sender<Event>>>,
    global: broadcast::Sender<Event>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBroadcaster {
    /// Create a broadcaster with the given per-subscriber buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (global, _) = broadcast::channel(capacity);
        Self {
            capacity,
            disconnect_on_lag: false,
            sessions: RwLock::new(HashMap::new()),
            global,
        }
    }

    /// End a subscriber's stream after it lags instead of notifying it.
    #[must_use]
    pub const fn with_disconnect_on_lag(mut self, disconnect: bool) -> Self {
        self.disconnect_on_lag = disconnect;
        self
    }

    /// Push an event to its session's subscribers and to global subscribers.
    ///
    /// Never blocks. Returns how many subscribers received it.
    pub fn publish(&self, event: &Event) -> usize {
        let mut delivered = self.global.send(event.clone()).unwrap_or(0);

        let sender = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.session_id)
            .cloned();

        if let Some(sender) = sender {
            match sender.send(event.clone()) {
                Ok(n) => delivered += n,
                Err(_) => self.prune(&event.session_id),
            }
        }

        tracing::trace!(
            event_id = event.id,
            session_id = %event.session_id,
            delivered,
            "Published event"
        );
        delivered
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self, scope: &StreamScope) -> broadcast::Receiver<Event> {
        match scope {
            StreamScope::All => self.global.subscribe(),
            StreamScope::Session(id) => self
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(id.clone())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe(),
        }
    }

    /// Number of live subscribers for a scope.
    #[must_use]
    pub fn subscriber_count(&self, scope: &StreamScope) -> usize {
        match scope {
            StreamScope::All => self.global.receiver_count(),
            StreamScope::Session(id) => self
                .sessions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(id)
                .map_or(0, broadcast::Sender::receiver_count),
        }
    }

    /// Stream of live deliveries for a scope.
    #[must_use]
    pub fn stream(&self, scope: &StreamScope) -> futures::stream::BoxStream<'static, Delivery> {
        let disconnect_on_lag = self.disconnect_on_lag;
        BroadcastStream::new(self.subscribe(scope))
            .map(|res| match res {
                Ok(event) => Delivery::Event(event),
                Err(BroadcastStreamRecvError::Lagged(n)) => Delivery::Lagged(n),
            })
            .scan(false, move |done, delivery| {
                if *done {
                    return future::ready(None);
                }
                if disconnect_on_lag && matches!(delivery, Delivery::Lagged(_)) {
                    *done = true;
                }
                future::ready(Some(delivery))
            })
            .boxed()
    }

    /// SSE stream (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn sse_stream(
        &self,
        scope: &StreamScope,
    ) -> futures::stream::BoxStream<
        'static,
        Result<axum::response::sse::Event, std::convert::Infallible>,
    > {
        self.stream(scope)
            .map(|delivery| {
                Ok(match delivery {
                    Delivery::Event(event) => event.to_sse_event(),
                    Delivery::Lagged(skipped) => {
                        tracing::warn!(skipped, "SSE subscriber lagged");
                        axum::response::sse::Event::default()
                            .event("lagged")
                            .data(serde_json::json!({ "skipped": skipped }).to_string())
                    }
                })
            })
            .boxed()
    }

    /// Drop every session channel nobody is listening to. Returns how many
    /// were removed.
    pub fn prune_idle(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, sender| sender.receiver_count() > 0);
        before - sessions.len()
    }

    fn prune(&self, session_id: &str) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions
            .get(session_id)
            .is_some_and(|s| s.receiver_count() == 0)
        {
            sessions.remove(session_id);
        }
    }
}
