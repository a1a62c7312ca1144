//! SSE router (C10), behind the `server` Cargo feature.
//!
//! A per-context registry of subscribers with kind-based filtering (§4.9). `route` fans one event
//! out to every matching subscriber without holding the registry lock across `send` (§5: "slow
//! subscribers MUST NOT block event production" / "Subscriber `send` is invoked without holding
//! the registry lock"). The router does not persist anything itself — replay is performed at
//! subscription time by reading from the [`EventRingBuffer`](crate::runtime::ring_buffer::EventRingBuffer)
//! the caller owns, gated by the client's `Last-Event-ID` (§4.9, §6).
//!
//! The HTTP egress ([`sse_handler`]) is grounded in the teacher's `mcp_server_builder.rs` pattern
//! of gating an axum-based surface behind an optional feature (`mcp-server` there, `server` here)
//! so the reactive core stays usable as a plain library without pulling in a web framework.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::runtime::event::Event;
use crate::runtime::ring_buffer::EventRingBuffer;

/// Bounded per-subscriber channel depth. A subscriber that can't keep up is closed with a
/// "slow consumer" reason (§5 backpressure option (b)) rather than blocking event production.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// One buffered-or-live frame delivered to a subscriber: the event plus the ring-buffer id it was
/// assigned (or recorded under, for a pre-replay frame), used as the SSE `id:` line.
#[derive(Debug, Clone)]
pub struct Frame {
    pub event_id: u64,
    pub event: Event,
}

/// A subscriber's filter configuration (§4.9). Filters are evaluated in this order: `task_id`,
/// `filter_internal`, `include_kinds`, `exclude_kinds`, then the custom predicate.
#[derive(Clone)]
pub struct SubscriptionConfig {
    pub context_id: String,
    pub task_id: Option<String>,
    /// Drops `internal:*` kinds and anything in a published debug list. Defaults to `true`.
    pub filter_internal: bool,
    /// When `Some`, only these kind names are delivered (evaluated after `filter_internal`).
    pub include_kinds: Option<Vec<String>>,
    /// Kind names never delivered, regardless of `include_kinds`.
    pub exclude_kinds: Vec<String>,
    /// An additional caller-supplied predicate, evaluated last.
    pub custom_predicate: Option<Arc<dyn Fn(&Event) -> bool + Send + Sync>>,
}

impl SubscriptionConfig {
    pub fn new(context_id: impl Into<String>) -> Self {
        SubscriptionConfig {
            context_id: context_id.into(),
            task_id: None,
            filter_internal: true,
            include_kinds: None,
            exclude_kinds: Vec::new(),
            custom_predicate: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_filter_internal(mut self, filter_internal: bool) -> Self {
        self.filter_internal = filter_internal;
        self
    }

    pub fn with_include_kinds(mut self, kinds: Vec<String>) -> Self {
        self.include_kinds = Some(kinds);
        self
    }

    pub fn with_exclude_kinds(mut self, kinds: Vec<String>) -> Self {
        self.exclude_kinds = kinds;
        self
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn Fn(&Event) -> bool + Send + Sync>) -> Self {
        self.custom_predicate = Some(predicate);
        self
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(task_id) = &self.task_id {
            if &event.task_id != task_id {
                return false;
            }
        }
        if self.filter_internal && event.is_internal() {
            return false;
        }
        let kind = event.kind_name();
        if let Some(include) = &self.include_kinds {
            if !include.iter().any(|k| k == &kind) {
                return false;
            }
        }
        if self.exclude_kinds.iter().any(|k| k == &kind) {
            return false;
        }
        if let Some(predicate) = &self.custom_predicate {
            if !predicate(event) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    id: u64,
    config: SubscriptionConfig,
    sender: mpsc::Sender<Frame>,
}

/// Registry mapping `contextId` to its set of subscribers. Mutations are serialized behind a
/// [`Mutex`]; `send` happens after the lock is dropped (§5).
#[derive(Default)]
pub struct SseRouter {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

/// A live handle returned by [`SseRouter::subscribe`]: the receiving half of the subscriber's
/// channel plus a `close` hook that unregisters it.
pub struct Subscription {
    pub receiver: mpsc::Receiver<Frame>,
    router: Arc<SseRouter>,
    context_id: String,
    subscriber_id: u64,
}

impl Subscription {
    /// Unregister this subscriber. Idempotent; routing to an already-closed subscriber is a no-op.
    pub fn close(&self) {
        self.router.remove(&self.context_id, self.subscriber_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl SseRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(SseRouter::default())
    }

    /// Register a new subscriber for `config.context_id` and return its live handle.
    pub fn subscribe(self: &Arc<Self>, config: SubscriptionConfig) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let context_id = config.context_id.clone();
        self.subscribers
            .lock()
            .unwrap()
            .entry(context_id.clone())
            .or_default()
            .push(Subscriber { id, config, sender });
        Subscription {
            receiver,
            router: Arc::clone(self),
            context_id,
            subscriber_id: id,
        }
    }

    fn remove(&self, context_id: &str, subscriber_id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(list) = subscribers.get_mut(context_id) {
            list.retain(|s| s.id != subscriber_id);
        }
    }

    /// Fan `event` (already assigned `event_id` by the ring buffer) out to every matching
    /// subscriber of `context_id`. A full channel closes that subscriber as a "slow consumer"
    /// (§5); other subscribers are unaffected (§4.9: "MUST NOT abort delivery to other
    /// subscribers").
    pub fn route(&self, context_id: &str, event: &Event, event_id: u64) {
        // Snapshot the matching senders while holding the lock, then send outside it.
        let matches: Vec<(u64, mpsc::Sender<Frame>)> = {
            let subscribers = self.subscribers.lock().unwrap();
            match subscribers.get(context_id) {
                Some(list) => list
                    .iter()
                    .filter(|s| s.config.matches(event))
                    .map(|s| (s.id, s.sender.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut slow = Vec::new();
        for (id, sender) in matches {
            let frame = Frame { event_id, event: event.clone() };
            match sender.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("subscriber {id} on context {context_id} is a slow consumer, closing");
                    slow.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(id);
                }
            }
        }
        if !slow.is_empty() {
            let mut subscribers = self.subscribers.lock().unwrap();
            if let Some(list) = subscribers.get_mut(context_id) {
                list.retain(|s| !slow.contains(&s.id));
            }
        }
    }

    /// Subscribe and perform reconnect replay (§4.9: "Replay (C9) is performed at subscription
    /// time before live routing begins"). Returns the subscription plus every buffered event the
    /// ring buffer still holds after `last_event_id`, in order. A caller with no prior
    /// `Last-Event-ID` passes `0`, receiving every retained event as "replay".
    pub fn subscribe_with_replay(
        self: &Arc<Self>,
        ring_buffer: &EventRingBuffer,
        config: SubscriptionConfig,
        last_event_id: u64,
    ) -> (Subscription, Vec<Frame>) {
        let context_id = config.context_id.clone();
        let subscription = self.subscribe(config.clone());
        let replay = ring_buffer.replay(&context_id, last_event_id);
        if replay.gap {
            log::warn!("replay gap for context {context_id}: requested since {last_event_id}, oldest retained entry is newer");
        }
        let frames = replay
            .events
            .into_iter()
            .filter(|buffered| config.matches(&buffered.event))
            .map(|buffered| Frame { event_id: buffered.event_id, event: buffered.event })
            .collect();
        (subscription, frames)
    }
}

#[cfg(feature = "server")]
pub mod http {
    //! Axum HTTP egress: `GET /events/:context_id` streaming `text/event-stream`, replaying
    //! buffered events strictly after the client's `Last-Event-ID` before switching to live (§6).

    use std::sync::Arc;

    use axum::extract::{Path, Query, State};
    use axum::http::HeaderMap;
    use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
    use axum::response::IntoResponse;
    use futures_util::stream::{self, Stream, StreamExt};
    use serde::Deserialize;

    use super::{Frame, SseRouter, SubscriptionConfig};
    use crate::runtime::ring_buffer::EventRingBuffer;

    /// Shared state an axum router wires this handler up with.
    pub struct SseAppState {
        pub router: Arc<SseRouter>,
        pub ring_buffer: Arc<EventRingBuffer>,
    }

    #[derive(Deserialize)]
    pub struct LastEventIdQuery {
        /// Fallback for clients that can't set a `Last-Event-ID` header (e.g. `EventSource`
        /// polyfills), per §6: "the client supplies `Last-Event-ID` via header or query parameter".
        pub last_event_id: Option<u64>,
    }

    fn frame_to_sse_event(frame: Frame) -> Result<SseEvent, std::convert::Infallible> {
        let data = serde_json::to_string(&frame.event).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default()
            .event(frame.event.kind_name())
            .id(frame.event_id.to_string())
            .data(data))
    }

    pub async fn sse_handler(
        State(state): State<Arc<SseAppState>>,
        Path(context_id): Path<String>,
        Query(query): Query<LastEventIdQuery>,
        headers: HeaderMap,
    ) -> impl IntoResponse {
        let last_event_id = headers
            .get("Last-Event-ID")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .or(query.last_event_id)
            .unwrap_or(0);

        let config = SubscriptionConfig::new(context_id);
        let (subscription, replay_frames) =
            state.router.subscribe_with_replay(&state.ring_buffer, config, last_event_id);

        let replay_stream = stream::iter(replay_frames.into_iter().map(frame_to_sse_event));
        let live_stream = subscription_into_stream(subscription);
        let combined = replay_stream.chain(live_stream);

        Sse::new(combined).keep_alive(KeepAlive::default())
    }

    fn subscription_into_stream(
        mut subscription: super::Subscription,
    ) -> impl Stream<Item = Result<SseEvent, std::convert::Infallible>> {
        async_stream::stream! {
            while let Some(frame) = subscription.receiver.recv().await {
                yield frame_to_sse_event(frame);
            }
        }
    }
}
