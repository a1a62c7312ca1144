//! Event ring buffer (C9).
//!
//! A bounded append-only log per `contextId`, used by the SSE router (C10) to replay events a
//! reconnecting subscriber missed. IDs are assigned per context and are strictly increasing
//! regardless of which iteration produced the event (§5 ordering guarantee).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::runtime::event::Event;

/// One retained entry: the id the buffer assigned it plus the event itself.
#[derive(Debug, Clone)]
pub struct BufferedEvent {
    pub event_id: u64,
    pub event: Event,
}

/// Result of a [`EventRingBuffer::replay`] call.
pub struct ReplayResult {
    pub events: Vec<BufferedEvent>,
    /// Set when `since_event_id` was older than the oldest entry still retained — the caller
    /// asked for history this buffer already evicted.
    pub gap: bool,
}

struct ContextLog {
    next_id: u64,
    capacity: usize,
    entries: VecDeque<BufferedEvent>,
}

impl ContextLog {
    fn new(capacity: usize) -> Self {
        ContextLog {
            next_id: 1,
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn append(&mut self, event: Event) -> u64 {
        let event_id = self.next_id;
        self.next_id += 1;
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(BufferedEvent { event_id, event });
        event_id
    }

    fn replay(&self, since_event_id: u64) -> ReplayResult {
        let oldest_retained = self.entries.front().map(|e| e.event_id);
        let gap = match oldest_retained {
            Some(oldest) => since_event_id + 1 < oldest,
            None => since_event_id + 1 < self.next_id,
        };
        let events = self
            .entries
            .iter()
            .filter(|e| e.event_id > since_event_id)
            .cloned()
            .collect();
        ReplayResult { events, gap }
    }
}

/// Per-context bounded event log. Mutations are serialized behind a [`Mutex`] (§5: "guarded;
/// `send` invocations happen outside the lock").
pub struct EventRingBuffer {
    default_capacity: usize,
    contexts: Mutex<HashMap<String, ContextLog>>,
}

impl EventRingBuffer {
    pub fn new(default_capacity: usize) -> Self {
        EventRingBuffer {
            default_capacity,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Append an event to its context's log, evicting the oldest entry if the context is at
    /// capacity. Returns the assigned, strictly-increasing-per-context event id.
    pub fn append(&self, context_id: &str, event: Event) -> u64 {
        let mut contexts = self.contexts.lock().unwrap();
        let log = contexts
            .entry(context_id.to_string())
            .or_insert_with(|| ContextLog::new(self.default_capacity));
        log.append(event)
    }

    /// All entries with id strictly greater than `since_event_id`, in order. An unknown context
    /// replays as empty with no gap, matching a fresh context that has never had events.
    pub fn replay(&self, context_id: &str, since_event_id: u64) -> ReplayResult {
        let contexts = self.contexts.lock().unwrap();
        match contexts.get(context_id) {
            Some(log) => log.replay(since_event_id),
            None => ReplayResult { events: Vec::new(), gap: false },
        }
    }
}
