//! Best-effort thread-reference continuity.
//!
//! Marker-bearing message ids arrive asynchronously and are not guaranteed
//! on every chat envelope; the tracker keeps the most recent usable id per
//! session and resolves which one an outgoing reply should attach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use crate::classify::THREAD_MARKER;
use crate::traits::InboundEvent;

#[derive(Default)]
pub struct ThreadRefTracker {
    latest: Mutex<Option<String>>,
    ever_seen: AtomicBool,
}

impl ThreadRefTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a candidate id. Ids without the marker are not usable for
    /// threading and are ignored.
    pub fn note(&self, id: &str) {
        if !id.contains(THREAD_MARKER) {
            return;
        }
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        if latest.as_deref() != Some(id) {
            tracing::debug!(id, "updated session thread reference");
        }
        *latest = Some(id.to_string());
        self.ever_seen.store(true, Ordering::Relaxed);
    }

    /// Whether any usable id has been seen this session. Replies sent before
    /// one arrives cannot be threaded.
    pub fn ever_seen(&self) -> bool {
        self.ever_seen.load(Ordering::Relaxed)
    }

    pub fn latest(&self) -> Option<String> {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolve the thread reference for a reply to `event`, first match
    /// wins: the id on the originating payload's known field, the session's
    /// most recent id, then the id captured on the event at classification
    /// time. `None` means the reply goes out unthreaded.
    pub fn resolve(&self, event: &InboundEvent) -> Option<String> {
        if let Some(id) = raw_field_ref(&event.raw) {
            return Some(id.to_string());
        }
        if let Some(id) = self.latest() {
            return Some(id);
        }
        event
            .thread_ref
            .as_deref()
            .filter(|id| id.contains(THREAD_MARKER))
            .map(|id| id.to_string())
    }
}

fn raw_field_ref(raw: &Value) -> Option<&str> {
    raw["1"]["3"]
        .as_str()
        .filter(|s| s.contains(THREAD_MARKER))
}
