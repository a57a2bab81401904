//! In-memory fakes for cross-module tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::traits::{
    ConversationKey, ConversationStore, GeneratedReply, OutboundWire, ReplyGenerator,
    ReplyRequest, Role, Turn,
};

/// Conversation store backed by maps; mirrors the SQLite store's contract,
/// including the trailing bargain-count system turn.
#[derive(Default)]
pub struct MemoryStore {
    turns: Mutex<HashMap<ConversationKey, Vec<Turn>>>,
    bargains: Mutex<HashMap<ConversationKey, u32>>,
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn append(&self, key: &ConversationKey, role: Role, text: &str) -> anyhow::Result<()> {
        self.turns
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push(Turn {
                role,
                content: text.to_string(),
            });
        Ok(())
    }

    async fn context(&self, key: &ConversationKey, limit: usize) -> anyhow::Result<Vec<Turn>> {
        let mut turns: Vec<Turn> = self
            .turns
            .lock()
            .unwrap()
            .get(key)
            .map(|t| t.iter().take(limit).cloned().collect())
            .unwrap_or_default();

        let bargains = *self.bargains.lock().unwrap().get(key).unwrap_or(&0);
        if bargains > 0 {
            turns.push(Turn {
                role: Role::System,
                content: format!("议价次数: {}", bargains),
            });
        }
        Ok(turns)
    }

    async fn bargain_count(&self, key: &ConversationKey) -> anyhow::Result<u32> {
        Ok(*self.bargains.lock().unwrap().get(key).unwrap_or(&0))
    }

    async fn increment_bargain(&self, key: &ConversationKey) -> anyhow::Result<()> {
        *self.bargains.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
        Ok(())
    }
}

/// Programmable reply generator that counts its invocations.
pub struct FakeGenerator {
    reply: Option<GeneratedReply>,
    calls: AtomicUsize,
}

impl FakeGenerator {
    pub fn replying(text: &str, price_related: bool) -> Self {
        Self {
            reply: Some(GeneratedReply {
                text: text.to_string(),
                price_related,
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplyGenerator for FakeGenerator {
    async fn generate(&self, _request: &ReplyRequest) -> anyhow::Result<GeneratedReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => anyhow::bail!("generator down"),
        }
    }
}

/// Records sent frames; optionally fails every send.
#[derive(Default)]
pub struct RecordingWire {
    frames: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingWire {
    pub fn failing() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundWire for RecordingWire {
    async fn send_frame(&self, frame: String) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("wire down");
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}
