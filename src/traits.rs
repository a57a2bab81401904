use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::notices::NoticeKind;

/// Conversation key: one buyer talking about one item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub user_id: String,
    pub item_id: String,
}

impl ConversationKey {
    pub fn new(user_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Role {
        match s {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

/// One turn of a conversation as handed to the reply generator.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Persistent per-conversation history plus the bargain counter.
///
/// The store serializes writes per conversation key; callers may append from
/// any worker without coordinating among themselves.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(&self, key: &ConversationKey, role: Role, text: &str) -> anyhow::Result<()>;

    /// Ordered history for the conversation, oldest first, at most `limit`
    /// turns. Implementations append the bargain count as a trailing system
    /// turn when it is non-zero.
    async fn context(&self, key: &ConversationKey, limit: usize) -> anyhow::Result<Vec<Turn>>;

    async fn bargain_count(&self, key: &ConversationKey) -> anyhow::Result<u32>;

    async fn increment_bargain(&self, key: &ConversationKey) -> anyhow::Result<()>;
}

/// Request handed to the reply-generation collaborator.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub message: String,
    pub item_description: String,
    pub context: Vec<Turn>,
    pub bargain_count: u32,
}

/// A generated reply plus the out-of-band price-negotiation signal.
#[derive(Debug, Clone)]
pub struct GeneratedReply {
    pub text: String,
    pub price_related: bool,
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, request: &ReplyRequest) -> anyhow::Result<GeneratedReply>;
}

/// Credential acquisition. `force_interactive` requests a full re-auth (the
/// provider may open a browser flow); `Ok(None)` means no usable credentials
/// are available without one.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(
        &self,
        force_interactive: bool,
    ) -> anyhow::Result<Option<crate::credentials::Credentials>>;

    /// Drop all persisted credential/session state so the next acquisition
    /// performs a full interactive re-auth instead of a silent refresh.
    async fn invalidate(&self) -> anyhow::Result<()>;
}

/// Write half of the marketplace connection. Workers send replies through
/// this; the session owns the concrete socket sink.
#[async_trait]
pub trait OutboundWire: Send + Sync {
    async fn send_frame(&self, frame: String) -> anyhow::Result<()>;
}

/// A chat event ready for dispatch, immutable after classification.
pub struct InboundEvent {
    /// The decoded payload object the event was classified from.
    pub raw: Value,
    pub sender_id: String,
    pub sender_name: String,
    pub chat_id: String,
    pub item_id: String,
    pub item_title: String,
    pub text: String,
    /// Marker-bearing id captured at classification time, if any.
    pub thread_ref: Option<String>,
    /// System-notice subtype when the text matches the phrase table.
    pub notice: Option<NoticeKind>,
    pub received_at: Instant,
    /// Connection the event arrived on; the reply goes back through it.
    pub wire: Arc<dyn OutboundWire>,
}

impl std::fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundEvent")
            .field("sender_id", &self.sender_id)
            .field("chat_id", &self.chat_id)
            .field("item_id", &self.item_id)
            .field("text", &self.text)
            .field("thread_ref", &self.thread_ref)
            .field("notice", &self.notice)
            .finish()
    }
}

/// The one capability the session calls after protocol housekeeping. The
/// session invokes it exactly once per dispatchable inbound event; dispatch
/// decisions (dedup, queueing) belong to the implementation.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, event: InboundEvent) -> anyhow::Result<()>;
}
