//! Dedup-gated dispatch: bounded queue, fixed worker pool, one reply per
//! logical event.
//!
//! The session's read loop hands classified chat events to [`Dispatcher`]
//! (via the injected [`MessageHandler`] capability) and never waits on reply
//! generation. Each worker processes one item to completion — history,
//! generation, thread resolution, wire send — before pulling the next.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::dedup::{fingerprint, DedupLedger};
use crate::llm::{FALLBACK_REPLY, NOTICE_REPLY, SHIPPING_REPLY};
use crate::notices::NoticeKind;
use crate::threadref::ThreadRefTracker;
use crate::traits::{
    ConversationKey, ConversationStore, GeneratedReply, InboundEvent, MessageHandler,
    ReplyGenerator, Role,
};

/// Everything a worker needs to turn an event into a sent reply.
pub struct DispatchDeps {
    pub store: Arc<dyn ConversationStore>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub threads: Arc<ThreadRefTracker>,
    pub ledger: Arc<DedupLedger>,
    /// Own account id, second entry of every receiver scope.
    pub own_id: String,
    /// Max turns of history handed to the generator.
    pub context_limit: usize,
}

pub struct Dispatcher {
    tx: mpsc::Sender<InboundEvent>,
    ledger: Arc<DedupLedger>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Spawn the worker pool and return the handler the session feeds.
    pub fn spawn(
        workers: usize,
        queue_capacity: usize,
        deps: DispatchDeps,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<InboundEvent>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let ledger = deps.ledger.clone();
        let deps = Arc::new(deps);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = rx.clone();
            let deps = deps.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, deps, cancel).await;
            }));
        }

        Arc::new(Self {
            tx,
            ledger,
            workers: std::sync::Mutex::new(handles),
            cancel,
        })
    }

    /// Wait for in-flight items to finish. Call after cancelling the token;
    /// workers stop pulling new items but complete the one they hold.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatch worker panicked");
            }
        }
        info!("dispatch workers drained");
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    /// Ingress: fingerprint dedup, then enqueue. Never blocks on reply work.
    async fn handle(&self, event: InboundEvent) -> anyhow::Result<()> {
        let fp = fingerprint(&event.sender_id, &event.text, &event.item_id);
        if let Err(reason) = self.ledger.observe(fp, event.received_at) {
            debug!(
                sender = %event.sender_id,
                item = %event.item_id,
                ?reason,
                "dropped duplicate at ingress"
            );
            return Ok(());
        }

        if self.cancel.is_cancelled() {
            warn!("shutting down, inbound event not queued");
            return Ok(());
        }

        if self.tx.send(event).await.is_err() {
            warn!("dispatch queue closed, inbound event dropped");
        }
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<InboundEvent>>>,
    deps: Arc<DispatchDeps>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "dispatch worker started");
    loop {
        // Cancellation is only observed between items; the current item
        // always runs to completion.
        let event = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                event = rx.recv() => event,
            }
        };
        let Some(event) = event else { break };
        process_event(&deps, event).await;
    }
    debug!(worker_id, "dispatch worker stopped");
}

/// One unit of work, end to end. Per-event failures are contained here and
/// never reach the session layer.
async fn process_event(deps: &DispatchDeps, event: InboundEvent) {
    let now = Instant::now();
    let fp = fingerprint(&event.sender_id, &event.text, &event.item_id);

    // Second dedup layer: two racing ingress paths can both enqueue before
    // either worker runs; only the first claim proceeds.
    if let Err(reason) = deps.ledger.claim(fp, now) {
        debug!(sender = %event.sender_id, ?reason, "dropped duplicate at worker");
        return;
    }

    info!(
        sender = %event.sender_name,
        sender_id = %event.sender_id,
        item = %event.item_id,
        text = %event.text,
        "processing message"
    );

    let key = ConversationKey::new(event.sender_id.clone(), event.item_id.clone());

    let reply_text = match event.notice {
        Some(kind) => {
            match notice_reply(deps, &event, &key, kind, now).await {
                Some(text) => text,
                None => return,
            }
        }
        None => generated_reply(deps, &event, &key).await,
    };

    send_reply(deps, &event, &reply_text).await;
}

/// Templated handling for system notices, gated by the notice windows.
async fn notice_reply(
    deps: &DispatchDeps,
    event: &InboundEvent,
    key: &ConversationKey,
    kind: NoticeKind,
    now: Instant,
) -> Option<String> {
    if let Err(reason) = deps
        .ledger
        .notice_decision(&event.sender_id, kind, now)
    {
        debug!(
            sender = %event.sender_id,
            ?kind,
            ?reason,
            "suppressed system notice"
        );
        return None;
    }

    let text = match kind {
        NoticeKind::Shipping => SHIPPING_REPLY,
        _ => NOTICE_REPLY,
    };

    record_turn(deps, key, Role::User, &event.text).await;
    record_turn(deps, key, Role::Assistant, text).await;
    deps.ledger
        .record_notice_reply(&event.sender_id, kind, now);

    Some(text.to_string())
}

/// Ordinary chat: history in, context out, generator, bargain bookkeeping.
async fn generated_reply(
    deps: &DispatchDeps,
    event: &InboundEvent,
    key: &ConversationKey,
) -> String {
    // The user turn lands before the context fetch so the generator sees
    // the message it is answering.
    record_turn(deps, key, Role::User, &event.text).await;

    let context = match deps.store.context(key, deps.context_limit).await {
        Ok(turns) => turns,
        Err(e) => {
            warn!(error = %e, "context fetch failed, generating without history");
            Vec::new()
        }
    };
    let bargain_count = deps.store.bargain_count(key).await.unwrap_or(0);

    let request = crate::traits::ReplyRequest {
        message: event.text.clone(),
        item_description: event.item_title.clone(),
        context,
        bargain_count,
    };

    let reply = match deps.generator.generate(&request).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "reply generation failed, using fallback");
            GeneratedReply {
                text: FALLBACK_REPLY.to_string(),
                price_related: false,
            }
        }
    };

    if reply.price_related {
        if let Err(e) = deps.store.increment_bargain(key).await {
            warn!(error = %e, "failed to increment bargain count");
        } else {
            let count = deps.store.bargain_count(key).await.unwrap_or(0);
            info!(
                sender = %event.sender_id,
                item = %event.item_id,
                bargain_count = count,
                "price negotiation turn"
            );
        }
    }

    record_turn(deps, key, Role::Assistant, &reply.text).await;
    reply.text
}

async fn record_turn(deps: &DispatchDeps, key: &ConversationKey, role: Role, text: &str) {
    if let Err(e) = deps.store.append(key, role, text).await {
        warn!(error = %e, role = role.as_str(), "history append failed");
    }
}

async fn send_reply(deps: &DispatchDeps, event: &InboundEvent, text: &str) {
    let thread_ref = deps.threads.resolve(event);
    match &thread_ref {
        Some(id) => debug!(thread_ref = %id, "attaching thread reference"),
        None => {
            if deps.threads.ever_seen() {
                warn!("no usable thread reference for this reply, sending plain");
            } else {
                warn!("no thread reference seen yet this session, sending plain");
            }
        }
    }

    let frame = codec::encode_send(
        &event.chat_id,
        &event.sender_id,
        &deps.own_id,
        text,
        thread_ref.as_deref(),
    );

    info!(recipient = %event.sender_id, reply = %text, "sending reply");
    if let Err(e) = event.wire.send_frame(frame).await {
        // No retry: the transport has no redelivery path.
        error!(error = %e, recipient = %event.sender_id, "reply send failed, dropped");
    }
}
