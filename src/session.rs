//! Connection session: handshake, heartbeats, read loop, reconnect policy.
//!
//! One [`SessionRunner::run_once`] call owns one connection attempt from
//! `Connecting` through `Closing`. The supervisor loop around it applies the
//! backoff and credential-refresh policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{MtopClient, TokenError};
use crate::classify::{self, Classified};
use crate::codec::{self, PayloadCipher};
use crate::config::SessionConfig;
use crate::credentials::Credentials;
use crate::ident;
use crate::threadref::ThreadRefTracker;
use crate::traits::{CredentialProvider, InboundEvent, MessageHandler, OutboundWire};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Registering,
    SyncingStatus,
    Active,
    Closing,
}

impl SessionState {
    fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Registering => "registering",
            SessionState::SyncingStatus => "syncing_status",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
        }
    }
}

/// Why a session left `Active` (or never got there).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Token exchange reported an expiry-class error.
    CredentialExpired,
    /// Transport dropped, failed to connect, or a transient token error.
    TransportClosed,
    /// No heartbeat ack within tolerance.
    HeartbeatTimeout,
    /// Process-level shutdown; never retried.
    Shutdown,
}

pub struct SessionOutcome {
    pub reason: CloseReason,
    /// Whether the handshake completed; resets the failure streak.
    pub reached_active: bool,
}

/// True when a heartbeat should be sent this tick.
pub fn heartbeat_due(now: Instant, last_sent: Instant, interval: Duration) -> bool {
    now.duration_since(last_sent) >= interval
}

/// True when the missing ack means the connection is dead.
pub fn watchdog_expired(
    now: Instant,
    last_ack: Instant,
    interval: Duration,
    timeout: Duration,
) -> bool {
    now.duration_since(last_ack) > interval + timeout
}

/// Reconnect backoff and credential-refresh thresholds. Pure bookkeeping so
/// the policy is testable without a socket.
pub struct ReconnectPolicy {
    base_delay: Duration,
    cap: Duration,
    max_consecutive_failures: u32,
    max_token_failures: u32,
    consecutive_failures: u32,
    token_failures: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RetryPlan {
    pub delay: Duration,
    /// Invalidate persisted credential state and re-acquire interactively.
    pub force_reauth: bool,
}

impl ReconnectPolicy {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.retry_base_secs),
            cap: Duration::from_secs(config.retry_cap_secs),
            max_consecutive_failures: config.max_consecutive_failures,
            max_token_failures: config.max_token_failures,
            consecutive_failures: 0,
            token_failures: 0,
        }
    }

    /// A session completed its handshake; the failure streak is over.
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.token_failures = 0;
    }

    /// Record a failed attempt and plan the retry. Hitting either threshold
    /// forces credential re-acquisition and resets both counters.
    pub fn on_failure(&mut self, reason: &CloseReason) -> RetryPlan {
        self.consecutive_failures += 1;
        if *reason == CloseReason::CredentialExpired {
            self.token_failures += 1;
        }

        let delay = self
            .cap
            .min(self.base_delay * self.consecutive_failures);
        let force_reauth = self.consecutive_failures >= self.max_consecutive_failures
            || self.token_failures >= self.max_token_failures;

        if force_reauth {
            self.consecutive_failures = 0;
            self.token_failures = 0;
        }

        RetryPlan { delay, force_reauth }
    }

    #[cfg(test)]
    fn counts(&self) -> (u32, u32) {
        (self.consecutive_failures, self.token_failures)
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Write half of the live connection, shared with the worker pool. Send
/// order within one holder is serialized by the lock.
pub struct WsWire {
    sink: tokio::sync::Mutex<WsSink>,
}

#[async_trait]
impl OutboundWire for WsWire {
    async fn send_frame(&self, frame: String) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame)).await?;
        Ok(())
    }
}

pub struct SessionRunner {
    pub config: SessionConfig,
    pub api: Arc<MtopClient>,
    pub cipher: Arc<dyn PayloadCipher>,
    pub handler: Arc<dyn MessageHandler>,
    pub threads: Arc<ThreadRefTracker>,
}

/// Live per-connection state, torn down when the attempt ends.
struct Session {
    state: SessionState,
    own_id: String,
    device_id: String,
    last_heartbeat_sent: Instant,
    last_heartbeat_ack: Instant,
}

impl Session {
    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!(from = self.state.as_str(), to = next.as_str(), "session state");
            self.state = next;
        }
    }
}

impl SessionRunner {
    /// One full connection attempt. Per-event errors are contained inside;
    /// only connection-class outcomes surface.
    pub async fn run_once(
        &self,
        creds: &Credentials,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let own_id = match creds.user_id() {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "credentials carry no usable identity");
                return SessionOutcome {
                    reason: CloseReason::CredentialExpired,
                    reached_active: false,
                };
            }
        };
        let device_id = ident::device_id_for(&own_id);

        let mut session = Session {
            state: SessionState::Disconnected,
            own_id,
            device_id,
            last_heartbeat_sent: Instant::now(),
            last_heartbeat_ack: Instant::now(),
        };
        session.transition(SessionState::Connecting);

        let stream = match self.connect(creds).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "transport connect failed");
                return SessionOutcome {
                    reason: CloseReason::TransportClosed,
                    reached_active: false,
                };
            }
        };
        let (sink, mut read) = stream.split();
        let wire = Arc::new(WsWire {
            sink: tokio::sync::Mutex::new(sink),
        });

        session.transition(SessionState::Registering);
        let token = match self
            .api
            .fetch_access_token(&creds.cookies, &session.device_id)
            .await
        {
            Ok(token) => token,
            Err(TokenError::Expired(msg)) => {
                error!(%msg, "token exchange: credential expired");
                session.transition(SessionState::Closing);
                return SessionOutcome {
                    reason: CloseReason::CredentialExpired,
                    reached_active: false,
                };
            }
            Err(e) => {
                error!(error = %e, "token exchange failed");
                session.transition(SessionState::Closing);
                return SessionOutcome {
                    reason: CloseReason::TransportClosed,
                    reached_active: false,
                };
            }
        };

        let register = codec::encode_register(&session.device_id, &token);
        if let Err(e) = wire.send_frame(register).await {
            error!(error = %e, "register send failed");
            return SessionOutcome {
                reason: CloseReason::TransportClosed,
                reached_active: false,
            };
        }
        info!("register frame sent");

        // Fixed settle delay before acknowledging sync status.
        let settle = Duration::from_millis(self.config.register_settle_ms);
        tokio::select! {
            _ = cancel.cancelled() => {
                return SessionOutcome { reason: CloseReason::Shutdown, reached_active: false };
            }
            _ = tokio::time::sleep(settle) => {}
        }

        session.transition(SessionState::SyncingStatus);
        if let Err(e) = wire.send_frame(codec::encode_sync_ack()).await {
            error!(error = %e, "sync ack send failed");
            return SessionOutcome {
                reason: CloseReason::TransportClosed,
                reached_active: false,
            };
        }
        info!("connection registered");

        session.transition(SessionState::Active);
        session.last_heartbeat_sent = Instant::now();
        session.last_heartbeat_ack = Instant::now();

        let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested, closing session");
                    break CloseReason::Shutdown;
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    if heartbeat_due(now, session.last_heartbeat_sent, interval) {
                        let (frame, mid) = codec::encode_heartbeat();
                        if let Err(e) = wire.send_frame(frame).await {
                            error!(error = %e, "heartbeat send failed");
                            break CloseReason::TransportClosed;
                        }
                        session.last_heartbeat_sent = now;
                        debug!(%mid, "heartbeat sent");
                    }
                    if watchdog_expired(now, session.last_heartbeat_ack, interval, timeout) {
                        warn!(
                            silent_secs = now.duration_since(session.last_heartbeat_ack).as_secs(),
                            "heartbeat ack overdue, assuming dead connection"
                        );
                        break CloseReason::HeartbeatTimeout;
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.process_frame(&text, &wire, &mut session).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("server closed the connection");
                            break CloseReason::TransportClosed;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "transport read error");
                            break CloseReason::TransportClosed;
                        }
                        None => {
                            warn!("transport stream ended");
                            break CloseReason::TransportClosed;
                        }
                    }
                }
            }
        };

        session.transition(SessionState::Closing);
        if reason == CloseReason::Shutdown {
            let mut sink = wire.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
        }
        session.transition(SessionState::Disconnected);

        SessionOutcome {
            reason,
            reached_active: true,
        }
    }

    async fn connect(
        &self,
        creds: &Credentials,
    ) -> anyhow::Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let mut request = self.config.endpoint.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Cookie", HeaderValue::from_bytes(creds.cookie_header().as_bytes())?);
        headers.insert("User-Agent", HeaderValue::from_static(codec::USER_AGENT));
        headers.insert("Origin", HeaderValue::from_static("https://www.goofish.com"));

        info!(endpoint = %self.config.endpoint, "connecting");
        let (stream, _response) = connect_async(request).await?;
        info!("transport connected");
        Ok(stream)
    }

    /// One inbound frame: housekeeping (ack, heartbeat bookkeeping), then
    /// classification, then the injected handler — called exactly once per
    /// dispatchable event. Nothing here terminates the session.
    async fn process_frame(&self, text: &str, wire: &Arc<WsWire>, session: &mut Session) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "malformed envelope, dropped");
                return;
            }
        };

        if codec::is_heartbeat_ack(&frame) {
            session.last_heartbeat_ack = Instant::now();
            debug!("heartbeat ack");
            return;
        }

        if let Some(ack) = codec::encode_ack(&frame) {
            if let Err(e) = wire.send_frame(ack).await {
                warn!(error = %e, "protocol ack send failed");
            }
        }

        if !codec::is_push_package(&frame) {
            debug!(lwp = frame["lwp"].as_str().unwrap_or(""), "non-push frame");
            return;
        }

        let payloads = match codec::decode_push(&frame, self.cipher.as_ref()) {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!(error = %e, "push payload decode failed, dropped");
                return;
            }
        };

        for payload in payloads {
            self.process_payload(payload, wire, session).await;
        }
    }

    async fn process_payload(&self, payload: Value, wire: &Arc<WsWire>, session: &Session) {
        // Any marker-bearing id updates the session thread reference,
        // whatever the payload turns out to be.
        if let Some(id) = classify::find_marker_string(&payload, 2) {
            self.threads.note(id);
        }

        match classify::classify(&payload) {
            Classified::OrderEvent { user_id, phase } => {
                info!(
                    phase = phase.as_str(),
                    user = %format!("https://www.goofish.com/personal?userId={}", user_id),
                    "order event"
                );
            }
            Classified::Typing => {
                debug!("peer is typing");
            }
            Classified::Chat(fields) => {
                if fields.sender_id == session.own_id {
                    debug!("own message echoed back, ignored");
                    return;
                }
                info!(
                    sender = %fields.sender_name,
                    sender_id = %fields.sender_id,
                    text = %fields.text,
                    "chat message received"
                );
                let event = InboundEvent {
                    notice: classify::notice_kind(&fields),
                    raw: payload,
                    sender_id: fields.sender_id,
                    sender_name: fields.sender_name,
                    chat_id: fields.chat_id,
                    item_id: fields.item_id,
                    item_title: fields.item_title,
                    text: fields.text,
                    thread_ref: fields.thread_ref,
                    received_at: Instant::now(),
                    wire: wire.clone(),
                };
                if let Err(e) = self.handler.handle(event).await {
                    warn!(error = %e, "message handler error");
                }
            }
            Classified::Unclassified { thread_ref } => {
                if let Some(id) = thread_ref {
                    debug!(%id, "passive thread reference from unclassified payload");
                } else {
                    debug!("unclassified payload");
                }
            }
        }
    }
}

/// Reconnect supervisor: runs sessions until shutdown, applying backoff and
/// forced credential re-acquisition.
pub async fn run_supervisor(
    runner: SessionRunner,
    provider: Arc<dyn CredentialProvider>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut policy = ReconnectPolicy::new(&runner.config);
    let mut force_interactive = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let creds = match provider.credentials(force_interactive).await? {
            Some(creds) => creds,
            None => {
                warn!(
                    retry_secs = runner.config.retry_cap_secs,
                    "no usable credentials, waiting before retry"
                );
                force_interactive = false;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(runner.config.retry_cap_secs)) => {}
                }
                continue;
            }
        };
        force_interactive = false;

        let outcome = runner.run_once(&creds, &cancel).await;
        if outcome.reason == CloseReason::Shutdown {
            break;
        }
        if outcome.reached_active {
            policy.on_success();
        }

        let plan = policy.on_failure(&outcome.reason);
        if plan.force_reauth {
            warn!("failure threshold reached, invalidating credential state");
            provider.invalidate().await?;
            force_interactive = true;
        }

        info!(
            reason = ?outcome.reason,
            delay_secs = plan.delay.as_secs(),
            "reconnecting after delay"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(plan.delay) => {}
        }
    }

    info!("session supervisor stopped");
    Ok(())
}
