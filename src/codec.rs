//! Envelope codec for the marketplace wire protocol.
//!
//! Frames are UTF-8 JSON. Inbound push packages carry base64 payloads that
//! are either plain JSON or run through a proprietary transform first; the
//! transform is a pluggable collaborator ([`PayloadCipher`]).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::ident::{generate_mid, generate_uuid};

/// Registration application key, fixed by the web client.
pub const REG_APP_KEY: &str = "444e9908a51d1cb236a27862abc769c9";

/// Browser identity presented during registration and the HTTP upgrade.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";

const REG_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36 \
DingTalk(2.1.5) OS(Windows/10) Browser(Chrome/133.0.0.0) DingWeb/2.1.5 \
IMPaaS DingWeb/2.1.5";

#[derive(Debug)]
pub enum CodecError {
    /// Frame or payload is not valid JSON under either decode path.
    MalformedEnvelope(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::MalformedEnvelope(detail) => {
                write!(f, "malformed envelope: {}", detail)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// The proprietary payload transform. The production implementation lives
/// outside this crate; [`NoopCipher`] passes data through unchanged for
/// unencrypted deployments and tests.
pub trait PayloadCipher: Send + Sync {
    /// Transform a raw payload string into a JSON document string.
    fn decrypt(&self, data: &str) -> anyhow::Result<String>;
}

/// Identity transform: treats the payload as already-decoded JSON.
pub struct NoopCipher;

impl PayloadCipher for NoopCipher {
    fn decrypt(&self, data: &str) -> anyhow::Result<String> {
        Ok(data.to_string())
    }
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Decoded {
    /// Protocol-level frame (ack, directive) with no push payload.
    Control(Value),
    /// Push package: the decoded payload objects it carried.
    Push(Vec<Value>),
}

/// True when the frame carries a non-empty sync push package.
pub fn is_push_package(frame: &Value) -> bool {
    frame["body"]["syncPushPackage"]["data"]
        .as_array()
        .map(|items| !items.is_empty())
        .unwrap_or(false)
}

/// Decode one wire frame. Push-package payloads try the plain
/// base64+UTF-8+JSON path first; on failure the payload is run through the
/// cipher and JSON-parsed. Neither path producing valid JSON is a
/// [`CodecError::MalformedEnvelope`].
pub fn decode(raw: &str, cipher: &dyn PayloadCipher) -> Result<Decoded, CodecError> {
    let frame: Value = serde_json::from_str(raw)
        .map_err(|e| CodecError::MalformedEnvelope(format!("frame parse: {}", e)))?;

    if !is_push_package(&frame) {
        return Ok(Decoded::Control(frame));
    }

    decode_push(&frame, cipher).map(Decoded::Push)
}

/// Decode the payload items of an already-parsed push-package frame.
pub fn decode_push(frame: &Value, cipher: &dyn PayloadCipher) -> Result<Vec<Value>, CodecError> {
    let items = frame["body"]["syncPushPackage"]["data"]
        .as_array()
        .cloned()
        .unwrap_or_default();

    let mut payloads = Vec::with_capacity(items.len());
    for item in &items {
        let Some(data) = item["data"].as_str() else {
            tracing::debug!("push item without data field, skipping");
            continue;
        };
        payloads.push(decode_payload(data, cipher)?);
    }

    Ok(payloads)
}

fn decode_payload(data: &str, cipher: &dyn PayloadCipher) -> Result<Value, CodecError> {
    // Plain path: base64 -> UTF-8 -> JSON.
    if let Ok(bytes) = BASE64.decode(data) {
        if let Ok(text) = String::from_utf8(bytes) {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                return Ok(value);
            }
        }
    }

    // Encrypted path: proprietary transform, then JSON.
    let decrypted = cipher
        .decrypt(data)
        .map_err(|e| CodecError::MalformedEnvelope(format!("decrypt: {}", e)))?;
    serde_json::from_str(&decrypted)
        .map_err(|e| CodecError::MalformedEnvelope(format!("decrypted payload parse: {}", e)))
}

/// Registration handshake frame sent right after the transport connects.
pub fn encode_register(device_id: &str, token: &str) -> String {
    json!({
        "lwp": "/reg",
        "headers": {
            "cache-header": "app-key token ua wv",
            "app-key": REG_APP_KEY,
            "token": token,
            "ua": REG_UA,
            "dt": "j",
            "wv": "im:3,au:3,sy:6",
            "sync": "0,0;0;0;",
            "did": device_id,
            "mid": generate_mid(),
        }
    })
    .to_string()
}

/// Post-registration sync acknowledgment. `pts` is the millisecond clock
/// scaled by 1000, exactly as the web client computes it.
pub fn encode_sync_ack() -> String {
    let now_ms = chrono::Utc::now().timestamp_millis();
    json!({
        "lwp": "/r/SyncStatus/ackDiff",
        "headers": { "mid": generate_mid() },
        "body": [{
            "pipeline": "sync",
            "tooLong2Tag": "PNM,1",
            "channel": "sync",
            "topic": "sync",
            "highPts": 0,
            "pts": now_ms * 1000,
            "seq": 0,
            "timestamp": now_ms,
        }]
    })
    .to_string()
}

/// Minimal heartbeat frame. Returns the frame and its message id; the caller
/// records the send time.
pub fn encode_heartbeat() -> (String, String) {
    let mid = generate_mid();
    let frame = json!({
        "lwp": "/!",
        "headers": { "mid": mid }
    })
    .to_string();
    (frame, mid)
}

/// Outgoing chat message. The text body rides base64-encoded inside a
/// custom-content wrapper; a thread reference, when given, is embedded as
/// the reply-reference extension.
pub fn encode_send(
    chat_id: &str,
    to_id: &str,
    own_id: &str,
    text: &str,
    thread_ref: Option<&str>,
) -> String {
    let text_obj = json!({
        "contentType": 1,
        "text": { "text": text }
    });
    let text_base64 = BASE64.encode(text_obj.to_string().as_bytes());

    let ext_json = match thread_ref {
        Some(id) => json!({ "replyMessageId": id }).to_string(),
        None => "{}".to_string(),
    };

    json!({
        "lwp": "/r/MessageSend/sendByReceiverScope",
        "headers": { "mid": generate_mid() },
        "body": [
            {
                "uuid": generate_uuid(),
                "cid": format!("{}@goofish", chat_id),
                "conversationType": 1,
                "content": {
                    "contentType": 101,
                    "custom": {
                        "type": 1,
                        "data": text_base64,
                    }
                },
                "redPointPolicy": 0,
                "extension": { "extJson": ext_json },
                "ctx": {
                    "appVersion": "1.0",
                    "platform": "web",
                },
                "mtags": {},
                "msgReadStatusSetting": 1,
            },
            {
                "actualReceivers": [
                    format!("{}@goofish", to_id),
                    format!("{}@goofish", own_id),
                ]
            }
        ]
    })
    .to_string()
}

/// True when the frame acknowledges a heartbeat: a success code with a mid,
/// a bare success code without a body, or an echo of the heartbeat path.
pub fn is_heartbeat_ack(frame: &Value) -> bool {
    let code_ok = frame["code"].as_i64() == Some(200);

    if code_ok && frame["headers"]["mid"].is_string() {
        return true;
    }
    if code_ok && frame.get("body").is_none() {
        return true;
    }
    if frame["lwp"].as_str() == Some("/!") {
        return true;
    }
    false
}

/// Generic protocol acknowledgment for an inbound frame, echoing its
/// correlation headers. Frames without a mid get a fresh one so the backend
/// still sees a well-formed ack.
pub fn encode_ack(frame: &Value) -> Option<String> {
    let headers = frame.get("headers")?;

    let mut ack_headers = serde_json::Map::new();
    let mid = headers["mid"]
        .as_str()
        .map(|s| s.to_string())
        .unwrap_or_else(generate_mid);
    ack_headers.insert("mid".into(), Value::String(mid));
    ack_headers.insert(
        "sid".into(),
        Value::String(headers["sid"].as_str().unwrap_or("").to_string()),
    );
    for key in ["app-key", "ua", "dt"] {
        if let Some(v) = headers[key].as_str() {
            ack_headers.insert(key.into(), Value::String(v.to_string()));
        }
    }

    Some(
        json!({
            "code": 200,
            "headers": Value::Object(ack_headers),
        })
        .to_string(),
    )
}
