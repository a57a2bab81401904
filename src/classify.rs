//! Pure classification of decoded push payloads.
//!
//! The backend's payloads are loosely typed: numbered fields, nested
//! objects, and ids scattered across shapes that changed over time. All
//! shape checks live here so the rest of the pipeline works with typed
//! events.

use serde_json::Value;

use crate::notices::classify_notice;

/// Substring marking a message id as usable for threaded replies. Only ids
/// carrying this marker may be attached to outgoing frames; the backend
/// silently drops references to anything else.
pub const THREAD_MARKER: &str = ".PNM";

/// Transaction phase reported by an order event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPhase {
    /// 等待买家付款
    AwaitingPayment,
    /// 交易关闭
    Closed,
    /// 等待卖家发货 (payment completed)
    AwaitingShipment,
}

impl OrderPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderPhase::AwaitingPayment => "awaiting_payment",
            OrderPhase::Closed => "closed",
            OrderPhase::AwaitingShipment => "awaiting_shipment",
        }
    }
}

/// A chat message extracted from a payload.
#[derive(Debug, Clone)]
pub struct ChatFields {
    pub sender_id: String,
    pub sender_name: String,
    pub chat_id: String,
    pub item_id: String,
    pub item_title: String,
    pub text: String,
    pub thread_ref: Option<String>,
    pub sent_at_ms: Option<i64>,
}

/// Classification of one decoded payload, first match wins.
#[derive(Debug)]
pub enum Classified {
    OrderEvent { user_id: String, phase: OrderPhase },
    Typing,
    Chat(ChatFields),
    /// No dispatchable shape; carries a passively-discovered thread
    /// reference when one was present anywhere in the payload.
    Unclassified { thread_ref: Option<String> },
}

pub fn classify(payload: &Value) -> Classified {
    if let Some((user_id, phase)) = order_event(payload) {
        return Classified::OrderEvent { user_id, phase };
    }
    if is_typing(payload) {
        return Classified::Typing;
    }
    if let Some(fields) = chat_fields(payload) {
        return Classified::Chat(fields);
    }
    Classified::Unclassified {
        thread_ref: find_marker_string(payload, 2).map(|s| s.to_string()),
    }
}

fn order_event(payload: &Value) -> Option<(String, OrderPhase)> {
    let reminder = payload["3"]["redReminder"].as_str()?;
    let phase = match reminder {
        "等待买家付款" => OrderPhase::AwaitingPayment,
        "交易关闭" => OrderPhase::Closed,
        "等待卖家发货" => OrderPhase::AwaitingShipment,
        _ => return None,
    };
    let user_id = payload["1"]
        .as_str()
        .map(|s| s.split('@').next().unwrap_or(s).to_string())
        .unwrap_or_default();
    Some((user_id, phase))
}

fn is_typing(payload: &Value) -> bool {
    if payload["1"]["4"].as_i64() == Some(2) {
        return true;
    }
    // Older shape: field "1" is a list of actor addresses.
    if let Some(items) = payload["1"].as_array() {
        if let Some(first) = items.first() {
            if let Some(addr) = first["1"].as_str() {
                return addr.contains("@goofish");
            }
        }
    }
    false
}

fn chat_fields(payload: &Value) -> Option<ChatFields> {
    let content = payload["1"]["10"].as_object()?;
    let text = content.get("reminderContent")?.as_str()?.to_string();

    let sender_id = content
        .get("senderUserId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let sender_name = content
        .get("reminderTitle")
        .and_then(Value::as_str)
        .unwrap_or("未知用户")
        .to_string();

    let chat_id = payload["1"]["2"]
        .as_str()
        .map(|s| s.split('@').next().unwrap_or(s).to_string())
        .unwrap_or_default();

    // Item identity rides in an embedded JSON tag; absent or unparseable
    // tags fall back to placeholders rather than dropping the message.
    let (item_id, item_title) = content
        .get("bizTag")
        .and_then(Value::as_str)
        .and_then(|tag| serde_json::from_str::<Value>(tag).ok())
        .map(|tag| {
            (
                tag["itemId"]
                    .as_str()
                    .unwrap_or("unknown_item")
                    .to_string(),
                tag["itemTitle"].as_str().unwrap_or("未知商品").to_string(),
            )
        })
        .unwrap_or_else(|| ("unknown_item".to_string(), "未知商品".to_string()));

    let thread_ref = payload["1"]["3"]
        .as_str()
        .filter(|s| s.contains(THREAD_MARKER))
        .map(|s| s.to_string());

    let sent_at_ms = match &payload["1"]["5"] {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };

    Some(ChatFields {
        sender_id,
        sender_name,
        chat_id,
        item_id,
        item_title,
        text,
        thread_ref,
        sent_at_ms,
    })
}

/// Depth-limited find-first-string traversal: returns the first string value
/// anywhere in the payload (objects and arrays, up to `depth` levels deep)
/// that carries the thread marker.
pub fn find_marker_string(value: &Value, depth: usize) -> Option<&str> {
    find_string(value, depth, &|s| s.contains(THREAD_MARKER))
}

fn find_string<'a>(
    value: &'a Value,
    depth: usize,
    pred: &dyn Fn(&str) -> bool,
) -> Option<&'a str> {
    match value {
        Value::String(s) if pred(s) => Some(s),
        Value::Object(map) if depth > 0 => map
            .values()
            .find_map(|v| find_string(v, depth - 1, pred)),
        Value::Array(items) if depth > 0 => items
            .iter()
            .find_map(|v| find_string(v, depth - 1, pred)),
        _ => None,
    }
}

/// Notice subtype for a chat message's text, if any.
pub fn notice_kind(fields: &ChatFields) -> Option<crate::notices::NoticeKind> {
    classify_notice(&fields.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat_payload(text: &str) -> Value {
        json!({
            "1": {
                "2": "chat-1@goofish",
                "3": "8417.06.PNM",
                "5": "1714378000000",
                "10": {
                    "reminderTitle": "小王",
                    "reminderContent": text,
                    "senderUserId": "u-1",
                    "bizTag": "{\"itemId\":\"item-9\",\"itemTitle\":\"二手键盘\"}",
                }
            }
        })
    }

    #[test]
    fn chat_message_extracts_all_fields() {
        let payload = chat_payload("多少钱");
        match classify(&payload) {
            Classified::Chat(fields) => {
                assert_eq!(fields.sender_id, "u-1");
                assert_eq!(fields.sender_name, "小王");
                assert_eq!(fields.chat_id, "chat-1");
                assert_eq!(fields.item_id, "item-9");
                assert_eq!(fields.item_title, "二手键盘");
                assert_eq!(fields.text, "多少钱");
                assert_eq!(fields.thread_ref.as_deref(), Some("8417.06.PNM"));
                assert_eq!(fields.sent_at_ms, Some(1714378000000));
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[test]
    fn chat_without_biz_tag_gets_placeholders() {
        let payload = json!({
            "1": {
                "2": "c2@goofish",
                "10": {
                    "reminderTitle": "买家",
                    "reminderContent": "在吗",
                    "senderUserId": "u-2",
                }
            }
        });
        match classify(&payload) {
            Classified::Chat(fields) => {
                assert_eq!(fields.item_id, "unknown_item");
                assert_eq!(fields.item_title, "未知商品");
                assert!(fields.thread_ref.is_none());
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[test]
    fn unparseable_biz_tag_falls_back() {
        let payload = json!({
            "1": {
                "10": {
                    "reminderContent": "hi",
                    "senderUserId": "u",
                    "bizTag": "not json",
                }
            }
        });
        match classify(&payload) {
            Classified::Chat(fields) => assert_eq!(fields.item_id, "unknown_item"),
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[test]
    fn thread_ref_without_marker_is_ignored() {
        let mut payload = chat_payload("hi");
        payload["1"]["3"] = json!("plain-id-no-marker");
        match classify(&payload) {
            Classified::Chat(fields) => assert!(fields.thread_ref.is_none()),
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[test]
    fn typing_numeric_flag() {
        let payload = json!({ "1": { "4": 2 } });
        assert!(matches!(classify(&payload), Classified::Typing));
    }

    #[test]
    fn typing_actor_address_list() {
        let payload = json!({ "1": [ { "1": "12345@goofish" } ] });
        assert!(matches!(classify(&payload), Classified::Typing));
    }

    #[test]
    fn order_event_known_phrases() {
        for (phrase, phase) in [
            ("等待买家付款", OrderPhase::AwaitingPayment),
            ("交易关闭", OrderPhase::Closed),
            ("等待卖家发货", OrderPhase::AwaitingShipment),
        ] {
            let payload = json!({
                "1": "9876@goofish",
                "3": { "redReminder": phrase }
            });
            match classify(&payload) {
                Classified::OrderEvent { user_id, phase: p } => {
                    assert_eq!(user_id, "9876");
                    assert_eq!(p, phase);
                }
                other => panic!("expected order event, got {:?}", other),
            }
        }
    }

    #[test]
    fn unknown_reminder_is_not_an_order_event() {
        let payload = json!({
            "1": "9876@goofish",
            "3": { "redReminder": "某种别的提醒" }
        });
        assert!(matches!(
            classify(&payload),
            Classified::Unclassified { .. }
        ));
    }

    #[test]
    fn order_event_wins_over_chat_shape() {
        // Decision order: order events are checked before the chat shape.
        let mut payload = chat_payload("hi");
        payload["3"] = json!({ "redReminder": "交易关闭" });
        assert!(matches!(classify(&payload), Classified::OrderEvent { .. }));
    }

    #[test]
    fn unclassified_surfaces_marker_from_nested_fields() {
        let payload = json!({
            "2": { "inner": "5551.20.PNM" },
            "7": [ "noise", 42 ]
        });
        match classify(&payload) {
            Classified::Unclassified { thread_ref } => {
                assert_eq!(thread_ref.as_deref(), Some("5551.20.PNM"));
            }
            other => panic!("expected unclassified, got {:?}", other),
        }
    }

    #[test]
    fn marker_search_respects_depth_limit() {
        // Marker three levels deep is out of reach at depth 2.
        let payload = json!({
            "a": { "b": { "c": "deep.PNM" } }
        });
        assert!(find_marker_string(&payload, 2).is_none());
        assert!(find_marker_string(&payload, 3).is_some());
    }

    #[test]
    fn marker_search_finds_first_in_lists() {
        let payload = json!({ "ids": ["plain", "777.PNM", "888.PNM"] });
        assert_eq!(find_marker_string(&payload, 2), Some("777.PNM"));
    }
}
