//! System-notice phrase table.
//!
//! The backend delivers order/system notices as chat-shaped messages whose
//! text contains one of a known set of phrases. Subtypes matter because the
//! suppression windows differ (shipping notices stay quiet far longer).

/// Notice subtype, keyed into the dedup ledger per (user, subtype).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    /// "发来一条新消息" — the backend's generic new-message banner, prone
    /// to double delivery.
    NewMessage,
    /// Shipping and logistics notices.
    Shipping,
    /// Payment/order-placement notices.
    Payment,
    /// Post-sale order state changes.
    OrderState,
    /// Everything else in the phrase table.
    Generic,
}

const NEW_MESSAGE_PHRASES: &[&str] = &["发来一条新消息"];

const SHIPPING_PHRASES: &[&str] = &["你已发货", "准备发货", "发货提醒", "快递信息", "物流更新"];

const PAYMENT_PHRASES: &[&str] = &["已付款", "已经付款", "已下单"];

const ORDER_STATE_PHRASES: &[&str] = &["已收货", "已评价", "已退款", "订单更新"];

const GENERIC_PHRASES: &[&str] = &["买家留言", "系统通知"];

/// Classify a message text against the phrase table. First matching subtype
/// wins; shipping is checked before payment so "准备发货" notices that also
/// mention payment land on the longer window.
pub fn classify_notice(text: &str) -> Option<NoticeKind> {
    let tables: &[(&[&str], NoticeKind)] = &[
        (NEW_MESSAGE_PHRASES, NoticeKind::NewMessage),
        (SHIPPING_PHRASES, NoticeKind::Shipping),
        (PAYMENT_PHRASES, NoticeKind::Payment),
        (ORDER_STATE_PHRASES, NoticeKind::OrderState),
        (GENERIC_PHRASES, NoticeKind::Generic),
    ];
    for (phrases, kind) in tables {
        if phrases.iter().any(|p| text.contains(p)) {
            return Some(*kind);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipping_phrases_classify_as_shipping() {
        assert_eq!(classify_notice("你已发货，请留意"), Some(NoticeKind::Shipping));
        assert_eq!(classify_notice("快递信息更新"), Some(NoticeKind::Shipping));
        assert_eq!(classify_notice("物流更新：运输中"), Some(NoticeKind::Shipping));
    }

    #[test]
    fn new_message_banner_is_its_own_subtype() {
        assert_eq!(
            classify_notice("对方发来一条新消息"),
            Some(NoticeKind::NewMessage)
        );
    }

    #[test]
    fn payment_and_order_state() {
        assert_eq!(classify_notice("买家已付款"), Some(NoticeKind::Payment));
        assert_eq!(classify_notice("买家已下单"), Some(NoticeKind::Payment));
        assert_eq!(classify_notice("订单更新"), Some(NoticeKind::OrderState));
        assert_eq!(classify_notice("买家已收货"), Some(NoticeKind::OrderState));
    }

    #[test]
    fn ordinary_chat_is_not_a_notice() {
        assert_eq!(classify_notice("多少钱"), None);
        assert_eq!(classify_notice("还在吗？"), None);
        assert_eq!(classify_notice("hello"), None);
    }
}
