//! Reply generation through an OpenAI-compatible chat-completions endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::traits::{GeneratedReply, ReplyGenerator, ReplyRequest, Role};

/// Reply when generation fails outright.
pub const FALLBACK_REPLY: &str = "抱歉，系统繁忙，请稍后再试。";

/// Reply to an empty or whitespace-only inbound message.
pub const EMPTY_MESSAGE_REPLY: &str = "您好，有什么我可以帮您的吗？";

/// Templated acknowledgment for generic system notices.
pub const NOTICE_REPLY: &str = "好的，收到！如有问题随时联系我~";

/// Templated acknowledgment for shipping notices.
pub const SHIPPING_REPLY: &str = "已发货啦，请留意物流信息，收到货如有问题随时联系我~";

const DEFAULT_PROMPT: &str =
    "你是闲鱼平台上卖家的智能助手，请帮助卖家回复买家的询问，保持礼貌和专业。";

const BLOCKED_PHRASES: &[&str] = &["微信", "QQ", "支付宝", "银行卡", "线下"];

const SAFETY_REPLY: &str = "[安全提醒]请通过平台沟通";

const PRICE_KEYWORDS: &[&str] = &[
    "价格", "优惠", "便宜", "贵", "元", "折扣", "价钱", "多少钱",
];

/// Replace replies steering the buyer off-platform with a fixed warning.
pub fn safety_filter(text: &str) -> String {
    if BLOCKED_PHRASES.iter().any(|p| text.contains(p)) {
        SAFETY_REPLY.to_string()
    } else {
        text.to_string()
    }
}

/// Whether this exchange reads as price negotiation: keyword match on the
/// inbound message or the generated reply.
pub fn is_price_related(user_msg: &str, reply: &str) -> bool {
    PRICE_KEYWORDS
        .iter()
        .any(|k| user_msg.contains(k) || reply.contains(k))
}

pub struct OpenAiReplyGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
}

impl OpenAiReplyGenerator {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        system_prompt: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
        })
    }

    /// Temperature rises slightly with the bargain count so repeated haggling
    /// gets less formulaic answers.
    fn temperature(bargain_count: u32) -> f64 {
        0.4 + (bargain_count as f64 * 0.05).min(0.3)
    }

    fn build_messages(&self, request: &ReplyRequest) -> Vec<Value> {
        let context_text = request
            .context
            .iter()
            .map(|turn| format!("{}: {}", turn.role.as_str(), turn.content))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            "【商品信息】{}\n【你与客户对话历史】{}\n【议价次数】{}\n{}",
            request.item_description, context_text, request.bargain_count, self.system_prompt
        );

        vec![
            json!({ "role": Role::System.as_str(), "content": system }),
            json!({ "role": Role::User.as_str(), "content": request.message }),
        ]
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiReplyGenerator {
    async fn generate(&self, request: &ReplyRequest) -> anyhow::Result<GeneratedReply> {
        if request.message.trim().is_empty() {
            warn!("empty inbound message, using stock reply");
            return Ok(GeneratedReply {
                text: EMPTY_MESSAGE_REPLY.to_string(),
                price_related: false,
            });
        }

        let body = json!({
            "model": self.model,
            "messages": self.build_messages(request),
            "temperature": Self::temperature(request.bargain_count),
            "max_tokens": 500,
            "top_p": 0.8,
        });

        let url = format!("{}/chat/completions", self.base_url);
        info!(model = %self.model, bargain_count = request.bargain_count, "generating reply");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let payload: Value = resp.json().await?;
        if !status.is_success() {
            error!(status = %status, "reply generation request failed");
            anyhow::bail!("generation endpoint returned {}", status);
        }

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("generation response missing content"))?;

        let filtered = safety_filter(text);
        let price_related = is_price_related(&request.message, &filtered);

        Ok(GeneratedReply {
            text: filtered,
            price_related,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_filter_blocks_off_platform_contact() {
        assert_eq!(safety_filter("加我微信聊"), SAFETY_REPLY);
        assert_eq!(safety_filter("支付宝转账吧"), SAFETY_REPLY);
        assert_eq!(safety_filter("可以便宜10元"), "可以便宜10元");
    }

    #[test]
    fn price_signal_matches_either_side() {
        assert!(is_price_related("多少钱", "你好"));
        assert!(is_price_related("在吗", "最低100元"));
        assert!(!is_price_related("发货了吗", "已经发出"));
    }

    #[test]
    fn temperature_scales_with_bargaining_and_caps() {
        assert!((OpenAiReplyGenerator::temperature(0) - 0.4).abs() < 1e-9);
        assert!((OpenAiReplyGenerator::temperature(2) - 0.5).abs() < 1e-9);
        // Cap at +0.3 no matter how long the haggling has gone on.
        assert!((OpenAiReplyGenerator::temperature(20) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn prompt_carries_item_context_and_bargain_count() {
        let generator =
            OpenAiReplyGenerator::new("https://example.com/v1", "key", "qwen-max", None).unwrap();
        let request = ReplyRequest {
            message: "多少钱".into(),
            item_description: "二手键盘".into(),
            context: vec![crate::traits::Turn {
                role: Role::User,
                content: "在吗".into(),
            }],
            bargain_count: 3,
        };

        let messages = generator.build_messages(&request);
        let system = messages[0]["content"].as_str().unwrap();
        assert!(system.contains("【商品信息】二手键盘"));
        assert!(system.contains("user: 在吗"));
        assert!(system.contains("【议价次数】3"));
        assert_eq!(messages[1]["content"], "多少钱");
    }
}
