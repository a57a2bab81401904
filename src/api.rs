//! mtop REST client: access-token exchange and item detail.
//!
//! The interesting part is error classification — the backend reports token
//! expiry through `ret[0]` strings, and the session reacts very differently
//! to an expired credential than to a transient failure.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::ident::{sign_request, MTOP_APP_KEY};

const BASE_URL: &str = "https://h5api.m.goofish.com/h5";
const TOKEN_API: &str = "mtop.taobao.idlemessage.pc.login.token";
const ITEM_API: &str = "mtop.taobao.idle.pc.detail";

/// `ret[0]` codes that mean the session credential itself is dead. The
/// misspelled EXOIRED variant is what the platform actually emits.
const EXPIRY_KEYWORDS: &[&str] = &[
    "TOKEN_EMPTY",
    "TOKEN_EXPIRED",
    "SESSION_EXPIRED",
    "SID_INVALID",
    "FAIL_SYS_TOKEN_EXOIRED",
    "FAIL_SYS_TOKEN_EMPTY",
    "ILLEGAL_ACCESS",
];

#[derive(Debug)]
pub enum TokenError {
    /// Credential is expired/invalid; reconnecting will not help until it is
    /// re-acquired.
    Expired(String),
    /// Transient API-level failure; a plain reconnect may succeed.
    Api(String),
    /// Transport-level failure.
    Http(String),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Expired(msg) => write!(f, "credential expired: {}", msg),
            TokenError::Api(msg) => write!(f, "token api error: {}", msg),
            TokenError::Http(msg) => write!(f, "token http error: {}", msg),
        }
    }
}

impl std::error::Error for TokenError {}

/// Classify a `ret[0]` code string.
pub fn is_expiry_code(ret: &str) -> bool {
    EXPIRY_KEYWORDS.iter().any(|k| ret.contains(k))
}

pub struct MtopClient {
    client: Client,
}

impl MtopClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self { client })
    }

    fn request_params(api: &str, t: &str, sign: &str) -> Vec<(&'static str, String)> {
        vec![
            ("jsv", "2.7.2".to_string()),
            ("appKey", MTOP_APP_KEY.to_string()),
            ("t", t.to_string()),
            ("sign", sign.to_string()),
            ("v", "1.0".to_string()),
            ("type", "originaljson".to_string()),
            ("accountSite", "xianyu".to_string()),
            ("dataType", "json".to_string()),
            ("timeout", "20000".to_string()),
            ("api", api.to_string()),
            ("sessionOption", "AutoLoginOnly".to_string()),
            ("spm_cnt", "a21ybx.im.0.0".to_string()),
        ]
    }

    fn cookie_header(cookies: &HashMap<String, String>) -> String {
        cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// The h5 token embedded in the `_m_h5_tk` cookie (value before `_`).
    fn h5_token(cookies: &HashMap<String, String>) -> Result<String, TokenError> {
        cookies
            .get("_m_h5_tk")
            .and_then(|v| v.split('_').next())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                TokenError::Expired("FAIL_SYS_TOKEN_EMPTY: missing _m_h5_tk cookie".into())
            })
    }

    async fn call(
        &self,
        api: &str,
        cookies: &HashMap<String, String>,
        data_val: &str,
    ) -> Result<Value, TokenError> {
        let t = chrono::Utc::now().timestamp_millis().to_string();
        let token = Self::h5_token(cookies)?;
        let sign = sign_request(&t, &token, data_val);
        let params = Self::request_params(api, &t, &sign);

        let url = format!("{}/{}/1.0/", BASE_URL, api);
        debug!(api, "mtop request");

        let resp = self
            .client
            .post(&url)
            .query(&params)
            .header("Cookie", Self::cookie_header(cookies))
            .header("accept", "application/json")
            .header("origin", "https://www.goofish.com")
            .header("referer", "https://www.goofish.com/")
            .header("user-agent", crate::codec::USER_AGENT)
            .form(&[("data", data_val)])
            .send()
            .await
            .map_err(|e| TokenError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TokenError::Http(format!("status {}", status)));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| TokenError::Http(format!("body parse: {}", e)))
    }

    /// Exchange session cookies for the websocket access token.
    pub async fn fetch_access_token(
        &self,
        cookies: &HashMap<String, String>,
        device_id: &str,
    ) -> Result<String, TokenError> {
        for required in ["_m_h5_tk", "unb"] {
            if !cookies.contains_key(required) {
                return Err(TokenError::Expired(format!(
                    "FAIL_SYS_TOKEN_EMPTY: missing {} cookie",
                    required
                )));
            }
        }

        let data_val = format!(
            r#"{{"appKey":"{}","deviceId":"{}"}}"#,
            crate::codec::REG_APP_KEY,
            device_id
        );

        info!(device_id, "requesting access token");
        let res = self.call(TOKEN_API, cookies, &data_val).await?;

        let ret = res["ret"][0].as_str().unwrap_or("");
        let success = res["success"].as_bool().unwrap_or(false) || ret.starts_with("SUCCESS::");

        if let Some(token) = res["data"]["accessToken"].as_str() {
            if success {
                info!("access token acquired");
                return Ok(token.to_string());
            }
        }

        if is_expiry_code(ret) {
            error!(ret, "access token refused: credential expired");
            return Err(TokenError::Expired(ret.to_string()));
        }

        warn!(ret, "access token request unsuccessful");
        Err(TokenError::Api(if ret.is_empty() {
            "response carried no accessToken".to_string()
        } else {
            ret.to_string()
        }))
    }

    /// Item detail lookup.
    #[allow(dead_code)] // Reserved for listing-inspection tooling.
    pub async fn item_detail(
        &self,
        cookies: &HashMap<String, String>,
        item_id: &str,
    ) -> Result<Value, TokenError> {
        let data_val = format!(r#"{{"itemId":"{}"}}"#, item_id);
        let res = self.call(ITEM_API, cookies, &data_val).await?;

        let ret = res["ret"][0].as_str().unwrap_or("");
        if is_expiry_code(ret) {
            return Err(TokenError::Expired(ret.to_string()));
        }
        Ok(res["data"].clone())
    }
}
