use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Empty means fall back to the OPENAI_API_KEY environment variable.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Optional path to a persona prompt file prepended to every request.
    #[serde(default)]
    pub prompt_path: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            prompt_path: None,
        }
    }
}

fn default_llm_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}
fn default_llm_model() -> String {
    "qwen-max".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Settle delay between the register frame and the sync ack.
    #[serde(default = "default_register_settle_ms")]
    pub register_settle_ms: u64,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_cap_secs")]
    pub retry_cap_secs: u64,
    /// Consecutive connection failures before credentials are invalidated.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Token-fetch failures before credentials are invalidated.
    #[serde(default = "default_max_token_failures")]
    pub max_token_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            register_settle_ms: default_register_settle_ms(),
            retry_base_secs: default_retry_base_secs(),
            retry_cap_secs: default_retry_cap_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_token_failures: default_max_token_failures(),
        }
    }
}

fn default_endpoint() -> String {
    "wss://wss-goofish.dingtalk.com/".to_string()
}
fn default_heartbeat_interval_secs() -> u64 {
    15
}
fn default_heartbeat_timeout_secs() -> u64 {
    5
}
fn default_register_settle_ms() -> u64 {
    1000
}
fn default_retry_base_secs() -> u64 {
    5
}
fn default_retry_cap_secs() -> u64 {
    30
}
fn default_max_consecutive_failures() -> u32 {
    10
}
fn default_max_token_failures() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_ingress_window_secs")]
    pub ingress_window_secs: u64,
    #[serde(default = "default_notice_window_secs")]
    pub notice_window_secs: u64,
    #[serde(default = "default_shipping_window_secs")]
    pub shipping_window_secs: u64,
    #[serde(default = "default_burst_guard_secs")]
    pub burst_guard_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ingress_window_secs: default_ingress_window_secs(),
            notice_window_secs: default_notice_window_secs(),
            shipping_window_secs: default_shipping_window_secs(),
            burst_guard_secs: default_burst_guard_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_ingress_window_secs() -> u64 {
    30
}
fn default_notice_window_secs() -> u64 {
    60
}
fn default_shipping_window_secs() -> u64 {
    2 * 60 * 60
}
fn default_burst_guard_secs() -> u64 {
    10
}
fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    3
}
fn default_queue_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Max turns kept per conversation.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_history: default_max_history(),
        }
    }
}

fn default_db_path() -> String {
    "data/chat_history.db".to_string()
}
fn default_max_history() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialsConfig {
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
    #[serde(default = "default_browser_state_path")]
    pub browser_state_path: String,
    /// Environment variable consulted before the cache file.
    #[serde(default = "default_cookie_env")]
    pub cookie_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            browser_state_path: default_browser_state_path(),
            cookie_env: default_cookie_env(),
        }
    }
}

fn default_cache_path() -> String {
    "data/goofish_cookies.json".to_string()
}
fn default_browser_state_path() -> String {
    "data/browser_state.json".to_string()
}
fn default_cookie_env() -> String {
    "GOOFISH_COOKIES".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    /// Set to "0.0.0.0" to listen on all interfaces.
    #[serde(default = "default_health_bind")]
    pub health_bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
            health_bind: default_health_bind(),
        }
    }
}

fn default_health_port() -> u16 {
    8080
}
fn default_health_bind() -> String {
    "127.0.0.1".to_string()
}

impl AppConfig {
    /// Load config.toml; a missing file means all defaults (secrets can come
    /// entirely from the environment).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolved LLM API key: config value, else environment.
    pub fn llm_api_key(&self) -> String {
        if !self.llm.api_key.is_empty() {
            return self.llm.api_key.clone();
        }
        std::env::var("OPENAI_API_KEY").unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = AppConfig::default();
        assert_eq!(config.session.heartbeat_interval_secs, 15);
        assert_eq!(config.session.heartbeat_timeout_secs, 5);
        assert_eq!(config.session.max_consecutive_failures, 10);
        assert_eq!(config.session.max_token_failures, 3);
        assert_eq!(config.dedup.ingress_window_secs, 30);
        assert_eq!(config.dedup.notice_window_secs, 60);
        assert_eq!(config.dedup.shipping_window_secs, 7200);
        assert_eq!(config.dedup.burst_guard_secs, 10);
        assert_eq!(config.dispatch.workers, 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [session]
            heartbeat_interval_secs = 20

            [llm]
            model = "qwen-plus"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.heartbeat_interval_secs, 20);
        assert_eq!(config.session.heartbeat_timeout_secs, 5);
        assert_eq!(config.llm.model, "qwen-plus");
        assert_eq!(config.dispatch.workers, 3);
    }
}
