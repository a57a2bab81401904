//! Credential snapshot management.
//!
//! Credentials are an opaque cookie map plus a localStorage snapshot,
//! captured by an interactive browser login and cached as JSON. The daemon
//! only cares about loading the snapshot, deriving its own identity from it,
//! and deleting it when the session layer decides a full re-auth is needed.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::traits::CredentialProvider;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(rename = "localStorage", default)]
    pub local_storage: HashMap<String, String>,
}

impl Credentials {
    /// Parse a raw `key=value; key=value` cookie string.
    pub fn from_cookie_string(raw: &str) -> Self {
        let mut cookies = HashMap::new();
        for pair in raw.split("; ") {
            if let Some((key, value)) = pair.split_once('=') {
                if !key.is_empty() {
                    cookies.insert(key.to_string(), value.to_string());
                }
            }
        }
        Self {
            cookies,
            local_storage: HashMap::new(),
        }
    }

    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Own account id: the `unb` cookie, falling back to the `hid` field of
    /// the `havana_lgc2_77` login cookie.
    pub fn user_id(&self) -> anyhow::Result<String> {
        if let Some(unb) = self.cookies.get("unb") {
            return Ok(unb.clone());
        }
        if let Some(havana) = self.cookies.get("havana_lgc2_77") {
            let value: serde_json::Value = serde_json::from_str(havana)?;
            if let Some(hid) = value["hid"].as_i64() {
                info!("own id recovered from havana_lgc2_77");
                return Ok(hid.to_string());
            }
            if let Some(hid) = value["hid"].as_str() {
                info!("own id recovered from havana_lgc2_77");
                return Ok(hid.to_string());
            }
        }
        anyhow::bail!("credentials carry no unb cookie and no havana hid")
    }
}

/// File-backed credential cache with invalidate-by-delete semantics.
pub struct CredentialCache {
    cache_path: PathBuf,
    /// Browser-state snapshot used by the interactive flow to skip login;
    /// deleted on invalidation so the next acquisition is fully interactive.
    browser_state_path: PathBuf,
    /// Environment variable holding a raw cookie string override.
    cookie_env: String,
}

impl CredentialCache {
    pub fn new(cache_path: &str, browser_state_path: &str, cookie_env: &str) -> Self {
        Self {
            cache_path: PathBuf::from(cache_path),
            browser_state_path: PathBuf::from(browser_state_path),
            cookie_env: cookie_env.to_string(),
        }
    }

    pub async fn load(&self) -> anyhow::Result<Option<Credentials>> {
        if let Ok(raw) = std::env::var(&self.cookie_env) {
            if !raw.trim().is_empty() {
                info!(env = %self.cookie_env, "using cookie string from environment");
                return Ok(Some(Credentials::from_cookie_string(&raw)));
            }
        }

        if !self.cache_path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.cache_path).await?;
        let creds: Credentials = serde_json::from_str(&content)?;
        if creds.cookies.is_empty() {
            warn!(path = %self.cache_path.display(), "credential cache has no cookies");
            return Ok(None);
        }
        info!(path = %self.cache_path.display(), "loaded credential cache");
        Ok(Some(creds))
    }

    pub async fn save(&self, creds: &Credentials) -> anyhow::Result<()> {
        if let Some(dir) = self.cache_path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let content = serde_json::to_string_pretty(creds)?;
        tokio::fs::write(&self.cache_path, content).await?;
        info!(path = %self.cache_path.display(), "saved credential cache");
        Ok(())
    }

    /// Delete every persisted credential artifact. The next acquisition has
    /// nothing to silently refresh from.
    pub async fn invalidate(&self) -> anyhow::Result<()> {
        for path in [&self.cache_path, &self.browser_state_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!(path = %path.display(), "deleted credential state"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialProvider for CredentialCache {
    async fn credentials(&self, force_interactive: bool) -> anyhow::Result<Option<Credentials>> {
        if force_interactive {
            // The interactive browser flow lives outside this daemon; all we
            // can do is clear the stale state and tell the operator.
            self.invalidate().await?;
            warn!(
                "interactive re-auth required: log in via the companion \
                 login flow, then restart or wait for the next retry"
            );
        }
        self.load().await
    }

    async fn invalidate(&self) -> anyhow::Result<()> {
        CredentialCache::invalidate(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(dir: &tempfile::TempDir) -> CredentialCache {
        CredentialCache::new(
            dir.path().join("cookies.json").to_str().unwrap(),
            dir.path().join("browser_state.json").to_str().unwrap(),
            "GOOFISHD_TEST_COOKIES_UNSET",
        )
    }

    #[test]
    fn cookie_string_parses_pairs_with_equals_in_value() {
        let creds = Credentials::from_cookie_string("unb=123; tk=a=b=c; x=");
        assert_eq!(creds.cookies.get("unb").unwrap(), "123");
        assert_eq!(creds.cookies.get("tk").unwrap(), "a=b=c");
        assert_eq!(creds.cookies.get("x").unwrap(), "");
    }

    #[test]
    fn user_id_prefers_unb() {
        let mut creds = Credentials::from_cookie_string("unb=42");
        creds
            .cookies
            .insert("havana_lgc2_77".into(), r#"{"hid": 99}"#.into());
        assert_eq!(creds.user_id().unwrap(), "42");
    }

    #[test]
    fn user_id_falls_back_to_havana_hid() {
        let creds = Credentials::from_cookie_string("havana_lgc2_77={\"hid\": 99}");
        assert_eq!(creds.user_id().unwrap(), "99");
    }

    #[test]
    fn user_id_fails_without_identity() {
        let creds = Credentials::from_cookie_string("other=1");
        assert!(creds.user_id().is_err());
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);

        assert!(cache.load().await.unwrap().is_none());

        let creds = Credentials::from_cookie_string("unb=7; _m_h5_tk=t_1");
        cache.save(&creds).await.unwrap();

        let loaded = cache.load().await.unwrap().unwrap();
        assert_eq!(loaded.cookies.get("unb").unwrap(), "7");
    }

    #[tokio::test]
    async fn invalidate_deletes_cache_and_browser_state() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);

        cache
            .save(&Credentials::from_cookie_string("unb=7"))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("browser_state.json"), "{}")
            .await
            .unwrap();

        CredentialCache::invalidate(&cache).await.unwrap();
        assert!(cache.load().await.unwrap().is_none());
        assert!(!dir.path().join("browser_state.json").exists());
    }

    #[tokio::test]
    async fn invalidate_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);
        CredentialCache::invalidate(&cache).await.unwrap();
    }
}
