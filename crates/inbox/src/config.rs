//! Configuration loading for the inbox pipeline
//!
//! Settings come from (later wins):
//! 1. Built-in defaults
//! 2. `inbox.json` in the shared config directory, or an explicit file
//! 3. Environment variables

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::retry::{RetryBudgets, RetryPolicy, RetrySettings};

/// Config filename in the shared config directory
const CONFIG_FILE: &str = "inbox.json";

pub const MIN_KV_TTL_DAYS: u32 = 1;
pub const MAX_KV_TTL_DAYS: u32 = 30;

/// Credentials and resource ids for the remote stores
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CloudflareSettings {
    pub account_id: Option<String>,
    pub api_token: Option<String>,
    pub database_id: Option<String>,
    pub kv_namespace_id: Option<String>,
    /// Zone whose Email Routing logs are readable
    pub zone_id: Option<String>,
    /// API root override, mainly for local emulators
    pub base_url: Option<String>,
}

impl CloudflareSettings {
    /// Account id and token, when both are set
    pub fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.account_id.as_deref()?, self.api_token.as_deref()?))
    }
}

/// Per call-site retry overrides
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub list: Option<RetrySettings>,
    pub fetch: Option<RetrySettings>,
}

impl RetryConfig {
    pub fn budgets(&self) -> RetryBudgets {
        let defaults = RetryBudgets::default();
        RetryBudgets {
            list: self.list.map(RetryPolicy::from).unwrap_or(defaults.list),
            fetch: self.fetch.map(RetryPolicy::from).unwrap_or(defaults.fetch),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Local SQLite database (primary store)
    pub sqlite_path: Option<PathBuf>,
    /// Local LMDB directory (key/value store)
    pub kv_path: Option<PathBuf>,
    /// Lifetime of key/value entries
    pub kv_ttl_days: u32,
    /// Change stream polling interval
    pub poll_interval_secs: u64,
    /// Global timeout for one HTTP call
    pub http_timeout_secs: u64,
    /// Redis URL for new-mail notifications
    pub redis_url: Option<String>,
    pub cloudflare: CloudflareSettings,
    pub retry: RetryConfig,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            kv_path: None,
            kv_ttl_days: 1,
            poll_interval_secs: 10,
            http_timeout_secs: 30,
            redis_url: None,
            cloudflare: CloudflareSettings::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl InboxConfig {
    /// Load from the shared config directory (if present) and the environment
    pub fn load() -> Result<Self> {
        let config: Self = config::load_json_or_default(CONFIG_FILE)?;
        config.with_overrides(config::env_var).validated()
    }

    /// Load from a specific JSON file, then apply the environment
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = config::load_json_file(path)
            .with_context(|| format!("Failed to load inbox config from {:?}", path))?;
        config.with_overrides(config::env_var).validated()
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("CLOUDFLARE_ACCOUNT_ID") {
            self.cloudflare.account_id = Some(v);
        }
        if let Some(v) = lookup("CLOUDFLARE_API_TOKEN") {
            self.cloudflare.api_token = Some(v);
        }
        if let Some(v) = lookup("DATABASE_ID") {
            self.cloudflare.database_id = Some(v);
        }
        if let Some(v) = lookup("KV_NAMESPACE_ID") {
            self.cloudflare.kv_namespace_id = Some(v);
        }
        if let Some(v) = lookup("CLOUDFLARE_ZONE_ID").or_else(|| lookup("CF_ZONE_ID")) {
            self.cloudflare.zone_id = Some(v);
        }
        if let Some(v) = lookup("REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Some(v) = lookup("INBOX_SQLITE_PATH") {
            self.sqlite_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("INBOX_KV_PATH") {
            self.kv_path = Some(PathBuf::from(v));
        }
        self
    }

    /// Fill unset local store paths with locations in the data directory
    pub fn with_local_defaults(mut self) -> Self {
        if self.sqlite_path.is_none() {
            self.sqlite_path = config::data_path("inbox.sqlite");
        }
        if self.kv_path.is_none() {
            self.kv_path = config::data_path("kv");
        }
        self
    }

    /// Check URLs and bring numeric settings into range
    pub fn validated(mut self) -> Result<Self> {
        let ttl = self.kv_ttl_days.clamp(MIN_KV_TTL_DAYS, MAX_KV_TTL_DAYS);
        if ttl != self.kv_ttl_days {
            log::warn!(
                "[CONFIG] kv_ttl_days {} out of range, using {}",
                self.kv_ttl_days,
                ttl
            );
            self.kv_ttl_days = ttl;
        }
        self.poll_interval_secs = self.poll_interval_secs.max(1);
        self.http_timeout_secs = self.http_timeout_secs.max(1);

        if let Some(redis_url) = &self.redis_url {
            let parsed = Url::parse(redis_url).context("Invalid REDIS_URL")?;
            if !matches!(parsed.scheme(), "redis" | "rediss") {
                bail!("REDIS_URL must use redis:// or rediss://, got {}", parsed.scheme());
            }
        }
        if let Some(base_url) = &self.cloudflare.base_url {
            Url::parse(base_url).context("Invalid Cloudflare base_url")?;
        }

        Ok(self)
    }

    pub fn kv_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.kv_ttl_days))
    }

    pub fn kv_ttl_secs(&self) -> u64 {
        u64::from(self.kv_ttl_days) * 24 * 60 * 60
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_budgets(&self) -> RetryBudgets {
        self.retry.budgets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = InboxConfig::default().validated().unwrap();
        assert_eq!(config.kv_ttl_days, 1);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.retry_budgets(), RetryBudgets::default());
        assert!(config.cloudflare.credentials().is_none());
    }

    #[test]
    fn test_ttl_is_clamped() {
        let config = InboxConfig {
            kv_ttl_days: 90,
            ..Default::default()
        };
        assert_eq!(config.validated().unwrap().kv_ttl_days, MAX_KV_TTL_DAYS);

        let config = InboxConfig {
            kv_ttl_days: 0,
            ..Default::default()
        };
        let config = config.validated().unwrap();
        assert_eq!(config.kv_ttl_days, MIN_KV_TTL_DAYS);
        assert_eq!(config.kv_ttl_secs(), 86_400);
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inbox.json");
        fs::write(
            &path,
            r#"{
                "kv_ttl_days": 7,
                "redis_url": "redis://file:6379",
                "cloudflare": { "account_id": "from-file" },
                "retry": { "fetch": { "max_attempts": 9, "base_delay_ms": 5 } }
            }"#,
        )
        .unwrap();

        let config: InboxConfig = config::load_json_file(&path).unwrap();
        let config = config
            .with_overrides(lookup(&[
                ("CLOUDFLARE_ACCOUNT_ID", "from-env"),
                ("CLOUDFLARE_API_TOKEN", "tok"),
                ("INBOX_SQLITE_PATH", "/tmp/inbox.sqlite"),
                ("CF_ZONE_ID", "zone-1"),
            ]))
            .validated()
            .unwrap();

        assert_eq!(config.kv_ttl_days, 7);
        assert_eq!(config.cloudflare.credentials(), Some(("from-env", "tok")));
        assert_eq!(config.cloudflare.zone_id.as_deref(), Some("zone-1"));
        assert_eq!(config.redis_url.as_deref(), Some("redis://file:6379"));
        assert_eq!(config.sqlite_path, Some(PathBuf::from("/tmp/inbox.sqlite")));
        let budgets = config.retry_budgets();
        assert_eq!(budgets.fetch, RetryPolicy::new(9, Duration::from_millis(5)));
        assert_eq!(budgets.list, RetryPolicy::for_listing());
    }

    #[test]
    fn test_local_defaults_keep_explicit_paths() {
        let config = InboxConfig {
            sqlite_path: Some(PathBuf::from("/srv/inbox.sqlite")),
            ..Default::default()
        }
        .with_local_defaults();
        assert_eq!(config.sqlite_path, Some(PathBuf::from("/srv/inbox.sqlite")));
        assert!(config.kv_path.unwrap().ends_with("tempmail/kv"));
    }

    #[test]
    fn test_bad_redis_url_is_rejected() {
        let config = InboxConfig::default().with_overrides(lookup(&[("REDIS_URL", "http://nope")]));
        assert!(config.validated().is_err());
    }
}
