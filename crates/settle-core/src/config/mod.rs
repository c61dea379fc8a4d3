//! Sync policy and remote endpoint configuration.
//!
//! `SyncConfig` is the runtime form used by the engine and resolver.
//! `SyncSettings` and `RemoteConfig` are the serde forms that clients load from
//! their own config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_RETRY_CEILING: u32 = 3;
const DEFAULT_RECENCY_WINDOW_SECS: u64 = 5 * 60;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_RECONNECT_DEBOUNCE_MS: u64 = 1_000;
const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_PULL_LIMIT: usize = 100;
const DEFAULT_MERGE_SEPARATOR: &str = " | ";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Policy knobs for the sync engine and conflict resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Failed push attempts before an action is parked as failed
    pub retry_ceiling: u32,
    /// Local mutations younger than this win conflicts outright
    pub recency_window: Duration,
    /// Automatic sync interval while online (`None` disables the timer)
    pub sync_interval: Option<Duration>,
    /// Delay after regaining connectivity before syncing
    pub reconnect_debounce: Duration,
    /// Cached records older than this are evicted after a pull
    pub cache_max_age: Duration,
    /// Records fetched per collection on each pull
    pub pull_limit: usize,
    /// Joins local and remote text when a text conflict is merged
    pub merge_separator: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: DEFAULT_RETRY_CEILING,
            recency_window: Duration::from_secs(DEFAULT_RECENCY_WINDOW_SECS),
            sync_interval: Some(Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS)),
            reconnect_debounce: Duration::from_millis(DEFAULT_RECONNECT_DEBOUNCE_MS),
            cache_max_age: Duration::from_secs(DEFAULT_CACHE_MAX_AGE_SECS),
            pull_limit: DEFAULT_PULL_LIMIT,
            merge_separator: DEFAULT_MERGE_SEPARATOR.to_string(),
        }
    }
}

impl SyncConfig {
    /// Set the automatic sync interval
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Disable automatic sync (manual and reconnect triggers only)
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    #[must_use]
    pub const fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    #[must_use]
    pub const fn with_recency_window(mut self, window: Duration) -> Self {
        self.recency_window = window;
        self
    }

    #[must_use]
    pub const fn with_reconnect_debounce(mut self, debounce: Duration) -> Self {
        self.reconnect_debounce = debounce;
        self
    }

    #[must_use]
    pub const fn with_cache_max_age(mut self, max_age: Duration) -> Self {
        self.cache_max_age = max_age;
        self
    }

    #[must_use]
    pub const fn with_pull_limit(mut self, limit: usize) -> Self {
        self.pull_limit = limit;
        self
    }

    /// Reject settings that would stall the outbox or the pull.
    pub fn validate(&self) -> Result<()> {
        if self.retry_ceiling == 0 {
            return Err(Error::InvalidInput(
                "retry_ceiling must be at least 1".to_string(),
            ));
        }
        if self.pull_limit == 0 {
            return Err(Error::InvalidInput(
                "pull_limit must be at least 1".to_string(),
            ));
        }
        if self.sync_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::InvalidInput(
                "sync_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// File representation of `SyncConfig` using whole seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SyncSettings {
    #[serde(default)]
    pub retry_ceiling: Option<u32>,
    #[serde(default)]
    pub recency_window_secs: Option<u64>,
    /// `0` disables the timer
    #[serde(default)]
    pub sync_interval_secs: Option<u64>,
    #[serde(default)]
    pub reconnect_debounce_ms: Option<u64>,
    #[serde(default)]
    pub cache_max_age_days: Option<u64>,
    #[serde(default)]
    pub pull_limit: Option<usize>,
    #[serde(default)]
    pub merge_separator: Option<String>,
}

impl SyncSettings {
    /// Apply the settings on top of the defaults.
    pub fn to_config(&self) -> Result<SyncConfig> {
        let defaults = SyncConfig::default();
        let config = SyncConfig {
            retry_ceiling: self.retry_ceiling.unwrap_or(defaults.retry_ceiling),
            recency_window: self
                .recency_window_secs
                .map_or(defaults.recency_window, Duration::from_secs),
            sync_interval: match self.sync_interval_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.sync_interval,
            },
            reconnect_debounce: self
                .reconnect_debounce_ms
                .map_or(defaults.reconnect_debounce, Duration::from_millis),
            cache_max_age: self
                .cache_max_age_days
                .map_or(defaults.cache_max_age, |days| {
                    Duration::from_secs(days.saturating_mul(24 * 60 * 60))
                }),
            pull_limit: self.pull_limit.unwrap_or(defaults.pull_limit),
            merge_separator: self
                .merge_separator
                .clone()
                .unwrap_or(defaults.merge_separator),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Endpoint and credentials for the REST backend.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl RemoteConfig {
    /// Check if the endpoint is configured
    pub const fn is_configured(&self) -> bool {
        self.api_base_url.is_some() && self.api_key.is_some()
    }

    /// Trim values and drop empties.
    pub fn normalize(&mut self) {
        self.api_base_url = normalize_text_option(self.api_base_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.api_key = normalize_text_option(self.api_key.take());
        self.access_token = normalize_text_option(self.access_token.take());
    }

    /// Base URL, validated to use an HTTP scheme.
    pub fn base_url(&self) -> Result<&str> {
        let url = self
            .api_base_url
            .as_deref()
            .ok_or_else(|| Error::InvalidInput("api_base_url is required".to_string()))?;
        if is_http_url(url) {
            Ok(url)
        } else {
            Err(Error::InvalidInput(
                "api_base_url must include http:// or https://".to_string(),
            ))
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_policy() {
        let config = SyncConfig::default();
        assert_eq!(config.retry_ceiling, 3);
        assert_eq!(config.recency_window, Duration::from_secs(300));
        assert_eq!(config.sync_interval, Some(Duration::from_secs(300)));
        assert_eq!(config.reconnect_debounce, Duration::from_secs(1));
        assert_eq!(config.cache_max_age, Duration::from_secs(30 * 86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn settings_zero_interval_disables_timer() {
        let settings = SyncSettings {
            sync_interval_secs: Some(0),
            retry_ceiling: Some(5),
            ..Default::default()
        };
        let config = settings.to_config().unwrap();
        assert_eq!(config.sync_interval, None);
        assert_eq!(config.retry_ceiling, 5);
    }

    #[test]
    fn settings_reject_zero_ceiling() {
        let settings = SyncSettings {
            retry_ceiling: Some(0),
            ..Default::default()
        };
        assert!(settings.to_config().is_err());
    }

    #[test]
    fn settings_reject_unknown_fields() {
        let error = serde_json::from_str::<SyncSettings>(r#"{"retries": 3}"#).unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn remote_config_normalizes_and_validates_url() {
        let mut config = RemoteConfig {
            api_base_url: Some(" https://api.example.com/ ".to_string()),
            api_key: Some("anon".to_string()),
            access_token: Some("  ".to_string()),
            request_timeout_secs: None,
        };
        config.normalize();
        assert!(config.is_configured());
        assert_eq!(config.base_url().unwrap(), "https://api.example.com");
        assert_eq!(config.access_token, None);

        config.api_base_url = Some("api.example.com".to_string());
        assert!(config.base_url().is_err());
    }

    #[test]
    fn remote_config_debug_redacts_secrets() {
        let config = RemoteConfig {
            api_base_url: Some("https://api.example.com".to_string()),
            api_key: Some("secret-key".to_string()),
            access_token: Some("secret-token".to_string()),
            request_timeout_secs: None,
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
