//! Persistent CLI profile configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use settle_core::config::{RemoteConfig, SyncConfig, SyncSettings};
use settle_core::util::normalize_text_option;

use crate::error::CliError;

const CONFIG_FILE_NAME: &str = "cli-config.json";

pub const PROFILE_ENV: &str = "SETTLE_PROFILE";
pub const API_URL_ENV: &str = "SETTLE_API_URL";
pub const API_KEY_ENV: &str = "SETTLE_API_KEY";
pub const ACCESS_TOKEN_ENV: &str = "SETTLE_ACCESS_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfilesConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, CliProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfile {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncSettings,
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("settle")
        .join(CONFIG_FILE_NAME)
}

pub fn normalize_profile_name(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl CliProfilesConfig {
    pub fn load() -> Result<Self, CliError> {
        Self::load_from_path(&default_config_path())
    }

    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|error| {
            CliError::Config(format!(
                "Failed to read config at {}: {error}",
                path.display()
            ))
        })?;
        let mut config = serde_json::from_str::<Self>(&raw).map_err(|error| {
            CliError::Config(format!(
                "Failed to parse config at {}: {error}",
                path.display()
            ))
        })?;
        config.normalize();
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), CliError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut normalized = self.clone();
        normalized.normalize();
        std::fs::write(path, serde_json::to_string_pretty(&normalized)?)?;
        Ok(())
    }

    /// Explicit flag, then `SETTLE_PROFILE`, then the stored active profile.
    pub fn resolve_profile_name(&self, explicit: Option<&str>) -> String {
        normalize_profile_name(explicit)
            .or_else(|| normalize_profile_name(std::env::var(PROFILE_ENV).ok().as_deref()))
            .or_else(|| normalize_profile_name(self.active_profile.as_deref()))
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn profile(&self, name: &str) -> Option<&CliProfile> {
        self.profiles.get(name)
    }

    fn normalize(&mut self) {
        self.active_profile = normalize_profile_name(self.active_profile.as_deref());
        for profile in self.profiles.values_mut() {
            profile.remote.normalize();
        }
    }
}

impl CliProfile {
    /// Remote endpoint with environment overrides applied.
    pub fn remote_config(&self, lookup: impl Fn(&str) -> Option<String>) -> RemoteConfig {
        let mut remote = self.remote.clone();
        for (key, slot) in [
            (API_URL_ENV, &mut remote.api_base_url),
            (API_KEY_ENV, &mut remote.api_key),
            (ACCESS_TOKEN_ENV, &mut remote.access_token),
        ] {
            if let Some(value) = normalize_text_option(lookup(key)) {
                *slot = Some(value);
            }
        }
        remote.normalize();
        remote
    }

    pub fn sync_config(&self) -> Result<SyncConfig, CliError> {
        Ok(self.sync.to_config()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn normalize_profile_name_rejects_empty() {
        assert_eq!(normalize_profile_name(None), None);
        assert_eq!(normalize_profile_name(Some(" ")), None);
        assert_eq!(normalize_profile_name(Some(" work ")), Some("work".into()));
    }

    #[test]
    fn config_roundtrip_normalizes_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = CliProfilesConfig {
            version: 1,
            active_profile: Some(" default ".to_string()),
            profiles: BTreeMap::new(),
        };
        config.profiles.insert(
            "default".to_string(),
            CliProfile {
                remote: RemoteConfig {
                    api_base_url: Some(" https://api.example.com/ ".to_string()),
                    api_key: Some(" anon-key ".to_string()),
                    access_token: Some("  ".to_string()),
                    request_timeout_secs: Some(10),
                },
                sync: SyncSettings {
                    retry_ceiling: Some(5),
                    ..SyncSettings::default()
                },
            },
        );

        config.save_to_path(&path).unwrap();
        let loaded = CliProfilesConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.active_profile.as_deref(), Some("default"));
        let profile = loaded.profile("default").unwrap();
        assert_eq!(
            profile.remote.api_base_url.as_deref(),
            Some("https://api.example.com")
        );
        assert_eq!(profile.remote.api_key.as_deref(), Some("anon-key"));
        assert_eq!(profile.remote.access_token, None);
        assert_eq!(profile.sync_config().unwrap().retry_ceiling, 5);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CliProfilesConfig::load_from_path(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(config, CliProfilesConfig::default());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CliProfilesConfig::load_from_path(&path),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn resolve_profile_name_prefers_explicit_then_active() {
        let config = CliProfilesConfig {
            version: 1,
            active_profile: Some("work".to_string()),
            profiles: BTreeMap::new(),
        };
        assert_eq!(config.resolve_profile_name(Some("mobile")), "mobile");
        if std::env::var(PROFILE_ENV).is_err() {
            assert_eq!(config.resolve_profile_name(None), "work");
        }
    }

    #[test]
    fn environment_overrides_profile_remote() {
        let profile = CliProfile {
            remote: RemoteConfig {
                api_base_url: Some("https://stored.example.com".to_string()),
                api_key: Some("stored-key".to_string()),
                ..RemoteConfig::default()
            },
            sync: SyncSettings::default(),
        };
        let remote = profile.remote_config(|key| match key {
            API_URL_ENV => Some("https://env.example.com/".to_string()),
            ACCESS_TOKEN_ENV => Some("token".to_string()),
            _ => None,
        });
        assert_eq!(
            remote.api_base_url.as_deref(),
            Some("https://env.example.com")
        );
        assert_eq!(remote.api_key.as_deref(), Some("stored-key"));
        assert_eq!(remote.access_token.as_deref(), Some("token"));
    }

    #[test]
    fn sync_settings_disable_timer_with_zero() {
        let profile = CliProfile {
            remote: RemoteConfig::default(),
            sync: SyncSettings {
                sync_interval_secs: Some(0),
                cache_max_age_days: Some(7),
                ..SyncSettings::default()
            },
        };
        let config = profile.sync_config().unwrap();
        assert_eq!(config.sync_interval, None);
        assert_eq!(config.cache_max_age, Duration::from_secs(7 * 24 * 60 * 60));
    }
}
