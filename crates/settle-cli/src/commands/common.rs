use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use settle_core::config::{RemoteConfig, SyncConfig};
use settle_core::db::SqliteLocalStore;
use settle_core::models::{CachedRecord, PendingAction};
use settle_core::ActionId;

use crate::config_profiles::CliProfilesConfig;
use crate::error::CliError;

const PREVIEW_CHARS: usize = 48;

/// Everything a command needs to know about its environment.
pub struct Context {
    pub db_path: PathBuf,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
}

impl Context {
    pub fn resolve(db_path: Option<PathBuf>, profile: Option<&str>) -> Result<Self, CliError> {
        let config = CliProfilesConfig::load()?;
        let name = config.resolve_profile_name(profile);
        let profile = config.profile(&name).cloned().unwrap_or_default();
        tracing::debug!("Using CLI profile {name}");

        Ok(Self {
            db_path: resolve_db_path(db_path),
            remote: profile.remote_config(|key| env::var(key).ok()),
            sync: profile.sync_config()?,
        })
    }

    pub fn open_store(&self) -> Result<Arc<SqliteLocalStore>, CliError> {
        open_store(&self.db_path)
    }
}

#[derive(Debug, Serialize)]
pub struct ActionItem {
    pub id: String,
    pub action_type: String,
    pub target: Option<String>,
    pub status: String,
    pub retries: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub created_at_iso: String,
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct RecordItem {
    pub id: String,
    pub pending: bool,
    pub cached_at: i64,
    pub data: Value,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("SETTLE_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("settle")
        .join("settle.db")
}

pub fn open_store(path: &Path) -> Result<Arc<SqliteLocalStore>, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(SqliteLocalStore::open(path)?))
}

pub fn parse_action_id(raw: &str) -> Result<ActionId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidActionId(raw.to_string()))
}

pub fn action_to_item(action: &PendingAction) -> ActionItem {
    ActionItem {
        id: action.id.to_string(),
        action_type: action.action_type.to_string(),
        target: action.target_id(),
        status: action.status.as_str().to_string(),
        retries: action.retries,
        last_error: action.last_error.clone(),
        created_at: action.created_at,
        created_at_iso: format_timestamp(action.created_at),
        payload: action.payload.clone(),
    }
}

pub fn record_to_item(record: &CachedRecord) -> RecordItem {
    RecordItem {
        id: record.id.clone(),
        pending: record.pending,
        cached_at: record.cached_at,
        data: record.data.clone(),
    }
}

pub fn format_action_lines(actions: &[PendingAction], now_ms: i64) -> Vec<String> {
    actions
        .iter()
        .map(|action| {
            let kind = action.action_type.to_string();
            let target = action.target_id().unwrap_or_else(|| "-".to_string());
            let mut line = format!(
                "{}  {kind:<16} {target:<38} retries={} {}",
                action.id,
                action.retries,
                format_relative_time(action.created_at, now_ms),
            );
            if let Some(error) = &action.last_error {
                line.push_str("  last error: ");
                line.push_str(error);
            }
            line
        })
        .collect()
}

pub fn format_record_lines(records: &[CachedRecord], now_ms: i64) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let marker = if record.pending { "*" } else { " " };
            format!(
                "{marker} {}  {:<48}  {}",
                record.id,
                record_preview(&record.data),
                format_relative_time(record.cached_at, now_ms)
            )
        })
        .collect()
}

/// Short human label for a cached record.
pub fn record_preview(data: &Value) -> String {
    let label = ["description", "name", "display_name"]
        .iter()
        .find_map(|field| data.get(*field).and_then(Value::as_str))
        .unwrap_or("");
    let mut preview = label.chars().take(PREVIEW_CHARS).collect::<String>();
    if label.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    if let Some(amount) = data.get("amount").and_then(Value::as_f64) {
        let currency = data.get("currency").and_then(Value::as_str).unwrap_or("");
        preview = format!("{preview} ({amount:.2} {currency})").trim().to_string();
    }
    preview
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
