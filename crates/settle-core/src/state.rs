//! Shared sync state types observed by UI layers.

use serde::Serialize;

/// Phase of the sync engine's cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Pulling,
    Pushing,
    /// The last cycle completed but recorded at least one error.
    Error,
}

/// Snapshot of the sync engine published after every phase change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub is_loading: bool,
    /// Unix ms of the last fully successful pull
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,
    pub pending_count: usize,
    pub failed_count: usize,
}

impl SyncStatus {
    pub const fn has_error(&self) -> bool {
        matches!(self.phase, SyncPhase::Error)
    }
}
