//! Conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::EntityKind;
use super::pending_action::ActionId;

/// Divergence between a queued local mutation and the current remote record.
///
/// Recomputed on every detection pass and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConflict {
    /// Same as the originating action id
    pub id: String,
    pub action_id: ActionId,
    /// Revision of the action when the conflict was detected
    #[serde(default)]
    pub action_revision: u32,
    pub entity_type: EntityKind,
    pub entity_id: String,
    /// Fields the local mutation sets
    pub local_data: Value,
    /// Current remote record
    pub server_data: Value,
    /// Cached values of the local fields before the edit, when known
    #[serde(default)]
    pub base_data: Option<Value>,
    pub field_conflicts: Vec<String>,
    /// Unix ms when the local mutation was made
    pub created_at: i64,
    #[serde(default)]
    pub resolved: bool,
}

/// How a conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    UseLocal,
    UseServer,
    Merge,
    /// No automatic rule applies; a person must decide
    Manual,
}

impl ResolutionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UseLocal => "use_local",
            Self::UseServer => "use_server",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

/// Command that settles a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: String,
    pub resolution_type: ResolutionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_data: Option<Value>,
}

impl ConflictResolution {
    pub fn new(conflict: &DataConflict, resolution_type: ResolutionType) -> Self {
        Self {
            conflict_id: conflict.id.clone(),
            resolution_type,
            merged_data: None,
        }
    }

    #[must_use]
    pub fn with_merged_data(mut self, merged_data: Value) -> Self {
        self.merged_data = Some(merged_data);
        self
    }

    /// Whether this resolution can be applied without a person.
    pub const fn is_automatic(&self) -> bool {
        !matches!(self.resolution_type, ResolutionType::Manual)
    }
}
