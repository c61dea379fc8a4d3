//! Outbox entries: mutations not yet confirmed by the remote service

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::entity::EntityKind;
use crate::conflict::base_snapshot;
use crate::util::{record_id, temp_id_for, values_equal};

/// Locally generated action identifier, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(Uuid);

impl ActionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }

    /// Placeholder id of the record this action creates.
    #[must_use]
    pub fn temp_id(&self) -> String {
        temp_id_for(&self.as_str())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ActionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What a queued action does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    CreateExpense,
    UpdateExpense,
    DeleteExpense,
    CreateGroup,
}

/// The remote operation an action maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOp {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub const fn kind(self) -> EntityKind {
        match self {
            Self::CreateExpense | Self::UpdateExpense | Self::DeleteExpense => {
                EntityKind::Expenses
            }
            Self::CreateGroup => EntityKind::Groups,
        }
    }

    pub const fn op(self) -> ActionOp {
        match self {
            Self::CreateExpense | Self::CreateGroup => ActionOp::Create,
            Self::UpdateExpense => ActionOp::Update,
            Self::DeleteExpense => ActionOp::Delete,
        }
    }

    /// The action that edits an existing record of `kind`, where one exists.
    pub const fn update_for(kind: EntityKind) -> Option<Self> {
        match kind {
            EntityKind::Expenses => Some(Self::UpdateExpense),
            EntityKind::Groups | EntityKind::Users => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateExpense => "CREATE_EXPENSE",
            Self::UpdateExpense => "UPDATE_EXPENSE",
            Self::DeleteExpense => "DELETE_EXPENSE",
            Self::CreateGroup => "CREATE_GROUP",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE_EXPENSE" => Ok(Self::CreateExpense),
            "UPDATE_EXPENSE" => Ok(Self::UpdateExpense),
            "DELETE_EXPENSE" => Ok(Self::DeleteExpense),
            "CREATE_GROUP" => Ok(Self::CreateGroup),
            other => Err(format!("unknown action type: {other}")),
        }
    }
}

/// Outbox status; failed actions are kept for inspection instead of dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Failed,
}

impl ActionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// A queued mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Insert body for creates; `{id, ..changed fields}` for updates; `{id}` for deletes
    pub payload: Value,
    /// Unix ms
    pub created_at: i64,
    pub retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub status: ActionStatus,
    /// Cached values of the updated fields when the edit was made
    #[serde(default)]
    pub base: Option<Value>,
    /// Bumped by every amend
    #[serde(default)]
    pub revision: u32,
}

impl PendingAction {
    /// Id of the remote record this action targets.
    ///
    /// Creates target the placeholder record; updates and deletes carry the
    /// server id in their payload.
    pub fn target_id(&self) -> Option<String> {
        match self.action_type.op() {
            ActionOp::Create => Some(self.id.temp_id()),
            ActionOp::Update | ActionOp::Delete => record_id(&self.payload).map(str::to_string),
        }
    }

    /// Fields sent to the remote, without the routing id.
    pub fn payload_fields(&self) -> Value {
        let mut fields = self.payload.clone();
        if let Some(object) = fields.as_object_mut() {
            object.remove("id");
        }
        fields
    }

    pub fn is_failed(&self) -> bool {
        self.status == ActionStatus::Failed
    }

    /// An update of the confirmed `record` carrying the fields that differ
    /// from what was `pushed`; `None` when nothing differs or the kind has no
    /// update action.
    pub fn rebased_onto(&self, pushed: &Value, record: &Value) -> Option<NewPendingAction> {
        let action_type = ActionType::update_for(self.action_type.kind())?;
        let id = record_id(record)?;
        let fields = self.payload_fields();
        let patch = fields
            .as_object()?
            .iter()
            .filter(|(field, value)| !values_equal(pushed.get(field.as_str()), Some(*value)))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect::<Map<_, _>>();
        if patch.is_empty() {
            return None;
        }

        let base = base_snapshot(record, &Value::Object(patch.clone()));
        let mut payload = patch;
        payload.insert("id".to_string(), Value::String(id.to_string()));
        Some(NewPendingAction::new(action_type, Value::Object(payload)).with_base(base))
    }
}

/// Input for `LocalStore::add_pending_action`
#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingAction {
    pub action_type: ActionType,
    pub payload: Value,
    pub base: Option<Value>,
}

impl NewPendingAction {
    pub const fn new(action_type: ActionType, payload: Value) -> Self {
        Self {
            action_type,
            payload,
            base: None,
        }
    }

    #[must_use]
    pub fn with_base(mut self, base: Value) -> Self {
        self.base = Some(base);
        self
    }
}
