//! Detection and resolution of divergence between queued edits and the remote.
//!
//! Detection is three-way when the action carries a `base` snapshot: a field
//! only conflicts if the remote value moved away from the base as well as
//! differing from the local value. Without a base, any difference counts.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::clock::{duration_ms, Clock};
use crate::config::SyncConfig;
use crate::db::{retire_pushed_action, LocalStore, Retirement};
use crate::error::{Error, Result};
use crate::models::{
    ActionOp, CacheWrite, ConflictResolution, DataConflict, FieldKind, PendingAction,
    ResolutionType,
};
use crate::remote::RemoteService;
use crate::util::{is_temp_id, shallow_merge, values_equal};

/// Pick the automatic resolution for a conflict; `Manual` when no rule applies.
///
/// Rules, first match wins:
/// 1. the local edit is younger than the recency window: keep local
/// 2. the only conflicting field is an amount: keep local
/// 3. the only conflicting field is free text: merge both texts
pub fn auto_resolution(
    conflict: &DataConflict,
    config: &SyncConfig,
    now_ms: i64,
) -> ConflictResolution {
    let age_ms = now_ms.saturating_sub(conflict.created_at);
    if age_ms < duration_ms(config.recency_window) {
        return ConflictResolution::new(conflict, ResolutionType::UseLocal);
    }

    if let [field] = conflict.field_conflicts.as_slice() {
        match conflict.entity_type.field_kind(field) {
            FieldKind::Amount => {
                return ConflictResolution::new(conflict, ResolutionType::UseLocal);
            }
            FieldKind::Text => {
                let merged = merge_text_field(conflict, field, &config.merge_separator);
                return ConflictResolution::new(conflict, ResolutionType::Merge)
                    .with_merged_data(merged);
            }
            FieldKind::Other => {}
        }
    }

    ConflictResolution::new(conflict, ResolutionType::Manual)
}

/// Local patch with `field` replaced by `"<local><separator><remote>"`.
fn merge_text_field(conflict: &DataConflict, field: &str, separator: &str) -> Value {
    let parts = [&conflict.local_data, &conflict.server_data]
        .into_iter()
        .filter_map(|data| data.get(field).and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>();

    let mut merged = conflict.local_data.clone();
    if let Some(object) = merged.as_object_mut() {
        object.insert(field.to_string(), Value::String(parts.join(separator)));
    }
    merged
}

fn strip_id(mut patch: Value) -> Value {
    if let Some(object) = patch.as_object_mut() {
        object.remove("id");
    }
    patch
}

/// Detects conflicts for queued actions and applies resolutions.
#[derive(Clone)]
pub struct ConflictResolver {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            config,
        }
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Compare an action's payload with the current remote record.
    ///
    /// Returns `None` for deletes, for creates whose record does not exist
    /// remotely yet, when the remote record is gone, or when no compared field
    /// differs.
    pub async fn detect(&self, action: &PendingAction) -> Result<Option<DataConflict>> {
        if action.action_type.op() == ActionOp::Delete {
            return Ok(None);
        }
        let Some(entity_id) = action.target_id() else {
            return Ok(None);
        };
        if is_temp_id(&entity_id) {
            return Ok(None);
        }

        let kind = action.action_type.kind();
        let Some(server_data) = self.remote.get_one(kind, &entity_id).await? else {
            return Ok(None);
        };

        let local_data = action.payload_fields();
        let field_conflicts = kind
            .compared_fields()
            .iter()
            .map(|(field, _)| *field)
            .filter(|field| local_data.get(*field).is_some())
            .filter(|field| {
                let local = local_data.get(*field);
                let remote = server_data.get(*field);
                if values_equal(local, remote) {
                    return false;
                }
                // Fields missing from the base were not known when it was taken
                match action.base.as_ref().and_then(|base| base.get(*field)) {
                    Some(base) => !values_equal(remote, Some(base)),
                    None => true,
                }
            })
            .map(str::to_string)
            .collect::<Vec<_>>();

        if field_conflicts.is_empty() {
            return Ok(None);
        }

        tracing::debug!(
            "Conflict on {kind} {entity_id}: {}",
            field_conflicts.join(", ")
        );
        Ok(Some(DataConflict {
            id: action.id.to_string(),
            action_id: action.id,
            action_revision: action.revision,
            entity_type: kind,
            entity_id,
            local_data,
            server_data,
            base_data: action.base.clone(),
            field_conflicts,
            created_at: action.created_at,
            resolved: false,
        }))
    }

    /// Detect conflicts for every queued create or update.
    ///
    /// Actions whose remote record cannot be fetched are skipped; the next
    /// push attempt surfaces the failure.
    pub async fn detect_all(&self) -> Result<Vec<DataConflict>> {
        let mut conflicts = Vec::new();
        for action in self.store.get_pending_actions().await? {
            match self.detect(&action).await {
                Ok(Some(conflict)) => conflicts.push(conflict),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!("Skipping conflict check for action {}: {error}", action.id);
                }
            }
        }
        Ok(conflicts)
    }

    /// Apply a resolution, retire the originating action and refresh the cache.
    ///
    /// Returns the record as it now stands remotely. If the remote write
    /// fails the action stays queued; if the action was edited after
    /// detection, the newer edits stay queued as an update.
    pub async fn resolve(
        &self,
        conflict: &DataConflict,
        resolution: &ConflictResolution,
    ) -> Result<Value> {
        if resolution.conflict_id != conflict.id {
            return Err(Error::InvalidInput(format!(
                "resolution for {} does not match conflict {}",
                resolution.conflict_id, conflict.id
            )));
        }

        let kind = conflict.entity_type;
        let patch = match resolution.resolution_type {
            ResolutionType::UseServer => None,
            ResolutionType::UseLocal => Some(conflict.local_data.clone()),
            ResolutionType::Merge => Some(
                resolution
                    .merged_data
                    .clone()
                    .unwrap_or_else(|| conflict.local_data.clone()),
            ),
            ResolutionType::Manual => Some(resolution.merged_data.clone().ok_or_else(|| {
                Error::InvalidInput("manual resolution requires merged_data".to_string())
            })?),
        };

        let record = match patch {
            Some(patch) => {
                self.remote
                    .update(kind, &conflict.entity_id, strip_id(patch))
                    .await?
            }
            None => conflict.server_data.clone(),
        };

        let retirement = retire_pushed_action(
            self.store.as_ref(),
            &conflict.action_id,
            conflict.action_revision,
            &conflict.local_data,
            &record,
            vec![CacheWrite::confirmed(kind, record.clone())],
        )
        .await?;
        if retirement == Retirement::Missing {
            tracing::debug!("Action {} was already retired", conflict.action_id);
        }

        tracing::info!(
            "Resolved conflict on {kind} {} with {}",
            conflict.entity_id,
            resolution.resolution_type.as_str()
        );
        Ok(record)
    }

    /// Apply the automatic policy to one conflict.
    ///
    /// Returns the conflict back, marked unresolved, when it needs a person.
    pub async fn auto_resolve(&self, conflict: DataConflict) -> Result<Option<DataConflict>> {
        let resolution = auto_resolution(&conflict, &self.config, self.clock.now_ms());
        if !resolution.is_automatic() {
            return Ok(Some(conflict));
        }
        self.resolve(&conflict, &resolution).await?;
        Ok(None)
    }

    /// Detect and auto-resolve everything the policy allows.
    ///
    /// Returns the conflicts left for manual resolution.
    pub async fn auto_resolve_all(&self) -> Result<Vec<DataConflict>> {
        let mut unresolved = Vec::new();
        for conflict in self.detect_all().await? {
            let id = conflict.id.clone();
            match self.auto_resolve(conflict.clone()).await {
                Ok(Some(conflict)) => unresolved.push(conflict),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!("Automatic resolution of {id} failed: {error}");
                    unresolved.push(conflict);
                }
            }
        }
        Ok(unresolved)
    }
}

/// Build the base snapshot stored with an offline update: the cached values
/// of the fields the update touches.
pub fn base_snapshot(cached: &Value, patch: &Value) -> Value {
    let mut base = Map::new();
    if let Some(fields) = patch.as_object() {
        for field in fields.keys().filter(|field| field.as_str() != "id") {
            base.insert(
                field.clone(),
                cached.get(field).cloned().unwrap_or(Value::Null),
            );
        }
    }
    Value::Object(base)
}

/// Local view of a record after a resolution, for callers that render it
/// before the next pull.
pub fn preview(conflict: &DataConflict, resolution: &ConflictResolution) -> Value {
    match resolution.resolution_type {
        ResolutionType::UseServer => conflict.server_data.clone(),
        ResolutionType::UseLocal => shallow_merge(&conflict.server_data, &conflict.local_data),
        ResolutionType::Merge | ResolutionType::Manual => shallow_merge(
            &conflict.server_data,
            resolution
                .merged_data
                .as_ref()
                .unwrap_or(&conflict.local_data),
        ),
    }
}
