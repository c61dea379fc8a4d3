//! In-process remote service with failure injection

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::{RemoteError, RemoteQuery, RemoteResult, RemoteService};
use crate::models::EntityKind;
use crate::util::{record_id, shallow_merge, values_equal};

#[derive(Default)]
struct MemoryState {
    collections: HashMap<EntityKind, BTreeMap<String, Value>>,
    fail_all: Option<RemoteError>,
    fail_records: HashMap<(EntityKind, String), RemoteError>,
    write_attempts: usize,
}

/// Authoritative store kept in memory.
///
/// Inserts get a fresh UUID and writes stamp `updated_at`, the way the hosted
/// backend does.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a record as-is, bypassing failure injection.
    pub fn seed(&self, kind: EntityKind, record: Value) {
        if let Some(id) = record_id(&record).map(str::to_string) {
            self.state()
                .collections
                .entry(kind)
                .or_default()
                .insert(id, record);
        }
    }

    /// Change fields of a stored record as another client would.
    pub fn edit(&self, kind: EntityKind, id: &str, patch: &Value) -> bool {
        let mut state = self.state();
        let Some(record) = state
            .collections
            .get_mut(&kind)
            .and_then(|records| records.get_mut(id))
        else {
            return false;
        };
        *record = shallow_merge(record, patch);
        true
    }

    pub fn record(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.state()
            .collections
            .get(&kind)
            .and_then(|records| records.get(id))
            .cloned()
    }

    pub fn records(&self, kind: EntityKind) -> Vec<Value> {
        self.state()
            .collections
            .get(&kind)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail every call with `error` until cleared.
    pub fn fail_all(&self, error: RemoteError) {
        self.state().fail_all = Some(error);
    }

    /// Fail every call that addresses this record id.
    pub fn fail_record(&self, kind: EntityKind, id: impl Into<String>, error: RemoteError) {
        self.state().fail_records.insert((kind, id.into()), error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_all = None;
        state.fail_records.clear();
    }

    /// Insert, update and delete calls received so far, failed ones included.
    pub fn write_attempts(&self) -> usize {
        self.state().write_attempts
    }

    fn check(state: &MemoryState, kind: EntityKind, id: Option<&str>) -> RemoteResult<()> {
        if let Some(error) = &state.fail_all {
            return Err(error.clone());
        }
        if let Some(error) = id.and_then(|id| state.fail_records.get(&(kind, id.to_string()))) {
            return Err(error.clone());
        }
        Ok(())
    }
}

fn now_stamp() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

fn compare_field(left: &Value, right: &Value, field: &str) -> Ordering {
    match (left.get(field), right.get(field)) {
        (Some(Value::Number(left)), Some(Value::Number(right))) => left
            .as_f64()
            .partial_cmp(&right.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(left)), Some(Value::String(right))) => left.cmp(right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl RemoteService for MemoryRemote {
    async fn insert(&self, kind: EntityKind, record: Value) -> RemoteResult<Value> {
        let mut state = self.state();
        state.write_attempts += 1;
        Self::check(&state, kind, None)?;

        let Value::Object(mut fields) = record else {
            return Err(RemoteError::Rejected {
                status: 400,
                message: "record must be a JSON object".to_string(),
            });
        };
        let id = Uuid::now_v7().to_string();
        fields.insert("id".to_string(), Value::String(id.clone()));
        fields.insert("created_at".to_string(), now_stamp());
        fields.insert("updated_at".to_string(), now_stamp());
        let record = Value::Object(fields);

        state
            .collections
            .entry(kind)
            .or_default()
            .insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, kind: EntityKind, id: &str, patch: Value) -> RemoteResult<Value> {
        let mut state = self.state();
        state.write_attempts += 1;
        Self::check(&state, kind, Some(id))?;

        let record = state
            .collections
            .get_mut(&kind)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        let mut merged = shallow_merge(record, &patch);
        if let Some(fields) = merged.as_object_mut() {
            fields.insert("id".to_string(), Value::String(id.to_string()));
            fields.insert("updated_at".to_string(), now_stamp());
        }
        *record = merged.clone();
        Ok(merged)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> RemoteResult<()> {
        let mut state = self.state();
        state.write_attempts += 1;
        Self::check(&state, kind, Some(id))?;

        state
            .collections
            .get_mut(&kind)
            .and_then(|records| records.remove(id))
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn get_one(&self, kind: EntityKind, id: &str) -> RemoteResult<Option<Value>> {
        let state = self.state();
        Self::check(&state, kind, Some(id))?;
        Ok(state
            .collections
            .get(&kind)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn query(&self, kind: EntityKind, query: &RemoteQuery) -> RemoteResult<Vec<Value>> {
        let state = self.state();
        Self::check(&state, kind, None)?;

        let mut records = state
            .collections
            .get(&kind)
            .map(|records| {
                records
                    .values()
                    .filter(|record| {
                        query
                            .filter
                            .iter()
                            .all(|(field, value)| values_equal(record.get(field), Some(value)))
                    })
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if let Some(field) = &query.order_by {
            records.sort_by(|left, right| {
                let ordering = compare_field(left, right, field);
                if query.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}
