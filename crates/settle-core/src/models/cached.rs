//! Cache-layer record shapes

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::{Entity, EntityKind};
use crate::error::{Error, Result};
use crate::util::record_id;

/// Untyped cached row as persisted in a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub id: String,
    pub data: Value,
    /// Unix ms of the last refresh
    pub cached_at: i64,
    /// Optimistic record that still has a queued action
    pub pending: bool,
}

/// A typed cached entity, serialized with its fields flattened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity<T> {
    #[serde(flatten)]
    pub entity: T,
    pub cached_at: i64,
    #[serde(rename = "_pending", default)]
    pub pending: bool,
}

impl<T: Entity> CachedEntity<T> {
    pub fn from_record(record: CachedRecord) -> Result<Self> {
        Ok(Self {
            entity: serde_json::from_value(record.data)?,
            cached_at: record.cached_at,
            pending: record.pending,
        })
    }
}

/// Optional filter for cache reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheFilter {
    /// Records whose foreign key (e.g. an expense's `group_id`) matches
    Parent(String),
}

impl CacheFilter {
    pub fn parent(id: impl Into<String>) -> Self {
        Self::Parent(id.into())
    }
}

/// A cache mutation applied atomically with an outbox change
#[derive(Debug, Clone, PartialEq)]
pub enum CacheWrite {
    /// Insert or replace a record; `record` must carry its `id`
    Upsert {
        kind: EntityKind,
        record: Value,
        pending: bool,
    },
    /// Insert the optimistic record of a queued create under `temp_<actionId>`
    UpsertTemp { kind: EntityKind, record: Value },
    Remove { kind: EntityKind, id: String },
}

impl CacheWrite {
    /// Replace the cached copy with a confirmed server record.
    pub fn confirmed(kind: EntityKind, record: Value) -> Self {
        Self::Upsert {
            kind,
            record,
            pending: false,
        }
    }

    pub fn optimistic(kind: EntityKind, record: Value) -> Self {
        Self::Upsert {
            kind,
            record,
            pending: true,
        }
    }

    pub fn remove(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::Remove {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn upsert_id(record: &Value) -> Result<String> {
        record_id(record)
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidInput("cached record is missing an id".into()))
    }
}
