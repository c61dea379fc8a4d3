//! The authoritative remote data service.
//!
//! The sync engine, the conflict resolver and the mutation facade only see
//! `RemoteService`; `RestRemote` talks to a PostgREST-style backend and
//! `MemoryRemote` keeps everything in process.

mod memory;
mod rest;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::EntityKind;

pub use memory::MemoryRemote;
pub use rest::RestRemote;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure or timeout
    #[error("network error: {0}")]
    Network(String),
    /// The service answered with a non-success status
    #[error("{message} ({status})")]
    Rejected { status: u16, message: String },
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Transport errors and 5xx answers may succeed on a later attempt.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::NotFound(_) | Self::InvalidResponse(_) => false,
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Bounded query against one collection
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteQuery {
    /// Equality filters by field
    pub filter: BTreeMap<String, Value>,
    pub limit: Option<usize>,
    pub order_by: Option<String>,
    pub descending: bool,
}

impl RemoteQuery {
    pub fn new() -> Self {
        Self {
            filter: BTreeMap::new(),
            limit: None,
            order_by: None,
            descending: false,
        }
    }

    /// Most recently updated records first.
    pub fn recent(limit: usize) -> Self {
        Self::new().with_limit(limit).order_by("updated_at", true)
    }

    #[must_use]
    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(field.into());
        self.descending = descending;
        self
    }
}

impl Default for RemoteQuery {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-collection CRUD on JSON records
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Insert a record and return it with its server-assigned id.
    async fn insert(&self, kind: EntityKind, record: Value) -> RemoteResult<Value>;

    /// Apply a partial update and return the full record.
    async fn update(&self, kind: EntityKind, id: &str, patch: Value) -> RemoteResult<Value>;

    async fn delete(&self, kind: EntityKind, id: &str) -> RemoteResult<()>;

    /// Fetch one record; `Ok(None)` when it does not exist.
    async fn get_one(&self, kind: EntityKind, id: &str) -> RemoteResult<Option<Value>>;

    async fn query(&self, kind: EntityKind, query: &RemoteQuery) -> RemoteResult<Vec<Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transient_classification() {
        assert!(RemoteError::Network("timeout".into()).is_transient());
        assert!(RemoteError::Rejected {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!RemoteError::Rejected {
            status: 422,
            message: "amount must be positive".into()
        }
        .is_transient());
        assert!(!RemoteError::NotFound("e1".into()).is_transient());
    }

    #[test]
    fn recent_query_orders_by_update_time() {
        let query = RemoteQuery::recent(50).with_filter("group_id", json!("g1"));
        assert_eq!(query.limit, Some(50));
        assert_eq!(query.order_by.as_deref(), Some("updated_at"));
        assert!(query.descending);
        assert_eq!(query.filter.get("group_id"), Some(&json!("g1")));
    }
}
