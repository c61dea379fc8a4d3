//! Persistent local store: cached collections, outbox and metadata

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::connection::Database;
use crate::clock::{duration_ms, Clock, SystemClock};
use crate::error::{Error, Result};
use crate::models::{
    ActionId, ActionOp, ActionStatus, ActionType, CacheFilter, CacheWrite, CachedEntity,
    CachedRecord, Entity, EntityKind, NewPendingAction, PendingAction,
};
use crate::util::{shallow_merge, temp_id_for};

/// Metadata key holding the Unix ms of the last successful pull
pub const LAST_SYNC_KEY: &str = "last_sync";

/// A metadata value with its write time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
    pub updated_at: i64,
}

/// Records evicted by a TTL sweep, per collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheSweep {
    pub evicted: BTreeMap<EntityKind, usize>,
}

impl CacheSweep {
    pub fn total(&self) -> usize {
        self.evicted.values().sum()
    }
}

/// What happened to an action once its push was confirmed
#[derive(Debug, Clone, PartialEq)]
pub enum Retirement {
    /// Removed from the outbox; the confirmed cache writes were applied
    Retired,
    /// Edited since the pushed revision; left queued and nothing was written
    Amended(PendingAction),
    /// Turned into an update carrying the edits the push did not include
    Rebased(PendingAction),
    /// Already gone from the outbox
    Missing,
}

/// Durable on-device storage shared by the sync engine, the conflict resolver
/// and the mutation facade.
///
/// Every call is atomic: multi-row writes run in a single transaction.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Upsert records by id, stamping `cached_at = now` and clearing `_pending`.
    async fn cache_records(&self, kind: EntityKind, records: Vec<Value>) -> Result<usize>;

    /// All cached records of a collection, newest refresh first.
    async fn get_cached_records(
        &self,
        kind: EntityKind,
        filter: Option<&CacheFilter>,
    ) -> Result<Vec<CachedRecord>>;

    async fn get_cached_record(&self, kind: EntityKind, id: &str) -> Result<Option<CachedRecord>>;

    async fn apply_cache_writes(&self, writes: Vec<CacheWrite>) -> Result<()>;

    /// Queue a mutation together with its optimistic cache writes.
    async fn add_pending_action(
        &self,
        action: NewPendingAction,
        writes: Vec<CacheWrite>,
    ) -> Result<PendingAction>;

    /// Queued actions in creation order; failed actions are excluded.
    async fn get_pending_actions(&self) -> Result<Vec<PendingAction>>;

    async fn get_failed_actions(&self) -> Result<Vec<PendingAction>>;

    async fn get_pending_action(&self, id: &ActionId) -> Result<Option<PendingAction>>;

    /// Replace the payload of a queued or failed action and bump its revision.
    ///
    /// A failed action goes back into the queue with a fresh retry budget.
    async fn amend_pending_action(
        &self,
        id: &ActionId,
        payload: Value,
        writes: Vec<CacheWrite>,
    ) -> Result<PendingAction>;

    /// Count a failed push; parks the action as failed once `retries` reaches
    /// `retry_ceiling`.
    async fn record_action_failure(
        &self,
        id: &ActionId,
        error: &str,
        retry_ceiling: u32,
    ) -> Result<PendingAction>;

    /// Retire an action and apply cache writes in one transaction, provided it
    /// is still at `revision`.
    ///
    /// Writes nothing when the action was amended since or no longer exists.
    async fn complete_pending_action(
        &self,
        id: &ActionId,
        revision: u32,
        writes: Vec<CacheWrite>,
    ) -> Result<Retirement>;

    /// Replace type, payload and base of an action still at `revision`.
    ///
    /// Returns `None` (and writes nothing) when the revision moved on.
    async fn rebase_pending_action(
        &self,
        id: &ActionId,
        revision: u32,
        action: NewPendingAction,
        writes: Vec<CacheWrite>,
    ) -> Result<Option<PendingAction>>;

    /// Remove an action (pending or failed) and its placeholder record.
    async fn remove_pending_action(&self, id: &ActionId) -> Result<bool>;

    /// Move a failed action back into the queue with a fresh retry budget.
    async fn retry_failed_action(&self, id: &ActionId) -> Result<PendingAction>;

    async fn set_metadata(&self, key: &str, value: &str) -> Result<()>;

    async fn get_metadata(&self, key: &str) -> Result<Option<MetadataEntry>>;

    /// Evict non-pending records whose age exceeds `max_age`.
    async fn clean_old_cache(&self, max_age: Duration) -> Result<CacheSweep>;

    /// Delete placeholder records whose action no longer exists.
    async fn prune_orphaned_temp_records(&self) -> Result<usize>;
}

/// Cache typed entities.
pub async fn cache_entities<T: Entity>(store: &dyn LocalStore, entities: &[T]) -> Result<usize> {
    let records = entities
        .iter()
        .map(serde_json::to_value)
        .collect::<serde_json::Result<Vec<_>>>()?;
    store.cache_records(T::KIND, records).await
}

/// Retire an action whose push the remote confirmed with `record`.
///
/// `pushed` holds the fields the remote received. If the action was amended
/// while the push was in flight, it is rebased into an update of `record`
/// carrying only the fields that differ from `pushed`.
pub async fn retire_pushed_action(
    store: &dyn LocalStore,
    id: &ActionId,
    revision: u32,
    pushed: &Value,
    record: &Value,
    writes: Vec<CacheWrite>,
) -> Result<Retirement> {
    let mut outcome = store
        .complete_pending_action(id, revision, writes.clone())
        .await?;
    loop {
        let current = match outcome {
            Retirement::Amended(current) => current,
            other => return Ok(other),
        };
        let Some(rebased) = current.rebased_onto(pushed, record) else {
            tracing::debug!("Amendment of {id} is already covered by the push");
            outcome = store
                .complete_pending_action(id, current.revision, writes.clone())
                .await?;
            continue;
        };

        let kind = current.action_type.kind();
        let mut rebase_writes = Vec::new();
        if current.action_type.op() == ActionOp::Create {
            rebase_writes.push(CacheWrite::remove(kind, current.id.temp_id()));
        }
        rebase_writes.push(CacheWrite::optimistic(
            kind,
            shallow_merge(record, &rebased.payload),
        ));
        outcome = match store
            .rebase_pending_action(id, current.revision, rebased, rebase_writes)
            .await?
        {
            Some(action) => {
                tracing::info!("Kept edits made to {id} during its push as {}", action.action_type);
                Retirement::Rebased(action)
            }
            None => store
                .get_pending_action(id)
                .await?
                .map_or(Retirement::Missing, Retirement::Amended),
        };
    }
}

/// Read typed entities; rows that no longer match the model are skipped.
pub async fn get_cached<T: Entity>(
    store: &dyn LocalStore,
    filter: Option<&CacheFilter>,
) -> Result<Vec<CachedEntity<T>>> {
    let records = store.get_cached_records(T::KIND, filter).await?;
    Ok(records
        .into_iter()
        .filter_map(|record| {
            let id = record.id.clone();
            match CachedEntity::from_record(record) {
                Ok(entity) => Some(entity),
                Err(error) => {
                    tracing::warn!("Skipping malformed cached {} {id}: {error}", T::KIND);
                    None
                }
            }
        })
        .collect())
}

/// Read one typed entity.
pub async fn get_cached_entity<T: Entity>(
    store: &dyn LocalStore,
    id: &str,
) -> Result<Option<CachedEntity<T>>> {
    store
        .get_cached_record(T::KIND, id)
        .await?
        .map(CachedEntity::from_record)
        .transpose()
}

/// `SQLite` implementation of `LocalStore`
#[derive(Clone)]
pub struct SqliteLocalStore {
    db: Arc<Mutex<Database>>,
    clock: Arc<dyn Clock>,
}

impl SqliteLocalStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_database(Database::open(path)?))
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for `cached_at`, `created_at` and TTL sweeps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }
}

const ACTION_COLUMNS: &str =
    "id, action_type, payload, created_at, retries, last_error, status, base, revision";

fn conversion_error(
    index: usize,
    error: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, error.into())
}

fn json_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|error| conversion_error(index, error))
}

fn parse_action(row: &Row<'_>) -> rusqlite::Result<PendingAction> {
    let id: String = row.get(0)?;
    let action_type: String = row.get(1)?;
    let status: String = row.get(6)?;
    let base: Option<String> = row.get(7)?;

    Ok(PendingAction {
        id: id.parse().map_err(|error| conversion_error(0, error))?,
        action_type: action_type
            .parse::<ActionType>()
            .map_err(|error| conversion_error(1, error))?,
        payload: json_column(row, 2)?,
        created_at: row.get(3)?,
        retries: row.get(4)?,
        last_error: row.get(5)?,
        status: status
            .parse::<ActionStatus>()
            .map_err(|error| conversion_error(6, error))?,
        base: base
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|error| conversion_error(7, error))?,
        revision: row.get(8)?,
    })
}

fn parse_cached(row: &Row<'_>) -> rusqlite::Result<CachedRecord> {
    Ok(CachedRecord {
        id: row.get(0)?,
        data: json_column(row, 1)?,
        cached_at: row.get(2)?,
        pending: row.get(3)?,
    })
}

fn parent_of(kind: EntityKind, record: &Value) -> Option<String> {
    kind.parent_field()
        .and_then(|field| record.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn upsert_record(
    conn: &Connection,
    kind: EntityKind,
    record: &Value,
    pending: bool,
    now: i64,
) -> Result<String> {
    let id = CacheWrite::upsert_id(record)?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (id, parent_id, data, cached_at, pending)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            kind.collection()
        ),
        params![
            id,
            parent_of(kind, record),
            serde_json::to_string(record)?,
            now,
            pending
        ],
    )?;
    Ok(id)
}

fn apply_writes(
    conn: &Connection,
    writes: &[CacheWrite],
    action_id: Option<&ActionId>,
    now: i64,
) -> Result<()> {
    for write in writes {
        match write {
            CacheWrite::Upsert {
                kind,
                record,
                pending,
            } => {
                upsert_record(conn, *kind, record, *pending, now)?;
            }
            CacheWrite::UpsertTemp { kind, record } => {
                let action_id = action_id.ok_or_else(|| {
                    Error::InvalidInput("temp records can only be written with a new action".into())
                })?;
                let mut record = record.clone();
                let object = record.as_object_mut().ok_or_else(|| {
                    Error::InvalidInput("cached record must be a JSON object".into())
                })?;
                object.insert("id".to_string(), Value::String(action_id.temp_id()));
                upsert_record(conn, *kind, &record, true, now)?;
            }
            CacheWrite::Remove { kind, id } => {
                conn.execute(
                    &format!("DELETE FROM {} WHERE id = ?1", kind.collection()),
                    params![id],
                )?;
            }
        }
    }
    Ok(())
}

fn load_action(conn: &Connection, id: &ActionId) -> Result<Option<PendingAction>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ACTION_COLUMNS} FROM pending_actions WHERE id = ?1"),
            params![id.as_str()],
            parse_action,
        )
        .optional()?)
}

fn list_actions(conn: &Connection, status: ActionStatus) -> Result<Vec<PendingAction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ACTION_COLUMNS} FROM pending_actions
         WHERE status = ?1
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let actions = stmt
        .query_map(params![status.as_str()], parse_action)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(actions)
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn cache_records(&self, kind: EntityKind, records: Vec<Value>) -> Result<usize> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        for record in &records {
            upsert_record(&tx, kind, record, false, now)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    async fn get_cached_records(
        &self,
        kind: EntityKind,
        filter: Option<&CacheFilter>,
    ) -> Result<Vec<CachedRecord>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let table = kind.collection();

        let records = match filter {
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, data, cached_at, pending FROM {table}
                     ORDER BY cached_at DESC, id ASC"
                ))?;
                let rows = stmt
                    .query_map([], parse_cached)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            Some(CacheFilter::Parent(parent_id)) => {
                if kind.parent_field().is_none() {
                    return Err(Error::InvalidInput(format!(
                        "{kind} cannot be filtered by parent"
                    )));
                }
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, data, cached_at, pending FROM {table}
                     WHERE parent_id = ?1
                     ORDER BY cached_at DESC, id ASC"
                ))?;
                let rows = stmt
                    .query_map(params![parent_id], parse_cached)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        Ok(records)
    }

    async fn get_cached_record(&self, kind: EntityKind, id: &str) -> Result<Option<CachedRecord>> {
        let db = self.db.lock().await;
        Ok(db
            .connection()
            .query_row(
                &format!(
                    "SELECT id, data, cached_at, pending FROM {} WHERE id = ?1",
                    kind.collection()
                ),
                params![id],
                parse_cached,
            )
            .optional()?)
    }

    async fn apply_cache_writes(&self, writes: Vec<CacheWrite>) -> Result<()> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        apply_writes(&tx, &writes, None, now)?;
        tx.commit()?;
        Ok(())
    }

    async fn add_pending_action(
        &self,
        action: NewPendingAction,
        writes: Vec<CacheWrite>,
    ) -> Result<PendingAction> {
        let now = self.now();
        let pending = PendingAction {
            id: ActionId::new(),
            action_type: action.action_type,
            payload: action.payload,
            created_at: now,
            retries: 0,
            last_error: None,
            status: ActionStatus::Pending,
            base: action.base,
            revision: 0,
        };

        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        tx.execute(
            "INSERT INTO pending_actions (id, action_type, payload, created_at, retries, last_error, status, base)
             VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5, ?6)",
            params![
                pending.id.as_str(),
                pending.action_type.as_str(),
                serde_json::to_string(&pending.payload)?,
                pending.created_at,
                pending.status.as_str(),
                pending.base.as_ref().map(serde_json::to_string).transpose()?,
            ],
        )?;
        apply_writes(&tx, &writes, Some(&pending.id), now)?;
        tx.commit()?;

        tracing::debug!("Queued {} action {}", pending.action_type, pending.id);
        Ok(pending)
    }

    async fn get_pending_actions(&self) -> Result<Vec<PendingAction>> {
        let db = self.db.lock().await;
        list_actions(db.connection(), ActionStatus::Pending)
    }

    async fn get_failed_actions(&self) -> Result<Vec<PendingAction>> {
        let db = self.db.lock().await;
        list_actions(db.connection(), ActionStatus::Failed)
    }

    async fn get_pending_action(&self, id: &ActionId) -> Result<Option<PendingAction>> {
        let db = self.db.lock().await;
        load_action(db.connection(), id)
    }

    async fn amend_pending_action(
        &self,
        id: &ActionId,
        payload: Value,
        writes: Vec<CacheWrite>,
    ) -> Result<PendingAction> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let rows = tx.execute(
            "UPDATE pending_actions SET payload = ?1, revision = revision + 1, status = 'pending',
                 retries = CASE WHEN status = 'failed' THEN 0 ELSE retries END,
                 last_error = CASE WHEN status = 'failed' THEN NULL ELSE last_error END
             WHERE id = ?2",
            params![serde_json::to_string(&payload)?, id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("pending action {id}")));
        }
        apply_writes(&tx, &writes, Some(id), now)?;
        let action =
            load_action(&tx, id)?.ok_or_else(|| Error::NotFound(format!("pending action {id}")))?;
        tx.commit()?;
        Ok(action)
    }

    async fn record_action_failure(
        &self,
        id: &ActionId,
        error: &str,
        retry_ceiling: u32,
    ) -> Result<PendingAction> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let mut action =
            load_action(&tx, id)?.ok_or_else(|| Error::NotFound(format!("pending action {id}")))?;

        action.retries = action.retries.saturating_add(1);
        action.last_error = Some(error.to_string());
        if action.retries >= retry_ceiling {
            action.status = ActionStatus::Failed;
        }

        tx.execute(
            "UPDATE pending_actions SET retries = ?1, last_error = ?2, status = ?3 WHERE id = ?4",
            params![
                action.retries,
                action.last_error,
                action.status.as_str(),
                id.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(action)
    }

    async fn complete_pending_action(
        &self,
        id: &ActionId,
        revision: u32,
        writes: Vec<CacheWrite>,
    ) -> Result<Retirement> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let rows = tx.execute(
            "DELETE FROM pending_actions WHERE id = ?1 AND revision = ?2",
            params![id.as_str(), revision],
        )?;
        if rows == 0 {
            return Ok(load_action(&tx, id)?.map_or(Retirement::Missing, Retirement::Amended));
        }
        apply_writes(&tx, &writes, Some(id), now)?;
        tx.commit()?;
        Ok(Retirement::Retired)
    }

    async fn rebase_pending_action(
        &self,
        id: &ActionId,
        revision: u32,
        action: NewPendingAction,
        writes: Vec<CacheWrite>,
    ) -> Result<Option<PendingAction>> {
        let now = self.now();
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let rows = tx.execute(
            "UPDATE pending_actions SET action_type = ?1, payload = ?2, base = ?3, revision = revision + 1
             WHERE id = ?4 AND revision = ?5",
            params![
                action.action_type.as_str(),
                serde_json::to_string(&action.payload)?,
                action.base.as_ref().map(serde_json::to_string).transpose()?,
                id.as_str(),
                revision
            ],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        apply_writes(&tx, &writes, Some(id), now)?;
        let rebased = load_action(&tx, id)?;
        tx.commit()?;
        Ok(rebased)
    }

    async fn remove_pending_action(&self, id: &ActionId) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let rows = tx.execute(
            "DELETE FROM pending_actions WHERE id = ?1",
            params![id.as_str()],
        )?;
        let temp_id = temp_id_for(&id.as_str());
        for kind in EntityKind::ALL {
            tx.execute(
                &format!("DELETE FROM {} WHERE id = ?1", kind.collection()),
                params![temp_id],
            )?;
        }
        tx.commit()?;
        Ok(rows > 0)
    }

    async fn retry_failed_action(&self, id: &ActionId) -> Result<PendingAction> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let rows = tx.execute(
            "UPDATE pending_actions SET status = 'pending', retries = 0, last_error = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("failed action {id}")));
        }
        let action =
            load_action(&tx, id)?.ok_or_else(|| Error::NotFound(format!("failed action {id}")))?;
        tx.commit()?;
        Ok(action)
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let now = self.now();
        let db = self.db.lock().await;
        db.connection().execute(
            "INSERT OR REPLACE INTO metadata (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<MetadataEntry>> {
        let db = self.db.lock().await;
        Ok(db
            .connection()
            .query_row(
                "SELECT key, value, updated_at FROM metadata WHERE key = ?1",
                params![key],
                |row| {
                    Ok(MetadataEntry {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    async fn clean_old_cache(&self, max_age: Duration) -> Result<CacheSweep> {
        let cutoff = self.now().saturating_sub(duration_ms(max_age));
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let mut sweep = CacheSweep::default();
        for kind in EntityKind::ALL {
            let evicted = tx.execute(
                &format!(
                    "DELETE FROM {} WHERE pending = 0 AND cached_at < ?1",
                    kind.collection()
                ),
                params![cutoff],
            )?;
            sweep.evicted.insert(kind, evicted);
        }
        tx.commit()?;
        Ok(sweep)
    }

    async fn prune_orphaned_temp_records(&self) -> Result<usize> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let mut pruned = 0;
        for kind in EntityKind::ALL {
            pruned += tx.execute(
                &format!(
                    "DELETE FROM {} WHERE id LIKE 'temp\\_%' ESCAPE '\\'
                     AND substr(id, 6) NOT IN (SELECT id FROM pending_actions)",
                    kind.collection()
                ),
                [],
            )?;
        }
        tx.commit()?;
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::Expense;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn setup() -> (SqliteLocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = SqliteLocalStore::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        (store, clock)
    }

    fn expense(id: &str, group_id: &str) -> Value {
        json!({
            "id": id,
            "group_id": group_id,
            "description": "Lunch",
            "amount": 20,
            "currency": "USD",
            "date": "2024-01-01"
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cache_records_upserts_and_stamps() {
        let (store, clock) = setup();
        store
            .cache_records(EntityKind::Expenses, vec![expense("e1", "g1")])
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10));
        let mut updated = expense("e1", "g1");
        updated["amount"] = json!(25);
        store
            .cache_records(EntityKind::Expenses, vec![updated])
            .await
            .unwrap();

        let records = store
            .get_cached_records(EntityKind::Expenses, None)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data["amount"], json!(25));
        assert_eq!(records[0].cached_at, NOW + 10_000);
        assert!(!records[0].pending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cache_accepts_records_with_only_an_id() {
        let (store, _) = setup();
        store
            .cache_records(EntityKind::Users, vec![json!({"id": "u1"})])
            .await
            .unwrap();
        assert!(store
            .cache_records(EntityKind::Users, vec![json!({"name": "no id"})])
            .await
            .is_err());
        // The failed batch left the earlier record alone
        let users = store.get_cached_records(EntityKind::Users, None).await.unwrap();
        assert_eq!(users.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_cached_filters_by_parent() {
        let (store, _) = setup();
        store
            .cache_records(
                EntityKind::Expenses,
                vec![expense("e1", "g1"), expense("e2", "g2"), expense("e3", "g1")],
            )
            .await
            .unwrap();

        let filtered =
            get_cached::<Expense>(&store, Some(&CacheFilter::parent("g1"))).await.unwrap();
        let mut ids = filtered
            .iter()
            .map(|cached| cached.entity.id.as_str())
            .collect::<Vec<_>>();
        ids.sort_unstable();
        assert_eq!(ids, vec!["e1", "e3"]);

        assert!(store
            .get_cached_records(EntityKind::Groups, Some(&CacheFilter::parent("g1")))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn add_pending_action_writes_temp_record_atomically() {
        let (store, _) = setup();
        let action = store
            .add_pending_action(
                NewPendingAction::new(ActionType::CreateExpense, json!({"description": "Lunch"})),
                vec![CacheWrite::UpsertTemp {
                    kind: EntityKind::Expenses,
                    record: expense("ignored", "g1"),
                }],
            )
            .await
            .unwrap();

        assert_eq!(action.retries, 0);
        assert_eq!(action.created_at, NOW);
        assert_eq!(action.status, ActionStatus::Pending);

        let temp = store
            .get_cached_record(EntityKind::Expenses, &action.id.temp_id())
            .await
            .unwrap()
            .unwrap();
        assert!(temp.pending);
        assert_eq!(temp.data["id"], json!(action.id.temp_id()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_actions_are_fifo() {
        let (store, clock) = setup();
        let mut ids = Vec::new();
        for n in 0..3 {
            let action = store
                .add_pending_action(
                    NewPendingAction::new(ActionType::DeleteExpense, json!({"id": format!("e{n}")})),
                    Vec::new(),
                )
                .await
                .unwrap();
            ids.push(action.id);
            clock.advance(Duration::from_millis(1));
        }

        let listed = store
            .get_pending_actions()
            .await
            .unwrap()
            .into_iter()
            .map(|action| action.id)
            .collect::<Vec<_>>();
        assert_eq!(listed, ids);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_park_action_at_ceiling() {
        let (store, _) = setup();
        let action = store
            .add_pending_action(
                NewPendingAction::new(ActionType::DeleteExpense, json!({"id": "e1"})),
                Vec::new(),
            )
            .await
            .unwrap();

        let first = store
            .record_action_failure(&action.id, "timeout", 3)
            .await
            .unwrap();
        assert_eq!(first.retries, 1);
        assert_eq!(first.status, ActionStatus::Pending);

        store
            .record_action_failure(&action.id, "timeout", 3)
            .await
            .unwrap();
        let third = store
            .record_action_failure(&action.id, "HTTP 503", 3)
            .await
            .unwrap();
        assert_eq!(third.status, ActionStatus::Failed);
        assert_eq!(third.last_error.as_deref(), Some("HTTP 503"));

        assert!(store.get_pending_actions().await.unwrap().is_empty());
        assert_eq!(store.get_failed_actions().await.unwrap().len(), 1);

        let retried = store.retry_failed_action(&action.id).await.unwrap();
        assert_eq!(retried.retries, 0);
        assert_eq!(retried.last_error, None);
        assert_eq!(store.get_pending_actions().await.unwrap().len(), 1);
        assert!(store.retry_failed_action(&action.id).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn complete_replaces_temp_record() {
        let (store, _) = setup();
        let action = store
            .add_pending_action(
                NewPendingAction::new(ActionType::CreateExpense, json!({"description": "Lunch"})),
                vec![CacheWrite::UpsertTemp {
                    kind: EntityKind::Expenses,
                    record: expense("x", "g1"),
                }],
            )
            .await
            .unwrap();

        let completed = store
            .complete_pending_action(
                &action.id,
                action.revision,
                vec![
                    CacheWrite::remove(EntityKind::Expenses, action.id.temp_id()),
                    CacheWrite::confirmed(EntityKind::Expenses, expense("srv-1", "g1")),
                ],
            )
            .await
            .unwrap();
        assert_eq!(completed, Retirement::Retired);

        let records = store
            .get_cached_records(EntityKind::Expenses, None)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "srv-1");
        assert!(store.get_pending_actions().await.unwrap().is_empty());

        // Completing twice is a no-op
        assert_eq!(
            store
                .complete_pending_action(&action.id, action.revision, Vec::new())
                .await
                .unwrap(),
            Retirement::Missing
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn amended_action_survives_completion() {
        let (store, _) = setup();
        store
            .cache_records(EntityKind::Expenses, vec![expense("e1", "g1")])
            .await
            .unwrap();
        let action = store
            .add_pending_action(
                NewPendingAction::new(ActionType::UpdateExpense, json!({"id": "e1", "amount": 50})),
                Vec::new(),
            )
            .await
            .unwrap();
        let amended = store
            .amend_pending_action(&action.id, json!({"id": "e1", "amount": 60}), Vec::new())
            .await
            .unwrap();
        assert_eq!(amended.revision, action.revision + 1);

        let outcome = store
            .complete_pending_action(
                &action.id,
                action.revision,
                vec![CacheWrite::confirmed(EntityKind::Expenses, expense("e1", "g1"))],
            )
            .await
            .unwrap();
        assert_eq!(outcome, Retirement::Amended(amended));
        assert_eq!(store.get_pending_actions().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_amended_mid_push_becomes_update() {
        let (store, _) = setup();
        let pushed = json!({"group_id": "g1", "description": "Lunch", "amount": 20});
        let action = store
            .add_pending_action(
                NewPendingAction::new(ActionType::CreateExpense, pushed.clone()),
                vec![CacheWrite::UpsertTemp {
                    kind: EntityKind::Expenses,
                    record: expense("x", "g1"),
                }],
            )
            .await
            .unwrap();
        store
            .amend_pending_action(
                &action.id,
                json!({"group_id": "g1", "description": "Lunch", "amount": 99}),
                Vec::new(),
            )
            .await
            .unwrap();

        let confirmed = expense("srv-1", "g1");
        let outcome = retire_pushed_action(
            &store,
            &action.id,
            action.revision,
            &pushed,
            &confirmed,
            vec![
                CacheWrite::remove(EntityKind::Expenses, action.id.temp_id()),
                CacheWrite::confirmed(EntityKind::Expenses, confirmed.clone()),
            ],
        )
        .await
        .unwrap();

        let Retirement::Rebased(rebased) = outcome else {
            panic!("expected a rebased action, got {outcome:?}");
        };
        assert_eq!(rebased.id, action.id);
        assert_eq!(rebased.action_type, ActionType::UpdateExpense);
        assert_eq!(rebased.payload, json!({"id": "srv-1", "amount": 99}));
        assert_eq!(rebased.base, Some(json!({"amount": 20})));

        let records = store
            .get_cached_records(EntityKind::Expenses, None)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "srv-1");
        assert_eq!(records[0].data["amount"], json!(99));
        assert!(records[0].pending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn amending_a_failed_action_requeues_it() {
        let (store, _) = setup();
        let action = store
            .add_pending_action(
                NewPendingAction::new(ActionType::UpdateExpense, json!({"id": "e1", "amount": 50})),
                Vec::new(),
            )
            .await
            .unwrap();
        store
            .record_action_failure(&action.id, "HTTP 500", 1)
            .await
            .unwrap();

        let amended = store
            .amend_pending_action(&action.id, json!({"id": "e1", "amount": 60}), Vec::new())
            .await
            .unwrap();
        assert_eq!(amended.status, ActionStatus::Pending);
        assert_eq!(amended.retries, 0);
        assert_eq!(amended.last_error, None);
        assert!(store.get_failed_actions().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn typed_entities_roundtrip_through_the_cache() {
        let (store, _) = setup();
        let expenses = vec![
            serde_json::from_value::<Expense>(expense("e1", "g1")).unwrap(),
            serde_json::from_value::<Expense>(expense("e2", "g1")).unwrap(),
        ];
        assert_eq!(cache_entities(&store, &expenses).await.unwrap(), 2);

        let cached = get_cached_entity::<Expense>(&store, "e2").await.unwrap().unwrap();
        assert_eq!(cached.entity, expenses[1]);
        assert!(!cached.pending);
        assert!(get_cached_entity::<Expense>(&store, "missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_pending_action_drops_temp_record() {
        let (store, _) = setup();
        let action = store
            .add_pending_action(
                NewPendingAction::new(ActionType::CreateGroup, json!({"name": "Trip"})),
                vec![CacheWrite::UpsertTemp {
                    kind: EntityKind::Groups,
                    record: json!({"name": "Trip"}),
                }],
            )
            .await
            .unwrap();

        assert!(store.remove_pending_action(&action.id).await.unwrap());
        assert!(store
            .get_cached_records(EntityKind::Groups, None)
            .await
            .unwrap()
            .is_empty());
        assert!(!store.remove_pending_action(&action.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eviction_boundary_is_exclusive() {
        let (store, clock) = setup();
        let max_age = Duration::from_secs(60);

        store
            .cache_records(EntityKind::Expenses, vec![expense("old", "g1")])
            .await
            .unwrap();
        clock.advance(Duration::from_millis(1));
        store
            .cache_records(EntityKind::Expenses, vec![expense("edge", "g1")])
            .await
            .unwrap();

        // "edge" is exactly max_age old, "old" is one millisecond past it
        clock.set(NOW + 1 + 60_000);
        let sweep = store.clean_old_cache(max_age).await.unwrap();
        assert_eq!(sweep.evicted.get(&EntityKind::Expenses), Some(&1));
        assert_eq!(sweep.total(), 1);

        let remaining = store
            .get_cached_records(EntityKind::Expenses, None)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "edge");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eviction_keeps_pending_records() {
        let (store, clock) = setup();
        store
            .add_pending_action(
                NewPendingAction::new(ActionType::CreateExpense, json!({})),
                vec![CacheWrite::UpsertTemp {
                    kind: EntityKind::Expenses,
                    record: expense("x", "g1"),
                }],
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(3600));
        let sweep = store.clean_old_cache(Duration::from_secs(1)).await.unwrap();
        assert_eq!(sweep.total(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn prune_removes_orphaned_temp_records() {
        let (store, _) = setup();
        store
            .apply_cache_writes(vec![CacheWrite::optimistic(
                EntityKind::Expenses,
                expense("temp_gone", "g1"),
            )])
            .await
            .unwrap();
        let kept = store
            .add_pending_action(
                NewPendingAction::new(ActionType::CreateExpense, json!({})),
                vec![CacheWrite::UpsertTemp {
                    kind: EntityKind::Expenses,
                    record: expense("x", "g1"),
                }],
            )
            .await
            .unwrap();

        assert_eq!(store.prune_orphaned_temp_records().await.unwrap(), 1);
        let records = store
            .get_cached_records(EntityKind::Expenses, None)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, kept.id.temp_id());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_roundtrip() {
        let (store, _) = setup();
        assert!(store.get_metadata(LAST_SYNC_KEY).await.unwrap().is_none());

        store.set_metadata(LAST_SYNC_KEY, "123").await.unwrap();
        let entry = store.get_metadata(LAST_SYNC_KEY).await.unwrap().unwrap();
        assert_eq!(entry.value, "123");
        assert_eq!(entry.updated_at, NOW);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settle.db");

        let store = SqliteLocalStore::open(&path).unwrap();
        let action = store
            .add_pending_action(
                NewPendingAction::new(ActionType::DeleteExpense, json!({"id": "e1"})),
                Vec::new(),
            )
            .await
            .unwrap();
        drop(store);

        let reopened = SqliteLocalStore::open(&path).unwrap();
        let actions = reopened.get_pending_actions().await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id, action.id);
        assert_eq!(actions[0].payload, json!({"id": "e1"}));
    }
}
