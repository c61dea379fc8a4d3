//! Offline-aware mutations and cache-first reads.
//!
//! Online writes go straight to the remote service and refresh the cache.
//! Offline writes are queued in the outbox together with an optimistic cache
//! update, in a single store call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflict::base_snapshot;
use crate::connectivity::Connectivity;
use crate::db::{cache_entities, get_cached, LocalStore};
use crate::error::{Error, Result};
use crate::models::{
    ActionOp, ActionType, CacheFilter, CacheWrite, CachedEntity, Entity, EntityKind, Expense,
    ExpensePatch, Group, NewExpense, NewGroup, NewPendingAction, PendingAction, User,
};
use crate::remote::{RemoteError, RemoteQuery, RemoteService};
use crate::sync::outstanding_targets;
use crate::util::{is_temp_id, record_id, shallow_merge};

/// Result of a write: the record as the caller should render it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationOutcome<T> {
    pub data: T,
    /// The write was queued locally instead of reaching the remote
    pub is_offline: bool,
}

impl<T> MutationOutcome<T> {
    const fn online(data: T) -> Self {
        Self {
            data,
            is_offline: false,
        }
    }

    const fn queued(data: T) -> Self {
        Self {
            data,
            is_offline: true,
        }
    }
}

/// Routes writes by connectivity and serves reads from the cache.
#[derive(Clone)]
pub struct OfflineMutations {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    refresh_limit: usize,
}

impl OfflineMutations {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            clock: Arc::new(SystemClock),
            refresh_limit: SyncConfig::default().pull_limit,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use the pull limit of the given policy for read refreshes.
    #[must_use]
    pub const fn with_config(mut self, config: &SyncConfig) -> Self {
        self.refresh_limit = config.pull_limit;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.clock.now_ms()).unwrap_or_else(Utc::now)
    }

    pub async fn create_expense(&self, input: NewExpense) -> Result<MutationOutcome<Expense>> {
        input.validate()?;
        let now = self.now();
        let payload = input.to_payload(now)?;

        if self.connectivity.is_online() {
            let record = self.remote.insert(EntityKind::Expenses, payload).await?;
            return Ok(MutationOutcome::online(self.confirm(record).await?));
        }

        let placeholder = serde_json::to_value(input.provisional(String::new(), now))?;
        let action = self
            .store
            .add_pending_action(
                NewPendingAction::new(ActionType::CreateExpense, payload),
                vec![CacheWrite::UpsertTemp {
                    kind: EntityKind::Expenses,
                    record: placeholder,
                }],
            )
            .await?;
        tracing::debug!("Queued expense create {}", action.id);
        Ok(MutationOutcome::queued(
            input.provisional(action.id.temp_id(), now),
        ))
    }

    pub async fn create_group(&self, input: NewGroup) -> Result<MutationOutcome<Group>> {
        input.validate()?;
        let now = self.now();
        let payload = input.to_payload()?;

        if self.connectivity.is_online() {
            let record = self.remote.insert(EntityKind::Groups, payload).await?;
            return Ok(MutationOutcome::online(self.confirm(record).await?));
        }

        let placeholder = serde_json::to_value(input.provisional(String::new(), now))?;
        let action = self
            .store
            .add_pending_action(
                NewPendingAction::new(ActionType::CreateGroup, payload),
                vec![CacheWrite::UpsertTemp {
                    kind: EntityKind::Groups,
                    record: placeholder,
                }],
            )
            .await?;
        tracing::debug!("Queued group create {}", action.id);
        Ok(MutationOutcome::queued(
            input.provisional(action.id.temp_id(), now),
        ))
    }

    /// Update an expense.
    ///
    /// Edits to a record that still has a queued or parked create or update
    /// fold into that action, even when online, so they reach the remote after
    /// the older edit. A record queued for deletion cannot be edited.
    pub async fn update_expense(
        &self,
        id: &str,
        patch: ExpensePatch,
    ) -> Result<MutationOutcome<Expense>> {
        patch.validate()?;
        let fields = patch.to_fields()?;
        let kind = EntityKind::Expenses;
        let queued = self.queued_action_for(kind, id).await?;

        if self.connectivity.is_online() && queued.is_none() && !is_temp_id(id) {
            let record = self.remote.update(kind, id, fields).await?;
            return Ok(MutationOutcome::online(self.confirm(record).await?));
        }

        let cached = self
            .store
            .get_cached_record(kind, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("expense {id}")))?;
        let mut optimistic = shallow_merge(&cached.data, &fields);
        if let Some(object) = optimistic.as_object_mut() {
            object.insert(
                "updated_at".to_string(),
                serde_json::to_value(self.now())?,
            );
        }
        let writes = vec![CacheWrite::optimistic(kind, optimistic.clone())];

        match queued {
            Some(existing) if existing.action_type.op() == ActionOp::Delete => {
                return Err(Error::InvalidInput(format!(
                    "expense {id} is queued for deletion"
                )));
            }
            Some(existing) => {
                let payload = shallow_merge(&existing.payload, &fields);
                self.store
                    .amend_pending_action(&existing.id, payload, writes)
                    .await?;
                if existing.is_failed() {
                    tracing::info!("Edit of {id} re-queued failed action {}", existing.id);
                } else {
                    tracing::debug!("Folded edit of {id} into action {}", existing.id);
                }
            }
            None => {
                let mut payload = fields.clone();
                if let Some(object) = payload.as_object_mut() {
                    object.insert("id".to_string(), Value::String(id.to_string()));
                }
                let action = NewPendingAction::new(ActionType::UpdateExpense, payload)
                    .with_base(base_snapshot(&cached.data, &fields));
                let queued = self.store.add_pending_action(action, writes).await?;
                tracing::debug!("Queued expense update {}", queued.id);
            }
        }

        Ok(MutationOutcome::queued(serde_json::from_value(optimistic)?))
    }

    /// Delete an expense.
    ///
    /// Deleting a record that was created offline and never pushed simply
    /// discards its create, whether still queued or parked as failed.
    pub async fn delete_expense(&self, id: &str) -> Result<MutationOutcome<()>> {
        let kind = EntityKind::Expenses;

        if is_temp_id(id) {
            let action = self
                .queued_action_for(kind, id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("queued create for {id}")))?;
            self.store.remove_pending_action(&action.id).await?;
            tracing::debug!("Discarded queued create {}", action.id);
            return Ok(MutationOutcome::queued(()));
        }

        if self.connectivity.is_online() {
            match self.remote.delete(kind, id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(error) => return Err(error.into()),
            }
            // Edits queued earlier would now only fail against a missing record
            if let Some(stale) = self.queued_action_for(kind, id).await? {
                self.store.remove_pending_action(&stale.id).await?;
            }
            self.refresh_cache(vec![CacheWrite::remove(kind, id)]).await;
            return Ok(MutationOutcome::online(()));
        }

        if let Some(existing) = self.queued_action_for(kind, id).await? {
            if existing.action_type.op() == ActionOp::Delete {
                return Ok(MutationOutcome::queued(()));
            }
        }
        let action = self
            .store
            .add_pending_action(
                NewPendingAction::new(
                    ActionType::DeleteExpense,
                    serde_json::json!({ "id": id }),
                ),
                vec![CacheWrite::remove(kind, id)],
            )
            .await?;
        tracing::debug!("Queued expense delete {}", action.id);
        Ok(MutationOutcome::queued(()))
    }

    /// Expenses from the cache, optionally for one group; refreshed first when
    /// online.
    pub async fn get_expenses(
        &self,
        group_id: Option<&str>,
    ) -> Result<Vec<CachedEntity<Expense>>> {
        let mut query = RemoteQuery::recent(self.refresh_limit);
        if let Some(group_id) = group_id {
            query = query.with_filter("group_id", group_id);
        }
        self.refresh(EntityKind::Expenses, &query).await;

        let filter = group_id.map(CacheFilter::parent);
        get_cached(self.store.as_ref(), filter.as_ref()).await
    }

    pub async fn get_groups(&self) -> Result<Vec<CachedEntity<Group>>> {
        self.refresh(EntityKind::Groups, &RemoteQuery::recent(self.refresh_limit))
            .await;
        get_cached(self.store.as_ref(), None).await
    }

    pub async fn get_users(&self) -> Result<Vec<CachedEntity<User>>> {
        self.refresh(EntityKind::Users, &RemoteQuery::recent(self.refresh_limit))
            .await;
        get_cached(self.store.as_ref(), None).await
    }

    /// The queued or parked action that owns `id`, if any.
    async fn queued_action_for(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<PendingAction>> {
        let mut actions = self.store.get_pending_actions().await?;
        actions.extend(self.store.get_failed_actions().await?);
        Ok(actions.into_iter().find(|action| {
            action.action_type.kind() == kind && action.target_id().as_deref() == Some(id)
        }))
    }

    /// Parse a server record and cache it; a cache failure is only logged.
    async fn confirm<T: Entity>(&self, record: Value) -> Result<T> {
        let entity = serde_json::from_value::<T>(record)?;
        let cached = cache_entities(self.store.as_ref(), std::slice::from_ref(&entity)).await;
        if let Err(error) = cached {
            tracing::warn!("Cache refresh after online write failed: {error}");
        }
        Ok(entity)
    }

    async fn refresh_cache(&self, writes: Vec<CacheWrite>) {
        if let Err(error) = self.store.apply_cache_writes(writes).await {
            tracing::warn!("Cache refresh after online write failed: {error}");
        }
    }

    /// Pull one collection into the cache; falls back silently to the cached
    /// copy when offline or when the remote fails.
    async fn refresh(&self, kind: EntityKind, query: &RemoteQuery) {
        if !self.connectivity.is_online() {
            return;
        }
        let records = match self.remote.query(kind, query).await {
            Ok(records) => records,
            Err(error) => {
                tracing::debug!("Serving cached {kind}, refresh failed: {error}");
                return;
            }
        };

        let outstanding = match outstanding_targets(self.store.as_ref()).await {
            Ok(outstanding) => outstanding,
            Err(error) => {
                tracing::warn!("Could not read outbox before refresh: {error}");
                return;
            }
        };
        let fresh = records
            .into_iter()
            .filter(|record| {
                record_id(record).is_some_and(|id| !outstanding.contains(&(kind, id.to_string())))
            })
            .collect();
        if let Err(error) = self.store.cache_records(kind, fresh).await {
            tracing::warn!("Caching refreshed {kind} failed: {error}");
        }
    }
}
