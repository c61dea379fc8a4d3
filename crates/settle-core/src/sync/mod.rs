//! Sync engine: pulls remote collections into the local cache and replays the
//! outbox against the remote service.
//!
//! A cycle runs `Pulling → Pushing` and always completes; errors are recorded
//! in the `SyncReport` and the published `SyncStatus` instead of aborting.

mod scheduler;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflict::{auto_resolution, ConflictResolver};
use crate::connectivity::Connectivity;
use crate::db::{retire_pushed_action, LocalStore, Retirement, LAST_SYNC_KEY};
use crate::error::Result;
use crate::models::{ActionId, ActionOp, CacheWrite, DataConflict, EntityKind, PendingAction};
use crate::remote::{RemoteError, RemoteQuery, RemoteService};
use crate::state::{SyncPhase, SyncStatus};
use crate::util::record_id;

pub use scheduler::SyncScheduler;

const EVENT_CAPACITY: usize = 64;

/// What happened during one cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Records cached per collection
    pub pulled: BTreeMap<EntityKind, usize>,
    /// Actions retired by a successful push
    pub pushed: usize,
    /// Conflicts settled by the automatic policy
    pub auto_resolved: usize,
    /// Push attempts that failed this cycle
    pub failed: usize,
    /// Actions that reached the retry ceiling this cycle
    pub parked: Vec<ActionId>,
    /// Conflicts waiting for a manual decision; their actions stay queued
    pub conflicts: Vec<DataConflict>,
    pub evicted: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.conflicts.is_empty()
    }
}

/// Result of asking for a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another cycle was in flight; nothing ran
    AlreadyRunning,
    /// Connectivity is down; nothing ran
    Offline,
}

impl SyncOutcome {
    pub const fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::AlreadyRunning | Self::Offline => None,
        }
    }
}

/// Broadcast to UI layers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    CycleFinished(SyncReport),
    /// Conflicts that need a manual decision
    ConflictsPending(Vec<DataConflict>),
    /// An action reached the retry ceiling and was parked as failed
    ActionFailed(PendingAction),
}

/// Releases the in-flight flag when the cycle ends, including on panic.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps the local store eventually consistent with the remote service.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    in_flight: Arc<AtomicBool>,
    status: Arc<watch::Sender<SyncStatus>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        connectivity: Connectivity,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            remote,
            connectivity,
            clock: Arc::new(SystemClock),
            config: SyncConfig::default(),
            in_flight: Arc::new(AtomicBool::new(false)),
            status: Arc::new(status),
            events,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub const fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Resolver sharing this engine's store, remote, clock and policy.
    pub fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(
            self.store.clone(),
            self.remote.clone(),
            self.clock.clone(),
            self.config.clone(),
        )
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Spawn the background scheduler for connectivity, interval and manual
    /// triggers.
    pub fn start(&self) -> SyncScheduler {
        SyncScheduler::spawn(self.clone())
    }

    /// Run one cycle now.
    pub async fn sync_now(&self) -> SyncOutcome {
        self.run(false).await
    }

    /// Auto-resolve detectable conflicts first, then run a cycle.
    pub async fn sync_with_conflict_resolution(&self) -> SyncOutcome {
        self.run(true).await
    }

    async fn run(&self, resolve_first: bool) -> SyncOutcome {
        if !self.connectivity.is_online() {
            tracing::debug!("Skipping sync while offline");
            return SyncOutcome::Offline;
        }
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            tracing::debug!("Sync already in progress");
            return SyncOutcome::AlreadyRunning;
        };

        let mut report = SyncReport::default();
        if resolve_first {
            match self.resolver().auto_resolve_all().await {
                Ok(unresolved) => {
                    tracing::debug!("{} conflicts left after auto-resolve", unresolved.len());
                }
                Err(error) => report.errors.push(format!("conflict resolution: {error}")),
            }
        }
        self.run_cycle(&mut report).await;
        SyncOutcome::Completed(report)
    }

    async fn run_cycle(&self, report: &mut SyncReport) {
        self.publish(|status| {
            status.phase = SyncPhase::Pulling;
            status.is_loading = true;
        });
        let last_sync_at = self.pull(report).await;

        self.publish(|status| status.phase = SyncPhase::Pushing);
        self.push(report).await;

        let (pending_count, failed_count) = self.outbox_counts().await;
        let last_error = report.errors.last().cloned();
        self.publish(|status| {
            status.phase = if report.errors.is_empty() {
                SyncPhase::Idle
            } else {
                SyncPhase::Error
            };
            status.is_loading = false;
            status.last_error = last_error;
            status.pending_count = pending_count;
            status.failed_count = failed_count;
            if last_sync_at.is_some() {
                status.last_sync_at = last_sync_at;
            }
        });

        tracing::info!(
            "Sync finished: pulled {}, pushed {}, auto-resolved {}, failed {}, conflicts {}, errors {}",
            report.pulled.values().sum::<usize>(),
            report.pushed,
            report.auto_resolved,
            report.failed,
            report.conflicts.len(),
            report.errors.len()
        );

        if !report.conflicts.is_empty() {
            self.emit(SyncEvent::ConflictsPending(report.conflicts.clone()));
        }
        self.emit(SyncEvent::CycleFinished(report.clone()));
    }

    /// Publish the current outbox counts without running a cycle.
    pub async fn refresh_status(&self) -> Result<()> {
        let pending_count = self.store.get_pending_actions().await?.len();
        let failed_count = self.store.get_failed_actions().await?.len();
        let last_sync_at = self
            .store
            .get_metadata(LAST_SYNC_KEY)
            .await?
            .and_then(|entry| entry.value.parse::<i64>().ok());
        self.publish(|status| {
            status.pending_count = pending_count;
            status.failed_count = failed_count;
            status.last_sync_at = last_sync_at;
        });
        Ok(())
    }

    fn publish(&self, update: impl FnOnce(&mut SyncStatus)) {
        self.status.send_modify(update);
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    async fn outbox_counts(&self) -> (usize, usize) {
        let pending = self.store.get_pending_actions().await.map_or(0, |a| a.len());
        let failed = self.store.get_failed_actions().await.map_or(0, |a| a.len());
        (pending, failed)
    }

    /// Returns the new `last_sync` stamp when every collection pulled.
    async fn pull(&self, report: &mut SyncReport) -> Option<i64> {
        let outstanding = match outstanding_targets(self.store.as_ref()).await {
            Ok(outstanding) => outstanding,
            Err(error) => {
                report.errors.push(format!("pull: {error}"));
                return None;
            }
        };

        let query = RemoteQuery::recent(self.config.pull_limit);
        let mut complete = true;
        for kind in EntityKind::ALL {
            let records = match self.remote.query(kind, &query).await {
                Ok(records) => records,
                Err(error) => {
                    tracing::warn!("Pull of {kind} failed, keeping cached copy: {error}");
                    report.errors.push(format!("pull {kind}: {error}"));
                    complete = false;
                    continue;
                }
            };

            let fresh = records
                .into_iter()
                .filter(|record| {
                    record_id(record)
                        .is_some_and(|id| !outstanding.contains(&(kind, id.to_string())))
                })
                .collect::<Vec<_>>();
            match self.store.cache_records(kind, fresh).await {
                Ok(cached) => {
                    report.pulled.insert(kind, cached);
                }
                Err(error) => {
                    tracing::warn!("Caching pulled {kind} failed: {error}");
                    report.errors.push(format!("cache {kind}: {error}"));
                    complete = false;
                }
            }
        }

        if !complete {
            return None;
        }
        self.finish_pull(report).await
    }

    async fn finish_pull(&self, report: &mut SyncReport) -> Option<i64> {
        match self.store.prune_orphaned_temp_records().await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!("Pruned {pruned} orphaned temp records"),
            Err(error) => tracing::warn!("Pruning temp records failed: {error}"),
        }
        match self.store.clean_old_cache(self.config.cache_max_age).await {
            Ok(sweep) => report.evicted = sweep.total(),
            Err(error) => tracing::warn!("Cache eviction failed: {error}"),
        }

        let now = self.clock.now_ms();
        match self.store.set_metadata(LAST_SYNC_KEY, &now.to_string()).await {
            Ok(()) => Some(now),
            Err(error) => {
                report.errors.push(format!("metadata: {error}"));
                None
            }
        }
    }

    async fn push(&self, report: &mut SyncReport) {
        let mut actions = match self.store.get_pending_actions().await {
            Ok(actions) => actions,
            Err(error) => {
                report.errors.push(format!("push: {error}"));
                return;
            }
        };
        if actions.is_empty() {
            return;
        }

        let resolver = self.resolver();
        for index in 0..actions.len() {
            if !self.connectivity.is_online() {
                tracing::info!("Connectivity lost, deferring remaining actions");
                break;
            }
            let action = actions[index].clone();

            // Creates target temp ids, which have no remote record to diverge from
            if action.action_type.op() == ActionOp::Update {
                match resolver.detect(&action).await {
                    Ok(Some(conflict)) => {
                        self.settle_conflict(&resolver, &action, conflict, report)
                            .await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(error) => {
                        self.record_failure(&action, &error.to_string(), report).await;
                        continue;
                    }
                }
            }

            match self.push_action(&action).await {
                Ok(Some((temp_id, server_id))) => {
                    report.pushed += 1;
                    self.remap_temp_references(&mut actions[index + 1..], &temp_id, &server_id)
                        .await;
                }
                Ok(None) => report.pushed += 1,
                Err(error) => self.record_failure(&action, &error.to_string(), report).await,
            }
        }
    }

    /// Apply the automatic policy to a conflict found during push.
    ///
    /// A failed resolution write counts against the action's retries like any
    /// other push failure.
    async fn settle_conflict(
        &self,
        resolver: &ConflictResolver,
        action: &PendingAction,
        conflict: DataConflict,
        report: &mut SyncReport,
    ) {
        let resolution = auto_resolution(&conflict, &self.config, self.clock.now_ms());
        if !resolution.is_automatic() {
            tracing::info!(
                "Conflict on {} {} needs a manual decision",
                conflict.entity_type,
                conflict.entity_id
            );
            report.conflicts.push(conflict);
            return;
        }

        match resolver.resolve(&conflict, &resolution).await {
            Ok(_) => report.auto_resolved += 1,
            Err(error) => {
                tracing::warn!("Automatic resolution of {} failed: {error}", conflict.id);
                self.record_failure(action, &format!("resolve: {error}"), report)
                    .await;
            }
        }
    }

    /// Push one action and retire it.
    ///
    /// An action amended while its request was in flight stays queued with
    /// the edits the remote has not seen. For creates, returns the temp id and
    /// the server id that replaced it.
    async fn push_action(&self, action: &PendingAction) -> Result<Option<(String, String)>> {
        let kind = action.action_type.kind();
        let fields = action.payload_fields();
        match action.action_type.op() {
            ActionOp::Create => {
                let record = self.remote.insert(kind, fields.clone()).await?;
                let server_id = record_id(&record)
                    .map(str::to_string)
                    .ok_or_else(|| RemoteError::InvalidResponse("insert returned no id".into()))?;
                let temp_id = action.id.temp_id();
                let writes = vec![
                    CacheWrite::remove(kind, temp_id.clone()),
                    CacheWrite::confirmed(kind, record.clone()),
                ];
                self.retire(action, &fields, &record, writes).await?;
                tracing::debug!("Created {kind} {server_id} from {temp_id}");
                Ok(Some((temp_id, server_id)))
            }
            ActionOp::Update => {
                let id = target_of(action)?;
                let record = self.remote.update(kind, &id, fields.clone()).await?;
                let writes = vec![CacheWrite::confirmed(kind, record.clone())];
                self.retire(action, &fields, &record, writes).await?;
                tracing::debug!("Updated {kind} {id}");
                Ok(None)
            }
            ActionOp::Delete => {
                let id = target_of(action)?;
                match self.remote.delete(kind, &id).await {
                    Ok(()) | Err(RemoteError::NotFound(_)) => {}
                    Err(error) => return Err(error.into()),
                }
                let writes = vec![CacheWrite::remove(kind, id.clone())];
                self.retire(action, &fields, &Value::Null, writes).await?;
                tracing::debug!("Deleted {kind} {id}");
                Ok(None)
            }
        }
    }

    async fn retire(
        &self,
        action: &PendingAction,
        pushed: &Value,
        record: &Value,
        writes: Vec<CacheWrite>,
    ) -> Result<()> {
        let retirement = retire_pushed_action(
            self.store.as_ref(),
            &action.id,
            action.revision,
            pushed,
            record,
            writes,
        )
        .await?;
        if retirement == Retirement::Missing {
            tracing::debug!("Action {} left the outbox during its push", action.id);
        }
        Ok(())
    }

    async fn record_failure(&self, action: &PendingAction, error: &str, report: &mut SyncReport) {
        report.failed += 1;
        report
            .errors
            .push(format!("{} {}: {error}", action.action_type, action.id));

        match self
            .store
            .record_action_failure(&action.id, error, self.config.retry_ceiling)
            .await
        {
            Ok(updated) if updated.is_failed() => {
                tracing::warn!(
                    "Action {} failed {} times and was parked: {error}",
                    updated.id,
                    updated.retries
                );
                report.parked.push(updated.id);
                self.emit(SyncEvent::ActionFailed(updated));
            }
            Ok(updated) => {
                tracing::warn!(
                    "Action {} failed (attempt {}): {error}",
                    updated.id,
                    updated.retries
                );
            }
            Err(store_error) => {
                tracing::warn!("Could not record failure of {}: {store_error}", action.id);
            }
        }
    }

    /// Point later actions at the server id of a record created this cycle.
    async fn remap_temp_references(
        &self,
        remaining: &mut [PendingAction],
        temp_id: &str,
        server_id: &str,
    ) {
        for action in remaining {
            let Some(payload) = remap_payload(&action.payload, temp_id, server_id) else {
                continue;
            };
            match self
                .store
                .amend_pending_action(&action.id, payload, Vec::new())
                .await
            {
                Ok(updated) => *action = updated,
                Err(error) => {
                    tracing::warn!("Could not remap {temp_id} in action {}: {error}", action.id);
                }
            }
        }
    }
}

/// Ids that queued or parked actions still own; refreshes leave them alone.
pub(crate) async fn outstanding_targets(
    store: &dyn LocalStore,
) -> Result<HashSet<(EntityKind, String)>> {
    let mut actions = store.get_pending_actions().await?;
    actions.extend(store.get_failed_actions().await?);
    Ok(actions
        .iter()
        .filter_map(|action| {
            action
                .target_id()
                .map(|id| (action.action_type.kind(), id))
        })
        .collect())
}

fn target_of(action: &PendingAction) -> Result<String> {
    action.target_id().ok_or_else(|| {
        crate::Error::InvalidInput(format!("action {} has no target id", action.id))
    })
}

/// Replace top-level string fields equal to `temp_id`; `None` if nothing matched.
fn remap_payload(payload: &Value, temp_id: &str, server_id: &str) -> Option<Value> {
    let object = payload.as_object()?;
    let mut changed = false;
    let remapped = object
        .iter()
        .map(|(key, value)| {
            if value.as_str() == Some(temp_id) {
                changed = true;
                (key.clone(), Value::String(server_id.to_string()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect();
    changed.then_some(Value::Object(remapped))
}
