//! Background triggers for the sync engine

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use super::SyncEngine;

/// Runs cycles when connectivity returns (after the reconnect debounce), on the
/// configured interval while online, and on `trigger()`.
pub struct SyncScheduler {
    trigger: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    pub(super) fn spawn(engine: SyncEngine) -> Self {
        let trigger = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(engine, trigger.clone(), shutdown_rx));
        Self {
            trigger,
            shutdown,
            handle,
        }
    }

    /// Request a cycle; requests made while one is running coalesce.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the scheduler and wait for an in-flight cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.handle.await {
            tracing::warn!("Sync scheduler stopped abnormally: {error}");
        }
    }
}

fn interval_for(period: Option<Duration>) -> Option<Interval> {
    period.filter(|period| !period.is_zero()).map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    })
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run(engine: SyncEngine, trigger: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
    let connectivity = engine.connectivity().clone();
    let mut online = connectivity.subscribe();
    let mut interval = interval_for(engine.config().sync_interval);
    let debounce = engine.config().reconnect_debounce;

    tracing::info!("Sync scheduler started");
    if connectivity.is_online() {
        engine.sync_now().await;
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            () = trigger.notified() => {
                engine.sync_now().await;
            }
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                if !*online.borrow_and_update() {
                    continue;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(debounce) => {}
                }
                // A link that dropped again during the debounce is left alone
                if connectivity.is_online() {
                    tracing::info!("Connectivity restored, syncing");
                    engine.sync_now().await;
                }
            }
            () = next_tick(&mut interval) => {
                if connectivity.is_online() {
                    engine.sync_now().await;
                }
            }
        }
    }
    tracing::info!("Sync scheduler stopped");
}
