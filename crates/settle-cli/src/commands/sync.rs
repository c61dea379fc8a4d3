use std::sync::Arc;
use std::time::Duration;

use settle_core::connectivity::{Connectivity, ReachabilityProbe};
use settle_core::models::DataConflict;
use settle_core::remote::RestRemote;
use settle_core::sync::{SyncEngine, SyncEvent, SyncOutcome, SyncReport};
use settle_core::SyncStatus;
use tokio::sync::broadcast::error::RecvError;

use crate::commands::common::{format_timestamp, Context};
use crate::error::CliError;

const PROBE_INTERVAL: Duration = Duration::from_secs(15);

pub async fn run_sync(ctx: &Context, resolve: bool, watch: bool) -> Result<(), CliError> {
    if !ctx.remote.is_configured() {
        return Err(CliError::SyncNotConfigured);
    }
    let store = ctx.open_store()?;
    let remote = Arc::new(RestRemote::new(&ctx.remote)?);
    let probe = ReachabilityProbe::new(
        ctx.remote.base_url()?,
        PROBE_INTERVAL,
        ctx.remote.request_timeout(),
    )?;
    let connectivity = Connectivity::with_initial(probe.check().await);
    let engine =
        SyncEngine::new(store, remote, connectivity.clone()).with_config(ctx.sync.clone());

    if watch {
        return watch_sync(engine, probe, connectivity, resolve).await;
    }

    let outcome = if resolve {
        engine.sync_with_conflict_resolution().await
    } else {
        engine.sync_now().await
    };
    match outcome {
        SyncOutcome::Completed(report) => {
            for line in format_report_lines(&report) {
                println!("{line}");
            }
        }
        SyncOutcome::Offline => println!("Backend unreachable; changes stay queued."),
        SyncOutcome::AlreadyRunning => println!("A sync is already running."),
    }
    engine.refresh_status().await?;
    println!("{}", format_status_line(&engine.status()));
    Ok(())
}

async fn watch_sync(
    engine: SyncEngine,
    probe: ReachabilityProbe,
    connectivity: Connectivity,
    resolve: bool,
) -> Result<(), CliError> {
    if resolve && connectivity.is_online() {
        let remaining = engine.resolver().auto_resolve_all().await?;
        if !remaining.is_empty() {
            println!("{} conflicts need a manual decision", remaining.len());
        }
    }

    engine.refresh_status().await?;
    println!("{}", format_status_line(&engine.status()));

    let mut events = engine.subscribe();
    let probe_task = probe.spawn(connectivity);
    let scheduler = engine.start();
    println!("Watching for changes; press Ctrl-C to stop.");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    for line in format_event_lines(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {skipped} sync events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    scheduler.shutdown().await;
    probe_task.abort();
    println!("Stopped");
    Ok(())
}

pub fn format_report_lines(report: &SyncReport) -> Vec<String> {
    let pulled = report.pulled.values().sum::<usize>();
    let mut lines = vec![format!(
        "Sync completed: pulled {pulled}, pushed {}, auto-resolved {}, failed {}, evicted {}",
        report.pushed, report.auto_resolved, report.failed, report.evicted
    )];
    for id in &report.parked {
        lines.push(format!("Parked after repeated failures: {id}"));
    }
    lines.extend(report.conflicts.iter().map(format_conflict));
    lines.extend(report.errors.iter().map(|error| format!("Error: {error}")));
    lines
}

pub fn format_status_line(status: &SyncStatus) -> String {
    let mut line = format!(
        "Outbox: {} pending, {} failed",
        status.pending_count, status.failed_count
    );
    if let Some(last_sync_at) = status.last_sync_at {
        line.push_str("; last sync ");
        line.push_str(&format_timestamp(last_sync_at));
    }
    if status.has_error() {
        line.push_str("; last cycle reported errors");
    }
    line
}

pub fn format_event_lines(event: &SyncEvent) -> Vec<String> {
    match event {
        SyncEvent::CycleFinished(report) => format_report_lines(report),
        SyncEvent::ConflictsPending(conflicts) => conflicts.iter().map(format_conflict).collect(),
        SyncEvent::ActionFailed(action) => vec![format!(
            "Action {} ({}) failed permanently: {}",
            action.id,
            action.action_type,
            action.last_error.as_deref().unwrap_or("unknown error")
        )],
    }
}

fn format_conflict(conflict: &DataConflict) -> String {
    format!(
        "Conflict on {} {}: {} (action {})",
        conflict.entity_type,
        conflict.entity_id,
        conflict.field_conflicts.join(", "),
        conflict.action_id
    )
}
