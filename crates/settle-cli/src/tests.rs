use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use settle_core::config::{RemoteConfig, SyncConfig};
use settle_core::db::LocalStore;
use settle_core::models::{ActionType, CacheFilter, NewPendingAction};
use settle_core::sync::{SyncEvent, SyncReport};
use settle_core::{EntityKind, SyncPhase, SyncStatus};

use crate::cli::{CacheCommands, Cli, Collection, Commands, OutboxCommands};
use crate::commands::cache::group_filter;
use crate::commands::common::{
    format_action_lines, format_relative_time, format_timestamp, open_store, parse_action_id,
    record_preview, resolve_db_path, Context,
};
use crate::commands::metadata::normalize_key;
use crate::commands::outbox::render_failed_export;
use crate::commands::sync::{format_event_lines, format_report_lines, format_status_line};
use crate::error::CliError;

fn context(dir: &tempfile::TempDir) -> Context {
    Context {
        db_path: dir.path().join("data").join("settle.db"),
        remote: RemoteConfig::default(),
        sync: SyncConfig::default(),
    }
}

#[test]
fn parses_nested_commands_with_global_flags() {
    let cli = Cli::try_parse_from([
        "settle",
        "cache",
        "list",
        "expenses",
        "--group",
        "g1",
        "--db-path",
        "/tmp/settle.db",
    ])
    .unwrap();
    assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/settle.db")));
    let Commands::Cache {
        command:
            CacheCommands::List {
                collection, group, ..
            },
    } = cli.command
    else {
        panic!("expected cache list");
    };
    assert_eq!(collection, Collection::Expenses);
    assert_eq!(group.as_deref(), Some("g1"));

    let cli = Cli::try_parse_from(["settle", "outbox", "list", "--failed"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Outbox {
            command: OutboxCommands::List { failed: true, .. }
        }
    ));
}

#[test]
fn rejects_unknown_collection() {
    assert!(Cli::try_parse_from(["settle", "cache", "list", "notes"]).is_err());
}

#[test]
fn explicit_db_path_wins() {
    let path = PathBuf::from("/tmp/explicit.db");
    assert_eq!(resolve_db_path(Some(path.clone())), path);
}

#[test]
fn group_filter_only_applies_to_expenses() {
    assert_eq!(
        group_filter(EntityKind::Expenses, Some(" g1 ")).unwrap(),
        Some(CacheFilter::parent("g1"))
    );
    assert_eq!(group_filter(EntityKind::Groups, None).unwrap(), None);
    assert!(matches!(
        group_filter(EntityKind::Users, Some("g1")),
        Err(CliError::GroupFilterUnsupported)
    ));
}

#[test]
fn action_ids_must_be_uuids() {
    assert!(parse_action_id(" 0190b6a8-3c2e-7000-8000-000000000001 ").is_ok());
    assert!(matches!(
        parse_action_id("not-an-id"),
        Err(CliError::InvalidActionId(_))
    ));
}

#[test]
fn metadata_keys_are_trimmed() {
    assert_eq!(normalize_key(" last_sync ").unwrap(), "last_sync");
    assert!(matches!(normalize_key("  "), Err(CliError::EmptyMetadataKey)));
}

#[test]
fn record_preview_prefers_description_and_amount() {
    assert_eq!(
        record_preview(&json!({"description": "Lunch", "amount": 20, "currency": "USD"})),
        "Lunch (20.00 USD)"
    );
    assert_eq!(record_preview(&json!({"name": "Trip"})), "Trip");
    assert_eq!(record_preview(&json!({"id": "u1"})), "");

    let long = "x".repeat(60);
    assert!(record_preview(&json!({ "name": long })).ends_with("..."));
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
}

#[test]
fn format_timestamp_is_utc() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn report_lines_summarize_the_cycle() {
    let report = SyncReport {
        pulled: BTreeMap::from([(EntityKind::Groups, 2), (EntityKind::Expenses, 3)]),
        pushed: 1,
        errors: vec!["UPDATE_EXPENSE x: offline".to_string()],
        ..SyncReport::default()
    };
    let lines = format_report_lines(&report);
    assert_eq!(
        lines[0],
        "Sync completed: pulled 5, pushed 1, auto-resolved 0, failed 0, evicted 0"
    );
    assert_eq!(lines[1], "Error: UPDATE_EXPENSE x: offline");

    let lines = format_event_lines(&SyncEvent::CycleFinished(SyncReport::default()));
    assert_eq!(lines.len(), 1);
}

#[test]
fn status_line_flags_errored_cycles() {
    let mut status = SyncStatus {
        pending_count: 2,
        failed_count: 1,
        ..SyncStatus::default()
    };
    assert_eq!(format_status_line(&status), "Outbox: 2 pending, 1 failed");

    status.last_sync_at = Some(0);
    status.phase = SyncPhase::Error;
    assert_eq!(
        format_status_line(&status),
        "Outbox: 2 pending, 1 failed; last sync 1970-01-01 00:00:00 UTC; last cycle reported errors"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn open_store_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir);
    let store = ctx.open_store().unwrap();
    store.set_metadata("device", "laptop").await.unwrap();
    drop(store);

    assert!(ctx.db_path.exists());
    let reopened = open_store(&ctx.db_path).unwrap();
    let entry = reopened.get_metadata("device").await.unwrap().unwrap();
    assert_eq!(entry.value, "laptop");
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_actions_export_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let store = context(&dir).open_store().unwrap();

    let action = store
        .add_pending_action(
            NewPendingAction::new(ActionType::DeleteExpense, json!({"id": "e1"})),
            Vec::new(),
        )
        .await
        .unwrap();
    store
        .record_action_failure(&action.id, "remote rejected request", 1)
        .await
        .unwrap();

    let failed = store.get_failed_actions().await.unwrap();
    let exported: Value = serde_json::from_str(&render_failed_export(&failed).unwrap()).unwrap();
    assert_eq!(exported[0]["id"], json!(action.id.to_string()));
    assert_eq!(exported[0]["action_type"], json!("DELETE_EXPENSE"));
    assert_eq!(exported[0]["target"], json!("e1"));
    assert_eq!(exported[0]["status"], json!("failed"));
    assert_eq!(exported[0]["last_error"], json!("remote rejected request"));

    let lines = format_action_lines(&failed, action.created_at);
    assert!(lines[0].contains("DELETE_EXPENSE"));
    assert!(lines[0].ends_with("last error: remote rejected request"));
}
