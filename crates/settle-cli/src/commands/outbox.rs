use std::path::Path;

use settle_core::db::LocalStore;

use crate::commands::common::{
    action_to_item, format_action_lines, now_ms, parse_action_id, ActionItem, Context,
};
use crate::error::CliError;

pub async fn run_outbox_list(ctx: &Context, failed: bool, as_json: bool) -> Result<(), CliError> {
    let store = ctx.open_store()?;
    let actions = if failed {
        store.get_failed_actions().await?
    } else {
        store.get_pending_actions().await?
    };

    if as_json {
        let json_items = actions.iter().map(action_to_item).collect::<Vec<ActionItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if actions.is_empty() {
        if failed {
            println!("No failed actions.");
        } else {
            println!("Outbox is empty.");
        }
        return Ok(());
    }
    for line in format_action_lines(&actions, now_ms()) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_outbox_retry(ctx: &Context, raw_id: &str) -> Result<(), CliError> {
    let id = parse_action_id(raw_id)?;
    let store = ctx.open_store()?;
    let Some(action) = store.get_pending_action(&id).await? else {
        return Err(CliError::ActionNotFound(id.to_string()));
    };
    if !action.is_failed() {
        println!("Action {id} is already queued");
        return Ok(());
    }

    let action = store.retry_failed_action(&id).await?;
    println!("Re-queued {} {}", action.action_type, action.id);
    Ok(())
}

pub async fn run_outbox_discard(ctx: &Context, raw_id: &str) -> Result<(), CliError> {
    let id = parse_action_id(raw_id)?;
    let store = ctx.open_store()?;
    if !store.remove_pending_action(&id).await? {
        return Err(CliError::ActionNotFound(id.to_string()));
    }
    println!("Discarded {id}");
    Ok(())
}

pub async fn run_outbox_export(ctx: &Context, output: Option<&Path>) -> Result<(), CliError> {
    let store = ctx.open_store()?;
    let failed = store.get_failed_actions().await?;
    let rendered = render_failed_export(&failed)?;

    if let Some(path) = output {
        std::fs::write(path, rendered)?;
        println!("Exported {} failed actions to {}", failed.len(), path.display());
    } else {
        println!("{rendered}");
    }
    Ok(())
}

pub fn render_failed_export(
    actions: &[settle_core::PendingAction],
) -> Result<String, CliError> {
    let items = actions.iter().map(action_to_item).collect::<Vec<ActionItem>>();
    Ok(serde_json::to_string_pretty(&items)?)
}
