use std::time::Duration;

use settle_core::db::LocalStore;
use settle_core::models::CacheFilter;
use settle_core::EntityKind;

use crate::cli::Collection;
use crate::commands::common::{
    format_record_lines, now_ms, record_to_item, Context, RecordItem,
};
use crate::error::CliError;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub async fn run_cache_list(
    ctx: &Context,
    collection: Collection,
    group: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    let kind = EntityKind::from(collection);
    let filter = group_filter(kind, group)?;
    let store = ctx.open_store()?;
    let records = store.get_cached_records(kind, filter.as_ref()).await?;

    if as_json {
        let json_items = records.iter().map(record_to_item).collect::<Vec<RecordItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No cached {kind}.");
        return Ok(());
    }
    for line in format_record_lines(&records, now_ms()) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_cache_clean(ctx: &Context, max_age_days: Option<u64>) -> Result<(), CliError> {
    let max_age = max_age_days.map_or(ctx.sync.cache_max_age, |days| {
        DAY.saturating_mul(u32::try_from(days).unwrap_or(u32::MAX))
    });
    let store = ctx.open_store()?;

    let sweep = store.clean_old_cache(max_age).await?;
    let orphans = store.prune_orphaned_temp_records().await?;

    for (kind, count) in &sweep.evicted {
        println!("{kind}: evicted {count}");
    }
    println!(
        "Evicted {} stale records, pruned {orphans} orphaned placeholders",
        sweep.total()
    );
    Ok(())
}

pub fn group_filter(kind: EntityKind, group: Option<&str>) -> Result<Option<CacheFilter>, CliError> {
    match (kind, group.map(str::trim)) {
        (_, None | Some("")) => Ok(None),
        (EntityKind::Expenses, Some(group)) => Ok(Some(CacheFilter::parent(group))),
        _ => Err(CliError::GroupFilterUnsupported),
    }
}
