use settle_core::db::LocalStore;

use crate::commands::common::{format_timestamp, Context};
use crate::error::CliError;

pub async fn run_metadata_get(ctx: &Context, key: &str) -> Result<(), CliError> {
    let key = normalize_key(key)?;
    let store = ctx.open_store()?;
    match store.get_metadata(&key).await? {
        Some(entry) => println!(
            "{}={}  (updated {})",
            entry.key,
            entry.value,
            format_timestamp(entry.updated_at)
        ),
        None => println!("{key} is not set"),
    }
    Ok(())
}

pub async fn run_metadata_set(ctx: &Context, key: &str, value: &str) -> Result<(), CliError> {
    let key = normalize_key(key)?;
    let store = ctx.open_store()?;
    store.set_metadata(&key, value).await?;
    println!("{key}={value}");
    Ok(())
}

pub fn normalize_key(key: &str) -> Result<String, CliError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(CliError::EmptyMetadataKey);
    }
    Ok(key.to_string())
}
