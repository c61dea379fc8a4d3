//! Settle CLI - inspect and sync the offline store from the terminal

mod cli;
mod commands;
mod config_profiles;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{CacheCommands, Cli, Commands, MetadataCommands, OutboxCommands};
use crate::commands::cache::{run_cache_clean, run_cache_list};
use crate::commands::common::Context;
use crate::commands::metadata::{run_metadata_get, run_metadata_set};
use crate::commands::outbox::{
    run_outbox_discard, run_outbox_export, run_outbox_list, run_outbox_retry,
};
use crate::commands::sync::run_sync;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("settle=info")),
        )
        .init();

    let cli = Cli::parse();
    let ctx = Context::resolve(cli.db_path, cli.profile.as_deref())?;

    match cli.command {
        Commands::Cache { command } => match command {
            CacheCommands::List {
                collection,
                group,
                json,
            } => run_cache_list(&ctx, collection, group.as_deref(), json).await?,
            CacheCommands::Clean { max_age_days } => run_cache_clean(&ctx, max_age_days).await?,
        },
        Commands::Outbox { command } => match command {
            OutboxCommands::List { failed, json } => run_outbox_list(&ctx, failed, json).await?,
            OutboxCommands::Retry { id } => run_outbox_retry(&ctx, &id).await?,
            OutboxCommands::Discard { id } => run_outbox_discard(&ctx, &id).await?,
            OutboxCommands::Export { output } => {
                run_outbox_export(&ctx, output.as_deref()).await?;
            }
        },
        Commands::Metadata { command } => match command {
            MetadataCommands::Get { key } => run_metadata_get(&ctx, &key).await?,
            MetadataCommands::Set { key, value } => run_metadata_set(&ctx, &key, &value).await?,
        },
        Commands::Sync { resolve, watch } => run_sync(&ctx, resolve, watch).await?,
    }

    Ok(())
}
