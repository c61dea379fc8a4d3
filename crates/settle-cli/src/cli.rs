use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use settle_core::EntityKind;

#[derive(Parser)]
#[command(name = "settle")]
#[command(about = "Inspect and sync the Settle offline store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile holding the remote endpoint and sync settings
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect or sweep cached collections
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Inspect queued offline actions
    Outbox {
        #[command(subcommand)]
        command: OutboxCommands,
    },
    /// Read or write sync metadata
    Metadata {
        #[command(subcommand)]
        command: MetadataCommands,
    },
    /// Replay the outbox and refresh the cache
    Sync {
        /// Apply automatic conflict resolution before the cycle
        #[arg(long)]
        resolve: bool,
        /// Keep running: sync on interval and whenever the backend becomes reachable
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cached records of a collection
    List {
        #[arg(value_enum)]
        collection: Collection,
        /// Only expenses of this group
        #[arg(long, value_name = "ID")]
        group: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Evict stale records that have no pending changes
    Clean {
        /// Maximum age in days (configured value when omitted)
        #[arg(long, value_name = "N")]
        max_age_days: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum OutboxCommands {
    /// List queued actions in replay order
    List {
        /// Show parked actions instead
        #[arg(long)]
        failed: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-queue a failed action
    Retry {
        /// Action ID
        id: String,
    },
    /// Drop an action and its placeholder record
    Discard {
        /// Action ID
        id: String,
    },
    /// Write failed actions as JSON
    Export {
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum MetadataCommands {
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Collection {
    Groups,
    Expenses,
    Users,
}

impl From<Collection> for EntityKind {
    fn from(collection: Collection) -> Self {
        match collection {
            Collection::Groups => Self::Groups,
            Collection::Expenses => Self::Expenses,
            Collection::Users => Self::Users,
        }
    }
}
