//! Database layer for Settle

mod connection;
mod migrations;
mod store;

pub use connection::Database;
pub use migrations::CURRENT_VERSION;
pub use store::{
    cache_entities, get_cached, get_cached_entity, retire_pushed_action, CacheSweep, LocalStore,
    MetadataEntry, Retirement, SqliteLocalStore, LAST_SYNC_KEY,
};
