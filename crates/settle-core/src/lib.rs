//! settle-core - Offline-first data layer for Settle
//!
//! This crate keeps a durable local replica of groups, expenses and users,
//! queues mutations made while offline, replays them against the remote
//! service and resolves the conflicts that replay uncovers. Clients (the CLI,
//! app shells) compose it from injected parts:
//!
//! - [`db::LocalStore`]: cached collections, outbox and metadata
//! - [`remote::RemoteService`]: the authoritative backend
//! - [`connectivity::Connectivity`]: the online/offline signal
//! - [`sync::SyncEngine`]: pull, push and scheduling
//! - [`conflict::ConflictResolver`]: divergence detection and resolution
//! - [`services::OfflineMutations`]: connectivity-aware writes and reads

pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{ActionId, EntityKind, PendingAction};
pub use state::{SyncPhase, SyncStatus};
