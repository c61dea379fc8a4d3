//! Data models for Settle

mod cached;
mod conflict;
mod entity;
mod expense;
mod group;
mod pending_action;
mod user;

pub use cached::{CacheFilter, CacheWrite, CachedEntity, CachedRecord};
pub use conflict::{ConflictResolution, DataConflict, ResolutionType};
pub use entity::{Entity, EntityKind, FieldKind};
pub use expense::{Expense, ExpensePatch, NewExpense};
pub use group::{Group, NewGroup};
pub use pending_action::{
    ActionId, ActionOp, ActionStatus, ActionType, NewPendingAction, PendingAction,
};
pub use user::User;
