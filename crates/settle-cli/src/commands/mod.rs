pub mod cache;
pub mod common;
pub mod metadata;
pub mod outbox;
pub mod sync;
