//! Client-facing services built on the store, the remote and connectivity

mod mutations;

pub use mutations::{MutationOutcome, OfflineMutations};
