use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] settle_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid action id: {0}")]
    InvalidActionId(String),
    #[error("Action not found: {0}")]
    ActionNotFound(String),
    #[error("--group only applies to expenses")]
    GroupFilterUnsupported,
    #[error("Metadata key cannot be empty")]
    EmptyMetadataKey,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Set api_base_url and api_key in the CLI config, or SETTLE_API_URL and SETTLE_API_KEY."
    )]
    SyncNotConfigured,
}
