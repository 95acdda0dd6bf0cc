use thiserror::Error;
use w3sync_core::CoreError;
use w3sync_storage::StorageError;

use crate::vault::VaultError;

/// Boxed error returned by a platform's local-store adapter.
pub type LocalStoreError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("invalid mapping document: {0}")]
    InvalidMapping(String),

    #[error("no mapping document for schema {0}")]
    UnknownSchema(String),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("local store error: {0}")]
    LocalStore(#[source] LocalStoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
