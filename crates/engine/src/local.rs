use async_trait::async_trait;
use serde_json::Value;
use w3sync_core::{LocalId, Row};

use crate::error::LocalStoreError;

/// A platform's own database, as seen by the engine.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Loads a row together with the relations its mapping reads.
    async fn fetch(&self, table: &str, id: &LocalId) -> Result<Option<Row>, LocalStoreError>;

    /// Creates a row from inbound data and returns its new id.
    async fn insert(&self, table: &str, data: Row) -> Result<LocalId, LocalStoreError>;

    async fn update(&self, table: &str, id: &LocalId, data: Row) -> Result<(), LocalStoreError>;
}

/// The `id` column of a local row, as text.
pub fn row_id(row: &Row) -> Option<LocalId> {
    match row.get("id")? {
        Value::String(s) if !s.is_empty() => Some(LocalId::new(s.as_str())),
        Value::Number(n) => Some(LocalId::new(n.to_string())),
        _ => None,
    }
}
