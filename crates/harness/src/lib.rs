pub mod local;
pub mod network;
pub mod platform;
pub mod vault;

pub use local::{MemoryLocalStore, Relation};
pub use network::{Delivery, TestNetwork};
pub use platform::TestPlatform;
pub use vault::{CallKind, FakeVault, StoredRecord, VaultCall, WebhookEvent};

use serde_json::Value;
use w3sync_core::{MappingDocument, Row};

/// Builds a row from a `json!` object literal.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("row must be a JSON object, got {other}"),
    }
}

pub const USERS_SCHEMA: &str = "550e8400-e29b-41d4-a716-446655440001";
pub const MESSAGES_SCHEMA: &str = "550e8400-e29b-41d4-a716-446655440002";
pub const GROUPS_SCHEMA: &str = "550e8400-e29b-41d4-a716-446655440003";

/// `users`: owned by the user's own vault, addressed by `ename`.
pub fn users_document() -> MappingDocument {
    document(serde_json::json!({
        "tableName": "users",
        "schemaId": USERS_SCHEMA,
        "owner": { "paths": ["ename"] },
        "fieldMappings": [
            { "localField": "name", "globalField": "displayName" },
            { "localField": "ename", "globalField": "ename" }
        ]
    }))
}

/// `messages`: owned by the sender's vault.
pub fn messages_document() -> MappingDocument {
    document(serde_json::json!({
        "tableName": "messages",
        "schemaId": MESSAGES_SCHEMA,
        "owner": { "paths": ["senderId"], "targetTable": "users" },
        "fieldMappings": [
            { "localField": "text", "globalField": "content" },
            { "localField": "senderId", "globalField": "sender" },
            { "localField": "createdAt", "globalField": "createdAt",
              "transform": { "kind": "date", "localFormat": "millis" } }
        ],
        "referenceFields": [ { "field": "senderId", "targetTable": "users" } ]
    }))
}

/// `groups`: owned by the group owner, shared with every participant.
pub fn groups_document() -> MappingDocument {
    document(serde_json::json!({
        "tableName": "groups",
        "schemaId": GROUPS_SCHEMA,
        "owner": { "paths": ["ownerId"], "targetTable": "users" },
        "participants": { "path": "participantIds", "targetTable": "users" },
        "fieldMappings": [
            { "localField": "name", "globalField": "name" },
            { "localField": "ownerId", "globalField": "owner" },
            { "localField": "participantIds", "globalField": "participants" }
        ],
        "referenceFields": [
            { "field": "ownerId", "targetTable": "users" },
            { "field": "participantIds", "targetTable": "users" }
        ]
    }))
}

fn document(value: Value) -> MappingDocument {
    match serde_json::from_value(value) {
        Ok(document) => document,
        Err(err) => panic!("fixture document is invalid: {err}"),
    }
}
