use serde::{Deserialize, Serialize};

use crate::ids::{GlobalId, W3Id};
use crate::Row;

/// A record as stored in a vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: GlobalId,
    pub ontology: String,
    #[serde(default, alias = "parsed")]
    pub payload: Row,
    #[serde(default)]
    pub acl: Vec<String>,
}

/// Body of a create or update sent to a vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeInput {
    pub ontology: String,
    pub payload: Row,
    pub acl: Vec<String>,
}

impl EnvelopeInput {
    pub fn new(ontology: impl Into<String>, payload: Row, acl: Vec<String>) -> Self {
        Self {
            ontology: ontology.into(),
            payload,
            acl,
        }
    }
}

/// What the outbound handler reports for a propagated local change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEnvelope {
    pub id: GlobalId,
    pub w3id: W3Id,
    pub data: Row,
    pub schema_id: String,
}

/// A vault-originated change notification delivered to a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub schema_id: String,
    pub id: GlobalId,
    pub w3id: W3Id,
    #[serde(default)]
    pub data: Row,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn webhook_payload_uses_camel_case() {
        let raw = json!({
            "schemaId": "550e8400-e29b-41d4-a716-446655440000",
            "id": "global-m1",
            "w3id": "@alice",
            "data": { "content": "hi" }
        });
        let payload: WebhookPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.id, GlobalId::new("global-m1"));
        assert_eq!(payload.data.get("content"), Some(&json!("hi")));
    }

    #[test]
    fn envelope_accepts_parsed_alias() {
        let raw = json!({ "id": "g1", "ontology": "o", "parsed": { "a": 1 } });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.payload.get("a"), Some(&json!(1)));
        assert!(envelope.acl.is_empty());
    }
}
