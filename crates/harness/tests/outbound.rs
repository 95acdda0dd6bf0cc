use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use w3sync_core::{GlobalId, LocalId, W3Id};
use w3sync_engine::vault::REFERENCE_FIELD;
use w3sync_engine::{ChangeRequest, EngineError, VaultError};
use w3sync_harness::{
    CallKind, FakeVault, MESSAGES_SCHEMA, TestPlatform, groups_document, messages_document, row,
    users_document,
};

fn chat(vault: &Arc<FakeVault>) -> Result<TestPlatform, Box<dyn std::error::Error>> {
    let platform = TestPlatform::new(
        "chat",
        vault,
        vec![users_document(), messages_document(), groups_document()],
    )?;
    platform.seed(
        "users",
        row(json!({ "id": "u1", "name": "Alice", "ename": "@alice" })),
        "global-u1",
    )?;
    Ok(platform)
}

fn message_mappings(platform: &TestPlatform) -> Result<usize, Box<dyn std::error::Error>> {
    Ok(platform
        .store()
        .all_mappings()?
        .into_iter()
        .filter(|m| m.entity_type == "messages")
        .count())
}

// ============================================================================
// First Sync (5 tests)
// ============================================================================

#[tokio::test(start_paused = true)]
async fn message_create_resolves_owner_and_maps() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    vault.queue_ids(["global-m1"]);
    let chat = chat(&vault)?;

    let data = row(json!({ "id": "m1", "text": "hi", "senderId": "u1" }));
    let envelope = chat
        .engine
        .handle_change(ChangeRequest::new("messages", data))
        .await?
        .ok_or("expected the message to be created")?;

    assert_eq!(envelope.id, GlobalId::new("global-m1"));
    assert_eq!(envelope.w3id, W3Id::new("global-u1"));
    assert_eq!(envelope.schema_id, MESSAGES_SCHEMA);
    assert_eq!(envelope.data.get("content"), Some(&json!("hi")));
    assert_eq!(envelope.data.get("sender"), Some(&json!("users(global-u1)")));

    // One create, in the sender's vault
    let stores = vault.calls_of(CallKind::Store);
    assert_eq!(stores.len(), 1);
    assert_eq!(stores[0].w3id, W3Id::new("@global-u1"));
    assert_eq!(stores[0].ontology.as_deref(), Some(MESSAGES_SCHEMA));

    assert_eq!(chat.global_id("messages", "m1")?, Some(GlobalId::new("global-m1")));
    let mapping = chat
        .store()
        .get_mapping(&LocalId::new("m1"), "messages")?
        .ok_or("mapping missing")?;
    assert_eq!(mapping.entity_type, "messages");
    assert!(mapping.fingerprint.is_some());

    // The vault's echo of this write must not bounce back
    assert!(chat.engine.locks().contains("global-m1"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn ownerless_rows_never_reach_the_vault() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    let unmapped_sender = row(json!({ "id": "m1", "text": "hi", "senderId": "u9" }));
    let no_sender = row(json!({ "id": "m2", "text": "hello" }));
    assert!(
        chat.engine
            .handle_change(ChangeRequest::new("messages", unmapped_sender))
            .await?
            .is_none()
    );
    assert!(
        chat.engine
            .handle_change(ChangeRequest::new("messages", no_sender))
            .await?
            .is_none()
    );

    assert!(vault.calls_of(CallKind::Store).is_empty());
    assert_eq!(message_mappings(&chat)?, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unmapped_table_and_missing_id_are_ignored() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    let reaction = row(json!({ "id": "r1", "emoji": "+1" }));
    assert!(
        chat.engine
            .handle_change(ChangeRequest::new("reactions", reaction))
            .await?
            .is_none()
    );
    let anonymous = row(json!({ "text": "hi", "senderId": "u1" }));
    assert!(
        chat.engine
            .handle_change(ChangeRequest::new("messages", anonymous))
            .await?
            .is_none()
    );

    assert!(vault.calls().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_create_surfaces_and_leaves_no_mapping() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;
    vault.fail_next(
        CallKind::Store,
        1,
        VaultError::Status {
            status: 401,
            message: "certificate rejected".into(),
        },
    );

    let data = row(json!({ "id": "m1", "text": "hi", "senderId": "u1" }));
    let err = chat
        .engine
        .handle_change(ChangeRequest::new("messages", data.clone()))
        .await
        .err()
        .ok_or("expected the create to fail")?;
    assert!(matches!(
        err,
        EngineError::Vault(VaultError::Status { status: 401, .. })
    ));
    assert_eq!(chat.global_id("messages", "m1")?, None);

    // The next change to the same row creates it
    let created = chat
        .engine
        .handle_change(ChangeRequest::new("messages", data))
        .await?;
    assert!(created.is_some());
    assert_eq!(vault.calls_of(CallKind::Store).len(), 2);
    assert!(chat.global_id("messages", "m1")?.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn date_fields_are_normalized_on_the_way_out() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    let data = row(json!({
        "id": "m1",
        "text": "hi",
        "senderId": "u1",
        "createdAt": 1_700_000_000_000_i64
    }));
    let envelope = chat
        .engine
        .handle_change(ChangeRequest::new("messages", data))
        .await?
        .ok_or("expected a create")?;

    assert_eq!(
        envelope.data.get("createdAt"),
        Some(&json!("2023-11-14T22:13:20.000Z"))
    );
    let stored = vault.record(&envelope.id).ok_or("record missing in vault")?;
    assert_eq!(stored.envelope.payload, envelope.data);
    Ok(())
}

// ============================================================================
// Idempotent Mapping Creation (4 tests)
// ============================================================================

#[tokio::test(start_paused = true)]
async fn second_change_takes_the_update_path() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;
    let data = row(json!({ "id": "m1", "text": "hi", "senderId": "u1" }));

    chat.engine
        .handle_change(ChangeRequest::new("messages", data.clone()))
        .await?;
    // Still inside the lock window of the create: treated as its echo
    let echo = chat
        .engine
        .handle_change(ChangeRequest::new("messages", data))
        .await?;
    assert!(echo.is_none());

    tokio::time::advance(Duration::from_secs(16)).await;
    let edited = row(json!({ "id": "m1", "text": "hi again", "senderId": "u1" }));
    let update = chat
        .engine
        .handle_change(ChangeRequest::new("messages", edited))
        .await?
        .ok_or("expected an update")?;
    chat.settle().await;

    assert_eq!(vault.calls_of(CallKind::Store).len(), 1);
    let updates = vault.calls_of(CallKind::Update);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id, Some(update.id.clone()));
    assert_eq!(message_mappings(&chat)?, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_syncs_create_once() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    let first = ChangeRequest::new(
        "messages",
        row(json!({ "id": "m1", "text": "hi", "senderId": "u1" })),
    );
    let second = ChangeRequest::new(
        "messages",
        row(json!({ "id": "m1", "text": "hi!", "senderId": "u1" })),
    );
    let (a, b) = tokio::join!(
        chat.engine.handle_change(first),
        chat.engine.handle_change(second)
    );
    let (a, b) = (a?, b?);

    assert!(a.is_some() || b.is_some());
    assert_eq!(vault.calls_of(CallKind::Store).len(), 1);
    assert_eq!(message_mappings(&chat)?, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unchanged_payload_queues_no_update() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;
    let data = row(json!({ "id": "m1", "text": "hi", "senderId": "u1" }));

    chat.engine
        .handle_change(ChangeRequest::new("messages", data.clone()))
        .await?;
    tokio::time::advance(Duration::from_secs(16)).await;

    let same = chat
        .engine
        .handle_change(ChangeRequest::new("messages", data))
        .await?;
    chat.settle().await;

    assert!(same.is_some());
    assert!(vault.calls_of(CallKind::Update).is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn local_ids_are_scoped_to_their_table() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    // Serial ids per table: the message shares its id with the mapped user
    chat.write(
        "messages",
        row(json!({ "id": "u1", "text": "hi", "senderId": "u1" })),
    );
    chat.settle().await;

    let stores = vault.calls_of(CallKind::Store);
    assert_eq!(stores.len(), 1);
    assert_eq!(stores[0].ontology.as_deref(), Some(MESSAGES_SCHEMA));
    assert!(vault.calls_of(CallKind::Update).is_empty());

    let message = chat
        .global_id("messages", "u1")?
        .ok_or("message mapping missing")?;
    assert_ne!(message, GlobalId::new("global-u1"));
    assert_eq!(chat.global_id("users", "u1")?, Some(GlobalId::new("global-u1")));

    let record = vault.record(&message).ok_or("record missing")?;
    assert_eq!(record.envelope.payload.get("content"), Some(&json!("hi")));
    assert_eq!(
        record.envelope.payload.get("sender"),
        Some(&json!("users(global-u1)"))
    );
    assert_eq!(message_mappings(&chat)?, 1);
    Ok(())
}

// ============================================================================
// Reference Fan-out (2 tests)
// ============================================================================

#[tokio::test(start_paused = true)]
async fn group_is_shared_with_participants_not_owner() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    vault.queue_ids(["global-g1"]);
    let chat = chat(&vault)?;
    for (id, global) in [("u2", "global-u2"), ("u3", "global-u3")] {
        chat.seed("users", row(json!({ "id": id, "name": id })), global)?;
    }

    let group = row(json!({
        "id": "g1",
        "name": "Team",
        "ownerId": "u1",
        "participantIds": ["u1", "u2", "u3", "u2"]
    }));
    let envelope = chat
        .engine
        .handle_change(ChangeRequest::new("groups", group))
        .await?
        .ok_or("expected a create")?;
    assert_eq!(envelope.w3id, W3Id::new("global-u1"));
    assert_eq!(
        envelope.data.get("participants"),
        Some(&json!([
            "users(global-u1)",
            "users(global-u2)",
            "users(global-u3)",
            "users(global-u2)"
        ]))
    );

    // One record plus one reference per distinct non-owner participant
    assert_eq!(vault.calls_of(CallKind::Store).len(), 3);
    assert!(vault.references_in(&W3Id::new("global-u1")).is_empty());
    for participant in ["global-u2", "global-u3"] {
        let references = vault.references_in(&W3Id::new(participant));
        assert_eq!(references.len(), 1, "references in {participant}");
        assert_eq!(
            references[0].envelope.payload.get(REFERENCE_FIELD),
            Some(&json!("global-u1/global-g1"))
        );
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn explicit_participants_override_the_document() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    let group = row(json!({ "id": "g1", "name": "Team", "ownerId": "u1" }));
    let request = ChangeRequest::new("groups", group).with_participants(vec![
        W3Id::new("@dave"),
        W3Id::new("dave"),
        W3Id::new("global-u1"),
    ]);
    chat.engine.handle_change(request).await?;

    assert_eq!(vault.references_in(&W3Id::new("@dave")).len(), 1);
    assert_eq!(vault.calls_of(CallKind::Store).len(), 2);
    Ok(())
}
