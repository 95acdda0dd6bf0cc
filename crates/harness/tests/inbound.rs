use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use w3sync_core::reference::TableRef;
use w3sync_core::{Envelope, GlobalId, LocalId, PayloadHash, W3Id, WebhookPayload};
use w3sync_engine::{EngineError, InboundOutcome, SkipReason};
use w3sync_harness::{
    CallKind, FakeVault, MESSAGES_SCHEMA, TestPlatform, messages_document, row, users_document,
};

fn chat(vault: &Arc<FakeVault>) -> Result<TestPlatform, Box<dyn std::error::Error>> {
    let platform = TestPlatform::new("chat", vault, vec![users_document(), messages_document()])?;
    platform.seed(
        "users",
        row(json!({ "id": "u1", "name": "Alice", "ename": "@alice" })),
        "global-u1",
    )?;
    Ok(platform)
}

fn message_webhook(id: &str, content: &str, sender: &str) -> WebhookPayload {
    WebhookPayload {
        schema_id: MESSAGES_SCHEMA.to_string(),
        id: GlobalId::new(id),
        w3id: W3Id::new("global-u1"),
        data: row(json!({ "content": content, "sender": sender })),
    }
}

// ============================================================================
// Apply (6 tests)
// ============================================================================

#[tokio::test(start_paused = true)]
async fn known_record_is_updated_in_place() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;
    chat.seed(
        "messages",
        row(json!({ "id": "m1", "text": "old", "senderId": "u1" })),
        "global-m1",
    )?;

    // Record whether m1 was locked by the time its row changed
    let locked_at_write = Arc::new(Mutex::new(Vec::new()));
    let engine = chat.engine.clone();
    let seen = locked_at_write.clone();
    chat.local.set_listener(move |event| {
        if let Ok(mut seen) = seen.lock() {
            seen.push((event.table.clone(), engine.locks().contains("m1")));
        }
    });

    let outcome = chat
        .apply(message_webhook("global-m1", "new", "users(global-u1)"))
        .await?;
    assert_eq!(
        outcome,
        InboundOutcome::Updated {
            local_id: LocalId::new("m1"),
            unresolved: vec![],
        }
    );

    let local = chat.local.get("messages", "m1").ok_or("row missing")?;
    assert_eq!(local.get("text"), Some(&json!("new")));
    assert_eq!(local.get("senderId"), Some(&json!("u1")));

    let messages = chat
        .store()
        .all_mappings()?
        .into_iter()
        .filter(|m| m.entity_type == "messages")
        .count();
    assert_eq!(messages, 1);
    assert_eq!(
        *locked_at_write.lock().map_err(|_| "poisoned")?,
        vec![("messages".to_string(), true)]
    );
    assert!(chat.engine.locks().contains("global-m1"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn applied_payload_replaces_the_fingerprint() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;
    chat.seed(
        "messages",
        row(json!({ "id": "m1", "text": "old", "senderId": "u1" })),
        "global-m1",
    )?;
    let pushed = row(json!({ "content": "old", "sender": "users(global-u1)" }));
    chat.store()
        .set_fingerprint(&GlobalId::new("global-m1"), PayloadHash::of(&pushed))?;

    // Another platform rewrote the record
    let webhook = vault.publish(
        "forum",
        W3Id::new("@global-u1"),
        Envelope {
            id: GlobalId::new("global-m1"),
            ontology: MESSAGES_SCHEMA.to_string(),
            payload: row(json!({ "content": "new", "sender": "users(global-u1)" })),
            acl: vec!["*".into()],
        },
    );
    chat.apply(webhook.clone()).await?;
    let mapping = chat
        .store()
        .get_mapping(&LocalId::new("m1"), "messages")?
        .ok_or("mapping missing")?;
    assert_eq!(mapping.fingerprint, Some(PayloadHash::of(&webhook.data)));

    // Saving what the vault already holds sends nothing
    tokio::time::advance(Duration::from_secs(16)).await;
    let current = chat.local.get("messages", "m1").ok_or("row missing")?;
    chat.write("messages", current.clone());
    chat.settle().await;
    assert!(vault.calls_of(CallKind::Update).is_empty());

    // Going back to the earlier value is a real change again
    let mut reverted = current;
    reverted.insert("text".into(), json!("old"));
    chat.write("messages", reverted);
    chat.settle().await;
    let updates = vault.calls_of(CallKind::Update);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id, Some(GlobalId::new("global-m1")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unknown_record_creates_row_and_mapping() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    let outcome = chat
        .apply(message_webhook("global-m7", "hello", "users(global-u1)"))
        .await?;
    let InboundOutcome::Created {
        local_id,
        unresolved,
    } = outcome.clone()
    else {
        return Err(format!("expected a create, got {outcome:?}").into());
    };
    assert!(unresolved.is_empty());

    let local = chat
        .local
        .get("messages", local_id.as_str())
        .ok_or("row missing")?;
    assert_eq!(local.get("text"), Some(&json!("hello")));
    assert_eq!(local.get("senderId"), Some(&json!("u1")));
    assert_eq!(chat.local_id("global-m7")?, Some(local_id.clone()));
    assert!(chat.engine.locks().contains(&local_id));

    // The insert event fires after the debounce and is suppressed
    chat.settle().await;
    assert!(vault.calls().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dangling_reference_is_reported() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    let outcome = chat
        .apply(message_webhook("global-m8", "hi", "users(global-u9)"))
        .await?;
    let InboundOutcome::Created {
        local_id,
        unresolved,
    } = outcome.clone()
    else {
        return Err(format!("expected a create, got {outcome:?}").into());
    };
    assert_eq!(unresolved, vec![TableRef::new("users", "global-u9")]);
    let local = chat
        .local
        .get("messages", local_id.as_str())
        .ok_or("row missing")?;
    assert_eq!(local.get("senderId"), Some(&json!("global-u9")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unknown_schema_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    let mut payload = message_webhook("global-m1", "hi", "users(global-u1)");
    payload.schema_id = "00000000-0000-0000-0000-000000000000".into();
    let result = chat.apply(payload).await;

    assert!(matches!(result, Err(EngineError::UnknownSchema(_))));
    assert!(chat.local.rows("messages").is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn repeated_webhook_is_skipped_while_locked() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;
    let payload = message_webhook("global-m1", "hi", "users(global-u1)");

    let first = chat.apply(payload.clone()).await?;
    let second = chat.apply(payload.clone()).await?;
    assert!(matches!(first, InboundOutcome::Created { .. }));
    assert_eq!(second, InboundOutcome::Skipped(SkipReason::Locked));
    assert_eq!(chat.local.rows("messages").len(), 1);

    // Once the lock lapses the same record is updated, not duplicated
    tokio::time::advance(Duration::from_secs(16)).await;
    let third = chat.apply(payload).await?;
    assert_eq!(third.local_id(), first.local_id());
    assert!(matches!(third, InboundOutcome::Updated { .. }));
    assert_eq!(chat.local.rows("messages").len(), 1);
    Ok(())
}

// ============================================================================
// Loop Suppression (2 tests)
// ============================================================================

#[tokio::test(start_paused = true)]
async fn local_edit_inside_lock_window_is_not_synced() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    let outcome = chat
        .apply(message_webhook("global-m1", "hi", "users(global-u1)"))
        .await?;
    let local_id = outcome.local_id().ok_or("no local row")?.clone();

    let mut edited = chat
        .local
        .get("messages", local_id.as_str())
        .ok_or("row missing")?;
    edited.insert("text".into(), json!("edited too soon"));
    chat.write("messages", edited);
    chat.settle().await;

    assert!(vault.calls().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn local_edit_after_lock_window_syncs() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    // A record another platform wrote
    let payload = vault.publish(
        "forum",
        W3Id::new("@global-u1"),
        Envelope {
            id: GlobalId::new("global-m1"),
            ontology: MESSAGES_SCHEMA.to_string(),
            payload: row(json!({ "content": "hi", "sender": "users(global-u1)" })),
            acl: vec!["*".into()],
        },
    );
    let outcome = chat.apply(payload).await?;
    let local_id = outcome.local_id().ok_or("no local row")?.clone();
    chat.settle().await;

    tokio::time::advance(Duration::from_secs(16)).await;
    let mut edited = chat
        .local
        .get("messages", local_id.as_str())
        .ok_or("row missing")?;
    edited.insert("text".into(), json!("edited later"));
    chat.write("messages", edited);
    chat.settle().await;

    let updates = vault.calls_of(CallKind::Update);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id, Some(GlobalId::new("global-m1")));
    let record = vault
        .record(&GlobalId::new("global-m1"))
        .ok_or("record missing")?;
    assert_eq!(record.envelope.payload.get("content"), Some(&json!("edited later")));
    assert_eq!(record.written_by, "chat");
    Ok(())
}
