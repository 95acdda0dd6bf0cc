use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use w3sync_core::{GlobalId, LocalId, ManualClock, W3Id, WebhookPayload};
use w3sync_engine::{InboundOutcome, JunctionRule, SkipReason};
use w3sync_harness::{
    CallKind, FakeVault, MESSAGES_SCHEMA, Relation, TestPlatform, groups_document,
    messages_document, row, users_document,
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

// ============================================================================
// Debounce (3 tests)
// ============================================================================

#[tokio::test(start_paused = true)]
async fn burst_of_writes_syncs_last_snapshot_once() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;
    let start = tokio::time::Instant::now();

    chat.write("messages", row(json!({ "id": "m1", "text": "h", "senderId": "u1" })));
    tokio::time::advance(Duration::from_millis(60)).await;
    chat.write("messages", row(json!({ "id": "m1", "text": "hi", "senderId": "u1" })));
    tokio::time::advance(Duration::from_millis(60)).await;
    chat.write("messages", row(json!({ "id": "m1", "text": "hi!", "senderId": "u1" })));
    chat.settle().await;

    let stores = vault.calls_of(CallKind::Store);
    assert_eq!(stores.len(), 1);
    // Each write pushed the deadline back by the full window
    assert!(stores[0].at >= start + Duration::from_millis(220));
    let id = stores[0].id.clone().ok_or("store without id")?;
    let record = vault.record(&id).ok_or("record missing")?;
    assert_eq!(record.envelope.payload.get("content"), Some(&json!("hi!")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn distinct_rows_sync_independently() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    chat.write("messages", row(json!({ "id": "m1", "text": "one", "senderId": "u1" })));
    chat.write("messages", row(json!({ "id": "m2", "text": "two", "senderId": "u1" })));
    chat.write("reactions", row(json!({ "id": "r1", "emoji": "+1" })));
    chat.settle().await;

    assert_eq!(vault.calls_of(CallKind::Store).len(), 2);
    assert!(chat.global_id("messages", "m1")?.is_some());
    assert!(chat.global_id("messages", "m2")?.is_some());
    assert_eq!(chat.global_id("reactions", "r1")?, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn nothing_leaves_before_the_window_closes() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    chat.write("messages", row(json!({ "id": "m1", "text": "hi", "senderId": "u1" })));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(vault.calls().is_empty());
    assert_eq!(chat.engine.pending_changes(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    chat.settle().await;
    assert_eq!(vault.calls_of(CallKind::Store).len(), 1);
    assert_eq!(chat.engine.pending_changes(), 0);
    Ok(())
}

// ============================================================================
// Junction Tables (1 test)
// ============================================================================

#[tokio::test(start_paused = true)]
async fn junction_rows_sync_their_parent() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let relation = Relation {
        table: "groups".into(),
        field: "participantIds".into(),
        junction: "group_participants".into(),
        parent_field: "groupId".into(),
        child_field: "userId".into(),
    };
    let chat = TestPlatform::with(
        "chat",
        &vault,
        vec![users_document(), groups_document()],
        vec![relation],
        |builder| builder.junction(JunctionRule::new("group_participants", "groups", "groupId")),
    )?;
    for (id, global) in [("u1", "global-u1"), ("u2", "global-u2"), ("u3", "global-u3")] {
        chat.seed("users", row(json!({ "id": id, "name": id })), global)?;
    }

    // One transaction: the group, then its participant links
    chat.write("groups", row(json!({ "id": "g1", "name": "Team", "ownerId": "u1" })));
    for (link, user) in [("l1", "u2"), ("l2", "u3")] {
        chat.write(
            "group_participants",
            row(json!({ "id": link, "groupId": "g1", "userId": user })),
        );
    }
    chat.settle().await;

    let groups: Vec<_> = vault
        .calls_of(CallKind::Store)
        .into_iter()
        .filter(|call| call.ontology.as_deref() != Some("reference"))
        .collect();
    assert_eq!(groups.len(), 1);
    let id = groups[0].id.clone().ok_or("store without id")?;
    let record = vault.record(&id).ok_or("record missing")?;
    assert_eq!(
        record.envelope.payload.get("participants"),
        Some(&json!(["users(global-u2)", "users(global-u3)"]))
    );
    assert_eq!(vault.references_in(&W3Id::new("global-u2")).len(), 1);
    assert_eq!(vault.references_in(&W3Id::new("global-u3")).len(), 1);
    assert_eq!(chat.global_id("group_participants", "l1")?, None);
    Ok(())
}

// ============================================================================
// Deletes and Tombstones (3 tests)
// ============================================================================

#[tokio::test(start_paused = true)]
async fn delete_inside_window_cancels_the_sync() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;

    chat.write("messages", row(json!({ "id": "m1", "text": "oops", "senderId": "u1" })));
    chat.local.delete("messages", "m1");
    chat.settle().await;

    assert!(vault.calls().is_empty());
    assert_eq!(chat.global_id("messages", "m1")?, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deleted_row_is_not_resurrected_by_webhooks() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let chat = chat(&vault)?;
    chat.seed(
        "messages",
        row(json!({ "id": "m1", "text": "hi", "senderId": "u1" })),
        "global-m1",
    )?;

    chat.local.delete("messages", "m1");
    let mapping = chat
        .store()
        .get_mapping(&LocalId::new("m1"), "messages")?
        .ok_or("mapping missing")?;
    assert!(mapping.is_tombstoned());

    let outcome = chat
        .apply(WebhookPayload {
            schema_id: MESSAGES_SCHEMA.to_string(),
            id: GlobalId::new("global-m1"),
            w3id: W3Id::new("global-u1"),
            data: row(json!({ "content": "still here?" })),
        })
        .await?;
    assert_eq!(outcome, InboundOutcome::Skipped(SkipReason::Tombstoned));
    assert!(chat.local.get("messages", "m1").is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn tombstones_are_purged_after_retention() -> Result<(), Box<dyn std::error::Error>> {
    let vault = FakeVault::new();
    let wall = Arc::new(ManualClock::new(1_700_000_000_000));
    let chat = TestPlatform::with(
        "chat",
        &vault,
        vec![users_document(), messages_document()],
        vec![],
        |builder| {
            builder
                .wall_clock(wall.clone())
                .tombstone_retention(Duration::from_secs(3600))
        },
    )?;
    chat.seed(
        "messages",
        row(json!({ "id": "m1", "text": "hi", "senderId": "u1" })),
        "global-m1",
    )?;
    chat.local.delete("messages", "m1");

    wall.advance(30 * 60 * 1000);
    assert_eq!(chat.engine.purge_tombstones()?, 0);
    assert!(chat.global_id("messages", "m1")?.is_some());

    wall.advance(31 * 60 * 1000);
    assert_eq!(chat.engine.purge_tombstones()?, 1);
    assert!(chat.store().get_mapping(&LocalId::new("m1"), "messages")?.is_none());
    Ok(())
}
