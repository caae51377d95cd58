//! Snapshot export/import round trip.

use loreweaver_core::id::UserId;
use loreweaver_core::model::{
    CardType, CardUpsert, MemoryDraft, MessageRole, RelationshipDraft, StatDraft,
};
use loreweaver_core::snapshot::StorySnapshot;
use loreweaver_core::testing::TestHarness;
use serde_json::json;

async fn populate(harness: &TestHarness) {
    let mira = harness
        .store
        .upsert_card(
            CardUpsert::new(harness.story.id, CardType::Character, "Mira")
                .with_description("A herbalist"),
        )
        .await
        .expect("card");
    let bran = harness
        .store
        .upsert_card(CardUpsert::new(
            harness.story.id,
            CardType::Character,
            "Bran",
        ))
        .await
        .expect("card");

    harness
        .store
        .record_memory(
            MemoryDraft::new(harness.story.id, "Mira mistrusts strangers")
                .with_owner(Some(mira.id)),
        )
        .await
        .expect("memory");
    harness
        .store
        .upsert_relationship(
            RelationshipDraft::new(harness.story.id, mira.id, bran.id).with_importance(3),
        )
        .await
        .expect("relationship");
    harness
        .store
        .upsert_stat(StatDraft::new(harness.story.id, mira.id, "herblore", json!(5)))
        .await
        .expect("stat");

    harness
        .store
        .append_message(harness.story.id, MessageRole::You, "You say: \"Hello\"", None)
        .await
        .expect("message");
    harness
        .store
        .append_message(
            harness.story.id,
            MessageRole::Dm,
            "Mira looks up from her herbs.",
            None,
        )
        .await
        .expect("message");
}

#[tokio::test]
async fn test_export_import_round_trip_remaps_ids() {
    let harness = TestHarness::new().await.expect("harness");
    populate(&harness).await;

    let snapshot = harness
        .store
        .export_story(harness.story.id)
        .await
        .expect("export");
    assert_eq!(snapshot.metadata.card_count, 2);
    assert_eq!(snapshot.metadata.message_count, 2);

    let new_user = UserId::new();
    let imported = harness
        .store
        .import_story(new_user, &snapshot)
        .await
        .expect("import");
    assert_ne!(imported.id, harness.story.id);
    assert_eq!(imported.user_id, new_user);
    assert_eq!(imported.message_count, 2);

    let cards = harness.store.get_cards(imported.id).await.expect("cards");
    assert_eq!(cards.len(), 2);
    // ids were remapped, not copied
    assert!(cards.iter().all(|c| snapshot.cards.iter().all(|o| o.id != c.id)));

    let mira = cards.iter().find(|c| c.name == "Mira").expect("mira");
    let memories = harness
        .store
        .list_memories(imported.id, 10)
        .await
        .expect("memories");
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].owner_card_id, Some(mira.id));

    let edges = harness
        .store
        .list_relationships_from(imported.id, mira.id)
        .await
        .expect("edges");
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].importance, 3);

    let messages = harness
        .store
        .all_messages(imported.id)
        .await
        .expect("messages");
    let sequences: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
}

#[tokio::test]
async fn test_snapshot_file_round_trip_and_peek() {
    let harness = TestHarness::new().await.expect("harness");
    populate(&harness).await;

    let snapshot = harness
        .store
        .export_story(harness.story.id)
        .await
        .expect("export");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("story.json");
    snapshot.save_json(&path).await.expect("save");

    let metadata = StorySnapshot::peek_metadata(&path).await.expect("peek");
    assert_eq!(metadata.title, "Test Story");
    assert_eq!(metadata.card_count, 2);

    let loaded = StorySnapshot::load_json(&path).await.expect("load");
    assert_eq!(loaded.cards.len(), 2);
    assert_eq!(loaded.memories.len(), 1);
    assert_eq!(loaded.settings, snapshot.settings);
}

#[tokio::test]
async fn test_snapshot_version_mismatch_is_rejected() {
    let harness = TestHarness::new().await.expect("harness");
    let snapshot = harness
        .store
        .export_story(harness.story.id)
        .await
        .expect("export");

    let mut value = serde_json::to_value(&snapshot).expect("serialize");
    value["version"] = json!(99);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("future.json");
    std::fs::write(&path, serde_json::to_string(&value).expect("render")).expect("write");

    assert!(StorySnapshot::load_json(&path).await.is_err());
    assert!(StorySnapshot::peek_metadata(&path).await.is_err());
}
