//! Retrieval, embedding cache, and queue behavior.

use loreweaver_core::model::{CardType, CardUpsert, MemoryDraft, StatDraft};
use loreweaver_core::testing::TestHarness;
use loreweaver_core::ContextOptions;
use serde_json::json;

fn data(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_background_queue_backfills_after_upsert() {
    let harness = TestHarness::new().await.expect("harness");

    let card = harness
        .store
        .upsert_card(CardUpsert::new(
            harness.story.id,
            CardType::Environment,
            "The Ember Road",
        ))
        .await
        .expect("card");
    assert!(card.embedding.is_none());

    harness.store.queue().drain().await;

    let refreshed = harness
        .store
        .storage()
        .get_card(harness.story.id, card.id)
        .await
        .expect("get")
        .expect("card");
    assert!(refreshed.embedding.is_some());
}

#[tokio::test]
async fn test_upsert_invalidates_and_requeues_embedding() {
    let harness = TestHarness::new().await.expect("harness");

    let card = harness
        .store
        .upsert_card(CardUpsert::new(
            harness.story.id,
            CardType::Faction,
            "Night Veil",
        ))
        .await
        .expect("card");
    harness.store.queue().drain().await;

    let updated = harness
        .store
        .upsert_card(
            CardUpsert::new(harness.story.id, CardType::Faction, "Night Veil")
                .with_data(data(json!({"standing": "outlawed"}))),
        )
        .await
        .expect("merge");
    // mutation nulls the cache; the queue restores it
    assert!(updated.embedding.is_none());
    harness.store.queue().drain().await;

    let refreshed = harness
        .store
        .storage()
        .get_card(harness.story.id, card.id)
        .await
        .expect("get")
        .expect("card");
    assert!(refreshed.embedding.is_some());
}

#[tokio::test]
async fn test_retrieval_prefers_token_overlap_and_backfills() {
    let harness = TestHarness::new().await.expect("harness");

    harness
        .store
        .upsert_card(
            CardUpsert::new(harness.story.id, CardType::Environment, "Greyspire Cliffs")
                .with_description("Sheer cliffs above the shingle beach and the wreck"),
        )
        .await
        .expect("card");
    harness
        .store
        .upsert_card(
            CardUpsert::new(harness.story.id, CardType::Faction, "Guild Compact")
                .with_description("Trade bloc of the inland cities"),
        )
        .await
        .expect("card");

    let context = harness
        .store
        .retrieve_context(
            harness.story.id,
            "the wreck below the cliffs",
            &ContextOptions {
                card_limit: 1,
                ..ContextOptions::default()
            },
        )
        .await
        .expect("retrieve");

    assert_eq!(context.cards.len(), 1);
    assert_eq!(context.cards[0].name, "Greyspire Cliffs");
}

#[tokio::test]
async fn test_stats_always_returned_and_memories_touched() {
    let harness = TestHarness::new().await.expect("harness");

    let mira = harness
        .store
        .upsert_card(CardUpsert::new(
            harness.story.id,
            CardType::Character,
            "Mira",
        ))
        .await
        .expect("card");
    harness
        .store
        .upsert_stat(StatDraft::new(
            harness.story.id,
            mira.id,
            "strength",
            json!(14),
        ))
        .await
        .expect("stat");

    let memory = harness
        .store
        .record_memory(MemoryDraft::new(
            harness.story.id,
            "Mira lost her map case in the river",
        ))
        .await
        .expect("memory");
    assert!(memory.last_accessed_at.is_none());

    let context = harness
        .store
        .retrieve_context(
            harness.story.id,
            "a question about nothing in particular",
            &ContextOptions::default(),
        )
        .await
        .expect("retrieve");

    // stats are not vector-searched; they are always visible
    assert_eq!(context.stats.len(), 1);
    assert_eq!(context.stats[0].key, "strength");

    // retrieval is a relevance signal: the returned memory was touched
    assert_eq!(context.memories.len(), 1);
    let touched = harness
        .store
        .storage()
        .get_memory(harness.story.id, memory.id)
        .await
        .expect("get")
        .expect("memory");
    assert!(touched.last_accessed_at.is_some());
}

#[tokio::test]
async fn test_invalidate_forces_reindex_on_next_read() {
    let harness = TestHarness::new().await.expect("harness");

    harness
        .store
        .upsert_card(CardUpsert::new(
            harness.story.id,
            CardType::Item,
            "Sealed Lockbox",
        ))
        .await
        .expect("card");
    harness.store.queue().drain().await;

    harness
        .store
        .invalidate_story_embeddings(harness.story.id)
        .await
        .expect("invalidate");
    let missing = harness
        .store
        .storage()
        .cards_missing_embedding(harness.story.id)
        .await
        .expect("missing");
    assert_eq!(missing.len(), 1);

    // a read repairs the cache inline
    harness
        .store
        .retrieve_context(harness.story.id, "lockbox", &ContextOptions::default())
        .await
        .expect("retrieve");
    let missing = harness
        .store
        .storage()
        .cards_missing_embedding(harness.story.id)
        .await
        .expect("missing");
    assert!(missing.is_empty());
}

#[tokio::test]
async fn test_batch_memories_schedule_coalesced_sweep() {
    let harness = TestHarness::new().await.expect("harness");

    let drafts = (0..5)
        .map(|i| MemoryDraft::new(harness.story.id, format!("fact number {i}")))
        .collect();
    let memories = harness
        .store
        .record_memories(drafts)
        .await
        .expect("batch insert");
    assert_eq!(memories.len(), 5);

    harness.store.queue().drain().await;
    let missing = harness
        .store
        .storage()
        .memories_missing_embedding(harness.story.id)
        .await
        .expect("missing");
    assert!(missing.is_empty());
}
