//! Story summary reconciler: structured output, retry, and application.

use loreweaver_core::model::{CardType, CardUpsert};
use loreweaver_core::summary::DEFAULT_SUMMARY_LABEL;
use loreweaver_core::testing::TestHarness;
use serde_json::json;
use uuid::Uuid;

fn data(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_summary_card_history_appends_never_replaces() {
    let harness = TestHarness::new().await.expect("harness");
    harness
        .store
        .upsert_card(CardUpsert::new(
            harness.story.id,
            CardType::Character,
            "Mira",
        ))
        .await
        .expect("card");

    harness.chat.push_tool_call(
        None,
        "StorySummary",
        json!({
            "summary": "You reached Hollowmere and made an uneasy ally.",
            "memories": [
                { "summary": "Mira owes the party a favor", "ownerCardName": "Mira", "importance": 3 }
            ]
        }),
    );
    let first = harness
        .gm
        .summarize(harness.story.id, None)
        .await
        .expect("first summary");
    assert_eq!(first.memory_ids.len(), 1);

    let card = harness
        .store
        .get_card_by_name(harness.story.id, CardType::Story, DEFAULT_SUMMARY_LABEL)
        .await
        .expect("lookup")
        .expect("summary card");
    assert_eq!(
        card.data["summaries"].as_array().map(|a| a.len()),
        Some(1)
    );

    harness.chat.push_tool_call(
        None,
        "StorySummary",
        json!({ "summary": "The lockbox was opened; the guild wants it back." }),
    );
    harness
        .gm
        .summarize(harness.story.id, None)
        .await
        .expect("second summary");

    let card = harness
        .store
        .get_card_by_name(harness.story.id, CardType::Story, DEFAULT_SUMMARY_LABEL)
        .await
        .expect("lookup")
        .expect("summary card");
    let summaries = card.data["summaries"].as_array().expect("history");
    assert_eq!(summaries.len(), 2);
    assert_eq!(
        summaries[0]["summary"],
        json!("You reached Hollowmere and made an uneasy ally.")
    );

    // the recorded memory resolved its owner by name
    let memories = harness
        .store
        .list_memories(harness.story.id, 10)
        .await
        .expect("memories");
    let mira = harness
        .store
        .get_card_by_name(harness.story.id, CardType::Character, "Mira")
        .await
        .expect("lookup")
        .expect("card");
    assert!(memories.iter().any(|m| m.owner_card_id == Some(mira.id)));
}

#[tokio::test]
async fn test_parse_failure_is_retried_with_feedback() {
    let harness = TestHarness::new().await.expect("harness");

    // first attempt: payload missing the required summary field
    harness
        .chat
        .push_tool_call(None, "StorySummary", json!({ "wrong": true }));
    harness.chat.push_tool_call(
        None,
        "StorySummary",
        json!({ "summary": "Second attempt sticks." }),
    );

    let report = harness
        .gm
        .summarize(harness.story.id, None)
        .await
        .expect("summary after retry");
    assert_eq!(report.summary, "Second attempt sticks.");
    assert_eq!(harness.chat.request_count(), 2);

    // the parse error was fed back into the conversation
    let request = harness.chat.last_request().expect("request");
    let feedback = request
        .messages
        .iter()
        .filter_map(|m| m.content.first())
        .filter_map(|block| block.as_text())
        .any(|text| text.contains("failed to parse"));
    assert!(feedback);
}

#[tokio::test]
async fn test_three_failures_abort() {
    let harness = TestHarness::new().await.expect("harness");

    for _ in 0..3 {
        harness
            .chat
            .push_tool_call(None, "StorySummary", json!({ "wrong": true }));
    }

    let result = harness.gm.summarize(harness.story.id, None).await;
    assert!(result.is_err());
    assert_eq!(harness.chat.request_count(), 3);
}

#[tokio::test]
async fn test_fabricated_ids_fall_back_to_names() {
    let harness = TestHarness::new().await.expect("harness");
    for name in ["Serra", "Fenn"] {
        harness
            .store
            .upsert_card(CardUpsert::new(
                harness.story.id,
                CardType::Character,
                name,
            ))
            .await
            .expect("card");
    }

    harness.chat.push_tool_call(
        None,
        "StorySummary",
        json!({
            "summary": "Serra now distrusts Fenn.",
            "relationshipUpdates": [{
                "sourceId": Uuid::new_v4().to_string(),
                "sourceName": "Serra",
                "targetId": Uuid::new_v4().to_string(),
                "targetName": "fenn",
                "summary": "Distrust after the ledger went missing",
                "importance": 4
            }]
        }),
    );

    let report = harness
        .gm
        .summarize(harness.story.id, None)
        .await
        .expect("summary");
    assert_eq!(report.relationship_ids.len(), 1);

    let serra = harness
        .store
        .get_card_by_name(harness.story.id, CardType::Character, "Serra")
        .await
        .expect("lookup")
        .expect("card");
    let edges = harness
        .store
        .list_relationships_from(harness.story.id, serra.id)
        .await
        .expect("edges");
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].importance, 4);
}

#[tokio::test]
async fn test_character_update_creates_missing_character() {
    let harness = TestHarness::new().await.expect("harness");

    harness.chat.push_tool_call(
        None,
        "StorySummary",
        json!({
            "summary": "A stranger joined the caravan.",
            "characterUpdates": [{
                "characterName": "Old Fenn",
                "description": "A drover with a long memory",
                "dataPatch": {"traits": ["patient"]}
            }]
        }),
    );

    let report = harness
        .gm
        .summarize(harness.story.id, None)
        .await
        .expect("summary");
    assert_eq!(report.character_ids.len(), 1);

    let fenn = harness
        .store
        .get_card_by_name(harness.story.id, CardType::Character, "Old Fenn")
        .await
        .expect("lookup")
        .expect("card");
    assert_eq!(fenn.data["traits"], json!(["patient"]));
    assert_eq!(fenn.description.as_deref(), Some("A drover with a long memory"));
}
