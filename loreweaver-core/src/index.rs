//! Index-document rendering for the embedding cache.
//!
//! Each row kind is flattened to a stable key:value document before being
//! embedded, so the same row always produces the same text.

use crate::model::{Card, Memory, Relationship, Stat};
use serde_json::Value;

/// Render a card for embedding.
pub fn card_document(card: &Card) -> String {
    let mut lines = vec![
        format!("type: {}", card.card_type),
        format!("name: {}", card.name),
    ];
    if let Some(description) = &card.description {
        lines.push(format!("description: {description}"));
    }
    if !card.data.is_empty() {
        lines.push(format!("data: {}", Value::Object(card.data.clone())));
    }
    lines.join("\n")
}

/// Render a memory for embedding.
pub fn memory_document(memory: &Memory) -> String {
    let mut lines = vec![
        format!("summary: {}", memory.summary),
        format!("source: {}", memory.source.as_str()),
        format!("importance: {}", memory.importance),
    ];
    if let Some(owner) = memory.owner_card_id {
        lines.push(format!("owner_card: {owner}"));
    }
    if let Some(subject) = memory.subject_card_id {
        lines.push(format!("subject_card: {subject}"));
    }
    if !memory.tags.is_empty() {
        lines.push(format!("tags: {}", memory.tags.join(", ")));
    }
    if !memory.context.is_empty() {
        lines.push(format!("context: {}", Value::Object(memory.context.clone())));
    }
    lines.join("\n")
}

/// Render a relationship for embedding.
pub fn relationship_document(relationship: &Relationship) -> String {
    let mut lines = vec![
        format!("source_card: {}", relationship.source_card_id),
        format!("target_card: {}", relationship.target_card_id),
    ];
    if let Some(summary) = &relationship.summary {
        lines.push(format!("summary: {summary}"));
    }
    lines.push(format!("importance: {}", relationship.importance));
    if !relationship.metrics.is_empty() {
        lines.push(format!(
            "metrics: {}",
            Value::Object(relationship.metrics.clone())
        ));
    }
    lines.join("\n")
}

/// Render a stat for embedding or prompt injection.
pub fn stat_document(stat: &Stat) -> String {
    [
        format!("character_card: {}", stat.character_card_id),
        format!("key: {}", stat.key),
        format!("confidence: {}", stat.confidence),
        format!("value: {}", stat.value),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CardId, StoryId};
    use crate::model::{CardType, MemoryDraft};
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_card_document_is_stable() {
        let now = Utc::now();
        let mut data = serde_json::Map::new();
        data.insert("mood".to_string(), json!("wary"));
        let card = Card {
            id: CardId::new(),
            story_id: StoryId::new(),
            card_type: CardType::Character,
            name: "Mira".to_string(),
            description: Some("A herbalist".to_string()),
            data,
            embedding: None,
            created_at: now,
            updated_at: now,
        };

        let doc = card_document(&card);
        assert!(doc.starts_with("type: character\nname: Mira"));
        assert!(doc.contains("description: A herbalist"));
        assert!(doc.contains("mood"));
        assert_eq!(doc, card_document(&card));
    }

    #[test]
    fn test_memory_document_skips_empty_fields() {
        let draft = MemoryDraft::new(StoryId::new(), "The bridge collapsed");
        let now = Utc::now();
        let memory = Memory {
            id: crate::id::MemoryId::new(),
            story_id: draft.story_id,
            owner_card_id: None,
            subject_card_id: None,
            source_message_id: None,
            source: draft.source,
            summary: draft.summary,
            context: draft.context,
            tags: draft.tags,
            importance: draft.importance,
            decay_factor: draft.decay_factor,
            embedding: None,
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
        };

        let doc = memory_document(&memory);
        assert!(doc.contains("summary: The bridge collapsed"));
        assert!(!doc.contains("tags:"));
        assert!(!doc.contains("owner_card:"));
    }
}
