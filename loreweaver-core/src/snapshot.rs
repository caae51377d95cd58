//! Versioned JSON export/import of a story.
//!
//! A snapshot is a durable, human-readable archive of one story and
//! everything scoped to it. Import creates a fresh story under a new
//! owner, remapping card ids so cross-references stay intact; embeddings
//! are not carried over and recompute lazily.

use crate::error::{EngineError, Result};
use crate::id::{CardId, StoryId, UserId};
use crate::model::{
    Card, CardUpsert, GmSettings, Memory, MemoryDraft, Relationship, RelationshipDraft, Stat,
    StatDraft, Story, StoryDraft, StoryMessage,
};
use crate::store::WorldStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// A complete story archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorySnapshot {
    /// Format version for compatibility checking.
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub story: Story,
    pub cards: Vec<Card>,
    pub memories: Vec<Memory>,
    pub relationships: Vec<Relationship>,
    pub stats: Vec<Stat>,
    pub messages: Vec<StoryMessage>,
    pub settings: GmSettings,
    /// Quick-access metadata (duplicated for peek access).
    pub metadata: SnapshotMetadata,
}

/// Metadata about a snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub title: String,
    pub message_count: i64,
    pub card_count: usize,
}

impl StorySnapshot {
    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file, rejecting unknown versions.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let snapshot: Self = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::Validation(format!(
                "snapshot version mismatch: expected {SNAPSHOT_VERSION}, found {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    /// Read just the metadata without loading the full archive.
    pub async fn peek_metadata(path: impl AsRef<Path>) -> Result<SnapshotMetadata> {
        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            metadata: SnapshotMetadata,
        }

        let content = fs::read_to_string(path).await?;
        let partial: Partial = serde_json::from_str(&content)?;
        if partial.version != SNAPSHOT_VERSION {
            return Err(EngineError::Validation(format!(
                "snapshot version mismatch: expected {SNAPSHOT_VERSION}, found {}",
                partial.version
            )));
        }
        Ok(partial.metadata)
    }
}

impl WorldStore {
    /// Export a story and everything scoped to it.
    pub async fn export_story(&self, story: StoryId) -> Result<StorySnapshot> {
        let row = self
            .storage()
            .get_story(story)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("story {story}")))?;
        let cards = self.get_cards(story).await?;
        let memories = self.storage().list_memories(story, usize::MAX).await?;
        let relationships = self.storage().list_relationships(story).await?;
        let stats = self.storage().list_stats(story).await?;
        let messages = self.all_messages(story).await?;
        let settings = self.get_settings(story).await?;

        Ok(StorySnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            metadata: SnapshotMetadata {
                title: row.title.clone(),
                message_count: row.message_count,
                card_count: cards.len(),
            },
            story: row,
            cards,
            memories,
            relationships,
            stats,
            messages,
            settings,
        })
    }

    /// Import a snapshot as a new story owned by `user`.
    ///
    /// Card ids are remapped; rows referencing cards that no longer exist
    /// in the archive are skipped.
    pub async fn import_story(&self, user: UserId, snapshot: &StorySnapshot) -> Result<Story> {
        let source = &snapshot.story;
        let mut draft = StoryDraft::new(user, source.title.clone());
        draft.beginning_key = source.beginning_key.clone();
        draft.world_key = source.world_key.clone();
        draft.character_name = source.character_name.clone();
        draft.character_gender = source.character_gender.clone();
        draft.character_race = source.character_race.clone();
        // bypass create_story: the archive already carries the preset cards
        let story = self.storage().insert_story(draft).await?;

        let mut id_map: HashMap<CardId, CardId> = HashMap::new();
        let mut ordered = snapshot.cards.clone();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for card in &ordered {
            let mut upsert = CardUpsert::new(story.id, card.card_type, card.name.clone());
            upsert.description = card.description.clone();
            upsert.data = Some(card.data.clone());
            let imported = self.upsert_card(upsert).await?;
            id_map.insert(card.id, imported.id);
        }

        let remap = |id: Option<CardId>| id.and_then(|old| id_map.get(&old).copied());

        let mut drafts = Vec::new();
        for memory in &snapshot.memories {
            let mut memory_draft = MemoryDraft::new(story.id, memory.summary.clone())
                .with_source(memory.source)
                .with_owner(remap(memory.owner_card_id))
                .with_subject(remap(memory.subject_card_id))
                .with_importance(memory.importance)
                .with_tags(memory.tags.clone())
                .with_context(memory.context.clone());
            memory_draft.decay_factor = memory.decay_factor;
            drafts.push(memory_draft);
        }
        self.record_memories(drafts).await?;

        for relationship in &snapshot.relationships {
            let (Some(source_id), Some(target_id)) = (
                remap(Some(relationship.source_card_id)),
                remap(Some(relationship.target_card_id)),
            ) else {
                continue;
            };
            let mut rel_draft = RelationshipDraft::new(story.id, source_id, target_id)
                .with_metrics(relationship.metrics.clone())
                .with_importance(relationship.importance);
            rel_draft.summary = relationship.summary.clone();
            self.upsert_relationship(rel_draft).await?;
        }

        for stat in &snapshot.stats {
            let Some(character) = remap(Some(stat.character_card_id)) else {
                continue;
            };
            self.upsert_stat(
                StatDraft::new(story.id, character, stat.key.clone(), stat.value.clone())
                    .with_confidence(stat.confidence),
            )
            .await?;
        }

        let mut messages = snapshot.messages.clone();
        messages.sort_by_key(|m| m.sequence);
        for message in &messages {
            self.append_message(
                story.id,
                message.role,
                &message.content,
                message.image_url.as_deref(),
            )
            .await?;
        }

        self.storage().put_settings(story.id, snapshot.settings).await?;

        self.storage()
            .get_story(story.id)
            .await?
            .ok_or_else(|| EngineError::Storage("imported story vanished".to_string()))
    }
}
