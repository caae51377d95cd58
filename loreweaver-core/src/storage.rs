//! Storage interface and in-memory reference implementation.
//!
//! The engine consumes storage through the [`Storage`] trait: transactional
//! CRUD with unique-constraint-driven upserts, atomic per-story message
//! sequence allocation, and per-story nearest-neighbor queries over cached
//! embeddings. [`MemoryStorage`] is the reference implementation, holding
//! everything behind one async RwLock; the per-story corpus is small
//! (hundreds to low thousands of rows), so its distance operator is a plain
//! scan ordered by L2 distance.

use crate::error::{EngineError, Result};
use crate::id::{CardId, MemoryId, StoryId, UserId};
use crate::merge::{merge_objects, sanitize_object};
use crate::model::{
    Card, CardFilter, CardUpsert, GmSettings, Memory, MemoryDraft, MessageRole, Relationship,
    RelationshipDraft, Stat, StatDraft, Story, StoryDraft, StoryMessage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Transactional storage for stories and their world state.
///
/// Upsert operations carry the engine's merge semantics so they are atomic
/// at the storage layer (the equivalent of INSERT .. ON CONFLICT), rather
/// than check-then-insert in application code.
#[async_trait]
pub trait Storage: Send + Sync {
    // Stories
    async fn insert_story(&self, draft: StoryDraft) -> Result<Story>;
    async fn get_story(&self, id: StoryId) -> Result<Option<Story>>;
    async fn list_stories(&self, user: UserId) -> Result<Vec<Story>>;
    /// Cascade-deletes messages, cards, memories, relationships, stats,
    /// and settings.
    async fn delete_story(&self, id: StoryId) -> Result<()>;
    /// Clear the transcript, cards (and the rows referencing them), and
    /// settings, but keep the story row.
    async fn reset_story(&self, id: StoryId) -> Result<()>;

    // Transcript
    /// Append a message with a transactionally allocated sequence number
    /// (max + 1 per story) and bump the story's activity counters.
    async fn append_message(
        &self,
        story: StoryId,
        role: MessageRole,
        content: &str,
        image_url: Option<&str>,
    ) -> Result<StoryMessage>;
    /// Messages in ascending sequence order; with a limit, the most recent
    /// `limit` messages (still ascending).
    async fn list_messages(&self, story: StoryId, limit: Option<usize>) -> Result<Vec<StoryMessage>>;

    // Cards
    /// Upsert by (story, type, name): insert when absent, otherwise
    /// deep-merge the data bag, overwrite the description when provided,
    /// and null the cached embedding.
    async fn upsert_card(&self, input: CardUpsert) -> Result<Card>;
    async fn get_card(&self, story: StoryId, id: CardId) -> Result<Option<Card>>;
    async fn get_card_by_name(
        &self,
        story: StoryId,
        card_type: crate::model::CardType,
        name: &str,
    ) -> Result<Option<Card>>;
    async fn list_cards(&self, story: StoryId, filter: &CardFilter) -> Result<Vec<Card>>;
    /// Cascade-deletes memories, stats, and relationships that reference
    /// the card.
    async fn delete_card(&self, story: StoryId, id: CardId) -> Result<()>;

    // Memories
    async fn insert_memories(&self, drafts: Vec<MemoryDraft>) -> Result<Vec<Memory>>;
    async fn get_memory(&self, story: StoryId, id: MemoryId) -> Result<Option<Memory>>;
    async fn list_memories(&self, story: StoryId, limit: usize) -> Result<Vec<Memory>>;
    /// Best-effort bulk last-accessed update.
    async fn touch_memories(&self, story: StoryId, ids: &[MemoryId], at: DateTime<Utc>)
        -> Result<()>;

    // Relationships
    /// Upsert by (story, source, target): metrics shallow-merge, importance
    /// takes the max of old and new.
    async fn upsert_relationship(&self, draft: RelationshipDraft) -> Result<Relationship>;
    async fn get_relationship(
        &self,
        story: StoryId,
        id: crate::id::RelationshipId,
    ) -> Result<Option<Relationship>>;
    async fn list_relationships(&self, story: StoryId) -> Result<Vec<Relationship>>;
    async fn list_relationships_from(&self, story: StoryId, card: CardId)
        -> Result<Vec<Relationship>>;
    async fn list_relationships_to(&self, story: StoryId, card: CardId)
        -> Result<Vec<Relationship>>;

    // Stats
    /// Upsert by (story, character, key): last write wins.
    async fn upsert_stat(&self, draft: StatDraft) -> Result<Stat>;
    async fn list_stats(&self, story: StoryId) -> Result<Vec<Stat>>;
    async fn list_stats_for_character(&self, story: StoryId, card: CardId) -> Result<Vec<Stat>>;

    // Settings
    async fn get_settings(&self, story: StoryId) -> Result<Option<GmSettings>>;
    async fn put_settings(&self, story: StoryId, settings: GmSettings) -> Result<()>;

    // Embedding cache
    async fn cards_missing_embedding(&self, story: StoryId) -> Result<Vec<Card>>;
    async fn memories_missing_embedding(&self, story: StoryId) -> Result<Vec<Memory>>;
    async fn relationships_missing_embedding(&self, story: StoryId) -> Result<Vec<Relationship>>;
    async fn set_card_embedding(&self, story: StoryId, id: CardId, embedding: Vec<f32>)
        -> Result<()>;
    async fn set_memory_embedding(
        &self,
        story: StoryId,
        id: MemoryId,
        embedding: Vec<f32>,
    ) -> Result<()>;
    async fn set_relationship_embedding(
        &self,
        story: StoryId,
        id: crate::id::RelationshipId,
        embedding: Vec<f32>,
    ) -> Result<()>;
    /// Null every cached embedding in the story, forcing a full re-index.
    async fn clear_story_embeddings(&self, story: StoryId) -> Result<()>;

    // Nearest-neighbor queries (distance ascending, importance descending
    // as tie-break where the row has an importance).
    async fn nearest_cards(&self, story: StoryId, query: &[f32], k: usize) -> Result<Vec<Card>>;
    async fn nearest_memories(&self, story: StoryId, query: &[f32], k: usize)
        -> Result<Vec<Memory>>;
    async fn nearest_relationships(
        &self,
        story: StoryId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Relationship>>;
}

/// L2 distance between two vectors; infinite when dimensions disagree so a
/// mis-sized embedding can never win a search.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[derive(Default)]
struct State {
    stories: HashMap<StoryId, Story>,
    messages: HashMap<StoryId, Vec<StoryMessage>>,
    cards: HashMap<StoryId, Vec<Card>>,
    memories: HashMap<StoryId, Vec<Memory>>,
    relationships: HashMap<StoryId, Vec<Relationship>>,
    stats: HashMap<StoryId, Vec<Stat>>,
    settings: HashMap<StoryId, GmSettings>,
}

impl State {
    fn ensure_story(&self, id: StoryId) -> Result<()> {
        if self.stories.contains_key(&id) {
            Ok(())
        } else {
            Err(EngineError::not_found(format!("story {id}")))
        }
    }
}

/// In-memory reference storage.
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_story(&self, draft: StoryDraft) -> Result<Story> {
        let now = Utc::now();
        let story = Story {
            id: StoryId::new(),
            user_id: draft.user_id,
            title: draft.title,
            beginning_key: draft.beginning_key,
            world_key: draft.world_key,
            character_name: draft.character_name,
            character_gender: draft.character_gender,
            character_race: draft.character_race,
            message_count: 0,
            created_at: now,
            updated_at: now,
            last_played_at: now,
        };
        let mut state = self.state.write().await;
        state.stories.insert(story.id, story.clone());
        Ok(story)
    }

    async fn get_story(&self, id: StoryId) -> Result<Option<Story>> {
        let state = self.state.read().await;
        Ok(state.stories.get(&id).cloned())
    }

    async fn list_stories(&self, user: UserId) -> Result<Vec<Story>> {
        let state = self.state.read().await;
        let mut stories: Vec<Story> = state
            .stories
            .values()
            .filter(|s| s.user_id == user)
            .cloned()
            .collect();
        stories.sort_by(|a, b| b.last_played_at.cmp(&a.last_played_at));
        Ok(stories)
    }

    async fn delete_story(&self, id: StoryId) -> Result<()> {
        let mut state = self.state.write().await;
        state.stories.remove(&id);
        state.messages.remove(&id);
        state.cards.remove(&id);
        state.memories.remove(&id);
        state.relationships.remove(&id);
        state.stats.remove(&id);
        state.settings.remove(&id);
        Ok(())
    }

    async fn reset_story(&self, id: StoryId) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_story(id)?;
        state.messages.remove(&id);
        state.cards.remove(&id);
        state.settings.remove(&id);
        // dropping every card takes the card-referencing rows with it
        state.memories.remove(&id);
        state.relationships.remove(&id);
        state.stats.remove(&id);
        if let Some(story) = state.stories.get_mut(&id) {
            let now = Utc::now();
            story.message_count = 0;
            story.updated_at = now;
            story.last_played_at = now;
        }
        Ok(())
    }

    async fn append_message(
        &self,
        story: StoryId,
        role: MessageRole,
        content: &str,
        image_url: Option<&str>,
    ) -> Result<StoryMessage> {
        let mut state = self.state.write().await;
        state.ensure_story(story)?;
        let messages = state.messages.entry(story).or_default();
        let sequence = messages.iter().map(|m| m.sequence).max().unwrap_or(0) + 1;
        let now = Utc::now();
        let message = StoryMessage {
            id: crate::id::MessageId::new(),
            story_id: story,
            role,
            content: content.to_string(),
            image_url: image_url.map(str::to_string),
            sequence,
            created_at: now,
        };
        messages.push(message.clone());
        if let Some(row) = state.stories.get_mut(&story) {
            row.message_count += 1;
            row.updated_at = now;
            row.last_played_at = now;
        }
        Ok(message)
    }

    async fn list_messages(
        &self,
        story: StoryId,
        limit: Option<usize>,
    ) -> Result<Vec<StoryMessage>> {
        let state = self.state.read().await;
        let mut messages = state.messages.get(&story).cloned().unwrap_or_default();
        messages.sort_by_key(|m| m.sequence);
        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        Ok(messages)
    }

    async fn upsert_card(&self, input: CardUpsert) -> Result<Card> {
        let mut state = self.state.write().await;
        state.ensure_story(input.story_id)?;
        let now = Utc::now();
        let cards = state.cards.entry(input.story_id).or_default();

        if let Some(existing) = cards
            .iter_mut()
            .find(|c| c.card_type == input.card_type && c.name == input.name)
        {
            if let Some(data) = &input.data {
                existing.data = merge_objects(&existing.data, data);
            }
            if let Some(description) = input.description {
                existing.description = Some(description);
            }
            existing.updated_at = now;
            existing.embedding = None;
            return Ok(existing.clone());
        }

        let card = Card {
            id: CardId::new(),
            story_id: input.story_id,
            card_type: input.card_type,
            name: input.name,
            description: input.description,
            data: sanitize_object(input.data.map(Value::Object).as_ref()),
            embedding: None,
            created_at: now,
            updated_at: now,
        };
        cards.push(card.clone());
        Ok(card)
    }

    async fn get_card(&self, story: StoryId, id: CardId) -> Result<Option<Card>> {
        let state = self.state.read().await;
        Ok(state
            .cards
            .get(&story)
            .and_then(|cards| cards.iter().find(|c| c.id == id))
            .cloned())
    }

    async fn get_card_by_name(
        &self,
        story: StoryId,
        card_type: crate::model::CardType,
        name: &str,
    ) -> Result<Option<Card>> {
        let state = self.state.read().await;
        Ok(state
            .cards
            .get(&story)
            .and_then(|cards| {
                cards
                    .iter()
                    .find(|c| c.card_type == card_type && c.name == name)
            })
            .cloned())
    }

    async fn list_cards(&self, story: StoryId, filter: &CardFilter) -> Result<Vec<Card>> {
        let state = self.state.read().await;
        let needle = filter.name.as_ref().map(|n| n.to_lowercase());
        Ok(state
            .cards
            .get(&story)
            .map(|cards| {
                cards
                    .iter()
                    .filter(|c| {
                        filter
                            .card_type
                            .map(|ty| c.card_type == ty)
                            .unwrap_or(true)
                            && needle
                                .as_ref()
                                .map(|n| c.name.to_lowercase().contains(n))
                                .unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_card(&self, story: StoryId, id: CardId) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(cards) = state.cards.get_mut(&story) {
            cards.retain(|c| c.id != id);
        }
        // cascade, mirroring FK behavior
        if let Some(memories) = state.memories.get_mut(&story) {
            memories.retain(|m| m.owner_card_id != Some(id) && m.subject_card_id != Some(id));
        }
        if let Some(stats) = state.stats.get_mut(&story) {
            stats.retain(|s| s.character_card_id != id);
        }
        if let Some(relationships) = state.relationships.get_mut(&story) {
            relationships.retain(|r| r.source_card_id != id && r.target_card_id != id);
        }
        Ok(())
    }

    async fn insert_memories(&self, drafts: Vec<MemoryDraft>) -> Result<Vec<Memory>> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut inserted = Vec::with_capacity(drafts.len());
        for draft in drafts {
            state.ensure_story(draft.story_id)?;
            let memory = Memory {
                id: MemoryId::new(),
                story_id: draft.story_id,
                owner_card_id: draft.owner_card_id,
                subject_card_id: draft.subject_card_id,
                source_message_id: draft.source_message_id,
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
            state
                .memories
                .entry(draft.story_id)
                .or_default()
                .push(memory.clone());
            inserted.push(memory);
        }
        Ok(inserted)
    }

    async fn get_memory(&self, story: StoryId, id: MemoryId) -> Result<Option<Memory>> {
        let state = self.state.read().await;
        Ok(state
            .memories
            .get(&story)
            .and_then(|memories| memories.iter().find(|m| m.id == id))
            .cloned())
    }

    async fn list_memories(&self, story: StoryId, limit: usize) -> Result<Vec<Memory>> {
        let state = self.state.read().await;
        let mut memories = state.memories.get(&story).cloned().unwrap_or_default();
        memories.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        memories.truncate(limit);
        Ok(memories)
    }

    async fn touch_memories(
        &self,
        story: StoryId,
        ids: &[MemoryId],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(memories) = state.memories.get_mut(&story) {
            for memory in memories.iter_mut() {
                if ids.contains(&memory.id) {
                    memory.last_accessed_at = Some(at);
                }
            }
        }
        Ok(())
    }

    async fn upsert_relationship(&self, draft: RelationshipDraft) -> Result<Relationship> {
        let mut state = self.state.write().await;
        state.ensure_story(draft.story_id)?;
        let now = Utc::now();
        let relationships = state.relationships.entry(draft.story_id).or_default();

        if let Some(existing) = relationships.iter_mut().find(|r| {
            r.source_card_id == draft.source_card_id && r.target_card_id == draft.target_card_id
        }) {
            for (key, value) in draft.metrics {
                existing.metrics.insert(key, value);
            }
            if draft.summary.is_some() {
                existing.summary = draft.summary;
            }
            existing.importance = existing.importance.max(draft.importance);
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let relationship = Relationship {
            id: crate::id::RelationshipId::new(),
            story_id: draft.story_id,
            source_card_id: draft.source_card_id,
            target_card_id: draft.target_card_id,
            summary: draft.summary,
            metrics: draft.metrics,
            importance: draft.importance,
            embedding: None,
            created_at: now,
            updated_at: now,
        };
        relationships.push(relationship.clone());
        Ok(relationship)
    }

    async fn get_relationship(
        &self,
        story: StoryId,
        id: crate::id::RelationshipId,
    ) -> Result<Option<Relationship>> {
        let state = self.state.read().await;
        Ok(state
            .relationships
            .get(&story)
            .and_then(|rels| rels.iter().find(|r| r.id == id))
            .cloned())
    }

    async fn list_relationships(&self, story: StoryId) -> Result<Vec<Relationship>> {
        let state = self.state.read().await;
        let mut rows = state.relationships.get(&story).cloned().unwrap_or_default();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn list_relationships_from(
        &self,
        story: StoryId,
        card: CardId,
    ) -> Result<Vec<Relationship>> {
        let state = self.state.read().await;
        let mut rows: Vec<Relationship> = state
            .relationships
            .get(&story)
            .map(|rels| {
                rels.iter()
                    .filter(|r| r.source_card_id == card)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn list_relationships_to(
        &self,
        story: StoryId,
        card: CardId,
    ) -> Result<Vec<Relationship>> {
        let state = self.state.read().await;
        let mut rows: Vec<Relationship> = state
            .relationships
            .get(&story)
            .map(|rels| {
                rels.iter()
                    .filter(|r| r.target_card_id == card)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn upsert_stat(&self, draft: StatDraft) -> Result<Stat> {
        let mut state = self.state.write().await;
        state.ensure_story(draft.story_id)?;
        let now = Utc::now();
        let stats = state.stats.entry(draft.story_id).or_default();

        if let Some(existing) = stats
            .iter_mut()
            .find(|s| s.character_card_id == draft.character_card_id && s.key == draft.key)
        {
            existing.value = draft.value;
            existing.confidence = draft.confidence;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let stat = Stat {
            id: crate::id::StatId::new(),
            story_id: draft.story_id,
            character_card_id: draft.character_card_id,
            key: draft.key,
            value: draft.value,
            confidence: draft.confidence,
            created_at: now,
            updated_at: now,
        };
        stats.push(stat.clone());
        Ok(stat)
    }

    async fn list_stats(&self, story: StoryId) -> Result<Vec<Stat>> {
        let state = self.state.read().await;
        let mut stats = state.stats.get(&story).cloned().unwrap_or_default();
        stats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(stats)
    }

    async fn list_stats_for_character(&self, story: StoryId, card: CardId) -> Result<Vec<Stat>> {
        let mut stats = self.list_stats(story).await?;
        stats.retain(|s| s.character_card_id == card);
        Ok(stats)
    }

    async fn get_settings(&self, story: StoryId) -> Result<Option<GmSettings>> {
        let state = self.state.read().await;
        Ok(state.settings.get(&story).copied())
    }

    async fn put_settings(&self, story: StoryId, settings: GmSettings) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_story(story)?;
        state.settings.insert(story, settings);
        Ok(())
    }

    async fn cards_missing_embedding(&self, story: StoryId) -> Result<Vec<Card>> {
        let state = self.state.read().await;
        Ok(state
            .cards
            .get(&story)
            .map(|cards| {
                cards
                    .iter()
                    .filter(|c| c.embedding.is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn memories_missing_embedding(&self, story: StoryId) -> Result<Vec<Memory>> {
        let state = self.state.read().await;
        Ok(state
            .memories
            .get(&story)
            .map(|memories| {
                memories
                    .iter()
                    .filter(|m| m.embedding.is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn relationships_missing_embedding(&self, story: StoryId) -> Result<Vec<Relationship>> {
        let state = self.state.read().await;
        Ok(state
            .relationships
            .get(&story)
            .map(|rels| {
                rels.iter()
                    .filter(|r| r.embedding.is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_card_embedding(
        &self,
        story: StoryId,
        id: CardId,
        embedding: Vec<f32>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(card) = state
            .cards
            .get_mut(&story)
            .and_then(|cards| cards.iter_mut().find(|c| c.id == id))
        {
            card.embedding = Some(embedding);
        }
        Ok(())
    }

    async fn set_memory_embedding(
        &self,
        story: StoryId,
        id: MemoryId,
        embedding: Vec<f32>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(memory) = state
            .memories
            .get_mut(&story)
            .and_then(|memories| memories.iter_mut().find(|m| m.id == id))
        {
            memory.embedding = Some(embedding);
        }
        Ok(())
    }

    async fn set_relationship_embedding(
        &self,
        story: StoryId,
        id: crate::id::RelationshipId,
        embedding: Vec<f32>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(relationship) = state
            .relationships
            .get_mut(&story)
            .and_then(|rels| rels.iter_mut().find(|r| r.id == id))
        {
            relationship.embedding = Some(embedding);
        }
        Ok(())
    }

    async fn clear_story_embeddings(&self, story: StoryId) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(cards) = state.cards.get_mut(&story) {
            for card in cards.iter_mut() {
                card.embedding = None;
            }
        }
        if let Some(memories) = state.memories.get_mut(&story) {
            for memory in memories.iter_mut() {
                memory.embedding = None;
            }
        }
        if let Some(relationships) = state.relationships.get_mut(&story) {
            for relationship in relationships.iter_mut() {
                relationship.embedding = None;
            }
        }
        Ok(())
    }

    async fn nearest_cards(&self, story: StoryId, query: &[f32], k: usize) -> Result<Vec<Card>> {
        let state = self.state.read().await;
        let mut scored: Vec<(f32, Card)> = state
            .cards
            .get(&story)
            .map(|cards| {
                cards
                    .iter()
                    .filter_map(|c| {
                        c.embedding
                            .as_ref()
                            .map(|e| (l2_distance(e, query), c.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        Ok(scored.into_iter().take(k).map(|(_, c)| c).collect())
    }

    async fn nearest_memories(
        &self,
        story: StoryId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Memory>> {
        let state = self.state.read().await;
        let mut scored: Vec<(f32, Memory)> = state
            .memories
            .get(&story)
            .map(|memories| {
                memories
                    .iter()
                    .filter_map(|m| {
                        m.embedding
                            .as_ref()
                            .map(|e| (l2_distance(e, query), m.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(b.1.importance.cmp(&a.1.importance))
        });
        Ok(scored.into_iter().take(k).map(|(_, m)| m).collect())
    }

    async fn nearest_relationships(
        &self,
        story: StoryId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Relationship>> {
        let state = self.state.read().await;
        let mut scored: Vec<(f32, Relationship)> = state
            .relationships
            .get(&story)
            .map(|rels| {
                rels.iter()
                    .filter_map(|r| {
                        r.embedding
                            .as_ref()
                            .map(|e| (l2_distance(e, query), r.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(b.1.importance.cmp(&a.1.importance))
        });
        Ok(scored.into_iter().take(k).map(|(_, r)| r).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CardType;
    use serde_json::json;

    async fn story(storage: &MemoryStorage) -> Story {
        storage
            .insert_story(StoryDraft::new(UserId::new(), "Test Story"))
            .await
            .expect("insert story")
    }

    fn data(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_upsert_card_inserts_then_merges() {
        let storage = MemoryStorage::new();
        let story = story(&storage).await;

        let first = storage
            .upsert_card(
                CardUpsert::new(story.id, CardType::Character, "Mira")
                    .with_data(data(json!({"traits": ["brave"]}))),
            )
            .await
            .expect("insert");

        let second = storage
            .upsert_card(
                CardUpsert::new(story.id, CardType::Character, "Mira")
                    .with_data(data(json!({"traits": ["clever"], "age": 30}))),
            )
            .await
            .expect("merge");

        assert_eq!(first.id, second.id);
        assert_eq!(second.data["traits"], json!(["brave", "clever"]));
        assert_eq!(second.data["age"], json!(30));

        let all = storage
            .list_cards(story.id, &CardFilter::default())
            .await
            .expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_card_nulls_embedding() {
        let storage = MemoryStorage::new();
        let story = story(&storage).await;

        let card = storage
            .upsert_card(CardUpsert::new(story.id, CardType::World, "Lore"))
            .await
            .expect("insert");
        storage
            .set_card_embedding(story.id, card.id, vec![1.0, 2.0])
            .await
            .expect("set embedding");

        let updated = storage
            .upsert_card(
                CardUpsert::new(story.id, CardType::World, "Lore")
                    .with_data(data(json!({"era": "third"}))),
            )
            .await
            .expect("merge");
        assert!(updated.embedding.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_leave_one_row() {
        let storage = std::sync::Arc::new(MemoryStorage::new());
        let story = story(&storage).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let storage = std::sync::Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                storage
                    .upsert_card(
                        CardUpsert::new(story.id, CardType::Character, "Mira")
                            .with_data(data(json!({ "traits": [format!("trait-{i}")] }))),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("upsert");
        }

        let all = storage
            .list_cards(story.id, &CardFilter::default())
            .await
            .expect("list");
        assert_eq!(all.len(), 1);
        // final data is the merge of every submitted payload
        assert_eq!(
            all[0].data["traits"].as_array().map(|a| a.len()),
            Some(8)
        );
    }

    #[tokio::test]
    async fn test_name_collision_across_types_is_distinct() {
        let storage = MemoryStorage::new();
        let story = story(&storage).await;

        storage
            .upsert_card(CardUpsert::new(story.id, CardType::Character, "Raven"))
            .await
            .expect("character");
        storage
            .upsert_card(CardUpsert::new(story.id, CardType::Item, "Raven"))
            .await
            .expect("item");

        let all = storage
            .list_cards(story.id, &CardFilter::default())
            .await
            .expect("list");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_message_sequence_is_gapless() {
        let storage = MemoryStorage::new();
        let story = story(&storage).await;

        for i in 0..4 {
            let role = if i % 2 == 0 {
                MessageRole::You
            } else {
                MessageRole::Dm
            };
            storage
                .append_message(story.id, role, &format!("msg {i}"), None)
                .await
                .expect("append");
        }

        let messages = storage.list_messages(story.id, None).await.expect("list");
        let sequences: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);

        let updated = storage.get_story(story.id).await.expect("get").expect("some");
        assert_eq!(updated.message_count, 4);
    }

    #[tokio::test]
    async fn test_relationship_importance_never_regresses() {
        let storage = MemoryStorage::new();
        let story = story(&storage).await;
        let a = CardId::new();
        let b = CardId::new();

        let first = storage
            .upsert_relationship(
                RelationshipDraft::new(story.id, a, b)
                    .with_importance(5)
                    .with_metrics(data(json!({"trust": 3}))),
            )
            .await
            .expect("insert");
        assert_eq!(first.importance, 5);

        let second = storage
            .upsert_relationship(
                RelationshipDraft::new(story.id, a, b)
                    .with_importance(1)
                    .with_metrics(data(json!({"fear": 2}))),
            )
            .await
            .expect("merge");

        assert_eq!(second.id, first.id);
        assert_eq!(second.importance, 5);
        assert_eq!(second.metrics["trust"], json!(3));
        assert_eq!(second.metrics["fear"], json!(2));
    }

    #[tokio::test]
    async fn test_stat_upsert_replaces() {
        let storage = MemoryStorage::new();
        let story = story(&storage).await;
        let card = CardId::new();

        storage
            .upsert_stat(StatDraft::new(story.id, card, "strength", json!(12)))
            .await
            .expect("insert");
        let replaced = storage
            .upsert_stat(
                StatDraft::new(story.id, card, "strength", json!(15)).with_confidence(0.5),
            )
            .await
            .expect("replace");

        assert_eq!(replaced.value, json!({"value": 15}));
        assert_eq!(replaced.confidence, 0.5);

        let stats = storage.list_stats(story.id).await.expect("list");
        assert_eq!(stats.len(), 1);
    }

    #[tokio::test]
    async fn test_nearest_memories_tie_break_on_importance() {
        let storage = MemoryStorage::new();
        let story = story(&storage).await;

        let drafts = vec![
            MemoryDraft::new(story.id, "minor detail").with_importance(1),
            MemoryDraft::new(story.id, "major revelation").with_importance(5),
        ];
        let memories = storage.insert_memories(drafts).await.expect("insert");
        for memory in &memories {
            storage
                .set_memory_embedding(story.id, memory.id, vec![1.0, 0.0])
                .await
                .expect("embed");
        }

        let ranked = storage
            .nearest_memories(story.id, &[1.0, 0.0], 10)
            .await
            .expect("search");
        assert_eq!(ranked[0].importance, 5);
        assert_eq!(ranked[1].importance, 1);
    }

    #[tokio::test]
    async fn test_delete_card_cascades() {
        let storage = MemoryStorage::new();
        let story = story(&storage).await;

        let mira = storage
            .upsert_card(CardUpsert::new(story.id, CardType::Character, "Mira"))
            .await
            .expect("card");
        let other = storage
            .upsert_card(CardUpsert::new(story.id, CardType::Character, "Bran"))
            .await
            .expect("card");

        storage
            .insert_memories(vec![
                MemoryDraft::new(story.id, "about mira").with_owner(Some(mira.id))
            ])
            .await
            .expect("memory");
        storage
            .upsert_stat(StatDraft::new(story.id, mira.id, "hp", json!(10)))
            .await
            .expect("stat");
        storage
            .upsert_relationship(RelationshipDraft::new(story.id, mira.id, other.id))
            .await
            .expect("relationship");

        storage.delete_card(story.id, mira.id).await.expect("delete");

        assert!(storage
            .list_memories(story.id, 10)
            .await
            .expect("memories")
            .is_empty());
        assert!(storage.list_stats(story.id).await.expect("stats").is_empty());
        assert!(storage
            .list_relationships_from(story.id, mira.id)
            .await
            .expect("rels")
            .is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_embedding_never_wins() {
        let storage = MemoryStorage::new();
        let story = story(&storage).await;

        let near = storage
            .upsert_card(CardUpsert::new(story.id, CardType::Item, "Near"))
            .await
            .expect("card");
        let weird = storage
            .upsert_card(CardUpsert::new(story.id, CardType::Item, "Weird"))
            .await
            .expect("card");
        storage
            .set_card_embedding(story.id, near.id, vec![0.0, 0.0])
            .await
            .expect("embed");
        storage
            .set_card_embedding(story.id, weird.id, vec![0.0])
            .await
            .expect("embed");

        let ranked = storage
            .nearest_cards(story.id, &[0.1, 0.1], 2)
            .await
            .expect("search");
        assert_eq!(ranked[0].name, "Near");
    }
}
