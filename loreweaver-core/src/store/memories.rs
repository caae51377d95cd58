//! Memory, relationship, and stat operations.

use super::vector;
use super::WorldStore;
use crate::error::{EngineError, Result};
use crate::id::{CardId, MemoryId, RelationshipId, StoryId};
use crate::model::{Memory, MemoryDraft, Relationship, RelationshipDraft, Stat, StatDraft};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

impl WorldStore {
    /// Record a single memory and schedule its embedding.
    pub async fn record_memory(&self, draft: MemoryDraft) -> Result<Memory> {
        let story_id = draft.story_id;
        let memory = self
            .storage
            .insert_memories(vec![draft])
            .await?
            .pop()
            .ok_or_else(|| EngineError::Storage("memory insert returned nothing".to_string()))?;
        self.enqueue_memory_refresh(story_id, memory.id);
        Ok(memory)
    }

    /// Record a batch of memories; enqueues a targeted refresh per memory
    /// plus one backfill sweep per touched story.
    pub async fn record_memories(&self, drafts: Vec<MemoryDraft>) -> Result<Vec<Memory>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        let memories = self.storage.insert_memories(drafts).await?;

        let mut stories = HashSet::new();
        for memory in &memories {
            stories.insert(memory.story_id);
            self.enqueue_memory_refresh(memory.story_id, memory.id);
        }
        for story in stories {
            self.enqueue_memory_sweep(story);
        }
        Ok(memories)
    }

    /// Recent memories for the story, newest first.
    pub async fn list_memories(&self, story: StoryId, limit: usize) -> Result<Vec<Memory>> {
        self.storage.list_memories(story, limit).await
    }

    /// Best-effort bulk last-accessed update. Retrieval calls this for
    /// every memory it returns; a failure only costs a recency signal, so
    /// it is logged and swallowed.
    pub async fn touch_memories(&self, story: StoryId, ids: &[MemoryId]) {
        if ids.is_empty() {
            return;
        }
        if let Err(error) = self.storage.touch_memories(story, ids, Utc::now()).await {
            tracing::debug!(%story, %error, "touch_memories failed");
        }
    }

    /// Replace-on-conflict stat upsert by (story, character, key).
    pub async fn upsert_stat(&self, draft: StatDraft) -> Result<Stat> {
        self.storage.upsert_stat(draft).await
    }

    /// All stats for one character, most recently updated first.
    pub async fn list_stats_for_character(
        &self,
        story: StoryId,
        card: CardId,
    ) -> Result<Vec<Stat>> {
        self.storage.list_stats_for_character(story, card).await
    }

    /// Merge-metrics, max-importance relationship upsert; schedules
    /// re-embedding of the edge.
    pub async fn upsert_relationship(&self, draft: RelationshipDraft) -> Result<Relationship> {
        let story_id = draft.story_id;
        let relationship = self.storage.upsert_relationship(draft).await?;
        self.enqueue_relationship_refresh(story_id, relationship.id);
        Ok(relationship)
    }

    /// Outgoing edges for a character, most recently updated first.
    pub async fn list_relationships_from(
        &self,
        story: StoryId,
        card: CardId,
    ) -> Result<Vec<Relationship>> {
        self.storage.list_relationships_from(story, card).await
    }

    /// Incoming edges for a character, most recently updated first.
    pub async fn list_relationships_to(
        &self,
        story: StoryId,
        card: CardId,
    ) -> Result<Vec<Relationship>> {
        self.storage.list_relationships_to(story, card).await
    }

    pub(super) fn enqueue_memory_sweep(&self, story: StoryId) {
        let storage = Arc::clone(&self.storage);
        let embedder = Arc::clone(&self.embedder);
        self.queue.enqueue(format!("memories:{story}"), async move {
            vector::ensure_memory_embeddings(storage.as_ref(), embedder.as_ref(), story).await
        });
    }

    fn enqueue_memory_refresh(&self, story: StoryId, id: MemoryId) {
        let storage = Arc::clone(&self.storage);
        let embedder = Arc::clone(&self.embedder);
        self.queue.enqueue(format!("memory:{id}"), async move {
            vector::refresh_memory_embedding(storage.as_ref(), embedder.as_ref(), story, id).await
        });
    }

    fn enqueue_relationship_refresh(&self, story: StoryId, id: RelationshipId) {
        let storage = Arc::clone(&self.storage);
        let embedder = Arc::clone(&self.embedder);
        self.queue
            .enqueue(format!("relationship:{id}"), async move {
                vector::refresh_relationship_embedding(
                    storage.as_ref(),
                    embedder.as_ref(),
                    story,
                    id,
                )
                .await
            });
    }
}
