//! Embedding cache maintenance and the vector context retriever.
//!
//! Writes schedule lazy refreshes through the queue; reads backfill
//! synchronously before searching, because retrieval must not return
//! stale or incomplete results. A single query embedding is shared across
//! all sub-searches.

use super::WorldStore;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::id::{CardId, MemoryId, RelationshipId, StoryId};
use crate::index;
use crate::model::{Card, Memory, Relationship, Stat};
use crate::storage::Storage;

/// Limits for one retrieval.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub card_limit: usize,
    pub memory_limit: usize,
    pub relationship_limit: usize,
    pub include_stats: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            card_limit: 6,
            memory_limit: 6,
            relationship_limit: 4,
            include_stats: true,
        }
    }
}

/// Ranked snapshot of world state relevant to one query.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    pub cards: Vec<Card>,
    pub memories: Vec<Memory>,
    pub relationships: Vec<Relationship>,
    /// Stats are not vector-searched: all of them are always visible.
    pub stats: Vec<Stat>,
}

impl WorldStore {
    /// Retrieve the story context most relevant to `query`.
    ///
    /// Missing embeddings are backfilled inline before each search; if the
    /// embedding provider fails, the whole retrieval fails. Every memory
    /// returned is touched, since retrieval itself is a relevance signal.
    pub async fn retrieve_context(
        &self,
        story: StoryId,
        query: &str,
        options: &ContextOptions,
    ) -> Result<ContextSnapshot> {
        let query_embedding = self.embedder.embed(query).await?;
        self.ensure_vector_cache(story).await?;

        let (cards, memories, relationships) = futures::try_join!(
            self.storage
                .nearest_cards(story, &query_embedding, options.card_limit),
            self.storage
                .nearest_memories(story, &query_embedding, options.memory_limit),
            self.storage
                .nearest_relationships(story, &query_embedding, options.relationship_limit),
        )?;

        let stats = if options.include_stats {
            self.storage.list_stats(story).await?
        } else {
            Vec::new()
        };

        let touched: Vec<MemoryId> = memories.iter().map(|m| m.id).collect();
        self.touch_memories(story, &touched).await;

        tracing::debug!(
            %story,
            cards = cards.len(),
            memories = memories.len(),
            relationships = relationships.len(),
            stats = stats.len(),
            "retrieved context"
        );

        Ok(ContextSnapshot {
            cards,
            memories,
            relationships,
            stats,
        })
    }

    /// Synchronously backfill every missing embedding in the story.
    pub async fn ensure_vector_cache(&self, story: StoryId) -> Result<()> {
        ensure_card_embeddings(self.storage.as_ref(), self.embedder.as_ref(), story).await?;
        ensure_memory_embeddings(self.storage.as_ref(), self.embedder.as_ref(), story).await?;
        ensure_relationship_embeddings(self.storage.as_ref(), self.embedder.as_ref(), story)
            .await?;
        Ok(())
    }

    /// Null every cached embedding in the story, forcing a full re-index on
    /// the next read.
    pub async fn invalidate_story_embeddings(&self, story: StoryId) -> Result<()> {
        self.storage.clear_story_embeddings(story).await
    }
}

pub(super) async fn ensure_card_embeddings(
    storage: &dyn Storage,
    embedder: &dyn EmbeddingProvider,
    story: StoryId,
) -> Result<()> {
    for card in storage.cards_missing_embedding(story).await? {
        let embedding = embedder.embed(&index::card_document(&card)).await?;
        storage.set_card_embedding(story, card.id, embedding).await?;
    }
    Ok(())
}

pub(super) async fn refresh_card_embedding(
    storage: &dyn Storage,
    embedder: &dyn EmbeddingProvider,
    story: StoryId,
    id: CardId,
) -> Result<()> {
    let Some(card) = storage.get_card(story, id).await? else {
        return Ok(());
    };
    let embedding = embedder.embed(&index::card_document(&card)).await?;
    storage.set_card_embedding(story, id, embedding).await
}

pub(super) async fn ensure_memory_embeddings(
    storage: &dyn Storage,
    embedder: &dyn EmbeddingProvider,
    story: StoryId,
) -> Result<()> {
    for memory in storage.memories_missing_embedding(story).await? {
        let embedding = embedder.embed(&index::memory_document(&memory)).await?;
        storage
            .set_memory_embedding(story, memory.id, embedding)
            .await?;
    }
    Ok(())
}

pub(super) async fn refresh_memory_embedding(
    storage: &dyn Storage,
    embedder: &dyn EmbeddingProvider,
    story: StoryId,
    id: MemoryId,
) -> Result<()> {
    let Some(memory) = storage.get_memory(story, id).await? else {
        return Ok(());
    };
    let embedding = embedder.embed(&index::memory_document(&memory)).await?;
    storage.set_memory_embedding(story, id, embedding).await
}

pub(super) async fn ensure_relationship_embeddings(
    storage: &dyn Storage,
    embedder: &dyn EmbeddingProvider,
    story: StoryId,
) -> Result<()> {
    for relationship in storage.relationships_missing_embedding(story).await? {
        let embedding = embedder
            .embed(&index::relationship_document(&relationship))
            .await?;
        storage
            .set_relationship_embedding(story, relationship.id, embedding)
            .await?;
    }
    Ok(())
}

pub(super) async fn refresh_relationship_embedding(
    storage: &dyn Storage,
    embedder: &dyn EmbeddingProvider,
    story: StoryId,
    id: RelationshipId,
) -> Result<()> {
    let Some(relationship) = storage.get_relationship(story, id).await? else {
        return Ok(());
    };
    let embedding = embedder
        .embed(&index::relationship_document(&relationship))
        .await?;
    storage.set_relationship_embedding(story, id, embedding).await
}
