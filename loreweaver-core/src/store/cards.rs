//! Card operations: upsert-with-merge plus embedding refresh scheduling.

use super::vector;
use super::WorldStore;
use crate::error::Result;
use crate::id::{CardId, StoryId};
use crate::model::{Card, CardFilter, CardType, CardUpsert};
use std::sync::Arc;

impl WorldStore {
    /// Upsert a card by (story, type, name) and schedule re-embedding.
    ///
    /// Two refresh tasks are enqueued: a story-wide backfill sweep (many
    /// upserts in one turn coalesce into one sweep) and a targeted refresh
    /// for this card.
    pub async fn upsert_card(&self, input: CardUpsert) -> Result<Card> {
        let story_id = input.story_id;
        let card = self.storage.upsert_card(input).await?;
        self.enqueue_card_sweep(story_id);
        self.enqueue_card_refresh(story_id, card.id);
        Ok(card)
    }

    /// All cards in the story.
    pub async fn get_cards(&self, story: StoryId) -> Result<Vec<Card>> {
        self.storage.list_cards(story, &CardFilter::default()).await
    }

    /// Exact lookup by (type, name).
    pub async fn get_card_by_name(
        &self,
        story: StoryId,
        card_type: CardType,
        name: &str,
    ) -> Result<Option<Card>> {
        self.storage.get_card_by_name(story, card_type, name).await
    }

    /// Cards filtered by type and/or case-insensitive substring of name.
    pub async fn list_cards(&self, story: StoryId, filter: &CardFilter) -> Result<Vec<Card>> {
        self.storage.list_cards(story, filter).await
    }

    /// Delete a card; dependent memories, stats, and relationships go with
    /// it.
    pub async fn delete_card(&self, story: StoryId, id: CardId) -> Result<()> {
        self.storage.delete_card(story, id).await
    }

    pub(super) fn enqueue_card_sweep(&self, story: StoryId) {
        let storage = Arc::clone(&self.storage);
        let embedder = Arc::clone(&self.embedder);
        self.queue.enqueue(format!("cards:{story}"), async move {
            vector::ensure_card_embeddings(storage.as_ref(), embedder.as_ref(), story).await
        });
    }

    pub(super) fn enqueue_card_refresh(&self, story: StoryId, id: CardId) {
        let storage = Arc::clone(&self.storage);
        let embedder = Arc::clone(&self.embedder);
        self.queue.enqueue(format!("card:{id}"), async move {
            vector::refresh_card_embedding(storage.as_ref(), embedder.as_ref(), story, id).await
        });
    }
}
