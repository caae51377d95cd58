//! Story lifecycle, ownership checks, and the transcript.

use super::WorldStore;
use crate::error::{EngineError, Result};
use crate::id::{StoryId, UserId};
use crate::model::{MessageRole, Story, StoryDraft, StoryMessage};
use crate::world;

impl WorldStore {
    /// Create a story and seed it with its world and beginning cards when
    /// the corresponding keys are set.
    pub async fn create_story(&self, draft: StoryDraft) -> Result<Story> {
        let story = self.storage.insert_story(draft).await?;

        if let Some(key) = story.world_key.as_deref() {
            if let Some(preset) = world::find_world(key) {
                self.upsert_card(preset.to_upsert(story.id)).await?;
            }
        }
        if let Some(key) = story.beginning_key.as_deref() {
            if let Some(beginning) = world::find_beginning(key) {
                self.upsert_card(beginning.to_upsert(story.id)).await?;
            }
        }

        Ok(story)
    }

    /// Verify the story exists and belongs to `user`.
    ///
    /// A missing story is NotFound; a story owned by someone else is
    /// Unauthorized. The two are deliberately distinct.
    pub async fn assert_story_ownership(&self, user: UserId, story: StoryId) -> Result<Story> {
        match self.storage.get_story(story).await? {
            None => Err(EngineError::not_found(format!("story {story}"))),
            Some(row) if row.user_id != user => Err(EngineError::Unauthorized(format!(
                "story {story} belongs to another user"
            ))),
            Some(row) => Ok(row),
        }
    }

    /// All stories for a user, most recently played first.
    pub async fn list_stories(&self, user: UserId) -> Result<Vec<Story>> {
        self.storage.list_stories(user).await
    }

    /// Delete a story and everything scoped to it.
    pub async fn delete_story(&self, user: UserId, story: StoryId) -> Result<()> {
        self.assert_story_ownership(user, story).await?;
        self.storage.delete_story(story).await
    }

    /// Clear the transcript, cards, and settings while keeping the story.
    pub async fn reset_story(&self, user: UserId, story: StoryId) -> Result<()> {
        self.assert_story_ownership(user, story).await?;
        self.storage.reset_story(story).await
    }

    /// Append a transcript message; the sequence number is allocated
    /// atomically by storage.
    pub async fn append_message(
        &self,
        story: StoryId,
        role: MessageRole,
        content: &str,
        image_url: Option<&str>,
    ) -> Result<StoryMessage> {
        self.storage
            .append_message(story, role, content, image_url)
            .await
    }

    /// The most recent `limit` messages, in sequence order.
    pub async fn recent_messages(&self, story: StoryId, limit: usize) -> Result<Vec<StoryMessage>> {
        self.storage.list_messages(story, Some(limit)).await
    }

    /// The full transcript, in sequence order.
    pub async fn all_messages(&self, story: StoryId) -> Result<Vec<StoryMessage>> {
        self.storage.list_messages(story, None).await
    }

    /// Render the transcript as the append-only log the narrator reads.
    pub async fn transcript(&self, story: StoryId) -> Result<String> {
        let messages = self.all_messages(story).await?;
        Ok(messages
            .iter()
            .map(|m| match m.role {
                MessageRole::Dm => format!("DM: {}", m.content),
                MessageRole::You => m.content.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
