//! Per-story Game Master settings, defaulted if absent.

use super::WorldStore;
use crate::error::Result;
use crate::id::StoryId;
use crate::model::{GmSettings, GmSettingsUpdate};

impl WorldStore {
    /// Settings for the story, inserting the defaults on first read.
    pub async fn get_settings(&self, story: StoryId) -> Result<GmSettings> {
        match self.storage.get_settings(story).await? {
            Some(settings) => Ok(settings),
            None => {
                let defaults = GmSettings::default();
                self.storage.put_settings(story, defaults).await?;
                Ok(defaults)
            }
        }
    }

    /// Apply a partial update over the current settings.
    pub async fn update_settings(
        &self,
        story: StoryId,
        update: GmSettingsUpdate,
    ) -> Result<GmSettings> {
        let next = self.get_settings(story).await?.apply(update);
        self.storage.put_settings(story, next).await?;
        Ok(next)
    }
}
