//! Data model for stories and their world state.
//!
//! A story owns cards, memories, relationships, stats, settings, and
//! transcript messages; deleting the story cascades to all of them. Cards
//! are the mergeable world entities; everything else references cards by id.

use crate::id::{CardId, MemoryId, MessageId, RelationshipId, StatId, StoryId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Root aggregate for one play-through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub user_id: UserId,
    pub title: String,
    pub beginning_key: Option<String>,
    pub world_key: Option<String>,
    pub character_name: Option<String>,
    pub character_gender: Option<String>,
    pub character_race: Option<String>,
    /// Denormalized transcript length.
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_played_at: DateTime<Utc>,
}

/// Input for creating a story.
#[derive(Debug, Clone)]
pub struct StoryDraft {
    pub user_id: UserId,
    pub title: String,
    pub beginning_key: Option<String>,
    pub world_key: Option<String>,
    pub character_name: Option<String>,
    pub character_gender: Option<String>,
    pub character_race: Option<String>,
}

impl StoryDraft {
    pub fn new(user_id: UserId, title: impl Into<String>) -> Self {
        Self {
            user_id,
            title: title.into(),
            beginning_key: None,
            world_key: None,
            character_name: None,
            character_gender: None,
            character_race: None,
        }
    }

    pub fn with_beginning(mut self, key: impl Into<String>) -> Self {
        self.beginning_key = Some(key.into());
        self
    }

    pub fn with_world(mut self, key: impl Into<String>) -> Self {
        self.world_key = Some(key.into());
        self
    }

    pub fn with_character_name(mut self, name: impl Into<String>) -> Self {
        self.character_name = Some(name.into());
        self
    }
}

/// The kind of world entity a card represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardType {
    Story,
    Character,
    Environment,
    Item,
    Faction,
    Quest,
    World,
    Beginning,
}

impl CardType {
    /// All card types, in display order.
    pub const ALL: [CardType; 8] = [
        CardType::Story,
        CardType::Character,
        CardType::Environment,
        CardType::Item,
        CardType::Faction,
        CardType::Quest,
        CardType::World,
        CardType::Beginning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CardType::Story => "story",
            CardType::Character => "character",
            CardType::Environment => "environment",
            CardType::Item => "item",
            CardType::Faction => "faction",
            CardType::Quest => "quest",
            CardType::World => "world",
            CardType::Beginning => "beginning",
        }
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, named, mergeable world entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub story_id: StoryId,
    pub card_type: CardType,
    pub name: String,
    pub description: Option<String>,
    /// Free-form attribute bag, deep-merged on every upsert.
    pub data: Map<String, Value>,
    /// Cached embedding; nulled on every mutation to force lazy recompute.
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    /// Render the card without its embedding, for tool results and prompts.
    pub fn summary_json(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "type": self.card_type,
            "name": self.name,
            "description": self.description,
            "data": self.data,
        })
    }
}

/// Input for card upsert: looked up by (story, type, name); merged on hit.
#[derive(Debug, Clone)]
pub struct CardUpsert {
    pub story_id: StoryId,
    pub card_type: CardType,
    pub name: String,
    pub description: Option<String>,
    pub data: Option<Map<String, Value>>,
}

impl CardUpsert {
    pub fn new(story_id: StoryId, card_type: CardType, name: impl Into<String>) -> Self {
        Self {
            story_id,
            card_type,
            name: name.into(),
            description: None,
            data: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }
}

/// Filter for card listing.
#[derive(Debug, Clone, Default)]
pub struct CardFilter {
    pub card_type: Option<CardType>,
    /// Case-insensitive substring of the card name.
    pub name: Option<String>,
}

/// Typed view over a character card's data bag.
///
/// The engine only interprets a handful of keys; everything else the model
/// invents rides along in `extra` and survives merges untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterSheet {
    #[serde(default)]
    pub is_player_character: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub revealed_traits: Vec<String>,
    #[serde(default)]
    pub backstory: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CharacterSheet {
    /// Parse the sheet out of a card's data bag. Unknown shapes for the
    /// known keys degrade to defaults rather than failing.
    pub fn from_data(data: &Map<String, Value>) -> Self {
        serde_json::from_value(Value::Object(data.clone())).unwrap_or_else(|_| CharacterSheet {
            extra: data.clone(),
            ..CharacterSheet::default()
        })
    }
}

/// Where a memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    Player,
    Dm,
    Npc,
    #[default]
    System,
    World,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::Player => "player",
            MemorySource::Dm => "dm",
            MemorySource::Npc => "npc",
            MemorySource::System => "system",
            MemorySource::World => "world",
        }
    }
}

/// An immutable fact about the world, used for retrieval-augmented
/// narration. Content is never edited after creation; retrieval only
/// touches `last_accessed_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub story_id: StoryId,
    pub owner_card_id: Option<CardId>,
    pub subject_card_id: Option<CardId>,
    pub source_message_id: Option<MessageId>,
    pub source: MemorySource,
    /// One-sentence summary of the fact.
    pub summary: String,
    pub context: Map<String, Value>,
    pub tags: Vec<String>,
    pub importance: i32,
    pub decay_factor: f64,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

/// Input for recording a memory.
#[derive(Debug, Clone)]
pub struct MemoryDraft {
    pub story_id: StoryId,
    pub summary: String,
    pub source: MemorySource,
    pub owner_card_id: Option<CardId>,
    pub subject_card_id: Option<CardId>,
    pub source_message_id: Option<MessageId>,
    pub context: Map<String, Value>,
    pub tags: Vec<String>,
    pub importance: i32,
    pub decay_factor: f64,
}

impl MemoryDraft {
    pub fn new(story_id: StoryId, summary: impl Into<String>) -> Self {
        Self {
            story_id,
            summary: summary.into(),
            source: MemorySource::System,
            owner_card_id: None,
            subject_card_id: None,
            source_message_id: None,
            context: Map::new(),
            tags: Vec::new(),
            importance: 1,
            decay_factor: 1.0,
        }
    }

    pub fn with_source(mut self, source: MemorySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_owner(mut self, owner: Option<CardId>) -> Self {
        self.owner_card_id = owner;
        self
    }

    pub fn with_subject(mut self, subject: Option<CardId>) -> Self {
        self.subject_card_id = subject;
        self
    }

    pub fn with_source_message(mut self, message: MessageId) -> Self {
        self.source_message_id = Some(message);
        self
    }

    pub fn with_importance(mut self, importance: i32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

/// A directed edge between two character cards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub story_id: StoryId,
    pub source_card_id: CardId,
    pub target_card_id: CardId,
    pub summary: Option<String>,
    /// Free-form numeric/qualitative metrics, shallow-merged on upsert.
    pub metrics: Map<String, Value>,
    /// Never decreases across upserts.
    pub importance: i32,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for relationship upsert, keyed by (story, source, target).
#[derive(Debug, Clone)]
pub struct RelationshipDraft {
    pub story_id: StoryId,
    pub source_card_id: CardId,
    pub target_card_id: CardId,
    pub summary: Option<String>,
    pub metrics: Map<String, Value>,
    pub importance: i32,
}

impl RelationshipDraft {
    pub fn new(story_id: StoryId, source: CardId, target: CardId) -> Self {
        Self {
            story_id,
            source_card_id: source,
            target_card_id: target,
            summary: None,
            metrics: Map::new(),
            importance: 1,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_metrics(mut self, metrics: Map<String, Value>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_importance(mut self, importance: i32) -> Self {
        self.importance = importance;
        self
    }
}

/// A scoped key/value fact about one character card. Last write wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    pub id: StatId,
    pub story_id: StoryId,
    pub character_card_id: CardId,
    pub key: String,
    pub value: Value,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for stat upsert, keyed by (story, character, key).
#[derive(Debug, Clone)]
pub struct StatDraft {
    pub story_id: StoryId,
    pub character_card_id: CardId,
    pub key: String,
    pub value: Value,
    pub confidence: f64,
}

impl StatDraft {
    pub fn new(
        story_id: StoryId,
        character_card_id: CardId,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            story_id,
            character_card_id,
            key: key.into(),
            // scalars are wrapped so the stored value is always an object
            value: wrap_stat_value(value),
            confidence: 1.0,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

fn wrap_stat_value(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => serde_json::json!({ "value": other }),
    }
}

/// Who wrote a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Dm,
    You,
}

/// One transcript entry, strictly ordered by per-story sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryMessage {
    pub id: MessageId,
    pub story_id: StoryId,
    pub role: MessageRole,
    pub content: String,
    pub image_url: Option<String>,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

/// Narrative tone knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Dark,
    #[default]
    Heroic,
    Whimsical,
}

/// Difficulty knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
}

/// Narrative style knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeStyle {
    #[default]
    Cinematic,
    Gritty,
    Mystical,
}

/// Per-story Game Master settings, defaulted if absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmSettings {
    pub tone: Tone,
    pub difficulty: Difficulty,
    pub narrative_style: NarrativeStyle,
}

/// Partial settings update; absent fields keep their current value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmSettingsUpdate {
    pub tone: Option<Tone>,
    pub difficulty: Option<Difficulty>,
    pub narrative_style: Option<NarrativeStyle>,
}

impl GmSettings {
    /// Apply a partial update, returning the merged settings.
    pub fn apply(mut self, update: GmSettingsUpdate) -> Self {
        if let Some(tone) = update.tone {
            self.tone = tone;
        }
        if let Some(difficulty) = update.difficulty {
            self.difficulty = difficulty;
        }
        if let Some(style) = update.narrative_style {
            self.narrative_style = style;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_card_type_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&CardType::Character).expect("serializes"),
            "\"character\""
        );
        let parsed: CardType = serde_json::from_str("\"world\"").expect("parses");
        assert_eq!(parsed, CardType::World);
    }

    #[test]
    fn test_character_sheet_from_data() {
        let data = sheet_data(json!({
            "isPlayerCharacter": true,
            "aliases": ["The Witch"],
            "mood": "wary"
        }));
        let sheet = CharacterSheet::from_data(&data);
        assert!(sheet.is_player_character);
        assert_eq!(sheet.aliases, vec!["The Witch".to_string()]);
        assert_eq!(sheet.extra.get("mood"), Some(&json!("wary")));
    }

    #[test]
    fn test_character_sheet_tolerates_junk() {
        let data = sheet_data(json!({"aliases": "not-an-array"}));
        let sheet = CharacterSheet::from_data(&data);
        assert!(sheet.aliases.is_empty());
        assert!(!sheet.is_player_character);
    }

    #[test]
    fn test_stat_scalar_wrapping() {
        let draft = StatDraft::new(StoryId::new(), CardId::new(), "strength", json!(17));
        assert_eq!(draft.value, json!({"value": 17}));

        let draft = StatDraft::new(StoryId::new(), CardId::new(), "hp", json!({"cur": 9}));
        assert_eq!(draft.value, json!({"cur": 9}));
    }

    #[test]
    fn test_settings_apply_partial() {
        let settings = GmSettings::default();
        let updated = settings.apply(GmSettingsUpdate {
            tone: Some(Tone::Dark),
            ..GmSettingsUpdate::default()
        });
        assert_eq!(updated.tone, Tone::Dark);
        assert_eq!(updated.difficulty, Difficulty::Normal);
        assert_eq!(updated.narrative_style, NarrativeStyle::Cinematic);
    }

    fn sheet_data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }
}
