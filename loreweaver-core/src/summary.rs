//! Story summary reconciler.
//!
//! Condenses a long transcript into a durable summary card plus a batch of
//! memory/character/relationship mutations via a schema-constrained LLM
//! call. Every id the model references is reconciled against the live card
//! set before anything is applied, so fabricated foreign keys never reach
//! storage. Parse failures are retried with the error fed back into the
//! conversation so the model can self-correct.

use crate::agent::{tail_chars, GameMaster};
use crate::error::{EngineError, Result};
use crate::id::{CardId, MemoryId, RelationshipId, StoryId};
use crate::model::{Card, CardType, CardUpsert, MemoryDraft, MemorySource, RelationshipDraft};
use crate::resolve::{normalize_card_type, resolve_in, EntityRef};
use chrono::Utc;
use claude::{Message, Request, Tool, ToolChoice};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Name of the singleton summary card when no label is supplied.
pub const DEFAULT_SUMMARY_LABEL: &str = "Long-Term Summary";

const SUMMARY_TOOL: &str = "StorySummary";
const MAX_ATTEMPTS: usize = 3;
const TRANSCRIPT_WINDOW: usize = 20_000;

/// One durable takeaway from the transcript.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPayload {
    pub summary: String,
    #[serde(default)]
    pub source_type: Option<MemorySource>,
    #[serde(default)]
    pub owner_card_id: Option<String>,
    #[serde(default)]
    pub owner_card_name: Option<String>,
    #[serde(default)]
    pub owner_card_type: Option<String>,
    #[serde(default)]
    pub subject_card_id: Option<String>,
    #[serde(default)]
    pub subject_card_name: Option<String>,
    #[serde(default)]
    pub subject_card_type: Option<String>,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

/// A merge-only patch to a character card.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterUpdatePayload {
    #[serde(default)]
    pub character_id: Option<String>,
    #[serde(default)]
    pub character_name: Option<String>,
    #[serde(default)]
    pub character_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data_patch: Option<Map<String, Value>>,
}

/// A trust/rivalry change between two characters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipUpdatePayload {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub metrics: Option<Map<String, Value>>,
    #[serde(default)]
    pub importance: Option<f64>,
}

/// The structured output the archivist model must produce.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryPayload {
    pub summary: String,
    #[serde(default)]
    pub summary_label: Option<String>,
    #[serde(default)]
    pub memories: Option<Vec<MemoryPayload>>,
    #[serde(default)]
    pub character_updates: Option<Vec<CharacterUpdatePayload>>,
    #[serde(default)]
    pub relationship_updates: Option<Vec<RelationshipUpdatePayload>>,
}

/// What a summarization run changed.
#[derive(Debug, Clone)]
pub struct SummaryReport {
    pub summary: String,
    pub summary_card_id: CardId,
    pub memory_ids: Vec<MemoryId>,
    pub character_ids: Vec<CardId>,
    pub relationship_ids: Vec<RelationshipId>,
}

/// JSON schema for the forced summary tool.
pub fn summary_schema() -> Value {
    let card_types = json!(["story", "character", "environment", "item", "faction", "quest", "world"]);
    let sources = json!(["player", "dm", "npc", "system", "world"]);
    json!({
        "type": "object",
        "properties": {
            "summary": {
                "type": "string",
                "description": "Concise recap of recent events. Focus on irreversible changes, promises, and emotional beats."
            },
            "summaryLabel": {
                "type": "string",
                "maxLength": 120,
                "description": "Custom label for the summary card (defaults to Long-Term Summary)."
            },
            "memories": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "summary": { "type": "string" },
                        "sourceType": { "type": "string", "enum": sources },
                        "ownerCardId": { "type": "string" },
                        "ownerCardName": { "type": "string" },
                        "ownerCardType": { "type": "string", "enum": card_types.clone() },
                        "subjectCardId": { "type": "string" },
                        "subjectCardName": { "type": "string" },
                        "subjectCardType": { "type": "string", "enum": card_types.clone() },
                        "importance": { "type": "number", "minimum": 0, "maximum": 5 },
                        "tags": { "type": "array", "items": { "type": "string" } },
                        "context": { "type": "object" }
                    },
                    "required": ["summary"]
                }
            },
            "characterUpdates": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "characterId": { "type": "string" },
                        "characterName": { "type": "string" },
                        "characterType": { "type": "string", "enum": card_types },
                        "description": { "type": "string" },
                        "dataPatch": {
                            "type": "object",
                            "description": "Merge-only patch into the character's data object."
                        }
                    }
                }
            },
            "relationshipUpdates": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "sourceId": { "type": "string" },
                        "sourceName": { "type": "string" },
                        "targetId": { "type": "string" },
                        "targetName": { "type": "string" },
                        "summary": { "type": "string" },
                        "metrics": { "type": "object" },
                        "importance": { "type": "number", "minimum": 0, "maximum": 5 }
                    }
                }
            }
        },
        "required": ["summary"]
    })
}

/// Drop or re-derive every id the model referenced that does not belong to
/// a live card, and backfill names for the ids that do.
pub fn reconcile_payload(mut payload: SummaryPayload, cards: &[Card]) -> SummaryPayload {
    let card_by_id = |raw: &str| -> Option<&Card> {
        let uuid = Uuid::parse_str(raw).ok()?;
        let id = CardId::from_uuid(uuid);
        cards.iter().find(|c| c.id == id)
    };
    let is_character_id = |raw: &str| -> bool {
        card_by_id(raw)
            .map(|c| c.card_type == CardType::Character)
            .unwrap_or(false)
    };

    if let Some(memories) = payload.memories.as_mut() {
        for memory in memories.iter_mut() {
            if let Some(raw) = memory.owner_card_id.clone() {
                match card_by_id(&raw) {
                    Some(card) => {
                        memory.owner_card_name.get_or_insert_with(|| card.name.clone());
                        memory
                            .owner_card_type
                            .get_or_insert_with(|| card.card_type.to_string());
                    }
                    None => memory.owner_card_id = None,
                }
            }
            if let Some(raw) = memory.subject_card_id.clone() {
                match card_by_id(&raw) {
                    Some(card) => {
                        memory
                            .subject_card_name
                            .get_or_insert_with(|| card.name.clone());
                        memory
                            .subject_card_type
                            .get_or_insert_with(|| card.card_type.to_string());
                    }
                    None => memory.subject_card_id = None,
                }
            }
        }
    }

    if let Some(updates) = payload.character_updates.as_mut() {
        for update in updates.iter_mut() {
            if let Some(raw) = update.character_id.clone() {
                if is_character_id(&raw) {
                    if let Some(card) = card_by_id(&raw) {
                        update.character_name.get_or_insert_with(|| card.name.clone());
                    }
                } else {
                    update.character_id = None;
                }
            }
            update.character_type = Some("character".to_string());
        }
    }

    if let Some(updates) = payload.relationship_updates.as_mut() {
        for update in updates.iter_mut() {
            if let Some(raw) = update.source_id.clone() {
                if is_character_id(&raw) {
                    if let Some(card) = card_by_id(&raw) {
                        update.source_name.get_or_insert_with(|| card.name.clone());
                    }
                } else {
                    update.source_id = None;
                }
            }
            if let Some(raw) = update.target_id.clone() {
                if is_character_id(&raw) {
                    if let Some(card) = card_by_id(&raw) {
                        update.target_name.get_or_insert_with(|| card.name.clone());
                    }
                } else {
                    update.target_id = None;
                }
            }
        }
    }

    payload
}

impl GameMaster {
    /// Summarize the story so far and fold the result back into world
    /// state.
    pub async fn summarize(&self, story: StoryId, model: Option<&str>) -> Result<SummaryReport> {
        let transcript = self.store().transcript(story).await?;
        let cards = self.store().get_cards(story).await?;

        let characters: Vec<Value> = cards
            .iter()
            .filter(|c| c.card_type == CardType::Character)
            .map(|c| {
                json!({
                    "id": c.id,
                    "name": c.name,
                    "description": c.description.as_deref().unwrap_or(""),
                    "data": c.data,
                })
            })
            .collect();

        let system = "You are a campaign archivist. Produce a structured summary of recent \
                      events. Capture key facts as memories, note character sheet updates, and \
                      refresh relationships. Only output JSON matching the requested schema.";
        let characters_json = Value::Array(characters).to_string();
        let instructions = [
            "Transcript (truncated to recent events):",
            tail_chars(&transcript, TRANSCRIPT_WINDOW),
            "\nKnown characters:",
            characters_json.as_str(),
            "\nInstructions:",
            "- summary: concise narrative recap in a few sentences.",
            "- summaryLabel: optional custom title (e.g., 'Chapter 3 Recap').",
            "- memories: list durable takeaways; include sourceType/owners when helpful.",
            "- characterUpdates: merge-only patches reflecting new info or newly introduced characters (omit unchanged fields).",
            "- relationshipUpdates: describe trust/rivalry changes with optional metrics.",
            "- For any *Id field, only use ids from the Known characters list, never invent one. If the id is unknown, leave it out and rely on the name/type fields.",
            "- Arrays must contain only well-formed objects that match the schema.",
        ]
        .join("\n");

        let mut messages = vec![Message::user(instructions)];
        let mut last_error: Option<EngineError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let mut request = Request::new(messages.clone())
                .with_system(system)
                .with_max_tokens(4096)
                .with_temperature(0.2)
                .with_tools(vec![Tool {
                    name: SUMMARY_TOOL.to_string(),
                    description: "Record the structured story summary.".to_string(),
                    input_schema: summary_schema(),
                }])
                .with_tool_choice(ToolChoice::Tool {
                    name: SUMMARY_TOOL.to_string(),
                });
            if let Some(model) = model {
                request = request.with_model(model);
            }

            let response = self.chat().complete(request).await?;
            let parsed = response
                .tool_uses()
                .into_iter()
                .find(|t| t.name == SUMMARY_TOOL)
                .ok_or_else(|| {
                    EngineError::Validation("no structured summary in response".to_string())
                })
                .and_then(|t| {
                    serde_json::from_value::<SummaryPayload>(t.input)
                        .map_err(|e| EngineError::Validation(e.to_string()))
                });

            match parsed {
                Ok(payload) => {
                    let payload = reconcile_payload(payload, &cards);
                    return self.apply_summary(story, payload, cards).await;
                }
                Err(error) => {
                    tracing::warn!(%story, attempt, %error, "structured summary parse failed");
                    messages.push(Message::user(format!(
                        "Your previous response failed to parse:\n{error}\nResubmit ONLY valid \
                         JSON that conforms exactly to the schema. Every entry in \
                         memories/characterUpdates/relationshipUpdates must be an object."
                    )));
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EngineError::Validation("failed to obtain structured summary".to_string())
        }))
    }

    async fn apply_summary(
        &self,
        story: StoryId,
        payload: SummaryPayload,
        mut cards: Vec<Card>,
    ) -> Result<SummaryReport> {
        let label = payload
            .summary_label
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SUMMARY_LABEL)
            .to_string();

        // the merge appends the new entry to the card's summaries history
        let recorded_at = Utc::now().to_rfc3339();
        let mut data = Map::new();
        data.insert(
            "summaries".to_string(),
            json!([{ "summary": payload.summary.clone(), "recordedAt": recorded_at.clone() }]),
        );
        data.insert("lastUpdatedAt".to_string(), json!(recorded_at));

        let existing = self
            .store()
            .get_card_by_name(story, CardType::Story, &label)
            .await?;
        let mut upsert = CardUpsert::new(story, CardType::Story, label).with_data(data);
        if existing.is_none() {
            upsert = upsert.with_description("Condensed history of the ongoing adventure.");
        }
        let summary_card = self.store().upsert_card(upsert).await?;

        // memories, with owner/subject resolved against the live card set
        let mut drafts = Vec::new();
        for memory in payload.memories.unwrap_or_default() {
            let owner = EntityRef::from_parts(
                memory.owner_card_id.as_deref(),
                memory.owner_card_name.as_deref(),
                normalize_card_type(memory.owner_card_type.as_deref())
                    .or(Some(CardType::Character)),
            );
            let subject = EntityRef::from_parts(
                memory.subject_card_id.as_deref(),
                memory.subject_card_name.as_deref(),
                normalize_card_type(memory.subject_card_type.as_deref())
                    .or(Some(CardType::Character)),
            );
            drafts.push(
                MemoryDraft::new(story, memory.summary)
                    .with_source(memory.source_type.unwrap_or_default())
                    .with_owner(owner.and_then(|r| resolve_in(&cards, &r)))
                    .with_subject(subject.and_then(|r| resolve_in(&cards, &r)))
                    .with_importance(memory.importance.map(|v| v.round() as i32).unwrap_or(1))
                    .with_tags(memory.tags.unwrap_or_default())
                    .with_context(memory.context.unwrap_or_default()),
            );
        }
        let memory_ids = self
            .store()
            .record_memories(drafts)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();

        // character updates: merge patches into resolved cards, create the
        // genuinely new ones
        let mut character_ids = Vec::new();
        for update in payload.character_updates.unwrap_or_default() {
            let card_type =
                normalize_card_type(update.character_type.as_deref()).unwrap_or(CardType::Character);
            let resolved = EntityRef::from_parts(
                update.character_id.as_deref(),
                update.character_name.as_deref(),
                Some(card_type),
            )
            .and_then(|r| resolve_in(&cards, &r));

            let card = match resolved.and_then(|id| cards.iter().find(|c| c.id == id).cloned()) {
                Some(target) => {
                    let mut upsert = CardUpsert::new(story, target.card_type, target.name.clone());
                    upsert.description = update.description;
                    upsert.data = update.data_patch;
                    self.store().upsert_card(upsert).await?
                }
                None => {
                    let missing = update
                        .character_name
                        .clone()
                        .or_else(|| update.character_id.clone())
                        .unwrap_or_else(|| "unknown".to_string());
                    let name = update.character_name.clone().ok_or_else(|| {
                        EngineError::Validation(format!(
                            "unable to resolve character for update: {missing}"
                        ))
                    })?;
                    let mut upsert = CardUpsert::new(story, card_type, name);
                    upsert.description = update.description;
                    upsert.data = update.data_patch;
                    self.store().upsert_card(upsert).await?
                }
            };

            match cards.iter_mut().find(|c| c.id == card.id) {
                Some(slot) => *slot = card.clone(),
                None => cards.push(card.clone()),
            }
            character_ids.push(card.id);
        }

        // relationship updates: both endpoints must resolve
        let mut relationship_ids = Vec::new();
        for update in payload.relationship_updates.unwrap_or_default() {
            let source = EntityRef::from_parts(
                update.source_id.as_deref(),
                update.source_name.as_deref(),
                Some(CardType::Character),
            )
            .and_then(|r| resolve_in(&cards, &r))
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "unable to resolve source character: {}",
                    update
                        .source_name
                        .clone()
                        .or(update.source_id.clone())
                        .unwrap_or_else(|| "unknown".to_string())
                ))
            })?;
            let target = EntityRef::from_parts(
                update.target_id.as_deref(),
                update.target_name.as_deref(),
                Some(CardType::Character),
            )
            .and_then(|r| resolve_in(&cards, &r))
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "unable to resolve target character: {}",
                    update
                        .target_name
                        .clone()
                        .or(update.target_id.clone())
                        .unwrap_or_else(|| "unknown".to_string())
                ))
            })?;

            let mut draft = RelationshipDraft::new(story, source, target)
                .with_importance(update.importance.map(|v| v.round() as i32).unwrap_or(1));
            if let Some(summary) = update.summary {
                draft = draft.with_summary(summary);
            }
            if let Some(metrics) = update.metrics {
                draft = draft.with_metrics(metrics);
            }
            relationship_ids.push(self.store().upsert_relationship(draft).await?.id);
        }

        Ok(SummaryReport {
            summary: payload.summary,
            summary_card_id: summary_card.id,
            memory_ids,
            character_ids,
            relationship_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn character(name: &str) -> Card {
        let now = Utc::now();
        Card {
            id: CardId::new(),
            story_id: StoryId::new(),
            card_type: CardType::Character,
            name: name.to_string(),
            description: None,
            data: Map::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_reconcile_drops_fabricated_ids() {
        let mira = character("Mira");
        let cards = vec![mira.clone()];

        let payload = SummaryPayload {
            summary: "recap".to_string(),
            memories: Some(vec![MemoryPayload {
                summary: "a fact".to_string(),
                owner_card_id: Some(Uuid::new_v4().to_string()),
                ..MemoryPayload::default()
            }]),
            character_updates: Some(vec![CharacterUpdatePayload {
                character_id: Some(mira.id.to_string()),
                ..CharacterUpdatePayload::default()
            }]),
            ..SummaryPayload::default()
        };

        let reconciled = reconcile_payload(payload, &cards);

        let memory = &reconciled.memories.as_ref().expect("memories")[0];
        assert!(memory.owner_card_id.is_none());

        let update = &reconciled.character_updates.as_ref().expect("updates")[0];
        assert_eq!(update.character_id.as_deref(), Some(mira.id.to_string().as_str()));
        assert_eq!(update.character_name.as_deref(), Some("Mira"));
        assert_eq!(update.character_type.as_deref(), Some("character"));
    }

    #[test]
    fn test_reconcile_rejects_non_character_relationship_ids() {
        let now = Utc::now();
        let item = Card {
            id: CardId::new(),
            story_id: StoryId::new(),
            card_type: CardType::Item,
            name: "Lockbox".to_string(),
            description: None,
            data: Map::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
        };
        let cards = vec![item.clone()];

        let payload = SummaryPayload {
            summary: "recap".to_string(),
            relationship_updates: Some(vec![RelationshipUpdatePayload {
                source_id: Some(item.id.to_string()),
                source_name: Some("Serra".to_string()),
                ..RelationshipUpdatePayload::default()
            }]),
            ..SummaryPayload::default()
        };

        let reconciled = reconcile_payload(payload, &cards);
        let update = &reconciled.relationship_updates.as_ref().expect("updates")[0];
        // the item id is dropped; the name survives for name-based resolution
        assert!(update.source_id.is_none());
        assert_eq!(update.source_name.as_deref(), Some("Serra"));
    }

    #[test]
    fn test_schema_names_required_summary() {
        let schema = summary_schema();
        assert_eq!(schema["required"], json!(["summary"]));
        assert!(schema["properties"]["memories"]["items"]["properties"]["ownerCardId"].is_object());
    }
}
