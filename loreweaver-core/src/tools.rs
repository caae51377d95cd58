//! Tool surface exposed to the narrator model.
//!
//! Tool arguments are validated by schema-checked deserialization right at
//! the dispatch boundary; a malformed call becomes an error tool result fed
//! back to the model instead of aborting the turn. The story id is injected
//! by the dispatcher and never trusted from model-supplied arguments.

use crate::dice;
use crate::error::{EngineError, Result};
use crate::id::StoryId;
use crate::merge::sanitize_object;
use crate::model::{
    CardFilter, CardType, CardUpsert, CharacterSheet, MemoryDraft, MemorySource,
    RelationshipDraft, StatDraft,
};
use crate::resolve::{normalize_card_type, EntityRef};
use crate::store::WorldStore;
use async_trait::async_trait;
use chrono::Utc;
use claude::Tool;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Generates a scene illustration and returns its URL.
///
/// Side feature invoked as an external tool; the engine only carries the
/// request/response contract.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// The result of one tool invocation, plus any side-channel output the
/// orchestrator should pick up.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
    pub image_url: Option<String>,
}

impl ToolOutcome {
    fn success(content: String) -> Self {
        Self {
            content,
            is_error: false,
            image_url: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            content: json!({ "error": message }).to_string(),
            is_error: true,
            image_url: None,
        }
    }
}

/// Collection of narrator tools.
pub struct GameTools;

impl GameTools {
    /// All tool definitions bound into every turn.
    pub fn all() -> Vec<Tool> {
        vec![
            Self::roll_dice(),
            Self::update_or_create_card(),
            Self::list_cards(),
            Self::update_player_backstory(),
            Self::record_memory(),
            Self::update_character_stat(),
            Self::update_relationship(),
            Self::generate_scene_image(),
        ]
    }

    fn roll_dice() -> Tool {
        Tool {
            name: "roll_dice".to_string(),
            description: "Roll polyhedral dice like d20, d6, or custom NdM (e.g., 2d6+1). Returns total and individual rolls.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "formula": {
                        "type": "string",
                        "description": "Dice formula, e.g. '1d20+3' or '2d6+1'"
                    }
                },
                "required": ["formula"]
            }),
        }
    }

    fn update_or_create_card() -> Tool {
        Tool {
            name: "update_or_create_card".to_string(),
            description: "Create or update a story, character, environment, item, faction, quest, or world card by name and type. Merges new data into the existing card.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "type": {
                        "type": "string",
                        "enum": ["story", "character", "environment", "item", "faction", "quest", "world"]
                    },
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "data": {
                        "type": "object",
                        "description": "Attributes to merge into the card's data"
                    }
                },
                "required": ["type", "name"]
            }),
        }
    }

    fn list_cards() -> Tool {
        Tool {
            name: "list_cards".to_string(),
            description: "List cards, optionally filtered by type or substring of name.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "type": { "type": "string" },
                    "name": { "type": "string" }
                },
                "required": []
            }),
        }
    }

    fn update_player_backstory() -> Tool {
        Tool {
            name: "update_player_backstory".to_string(),
            description: "Record new backstory elements as they are revealed through the player's actions, dialogue, or character reactions. Use when the player demonstrates a skill, mentions their past, or when NPCs discover something about them.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "backstoryElement": {
                        "type": "string",
                        "description": "A brief title for this element (e.g. 'Trained in Stealth', 'Noble Background')"
                    },
                    "category": {
                        "type": "string",
                        "enum": ["skill", "background", "relationship", "experience", "secret", "motivation"]
                    },
                    "description": {
                        "type": "string",
                        "description": "How this was revealed and what it means"
                    }
                },
                "required": ["backstoryElement", "category", "description"]
            }),
        }
    }

    fn record_memory() -> Tool {
        Tool {
            name: "record_memory".to_string(),
            description: "Store a one-sentence durable fact about the world for later retrieval. Attach owner/subject characters by id or name when relevant.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "summary": { "type": "string" },
                    "sourceType": {
                        "type": "string",
                        "enum": ["player", "dm", "npc", "system", "world"]
                    },
                    "ownerCardId": { "type": "string" },
                    "ownerCardName": { "type": "string" },
                    "subjectCardId": { "type": "string" },
                    "subjectCardName": { "type": "string" },
                    "importance": { "type": "number", "minimum": 0, "maximum": 5 },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "context": { "type": "object" }
                },
                "required": ["summary"]
            }),
        }
    }

    fn update_character_stat() -> Tool {
        Tool {
            name: "update_character_stat".to_string(),
            description: "Set a key/value stat on a character card (replaces any previous value for the key).".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "characterId": { "type": "string" },
                    "characterName": { "type": "string" },
                    "key": { "type": "string" },
                    "value": { "description": "Stat value; scalars are wrapped automatically" },
                    "confidence": { "type": "number" }
                },
                "required": ["key", "value"]
            }),
        }
    }

    fn update_relationship() -> Tool {
        Tool {
            name: "update_relationship".to_string(),
            description: "Record or update the directed relationship from one character to another. Metrics merge; importance never decreases.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sourceId": { "type": "string" },
                    "sourceName": { "type": "string" },
                    "targetId": { "type": "string" },
                    "targetName": { "type": "string" },
                    "summary": { "type": "string" },
                    "metrics": { "type": "object" },
                    "importance": { "type": "number", "minimum": 0, "maximum": 5 }
                },
                "required": []
            }),
        }
    }

    fn generate_scene_image() -> Tool {
        Tool {
            name: "generate_scene_image".to_string(),
            description: "Generate an illustration of the current scene. Use sparingly, at dramatic moments.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "Visual description of the scene to illustrate"
                    }
                },
                "required": ["prompt"]
            }),
        }
    }
}

/// Execute one tool call against the world store.
///
/// Errors never escape: they are folded into an error [`ToolOutcome`] so
/// the model can recover narratively.
pub async fn dispatch_tool(
    store: &WorldStore,
    image: Option<&dyn ImageGenerator>,
    story: StoryId,
    name: &str,
    input: &Value,
) -> ToolOutcome {
    let result = match name {
        "roll_dice" => run_roll_dice(input),
        "update_or_create_card" => run_upsert_card(store, story, input).await,
        "list_cards" => run_list_cards(store, story, input).await,
        "update_player_backstory" => run_update_backstory(store, story, input).await,
        "record_memory" => run_record_memory(store, story, input).await,
        "update_character_stat" => run_update_stat(store, story, input).await,
        "update_relationship" => run_update_relationship(store, story, input).await,
        "generate_scene_image" => run_generate_image(image, input).await,
        other => Err(EngineError::ToolExecution {
            tool: other.to_string(),
            reason: "unknown tool".to_string(),
        }),
    };

    match result {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::debug!(tool = name, %error, "tool call failed");
            ToolOutcome::error(error.to_string())
        }
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, input: &Value) -> Result<T> {
    serde_json::from_value(input.clone())
        .map_err(|e| EngineError::Validation(format!("invalid arguments for {tool}: {e}")))
}

#[derive(Debug, Deserialize)]
struct RollDiceArgs {
    formula: String,
}

fn run_roll_dice(input: &Value) -> Result<ToolOutcome> {
    let args: RollDiceArgs = parse_args("roll_dice", input)?;
    let roll = dice::roll(&args.formula).map_err(|e| EngineError::ToolExecution {
        tool: "roll_dice".to_string(),
        reason: e.to_string(),
    })?;
    Ok(ToolOutcome::success(serde_json::to_string(&roll)?))
}

#[derive(Deserialize)]
struct UpsertCardArgs {
    #[serde(rename = "type")]
    card_type: CardType,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

async fn run_upsert_card(store: &WorldStore, story: StoryId, input: &Value) -> Result<ToolOutcome> {
    let args: UpsertCardArgs = parse_args("update_or_create_card", input)?;
    let mut upsert = CardUpsert::new(story, args.card_type, args.name);
    upsert.description = args.description;
    upsert.data = args.data;
    let card = store.upsert_card(upsert).await?;
    Ok(ToolOutcome::success(card.summary_json().to_string()))
}

#[derive(Deserialize)]
struct ListCardsArgs {
    #[serde(rename = "type", default)]
    card_type: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

async fn run_list_cards(store: &WorldStore, story: StoryId, input: &Value) -> Result<ToolOutcome> {
    let args: ListCardsArgs = parse_args("list_cards", input)?;
    let card_type = match args.card_type.as_deref() {
        Some(raw) => Some(normalize_card_type(Some(raw)).ok_or_else(|| {
            EngineError::Validation(format!("unknown card type '{raw}'"))
        })?),
        None => None,
    };
    let cards = store
        .list_cards(
            story,
            &CardFilter {
                card_type,
                name: args.name,
            },
        )
        .await?;
    let listed: Vec<Value> = cards.iter().map(|c| c.summary_json()).collect();
    Ok(ToolOutcome::success(Value::Array(listed).to_string()))
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum BackstoryCategory {
    Skill,
    Background,
    Relationship,
    Experience,
    Secret,
    Motivation,
}

impl BackstoryCategory {
    fn as_str(&self) -> &'static str {
        match self {
            BackstoryCategory::Skill => "skill",
            BackstoryCategory::Background => "background",
            BackstoryCategory::Relationship => "relationship",
            BackstoryCategory::Experience => "experience",
            BackstoryCategory::Secret => "secret",
            BackstoryCategory::Motivation => "motivation",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackstoryArgs {
    backstory_element: String,
    category: BackstoryCategory,
    description: String,
}

async fn run_update_backstory(
    store: &WorldStore,
    story: StoryId,
    input: &Value,
) -> Result<ToolOutcome> {
    let args: BackstoryArgs = parse_args("update_player_backstory", input)?;

    let characters = store
        .list_cards(
            story,
            &CardFilter {
                card_type: Some(CardType::Character),
                name: None,
            },
        )
        .await?;
    let player = characters
        .iter()
        .find(|c| CharacterSheet::from_data(&c.data).is_player_character);

    let entry = json!({
        "element": args.backstory_element.clone(),
        "description": args.description,
        "revealedAt": Utc::now().to_rfc3339(),
    });
    let patch = json!({
        "isPlayerCharacter": true,
        "backstory": { args.category.as_str(): [entry] },
        "revealedTraits": [args.backstory_element.clone()],
    });

    let mut upsert = match player {
        Some(card) => CardUpsert::new(story, card.card_type, card.name.clone()),
        None => CardUpsert::new(story, CardType::Character, "Player Character").with_description(
            "The player's character, whose backstory develops through play",
        ),
    };
    upsert.data = Some(sanitize_object(Some(&patch)));
    let card = store.upsert_card(upsert).await?;

    let total = card
        .data
        .get("revealedTraits")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0);
    Ok(ToolOutcome::success(
        json!({
            "success": true,
            "message": format!(
                "Added backstory element: {} ({})",
                args.backstory_element,
                args.category.as_str()
            ),
            "totalElements": total,
        })
        .to_string(),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordMemoryArgs {
    summary: String,
    #[serde(default)]
    source_type: Option<MemorySource>,
    #[serde(default)]
    owner_card_id: Option<String>,
    #[serde(default)]
    owner_card_name: Option<String>,
    #[serde(default)]
    subject_card_id: Option<String>,
    #[serde(default)]
    subject_card_name: Option<String>,
    #[serde(default)]
    importance: Option<f64>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    context: Option<Map<String, Value>>,
}

async fn run_record_memory(
    store: &WorldStore,
    story: StoryId,
    input: &Value,
) -> Result<ToolOutcome> {
    let args: RecordMemoryArgs = parse_args("record_memory", input)?;
    let cards = store.get_cards(story).await?;

    let owner = EntityRef::from_parts(
        args.owner_card_id.as_deref(),
        args.owner_card_name.as_deref(),
        Some(CardType::Character),
    );
    let subject = EntityRef::from_parts(
        args.subject_card_id.as_deref(),
        args.subject_card_name.as_deref(),
        Some(CardType::Character),
    );

    let mut draft = MemoryDraft::new(story, args.summary)
        .with_source(args.source_type.unwrap_or_default())
        .with_importance(args.importance.map(|v| v.round() as i32).unwrap_or(1))
        .with_tags(args.tags.unwrap_or_default());
    if let Some(context) = args.context {
        draft = draft.with_context(context);
    }
    if let Some(owner) = owner {
        draft = draft.with_owner(store.resolve_card_id(story, &owner, Some(&cards)).await?);
    }
    if let Some(subject) = subject {
        draft = draft.with_subject(store.resolve_card_id(story, &subject, Some(&cards)).await?);
    }

    let memory = store.record_memory(draft).await?;
    Ok(ToolOutcome::success(
        json!({ "success": true, "memoryId": memory.id }).to_string(),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatArgs {
    #[serde(default)]
    character_id: Option<String>,
    #[serde(default)]
    character_name: Option<String>,
    key: String,
    value: Value,
    #[serde(default)]
    confidence: Option<f64>,
}

async fn run_update_stat(store: &WorldStore, story: StoryId, input: &Value) -> Result<ToolOutcome> {
    let args: StatArgs = parse_args("update_character_stat", input)?;

    let entity = EntityRef::from_parts(
        args.character_id.as_deref(),
        args.character_name.as_deref(),
        Some(CardType::Character),
    )
    .ok_or_else(|| EngineError::Validation("characterId or characterName required".to_string()))?;

    let character = store
        .resolve_card_id(story, &entity, None)
        .await?
        .ok_or_else(|| EngineError::ToolExecution {
            tool: "update_character_stat".to_string(),
            reason: "unknown character".to_string(),
        })?;

    let stat = store
        .upsert_stat(
            StatDraft::new(story, character, args.key, args.value)
                .with_confidence(args.confidence.unwrap_or(1.0)),
        )
        .await?;
    Ok(ToolOutcome::success(
        json!({ "success": true, "statId": stat.id, "key": stat.key }).to_string(),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelationshipArgs {
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    source_name: Option<String>,
    #[serde(default)]
    target_id: Option<String>,
    #[serde(default)]
    target_name: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    metrics: Option<Map<String, Value>>,
    #[serde(default)]
    importance: Option<f64>,
}

async fn run_update_relationship(
    store: &WorldStore,
    story: StoryId,
    input: &Value,
) -> Result<ToolOutcome> {
    let args: RelationshipArgs = parse_args("update_relationship", input)?;
    let cards = store.get_cards(story).await?;

    let source = EntityRef::from_parts(
        args.source_id.as_deref(),
        args.source_name.as_deref(),
        Some(CardType::Character),
    )
    .ok_or_else(|| EngineError::Validation("sourceId or sourceName required".to_string()))?;
    let target = EntityRef::from_parts(
        args.target_id.as_deref(),
        args.target_name.as_deref(),
        Some(CardType::Character),
    )
    .ok_or_else(|| EngineError::Validation("targetId or targetName required".to_string()))?;

    let source_id = store
        .resolve_card_id(story, &source, Some(&cards))
        .await?
        .ok_or_else(|| EngineError::ToolExecution {
            tool: "update_relationship".to_string(),
            reason: "unknown source character".to_string(),
        })?;
    let target_id = store
        .resolve_card_id(story, &target, Some(&cards))
        .await?
        .ok_or_else(|| EngineError::ToolExecution {
            tool: "update_relationship".to_string(),
            reason: "unknown target character".to_string(),
        })?;

    let mut draft = RelationshipDraft::new(story, source_id, target_id)
        .with_importance(args.importance.map(|v| v.round() as i32).unwrap_or(1));
    if let Some(summary) = args.summary {
        draft = draft.with_summary(summary);
    }
    if let Some(metrics) = args.metrics {
        draft = draft.with_metrics(metrics);
    }

    let relationship = store.upsert_relationship(draft).await?;
    Ok(ToolOutcome::success(
        json!({
            "success": true,
            "relationshipId": relationship.id,
            "importance": relationship.importance,
        })
        .to_string(),
    ))
}

#[derive(Deserialize)]
struct SceneImageArgs {
    prompt: String,
}

async fn run_generate_image(
    image: Option<&dyn ImageGenerator>,
    input: &Value,
) -> Result<ToolOutcome> {
    let args: SceneImageArgs = parse_args("generate_scene_image", input)?;
    let generator = image.ok_or_else(|| EngineError::ToolExecution {
        tool: "generate_scene_image".to_string(),
        reason: "image generation is not available".to_string(),
    })?;
    let url = generator.generate(&args.prompt).await?;
    Ok(ToolOutcome {
        content: json!({ "success": true, "imageUrl": url }).to_string(),
        is_error: false,
        image_url: Some(url),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_tools_have_object_schemas() {
        let tools = GameTools::all();
        assert_eq!(tools.len(), 8);
        for tool in &tools {
            assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
            assert!(!tool.description.is_empty());
        }
    }

    #[test]
    fn test_tool_names_are_unique() {
        let tools = GameTools::all();
        let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), tools.len());
    }

    #[test]
    fn test_parse_args_reports_tool_name() {
        let err = parse_args::<RollDiceArgs>("roll_dice", &json!({"wrong": 1})).unwrap_err();
        assert!(err.to_string().contains("roll_dice"));
    }
}
