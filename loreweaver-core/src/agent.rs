//! The turn orchestrator.
//!
//! One player turn runs: load cards → retrieve relevant context → assemble
//! the prompt → bounded tool-calling loop → commit the narrative and its
//! side effects. Retrieval or prompting failures abort the turn with
//! nothing committed; a failing tool call is contained and fed back to the
//! model as an error tool result.

use crate::chat::ChatProvider;
use crate::error::{EngineError, Result, UpstreamKind};
use crate::id::StoryId;
use crate::model::{
    Card, CardType, CharacterSheet, MemoryDraft, MemorySource, MessageRole,
};
use crate::store::{ContextOptions, ContextSnapshot, WorldStore};
use crate::tools::{dispatch_tool, GameTools, ImageGenerator};
use claude::{ContentBlock, Message, Request, Role, StopReason};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A player action driving one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UserAction {
    /// Attempt something in the fiction.
    Do { text: String },
    /// Say something in character.
    Say { text: String },
    /// Let the narrator advance the scene.
    Continue,
}

/// Per-turn options.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// Private "texting" mode: respond as this character, ephemeral, not
    /// persisted to the shared transcript.
    pub target_character: Option<String>,
    /// Model override for this turn.
    pub model: Option<String>,
}

/// The result of a committed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub text: String,
    pub image_url: Option<String>,
}

/// Configuration for the Game Master.
#[derive(Debug, Clone)]
pub struct GameMasterConfig {
    /// Model to use (the chat provider's default when None).
    pub model: Option<String>,
    /// Maximum tokens per response.
    pub max_tokens: usize,
    /// Temperature for narration.
    pub temperature: Option<f32>,
    /// Extra instructions appended to the system prompt.
    pub custom_system_prompt: Option<String>,
    /// Cap on tool dispatch rounds per turn.
    pub max_tool_rounds: usize,
    /// How much transcript tail to show the model, in characters.
    pub transcript_window: usize,
    /// How many recent messages seed the retrieval query.
    pub recent_messages: usize,
}

impl Default for GameMasterConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 4096,
            temperature: Some(0.9),
            custom_system_prompt: None,
            max_tool_rounds: 4,
            transcript_window: 8000,
            recent_messages: 6,
        }
    }
}

/// The AI Game Master: the central control loop over chat provider, world
/// store, and tool surface.
pub struct GameMaster {
    chat: Arc<dyn ChatProvider>,
    store: WorldStore,
    image: Option<Arc<dyn ImageGenerator>>,
    config: GameMasterConfig,
}

impl GameMaster {
    /// Create a Game Master over a chat provider and world store.
    pub fn new(chat: Arc<dyn ChatProvider>, store: WorldStore) -> Self {
        Self {
            chat,
            store,
            image: None,
            config: GameMasterConfig::default(),
        }
    }

    /// Configure the Game Master.
    pub fn with_config(mut self, config: GameMasterConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach an image generator for the scene-illustration tool.
    pub fn with_image_generator(mut self, generator: Arc<dyn ImageGenerator>) -> Self {
        self.image = Some(generator);
        self
    }

    /// The world store this Game Master operates on.
    pub fn store(&self) -> &WorldStore {
        &self.store
    }

    pub(crate) fn chat(&self) -> &Arc<dyn ChatProvider> {
        &self.chat
    }

    /// Run one player turn against a story.
    pub async fn run_turn(
        &self,
        action: UserAction,
        story: StoryId,
        opts: TurnOptions,
    ) -> Result<TurnOutcome> {
        let cards = self.store.get_cards(story).await?;
        let player_card = cards
            .iter()
            .find(|c| {
                c.card_type == CardType::Character
                    && CharacterSheet::from_data(&c.data).is_player_character
            })
            .cloned();
        // prefer the card's canonical casing for the texting persona
        let target_name = opts.target_character.as_deref().map(|target| {
            cards
                .iter()
                .find(|c| {
                    c.card_type == CardType::Character && c.name.eq_ignore_ascii_case(target)
                })
                .map(|c| c.name.clone())
                .unwrap_or_else(|| target.to_string())
        });
        let backstory_line = player_card.as_ref().and_then(|c| c.description.clone());

        // Retrieval: query built from the action, the target hint, the
        // player's backstory line, and the recent transcript.
        let recent = self
            .store
            .recent_messages(story, self.config.recent_messages)
            .await?;
        let query = build_retrieval_query(
            &action,
            opts.target_character.as_deref(),
            backstory_line.as_deref(),
            &recent,
        );
        let context = self
            .store
            .retrieve_context(story, &query, &ContextOptions::default())
            .await?;
        let mut context_block = render_context(&context, &cards);
        // the backstory must never be silently dropped by ranking
        if let Some(line) = &backstory_line {
            if !context_block.contains(line.as_str()) {
                context_block.push_str(&format!("\nPlayer backstory: {line}\n"));
            }
        }

        let settings = self.store.get_settings(story).await?;
        let transcript = self.store.transcript(story).await?;
        let system = self.build_system_prompt(
            &settings,
            &cards,
            &context_block,
            tail_chars(&transcript, self.config.transcript_window),
            target_name.as_deref(),
        )?;

        let mut messages = vec![Message {
            role: Role::User,
            content: vec![ContentBlock::Text {
                text: user_prompt(&action),
            }],
        }];

        // Tool loop, bounded to prevent infinite tool-calling.
        let tools = GameTools::all();
        let mut narrative = String::new();
        let mut image_url: Option<String> = None;
        let mut rounds = 0;
        loop {
            let mut request = Request::new(messages.clone())
                .with_system(system.clone())
                .with_max_tokens(self.config.max_tokens)
                .with_tools(tools.clone());
            if let Some(model) = opts.model.as_ref().or(self.config.model.as_ref()) {
                request = request.with_model(model.clone());
            }
            if let Some(temperature) = self.config.temperature {
                request = request.with_temperature(temperature);
            }

            let response = self.chat.complete(request).await?;

            let text = response.text();
            if !text.trim().is_empty() {
                narrative = text;
            }

            let tool_uses = response.tool_uses();
            if response.stop_reason != StopReason::ToolUse || tool_uses.is_empty() {
                break;
            }
            if rounds >= self.config.max_tool_rounds {
                tracing::warn!(%story, "tool round cap reached, committing with available narrative");
                break;
            }

            messages.push(Message {
                role: Role::Assistant,
                content: response.content.clone(),
            });

            let mut results = Vec::with_capacity(tool_uses.len());
            for tool_use in tool_uses {
                let outcome = dispatch_tool(
                    &self.store,
                    self.image.as_deref(),
                    story,
                    &tool_use.name,
                    &tool_use.input,
                )
                .await;
                if outcome.image_url.is_some() {
                    image_url = outcome.image_url.clone();
                }
                results.push(ContentBlock::ToolResult {
                    tool_use_id: tool_use.id,
                    content: outcome.content,
                    is_error: outcome.is_error,
                });
            }
            messages.push(Message {
                role: Role::User,
                content: results,
            });
            rounds += 1;
        }

        if narrative.trim().is_empty() {
            return Err(EngineError::upstream(
                UpstreamKind::Api,
                "model produced no narrative text",
            ));
        }

        tracing::debug!(%story, rounds, chars = narrative.len(), "turn narrated");

        // Commit. Private texting mode is ephemeral: nothing is persisted.
        if opts.target_character.is_none() {
            self.commit_turn(story, &action, &narrative, image_url.as_deref(), &player_card)
                .await?;
        }

        Ok(TurnOutcome {
            text: narrative,
            image_url,
        })
    }

    async fn commit_turn(
        &self,
        story: StoryId,
        action: &UserAction,
        narrative: &str,
        image_url: Option<&str>,
        player_card: &Option<Card>,
    ) -> Result<()> {
        let player_id = player_card.as_ref().map(|c| c.id);
        let mut drafts = Vec::new();

        let player_line = match action {
            UserAction::Say { text } => Some((format!("You say: \"{text}\""), "say", text)),
            UserAction::Do { text } => Some((format!("You do: {text}"), "do", text)),
            UserAction::Continue => None,
        };
        if let Some((line, mode, text)) = player_line {
            let message = self
                .store
                .append_message(story, MessageRole::You, &line, None)
                .await?;
            let mut context = serde_json::Map::new();
            context.insert("mode".to_string(), serde_json::Value::String(mode.to_string()));
            drafts.push(
                MemoryDraft::new(story, text.clone())
                    .with_source(MemorySource::Player)
                    .with_owner(player_id)
                    .with_source_message(message.id)
                    .with_context(context)
                    .with_tags(vec!["player".to_string(), mode.to_string()]),
            );
        }

        let dm_message = self
            .store
            .append_message(story, MessageRole::Dm, narrative, image_url)
            .await?;
        let mut context = serde_json::Map::new();
        context.insert(
            "mode".to_string(),
            serde_json::Value::String("story".to_string()),
        );
        drafts.push(
            MemoryDraft::new(story, narrative)
                .with_source(MemorySource::Dm)
                .with_subject(player_id)
                .with_source_message(dm_message.id)
                .with_context(context)
                .with_tags(vec!["dm".to_string()]),
        );

        self.store.record_memories(drafts).await?;
        Ok(())
    }

    fn build_system_prompt(
        &self,
        settings: &crate::model::GmSettings,
        cards: &[Card],
        context_block: &str,
        transcript_tail: &str,
        target_character: Option<&str>,
    ) -> Result<String> {
        let mut prompt = String::new();
        prompt.push_str(include_str!("prompts/narrator_base.txt"));

        if let Some(custom) = &self.config.custom_system_prompt {
            prompt.push_str("\n## Additional Instructions\n");
            prompt.push_str(custom);
            prompt.push('\n');
        }

        prompt.push_str(&format!(
            "\nGM Settings: {}\n",
            serde_json::to_string(settings)?
        ));

        if let Some(beginning) = cards.iter().find(|c| c.card_type == CardType::Beginning) {
            prompt.push_str(&format!(
                "\nSelected Beginning: {}\nDescription: {}\nSeed JSON: {}\n",
                beginning.name,
                beginning.description.as_deref().unwrap_or(""),
                beginning
                    .data
                    .get("seed")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            ));
        }

        prompt.push_str("\nStory so far (append-only log):\n");
        prompt.push_str(transcript_tail);
        prompt.push('\n');

        prompt.push_str("\nRelevant world notes:\n");
        prompt.push_str(context_block);

        let characters: Vec<&Card> = cards
            .iter()
            .filter(|c| c.card_type == CardType::Character)
            .collect();
        if !characters.is_empty() {
            prompt.push_str("\nCharacter ID lookup (use these ids in tool calls):\n");
            for card in characters {
                prompt.push_str(&format!("- {} => {}\n", card.name, card.id));
            }
        }

        if let Some(target) = target_character {
            prompt.push_str(&format!(
                "\nDirect message mode: respond as '{target}' in a private text chat with the player character.\n\
                 - First-person voice of {target}.\n\
                 - Short, natural chat messages (1-2 sentences).\n\
                 - No narration or stage directions. No asterisks. No quotes around your own messages.\n\
                 - Keep it informal and responsive; reveal personality through tone.\n\
                 - Avoid probing questions back-to-back; volunteer details or take initiative.\n"
            ));
        }

        Ok(prompt)
    }
}

fn user_prompt(action: &UserAction) -> String {
    match action {
        UserAction::Continue => "Continue the story naturally.".to_string(),
        UserAction::Say { text } => format!("The player says: \"{text}\""),
        UserAction::Do { text } => {
            let is_examine = text
                .get(..8)
                .map(|p| p.eq_ignore_ascii_case("examine "))
                .unwrap_or(false);
            if is_examine {
                let target = &text[8..];
                format!(
                    "Player examines a target. Provide exhaustive observable details \
                     (species if discernible, age impression, clothing, visible equipment, \
                     notable marks, demeanor, sounds, immediate environment clues). Use concise \
                     bullet-like prose in 4-7 lines, strictly from what can be seen, heard, or \
                     smelled right now, and consult existing character cards for accuracy. \
                     Target: {target}"
                )
            } else {
                format!("The player attempts: {text}")
            }
        }
    }
}

fn build_retrieval_query(
    action: &UserAction,
    target_character: Option<&str>,
    backstory_line: Option<&str>,
    recent: &[crate::model::StoryMessage],
) -> String {
    let mut query = match action {
        UserAction::Say { text } => format!("Dialogue context for: {text}"),
        UserAction::Do { text } => format!("Action context for: {text}"),
        UserAction::Continue => "Continue the current scene".to_string(),
    };
    if let Some(target) = target_character {
        query.push_str(&format!("\nFocus on {target}"));
    }
    if let Some(line) = backstory_line {
        query.push_str(&format!("\nPlayer backstory: {line}"));
    }
    if !recent.is_empty() {
        query.push_str("\nRecent events:");
        for message in recent {
            query.push('\n');
            query.push_str(&message.content);
        }
    }
    query
}

fn render_context(snapshot: &ContextSnapshot, cards: &[Card]) -> String {
    let name_of = |id: crate::id::CardId| -> String {
        cards
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| id.to_string())
    };

    let mut block = String::new();
    if !snapshot.cards.is_empty() {
        block.push_str("Cards:\n");
        for card in &snapshot.cards {
            block.push_str(&format!(
                "- [{}] {}{}{}\n",
                card.card_type,
                card.name,
                card.description
                    .as_deref()
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default(),
                if card.data.is_empty() {
                    String::new()
                } else {
                    format!(
                        " | data: {}",
                        serde_json::Value::Object(card.data.clone())
                    )
                },
            ));
        }
    }
    if !snapshot.memories.is_empty() {
        block.push_str("Memories:\n");
        for memory in &snapshot.memories {
            block.push_str(&format!(
                "- ({}, importance {}) {}\n",
                memory.source.as_str(),
                memory.importance,
                memory.summary
            ));
        }
    }
    if !snapshot.relationships.is_empty() {
        block.push_str("Relationships:\n");
        for relationship in &snapshot.relationships {
            block.push_str(&format!(
                "- {} -> {} (importance {}){}\n",
                name_of(relationship.source_card_id),
                name_of(relationship.target_card_id),
                relationship.importance,
                relationship
                    .summary
                    .as_deref()
                    .map(|s| format!(": {s}"))
                    .unwrap_or_default(),
            ));
        }
    }
    if !snapshot.stats.is_empty() {
        block.push_str("Character stats:\n");
        for stat in &snapshot.stats {
            block.push_str(&format!(
                "- {}.{} = {} (confidence {})\n",
                name_of(stat.character_card_id),
                stat.key,
                stat.value,
                stat.confidence
            ));
        }
    }
    block
}

/// Last `max_chars` characters of `text`, on a char boundary.
pub(crate) fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_prompt_shapes() {
        assert_eq!(
            user_prompt(&UserAction::Continue),
            "Continue the story naturally."
        );
        assert!(user_prompt(&UserAction::Say {
            text: "Hello".to_string()
        })
        .contains("\"Hello\""));
        assert!(user_prompt(&UserAction::Do {
            text: "pick the lock".to_string()
        })
        .contains("attempts: pick the lock"));
    }

    #[test]
    fn test_examine_action_gets_observation_prompt() {
        let prompt = user_prompt(&UserAction::Do {
            text: "Examine the innkeeper".to_string(),
        });
        assert!(prompt.contains("observable details"));
        assert!(prompt.ends_with("Target: the innkeeper"));
    }

    #[test]
    fn test_retrieval_query_includes_all_signals() {
        let query = build_retrieval_query(
            &UserAction::Say {
                text: "who goes there".to_string(),
            },
            Some("Mira"),
            Some("A disgraced cartographer"),
            &[],
        );
        assert!(query.contains("Dialogue context for: who goes there"));
        assert!(query.contains("Focus on Mira"));
        assert!(query.contains("disgraced cartographer"));
    }

    #[test]
    fn test_tail_chars_respects_boundaries() {
        assert_eq!(tail_chars("hello", 10), "hello");
        assert_eq!(tail_chars("hello", 3), "llo");
        // multibyte safety
        assert_eq!(tail_chars("héllo", 4), "éllo");
    }
}
