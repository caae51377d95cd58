//! Fuzzy entity reference resolution.
//!
//! The LLM is an unreliable caller: it may reference entities by canonical
//! id, by any name it has seen in the narrative, by a nickname it invented,
//! or by a display name stuffed into the id slot. [`EntityRef`] makes the
//! reference shape explicit and [`resolve_in`] runs one ordered strategy
//! chain:
//!
//! 1. a UUID-shaped id is verified against the card set
//! 2. a non-UUID "id" is demoted to a name
//! 3. exact (type, name) match, then case-insensitive (type, name)
//! 4. exact case-insensitive name match across all types
//! 5. full scan of every card's `name`/`displayName`/`aliases` data fields
//!
//! A null result is not an error: the caller decides whether it means
//! "create a new entity" or "reject the update".

use crate::id::{CardId, StoryId};
use crate::model::{Card, CardType, CharacterSheet};
use crate::store::WorldStore;
use uuid::Uuid;

/// A loosely-specified reference to a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    /// Something the caller claims is an id (may actually be a name).
    ById {
        id: String,
        card_type: Option<CardType>,
    },
    /// A name, optionally narrowed to a card type.
    ByName {
        name: String,
        card_type: Option<CardType>,
    },
}

impl EntityRef {
    /// Assemble a reference from the loose optional fields a tool call or
    /// structured payload carries. Returns None when there is nothing to
    /// resolve.
    pub fn from_parts(
        id: Option<&str>,
        name: Option<&str>,
        card_type: Option<CardType>,
    ) -> Option<Self> {
        let id = id.map(str::trim).filter(|s| !s.is_empty());
        let name = name.map(str::trim).filter(|s| !s.is_empty());
        match (id, name) {
            (Some(id), _) => Some(EntityRef::ById {
                id: id.to_string(),
                card_type,
            }),
            (None, Some(name)) => Some(EntityRef::ByName {
                name: name.to_string(),
                card_type,
            }),
            (None, None) => None,
        }
    }
}

/// Map a loose type string onto a card type, folding "beginning" into
/// story the way the narrator treats them.
pub fn normalize_card_type(raw: Option<&str>) -> Option<CardType> {
    let raw = raw?.trim().to_lowercase();
    match raw.as_str() {
        "story" | "beginning" => Some(CardType::Story),
        "character" => Some(CardType::Character),
        "environment" => Some(CardType::Environment),
        "item" => Some(CardType::Item),
        "faction" => Some(CardType::Faction),
        "quest" => Some(CardType::Quest),
        "world" => Some(CardType::World),
        _ => None,
    }
}

/// Resolve a reference against a card set.
pub fn resolve_in(cards: &[Card], entity: &EntityRef) -> Option<CardId> {
    match entity {
        EntityRef::ById { id, card_type } => {
            if let Ok(uuid) = Uuid::parse_str(id) {
                let candidate = CardId::from_uuid(uuid);
                if cards.iter().any(|c| c.id == candidate) {
                    return Some(candidate);
                }
                // UUID-shaped but unknown; fall through to the name chain in
                // case the model echoed a stale id alongside a usable name
            }
            resolve_by_name(cards, id, *card_type)
        }
        EntityRef::ByName { name, card_type } => resolve_by_name(cards, name, *card_type),
    }
}

fn resolve_by_name(cards: &[Card], name: &str, card_type: Option<CardType>) -> Option<CardId> {
    // exact (type, name), then case-insensitive within the type
    if let Some(ty) = card_type {
        if let Some(card) = cards
            .iter()
            .find(|c| c.card_type == ty && c.name == name)
            .or_else(|| {
                cards
                    .iter()
                    .find(|c| c.card_type == ty && c.name.eq_ignore_ascii_case(name))
            })
        {
            return Some(card.id);
        }
    }

    // exact case-insensitive match across all types
    if let Some(card) = cards.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
        return Some(card.id);
    }

    // last resort: scan data bags for name/displayName/aliases
    cards
        .iter()
        .filter(|c| card_type.map(|ty| c.card_type == ty).unwrap_or(true))
        .find(|c| data_names(c).iter().any(|n| n.eq_ignore_ascii_case(name)))
        .map(|c| c.id)
}

fn data_names(card: &Card) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(n) = card.data.get("name").and_then(|v| v.as_str()) {
        names.push(n.to_string());
    }
    let sheet = CharacterSheet::from_data(&card.data);
    if let Some(display) = sheet.display_name {
        names.push(display);
    }
    names.extend(sheet.aliases);
    names
}

impl WorldStore {
    /// Resolve a reference, using `cached` when the caller already holds
    /// the card set and loading it otherwise.
    pub async fn resolve_card_id(
        &self,
        story: StoryId,
        entity: &EntityRef,
        cached: Option<&[Card]>,
    ) -> crate::error::Result<Option<CardId>> {
        match cached {
            Some(cards) => Ok(resolve_in(cards, entity)),
            None => {
                let cards = self.get_cards(story).await?;
                Ok(resolve_in(&cards, entity))
            }
        }
    }
}
