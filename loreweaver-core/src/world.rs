//! Built-in world lore and story beginnings.
//!
//! A world preset becomes the story's single `world` card: immutable
//! foundations the narrator prefers over invention. A beginning becomes a
//! `beginning` card whose seed JSON is surfaced verbatim in the system
//! prompt on every turn.

use crate::id::StoryId;
use crate::merge::sanitize_object;
use crate::model::{CardType, CardUpsert};
use serde_json::{json, Value};

/// A selectable world foundation.
#[derive(Debug, Clone)]
pub struct WorldPreset {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    data: fn() -> Value,
}

impl WorldPreset {
    /// Build the upsert that installs this world into a story.
    pub fn to_upsert(&self, story: StoryId) -> CardUpsert {
        CardUpsert::new(story, CardType::World, self.name)
            .with_description(self.description)
            .with_data(sanitize_object(Some(&(self.data)())))
    }
}

/// A selectable opening scenario.
#[derive(Debug, Clone)]
pub struct Beginning {
    pub key: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    seed: fn() -> Value,
}

impl Beginning {
    /// The seed JSON injected into the system prompt.
    pub fn seed(&self) -> Value {
        (self.seed)()
    }

    /// Build the upsert that installs this beginning into a story.
    pub fn to_upsert(&self, story: StoryId) -> CardUpsert {
        CardUpsert::new(story, CardType::Beginning, self.title)
            .with_description(self.description)
            .with_data(sanitize_object(Some(&json!({ "seed": self.seed() }))))
    }
}

/// Look up a world preset by key.
pub fn find_world(key: &str) -> Option<&'static WorldPreset> {
    WORLDS.iter().find(|w| w.key.eq_ignore_ascii_case(key))
}

/// Look up a beginning by key.
pub fn find_beginning(key: &str) -> Option<&'static Beginning> {
    BEGINNINGS.iter().find(|b| b.key.eq_ignore_ascii_case(key))
}

/// All built-in worlds.
pub static WORLDS: &[WorldPreset] = &[WorldPreset {
    key: "eirath",
    name: "Eirath Core Lore",
    description: "Immutable world foundations: races, cultures, cosmology.",
    data: eirath_data,
}];

/// All built-in beginnings.
pub static BEGINNINGS: &[Beginning] = &[
    Beginning {
        key: "ember-road",
        title: "The Ember Road",
        description: "A caravan guard contract gone quiet on the old trade route.",
        seed: || {
            json!({
                "opening_location": "The Ember Road, two days east of Hollowmere",
                "hook": "The caravan master has not been seen since the night watch changed.",
                "npcs": ["Serra the quartermaster", "Old Fenn the drover"],
                "tensions": ["missing caravan master", "wolves heard at dusk"],
            })
        },
    },
    Beginning {
        key: "tidewrack",
        title: "Tidewrack",
        description: "Washed ashore with salt in your lungs and no memory of the wreck.",
        seed: || {
            json!({
                "opening_location": "A shingle beach below the Greyspire cliffs",
                "hook": "The tide delivered you, a sealed lockbox, and one other survivor.",
                "npcs": ["The other survivor, feverish and talking in their sleep"],
                "tensions": ["the lockbox bears a guild crest", "storm returning by nightfall"],
            })
        },
    },
    Beginning {
        key: "lantern-ward",
        title: "The Lantern Ward",
        description: "Night shift in a city district where the lamps are going out one by one.",
        seed: || {
            json!({
                "opening_location": "Lantern Ward gatehouse, city of Vess",
                "hook": "Three lamplighters have quit in a week; the fourth left a note.",
                "npcs": ["Warden Ilse", "A nervous lamplighter's apprentice"],
                "tensions": ["something moves between the dark lamps", "the ward council denies everything"],
            })
        },
    },
];

fn eirath_data() -> Value {
    json!({
        "races": {
            "Human": {
                "lifespan": "~80 years",
                "traits": ["adaptable", "ambitious"],
                "culture": "Diverse city-states; festivals mark the trade seasons.",
            },
            "Elf": {
                "lifespan": "unaging until crowned",
                "traits": ["attuned to magic", "patient"],
                "culture": "Art bound to memory; monarchs age swiftly, shaping succession myths.",
            },
            "Dwarf": {
                "lifespan": "~200 years",
                "traits": ["stubborn", "craft-bound"],
                "culture": "Guild clans whose oaths carry legal weight across the holds.",
            },
            "Halfling": {
                "lifespan": "~100 years",
                "traits": ["cheerful", "resourceful"],
                "culture": "Market caravans; hospitality is sacred.",
            },
            "Tiefling": {
                "lifespan": "humanlike",
                "traits": ["fiend-touched", "resilient"],
                "culture": "Diasporic enclaves; reputations negotiated through favor-debts.",
            },
        },
        "calendars": {
            "major_holidays": [
                "Last Ember (the year's turning)",
                "First Sowing (spring pledge)",
                "Veil Night (ancestral remembrance)",
            ],
        },
        "religions": [
            "The Octave (eight domains of virtue)",
            "The Tide (sea-pact cults)",
        ],
        "magic": {
            "sources": ["ley-lines", "oaths", "bloodline relics"],
            "taboos": ["binding true names"],
        },
        "politics_template": {
            "blocs": ["Guild Compact", "Wardens' League", "Night Veil"],
            "notes": "Templates only; actual alliances are generated per story.",
        },
    })
}
