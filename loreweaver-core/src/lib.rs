//! Persistent agentic narrative engine.
//!
//! An LLM Game Master maintains a consistent fictional world across play
//! sessions: each turn retrieves the relevant slice of the world model via
//! vector search, narrates through a bounded tool-calling loop, and commits
//! the resulting mutations back to storage, where they are lazily
//! re-embedded for future retrieval.
//!
//! This crate provides:
//! - The card/memory/relationship/stat data model with deep-merge upserts
//! - An incremental embedding cache with a dedup-by-key refresh queue
//! - Retrieval-augmented context assembly for bounded prompts
//! - Fuzzy entity resolution for unreliable LLM tool calls
//! - The turn orchestrator and the story summary reconciler
//!
//! # Quick Start
//!
//! ```ignore
//! use loreweaver_core::{GameMaster, UserAction, TurnOptions, WorldStore};
//! use loreweaver_core::model::StoryDraft;
//! use loreweaver_core::storage::MemoryStorage;
//! use loreweaver_core::embedding::Voyage;
//! use loreweaver_core::id::UserId;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = WorldStore::new(
//!         Arc::new(MemoryStorage::new()),
//!         Arc::new(Voyage::from_env()?),
//!     );
//!     let gm = GameMaster::new(Arc::new(claude::Claude::from_env()?), store.clone());
//!
//!     let story = store
//!         .create_story(StoryDraft::new(UserId::new(), "Ash and Ivy").with_world("eirath"))
//!         .await?;
//!     let outcome = gm
//!         .run_turn(UserAction::Continue, story.id, TurnOptions::default())
//!         .await?;
//!     println!("{}", outcome.text);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod chat;
pub mod dice;
pub mod embedding;
pub mod error;
pub mod id;
pub mod index;
pub mod merge;
pub mod model;
pub mod queue;
pub mod resolve;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod summary;
pub mod testing;
pub mod tools;
pub mod world;

// Primary public API
pub use agent::{GameMaster, GameMasterConfig, TurnOptions, TurnOutcome, UserAction};
pub use error::{EngineError, Result, UpstreamKind};
pub use store::{ContextOptions, ContextSnapshot, WorldStore};
pub use summary::{SummaryPayload, SummaryReport};
