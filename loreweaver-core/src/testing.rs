//! Testing utilities.
//!
//! - [`ScriptedChat`] returns scripted responses in order, with no network.
//! - [`HashEmbeddings`] is a deterministic bag-of-words embedder: texts
//!   that share tokens land near each other, which is enough to exercise
//!   retrieval ranking.
//! - [`TestHarness`] wires a full engine over in-memory storage.

use crate::agent::GameMaster;
use crate::chat::ChatProvider;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::id::UserId;
use crate::model::{Story, StoryDraft};
use crate::storage::MemoryStorage;
use crate::store::WorldStore;
use async_trait::async_trait;
use claude::{ContentBlock, Request, Response, StopReason, Usage};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A chat provider that replays scripted responses.
#[derive(Default)]
pub struct ScriptedChat {
    script: Mutex<VecDeque<Response>>,
    requests: Mutex<Vec<Request>>,
    counter: AtomicUsize,
}

impl ScriptedChat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain narrative response.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push_response(
            vec![ContentBlock::Text { text: text.into() }],
            StopReason::EndTurn,
        );
    }

    /// Queue a response that calls one tool (optionally with leading text).
    pub fn push_tool_call(&self, text: Option<&str>, name: impl Into<String>, input: Value) {
        let mut content = Vec::new();
        if let Some(text) = text {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        content.push(ContentBlock::ToolUse {
            id: format!("tu_{id}"),
            name: name.into(),
            input,
        });
        self.push_response(content, StopReason::ToolUse);
    }

    /// Queue a raw response.
    pub fn push_response(&self, content: Vec<ContentBlock>, stop_reason: StopReason) {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(Response {
                id: format!("msg_{id}"),
                model: "scripted".to_string(),
                content,
                stop_reason,
                usage: Usage {
                    input_tokens: 0,
                    output_tokens: 0,
                },
            });
    }

    /// How many completions have been requested.
    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// The most recent request, for prompt assertions.
    pub fn last_request(&self) -> Option<Request> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .cloned()
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn complete(&self, request: Request) -> Result<Response> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        Ok(scripted.unwrap_or_else(|| Response {
            id: "msg_default".to_string(),
            model: "scripted".to_string(),
            content: vec![ContentBlock::Text {
                text: "The narrator has no more scripted responses.".to_string(),
            }],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 0,
                output_tokens: 0,
            },
        }))
    }
}

/// Deterministic bag-of-words embedding provider.
pub struct HashEmbeddings {
    dimensions: usize,
}

impl HashEmbeddings {
    pub fn new() -> Self {
        Self { dimensions: 64 }
    }
}

impl Default for HashEmbeddings {
    fn default() -> Self {
        Self::new()
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (fnv1a(&token.to_lowercase()) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// A full engine over in-memory storage, scripted chat, and hash
/// embeddings, with one story created.
pub struct TestHarness {
    pub user: UserId,
    pub story: Story,
    pub chat: Arc<ScriptedChat>,
    pub store: WorldStore,
    pub gm: GameMaster,
}

impl TestHarness {
    /// Create a harness with a plain story (no world/beginning presets).
    pub async fn new() -> Result<Self> {
        let user = UserId::new();
        Self::with_draft(StoryDraft::new(user, "Test Story")).await
    }

    /// Create a harness from a custom story draft.
    pub async fn with_draft(draft: StoryDraft) -> Result<Self> {
        let store = WorldStore::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(HashEmbeddings::new()),
        );
        let chat = Arc::new(ScriptedChat::new());
        let gm = GameMaster::new(chat.clone(), store.clone());
        let user = draft.user_id;
        let story = store.create_story(draft).await?;
        Ok(Self {
            user,
            story,
            chat,
            store,
            gm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embeddings_are_deterministic() {
        let embedder = HashEmbeddings::new();
        let a = embedder.embed("the old tavern").await.expect("embeds");
        let b = embedder.embed("the old tavern").await.expect("embeds");
        assert_eq!(a, b);
        assert_eq!(a.len(), embedder.dimensions());
    }

    #[tokio::test]
    async fn test_shared_tokens_are_closer() {
        let embedder = HashEmbeddings::new();
        let query = embedder.embed("wolves on the ember road").await.expect("embeds");
        let near = embedder.embed("ember road wolves howl").await.expect("embeds");
        let far = embedder.embed("harbor tax ledger dispute").await.expect("embeds");

        let d_near = crate::storage::l2_distance(&query, &near);
        let d_far = crate::storage::l2_distance(&query, &far);
        assert!(d_near < d_far);
    }

    #[tokio::test]
    async fn test_scripted_chat_replays_in_order() {
        let chat = ScriptedChat::new();
        chat.push_text("first");
        chat.push_text("second");

        let request = Request::new(vec![claude::Message::user("hi")]);
        let one = chat.complete(request.clone()).await.expect("one");
        let two = chat.complete(request.clone()).await.expect("two");
        let three = chat.complete(request).await.expect("three");

        assert_eq!(one.text(), "first");
        assert_eq!(two.text(), "second");
        assert!(three.text().contains("no more scripted"));
        assert_eq!(chat.request_count(), 3);
    }
}
