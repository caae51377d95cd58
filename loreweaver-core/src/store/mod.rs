//! World store: the service layer over storage.
//!
//! [`WorldStore`] composes the storage backend, the embedding provider, and
//! the embedding queue, layering side effects (embedding refresh scheduling,
//! retrieval touch signals) over the storage layer's transactional
//! semantics. The implementation is spread over sibling modules by concern:
//! cards, memories/relationships/stats, stories/transcript, settings, and
//! the vector cache + retriever.

mod cards;
mod memories;
mod settings;
mod stories;
mod vector;

pub use vector::{ContextOptions, ContextSnapshot};

use crate::embedding::EmbeddingProvider;
use crate::queue::EmbeddingQueue;
use crate::storage::Storage;
use std::sync::Arc;

/// Handle to the story world: storage plus embedding machinery.
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct WorldStore {
    storage: Arc<dyn Storage>,
    embedder: Arc<dyn EmbeddingProvider>,
    queue: EmbeddingQueue,
}

impl WorldStore {
    /// Create a store with its own embedding queue.
    pub fn new(storage: Arc<dyn Storage>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_queue(storage, embedder, EmbeddingQueue::new())
    }

    /// Create a store sharing an existing queue (one queue per process is
    /// the normal arrangement; tests may want one per case).
    pub fn with_queue(
        storage: Arc<dyn Storage>,
        embedder: Arc<dyn EmbeddingProvider>,
        queue: EmbeddingQueue,
    ) -> Self {
        Self {
            storage,
            embedder,
            queue,
        }
    }

    /// The underlying storage backend.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The embedding refresh queue.
    pub fn queue(&self) -> &EmbeddingQueue {
        &self.queue
    }

    /// The embedding provider.
    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }
}
