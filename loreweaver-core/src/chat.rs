//! Chat provider seam.
//!
//! The orchestrator speaks to the LLM through this trait so tests can
//! script responses without network access.

use crate::error::Result;
use async_trait::async_trait;

/// A chat-completion provider with tool-use support.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Run one completion.
    async fn complete(&self, request: claude::Request) -> Result<claude::Response>;
}

#[async_trait]
impl ChatProvider for claude::Claude {
    async fn complete(&self, request: claude::Request) -> Result<claude::Response> {
        claude::Claude::complete(self, request).await.map_err(Into::into)
    }
}
