//! Embedding provider seam and the Voyage AI client.
//!
//! One external call per invocation, no batching assumed; the engine's
//! queue serializes calls, so the provider stays simple.

use crate::error::{EngineError, Result, UpstreamKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const VOYAGE_API_BASE: &str = "https://api.voyageai.com/v1";
const DEFAULT_EMBEDDING_MODEL: &str = "voyage-3";

/// The fixed dimensionality of cached embeddings.
pub const EMBEDDING_DIMENSIONS: usize = 1024;

/// Computes vector embeddings for index documents.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimensionality of the vectors this provider produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSIONS
    }
}

/// Voyage AI embeddings client.
pub struct Voyage {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl Voyage {
    /// Create a new client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
            api_key: api_key.into(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }

    /// Create a client from the VOYAGE_API_KEY environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("VOYAGE_API_KEY")
            .map_err(|_| EngineError::Validation("VOYAGE_API_KEY is not set".to_string()))?;
        Ok(Self::new(api_key))
    }

    /// Set the embedding model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: [&'a str; 1],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for Voyage {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{VOYAGE_API_BASE}/embeddings"))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                input: [text],
                model: &self.model,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::upstream(UpstreamKind::Timeout, "embedding request timed out")
                } else {
                    EngineError::upstream(UpstreamKind::Network, e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = if status.as_u16() == 429 {
                UpstreamKind::RateLimited
            } else {
                UpstreamKind::Api
            };
            return Err(EngineError::upstream(
                kind,
                format!("status {status}: {body}"),
            ));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EngineError::upstream(UpstreamKind::Api, e.to_string()))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| {
                EngineError::upstream(UpstreamKind::Api, "no embedding data in response")
            })
    }
}
