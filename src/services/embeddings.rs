//! Embedding backend collaborator

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::EmbeddingsConfig;
use crate::errors::AppError;

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed one text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Client for an Ollama-style embeddings HTTP endpoint.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl HttpEmbeddingClient {
    pub fn new(config: &EmbeddingsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response: EmbeddingResponse = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await?
            .json()
            .await?;

        if response.embedding.len() != self.dimension {
            return Err(AppError::external_service(
                "embeddings",
                format!(
                    "Expected dimension {}, got {}",
                    self.dimension,
                    response.embedding.len()
                ),
            )
            .into());
        }

        Ok(response.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
