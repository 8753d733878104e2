//! Embedding generation job
//!
//! Walks every asset, asks the embedding backend for a vector and persists
//! the results in batches. Long batches cede control periodically and
//! observe cancellation between items; a single asset failing only bumps the
//! failure counter.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Job, JobContext};
use crate::models::{Asset, JobResult};
use crate::services::EmbeddingClient;

/// Rows persisted per transaction.
const BATCH_SIZE: usize = 10;
/// Cooperative yield cadence inside the loop.
const YIELD_EVERY: usize = 5;

pub struct EmbedJob {
    client: Arc<dyn EmbeddingClient>,
}

impl EmbedJob {
    pub fn new(client: Arc<dyn EmbeddingClient>) -> Self {
        Self { client }
    }
}

/// Text the embedding is derived from.
fn embedding_text(asset: &Asset) -> String {
    let mut parts = vec![
        asset.identifier.clone(),
        asset.asset_type.as_str().to_string(),
    ];
    if let Some(source_url) = &asset.source_url {
        parts.push(source_url.clone());
    }
    if let Some(description) = asset.extra_data.get("description").and_then(|d| d.as_str()) {
        parts.push(description.to_string());
    }
    parts.join("\n")
}

#[async_trait]
impl Job for EmbedJob {
    fn job_type(&self) -> &str {
        "embed"
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobResult> {
        info!("Starting embedding generation");

        let assets = ctx.database.list_assets(None).await?;
        let total = assets.len();
        info!("Found {} assets to process", total);

        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut commits = 0usize;
        let mut batch: Vec<(Uuid, Vec<f32>)> = Vec::with_capacity(BATCH_SIZE);

        for (i, asset) in assets.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                info!("Embedding job cancelled after {} assets", processed);
                break;
            }

            if i % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }

            match self.client.embed(&embedding_text(asset)).await {
                Ok(embedding) if embedding.is_empty() => {
                    warn!("Empty embedding generated for asset {}", asset.id);
                    continue;
                }
                Ok(embedding) => {
                    batch.push((asset.id, embedding));
                    processed += 1;
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        "Failed to generate embedding for asset {}: {:#}",
                        asset.id, e
                    );
                    continue;
                }
            }

            if batch.len() >= BATCH_SIZE {
                ctx.database.update_embeddings(&batch).await?;
                commits += 1;
                batch.clear();
                tokio::task::yield_now().await;
            }
        }

        if !batch.is_empty() {
            ctx.database.update_embeddings(&batch).await?;
            commits += 1;
        }

        let mut result = JobResult::new(
            failed == 0,
            format!("Generated embeddings for {processed} assets ({failed} failed)"),
        )
        .with_data(json!({
            "processed": processed,
            "failed": failed,
            "commits": commits,
        }));

        if failed > 0 {
            result.add_output(format!("{failed} assets failed to process"));
        }
        result.add_output(format!("Successfully processed {processed} assets"));
        result.add_output(format!("Completed {commits} database commits"));

        Ok(result)
    }

    async fn stop(&self) {
        info!("Stopping embedding job");
    }
}
