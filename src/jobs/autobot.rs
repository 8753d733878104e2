//! Agent-prompt job

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::{Job, JobContext};
use crate::errors::AppError;
use crate::models::JobResult;
use crate::services::Agent;

pub struct AutobotJob {
    agent: Arc<dyn Agent>,
    prompt: String,
}

impl AutobotJob {
    /// An empty prompt is rejected before any work is scheduled.
    pub fn new<S: Into<String>>(agent: Arc<dyn Agent>, prompt: S) -> Result<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(AppError::validation("Autobot prompt must not be empty").into());
        }
        Ok(Self { agent, prompt })
    }
}

#[async_trait]
impl Job for AutobotJob {
    fn job_type(&self) -> &str {
        "autobot"
    }

    async fn run(&self, _ctx: &JobContext) -> Result<JobResult> {
        let started_at = Utc::now();
        info!("Running autobot task");

        let outcome = self.agent.execute_task(&self.prompt).await?;

        if !outcome.success {
            let error = outcome
                .error
                .unwrap_or_else(|| "Task failed without specific error message".to_string());
            anyhow::bail!(error);
        }

        let message = outcome
            .result
            .unwrap_or_else(|| "Task completed successfully".to_string());
        let execution_time = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;

        Ok(JobResult::success(message).with_data(json!({
            "prompt": self.prompt,
            "execution_time": execution_time,
        })))
    }
}
