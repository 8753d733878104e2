//! Agent collaborator for prompt-driven jobs

use anyhow::Result;
use async_trait::async_trait;

/// Outcome of one agent task.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn success<S: Into<String>>(result: S) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn failure<S: Into<String>>(error: S) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// The autobot job drives whichever agent backend is wired in at startup.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn execute_task(&self, prompt: &str) -> Result<AgentOutcome>;
}
