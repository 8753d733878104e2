//! Built-in handlers registered at process startup

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{EventContext, Handler, HandlerFactory, HandlerTrigger};
use crate::database::Database;

/// The default handler set, registered once in main. Mirrors the explicit
/// registration-list approach: no runtime discovery.
pub fn builtin_handlers(database: &Database) -> Vec<Arc<dyn HandlerFactory>> {
    vec![
        Arc::new(ProjectEventFactory),
        Arc::new(AssetRevisionFactory {
            database: database.clone(),
        }),
        Arc::new(GithubEventFactory),
    ]
}

fn context_str<'a>(context: &'a EventContext, key: &str) -> Option<&'a str> {
    context.get(key).and_then(Value::as_str)
}

// --- Project lifecycle ----------------------------------------------------

pub struct ProjectEventFactory;

struct ProjectEventHandler {
    context: EventContext,
    trigger: HandlerTrigger,
}

impl HandlerFactory for ProjectEventFactory {
    fn name(&self) -> &'static str {
        "ProjectEventHandler"
    }

    fn triggers(&self) -> Vec<HandlerTrigger> {
        vec![
            HandlerTrigger::ProjectCreated,
            HandlerTrigger::ProjectUpdated,
            HandlerTrigger::ProjectRemoved,
        ]
    }

    fn instantiate(
        &self,
        context: EventContext,
        trigger: HandlerTrigger,
    ) -> Result<Box<dyn Handler>> {
        Ok(Box::new(ProjectEventHandler { context, trigger }))
    }
}

#[async_trait]
impl Handler for ProjectEventHandler {
    async fn handle(&mut self) -> Result<String> {
        let name = self
            .context
            .get("project")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("<unknown>");
        info!("Project event {}: {}", self.trigger.as_str(), name);
        Ok(format!("{} for project {}", self.trigger.as_str(), name))
    }
}

// --- Asset revisions ------------------------------------------------------

pub struct AssetRevisionFactory {
    database: Database,
}

struct AssetRevisionHandler {
    database: Database,
    context: EventContext,
}

impl HandlerFactory for AssetRevisionFactory {
    fn name(&self) -> &'static str {
        "AssetRevisionHandler"
    }

    fn triggers(&self) -> Vec<HandlerTrigger> {
        vec![HandlerTrigger::AssetUpdated]
    }

    fn instantiate(
        &self,
        context: EventContext,
        _trigger: HandlerTrigger,
    ) -> Result<Box<dyn Handler>> {
        Ok(Box::new(AssetRevisionHandler {
            database: self.database.clone(),
            context,
        }))
    }
}

#[async_trait]
impl Handler for AssetRevisionHandler {
    /// Record a revision note in the asset's audit trail whenever an asset
    /// update event fires.
    async fn handle(&mut self) -> Result<String> {
        let asset_id = self
            .context
            .get("asset")
            .and_then(|a| a.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("asset_updated event without asset id"))?;
        let asset_id = Uuid::parse_str(asset_id)?;

        let asset = self
            .database
            .get_asset(asset_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Asset {} no longer exists", asset_id))?;

        let mut map = match asset.extra_data {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        let revisions = map
            .entry("revision_history")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(entries) = revisions.as_array_mut() {
            entries.push(json!({
                "old_revision": context_str(&self.context, "old_revision"),
                "new_revision": context_str(&self.context, "new_revision"),
                "recorded_at": Utc::now().to_rfc3339(),
            }));
        }

        self.database
            .update_asset_extra_data(asset_id, &Value::Object(map))
            .await?;

        Ok(format!("Recorded revision for asset {asset_id}"))
    }
}

// --- GitHub activity ------------------------------------------------------

pub struct GithubEventFactory;

struct GithubEventHandler {
    context: EventContext,
    trigger: HandlerTrigger,
}

impl HandlerFactory for GithubEventFactory {
    fn name(&self) -> &'static str {
        "GithubEventHandler"
    }

    fn triggers(&self) -> Vec<HandlerTrigger> {
        vec![HandlerTrigger::GithubPush, HandlerTrigger::GithubPr]
    }

    fn instantiate(
        &self,
        context: EventContext,
        trigger: HandlerTrigger,
    ) -> Result<Box<dyn Handler>> {
        Ok(Box::new(GithubEventHandler { context, trigger }))
    }
}

#[async_trait]
impl Handler for GithubEventHandler {
    async fn handle(&mut self) -> Result<String> {
        let repo = context_str(&self.context, "repo_url").unwrap_or("<unknown>");
        match self.trigger {
            HandlerTrigger::GithubPush => {
                let commits = self
                    .context
                    .get("commits")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                info!("GitHub push on {}: {} commits", repo, commits);
                Ok(format!("push on {repo} ({commits} commits)"))
            }
            HandlerTrigger::GithubPr => {
                let title = context_str(&self.context, "title").unwrap_or("<untitled>");
                info!("GitHub PR on {}: {}", repo, title);
                Ok(format!("pull request on {repo}: {title}"))
            }
            other => anyhow::bail!("GithubEventHandler fired for {}", other.as_str()),
        }
    }
}
