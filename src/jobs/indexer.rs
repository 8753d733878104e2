//! Bounty-platform indexer job
//!
//! Pulls the current program list from a platform collaborator, diffs it
//! against the stored projects and assets, applies the difference and emits
//! lifecycle events. In initialize mode (first population of an empty
//! database) events are suppressed so handlers are not flooded with
//! thousands of synthetic creations.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

use super::{Job, JobContext};
use crate::handlers::{EventContext, HandlerTrigger};
use crate::models::{JobResult, NewAsset, Project};
use crate::services::{PlatformIndexer, PlatformProject};

pub struct IndexerJob {
    platform: Arc<dyn PlatformIndexer>,
    initialize_mode: bool,
}

#[derive(Default)]
struct SyncCounters {
    projects_created: usize,
    projects_updated: usize,
    projects_removed: usize,
    assets_added: usize,
    assets_removed: usize,
    failed: usize,
}

impl IndexerJob {
    pub fn new(platform: Arc<dyn PlatformIndexer>, initialize_mode: bool) -> Self {
        Self {
            platform,
            initialize_mode,
        }
    }

    async fn emit(&self, ctx: &JobContext, trigger: HandlerTrigger, context: EventContext) {
        if self.initialize_mode {
            return;
        }
        ctx.event_bus.trigger_event(trigger, context).await;
    }

    async fn sync_project(
        &self,
        ctx: &JobContext,
        fetched: &PlatformProject,
        existing: Option<&Project>,
        counters: &mut SyncCounters,
    ) -> Result<()> {
        let project = match existing {
            None => {
                let project = ctx
                    .database
                    .create_project(
                        &fetched.name,
                        self.platform.platform(),
                        fetched.description.as_deref(),
                        fetched.max_bounty,
                    )
                    .await?;
                counters.projects_created += 1;

                let mut context = EventContext::new();
                context.insert("project".to_string(), serde_json::to_value(&project)?);
                self.emit(ctx, HandlerTrigger::ProjectCreated, context).await;
                project
            }
            Some(existing) => {
                let changed = existing.description != fetched.description
                    || existing.max_bounty != fetched.max_bounty;
                let mut project = existing.clone();
                if changed {
                    project.description = fetched.description.clone();
                    project.max_bounty = fetched.max_bounty;
                    ctx.database.update_project(&project).await?;
                    counters.projects_updated += 1;

                    let mut context = EventContext::new();
                    context.insert("project".to_string(), serde_json::to_value(&project)?);
                    context.insert(
                        "old_project".to_string(),
                        serde_json::to_value(existing)?,
                    );
                    self.emit(ctx, HandlerTrigger::ProjectUpdated, context).await;
                }
                project
            }
        };

        // Asset diff within the project.
        let stored = ctx.database.list_assets(Some(project.id)).await?;
        let fetched_identifiers: HashSet<&str> = fetched
            .assets
            .iter()
            .filter(|a| a.kind().is_some())
            .map(|a| a.url.as_str())
            .collect();

        for platform_asset in &fetched.assets {
            let Some(asset_type) = platform_asset.kind() else {
                continue;
            };
            if stored.iter().any(|a| a.identifier == platform_asset.url) {
                continue;
            }
            let asset = ctx
                .database
                .create_asset(&NewAsset {
                    identifier: platform_asset.url.clone(),
                    project_id: project.id,
                    asset_type,
                    source_url: Some(platform_asset.url.clone()),
                    local_path: None,
                    extra_data: json!({}),
                })
                .await?;
            counters.assets_added += 1;

            let mut context = EventContext::new();
            context.insert("asset".to_string(), serde_json::to_value(&asset)?);
            context.insert("project".to_string(), serde_json::to_value(&project)?);
            self.emit(ctx, HandlerTrigger::NewAsset, context).await;
        }

        for asset in stored {
            if fetched_identifiers.contains(asset.identifier.as_str()) {
                continue;
            }
            // Implementation assets are managed by the proxy monitor, not the
            // platform feed; leave them alone.
            if asset
                .extra_data
                .get("is_implementation")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                continue;
            }
            ctx.database.delete_asset(asset.id).await?;
            counters.assets_removed += 1;

            let mut context = EventContext::new();
            context.insert("asset".to_string(), serde_json::to_value(&asset)?);
            self.emit(ctx, HandlerTrigger::AssetRemoved, context).await;
        }

        Ok(())
    }
}

#[async_trait]
impl Job for IndexerJob {
    fn job_type(&self) -> &str {
        "indexer"
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobResult> {
        let platform = self.platform.platform().to_string();
        info!("Starting {} sync (initialize: {})", platform, self.initialize_mode);

        // Failures here are job-fatal.
        let fetched = self.platform.fetch_projects().await?;
        let existing = ctx.database.list_projects(Some(&platform)).await?;
        info!(
            "Fetched {} projects from {} ({} stored)",
            fetched.len(),
            platform,
            existing.len()
        );

        let mut counters = SyncCounters::default();
        let mut seen: HashSet<String> = HashSet::new();

        for fetched_project in &fetched {
            if ctx.cancel.is_cancelled() {
                info!("Indexer cancelled mid-sync");
                break;
            }
            seen.insert(fetched_project.name.clone());
            let current = existing.iter().find(|p| p.name == fetched_project.name);

            if let Err(e) = self
                .sync_project(ctx, fetched_project, current, &mut counters)
                .await
            {
                error!(
                    "Failed to sync project {}: {:#}",
                    fetched_project.name, e
                );
                counters.failed += 1;
            }
        }

        // Projects gone from the feed are removed, assets cascading with them.
        if !ctx.cancel.is_cancelled() {
            for project in &existing {
                if seen.contains(&project.name) {
                    continue;
                }
                match ctx.database.delete_project(project.id).await {
                    Ok(_) => {
                        counters.projects_removed += 1;
                        let mut context = EventContext::new();
                        context.insert("project".to_string(), serde_json::to_value(project)?);
                        self.emit(ctx, HandlerTrigger::ProjectRemoved, context).await;
                    }
                    Err(e) => {
                        error!("Failed to remove project {}: {:#}", project.name, e);
                        counters.failed += 1;
                    }
                }
            }
        }

        let mut result = JobResult::new(
            counters.failed == 0,
            format!(
                "Synced {} projects from {} ({} failed)",
                fetched.len(),
                platform,
                counters.failed
            ),
        )
        .with_data(json!({
            "projects_created": counters.projects_created,
            "projects_updated": counters.projects_updated,
            "projects_removed": counters.projects_removed,
            "assets_added": counters.assets_added,
            "assets_removed": counters.assets_removed,
            "failed": counters.failed,
        }));
        result.add_output(format!(
            "{} created, {} updated, {} removed projects",
            counters.projects_created, counters.projects_updated, counters.projects_removed
        ));
        result.add_output(format!(
            "{} added, {} removed assets",
            counters.assets_added, counters.assets_removed
        ));

        Ok(result)
    }
}
