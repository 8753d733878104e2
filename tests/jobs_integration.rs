//! Job integration tests: embed, file search and platform sync running
//! against an in-memory database with mocked collaborators.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use chainscout::config::DatabaseConfig;
use chainscout::database::Database;
use chainscout::handlers::{
    EventBus, EventContext, Handler, HandlerFactory, HandlerTrigger,
};
use chainscout::jobs::embed::EmbedJob;
use chainscout::jobs::file_search::FileSearchJob;
use chainscout::jobs::indexer::IndexerJob;
use chainscout::jobs::{cancel_pair, Job, JobContext, JobManager};
use chainscout::models::{AssetType, JobInfo, JobStatus, NewAsset};
use chainscout::services::{
    EmbeddingClient, PlatformAsset, PlatformIndexer, PlatformProject,
};

async fn test_database() -> Database {
    let config = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: Some(1),
    };
    let database = Database::new(&config).await.unwrap();
    database.migrate().await.unwrap();
    database
}

fn job_context(database: &Database, event_bus: &EventBus) -> JobContext {
    let (_handle, flag) = cancel_pair();
    JobContext::new(database.clone(), event_bus.clone(), flag)
}

async fn wait_terminal(manager: &JobManager, id: Uuid) -> JobInfo {
    for _ in 0..500 {
        if let Some(info) = manager.get_job(id).await {
            if info.status.is_terminal() {
                return info;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never reached a terminal state");
}

struct MockEmbedder {
    failing_identifiers: Vec<String>,
}

#[async_trait]
impl EmbeddingClient for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.failing_identifiers.iter().any(|f| text.contains(f)) {
            anyhow::bail!("embedding backend refused the input");
        }
        Ok(vec![0.25, 0.5, 0.75, 1.0])
    }

    fn dimension(&self) -> usize {
        4
    }
}

async fn seed_assets(database: &Database, count: usize) -> Vec<Uuid> {
    let project = database
        .create_project("acme", "immunefi", None, None)
        .await
        .unwrap();
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let asset = database
            .create_asset(&NewAsset {
                identifier: format!("https://github.com/acme/repo-{i}"),
                project_id: project.id,
                asset_type: AssetType::GithubRepo,
                source_url: None,
                local_path: None,
                extra_data: json!({}),
            })
            .await
            .unwrap();
        ids.push(asset.id);
    }
    ids
}

#[tokio::test]
async fn embed_job_persists_embeddings_in_batches() {
    let database = test_database().await;
    let event_bus = EventBus::new();
    let manager = JobManager::new(database.clone(), event_bus.clone());
    let ids = seed_assets(&database, 12).await;

    let job = Arc::new(EmbedJob::new(Arc::new(MockEmbedder {
        failing_identifiers: Vec::new(),
    })));
    let id = manager.submit_job(job).await.unwrap();
    let info = wait_terminal(&manager, id).await;

    assert_eq!(info.status, JobStatus::Completed);
    let result = info.result.unwrap();
    assert!(result.success);
    assert_eq!(result.data["processed"], 12);
    assert_eq!(result.data["failed"], 0);
    // 12 assets at a batch size of 10: one full commit plus the remainder.
    assert_eq!(result.data["commits"], 2);

    let embedding = database.get_embedding(ids[0]).await.unwrap().unwrap();
    assert_eq!(embedding, vec![0.25, 0.5, 0.75, 1.0]);
}

#[tokio::test]
async fn embed_job_counts_per_asset_failures() {
    let database = test_database().await;
    let event_bus = EventBus::new();
    let manager = JobManager::new(database.clone(), event_bus.clone());
    seed_assets(&database, 3).await;

    let job = Arc::new(EmbedJob::new(Arc::new(MockEmbedder {
        failing_identifiers: vec!["repo-1".to_string()],
    })));
    let id = manager.submit_job(job).await.unwrap();
    let info = wait_terminal(&manager, id).await;

    // A partial failure is still a completed run; the result records it.
    assert_eq!(info.status, JobStatus::Completed);
    let result = info.result.unwrap();
    assert!(!result.success);
    assert_eq!(result.data["processed"], 2);
    assert_eq!(result.data["failed"], 1);
}

#[tokio::test]
async fn file_search_matches_and_respects_result_cap() {
    let database = test_database().await;
    let event_bus = EventBus::new();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("Token.sol"),
        "contract Token {\n    function transfer() public {}\n    function approve() public {}\n}\n",
    )
    .unwrap();
    std::fs::create_dir(dir.path().join("lib")).unwrap();
    std::fs::write(
        dir.path().join("lib").join("Vault.sol"),
        "contract Vault {\n    function withdraw() public {}\n}\n",
    )
    .unwrap();

    let project = database
        .create_project("acme", "immunefi", None, None)
        .await
        .unwrap();
    database
        .create_asset(&NewAsset {
            identifier: "https://etherscan.io/address/0xabc".to_string(),
            project_id: project.id,
            asset_type: AssetType::DeployedContract,
            source_url: None,
            local_path: Some(dir.path().display().to_string()),
            extra_data: json!({}),
        })
        .await
        .unwrap();

    let job = FileSearchJob::new(r"function\s+\w+", 100).unwrap();
    let ctx = job_context(&database, &event_bus);
    let result = job.run(&ctx).await.unwrap();
    assert!(result.success);
    assert_eq!(result.data["total"], 3);
    assert_eq!(result.data["capped"], false);

    let job = FileSearchJob::new(r"function\s+\w+", 2).unwrap();
    let result = job.run(&ctx).await.unwrap();
    assert_eq!(result.data["total"], 2);
    assert_eq!(result.data["capped"], true);
}

struct ScriptedPlatform {
    feed: Mutex<Vec<PlatformProject>>,
}

#[async_trait]
impl PlatformIndexer for ScriptedPlatform {
    fn platform(&self) -> &str {
        "immunefi"
    }

    async fn fetch_projects(&self) -> Result<Vec<PlatformProject>> {
        Ok(self.feed.lock().unwrap().clone())
    }
}

struct TriggerCounterFactory {
    counts: Arc<Mutex<HashMap<&'static str, usize>>>,
}

struct TriggerCounterHandler {
    counts: Arc<Mutex<HashMap<&'static str, usize>>>,
    trigger: HandlerTrigger,
}

#[async_trait]
impl Handler for TriggerCounterHandler {
    async fn handle(&mut self) -> Result<String> {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(self.trigger.as_str())
            .or_insert(0) += 1;
        Ok("counted".to_string())
    }
}

impl HandlerFactory for TriggerCounterFactory {
    fn name(&self) -> &'static str {
        "trigger_counter"
    }

    fn triggers(&self) -> Vec<HandlerTrigger> {
        vec![
            HandlerTrigger::ProjectCreated,
            HandlerTrigger::ProjectUpdated,
            HandlerTrigger::ProjectRemoved,
            HandlerTrigger::NewAsset,
            HandlerTrigger::AssetRemoved,
        ]
    }

    fn instantiate(
        &self,
        _context: EventContext,
        trigger: HandlerTrigger,
    ) -> Result<Box<dyn Handler>> {
        Ok(Box::new(TriggerCounterHandler {
            counts: Arc::clone(&self.counts),
            trigger,
        }))
    }
}

fn platform_project(name: &str, max_bounty: Option<f64>, assets: Vec<(&str, &str)>) -> PlatformProject {
    PlatformProject {
        name: name.to_string(),
        description: Some(format!("{name} bounty program")),
        max_bounty,
        assets: assets
            .into_iter()
            .map(|(url, asset_type)| PlatformAsset {
                url: url.to_string(),
                asset_type: asset_type.to_string(),
            })
            .collect(),
    }
}

#[tokio::test]
async fn indexer_applies_feed_diff_and_emits_events() {
    let database = test_database().await;
    let event_bus = EventBus::new();
    let counts = Arc::new(Mutex::new(HashMap::new()));
    event_bus
        .register_handler(Arc::new(TriggerCounterFactory {
            counts: Arc::clone(&counts),
        }))
        .await;

    let platform = Arc::new(ScriptedPlatform {
        feed: Mutex::new(vec![
            platform_project(
                "acme",
                Some(50_000.0),
                vec![
                    ("https://github.com/acme/core", "github_repo"),
                    ("https://etherscan.io/address/0xabc", "smart_contract"),
                ],
            ),
            platform_project("globex", None, vec![]),
        ]),
    });

    // First population runs in initialize mode: no event flood.
    let job = IndexerJob::new(Arc::clone(&platform) as Arc<dyn PlatformIndexer>, true);
    let ctx = job_context(&database, &event_bus);
    let result = job.run(&ctx).await.unwrap();
    assert!(result.success);
    assert_eq!(result.data["projects_created"], 2);
    assert_eq!(result.data["assets_added"], 2);
    assert!(counts.lock().unwrap().is_empty());

    // Feed moves: acme raises its bounty and drops the repo, globex is gone.
    *platform.feed.lock().unwrap() = vec![platform_project(
        "acme",
        Some(100_000.0),
        vec![("https://etherscan.io/address/0xabc", "smart_contract")],
    )];

    let job = IndexerJob::new(Arc::clone(&platform) as Arc<dyn PlatformIndexer>, false);
    let result = job.run(&ctx).await.unwrap();
    assert!(result.success);
    assert_eq!(result.data["projects_updated"], 1);
    assert_eq!(result.data["projects_removed"], 1);
    assert_eq!(result.data["assets_removed"], 1);

    let counts = counts.lock().unwrap();
    assert_eq!(counts.get("project_updated"), Some(&1));
    assert_eq!(counts.get("project_removed"), Some(&1));
    assert_eq!(counts.get("asset_removed"), Some(&1));

    let projects = database.list_projects(Some("immunefi")).await.unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].max_bounty, Some(100_000.0));
    let assets = database.list_assets(Some(projects[0].id)).await.unwrap();
    assert_eq!(assets.len(), 1);
}

#[tokio::test]
async fn indexer_leaves_implementation_assets_alone() {
    let database = test_database().await;
    let event_bus = EventBus::new();

    let platform = Arc::new(ScriptedPlatform {
        feed: Mutex::new(vec![platform_project("acme", None, vec![])]),
    });
    let ctx = job_context(&database, &event_bus);
    IndexerJob::new(Arc::clone(&platform) as Arc<dyn PlatformIndexer>, true)
        .run(&ctx)
        .await
        .unwrap();

    let projects = database.list_projects(Some("immunefi")).await.unwrap();
    // Implementation assets are created by the proxy monitor and are not in
    // the platform feed; a sync must not garbage-collect them.
    let implementation = database
        .create_asset(&NewAsset {
            identifier: "https://etherscan.io/address/0xdef".to_string(),
            project_id: projects[0].id,
            asset_type: AssetType::DeployedContract,
            source_url: None,
            local_path: None,
            extra_data: json!({ "is_implementation": true }),
        })
        .await
        .unwrap();

    let result = IndexerJob::new(Arc::clone(&platform) as Arc<dyn PlatformIndexer>, false)
        .run(&ctx)
        .await
        .unwrap();
    assert_eq!(result.data["assets_removed"], 0);
    assert!(database
        .get_asset(implementation.id)
        .await
        .unwrap()
        .is_some());
}
