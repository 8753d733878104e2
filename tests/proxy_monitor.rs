//! End-to-end proxy monitoring reconciliation against an in-memory database
//! with mocked explorer and source-fetcher collaborators.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chainscout::config::DatabaseConfig;
use chainscout::database::Database;
use chainscout::handlers::{
    EventBus, EventContext, Handler, HandlerFactory, HandlerTrigger,
};
use chainscout::jobs::proxy_monitor::ProxyMonitorJob;
use chainscout::jobs::{cancel_pair, Job, JobContext};
use chainscout::models::{Asset, AssetType, NewAsset, Project};
use chainscout::services::{Explorer, ProxyUpgradeEvent, SourceFetcher};

struct MockExplorer {
    events: HashMap<String, Vec<ProxyUpgradeEvent>>,
    failing: Vec<String>,
    calls: AtomicUsize,
}

impl MockExplorer {
    fn new(events: HashMap<String, Vec<ProxyUpgradeEvent>>) -> Self {
        Self {
            events,
            failing: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing_for(mut self, identifier: &str) -> Self {
        self.failing.push(identifier.to_string());
        self
    }
}

#[async_trait]
impl Explorer for MockExplorer {
    async fn get_proxy_upgrade_events(&self, identifier: &str) -> Result<Vec<ProxyUpgradeEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.iter().any(|f| f == identifier) {
            anyhow::bail!("explorer unavailable for {identifier}");
        }
        Ok(self.events.get(identifier).cloned().unwrap_or_default())
    }
}

struct RecordingFetcher {
    calls: Mutex<Vec<String>>,
}

impl RecordingFetcher {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SourceFetcher for RecordingFetcher {
    async fn fetch_verified_sources(&self, url: &str, _target_dir: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

struct CapturingHandler {
    captured: Arc<Mutex<Vec<EventContext>>>,
    context: EventContext,
}

#[async_trait]
impl Handler for CapturingHandler {
    async fn handle(&mut self) -> Result<String> {
        self.captured.lock().unwrap().push(self.context.clone());
        Ok("captured".to_string())
    }
}

struct UpgradeCaptureFactory {
    captured: Arc<Mutex<Vec<EventContext>>>,
}

impl HandlerFactory for UpgradeCaptureFactory {
    fn name(&self) -> &'static str {
        "upgrade_capture"
    }

    fn triggers(&self) -> Vec<HandlerTrigger> {
        vec![HandlerTrigger::ContractUpgraded]
    }

    fn instantiate(
        &self,
        context: EventContext,
        _trigger: HandlerTrigger,
    ) -> Result<Box<dyn Handler>> {
        Ok(Box::new(CapturingHandler {
            captured: Arc::clone(&self.captured),
            context,
        }))
    }
}

async fn test_database() -> Database {
    let config = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: Some(1),
    };
    let database = Database::new(&config).await.unwrap();
    database.migrate().await.unwrap();
    database
}

async fn seed_contract(database: &Database, project: &Project, identifier: &str) -> Asset {
    database
        .create_asset(&NewAsset {
            identifier: identifier.to_string(),
            project_id: project.id,
            asset_type: AssetType::DeployedContract,
            source_url: Some(identifier.to_string()),
            local_path: None,
            extra_data: json!({}),
        })
        .await
        .unwrap()
}

fn upgrade_event(implementation: &str, block_number: u64) -> ProxyUpgradeEvent {
    ProxyUpgradeEvent {
        implementation: implementation.to_string(),
        block_number,
        timestamp: 1_700_000_000 + block_number as i64,
    }
}

fn job_context(database: &Database, event_bus: &EventBus) -> JobContext {
    let (_handle, flag) = cancel_pair();
    // The handle is dropped: the flag never reports cancelled.
    JobContext::new(database.clone(), event_bus.clone(), flag)
}

async fn run_monitor(
    database: &Database,
    event_bus: &EventBus,
    explorer: Arc<MockExplorer>,
    fetcher: Arc<RecordingFetcher>,
) -> chainscout::models::JobResult {
    let job = ProxyMonitorJob::new(explorer, fetcher, PathBuf::from("/tmp/chainscout-test"));
    let ctx = job_context(database, event_bus);
    job.run(&ctx).await.unwrap()
}

const PROXY_URL: &str = "https://etherscan.io/address/0x1111111111111111111111111111111111111111";
const IMPL_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const IMPL_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

#[tokio::test]
async fn contract_without_upgrade_events_is_flagged_and_stays_excluded() {
    let database = test_database().await;
    let event_bus = EventBus::new();
    let project = database
        .create_project("acme", "immunefi", None, None)
        .await
        .unwrap();
    let contract = seed_contract(&database, &project, PROXY_URL).await;

    let explorer = Arc::new(MockExplorer::new(HashMap::new()));
    let fetcher = Arc::new(RecordingFetcher::new());

    let result = run_monitor(&database, &event_bus, Arc::clone(&explorer), fetcher).await;
    assert!(result.success);
    assert_eq!(result.data["flagged_not_proxy"], 1);

    let stored = database.get_asset(contract.id).await.unwrap().unwrap();
    assert!(stored.is_not_proxy());
    assert!(database.list_proxy_candidates().await.unwrap().is_empty());

    // The flag is sticky: a second sweep never queries the explorer again.
    let calls_before = explorer.calls.load(Ordering::SeqCst);
    let fetcher = Arc::new(RecordingFetcher::new());
    let result = run_monitor(&database, &event_bus, Arc::clone(&explorer), fetcher).await;
    assert_eq!(result.data["checked"], 0);
    assert_eq!(explorer.calls.load(Ordering::SeqCst), calls_before);
}

#[tokio::test]
async fn upgrade_relinks_proxy_and_appends_one_history_entry() {
    let database = test_database().await;
    let event_bus = EventBus::new();
    let captured = Arc::new(Mutex::new(Vec::new()));
    event_bus
        .register_handler(Arc::new(UpgradeCaptureFactory {
            captured: Arc::clone(&captured),
        }))
        .await;

    let project = database
        .create_project("acme", "immunefi", None, None)
        .await
        .unwrap();
    let contract = seed_contract(&database, &project, PROXY_URL).await;

    let mut events = HashMap::new();
    events.insert(PROXY_URL.to_string(), vec![upgrade_event(IMPL_A, 100)]);
    let explorer = Arc::new(MockExplorer::new(events));
    let fetcher = Arc::new(RecordingFetcher::new());

    let result = run_monitor(
        &database,
        &event_bus,
        Arc::clone(&explorer),
        Arc::clone(&fetcher),
    )
    .await;
    assert!(result.success);
    assert_eq!(result.data["upgraded"], 1);

    let proxy = database.get_asset(contract.id).await.unwrap().unwrap();
    let impl_id = proxy.implementation_id.expect("proxy should be re-linked");
    let implementation = database.get_asset(impl_id).await.unwrap().unwrap();
    let expected_url = format!("https://etherscan.io/address/{IMPL_A}");
    assert_eq!(implementation.identifier, expected_url);

    let history = proxy.implementation_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].address, IMPL_A);
    assert_eq!(history[0].url, expected_url);
    assert_eq!(history[0].block_number, 100);
    assert_eq!(history[0].timestamp, 1_700_000_100);

    // Sources fetched once for the newly created implementation.
    assert_eq!(fetcher.call_count(), 1);

    // Exactly one ContractUpgraded dispatch, carrying the full context.
    let captured = captured.lock().unwrap();
    assert_eq!(captured.len(), 1);
    let context = &captured[0];
    assert_eq!(context["proxy"]["id"], contract.id.to_string());
    assert!(context["old_implementation"].is_null());
    assert_eq!(context["new_implementation"]["identifier"], expected_url);
    assert_eq!(context["event"]["implementation"], IMPL_A);
    assert_eq!(context["event"]["block_number"], 100);
}

#[tokio::test]
async fn repeated_sweep_with_same_events_is_idempotent() {
    let database = test_database().await;
    let event_bus = EventBus::new();
    let captured = Arc::new(Mutex::new(Vec::new()));
    event_bus
        .register_handler(Arc::new(UpgradeCaptureFactory {
            captured: Arc::clone(&captured),
        }))
        .await;

    let project = database
        .create_project("acme", "immunefi", None, None)
        .await
        .unwrap();
    let contract = seed_contract(&database, &project, PROXY_URL).await;

    let mut events = HashMap::new();
    events.insert(PROXY_URL.to_string(), vec![upgrade_event(IMPL_A, 100)]);
    let explorer = Arc::new(MockExplorer::new(events));
    let fetcher = Arc::new(RecordingFetcher::new());

    run_monitor(
        &database,
        &event_bus,
        Arc::clone(&explorer),
        Arc::clone(&fetcher),
    )
    .await;
    let second = run_monitor(
        &database,
        &event_bus,
        Arc::clone(&explorer),
        Arc::clone(&fetcher),
    )
    .await;

    assert_eq!(second.data["unchanged"], 1);
    assert_eq!(second.data["upgraded"], 0);

    let proxy = database.get_asset(contract.id).await.unwrap().unwrap();
    assert_eq!(proxy.implementation_history().len(), 1);
    assert_eq!(fetcher.call_count(), 1);
    assert_eq!(captured.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn subsequent_upgrade_appends_second_history_entry() {
    let database = test_database().await;
    let event_bus = EventBus::new();
    let project = database
        .create_project("acme", "immunefi", None, None)
        .await
        .unwrap();
    let contract = seed_contract(&database, &project, PROXY_URL).await;

    let mut events = HashMap::new();
    events.insert(PROXY_URL.to_string(), vec![upgrade_event(IMPL_A, 100)]);
    let explorer = Arc::new(MockExplorer::new(events));
    let fetcher = Arc::new(RecordingFetcher::new());
    run_monitor(
        &database,
        &event_bus,
        Arc::clone(&explorer),
        Arc::clone(&fetcher),
    )
    .await;

    // The chain has moved on since the first sweep.
    let mut events = HashMap::new();
    events.insert(
        PROXY_URL.to_string(),
        vec![upgrade_event(IMPL_A, 100), upgrade_event(IMPL_B, 200)],
    );
    let explorer = Arc::new(MockExplorer::new(events));
    let result = run_monitor(
        &database,
        &event_bus,
        Arc::clone(&explorer),
        Arc::clone(&fetcher),
    )
    .await;
    assert_eq!(result.data["upgraded"], 1);

    let proxy = database.get_asset(contract.id).await.unwrap().unwrap();
    let history = proxy.implementation_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].address, IMPL_B);

    let impl_id = proxy.implementation_id.unwrap();
    let implementation = database.get_asset(impl_id).await.unwrap().unwrap();
    assert_eq!(
        implementation.identifier,
        format!("https://etherscan.io/address/{IMPL_B}")
    );
}

#[tokio::test]
async fn one_failing_contract_does_not_abort_the_sweep() {
    let database = test_database().await;
    let event_bus = EventBus::new();
    let project = database
        .create_project("acme", "immunefi", None, None)
        .await
        .unwrap();

    let broken_url = "https://etherscan.io/address/0x2222222222222222222222222222222222222222";
    seed_contract(&database, &project, broken_url).await;
    let healthy = seed_contract(&database, &project, PROXY_URL).await;

    let mut events = HashMap::new();
    events.insert(PROXY_URL.to_string(), vec![upgrade_event(IMPL_A, 100)]);
    let explorer = Arc::new(MockExplorer::new(events).failing_for(broken_url));
    let fetcher = Arc::new(RecordingFetcher::new());

    let result = run_monitor(&database, &event_bus, explorer, fetcher).await;
    assert!(result.success);
    assert_eq!(result.data["failed"], 1);
    assert_eq!(result.data["upgraded"], 1);

    let proxy = database.get_asset(healthy.id).await.unwrap().unwrap();
    assert!(proxy.implementation_id.is_some());
}
