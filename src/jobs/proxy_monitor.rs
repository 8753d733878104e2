//! Proxy contract monitoring job
//!
//! Reconciles stored deployed-contract assets against on-chain proxy upgrade
//! events: detect, diff against the linked implementation, persist the
//! re-link plus audit trail in one transaction, then emit a single
//! `ContractUpgraded` event. One contract failing never aborts the rest of
//! the sweep; only a failure outside the per-contract loop fails the job.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{Job, JobContext};
use crate::handlers::{EventContext, HandlerTrigger};
use crate::models::{Asset, AssetType, ImplementationRecord, JobResult, NewAsset};
use crate::services::{Explorer, SourceFetcher};

pub struct ProxyMonitorJob {
    explorer: Arc<dyn Explorer>,
    fetcher: Arc<dyn SourceFetcher>,
    data_dir: PathBuf,
}

enum CheckOutcome {
    /// No upgrade events ever: sticky `is_not_proxy` flag persisted.
    FlaggedNotProxy,
    /// Linked implementation already matches the latest event (or the
    /// identifier is not a supported explorer URL).
    Unchanged,
    /// Implementation re-linked, history appended, event emitted.
    Upgraded,
}

impl ProxyMonitorJob {
    pub fn new(
        explorer: Arc<dyn Explorer>,
        fetcher: Arc<dyn SourceFetcher>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            explorer,
            fetcher,
            data_dir,
        }
    }

    /// Mirror of the indexer directory layout:
    /// `<data_dir>/<project_id>/<host>/<path>`.
    fn target_dir(&self, contract: &Asset, impl_url: &str) -> Result<PathBuf> {
        let parsed = url::Url::parse(impl_url)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("Implementation URL has no host: {impl_url}"))?;
        Ok(self
            .data_dir
            .join(contract.project_id.to_string())
            .join(host)
            .join(parsed.path().trim_matches('/')))
    }

    async fn check_contract(&self, ctx: &JobContext, contract: &Asset) -> Result<CheckOutcome> {
        let events = self
            .explorer
            .get_proxy_upgrade_events(&contract.identifier)
            .await?;

        let Some(latest) = events.last() else {
            // Sticky: future sweeps skip this contract until the flag is
            // cleared externally.
            ctx.database.mark_not_proxy(contract.id).await?;
            info!("Marked {} as non-proxy", contract.identifier);
            return Ok(CheckOutcome::FlaggedNotProxy);
        };

        let Some(kind) = self.explorer.is_supported_explorer(&contract.identifier) else {
            error!("Unsupported explorer URL: {}", contract.identifier);
            return Ok(CheckOutcome::Unchanged);
        };
        let impl_url = format!(
            "https://{}/address/{}",
            kind.domain(),
            latest.implementation
        );

        // Current link already points at the latest implementation.
        let old_implementation = match contract.implementation_id {
            Some(id) => ctx.database.get_asset(id).await?,
            None => None,
        };
        if let Some(current) = &old_implementation {
            if current.identifier == impl_url {
                return Ok(CheckOutcome::Unchanged);
            }
        }

        // Locate or create the implementation asset; only a newly created one
        // needs its verified sources fetched.
        let existing = ctx.database.get_asset_by_identifier(&impl_url).await?;
        let new_implementation = match existing {
            Some(asset) => NewAsset {
                identifier: asset.identifier,
                project_id: asset.project_id,
                asset_type: asset.asset_type,
                source_url: asset.source_url,
                local_path: asset.local_path,
                extra_data: asset.extra_data,
            },
            None => {
                let target_dir = self.target_dir(contract, &impl_url)?;
                self.fetcher
                    .fetch_verified_sources(&impl_url, &target_dir)
                    .await?;
                NewAsset {
                    identifier: impl_url.clone(),
                    project_id: contract.project_id,
                    asset_type: AssetType::DeployedContract,
                    source_url: Some(impl_url.clone()),
                    local_path: Some(target_dir.display().to_string()),
                    extra_data: json!({
                        "is_implementation": true,
                        "explorer_url": impl_url,
                    }),
                }
            }
        };

        let record = ImplementationRecord {
            address: latest.implementation.clone(),
            url: impl_url.clone(),
            block_number: latest.block_number,
            timestamp: latest.timestamp,
        };
        let new_asset = ctx
            .database
            .apply_implementation_upgrade(contract.id, &new_implementation, &record)
            .await?;

        info!(
            "Contract {} upgraded to implementation {}",
            contract.identifier, impl_url
        );

        // Emitted once per detected change, after the persist commits.
        let mut context = EventContext::new();
        context.insert("proxy".to_string(), serde_json::to_value(contract)?);
        context.insert(
            "old_implementation".to_string(),
            serde_json::to_value(&old_implementation)?,
        );
        context.insert(
            "new_implementation".to_string(),
            serde_json::to_value(&new_asset)?,
        );
        context.insert("event".to_string(), serde_json::to_value(latest)?);
        ctx.event_bus
            .trigger_event(HandlerTrigger::ContractUpgraded, context)
            .await;

        Ok(CheckOutcome::Upgraded)
    }
}

#[async_trait]
impl Job for ProxyMonitorJob {
    fn job_type(&self) -> &str {
        "proxy_monitor"
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobResult> {
        info!("Starting proxy contract monitoring");

        // Failure here is job-fatal; per-contract failures below are not.
        let contracts = ctx.database.list_proxy_candidates().await?;
        info!("Found {} deployed contracts to check", contracts.len());

        let mut upgraded = 0usize;
        let mut flagged = 0usize;
        let mut unchanged = 0usize;
        let mut failed = 0usize;

        for contract in &contracts {
            if ctx.cancel.is_cancelled() {
                info!("Proxy monitoring cancelled mid-sweep");
                break;
            }

            match self.check_contract(ctx, contract).await {
                Ok(CheckOutcome::Upgraded) => upgraded += 1,
                Ok(CheckOutcome::FlaggedNotProxy) => flagged += 1,
                Ok(CheckOutcome::Unchanged) => unchanged += 1,
                Err(e) => {
                    error!(
                        "Error processing contract {}: {:#}",
                        contract.identifier, e
                    );
                    failed += 1;
                    continue;
                }
            }
        }

        let mut result = JobResult::success("Proxy monitoring completed successfully")
            .with_data(json!({
                "checked": contracts.len(),
                "upgraded": upgraded,
                "flagged_not_proxy": flagged,
                "unchanged": unchanged,
                "failed": failed,
            }));
        result.add_output(format!(
            "Checked {} contracts: {} upgraded, {} flagged non-proxy, {} unchanged",
            contracts.len(),
            upgraded,
            flagged,
            unchanged
        ));
        if failed > 0 {
            warn!("{} contracts failed during proxy monitoring", failed);
            result.add_output(format!("{failed} contracts failed and were skipped"));
        }

        Ok(result)
    }
}
