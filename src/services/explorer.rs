//! EVM block-explorer collaborator
//!
//! Contracts are identified by their canonical explorer URL
//! (`https://<domain>/address/0x...`). The explorer trait answers two
//! questions: which explorer an identifier belongs to, and which proxy
//! upgrade events a contract has emitted.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::ExplorerConfig;
use crate::errors::ExplorerError;

/// topic0 of the EIP-1967 `Upgraded(address)` event.
const UPGRADED_TOPIC: &str = "0xbc7cd75a20ee27fd9adebab32041f755214dbc6bffa90cc0225b39da2e5c2d3b";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExplorerKind {
    Etherscan,
    Basescan,
    Arbiscan,
    Polygonscan,
    Bscscan,
}

impl ExplorerKind {
    pub const ALL: [ExplorerKind; 5] = [
        ExplorerKind::Etherscan,
        ExplorerKind::Basescan,
        ExplorerKind::Arbiscan,
        ExplorerKind::Polygonscan,
        ExplorerKind::Bscscan,
    ];

    /// Public web domain serving canonical contract URLs.
    pub fn domain(&self) -> &'static str {
        match self {
            ExplorerKind::Etherscan => "etherscan.io",
            ExplorerKind::Basescan => "basescan.org",
            ExplorerKind::Arbiscan => "arbiscan.io",
            ExplorerKind::Polygonscan => "polygonscan.com",
            ExplorerKind::Bscscan => "bscscan.com",
        }
    }

    pub(crate) fn api_base(&self) -> &'static str {
        match self {
            ExplorerKind::Etherscan => "https://api.etherscan.io/api",
            ExplorerKind::Basescan => "https://api.basescan.org/api",
            ExplorerKind::Arbiscan => "https://api.arbiscan.io/api",
            ExplorerKind::Polygonscan => "https://api.polygonscan.com/api",
            ExplorerKind::Bscscan => "https://api.bscscan.com/api",
        }
    }
}

/// A single proxy upgrade observed on chain. Sequences are chronological, so
/// the last event carries the current implementation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyUpgradeEvent {
    pub implementation: String,
    pub block_number: u64,
    pub timestamp: i64,
}

#[async_trait]
pub trait Explorer: Send + Sync {
    /// Proxy upgrade events for a contract, oldest first. An empty vector
    /// means the contract has never emitted an upgrade event.
    async fn get_proxy_upgrade_events(&self, identifier: &str) -> Result<Vec<ProxyUpgradeEvent>>;

    /// Which explorer the identifier belongs to, if any.
    fn is_supported_explorer(&self, identifier: &str) -> Option<ExplorerKind> {
        supported_explorer(identifier)
    }
}

/// Match an identifier URL against the known explorer domains.
pub fn supported_explorer(identifier: &str) -> Option<ExplorerKind> {
    let parsed = url::Url::parse(identifier).ok()?;
    let host = parsed.host_str()?;
    ExplorerKind::ALL
        .iter()
        .copied()
        .find(|kind| host == kind.domain() || host.ends_with(&format!(".{}", kind.domain())))
}

/// Extract the 0x-prefixed contract address from a canonical explorer URL.
pub fn contract_address(identifier: &str) -> Result<String> {
    let parsed = url::Url::parse(identifier)?;
    let address = parsed
        .path_segments()
        .and_then(|mut segments| match segments.next() {
            Some("address") => segments.next().map(str::to_string),
            _ => None,
        })
        .ok_or_else(|| ExplorerError::unsupported_url(identifier))?;
    Ok(address)
}

/// Explorer implementation backed by the etherscan-family JSON API.
pub struct EvmExplorer {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl EvmExplorer {
    pub fn new(config: &ExplorerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key: config.etherscan_api_key.clone(),
        })
    }
}

#[derive(Deserialize)]
struct LogsResponse {
    status: String,
    message: String,
    result: serde_json::Value,
}

#[derive(Deserialize)]
struct LogEntry {
    topics: Vec<String>,
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(rename = "timeStamp")]
    timestamp: String,
}

fn parse_hex_u64(s: &str) -> Result<u64> {
    let trimmed = s.trim_start_matches("0x");
    Ok(u64::from_str_radix(trimmed, 16)?)
}

#[async_trait]
impl Explorer for EvmExplorer {
    async fn get_proxy_upgrade_events(&self, identifier: &str) -> Result<Vec<ProxyUpgradeEvent>> {
        let kind = self
            .is_supported_explorer(identifier)
            .ok_or_else(|| ExplorerError::unsupported_url(identifier))?;
        let address = contract_address(identifier)?;

        let mut request = self
            .client
            .get(kind.api_base())
            .query(&[
                ("module", "logs"),
                ("action", "getLogs"),
                ("address", address.as_str()),
                ("topic0", UPGRADED_TOPIC),
                ("fromBlock", "0"),
                ("toBlock", "latest"),
            ]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("apikey", key.as_str())]);
        }

        let response: LogsResponse = request.send().await?.json().await?;

        // The API reports "No records found" as status 0; that is a valid
        // empty answer, not a failure.
        if response.status != "1" {
            if response.message.contains("No records found") {
                return Ok(Vec::new());
            }
            return Err(ExplorerError::api(format!(
                "{} ({})",
                response.message, identifier
            ))
            .into());
        }

        let entries: Vec<LogEntry> = serde_json::from_value(response.result)?;
        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            // Implementation address is the last 20 bytes of topic1.
            let Some(topic1) = entry.topics.get(1) else {
                continue;
            };
            let raw = topic1.trim_start_matches("0x");
            if raw.len() < 40 {
                continue;
            }
            let implementation = format!("0x{}", &raw[raw.len() - 40..]);
            events.push(ProxyUpgradeEvent {
                implementation,
                block_number: parse_hex_u64(&entry.block_number)?,
                timestamp: parse_hex_u64(&entry.timestamp)? as i64,
            });
        }

        events.sort_by_key(|e| e.block_number);
        debug!(
            "Explorer returned {} upgrade events for {}",
            events.len(),
            identifier
        );
        Ok(events)
    }
}
