//! Verified-source fetch collaborator
//!
//! Downloads the verified source bundle for a contract and materializes it
//! under a target directory. Multi-file bundles keep their relative layout;
//! single-file responses land in `contract.sol`.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::explorer::{contract_address, supported_explorer};
use crate::config::ExplorerConfig;
use crate::errors::ExplorerError;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Download the verified sources behind `url` into `target_dir`. Fails if
    /// the contract is unverified or the explorer is unreachable.
    async fn fetch_verified_sources(&self, url: &str, target_dir: &Path) -> Result<()>;
}

pub struct HttpSourceFetcher {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpSourceFetcher {
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
struct SourceCodeResponse {
    result: Vec<SourceCodeEntry>,
}

#[derive(Deserialize)]
struct SourceCodeEntry {
    #[serde(rename = "SourceCode")]
    source_code: String,
    #[serde(rename = "ContractName")]
    contract_name: String,
}

/// Reject path components that would escape the target directory.
fn sanitize_relative(path: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        return None;
    }
    if candidate
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return None;
    }
    Some(candidate)
}

async fn write_source_file(target_dir: &Path, relative: &Path, content: &str) -> Result<()> {
    let full_path = target_dir.join(relative);
    if let Some(parent) = full_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&full_path, content).await?;
    Ok(())
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch_verified_sources(&self, url: &str, target_dir: &Path) -> Result<()> {
        let kind = supported_explorer(url).ok_or_else(|| ExplorerError::unsupported_url(url))?;
        let address = contract_address(url)?;

        let mut request = self.client.get(kind.api_base()).query(&[
            ("module", "contract"),
            ("action", "getsourcecode"),
            ("address", address.as_str()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("apikey", key.as_str())]);
        }

        let response: SourceCodeResponse = request.send().await?.json().await?;
        let entry = response
            .result
            .first()
            .ok_or_else(|| ExplorerError::api(format!("Empty source response for {url}")))?;

        if entry.source_code.is_empty() {
            return Err(ExplorerError::UnverifiedSource {
                url: url.to_string(),
            }
            .into());
        }

        tokio::fs::create_dir_all(target_dir).await?;

        // Multi-file verified bundles arrive as JSON wrapped in doubled braces.
        let trimmed = entry
            .source_code
            .trim_start_matches('{')
            .trim_end_matches('}');
        let wrapped = format!("{{{trimmed}}}");
        if let Ok(bundle) = serde_json::from_str::<serde_json::Value>(&wrapped) {
            if let Some(sources) = bundle.get("sources").and_then(|s| s.as_object()) {
                let mut written = 0usize;
                for (path, file) in sources {
                    let Some(content) = file.get("content").and_then(|c| c.as_str()) else {
                        continue;
                    };
                    let Some(relative) = sanitize_relative(path) else {
                        debug!("Skipping suspicious source path: {}", path);
                        continue;
                    };
                    write_source_file(target_dir, &relative, content).await?;
                    written += 1;
                }
                info!("Fetched {} source files for {}", written, url);
                return Ok(());
            }
        }

        // Single flattened source.
        let file_name = if entry.contract_name.is_empty() {
            "contract.sol".to_string()
        } else {
            format!("{}.sol", entry.contract_name)
        };
        write_source_file(target_dir, Path::new(&file_name), &entry.source_code).await?;
        info!("Fetched flattened source for {}", url);
        Ok(())
    }
}
