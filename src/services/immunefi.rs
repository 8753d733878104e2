//! Bug-bounty platform collaborator
//!
//! The indexer job consumes a platform through this trait; the shipped
//! implementation reads the public Immunefi bounty feed.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::models::AssetType;

/// One program as reported by the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformProject {
    pub name: String,
    pub description: Option<String>,
    pub max_bounty: Option<f64>,
    #[serde(default)]
    pub assets: Vec<PlatformAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformAsset {
    pub url: String,
    #[serde(rename = "type")]
    pub asset_type: String,
}

impl PlatformAsset {
    /// Map the platform's asset tags onto our asset types. Unknown tags are
    /// skipped by the indexer.
    pub fn kind(&self) -> Option<AssetType> {
        match self.asset_type.as_str() {
            "github_repo" | "repository" => Some(AssetType::GithubRepo),
            "github_file" | "file" => Some(AssetType::GithubFile),
            "smart_contract" | "deployed_contract" => Some(AssetType::DeployedContract),
            _ => None,
        }
    }
}

#[async_trait]
pub trait PlatformIndexer: Send + Sync {
    /// Stable tag used as the `platform` column on projects.
    fn platform(&self) -> &str;

    async fn fetch_projects(&self) -> Result<Vec<PlatformProject>>;
}

pub struct ImmunefiClient {
    client: reqwest::Client,
    feed_url: String,
}

const IMMUNEFI_FEED: &str = "https://immunefi.com/public-api/bounties.json";

impl ImmunefiClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            feed_url: IMMUNEFI_FEED.to_string(),
        })
    }

    pub fn with_feed_url<S: Into<String>>(mut self, url: S) -> Self {
        self.feed_url = url.into();
        self
    }
}

#[async_trait]
impl PlatformIndexer for ImmunefiClient {
    fn platform(&self) -> &str {
        "immunefi"
    }

    async fn fetch_projects(&self) -> Result<Vec<PlatformProject>> {
        let projects: Vec<PlatformProject> = self
            .client
            .get(&self.feed_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(projects)
    }
}
