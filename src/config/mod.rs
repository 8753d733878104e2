use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub embeddings: EmbeddingsConfig,
    pub explorer: ExplorerConfig,
    pub scheduler: SchedulerConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for downloaded contract sources, laid out as
    /// `<data_dir>/<project_id>/<host>/<path>`.
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    pub endpoint: String,
    pub model: String,
    pub dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerConfig {
    pub etherscan_api_key: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub proxy_monitor_cron: String,
    pub sync_cron: String,
    pub embed_cron: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Terminal jobs older than this are eligible for cleanup_completed().
    pub retention_hours: i64,
    pub file_search_max_results: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://./chainscout.db".to_string(),
                max_connections: Some(10),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("./data/sources"),
            },
            embeddings: EmbeddingsConfig {
                endpoint: "http://localhost:11434/api/embeddings".to_string(),
                model: "nomic-embed-text".to_string(),
                dimension: 768,
            },
            explorer: ExplorerConfig {
                etherscan_api_key: None,
                request_timeout_secs: 30,
            },
            scheduler: SchedulerConfig {
                enabled: true,
                proxy_monitor_cron: "0 */30 * * * *".to_string(),
                sync_cron: "0 0 */6 * * *".to_string(),
                embed_cron: "0 15 */2 * * *".to_string(),
            },
            jobs: JobsConfig {
                retention_hours: 24,
                file_search_max_results: 500,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::create_dir_all("./data/sources")?;
            std::fs::write(&config_file, contents)?;
            Ok(default_config)
        }
    }
}
