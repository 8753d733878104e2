//! Regex file search job
//!
//! Searches the locally materialized source files of every asset, attaching
//! asset and project information to each match. The pattern is validated in
//! the constructor, before any work is scheduled.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Job, JobContext};
use crate::errors::AppError;
use crate::models::JobResult;

/// Files larger than this are skipped rather than read into memory.
const MAX_FILE_BYTES: u64 = 1024 * 1024;
/// Yield cadence while scanning.
const YIELD_EVERY_FILES: usize = 25;

#[derive(Debug, Clone, Serialize)]
pub struct FileMatch {
    pub file: String,
    pub line_number: usize,
    pub line: String,
    pub asset_identifier: String,
    pub project_id: Uuid,
}

#[derive(Debug)]
pub struct FileSearchJob {
    pattern: Regex,
    max_results: usize,
}

impl FileSearchJob {
    /// Fails fast on an invalid pattern; no job is created.
    pub fn new(pattern: &str, max_results: usize) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| AppError::validation(format!("Invalid regex pattern: {e}")))?;
        Ok(Self {
            pattern,
            max_results,
        })
    }
}

/// Collect all regular files under `root` (which may itself be a file).
async fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let metadata = tokio::fs::metadata(root).await?;
    if metadata.is_file() {
        files.push(root.to_path_buf());
        return Ok(files);
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

#[async_trait]
impl Job for FileSearchJob {
    fn job_type(&self) -> &str {
        "file_search"
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobResult> {
        info!("Starting file search: {}", self.pattern.as_str());

        let assets = ctx.database.list_assets_with_local_path().await?;
        let mut matches: Vec<FileMatch> = Vec::new();
        let mut files_scanned = 0usize;
        let mut assets_failed = 0usize;
        let mut capped = false;

        'assets: for asset in &assets {
            if ctx.cancel.is_cancelled() {
                info!("File search cancelled");
                break;
            }
            let Some(local_path) = &asset.local_path else {
                continue;
            };

            let files = match collect_files(Path::new(local_path)).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("Skipping asset {}: {:#}", asset.identifier, e);
                    assets_failed += 1;
                    continue;
                }
            };

            for file in files {
                files_scanned += 1;
                if files_scanned % YIELD_EVERY_FILES == 0 {
                    tokio::task::yield_now().await;
                }
                if ctx.cancel.is_cancelled() {
                    break 'assets;
                }

                match tokio::fs::metadata(&file).await {
                    Ok(metadata) if metadata.len() > MAX_FILE_BYTES => {
                        debug!("Skipping large file {}", file.display());
                        continue;
                    }
                    Ok(_) => {}
                    Err(_) => continue,
                }

                // Binary or unreadable files are skipped silently.
                let Ok(content) = tokio::fs::read_to_string(&file).await else {
                    continue;
                };

                for (index, line) in content.lines().enumerate() {
                    if !self.pattern.is_match(line) {
                        continue;
                    }
                    matches.push(FileMatch {
                        file: file.display().to_string(),
                        line_number: index + 1,
                        line: line.trim_end().to_string(),
                        asset_identifier: asset.identifier.clone(),
                        project_id: asset.project_id,
                    });
                    if matches.len() >= self.max_results {
                        capped = true;
                        break 'assets;
                    }
                }
            }
        }

        let mut result = JobResult::success(format!(
            "Found {} matches across {} files",
            matches.len(),
            files_scanned
        ))
        .with_data(json!({
            "pattern": self.pattern.as_str(),
            "matches": matches,
            "total": matches.len(),
            "files_scanned": files_scanned,
            "assets_failed": assets_failed,
            "capped": capped,
        }));

        for file_match in matches.iter().take(50) {
            result.add_output(format!(
                "{}:{}: {}",
                file_match.file, file_match.line_number, file_match.line
            ));
        }
        if capped {
            result.add_output(format!(
                "Result cap of {} matches reached; refine the pattern",
                self.max_results
            ));
        }

        Ok(result)
    }
}
