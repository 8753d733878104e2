//! Cron-driven job submission
//!
//! Recurring work (proxy monitoring, platform sync, embedding refresh) is
//! submitted through the JobManager on cron schedules. The loop ticks every
//! second, checks each schedule against its last submission and skips a
//! submission while a job of the same type is still live, so overlapping
//! sweeps never pile up.

use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use super::embed::EmbedJob;
use super::indexer::IndexerJob;
use super::proxy_monitor::ProxyMonitorJob;
use super::{Job, JobManager};
use crate::config::{Config, SchedulerConfig};
use crate::services::{EmbeddingClient, Explorer, PlatformIndexer, SourceFetcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduledKind {
    ProxyMonitor,
    PlatformSync,
    Embed,
}

struct ScheduledEntry {
    kind: ScheduledKind,
    schedule: Schedule,
    last_submitted: DateTime<Utc>,
}

/// Everything needed to construct the recurring jobs.
pub struct JobTemplates {
    pub explorer: Arc<dyn Explorer>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub platform: Arc<dyn PlatformIndexer>,
    pub data_dir: PathBuf,
}

impl JobTemplates {
    pub fn from_config(
        config: &Config,
        explorer: Arc<dyn Explorer>,
        fetcher: Arc<dyn SourceFetcher>,
        embedder: Arc<dyn EmbeddingClient>,
        platform: Arc<dyn PlatformIndexer>,
    ) -> Self {
        Self {
            explorer,
            fetcher,
            embedder,
            platform,
            data_dir: config.storage.data_dir.clone(),
        }
    }

    fn build(&self, kind: ScheduledKind) -> Arc<dyn Job> {
        match kind {
            ScheduledKind::ProxyMonitor => Arc::new(ProxyMonitorJob::new(
                Arc::clone(&self.explorer),
                Arc::clone(&self.fetcher),
                self.data_dir.clone(),
            )),
            ScheduledKind::PlatformSync => {
                Arc::new(IndexerJob::new(Arc::clone(&self.platform), false))
            }
            ScheduledKind::Embed => Arc::new(EmbedJob::new(Arc::clone(&self.embedder))),
        }
    }
}

pub struct JobScheduler {
    manager: JobManager,
    templates: JobTemplates,
    entries: Vec<ScheduledEntry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl JobScheduler {
    /// Parses all cron expressions up front; a malformed schedule is a
    /// configuration error, not something to discover at 3am.
    pub fn new(
        manager: JobManager,
        config: &SchedulerConfig,
        templates: JobTemplates,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let now = Utc::now();
        let parse = |expr: &str, name: &str| -> Result<Schedule> {
            Schedule::from_str(expr)
                .map_err(|e| anyhow::anyhow!("Invalid cron expression for {name} ({expr}): {e}"))
        };

        let entries = vec![
            ScheduledEntry {
                kind: ScheduledKind::ProxyMonitor,
                schedule: parse(&config.proxy_monitor_cron, "proxy_monitor")?,
                last_submitted: now,
            },
            ScheduledEntry {
                kind: ScheduledKind::PlatformSync,
                schedule: parse(&config.sync_cron, "sync")?,
                last_submitted: now,
            },
            ScheduledEntry {
                kind: ScheduledKind::Embed,
                schedule: parse(&config.embed_cron, "embed")?,
                last_submitted: now,
            },
        ];

        Ok(Self {
            manager,
            templates,
            entries,
            shutdown_rx,
        })
    }

    pub async fn start(mut self) -> Result<()> {
        info!("Starting job scheduler");
        for entry in &self.entries {
            if let Some(next) = entry.schedule.upcoming(Utc).next() {
                info!(
                    "Schedule {:?} - next run: {}",
                    entry.kind,
                    next.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }

        let mut tick = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.check_schedules().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Job scheduler shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn check_schedules(&mut self) {
        let now = Utc::now();
        for i in 0..self.entries.len() {
            let due = {
                let entry = &self.entries[i];
                entry
                    .schedule
                    .after(&entry.last_submitted)
                    .next()
                    .map(|next| now >= next)
                    .unwrap_or(false)
            };
            if !due {
                continue;
            }

            let job = self.templates.build(self.entries[i].kind);
            // A still-live job of the same type defers the submission; it
            // fires on a later tick once the previous run is terminal.
            if self.manager.has_active(job.job_type()).await {
                debug!(
                    "Skipping {:?}: previous {} job still active",
                    self.entries[i].kind,
                    job.job_type()
                );
                continue;
            }

            match self.manager.submit_job(job).await {
                Ok(id) => {
                    info!("Scheduled submission {:?} -> job {}", self.entries[i].kind, id);
                    self.entries[i].last_submitted = now;
                }
                Err(e) => {
                    error!("Failed to submit {:?}: {:#}", self.entries[i].kind, e);
                }
            }
        }
    }
}
