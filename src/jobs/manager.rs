//! Job manager: registry, scheduling and lifecycle tracking
//!
//! One manager instance per process, constructed at startup and injected
//! into whoever submits jobs. Submission returns immediately with the job
//! id; the spawned execution harness drives the job to a terminal state on
//! every exit path, including errors and panics. Terminal states are never
//! overwritten, which is what makes stop requests and late run results safe
//! to race.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{cancel_pair, CancelHandle, Job, JobContext};
use crate::database::Database;
use crate::errors::AppError;
use crate::handlers::EventBus;
use crate::models::{JobInfo, JobResult, JobStatus};

struct JobEntry {
    job: Arc<dyn Job>,
    job_type: String,
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<JobResult>,
    cancel: CancelHandle,
}

impl JobEntry {
    fn snapshot(&self, id: Uuid) -> JobInfo {
        JobInfo {
            id,
            job_type: self.job_type.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
        }
    }
}

#[derive(Clone)]
pub struct JobManager {
    jobs: Arc<RwLock<HashMap<Uuid, JobEntry>>>,
    notify_tx: broadcast::Sender<JobInfo>,
    database: Database,
    event_bus: EventBus,
}

impl JobManager {
    pub fn new(database: Database, event_bus: EventBus) -> Self {
        let (notify_tx, _) = broadcast::channel(1000);
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            notify_tx,
            database,
            event_bus,
        }
    }

    /// Observe job snapshots published on every status transition.
    pub fn subscribe(&self) -> broadcast::Receiver<JobInfo> {
        self.notify_tx.subscribe()
    }

    /// Register the job, spawn its execution harness and return its id
    /// without waiting for completion.
    pub async fn submit_job(&self, job: Arc<dyn Job>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let (cancel_handle, cancel_flag) = cancel_pair();
        let job_type = job.job_type().to_string();

        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(
                id,
                JobEntry {
                    job: Arc::clone(&job),
                    job_type: job_type.clone(),
                    status: JobStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    result: None,
                    cancel: cancel_handle,
                },
            );
        }

        info!("Submitted job {} ({})", id, job_type);

        let manager = self.clone();
        let ctx = JobContext::new(
            self.database.clone(),
            self.event_bus.clone(),
            cancel_flag.clone(),
        );
        tokio::spawn(async move {
            manager.execute(id, job, ctx).await;
        });

        Ok(id)
    }

    /// Execution harness: owns the terminal transition for one job.
    async fn execute(&self, id: Uuid, job: Arc<dyn Job>, ctx: JobContext) {
        // A stop request can land before the task is scheduled.
        if ctx.cancel.is_cancelled() {
            debug!("Job {} cancelled before start", id);
            return;
        }

        if !self.mark_running(id).await {
            return;
        }

        let outcome = AssertUnwindSafe(job.run(&ctx)).catch_unwind().await;
        match outcome {
            Ok(Ok(result)) => {
                self.finish(id, JobStatus::Completed, Some(result)).await;
            }
            Ok(Err(e)) => {
                error!("Job {} failed: {:#}", id, e);
                self.finish(
                    id,
                    JobStatus::Failed,
                    Some(JobResult::failure(format!("{e:#}"))),
                )
                .await;
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Job {} panicked: {}", id, message);
                self.finish(
                    id,
                    JobStatus::Failed,
                    Some(JobResult::failure(format!("job panicked: {message}"))),
                )
                .await;
            }
        }
    }

    async fn mark_running(&self, id: Uuid) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(&id) else {
            return false;
        };
        if entry.status != JobStatus::Pending {
            return false;
        }
        entry.status = JobStatus::Running;
        entry.started_at = Some(Utc::now());
        let _ = self.notify_tx.send(entry.snapshot(id));
        true
    }

    /// Single mutation path for terminal transitions. A job already in a
    /// terminal state keeps it; a late result is still recorded if none was
    /// stored yet (e.g. a stopped job returning a partial result).
    async fn finish(&self, id: Uuid, status: JobStatus, result: Option<JobResult>) {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(&id) else {
            return;
        };

        if !entry.status.is_terminal() {
            entry.status = status;
            entry.completed_at = Some(Utc::now());
        }
        if entry.result.is_none() {
            entry.result = result;
        }
        let _ = self.notify_tx.send(entry.snapshot(id));
    }

    pub async fn get_job(&self, id: Uuid) -> Option<JobInfo> {
        let jobs = self.jobs.read().await;
        jobs.get(&id).map(|entry| entry.snapshot(id))
    }

    /// Result of a job, present once it reached a terminal state.
    pub async fn get_result(&self, id: Uuid) -> Option<JobResult> {
        let jobs = self.jobs.read().await;
        jobs.get(&id).and_then(|entry| entry.result.clone())
    }

    pub async fn list_jobs(&self, filter: Option<JobStatus>) -> Vec<JobInfo> {
        let jobs = self.jobs.read().await;
        let mut infos: Vec<JobInfo> = jobs
            .iter()
            .filter(|(_, entry)| filter.map_or(true, |status| entry.status == status))
            .map(|(id, entry)| entry.snapshot(*id))
            .collect();
        infos.sort_by_key(|info| info.started_at);
        infos
    }

    /// True while any job of the given type is Pending or Running.
    pub async fn has_active(&self, job_type: &str) -> bool {
        let jobs = self.jobs.read().await;
        jobs.values()
            .any(|entry| entry.job_type == job_type && !entry.status.is_terminal())
    }

    /// Request cancellation of a job. Returns Ok(true) if a stop was
    /// delivered, Ok(false) if the job was already terminal (no-op).
    pub async fn stop_job(&self, id: Uuid) -> Result<bool> {
        let job = {
            let jobs = self.jobs.read().await;
            let entry = jobs
                .get(&id)
                .ok_or_else(|| AppError::not_found("job", id.to_string()))?;
            if entry.status.is_terminal() {
                return Ok(false);
            }
            entry.cancel.cancel();
            Arc::clone(&entry.job)
        };

        // Give the job its cleanup hook outside the registry lock.
        job.stop().await;
        self.finish(id, JobStatus::Stopped, None).await;
        info!("Stopped job {}", id);
        Ok(true)
    }

    /// Stop every non-terminal job. Used on shutdown.
    pub async fn stop_all(&self) {
        let active: Vec<Uuid> = {
            let jobs = self.jobs.read().await;
            jobs.iter()
                .filter(|(_, entry)| !entry.status.is_terminal())
                .map(|(id, _)| *id)
                .collect()
        };

        for id in active {
            if let Err(e) = self.stop_job(id).await {
                warn!("Failed to stop job {}: {}", id, e);
            }
        }
    }

    /// Evict terminal jobs older than `max_age`. Eviction is always explicit;
    /// nothing is removed implicitly. Returns the number evicted.
    pub async fn cleanup_completed(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| {
            if !entry.status.is_terminal() {
                return true;
            }
            match entry.completed_at {
                Some(completed_at) => completed_at > cutoff,
                None => true,
            }
        });
        before - jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;

    async fn test_manager() -> JobManager {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: Some(1),
        };
        let database = Database::new(&config).await.unwrap();
        database.migrate().await.unwrap();
        JobManager::new(database, EventBus::new())
    }

    enum Behavior {
        Complete,
        CompleteUnsuccessfully,
        Fail,
        Panic,
        RunUntilStopped,
    }

    struct TestJob {
        behavior: Behavior,
    }

    #[async_trait]
    impl Job for TestJob {
        fn job_type(&self) -> &str {
            "test"
        }

        async fn run(&self, ctx: &JobContext) -> Result<JobResult> {
            match self.behavior {
                Behavior::Complete => Ok(JobResult::success("done")),
                Behavior::CompleteUnsuccessfully => {
                    Ok(JobResult::failure("3 items failed"))
                }
                Behavior::Fail => anyhow::bail!("boom"),
                Behavior::Panic => panic!("test panic"),
                Behavior::RunUntilStopped => {
                    let mut cancel = ctx.cancel.clone();
                    cancel.cancelled().await;
                    Ok(JobResult::success("stopped cooperatively"))
                }
            }
        }
    }

    async fn wait_terminal(manager: &JobManager, id: Uuid) -> JobInfo {
        for _ in 0..500 {
            if let Some(info) = manager.get_job(id).await {
                if info.status.is_terminal() {
                    return info;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn completed_job_reaches_terminal_state() {
        let manager = test_manager().await;
        let id = manager
            .submit_job(Arc::new(TestJob {
                behavior: Behavior::Complete,
            }))
            .await
            .unwrap();

        let info = wait_terminal(&manager, id).await;
        assert_eq!(info.status, JobStatus::Completed);
        assert!(info.started_at.is_some());
        assert!(info.completed_at.is_some());
        assert_eq!(info.result.unwrap().message, "done");
    }

    #[tokio::test]
    async fn unsuccessful_result_still_completes() {
        let manager = test_manager().await;
        let id = manager
            .submit_job(Arc::new(TestJob {
                behavior: Behavior::CompleteUnsuccessfully,
            }))
            .await
            .unwrap();

        let info = wait_terminal(&manager, id).await;
        assert_eq!(info.status, JobStatus::Completed);
        let result = info.result.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn failing_job_is_marked_failed_with_error() {
        let manager = test_manager().await;
        let id = manager
            .submit_job(Arc::new(TestJob {
                behavior: Behavior::Fail,
            }))
            .await
            .unwrap();

        let info = wait_terminal(&manager, id).await;
        assert_eq!(info.status, JobStatus::Failed);
        let result = info.result.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn panicking_job_is_marked_failed() {
        let manager = test_manager().await;
        let id = manager
            .submit_job(Arc::new(TestJob {
                behavior: Behavior::Panic,
            }))
            .await
            .unwrap();

        let info = wait_terminal(&manager, id).await;
        assert_eq!(info.status, JobStatus::Failed);
        assert!(info
            .result
            .unwrap()
            .error
            .unwrap()
            .contains("test panic"));
    }

    #[tokio::test]
    async fn concurrent_submissions_are_tracked_independently() {
        let manager = test_manager().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                manager
                    .submit_job(Arc::new(TestJob {
                        behavior: Behavior::Complete,
                    }))
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(ids.len(), 3);
        assert!(ids[0] != ids[1] && ids[1] != ids[2] && ids[0] != ids[2]);

        for id in &ids {
            let info = wait_terminal(&manager, *id).await;
            assert_eq!(info.status, JobStatus::Completed);
        }
        assert_eq!(manager.list_jobs(None).await.len(), 3);
        assert_eq!(
            manager.list_jobs(Some(JobStatus::Completed)).await.len(),
            3
        );
    }

    #[tokio::test]
    async fn stop_transitions_running_job_to_stopped() {
        let manager = test_manager().await;
        let id = manager
            .submit_job(Arc::new(TestJob {
                behavior: Behavior::RunUntilStopped,
            }))
            .await
            .unwrap();

        // Wait for it to be running before stopping.
        for _ in 0..500 {
            if let Some(info) = manager.get_job(id).await {
                if info.status == JobStatus::Running {
                    break;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }

        assert!(manager.stop_job(id).await.unwrap());
        let info = wait_terminal(&manager, id).await;
        assert_eq!(info.status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn stopping_completed_job_is_a_noop() {
        let manager = test_manager().await;
        let id = manager
            .submit_job(Arc::new(TestJob {
                behavior: Behavior::Complete,
            }))
            .await
            .unwrap();

        wait_terminal(&manager, id).await;
        assert!(!manager.stop_job(id).await.unwrap());
        let info = manager.get_job(id).await.unwrap();
        assert_eq!(info.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn stopping_unknown_job_is_an_error() {
        let manager = test_manager().await;
        assert!(manager.stop_job(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_evicts_only_old_terminal_jobs() {
        let manager = test_manager().await;
        let done = manager
            .submit_job(Arc::new(TestJob {
                behavior: Behavior::Complete,
            }))
            .await
            .unwrap();
        let running = manager
            .submit_job(Arc::new(TestJob {
                behavior: Behavior::RunUntilStopped,
            }))
            .await
            .unwrap();

        wait_terminal(&manager, done).await;

        // Nothing old enough yet.
        assert_eq!(manager.cleanup_completed(Duration::hours(1)).await, 0);
        // Zero-age cutoff evicts the completed job but not the running one.
        assert_eq!(manager.cleanup_completed(Duration::zero()).await, 1);
        assert!(manager.get_job(done).await.is_none());
        assert!(manager.get_job(running).await.is_some());

        manager.stop_job(running).await.unwrap();
    }

    #[tokio::test]
    async fn transitions_are_published_to_subscribers() {
        let manager = test_manager().await;
        let mut rx = manager.subscribe();
        let id = manager
            .submit_job(Arc::new(TestJob {
                behavior: Behavior::Complete,
            }))
            .await
            .unwrap();

        let running = rx.recv().await.unwrap();
        assert_eq!(running.id, id);
        assert_eq!(running.status, JobStatus::Running);
        let completed = rx.recv().await.unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
    }
}
