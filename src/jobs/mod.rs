//! Background job subsystem
//!
//! A [`Job`] is one unit of cancellable background work. Jobs are submitted
//! to the [`JobManager`](manager::JobManager), which tracks them through the
//! [`JobStatus`](crate::models::JobStatus) lifecycle and guarantees a
//! terminal state on every exit path. Cancellation is cooperative: jobs
//! observe their [`CancelFlag`] at suspension points, there is no preemption.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::database::Database;
use crate::handlers::EventBus;
use crate::models::JobResult;

pub mod autobot;
pub mod embed;
pub mod file_search;
pub mod indexer;
pub mod manager;
pub mod proxy_monitor;
pub mod scheduler;

pub use manager::JobManager;

/// Shared collaborators handed to every job run by the manager.
#[derive(Clone)]
pub struct JobContext {
    pub database: Database,
    pub event_bus: EventBus,
    pub cancel: CancelFlag,
}

/// Contract for a unit of background work.
///
/// `run` performs the work and returns the outcome; the execution harness in
/// the manager owns the terminal transition (Completed on `Ok`, Failed on
/// `Err` or panic, Stopped on observed cancellation). `stop` is invoked on an
/// external cancellation request and must release held resources promptly.
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable string tag identifying the kind of work (e.g. "proxy_monitor").
    fn job_type(&self) -> &str;

    async fn run(&self, ctx: &JobContext) -> Result<JobResult>;

    async fn stop(&self) {}
}

/// Cancellation signal observed cooperatively by jobs.
#[derive(Clone)]
pub struct CancelFlag {
    rx: watch::Receiver<bool>,
}

/// Sender half held by the manager; flipping it requests cancellation.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Create a linked cancellation pair.
pub fn cancel_pair() -> (CancelHandle, CancelFlag) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelFlag { rx })
}

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Usable in `tokio::select!`.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // Sender dropped without cancelling; treat as never-cancelled.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl JobContext {
    pub fn new(database: Database, event_bus: EventBus, cancel: CancelFlag) -> Self {
        Self {
            database,
            event_bus,
            cancel,
        }
    }
}
