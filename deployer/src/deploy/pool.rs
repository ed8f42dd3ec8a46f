//! Fixed-size worker pool with per-batch drain barriers
//!
//! Workers pull `(subject, operation)` units from one shared queue. A unit
//! whose subject is already in error is skipped. A unit that fails marks its
//! subject as errored and is logged; it never stops the pool or its siblings.
//! [`WorkerPool::run_batch`] returns only once every unit of the batch has
//! finished, which is what orders the pipeline phases.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::errors::DeployError;
use crate::models::snapshot::{SharedSnapshot, Snapshot};
use crate::models::target::{DeployTarget, SharedTarget, Status};
use crate::report::Reporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchTaskDefinition,
    Delete,
    CheckDeploy,
    StopScheduledTask,
    StopBeforeDeploy,
    Deploy,
    WaitForStable,
    DeployScheduledTask,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::FetchTaskDefinition => "fetch task definition",
            Operation::Delete => "delete",
            Operation::CheckDeploy => "check deploy",
            Operation::StopScheduledTask => "stop scheduled task",
            Operation::StopBeforeDeploy => "stop before deploy",
            Operation::Deploy => "deploy",
            Operation::WaitForStable => "wait for stable",
            Operation::DeployScheduledTask => "deploy scheduled task",
        };
        f.write_str(s)
    }
}

/// What a unit operates on
#[derive(Debug, Clone)]
pub enum Subject {
    Target(SharedTarget),
    Snapshot(SharedSnapshot),
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub subject: Subject,
    pub operation: Operation,
}

impl Unit {
    pub fn target(target: &SharedTarget, operation: Operation) -> Self {
        Self {
            subject: Subject::Target(target.clone()),
            operation,
        }
    }

    pub fn snapshot(snapshot: &SharedSnapshot, operation: Operation) -> Self {
        Self {
            subject: Subject::Snapshot(snapshot.clone()),
            operation,
        }
    }
}

/// Runs one operation against the cloud
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute_target(
        &self,
        target: &mut DeployTarget,
        operation: Operation,
    ) -> Result<(), DeployError>;

    async fn execute_snapshot(
        &self,
        snapshot: &mut Snapshot,
        operation: Operation,
    ) -> Result<(), DeployError>;
}

/// Error bookkeeping shared by targets and snapshots
pub trait Tracked {
    fn label(&self) -> String;
    fn status(&self) -> Status;
    fn mark_failed(&mut self, reason: String);
}

impl Tracked for DeployTarget {
    fn label(&self) -> String {
        format!("{} `{}`", self.kind_label(), self.identity())
    }

    fn status(&self) -> Status {
        self.state().status
    }

    fn mark_failed(&mut self, reason: String) {
        self.state_mut().fail(reason);
    }
}

impl Tracked for Snapshot {
    fn label(&self) -> String {
        format!("{} `{}`", self.kind_label(), self.identity())
    }

    fn status(&self) -> Status {
        self.status
    }

    fn mark_failed(&mut self, reason: String) {
        self.fail(reason);
    }
}

/// Counts outstanding units of one batch
#[derive(Debug, Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Debug, Default)]
struct WaitGroupInner {
    pending: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        self.inner.pending.fetch_add(n, Ordering::SeqCst);
    }

    pub fn done(&self) {
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Resolve once the count drops to zero
    pub async fn wait(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            // register before checking, so a `done` in between is not lost
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct Job {
    unit: Unit,
    done: WaitGroup,
}

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) sharing one queue
    pub fn start(executor: Arc<dyn Executor>, reporter: Reporter, size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver: SharedReceiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    executor.clone(),
                    reporter.clone(),
                    receiver.clone(),
                ))
            })
            .collect();

        debug!("Worker pool started with {} worker(s)", size);
        Self { sender, workers }
    }

    /// Queue every unit, then wait until all of them have finished
    pub async fn run_batch(&self, units: Vec<Unit>) -> Result<(), DeployError> {
        if units.is_empty() {
            return Ok(());
        }

        let done = WaitGroup::new();
        done.add(units.len());
        for unit in units {
            self.sender
                .send(Job {
                    unit,
                    done: done.clone(),
                })
                .map_err(|_| DeployError::Internal("worker pool is closed".to_string()))?;
        }
        done.wait().await;
        Ok(())
    }

    /// Close the queue and wait for the workers to exit
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Worker exited abnormally: {}", e);
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    executor: Arc<dyn Executor>,
    reporter: Reporter,
    receiver: SharedReceiver,
) {
    loop {
        let job = { receiver.lock().await.recv().await };
        let Some(job) = job else {
            debug!("Worker {} stopping", id);
            return;
        };
        let operation = job.unit.operation;

        match &job.unit.subject {
            Subject::Target(target) => {
                let mut target = target.lock().await;
                if !skipped(&*target, operation, &reporter) {
                    debug!("Worker {} running {} on {}", id, operation, target.label());
                    let outcome = AssertUnwindSafe(executor.execute_target(&mut target, operation))
                        .catch_unwind()
                        .await;
                    settle(&mut *target, operation, outcome, &reporter);
                }
            }
            Subject::Snapshot(snapshot) => {
                let mut snapshot = snapshot.lock().await;
                if !skipped(&*snapshot, operation, &reporter) {
                    debug!("Worker {} running {} on {}", id, operation, snapshot.label());
                    let outcome =
                        AssertUnwindSafe(executor.execute_snapshot(&mut snapshot, operation))
                            .catch_unwind()
                            .await;
                    settle(&mut *snapshot, operation, outcome, &reporter);
                }
            }
        }
        job.done.done();
    }
}

fn skipped<T: Tracked>(subject: &T, operation: Operation, reporter: &Reporter) -> bool {
    if subject.status() != Status::Error {
        return false;
    }
    let label = subject.label();
    warn!("{} skipped {}: previous process error", label, operation);
    reporter.error(&format!("{} previous process error. skipping.", label));
    true
}

type Outcome = Result<Result<(), DeployError>, Box<dyn std::any::Any + Send>>;

fn settle<T: Tracked>(subject: &mut T, operation: Operation, outcome: Outcome, reporter: &Reporter) {
    let reason = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(_) => "unexpected panic".to_string(),
    };

    let label = subject.label();
    error!("{} failed during {}: {}", label, operation, reason);
    reporter.error(&format!(
        "Unexpected error in {} during {}.\n{}",
        label, operation, reason
    ));
    subject.mark_failed(reason);
}
