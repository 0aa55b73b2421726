use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ids::JobId;
use crate::job::model::{JobOutcome, JobRecord, QueueEntry};
use crate::lifecycle::Lifecycle;

/// Per-job execution context handed to a [`JobExecutor`]: the phase timeout
/// and a cancellation handle the executor's own I/O (child process, HTTP
/// call, ...) must observe and abort on (§4.3, §5 Cancellation).
#[derive(Clone)]
pub struct JobContext {
    pub timeout: Duration,
    pub cancellation: CancellationToken,
}

/// Runs one phase's work for one job. Implemented by the host application
/// per phase (metadata probe, thumbnail extraction, ...); the core only
/// drives the pool around it.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &JobRecord, ctx: JobContext) -> JobOutcome;
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("pool queue is full")]
    QueueFull,
    #[error("pool is stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    CancelledQueued,
    CancelledRunning,
    NotFound,
}

/// Outcome of one job run, paired with the record so the Result Handler has
/// everything it needs without a re-fetch.
pub struct PoolResult {
    pub job: JobRecord,
    pub outcome: JobOutcome,
}

struct PoolState {
    queue: BinaryHeap<QueueEntry>,
    running: HashMap<JobId, CancellationToken>,
    stopped: bool,
}

/// One fixed-size pool per pipeline phase (§4.3). The work queue is a
/// priority heap — higher `priority` first, FIFO within a priority band via
/// a monotonic sequence number (§9).
pub struct WorkerPool {
    phase: String,
    capacity: usize,
    timeout: Duration,
    executor: Arc<dyn JobExecutor>,
    lifecycle: Lifecycle,
    state: Arc<Mutex<PoolState>>,
    notify: Arc<Notify>,
    sequence: Arc<AtomicU64>,
    accepting: Arc<AtomicBool>,
    results: mpsc::Sender<PoolResult>,
    local_shutdown: Mutex<CancellationToken>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `workers` worker tasks that pull from the shared priority
    /// queue and run jobs through `executor`, pushing results onto `results`
    /// for the Result Handler. Workers observe both the process-wide
    /// `lifecycle` shutdown signal and the pool's own local one (used by
    /// [`WorkerPool::resize`]).
    pub fn spawn(
        phase: impl Into<String>,
        workers: usize,
        capacity: usize,
        timeout: Duration,
        executor: Arc<dyn JobExecutor>,
        results: mpsc::Sender<PoolResult>,
        lifecycle: Lifecycle,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            phase: phase.into(),
            capacity,
            timeout,
            executor,
            lifecycle,
            state: Arc::new(Mutex::new(PoolState {
                queue: BinaryHeap::new(),
                running: HashMap::new(),
                stopped: false,
            })),
            notify: Arc::new(Notify::new()),
            sequence: Arc::new(AtomicU64::new(0)),
            accepting: Arc::new(AtomicBool::new(true)),
            results,
            local_shutdown: Mutex::new(CancellationToken::new()),
            worker_handles: Mutex::new(Vec::new()),
        });

        let pool_for_spawn = pool.clone();
        // The first batch of workers is spawned synchronously via a
        // blocking-free path: we hand off to an async setup task so `spawn`
        // stays a plain constructor.
        tokio::spawn(async move {
            pool_for_spawn.spawn_workers(workers).await;
        });

        pool
    }

    async fn spawn_workers(self: &Arc<Self>, count: usize) {
        let local_token = self.local_shutdown.lock().await.clone();
        let mut handles = self.worker_handles.lock().await;
        for worker_index in 0..count {
            handles.push(self.spawn_one_worker(worker_index, local_token.clone()));
        }
    }

    fn spawn_one_worker(
        self: &Arc<Self>,
        worker_index: usize,
        local_token: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        let lifecycle_done = self.lifecycle.done();
        let worker_name = format!("pool[{}]-w{worker_index}", pool.phase);

        tokio::spawn(async move {
            loop {
                let entry = {
                    let mut guard = pool.state.lock().await;
                    guard.queue.pop()
                };

                let Some(entry) = entry else {
                    tokio::select! {
                        _ = lifecycle_done.cancelled() => break,
                        _ = local_token.cancelled() => break,
                        _ = pool.notify.notified() => continue,
                    }
                };

                if lifecycle_done.is_cancelled() || local_token.is_cancelled() {
                    let mut guard = pool.state.lock().await;
                    guard.queue.push(entry);
                    break;
                }

                let job = entry.job;
                let job_id = job.id;
                let cancellation = CancellationToken::new();
                {
                    let mut guard = pool.state.lock().await;
                    guard.running.insert(job_id, cancellation.clone());
                }

                let ctx = JobContext {
                    timeout: pool.timeout,
                    cancellation: cancellation.clone(),
                };

                let outcome = tokio::select! {
                    result = pool.executor.execute(&job, ctx) => result,
                    _ = tokio::time::sleep(pool.timeout) => JobOutcome::TimedOut,
                    _ = cancellation.cancelled() => JobOutcome::Cancelled,
                };

                {
                    let mut guard = pool.state.lock().await;
                    guard.running.remove(&job_id);
                }

                if pool.results.send(PoolResult { job, outcome }).await.is_err() {
                    warn!(target: "reel_core::pool", phase = %pool.phase, "result channel closed, worker exiting");
                    break;
                }
            }
            info!(target: "reel_core::pool", phase = %pool.phase, worker = %worker_name, "worker stopped");
        })
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// Enqueues `job`. Fails with [`SubmitError::Stopped`] if the pool has
    /// begun a graceful stop, or [`SubmitError::QueueFull`] if `capacity`
    /// would be exceeded.
    pub async fn submit(&self, job: JobRecord) -> Result<(), SubmitError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::Stopped);
        }
        let mut guard = self.state.lock().await;
        if guard.stopped {
            return Err(SubmitError::Stopped);
        }
        if guard.queue.len() + guard.running.len() >= self.capacity {
            return Err(SubmitError::QueueFull);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        guard.queue.push(QueueEntry { job, sequence });
        drop(guard);
        self.notify.notify_one();
        Ok(())
    }

    /// Cancels `job_id`. If still queued, removes it, reports the job to the
    /// Result Handler as `cancelled`, and returns `CancelledQueued`. If
    /// running, trips its cancellation token and returns `CancelledRunning`
    /// (the worker itself reports the outcome once the executor unwinds).
    pub async fn cancel(&self, job_id: JobId) -> CancelOutcome {
        let mut guard = self.state.lock().await;
        if let Some(token) = guard.running.get(&job_id) {
            token.cancel();
            return CancelOutcome::CancelledRunning;
        }

        let entries: Vec<QueueEntry> = guard.queue.drain().collect();
        let mut removed = None;
        let mut remaining = Vec::with_capacity(entries.len());
        for entry in entries {
            if removed.is_none() && entry.job.id == job_id {
                removed = Some(entry.job);
            } else {
                remaining.push(entry);
            }
        }
        guard.queue = remaining.into_iter().collect();
        drop(guard);

        match removed {
            Some(job) => {
                let _ = self
                    .results
                    .send(PoolResult {
                        job,
                        outcome: JobOutcome::Cancelled,
                    })
                    .await;
                CancelOutcome::CancelledQueued
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// Stops accepting submissions and waits up to `timeout` for
    /// currently-running jobs to finish, then returns the ids of jobs that
    /// were still queued (never started) so the feeder can re-queue them.
    pub async fn graceful_stop(&self, timeout: Duration) -> Vec<JobId> {
        self.accepting.store(false, Ordering::SeqCst);

        let queued_ids: Vec<JobId> = {
            let mut guard = self.state.lock().await;
            guard.stopped = true;
            guard.queue.drain().map(|e| e.job.id).collect()
        };
        self.notify.notify_waiters();

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let still_running = {
                let guard = self.state.lock().await;
                !guard.running.is_empty()
            };
            if !still_running || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        queued_ids
    }

    /// Drains the current worker set and respawns with `new_count` workers.
    /// In-flight jobs are not interrupted; queued jobs are preserved across
    /// the resize.
    pub async fn resize(self: &Arc<Self>, new_count: usize) {
        let old_token = {
            let mut guard = self.local_shutdown.lock().await;
            let old = guard.clone();
            *guard = CancellationToken::new();
            old
        };
        old_token.cancel();
        self.notify.notify_waiters();

        let old_handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in old_handles {
            let _ = handle.await;
        }

        self.accepting.store(true, Ordering::SeqCst);
        {
            let mut guard = self.state.lock().await;
            guard.stopped = false;
        }
        self.spawn_workers(new_count).await;
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SceneId;
    use crate::job::model::{phases, Phase};

    struct EchoExecutor {
        delay: Duration,
    }

    #[async_trait]
    impl JobExecutor for EchoExecutor {
        async fn execute(&self, _job: &JobRecord, ctx: JobContext) -> JobOutcome {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => JobOutcome::Success(serde_json::json!({})),
                _ = ctx.cancellation.cancelled() => JobOutcome::Cancelled,
            }
        }
    }

    fn job(priority: i32) -> JobRecord {
        JobRecord::new(SceneId(1), Phase::new(phases::METADATA), priority, 3)
    }

    #[tokio::test]
    async fn submit_and_run_reports_success() {
        let lifecycle = Lifecycle::new();
        let (tx, mut rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            phases::METADATA,
            1,
            8,
            Duration::from_secs(5),
            Arc::new(EchoExecutor {
                delay: Duration::from_millis(1),
            }),
            tx,
            lifecycle,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.submit(job(0)).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result.outcome, JobOutcome::Success(_)));
    }

    #[tokio::test]
    async fn full_queue_is_rejected() {
        let lifecycle = Lifecycle::new();
        let (tx, _rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            phases::METADATA,
            0,
            1,
            Duration::from_secs(5),
            Arc::new(EchoExecutor {
                delay: Duration::from_secs(5),
            }),
            tx,
            lifecycle,
        );
        pool.submit(job(0)).await.unwrap();
        let err = pool.submit(job(0)).await.unwrap_err();
        assert_eq!(err, SubmitError::QueueFull);
    }

    #[tokio::test]
    async fn cancel_queued_job_reports_cancelled() {
        let lifecycle = Lifecycle::new();
        let (tx, mut rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            phases::METADATA,
            0,
            4,
            Duration::from_secs(5),
            Arc::new(EchoExecutor {
                delay: Duration::from_secs(5),
            }),
            tx,
            lifecycle,
        );
        let j = job(0);
        let job_id = j.id;
        pool.submit(j).await.unwrap();

        let outcome = pool.cancel(job_id).await;
        assert_eq!(outcome, CancelOutcome::CancelledQueued);

        let result = rx.recv().await.unwrap();
        assert!(matches!(result.outcome, JobOutcome::Cancelled));
    }

    #[tokio::test]
    async fn cancel_running_job_trips_its_token() {
        let lifecycle = Lifecycle::new();
        let (tx, mut rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            phases::METADATA,
            1,
            4,
            Duration::from_secs(5),
            Arc::new(EchoExecutor {
                delay: Duration::from_secs(5),
            }),
            tx,
            lifecycle,
        );
        let j = job(0);
        let job_id = j.id;
        pool.submit(j).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = pool.cancel(job_id).await;
        assert_eq!(outcome, CancelOutcome::CancelledRunning);

        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result.outcome, JobOutcome::Cancelled));
    }

    #[tokio::test]
    async fn priority_queue_runs_higher_priority_first() {
        let lifecycle = Lifecycle::new();
        let (tx, mut rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            phases::METADATA,
            0, // no workers yet; we want both jobs queued before draining
            8,
            Duration::from_secs(5),
            Arc::new(EchoExecutor {
                delay: Duration::from_millis(1),
            }),
            tx,
            lifecycle,
        );
        pool.submit(job(0)).await.unwrap();
        pool.submit(job(5)).await.unwrap();
        pool.resize(1).await;

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.job.priority, 5);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.job.priority, 0);
    }

    #[tokio::test]
    async fn graceful_stop_returns_queued_ids() {
        let lifecycle = Lifecycle::new();
        let (tx, _rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            phases::METADATA,
            0,
            8,
            Duration::from_secs(5),
            Arc::new(EchoExecutor {
                delay: Duration::from_secs(5),
            }),
            tx,
            lifecycle,
        );
        let j = job(0);
        let job_id = j.id;
        pool.submit(j).await.unwrap();

        let remaining = pool.graceful_stop(Duration::from_millis(50)).await;
        assert_eq!(remaining, vec![job_id]);

        let err = pool.submit(job(0)).await.unwrap_err();
        assert_eq!(err, SubmitError::Stopped);
    }
}
