use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::{PipelineConfig, RetryConfig};
use crate::dlq::{DlqEntry, DlqStore};
use crate::events::{EventBus, SceneEvent};
use crate::job::model::JobRecord;
use crate::job::JobHistoryStore;
use crate::lifecycle::Lifecycle;
use crate::submitter::JobSubmitter;

/// Per-phase exponential backoff, dead-letter promotion, and the periodic
/// sweeps that drive both (§4.8). Retry policy is read from an in-memory
/// snapshot of [`PipelineConfig`], refreshed via [`RetryScheduler::refresh_cache`]
/// the same way the Phase Tracker refreshes its trigger map (§5).
pub struct RetryScheduler {
    history: Arc<dyn JobHistoryStore>,
    dlq: Arc<dyn DlqStore>,
    submitter: Arc<JobSubmitter>,
    events: Arc<EventBus>,
    config: RwLock<Arc<PipelineConfig>>,
}

impl RetryScheduler {
    pub fn new(
        history: Arc<dyn JobHistoryStore>,
        dlq: Arc<dyn DlqStore>,
        submitter: Arc<JobSubmitter>,
        events: Arc<EventBus>,
        config: Arc<PipelineConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            history,
            dlq,
            submitter,
            events,
            config: RwLock::new(config),
        })
    }

    pub fn refresh_cache(&self, config: Arc<PipelineConfig>) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    fn current_config(&self) -> Arc<PipelineConfig> {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Entry point from the Result Handler on a `failed`/`timed_out`
    /// outcome: schedules the next attempt or promotes to the DLQ.
    pub async fn handle_failure(&self, job: &JobRecord) {
        let policy = self.current_config().retry_for(job.phase.as_str());
        self.apply_policy(job, &policy).await;
    }

    async fn apply_policy(&self, job: &JobRecord, policy: &RetryConfig) {
        if job.retry_count >= policy.max_retries {
            self.promote_to_dlq(job).await;
            return;
        }

        let delay = policy.delay_for(job.retry_count);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let new_retry_count = job.retry_count + 1;

        if let Err(err) = self
            .history
            .schedule_retry(job.id, new_retry_count, next_retry_at)
            .await
        {
            warn!(target: "reel_core::retry", job = %job.id, error = %err, "failed to schedule retry");
            return;
        }

        self.events
            .publish(SceneEvent::retry_scheduled(
                job.scene_id,
                job.id,
                job.phase.as_str(),
                new_retry_count,
                policy.max_retries,
                next_retry_at,
            ))
            .await;
    }

    async fn promote_to_dlq(&self, job: &JobRecord) {
        let error = job.error.clone().unwrap_or_else(|| "unknown error".to_string());
        let entry = DlqEntry::new(job.id, job.scene_id, job.phase.as_str(), error);
        if let Err(err) = self.dlq.create(entry).await {
            warn!(target: "reel_core::retry", job = %job.id, error = %err, "failed to create dlq entry");
        }
        if let Err(err) = self.history.mark_not_retryable(job.id).await {
            warn!(target: "reel_core::retry", job = %job.id, error = %err, "failed to mark job not retryable after dlq promotion");
        }
        self.events
            .publish(SceneEvent::dlq_added(job.scene_id, job.phase.as_str()))
            .await;
    }

    /// Spawns the 30-second sweep that resubmits ready retries (§4.8).
    pub fn spawn_retry_sweep(self: &Arc<Self>, lifecycle: &Lifecycle) {
        let scheduler = self.clone();
        lifecycle.go("retry-scheduler-sweep", move |done| async move {
            loop {
                scheduler.sweep_once().await;
                let interval =
                    Duration::from_secs(scheduler.current_config().retry_sweep_interval_seconds.max(1));
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    /// Spawns the hourly DLQ auto-abandon sweep (§4.9).
    pub fn spawn_dlq_abandon_sweep(self: &Arc<Self>, lifecycle: &Lifecycle) {
        let scheduler = self.clone();
        lifecycle.go("dlq-auto-abandon-sweep", move |done| async move {
            loop {
                let days = scheduler.current_config().dlq_abandon_after_days;
                match scheduler.dlq.auto_abandon(chrono::Duration::days(days)).await {
                    Ok(count) if count > 0 => {
                        info!(target: "reel_core::retry", count, "auto-abandoned stale dlq entries")
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target: "reel_core::retry", error = %err, "dlq auto-abandon sweep failed")
                    }
                }
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                }
            }
        });
    }

    async fn sweep_once(&self) {
        let now = Utc::now();
        let ready = match self.history.list_ready_retries(now).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(target: "reel_core::retry", error = %err, "failed to list ready retries");
                return;
            }
        };

        for job in ready {
            // Flip is_retryable off first so a concurrent tick (or a
            // restart mid-sweep) can't double-pick the same row.
            if self.history.mark_not_retryable(job.id).await.is_err() {
                continue;
            }

            let resubmitted = self
                .submitter
                .submit_phase_with_retry(job.scene_id, &job.phase, job.retry_count, job.max_retries)
                .await;

            if let Err(err) = resubmitted {
                warn!(target: "reel_core::retry", job = %job.id, error = %err, "resubmission failed, re-applying retry policy");
                let policy = self.current_config().retry_for(job.phase.as_str());
                self.apply_policy(&job, &policy).await;
            }
        }
    }
}
