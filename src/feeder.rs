use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::PipelineConfig;
use crate::events::{EventBus, SceneEvent};
use crate::job::model::{phases, JobRecord, Phase};
use crate::job::JobHistoryStore;
use crate::lifecycle::Lifecycle;
use crate::pool::{SubmitError, WorkerPool};
use crate::scene::SceneRepository;

/// Phases that require a known, positive duration before they can run:
/// both need to seek into the video.
fn needs_duration(phase: &str) -> bool {
    matches!(phase, phases::THUMBNAIL | phases::SPRITES)
}

/// Single supervised task that claims pending jobs and dispatches them to
/// the matching per-phase pool (§4.6). The job history store remains the
/// source of truth; this task only moves rows from `pending` to `running`
/// (or back) and hands hydrated work to the pools.
pub struct JobQueueFeeder {
    history: Arc<dyn JobHistoryStore>,
    scenes: Arc<dyn SceneRepository>,
    pools: HashMap<String, Arc<WorkerPool>>,
    events: Arc<EventBus>,
    config: Arc<PipelineConfig>,
}

impl JobQueueFeeder {
    pub fn new(
        history: Arc<dyn JobHistoryStore>,
        scenes: Arc<dyn SceneRepository>,
        pools: HashMap<String, Arc<WorkerPool>>,
        events: Arc<EventBus>,
        config: Arc<PipelineConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            history,
            scenes,
            pools,
            events,
            config,
        })
    }

    pub fn spawn(self: &Arc<Self>, lifecycle: &Lifecycle) {
        let feeder = self.clone();
        lifecycle.go("job-queue-feeder", move |done| async move {
            feeder.run(done).await;
        });
    }

    async fn run(&self, done: CancellationToken) {
        let interval = Duration::from_millis(self.config.feeder_poll_interval_ms.max(1));
        loop {
            self.tick().await;
            tokio::select! {
                _ = done.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn tick(&self) {
        let rows = match self.history.list_pending(self.config.feeder_batch_size).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(target: "reel_core::feeder", error = %err, "failed to list pending jobs");
                return;
            }
        };
        for row in rows {
            self.dispatch_one(row).await;
        }
    }

    /// Claims, hydrates, validates, and dispatches one job row. Never
    /// panics or propagates an error: every failure path either fails the
    /// job in the store or requeues it for the next tick.
    async fn dispatch_one(&self, row: JobRecord) {
        let claimed = match self.history.claim(row.id).await {
            Ok(Some(job)) => job,
            Ok(None) => return, // another claimant (or a prior tick) already took it
            Err(err) => {
                warn!(target: "reel_core::feeder", job = %row.id, error = %err, "claim failed");
                return;
            }
        };

        let scene = match self.scenes.get_by_id(claimed.scene_id).await {
            Ok(Some(scene)) => scene,
            Ok(None) => {
                self.fail_terminally(&claimed, "referenced scene no longer exists").await;
                return;
            }
            Err(err) => {
                warn!(target: "reel_core::feeder", job = %claimed.id, error = %err, "scene hydration failed, requeueing");
                let _ = self.history.requeue(claimed.id).await;
                return;
            }
        };

        if needs_duration(claimed.phase.as_str()) && !scene.has_duration() {
            let error = format!(
                "phase {} requires a known duration but scene {} has none",
                claimed.phase, claimed.scene_id
            );
            self.fail_terminally(&claimed, &error).await;
            return;
        }

        let Some(pool) = self.pools.get(claimed.phase.as_str()) else {
            self.fail_terminally(
                &claimed,
                &format!("no worker pool configured for phase {}", claimed.phase),
            )
            .await;
            return;
        };

        match pool.submit(claimed.clone()).await {
            Ok(()) => {
                self.events
                    .publish(SceneEvent::processing_started(
                        claimed.scene_id,
                        claimed.phase.as_str(),
                    ))
                    .await;
            }
            Err(SubmitError::QueueFull) | Err(SubmitError::Stopped) => {
                let _ = self.history.requeue(claimed.id).await;
            }
        }
    }

    async fn fail_terminally(&self, job: &JobRecord, error: &str) {
        let _ = self.history.mark_failed(job.id, error, false).await;
        self.events
            .publish(SceneEvent::phase_failed(job.scene_id, job.phase.as_str(), error))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SceneId;
    use crate::job::history::MockJobHistoryStore;
    use crate::job::model::JobOutcome;
    use crate::pool::JobContext;
    use crate::scene::{MockSceneRepository, Scene};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn scene(id: i64, duration: Option<f64>) -> Scene {
        Scene {
            id: SceneId(id),
            uuid: uuid::Uuid::now_v7(),
            original_filename: "f.mp4".into(),
            stored_path: "/tmp/f.mp4".into(),
            size_bytes: 1,
            trashed_at: None,
            duration_seconds: duration,
            width: None,
            height: None,
            codec: None,
            bit_rate: None,
            thumbnail_small_path: None,
            thumbnail_large_path: None,
            sprite_sheet_path: None,
            vtt_path: None,
            animated_preview_path: None,
            fingerprint: None,
            actor_names: vec![],
            tag_names: vec![],
        }
    }

    struct NoopExecutor;
    #[async_trait]
    impl crate::pool::JobExecutor for NoopExecutor {
        async fn execute(&self, _job: &JobRecord, _ctx: JobContext) -> JobOutcome {
            JobOutcome::Success(serde_json::json!({}))
        }
    }

    fn pending_job(phase: &str) -> JobRecord {
        JobRecord::new(SceneId(1), Phase::new(phase), 0, 3)
    }

    #[tokio::test]
    async fn fails_job_terminally_when_duration_missing() {
        let mut history = MockJobHistoryStore::new();
        let job = pending_job(phases::THUMBNAIL);
        let claimed = job.clone();
        history.expect_claim().returning(move |_| Ok(Some(claimed.clone())));
        history
            .expect_mark_failed()
            .withf(|_, _, retryable| !retryable)
            .returning(|_, _, _| Ok(()));

        let mut scenes = MockSceneRepository::new();
        scenes
            .expect_get_by_id()
            .returning(|id| Ok(Some(scene(id.0, None))));

        let (tx, _rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            phases::THUMBNAIL,
            0,
            8,
            Duration::from_secs(5),
            Arc::new(NoopExecutor),
            tx,
            Lifecycle::new(),
        );
        let mut pools = HashMap::new();
        pools.insert(phases::THUMBNAIL.to_string(), pool);

        let feeder = JobQueueFeeder::new(
            Arc::new(history),
            Arc::new(scenes),
            pools,
            EventBus::new(8),
            Arc::new(PipelineConfig::default()),
        );
        feeder.dispatch_one(job).await;
    }

    #[tokio::test]
    async fn dispatches_and_emits_processing_started() {
        let mut history = MockJobHistoryStore::new();
        let job = pending_job(phases::METADATA);
        let claimed = job.clone();
        history.expect_claim().returning(move |_| Ok(Some(claimed.clone())));

        let mut scenes = MockSceneRepository::new();
        scenes
            .expect_get_by_id()
            .returning(|id| Ok(Some(scene(id.0, None))));

        let (tx, _rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            phases::METADATA,
            0,
            8,
            Duration::from_secs(5),
            Arc::new(NoopExecutor),
            tx,
            Lifecycle::new(),
        );
        let mut pools = HashMap::new();
        pools.insert(phases::METADATA.to_string(), pool);

        let events = EventBus::new(8);
        let mut sub = events.subscribe().await;

        let feeder = JobQueueFeeder::new(
            Arc::new(history),
            Arc::new(scenes),
            pools,
            events,
            Arc::new(PipelineConfig::default()),
        );
        feeder.dispatch_one(job).await;

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.event_type, "scene:processing_started");
    }

    #[tokio::test]
    async fn requeues_when_pool_is_full() {
        let mut history = MockJobHistoryStore::new();
        let job = pending_job(phases::METADATA);
        let claimed = job.clone();
        history.expect_claim().returning(move |_| Ok(Some(claimed.clone())));
        history.expect_requeue().returning(|_| Ok(()));

        let mut scenes = MockSceneRepository::new();
        scenes
            .expect_get_by_id()
            .returning(|id| Ok(Some(scene(id.0, None))));

        let (tx, _rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            phases::METADATA,
            0,
            0, // zero capacity: submit always fails full
            Duration::from_secs(5),
            Arc::new(NoopExecutor),
            tx,
            Lifecycle::new(),
        );
        let mut pools = HashMap::new();
        pools.insert(phases::METADATA.to_string(), pool);

        let feeder = JobQueueFeeder::new(
            Arc::new(history),
            Arc::new(scenes),
            pools,
            EventBus::new(8),
            Arc::new(PipelineConfig::default()),
        );
        feeder.dispatch_one(job).await;
    }
}
