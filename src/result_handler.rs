use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::events::{EventBus, SceneEvent};
use crate::job::model::{phases, JobOutcome, JobRecord, Phase};
use crate::job::JobHistoryStore;
use crate::lifecycle::Lifecycle;
use crate::phase_tracker::PhaseTracker;
use crate::pool::PoolResult;
use crate::retry::RetryScheduler;
use crate::scene::{DerivedFields, SceneRepository};
use crate::search::{MarkerThumbnailGenerator, SearchIndexer};
use crate::submitter::JobSubmitter;

/// Whether a completed `phase`'s derived fields should be pushed to the
/// external search index. Sprite sheets, VTTs, and the animated preview
/// don't change what a search query can match on; duration/dimensions and
/// the fingerprint do.
fn affects_search_index(phase: &str) -> bool {
    matches!(phase, phases::METADATA | phases::THUMBNAIL | phases::FINGERPRINT)
}

/// Consumes [`PoolResult`]s from every pool (§4.7). This is the one place
/// that turns a worker outcome into durable state, a UI event, and the next
/// step of the pipeline; every side effect past the initial database write
/// is best-effort and only logged on failure (§4.7 side-effect invariant).
pub struct ResultHandler {
    history: Arc<dyn JobHistoryStore>,
    scenes: Arc<dyn SceneRepository>,
    phase_tracker: Arc<PhaseTracker>,
    submitter: Arc<JobSubmitter>,
    retry: Arc<RetryScheduler>,
    search: Arc<dyn SearchIndexer>,
    markers: Arc<dyn MarkerThumbnailGenerator>,
    events: Arc<EventBus>,
}

impl ResultHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        history: Arc<dyn JobHistoryStore>,
        scenes: Arc<dyn SceneRepository>,
        phase_tracker: Arc<PhaseTracker>,
        submitter: Arc<JobSubmitter>,
        retry: Arc<RetryScheduler>,
        search: Arc<dyn SearchIndexer>,
        markers: Arc<dyn MarkerThumbnailGenerator>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            history,
            scenes,
            phase_tracker,
            submitter,
            retry,
            search,
            markers,
            events,
        })
    }

    pub fn spawn(self: &Arc<Self>, mut results: mpsc::Receiver<PoolResult>, lifecycle: &Lifecycle) {
        let handler = self.clone();
        lifecycle.go("result-handler", move |done| async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    received = results.recv() => {
                        match received {
                            Some(result) => handler.handle(result).await,
                            None => break,
                        }
                    }
                }
            }
        });
    }

    pub async fn handle(&self, result: PoolResult) {
        let PoolResult { job, outcome } = result;
        match outcome {
            JobOutcome::Success(derived) => self.handle_success(job, derived).await,
            JobOutcome::Failure(error) => self.handle_failure(job, error).await,
            JobOutcome::Cancelled => self.handle_cancelled(job).await,
            JobOutcome::TimedOut => self.handle_timed_out(job).await,
        }
    }

    async fn handle_success(&self, job: JobRecord, derived: serde_json::Value) {
        let fields: DerivedFields = serde_json::from_value(derived).unwrap_or_default();

        if let Err(err) = self
            .scenes
            .update_derived_fields(job.scene_id, fields)
            .await
        {
            warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "failed to persist derived fields, treating as failure");
            self.handle_failure(job, format!("failed to persist derived fields: {err}"))
                .await;
            return;
        }

        if let Err(err) = self
            .scenes
            .update_processing_status(job.scene_id, job.phase.as_str(), false)
            .await
        {
            warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "failed to update scene processing status");
        }

        if let Err(err) = self.history.mark_completed(job.id).await {
            warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "failed to mark job completed");
            return;
        }

        self.events
            .publish(SceneEvent::phase_complete(job.scene_id, job.phase.as_str()))
            .await;

        for next_phase in self.phase_tracker.next_phases(job.phase.as_str()) {
            if let Err(err) = self
                .submitter
                .submit_phase(job.scene_id, &Phase::new(next_phase.clone()))
                .await
            {
                warn!(target: "reel_core::result_handler", job = %job.id, next_phase = %next_phase, error = %err, "failed to submit downstream phase");
            }
        }

        if affects_search_index(job.phase.as_str()) {
            match self.scenes.get_by_id(job.scene_id).await {
                Ok(Some(scene)) => {
                    if let Err(err) = self.search.update_scene_index(&scene).await {
                        warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "search index update failed");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "failed to hydrate scene for search indexing");
                }
            }
        }

        if job.phase.as_str() == phases::MARKER_THUMBNAILS {
            if let Err(err) = self.markers.generate_for_scene(job.scene_id).await {
                warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "marker thumbnail regeneration failed");
            }
        }
    }

    async fn handle_failure(&self, job: JobRecord, error: String) {
        if let Err(err) = self.history.mark_failed(job.id, &error, true).await {
            warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "failed to mark job failed");
        }
        if let Err(err) = self
            .scenes
            .update_processing_status(job.scene_id, job.phase.as_str(), true)
            .await
        {
            warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "failed to update scene processing status");
        }

        self.events
            .publish(SceneEvent::phase_failed(job.scene_id, job.phase.as_str(), &error))
            .await;

        let mut job = job;
        job.error = Some(error);
        self.retry.handle_failure(&job).await;
    }

    async fn handle_cancelled(&self, job: JobRecord) {
        if let Err(err) = self.history.mark_cancelled(job.id).await {
            warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "failed to mark job cancelled");
        }
        self.events
            .publish(SceneEvent::phase_cancelled(job.scene_id, job.phase.as_str()))
            .await;
    }

    async fn handle_timed_out(&self, job: JobRecord) {
        if let Err(err) = self.history.mark_timed_out(job.id).await {
            warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "failed to mark job timed out");
        }
        if let Err(err) = self
            .scenes
            .update_processing_status(job.scene_id, job.phase.as_str(), true)
            .await
        {
            warn!(target: "reel_core::result_handler", job = %job.id, error = %err, "failed to update scene processing status");
        }

        self.events
            .publish(SceneEvent::phase_failed(job.scene_id, job.phase.as_str(), "job timed out"))
            .await;

        let mut job = job;
        job.error = Some("job timed out".to_string());
        self.retry.handle_failure(&job).await;
    }
}
