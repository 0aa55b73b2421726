use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::ids::SceneId;
use crate::job::model::{phases, JobRecord, Phase, DEFAULT_PRIORITY, MANUAL_PRIORITY};
use crate::job::JobHistoryStore;
use crate::scene::{Scene, SceneRepository};

/// Which scenes `submit_bulk` should target.
pub enum BulkMode {
    All,
    MissingArtifact,
    Specified(Vec<SceneId>),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BulkSubmitCounts {
    pub submitted: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Whether `scene` is missing the artifact `phase` would produce, used by
/// `submit_bulk`'s `MissingArtifact` mode. Phases with no scene-visible
/// artifact (currently `marker_thumbnails`) are always considered missing.
fn is_missing_artifact(phase: &str, scene: &Scene) -> bool {
    match phase {
        phases::METADATA => !scene.has_duration(),
        phases::THUMBNAIL => {
            scene.thumbnail_small_path.is_none() || scene.thumbnail_large_path.is_none()
        }
        phases::SPRITES => scene.sprite_sheet_path.is_none(),
        phases::FINGERPRINT => scene.fingerprint.is_none(),
        phases::ANIMATED_THUMBNAILS => scene.animated_preview_path.is_none(),
        _ => true,
    }
}

/// Public surface for creating work (§4.5). Enforces the idempotency rule
/// (at most one `pending`/`running` row per `(scene_id, phase)` unless
/// forced) before handing a new row to the history store.
pub struct JobSubmitter {
    history: Arc<dyn JobHistoryStore>,
    scenes: Arc<dyn SceneRepository>,
    config: Arc<PipelineConfig>,
}

impl JobSubmitter {
    pub fn new(
        history: Arc<dyn JobHistoryStore>,
        scenes: Arc<dyn SceneRepository>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            history,
            scenes,
            config,
        }
    }

    /// Entry point on upload: creates a `pending` metadata job if none
    /// already exists for this scene.
    pub async fn submit_scene(&self, scene_id: SceneId) -> Result<Option<JobRecord>> {
        self.submit_phase(scene_id, &Phase::new(phases::METADATA))
            .await
    }

    pub async fn submit_phase(&self, scene_id: SceneId, phase: &Phase) -> Result<Option<JobRecord>> {
        self.submit(scene_id, phase, DEFAULT_PRIORITY, 0, None, false)
            .await
    }

    pub async fn submit_phase_with_priority(
        &self,
        scene_id: SceneId,
        phase: &Phase,
        priority: i32,
    ) -> Result<Option<JobRecord>> {
        self.submit(scene_id, phase, priority, 0, None, false).await
    }

    /// Used by the retry scheduler so the new row inherits the predecessor's
    /// retry count rather than restarting the backoff sequence.
    pub async fn submit_phase_with_retry(
        &self,
        scene_id: SceneId,
        phase: &Phase,
        retry_count: u16,
        max_retries: u16,
    ) -> Result<Option<JobRecord>> {
        self.submit(
            scene_id,
            phase,
            DEFAULT_PRIORITY,
            retry_count,
            Some(max_retries),
            false,
        )
        .await
    }

    /// Checks `find_active` and then inserts. The check is an optimization
    /// that avoids the round trip to the store's insert path in the common
    /// case; it is not itself the enforcement point for the "at most one
    /// active row per (scene_id, phase)" invariant; two concurrent callers
    /// can both pass this check before either has inserted. The store's
    /// `insert` is the actual arbiter (backed by a partial unique index in
    /// the reference Postgres implementation) and returns `Ok(None)` if a
    /// concurrent insert already won the race, which this treats identically
    /// to the `find_active` skip path.
    async fn submit(
        &self,
        scene_id: SceneId,
        phase: &Phase,
        priority: i32,
        retry_count: u16,
        max_retries_override: Option<u16>,
        force_target: bool,
    ) -> Result<Option<JobRecord>> {
        if !force_target {
            if self.history.find_active(scene_id, phase).await?.is_some() {
                return Ok(None);
            }
        }

        let max_retries =
            max_retries_override.unwrap_or_else(|| self.config.retry_for(phase.as_str()).max_retries);
        let mut job = if retry_count > 0 {
            JobRecord::new_retry(scene_id, phase.clone(), priority, retry_count, max_retries)
        } else {
            JobRecord::new(scene_id, phase.clone(), priority, max_retries)
        };
        job.force_target = force_target;

        self.history.insert(job).await
    }

    /// Enqueues `phase` for every scene selected by `mode`, at manual-trigger
    /// priority. Per-scene failures are counted, not propagated, so one bad
    /// row doesn't abort the whole batch.
    pub async fn submit_bulk(
        &self,
        phase: &Phase,
        mode: BulkMode,
        force_target: bool,
    ) -> Result<BulkSubmitCounts> {
        let scene_ids = match mode {
            BulkMode::Specified(ids) => ids,
            BulkMode::All => self.scenes.all_scene_ids().await?,
            BulkMode::MissingArtifact => {
                let ids = self.scenes.all_scene_ids().await?;
                let scenes = self.scenes.get_by_ids(&ids).await?;
                scenes
                    .into_iter()
                    .filter(|scene| is_missing_artifact(phase.as_str(), scene))
                    .map(|scene| scene.id)
                    .collect()
            }
        };

        let mut counts = BulkSubmitCounts::default();
        for scene_id in scene_ids {
            match self
                .submit(scene_id, phase, MANUAL_PRIORITY, 0, None, force_target)
                .await
            {
                Ok(Some(_)) => counts.submitted += 1,
                Ok(None) => counts.skipped += 1,
                Err(_) => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
