use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::dlq::DlqStore;
use crate::events::{EventBus, SceneEvent};
use crate::job::JobHistoryStore;
use crate::lifecycle::Lifecycle;
use crate::scene::{Scene, SceneRepository};
use crate::search::SearchIndexer;

/// Hourly sweep that hard-deletes scenes whose soft-delete retention has
/// expired (§4.10). Hard-delete here means the full fan-out: cancel
/// anything still queued for the scene, drop its DLQ history, remove the
/// row, best-effort delete its on-disk artifacts, and drop it from the
/// search index — in that order, so a crash partway through leaves nothing
/// worse than an orphaned file on disk.
pub struct TrashCleanupWorker {
    scenes: Arc<dyn SceneRepository>,
    history: Arc<dyn JobHistoryStore>,
    dlq: Arc<dyn DlqStore>,
    search: Arc<dyn SearchIndexer>,
    events: Arc<EventBus>,
    config: Arc<PipelineConfig>,
}

impl TrashCleanupWorker {
    pub fn new(
        scenes: Arc<dyn SceneRepository>,
        history: Arc<dyn JobHistoryStore>,
        dlq: Arc<dyn DlqStore>,
        search: Arc<dyn SearchIndexer>,
        events: Arc<EventBus>,
        config: Arc<PipelineConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scenes,
            history,
            dlq,
            search,
            events,
            config,
        })
    }

    pub fn spawn(self: &Arc<Self>, lifecycle: &Lifecycle) {
        let worker = self.clone();
        lifecycle.go("trash-cleanup-worker", move |done| async move {
            loop {
                worker.sweep_once().await;
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                }
            }
        });
    }

    async fn sweep_once(&self) {
        let expired = match self
            .scenes
            .get_expired_trash(self.config.trash_retention_days)
            .await
        {
            Ok(scenes) => scenes,
            Err(err) => {
                warn!(target: "reel_core::trash", error = %err, "failed to list expired trash");
                return;
            }
        };

        for scene in expired {
            self.hard_delete_one(scene).await;
        }
    }

    async fn hard_delete_one(&self, scene: Scene) {
        let scene_id = scene.id;

        if let Err(err) = self.history.cancel_all_for_scene(scene_id).await {
            warn!(target: "reel_core::trash", scene = %scene_id, error = %err, "failed to cancel pending jobs before hard delete");
        }
        if let Err(err) = self.dlq.delete_by_scene(scene_id).await {
            warn!(target: "reel_core::trash", scene = %scene_id, error = %err, "failed to delete dlq entries before hard delete");
        }

        if let Err(err) = self.scenes.hard_delete(scene_id).await {
            warn!(target: "reel_core::trash", scene = %scene_id, error = %err, "failed to remove scene row, aborting artifact cleanup for it");
            return;
        }

        self.delete_artifacts(&scene).await;

        if let Err(err) = self.search.delete_scene_index(scene_id).await {
            warn!(target: "reel_core::trash", scene = %scene_id, error = %err, "failed to remove scene from search index");
        }

        self.events.publish(SceneEvent::deleted(scene_id)).await;
        info!(target: "reel_core::trash", scene = %scene_id, "hard-deleted expired trash scene");
    }

    async fn delete_artifacts(&self, scene: &Scene) {
        let paths = [
            Some(scene.stored_path.as_str()),
            scene.thumbnail_small_path.as_deref(),
            scene.thumbnail_large_path.as_deref(),
            scene.sprite_sheet_path.as_deref(),
            scene.vtt_path.as_deref(),
            scene.animated_preview_path.as_deref(),
        ];

        for path in paths.into_iter().flatten() {
            if let Err(err) = tokio::fs::remove_file(path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(target: "reel_core::trash", scene = %scene.id, path = %path, error = %err, "failed to delete artifact file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::MockDlqStore;
    use crate::ids::SceneId;
    use crate::job::history::MockJobHistoryStore;
    use crate::search::MockSearchIndexer;
    use crate::scene::MockSceneRepository;
    use tempfile::NamedTempFile;
    use uuid::Uuid;

    fn scene_with_stored_path(path: String) -> Scene {
        Scene {
            id: SceneId(1),
            uuid: Uuid::now_v7(),
            original_filename: "f.mp4".into(),
            stored_path: path,
            size_bytes: 1,
            trashed_at: Some(chrono::Utc::now()),
            duration_seconds: Some(10.0),
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

    #[tokio::test]
    async fn hard_delete_removes_row_artifacts_dlq_and_jobs_then_emits_event() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();
        let scene = scene_with_stored_path(path.clone());

        let mut scenes = MockSceneRepository::new();
        scenes
            .expect_get_expired_trash()
            .returning(move |_| Ok(vec![scene.clone()]));
        scenes.expect_hard_delete().returning(|_| Ok(()));

        let mut history = MockJobHistoryStore::new();
        history.expect_cancel_all_for_scene().returning(|_| Ok(0));

        let mut dlq = MockDlqStore::new();
        dlq.expect_delete_by_scene().returning(|_| Ok(0));

        let mut search = MockSearchIndexer::new();
        search.expect_delete_scene_index().returning(|_| Ok(()));

        let events = EventBus::new(8);
        let mut sub = events.subscribe().await;

        let worker = TrashCleanupWorker::new(
            Arc::new(scenes),
            Arc::new(history),
            Arc::new(dlq),
            Arc::new(search),
            events,
            Arc::new(PipelineConfig::default()),
        );
        worker.sweep_once().await;

        assert!(!std::path::Path::new(&path).exists());
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.event_type, "scene:deleted");
    }

    #[tokio::test]
    async fn missing_artifact_file_is_not_an_error() {
        let scene = scene_with_stored_path("/nonexistent/path/f.mp4".to_string());

        let mut scenes = MockSceneRepository::new();
        scenes
            .expect_get_expired_trash()
            .returning(move |_| Ok(vec![scene.clone()]));
        scenes.expect_hard_delete().returning(|_| Ok(()));

        let mut history = MockJobHistoryStore::new();
        history.expect_cancel_all_for_scene().returning(|_| Ok(0));
        let mut dlq = MockDlqStore::new();
        dlq.expect_delete_by_scene().returning(|_| Ok(0));
        let mut search = MockSearchIndexer::new();
        search.expect_delete_scene_index().returning(|_| Ok(()));

        let worker = TrashCleanupWorker::new(
            Arc::new(scenes),
            Arc::new(history),
            Arc::new(dlq),
            Arc::new(search),
            EventBus::new(8),
            Arc::new(PipelineConfig::default()),
        );
        worker.sweep_once().await;
    }
}
