use async_trait::async_trait;

use crate::error::Result;
use crate::ids::SceneId;
use crate::scene::Scene;

/// The narrow surface the core consumes from the external full-text search
/// engine (§6). Its wire format is explicitly out of scope; the core only
/// needs these four operations, invoked best-effort from the Result Handler
/// and Trash Cleanup Worker (§4.7, §4.10, §7).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    async fn index_scene(&self, scene: &Scene) -> Result<()>;
    async fn update_scene_index(&self, scene: &Scene) -> Result<()>;
    async fn bulk_update_scene_index(&self, scenes: &[Scene]) -> Result<()>;
    async fn delete_scene_index(&self, scene_id: SceneId) -> Result<()>;
}

/// Invoked by the Result Handler when a marker-bearing phase (currently
/// `marker_thumbnails`) completes, to regenerate thumbnails for user-placed
/// markers on the scene's timeline. Out of scope as an independent design;
/// the core only needs to know it can ask for one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarkerThumbnailGenerator: Send + Sync {
    async fn generate_for_scene(&self, scene_id: SceneId) -> Result<()>;
}
