use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::ids::SceneId;

/// The unit of work the pipeline drives forward. Owned by the core's host
/// application; the core only ever reads it and writes the narrow set of
/// derived fields listed in §3/§4.7 through [`SceneRepository`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scene {
    pub id: SceneId,
    pub uuid: Uuid,
    pub original_filename: String,
    pub stored_path: String,
    pub size_bytes: i64,
    pub trashed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub codec: Option<String>,
    pub bit_rate: Option<i64>,
    pub thumbnail_small_path: Option<String>,
    pub thumbnail_large_path: Option<String>,
    pub sprite_sheet_path: Option<String>,
    pub vtt_path: Option<String>,
    pub animated_preview_path: Option<String>,
    pub fingerprint: Option<Vec<f32>>,
    pub actor_names: Vec<String>,
    pub tag_names: Vec<String>,
}

impl Scene {
    pub fn is_trashed(&self) -> bool {
        self.trashed_at.is_some()
    }

    pub fn has_duration(&self) -> bool {
        self.duration_seconds.is_some_and(|d| d > 0.0)
    }
}

/// Derived fields the Result Handler may persist after a successful phase.
/// Only the fields a given phase actually produces are `Some`; the
/// repository must leave the rest untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DerivedFields {
    pub duration_seconds: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub codec: Option<String>,
    pub bit_rate: Option<i64>,
    pub thumbnail_small_path: Option<String>,
    pub thumbnail_large_path: Option<String>,
    pub sprite_sheet_path: Option<String>,
    pub vtt_path: Option<String>,
    pub animated_preview_path: Option<String>,
    pub fingerprint: Option<Vec<f32>>,
}

/// The narrow surface the core consumes from the scene service (§6). A
/// real deployment backs this with its own CRUD-shaped scene repository;
/// the core is written against the trait so that service stays out of
/// scope.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SceneRepository: Send + Sync {
    async fn get_by_id(&self, id: SceneId) -> Result<Option<Scene>>;
    async fn get_by_ids(&self, ids: &[SceneId]) -> Result<Vec<Scene>>;
    async fn get_by_ids_including_trashed(&self, ids: &[SceneId]) -> Result<Vec<Scene>>;
    async fn all_scene_ids(&self) -> Result<Vec<SceneId>>;
    async fn update_thumbnail(
        &self,
        id: SceneId,
        small_path: &str,
        large_path: &str,
    ) -> Result<()>;
    async fn update_processing_status(&self, id: SceneId, phase: &str, failed: bool) -> Result<()>;
    async fn update_derived_fields(&self, id: SceneId, fields: DerivedFields) -> Result<()>;
    async fn move_to_trash(&self, id: SceneId) -> Result<()>;
    async fn restore_from_trash(&self, id: SceneId) -> Result<()>;
    async fn hard_delete(&self, id: SceneId) -> Result<()>;
    async fn get_expired_trash(&self, retention_days: u32) -> Result<Vec<Scene>>;
}
