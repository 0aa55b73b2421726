use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::Row;

use crate::error::{CoreError, Result};
use crate::ids::{DlqId, JobId, SceneId};

/// Status of a dead-letter entry, tracked independently of the job's own
/// terminal state since an operator can mark one resolved without touching
/// the job history row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    PendingReview,
    Resolved,
    Abandoned,
}

impl DlqStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqStatus::PendingReview => "pending_review",
            DlqStatus::Resolved => "resolved",
            DlqStatus::Abandoned => "abandoned",
        }
    }

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending_review" => Ok(DlqStatus::PendingReview),
            "resolved" => Ok(DlqStatus::Resolved),
            "abandoned" => Ok(DlqStatus::Abandoned),
            other => Err(CoreError::Internal(format!("unknown dlq status {other}"))),
        }
    }
}

/// A job that exhausted its retry budget (§4.9). Append-only: rows are
/// never deleted except as a side effect of the scene itself being
/// hard-deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: DlqId,
    pub job_id: JobId,
    pub scene_id: SceneId,
    pub phase: String,
    pub original_error: String,
    pub failure_count: i32,
    pub last_error: String,
    pub status: DlqStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn new(
        job_id: JobId,
        scene_id: SceneId,
        phase: impl Into<String>,
        original_error: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let error = original_error.into();
        Self {
            id: DlqId::new(),
            job_id,
            scene_id,
            phase: phase.into(),
            original_error: error.clone(),
            failure_count: 1,
            last_error: error,
            status: DlqStatus::PendingReview,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single page of DLQ entries, filtered by `status` if given.
pub struct DlqPage {
    pub entries: Vec<DlqEntry>,
    pub page: u32,
}

/// Durable record of terminally-failed jobs (§4.9).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn create(&self, entry: DlqEntry) -> Result<DlqEntry>;
    async fn list(&self, status: Option<DlqStatus>, page: u32, page_size: u32)
        -> Result<DlqPage>;
    async fn update_status(&self, id: DlqId, status: DlqStatus) -> Result<()>;
    async fn delete_by_scene(&self, scene_id: SceneId) -> Result<u64>;

    /// Marks every `pending_review` entry older than `older_than` as
    /// `abandoned`, returning the count touched. Called hourly by the retry
    /// scheduler.
    async fn auto_abandon(&self, older_than: chrono::Duration) -> Result<u64>;
}

pub struct PostgresDlqStore {
    pool: PgPool,
}

impl PostgresDlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DlqEntry> {
        Ok(DlqEntry {
            id: DlqId(row.try_get("id")?),
            job_id: JobId(row.try_get("job_id")?),
            scene_id: SceneId(row.try_get("scene_id")?),
            phase: row.try_get("phase")?,
            original_error: row.try_get("original_error")?,
            failure_count: row.try_get("failure_count")?,
            last_error: row.try_get("last_error")?,
            status: DlqStatus::from_str(&row.try_get::<String, _>("status")?)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl DlqStore for PostgresDlqStore {
    async fn create(&self, entry: DlqEntry) -> Result<DlqEntry> {
        sqlx::query(
            "INSERT INTO dlq_entries \
             (id, job_id, scene_id, phase, original_error, failure_count, last_error, status, \
              created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(entry.id.0)
        .bind(entry.job_id.0)
        .bind(entry.scene_id.0)
        .bind(&entry.phase)
        .bind(&entry.original_error)
        .bind(entry.failure_count)
        .bind(&entry.last_error)
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn list(
        &self,
        status: Option<DlqStatus>,
        page: u32,
        page_size: u32,
    ) -> Result<DlqPage> {
        let offset = (page as i64) * (page_size as i64);
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM dlq_entries WHERE status = $1 \
                     ORDER BY created_at DESC LIMIT $2 OFFSET $3",
                )
                .bind(status.as_str())
                .bind(page_size as i64)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM dlq_entries ORDER BY created_at DESC LIMIT $1 OFFSET $2")
                    .bind(page_size as i64)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let entries = rows.iter().map(Self::row_to_entry).collect::<Result<Vec<_>>>()?;
        Ok(DlqPage { entries, page })
    }

    async fn update_status(&self, id: DlqId, status: DlqStatus) -> Result<()> {
        sqlx::query("UPDATE dlq_entries SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id.0)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_by_scene(&self, scene_id: SceneId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dlq_entries WHERE scene_id = $1")
            .bind(scene_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn auto_abandon(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let result = sqlx::query(
            "UPDATE dlq_entries SET status = 'abandoned', updated_at = now() \
             WHERE status = 'pending_review' AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn create_and_list_round_trip(pool: PgPool) {
        let store = PostgresDlqStore::new(pool);
        let entry = DlqEntry::new(JobId::new(), SceneId(1), "thumbnail", "boom");
        store.create(entry.clone()).await.unwrap();

        let page = store
            .list(Some(DlqStatus::PendingReview), 0, 10)
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].scene_id, SceneId(1));
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn update_status_changes_filtered_listing(pool: PgPool) {
        let store = PostgresDlqStore::new(pool);
        let entry = DlqEntry::new(JobId::new(), SceneId(1), "thumbnail", "boom");
        let id = entry.id;
        store.create(entry).await.unwrap();
        store.update_status(id, DlqStatus::Resolved).await.unwrap();

        let pending = store
            .list(Some(DlqStatus::PendingReview), 0, 10)
            .await
            .unwrap();
        assert!(pending.entries.is_empty());
        let resolved = store.list(Some(DlqStatus::Resolved), 0, 10).await.unwrap();
        assert_eq!(resolved.entries.len(), 1);
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn auto_abandon_only_touches_old_pending_entries(pool: PgPool) {
        let store = PostgresDlqStore::new(pool);
        let mut old = DlqEntry::new(JobId::new(), SceneId(1), "thumbnail", "boom");
        old.created_at = Utc::now() - chrono::Duration::days(10);
        store.create(old).await.unwrap();
        store
            .create(DlqEntry::new(JobId::new(), SceneId(2), "thumbnail", "boom"))
            .await
            .unwrap();

        let abandoned = store.auto_abandon(chrono::Duration::days(7)).await.unwrap();
        assert_eq!(abandoned, 1);
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn delete_by_scene_removes_all_its_entries(pool: PgPool) {
        let store = PostgresDlqStore::new(pool);
        store
            .create(DlqEntry::new(JobId::new(), SceneId(1), "thumbnail", "boom"))
            .await
            .unwrap();
        store
            .create(DlqEntry::new(JobId::new(), SceneId(1), "sprites", "boom"))
            .await
            .unwrap();

        let deleted = store.delete_by_scene(SceneId(1)).await.unwrap();
        assert_eq!(deleted, 2);
    }
}
