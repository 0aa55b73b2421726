use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Row;

use crate::error::Result;
use crate::job::model::phases;

/// The narrow surface the core consumes from wherever trigger rules are
/// configured (§6). `get_all()` returns the full map; the tracker is the
/// only thing that calls it, on `refresh()`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TriggerConfigStore: Send + Sync {
    async fn get_all(&self) -> Result<HashMap<String, Vec<String>>>;
}

/// Reference Postgres-backed trigger-config store, reading a
/// `trigger_rules(completed_phase text, next_phase text)` table. Not part of
/// the two stores the core owns a schema for (§3.1); a deployment may back
/// this trait with a flat config file just as well.
pub struct PostgresTriggerConfigStore {
    pool: PgPool,
}

impl PostgresTriggerConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerConfigStore for PostgresTriggerConfigStore {
    async fn get_all(&self) -> Result<HashMap<String, Vec<String>>> {
        let rows = sqlx::query("SELECT completed_phase, next_phase FROM trigger_rules")
            .fetch_all(&self.pool)
            .await?;

        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let completed: String = row.try_get("completed_phase")?;
            let next: String = row.try_get("next_phase")?;
            map.entry(completed).or_default().push(next);
        }
        Ok(map)
    }
}

fn default_trigger_map() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(
        phases::METADATA.to_string(),
        vec![
            phases::THUMBNAIL.to_string(),
            phases::SPRITES.to_string(),
            phases::FINGERPRINT.to_string(),
            phases::ANIMATED_THUMBNAILS.to_string(),
        ],
    );
    map
}

/// Read-mostly cache from "just-completed phase" to "phases to auto-submit
/// next" (§4.4). The map is an immutable snapshot behind a read-write lock;
/// `refresh()` builds a new map and swaps the whole `Arc` so readers never
/// observe a partially-updated map and never block a writer for long (§5).
pub struct PhaseTracker {
    store: Arc<dyn TriggerConfigStore>,
    snapshot: RwLock<Arc<HashMap<String, Vec<String>>>>,
}

impl PhaseTracker {
    pub fn new(store: Arc<dyn TriggerConfigStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(default_trigger_map())),
        }
    }

    /// Reloads the map from the store and atomically replaces the snapshot.
    /// Leaves the previous snapshot in place on error so a transient store
    /// failure doesn't blank out trigger rules mid-sweep.
    pub async fn refresh(&self) -> Result<()> {
        let fresh = self.store.get_all().await?;
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(fresh);
        Ok(())
    }

    /// Phases to auto-submit after `completed_phase` succeeds. Never fails;
    /// an unknown phase simply has no successors.
    pub fn next_phases(&self, completed_phase: &str) -> Vec<String> {
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        snapshot.get(completed_phase).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_chain_metadata_into_downstream_phases() {
        let mut mock = MockTriggerConfigStore::new();
        mock.expect_get_all().never();
        let tracker = PhaseTracker::new(Arc::new(mock));

        let next = tracker.next_phases(phases::METADATA);
        assert!(next.contains(&phases::THUMBNAIL.to_string()));
        assert!(next.contains(&phases::SPRITES.to_string()));
        assert!(tracker.next_phases(phases::THUMBNAIL).is_empty());
    }

    #[tokio::test]
    async fn refresh_replaces_the_snapshot() {
        let mut mock = MockTriggerConfigStore::new();
        mock.expect_get_all().returning(|| {
            let mut map = HashMap::new();
            map.insert(phases::THUMBNAIL.to_string(), vec!["custom".to_string()]);
            Ok(map)
        });
        let tracker = PhaseTracker::new(Arc::new(mock));
        assert!(tracker.next_phases(phases::THUMBNAIL).is_empty());

        tracker.refresh().await.unwrap();
        assert_eq!(tracker.next_phases(phases::THUMBNAIL), vec!["custom"]);
        assert!(tracker.next_phases(phases::METADATA).is_empty());
    }
}
