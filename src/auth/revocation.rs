use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::lifecycle::Lifecycle;

/// Tracks tokens that must be rejected before their natural expiry (e.g. on
/// logout). Keyed by a ciphertext hash rather than the token itself so a
/// leaked revocation list reveals nothing usable. No reference Postgres
/// implementation ships here: this is an external collaborator the same way
/// `SceneRepository` and `SearchIndexer` are, owned by whatever the
/// surrounding application already uses for user accounts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn is_revoked(&self, ciphertext_hash: &str) -> Result<bool>;
    async fn create(&self, ciphertext_hash: &str, expires_at: DateTime<Utc>) -> Result<()>;
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Spawns the hourly sweep that drops revocation entries past their own
/// token's expiry, so the store doesn't grow unbounded (mirrors the DLQ
/// auto-abandon and trash cleanup sweeps).
pub fn spawn_cleanup(store: Arc<dyn RevocationStore>, lifecycle: &Lifecycle) {
    lifecycle.go("revocation-cleanup", move |done| async move {
        loop {
            match store.cleanup_expired(Utc::now()).await {
                Ok(count) if count > 0 => {
                    info!(target: "reel_core::auth", count, "cleaned up expired revocation entries")
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "reel_core::auth", error = %err, "revocation cleanup sweep failed")
                }
            }
            tokio::select! {
                _ = done.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
            }
        }
    });
}
