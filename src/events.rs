use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::ids::SceneId;
use crate::ids::SubscriberId;

/// A single broadcast-worthy fact about a scene, as streamed to UI clients.
/// Field names are part of the wire contract in §6 of the spec and must not
/// be renamed casually.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub scene_id: i64,
    pub data: HashMap<String, Value>,
}

impl SceneEvent {
    pub fn new(event_type: impl Into<String>, scene_id: SceneId) -> Self {
        Self {
            event_type: event_type.into(),
            scene_id: scene_id.0,
            data: HashMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.into(), v);
        }
        self
    }

    pub fn processing_started(scene_id: SceneId, phase: &str) -> Self {
        Self::new("scene:processing_started", scene_id).with("phase", phase)
    }

    pub fn phase_complete(scene_id: SceneId, phase: &str) -> Self {
        Self::new(format!("scene:{phase}_complete"), scene_id)
    }

    pub fn phase_failed(scene_id: SceneId, phase: &str, error: &str) -> Self {
        Self::new(format!("scene:{phase}_failed"), scene_id).with("error", error)
    }

    pub fn phase_cancelled(scene_id: SceneId, phase: &str) -> Self {
        Self::new(format!("scene:{phase}_cancelled"), scene_id)
    }

    pub fn retry_scheduled(
        scene_id: SceneId,
        job_id: impl Serialize,
        phase: &str,
        retry_count: u16,
        max_retries: u16,
        next_retry_at: DateTime<Utc>,
    ) -> Self {
        Self::new("scene:retry_scheduled", scene_id)
            .with("job_id", job_id)
            .with("phase", phase)
            .with("retry_count", retry_count)
            .with("max_retries", max_retries)
            .with("next_retry_at", next_retry_at.to_rfc3339())
    }

    pub fn dlq_added(scene_id: SceneId, phase: &str) -> Self {
        Self::new("scene:dlq_added", scene_id).with("phase", phase)
    }

    pub fn trashed(scene_id: SceneId, title: &str, trashed_at: DateTime<Utc>) -> Self {
        Self::new("scene:trashed", scene_id)
            .with("title", title)
            .with("trashed_at", trashed_at.to_rfc3339())
    }

    pub fn restored(scene_id: SceneId) -> Self {
        Self::new("scene:restored", scene_id)
    }

    pub fn deleted(scene_id: SceneId) -> Self {
        Self::new("scene:deleted", scene_id)
    }

    pub fn bulk_updated() -> Self {
        Self::new("scenes_bulk_updated", SceneId(0))
    }
}

/// A live subscription. Dropping it does not unsubscribe; callers should
/// call [`EventBus::unsubscribe`] explicitly so the bus can reclaim the slot
/// immediately rather than waiting for a publish to notice a closed channel.
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<SceneEvent>,
}

/// In-process pub-sub for [`SceneEvent`]. Each subscriber gets its own
/// bounded mpsc buffer; a slow subscriber only ever loses events destined for
/// itself, never blocks the publisher or its peers (§4.2, §9).
pub struct EventBus {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<SceneEvent>>>,
    buffer_capacity: usize,
    shut_down: std::sync::atomic::AtomicBool,
}

impl EventBus {
    pub fn new(buffer_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            buffer_capacity,
            shut_down: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer_capacity.max(1));
        let id = SubscriberId::new();
        self.subscribers.lock().await.insert(id, tx);
        Subscription { id, receiver: rx }
    }

    /// Idempotent: unsubscribing twice, or an id that was never registered,
    /// is a no-op.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.lock().await.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .try_lock()
            .map(|g| g.len())
            .unwrap_or_default()
    }

    /// Copies the subscriber list under the lock, then sends outside it so a
    /// stalled subscriber's I/O never holds up the others (§5 shared mutable
    /// state note). After shutdown this is a no-op.
    pub async fn publish(&self, event: SceneEvent) {
        if self.shut_down.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let senders: Vec<(SubscriberId, mpsc::Sender<SceneEvent>)> = {
            let guard = self.subscribers.lock().await;
            guard.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        for (id, tx) in senders {
            if let Err(err) = tx.try_send(event.clone()) {
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(
                            target: "reel_core::events",
                            subscriber = %id,
                            event = %event.event_type,
                            "subscriber buffer full, dropping event"
                        );
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        // Subscriber dropped its receiver without
                        // unsubscribing; it'll be pruned on the next publish.
                    }
                }
            }
        }
    }

    /// Closes every subscriber channel and makes future publishes a no-op.
    pub async fn shutdown(&self) {
        self.shut_down
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.subscribers.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe().await;
        let mut b = bus.subscribe().await;

        bus.publish(SceneEvent::new("scene:metadata_complete", SceneId(1)))
            .await;

        assert_eq!(a.receiver.recv().await.unwrap().scene_id, 1);
        assert_eq!(b.receiver.recv().await.unwrap().scene_id, 1);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_without_blocking_others() {
        let bus = EventBus::new(1);
        let slow = bus.subscribe().await;
        let mut fast = bus.subscribe().await;

        // Fill the slow subscriber's buffer, then keep publishing: the slow
        // one should just drop extra events, the fast one must still see all
        // of them.
        for i in 0..5 {
            bus.publish(SceneEvent::new("scene:thumbnail_complete", SceneId(i)))
                .await;
        }

        for i in 0..5 {
            assert_eq!(fast.receiver.recv().await.unwrap().scene_id, i);
        }
        drop(slow);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe().await;
        bus.unsubscribe(sub.id).await;
        bus.unsubscribe(sub.id).await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_publication() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe().await;
        bus.shutdown().await;
        bus.publish(SceneEvent::new("scene:trashed", SceneId(1)))
            .await;
        assert!(sub.receiver.recv().await.is_none());
    }
}
