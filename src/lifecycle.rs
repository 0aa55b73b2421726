use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use std::panic::AssertUnwindSafe;

use futures::future::FutureExt as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{CoreError, Result};

/// Owns every background task the process spawns, so shutdown is
/// deterministic: one `shutdown(timeout)` call stops intake and waits for
/// every supervised task to exit (or reports which ones didn't).
#[derive(Clone)]
pub struct Lifecycle {
    shutdown_token: CancellationToken,
    shutting_down: Arc<AtomicBool>,
    handles: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The signal supervised loops should `select!` against.
    pub fn done(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Starts a supervised task. `fut` receives its own clone of the done
    /// signal. Panics inside `fut` are caught and logged rather than
    /// taking the process down, matching the "panic isolation" guarantee.
    /// Once shutdown has started, this is a no-op and returns immediately.
    pub fn go<F, Fut>(&self, name: impl Into<String>, fut: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            return;
        }
        let name = name.into();
        let token = self.shutdown_token.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            info!(target: "reel_core::lifecycle", task = %task_name, "task starting");
            let result = AssertUnwindSafe(fut(token)).catch_unwind().await;
            match result {
                Ok(()) => info!(target: "reel_core::lifecycle", task = %task_name, "task exited"),
                Err(_) => error!(target: "reel_core::lifecycle", task = %task_name, "task panicked"),
            }
        });

        self.handles.lock().unwrap().push((name, handle));
    }

    /// Closes the done signal and waits for every supervised task to exit,
    /// up to `timeout`. A second call is a no-op and returns immediately.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown_token.cancel();

        let mut handles = self.handles.lock().unwrap();
        let drained: Vec<(String, JoinHandle<()>)> = handles.drain(..).collect();
        drop(handles);

        let deadline = tokio::time::Instant::now() + timeout;
        let mut still_running = Vec::new();
        for (name, handle) in drained {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!(target: "reel_core::lifecycle", task = %name, error = %join_err, "task join error during shutdown");
                }
                Err(_) => still_running.push(name),
            }
        }

        if still_running.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Transient(format!(
                "shutdown timed out waiting for: {}",
                still_running.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn shutdown_waits_for_tasks_and_is_idempotent() {
        let lifecycle = Lifecycle::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        lifecycle.go("worker", move |done| async move {
            done.cancelled().await;
            ran_clone.store(true, Ordering::SeqCst);
        });

        // go() registers the handle synchronously, so shutdown() immediately
        // after is guaranteed to see and wait for it.
        lifecycle.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(lifecycle.is_shutting_down());

        // Second shutdown is a no-op, not an error.
        lifecycle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn go_after_shutdown_is_noop() {
        let lifecycle = Lifecycle::new();
        lifecycle.shutdown(Duration::from_secs(1)).await.unwrap();

        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        lifecycle.go("late", move |_done| async move {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panics_are_isolated() {
        let lifecycle = Lifecycle::new();
        let notify = Arc::new(Notify::new());
        let notify_clone = notify.clone();
        lifecycle.go("panicker", move |_done| async move {
            notify_clone.notify_one();
            panic!("boom");
        });
        notify.notified().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Shutdown still completes even though a supervised task panicked.
        lifecycle.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
