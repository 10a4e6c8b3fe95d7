//! Owned background loops.
//!
//! Every periodic sweep in InferGrid (stale-waiter cleanup, cache expiry,
//! health checks, metrics snapshots, autoscale evaluation) runs as a
//! `PeriodicTask`: a spawned tokio task paired with a `watch` shutdown
//! channel. The handle is owned by whoever started the loop and the loop
//! ends when the handle is stopped or dropped.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a running background loop.
pub struct PeriodicTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PeriodicTask {
    /// Run `tick` every `interval` until stopped.
    ///
    /// The first tick fires one interval after spawning.
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        Self::spawn_with_shutdown(name, move |mut shutdown| async move {
            debug!(task = name, interval_ms = interval.as_millis() as u64, "periodic task started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => tick().await,
                    _ = shutdown.changed() => {
                        debug!(task = name, "periodic task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Spawn a loop that watches the shutdown receiver itself.
    ///
    /// Used for event-driven loops that need their own `select!`.
    pub fn spawn_with_shutdown<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(body(shutdown_rx));
        Self {
            name,
            handle: Some(handle),
            shutdown_tx,
        }
    }

    /// Task name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop has already exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(task = self.name, error = %e, "periodic task panicked");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.shutdown_tx.send(true);
            handle.abort();
        }
    }
}
