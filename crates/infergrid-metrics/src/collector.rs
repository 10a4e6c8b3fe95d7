//! Metrics collector — tracks per-model request metrics.
//!
//! Counters are atomics; latency samples sit behind a mutex until the
//! next snapshot drains them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::time::Instant;
use tracing::debug;

use infergrid_core::{ModelId, ModelMetrics, PeriodicTask, epoch_millis};

/// Published once per model on every snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsEvent {
    Collected(ModelMetrics),
}

/// Per-model metrics window.
struct ModelWindow {
    request_count: AtomicU64,
    error_count: AtomicU64,
    /// Latency samples in microseconds.
    latencies: Mutex<Vec<u64>>,
    started: Mutex<Instant>,
}

impl ModelWindow {
    fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            latencies: Mutex::new(Vec::new()),
            started: Mutex::new(Instant::now()),
        }
    }
}

/// Collects request metrics across all models.
pub struct MetricsCollector {
    models: RwLock<HashMap<ModelId, Arc<ModelWindow>>>,
    interval: Duration,
    events: broadcast::Sender<MetricsEvent>,
}

impl MetricsCollector {
    pub fn new(interval: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            models: RwLock::new(HashMap::new()),
            interval,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsEvent> {
        self.events.subscribe()
    }

    /// Start tracking a model even before its first request.
    pub async fn register(&self, model_id: &str) {
        self.models
            .write()
            .await
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(ModelWindow::new()));
        debug!(%model_id, "registered for metrics collection");
    }

    pub async fn unregister(&self, model_id: &str) {
        self.models.write().await.remove(model_id);
        debug!(%model_id, "unregistered from metrics collection");
    }

    async fn window(&self, model_id: &str) -> Arc<ModelWindow> {
        if let Some(window) = self.models.read().await.get(model_id) {
            return window.clone();
        }
        self.models
            .write()
            .await
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(ModelWindow::new()))
            .clone()
    }

    /// Record one settled request. Unknown models are registered on the fly.
    pub async fn record_request(&self, model_id: &str, latency: Duration, success: bool) {
        let window = self.window(model_id).await;
        window.request_count.fetch_add(1, Ordering::Relaxed);
        if !success {
            window.error_count.fetch_add(1, Ordering::Relaxed);
        }
        window.latencies.lock().await.push(latency.as_micros() as u64);
    }

    /// Requests recorded for `model_id` in the current window.
    pub async fn current_request_count(&self, model_id: &str) -> u64 {
        self.models
            .read()
            .await
            .get(model_id)
            .map(|m| m.request_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Registered model ids, sorted.
    pub async fn registered_models(&self) -> Vec<ModelId> {
        let mut ids: Vec<ModelId> = self.models.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close the current window for every model and publish the results.
    pub async fn snapshot(&self) -> Vec<ModelMetrics> {
        let windows: Vec<(ModelId, Arc<ModelWindow>)> = self
            .models
            .read()
            .await
            .iter()
            .map(|(id, w)| (id.clone(), w.clone()))
            .collect();

        let collected_at = epoch_millis();
        let mut snapshots = Vec::with_capacity(windows.len());

        for (model_id, window) in windows {
            let latencies = std::mem::take(&mut *window.latencies.lock().await);
            let elapsed = {
                let mut started = window.started.lock().await;
                let elapsed = started.elapsed();
                *started = Instant::now();
                elapsed
            };
            let request_count = window.request_count.swap(0, Ordering::Relaxed);
            let error_count = window.error_count.swap(0, Ordering::Relaxed);

            let seconds = if elapsed.is_zero() {
                self.interval.as_secs_f64()
            } else {
                elapsed.as_secs_f64()
            };
            let rps = if seconds > 0.0 {
                request_count as f64 / seconds
            } else {
                0.0
            };
            let error_rate = if request_count > 0 {
                error_count as f64 / request_count as f64
            } else {
                0.0
            };
            let (p50, p99) = compute_percentiles(&latencies);

            snapshots.push(ModelMetrics {
                model_id,
                collected_at,
                request_count,
                error_count,
                rps,
                error_rate,
                latency_p50_ms: p50,
                latency_p99_ms: p99,
            });
        }

        snapshots.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        for metrics in &snapshots {
            let _ = self.events.send(MetricsEvent::Collected(metrics.clone()));
        }
        debug!(models = snapshots.len(), "metrics snapshot collected");
        snapshots
    }

    /// Start the periodic snapshot loop.
    pub fn spawn_snapshots(self: &Arc<Self>) -> PeriodicTask {
        let collector = Arc::clone(self);
        PeriodicTask::spawn("metrics-snapshots", self.interval, move || {
            let collector = collector.clone();
            async move {
                collector.snapshot().await;
            }
        })
    }
}

/// Compute P50 and P99 latency from unsorted microsecond samples.
///
/// Returns (p50_ms, p99_ms). If empty, returns (0.0, 0.0).
fn compute_percentiles(latencies: &[u64]) -> (f64, f64) {
    if latencies.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    let p50 = sorted[p50_idx.min(sorted.len() - 1)] as f64 / 1000.0;
    let p99 = sorted[p99_idx.min(sorted.len() - 1)] as f64 / 1000.0;

    (p50, p99)
}
