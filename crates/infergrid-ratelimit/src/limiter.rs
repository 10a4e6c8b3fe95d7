//! Token-bucket rate limiter with FIFO wait queues.
//!
//! All per-model state lives behind one mutex that is never held across
//! an await, so every mutation sequence (refill, grant, enqueue, remove)
//! is atomic with respect to other callers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use infergrid_core::PeriodicTask;

use crate::error::{RateLimitError, RateLimitResult};

/// Token bucket and queue settings for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRateConfig {
    /// Sustained refill rate.
    pub requests_per_second: f64,
    /// Bucket capacity; also the size of an instantaneous burst.
    pub burst_limit: u32,
    /// Maximum number of callers waiting for a token.
    pub max_queue_size: usize,
    /// Length of the quota window.
    pub time_window: Duration,
    /// Requests allowed per quota window; unlimited when `None`.
    pub quota_limit: Option<u64>,
    /// How long `acquire_token` waits in the queue before giving up.
    pub acquire_timeout: Duration,
}

impl Default for ModelRateConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_limit: 20,
            max_queue_size: 100,
            time_window: Duration::from_secs(60),
            quota_limit: None,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Limiter-wide settings.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Wait entries older than this are rejected by the cleanup sweep.
    pub stale_after: Duration,
    /// Interval of the stale-entry sweep.
    pub cleanup_interval: Duration,
    /// Interval at which the refill pump re-runs `process_queue`.
    pub refill_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            refill_interval: Duration::from_millis(50),
        }
    }
}

/// Point-in-time view of a model's limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    pub model_id: String,
    /// Tokens in the bucket after refilling to now.
    pub tokens: f64,
    pub burst_limit: u32,
    /// Live callers waiting for a token.
    pub queue_length: usize,
    pub quota_remaining: Option<u64>,
    pub quota_resets_in: Option<Duration>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

struct QuotaWindow {
    remaining: u64,
    reset_at: Instant,
}

/// A caller parked until a token frees up.
struct WaitEntry {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<RateLimitResult<()>>,
}

struct ModelLimiter {
    model_id: String,
    config: ModelRateConfig,
    /// Created lazily on first use, full.
    bucket: Option<Bucket>,
    quota: Option<QuotaWindow>,
    queue: VecDeque<WaitEntry>,
}

impl ModelLimiter {
    fn new(model_id: &str, config: ModelRateConfig) -> Self {
        Self {
            model_id: model_id.to_string(),
            config,
            bucket: None,
            quota: None,
            queue: VecDeque::new(),
        }
    }

    fn burst(&self) -> f64 {
        self.config.burst_limit as f64
    }

    fn refill(&mut self, now: Instant) {
        let burst = self.burst();
        let rate = self.config.requests_per_second;
        let bucket = self.bucket.get_or_insert_with(|| Bucket {
            tokens: burst,
            last_refill: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
        bucket.last_refill = now;
    }

    fn tokens(&self) -> f64 {
        self.bucket.as_ref().map_or(self.burst(), |b| b.tokens)
    }

    /// Reset an expired quota window. Errors with the time left until the
    /// next reset when the window is exhausted.
    fn check_quota(&mut self, now: Instant) -> Result<(), Duration> {
        let Some(limit) = self.config.quota_limit else {
            return Ok(());
        };
        let window = self.config.time_window;
        let quota = self.quota.get_or_insert_with(|| QuotaWindow {
            remaining: limit,
            reset_at: now + window,
        });
        if now >= quota.reset_at {
            quota.remaining = limit;
            quota.reset_at = now + window;
        }
        if quota.remaining == 0 {
            Err(quota.reset_at.saturating_duration_since(now))
        } else {
            Ok(())
        }
    }

    fn quota_exceeded(&self, resets_in: Duration) -> RateLimitError {
        RateLimitError::QuotaExceeded {
            model_id: self.model_id.clone(),
            resets_in,
        }
    }

    fn take_token(&mut self) {
        if let Some(bucket) = &mut self.bucket {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
        }
        if let Some(quota) = &mut self.quota {
            quota.remaining = quota.remaining.saturating_sub(1);
        }
    }

    fn refund_token(&mut self) {
        let burst = self.burst();
        if let Some(bucket) = &mut self.bucket {
            bucket.tokens = (bucket.tokens + 1.0).min(burst);
        }
        if let (Some(quota), Some(limit)) = (&mut self.quota, self.config.quota_limit) {
            quota.remaining = (quota.remaining + 1).min(limit);
        }
    }

    /// Drop entries whose caller went away without leaving the queue,
    /// such as an aborted task.
    fn prune_abandoned(&mut self) -> usize {
        let before = self.queue.len();
        self.queue.retain(|e| !e.tx.is_closed());
        let pruned = before - self.queue.len();
        if pruned > 0 {
            debug!(model_id = %self.model_id, pruned, "dropped abandoned waiters");
        }
        pruned
    }

    /// Hand tokens to queued callers in FIFO order while they last.
    fn grant_waiters(&mut self, now: Instant) -> usize {
        self.prune_abandoned();
        let mut granted = 0;
        while self.tokens() >= 1.0 {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            if let Err(resets_in) = self.check_quota(now) {
                let _ = entry.tx.send(Err(self.quota_exceeded(resets_in)));
                continue;
            }
            self.take_token();
            if entry.tx.send(Ok(())).is_err() {
                // The waiting future was dropped; give the token back.
                self.refund_token();
                continue;
            }
            granted += 1;
        }
        granted
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|e| e.id == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Per-model token-bucket rate limiter.
pub struct RateLimiter {
    config: RateLimiterConfig,
    models: Mutex<HashMap<String, ModelLimiter>>,
    next_waiter_id: AtomicU64,
}

impl RateLimiter {
    /// An empty limiter; models are added with `configure_model`.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            models: Mutex::new(HashMap::new()),
            next_waiter_id: AtomicU64::new(1),
        }
    }

    /// Limiter-wide settings.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Configure (or reconfigure) a model.
    ///
    /// Reconfiguring keeps the bucket and queue but clamps the tokens to the
    /// new burst limit and restarts the quota window.
    pub async fn configure_model(&self, model_id: &str, config: ModelRateConfig) {
        info!(
            %model_id,
            requests_per_second = config.requests_per_second,
            burst_limit = config.burst_limit,
            max_queue_size = config.max_queue_size,
            quota_limit = ?config.quota_limit,
            "rate limit configured"
        );

        let mut models = self.models.lock().await;
        match models.get_mut(model_id) {
            Some(limiter) => {
                let burst = config.burst_limit as f64;
                if let Some(bucket) = &mut limiter.bucket {
                    bucket.tokens = bucket.tokens.min(burst);
                }
                limiter.quota = None;
                limiter.config = config;
            }
            None => {
                models.insert(model_id.to_string(), ModelLimiter::new(model_id, config));
            }
        }
    }

    /// Remove a model, cancelling everyone waiting on it.
    pub async fn remove_model(&self, model_id: &str) -> bool {
        let mut models = self.models.lock().await;
        let Some(limiter) = models.remove(model_id) else {
            return false;
        };
        for entry in limiter.queue {
            let _ = entry.tx.send(Err(RateLimitError::Cancelled {
                model_id: model_id.to_string(),
            }));
        }
        debug!(%model_id, "rate limit removed");
        true
    }

    /// Whether `model_id` has a rate limit.
    pub async fn is_configured(&self, model_id: &str) -> bool {
        self.models.lock().await.contains_key(model_id)
    }

    /// Configured model ids, sorted.
    pub async fn configured_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Acquire one token for `model_id`, waiting up to the model's
    /// configured `acquire_timeout`.
    pub async fn acquire_token(&self, model_id: &str) -> RateLimitResult<()> {
        let timeout = {
            let models = self.models.lock().await;
            models
                .get(model_id)
                .map(|l| l.config.acquire_timeout)
                .ok_or_else(|| RateLimitError::NotConfigured(model_id.to_string()))?
        };
        self.acquire_token_with_timeout(model_id, timeout).await
    }

    /// Acquire one token, waiting in the model's FIFO queue for at most
    /// `timeout` when the bucket is empty.
    pub async fn acquire_token_with_timeout(
        &self,
        model_id: &str,
        timeout: Duration,
    ) -> RateLimitResult<()> {
        let (waiter_id, mut rx) = {
            let mut models = self.models.lock().await;
            let limiter = models
                .get_mut(model_id)
                .ok_or_else(|| RateLimitError::NotConfigured(model_id.to_string()))?;

            let now = Instant::now();
            limiter.refill(now);
            // Earlier waiters go first, and may use up the quota. Abandoned
            // entries are pruned here too, so they never count against
            // `max_queue_size`.
            limiter.grant_waiters(now);
            if let Err(resets_in) = limiter.check_quota(now) {
                return Err(limiter.quota_exceeded(resets_in));
            }

            if limiter.queue.is_empty() && limiter.tokens() >= 1.0 {
                limiter.take_token();
                return Ok(());
            }

            if limiter.queue.len() >= limiter.config.max_queue_size {
                debug!(%model_id, queue_length = limiter.queue.len(), "rate limit queue full");
                return Err(RateLimitError::QueueFull {
                    model_id: model_id.to_string(),
                    max_queue_size: limiter.config.max_queue_size,
                });
            }

            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            limiter.queue.push_back(WaitEntry {
                id,
                enqueued_at: now,
                tx,
            });
            debug!(%model_id, waiter = id, queue_length = limiter.queue.len(), "waiting for token");
            (id, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RateLimitError::Cancelled {
                model_id: model_id.to_string(),
            }),
            Err(_) => {
                let removed = {
                    let mut models = self.models.lock().await;
                    models
                        .get_mut(model_id)
                        .is_some_and(|l| l.remove_waiter(waiter_id))
                };
                if !removed {
                    // Settled between the deadline and taking the lock.
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                warn!(%model_id, waited_ms = timeout.as_millis() as u64, "token acquisition timed out");
                Err(RateLimitError::Timeout {
                    model_id: model_id.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    /// Refill the bucket and grant as many queued waiters as tokens allow.
    ///
    /// Called by the refill pump; safe to call at any time.
    pub async fn process_queue(&self, model_id: &str) -> usize {
        let mut models = self.models.lock().await;
        let Some(limiter) = models.get_mut(model_id) else {
            return 0;
        };
        let now = Instant::now();
        limiter.refill(now);
        let granted = limiter.grant_waiters(now);
        if granted > 0 {
            debug!(%model_id, granted, remaining = limiter.queue.len(), "granted queued tokens");
        }
        granted
    }

    /// `process_queue` for every model that has waiters.
    pub async fn process_all_queues(&self) -> usize {
        let mut models = self.models.lock().await;
        let now = Instant::now();
        let mut granted = 0;
        for limiter in models.values_mut().filter(|l| !l.queue.is_empty()) {
            limiter.refill(now);
            granted += limiter.grant_waiters(now);
        }
        granted
    }

    /// Reject and drop wait entries older than `stale_after`.
    pub async fn cleanup_stale(&self) -> usize {
        let mut models = self.models.lock().await;
        let now = Instant::now();
        let stale_after = self.config.stale_after;
        let mut discarded = 0;

        for limiter in models.values_mut() {
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = limiter
                .queue
                .drain(..)
                .partition(|e| now.saturating_duration_since(e.enqueued_at) > stale_after);
            limiter.queue = fresh;

            for entry in stale {
                let _ = entry.tx.send(Err(RateLimitError::Stale {
                    model_id: limiter.model_id.clone(),
                    age: now.saturating_duration_since(entry.enqueued_at),
                }));
                discarded += 1;
            }
        }

        if discarded > 0 {
            warn!(discarded, "discarded stale rate limit waiters");
        }
        discarded
    }

    /// Current tokens, queue depth, and quota for a model.
    pub async fn get_rate_limit_status(&self, model_id: &str) -> Option<RateLimitStatus> {
        let mut models = self.models.lock().await;
        let limiter = models.get_mut(model_id)?;
        let now = Instant::now();
        limiter.refill(now);
        limiter.prune_abandoned();
        if limiter.config.quota_limit.is_some() {
            let _ = limiter.check_quota(now);
        }

        Some(RateLimitStatus {
            model_id: model_id.to_string(),
            tokens: limiter.tokens(),
            burst_limit: limiter.config.burst_limit,
            queue_length: limiter.queue.len(),
            quota_remaining: limiter.quota.as_ref().map(|q| q.remaining),
            quota_resets_in: limiter
                .quota
                .as_ref()
                .map(|q| q.reset_at.saturating_duration_since(now)),
        })
    }

    /// Start the loop that grants queued waiters as tokens refill.
    pub fn spawn_refill_pump(self: &Arc<Self>) -> PeriodicTask {
        let limiter = Arc::clone(self);
        PeriodicTask::spawn("ratelimit-refill", self.config.refill_interval, move || {
            let limiter = limiter.clone();
            async move {
                limiter.process_all_queues().await;
            }
        })
    }

    /// Start the stale-waiter sweep.
    pub fn spawn_cleanup(self: &Arc<Self>) -> PeriodicTask {
        let limiter = Arc::clone(self);
        PeriodicTask::spawn("ratelimit-cleanup", self.config.cleanup_interval, move || {
            let limiter = limiter.clone();
            async move {
                limiter.cleanup_stale().await;
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergrid_core::ErrorKind;

    fn m1_config() -> ModelRateConfig {
        ModelRateConfig {
            requests_per_second: 10.0,
            burst_limit: 20,
            max_queue_size: 5,
            ..Default::default()
        }
    }

    async fn wait_for_queue(limiter: &RateLimiter, model_id: &str, len: usize) {
        for _ in 0..100 {
            let status = limiter.get_rate_limit_status(model_id).await.unwrap();
            if status.queue_length == len {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reached {len}");
    }

    #[tokio::test]
    async fn unconfigured_model_is_a_configuration_error() {
        let limiter = RateLimiter::default();
        let err = limiter.acquire_token("ghost").await.unwrap_err();
        assert_eq!(err, RateLimitError::NotConfigured("ghost".to_string()));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(limiter.get_rate_limit_status("ghost").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_queue_then_queue_full() {
        let limiter = Arc::new(RateLimiter::default());
        limiter.configure_model("m1", m1_config()).await;
        let pump = limiter.spawn_refill_pump();

        for _ in 0..20 {
            limiter.acquire_token("m1").await.unwrap();
        }
        let status = limiter.get_rate_limit_status("m1").await.unwrap();
        assert!(status.tokens < 1.0);

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            waiters.push(tokio::spawn(async move { limiter.acquire_token("m1").await }));
        }
        wait_for_queue(&limiter, "m1", 5).await;

        let err = limiter.acquire_token("m1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::QueueFull { max_queue_size: 5, .. }));
        assert_eq!(err.kind(), ErrorKind::Capacity);

        let started = Instant::now();
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert!(started.elapsed() <= Duration::from_secs(1));

        let status = limiter.get_rate_limit_status("m1").await.unwrap();
        assert_eq!(status.queue_length, 0);
        assert!(status.tokens >= 0.0 && status.tokens <= 20.0);
        pump.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_granted_in_fifo_order() {
        let limiter = Arc::new(RateLimiter::default());
        limiter
            .configure_model(
                "m",
                ModelRateConfig {
                    requests_per_second: 2.0,
                    burst_limit: 1,
                    max_queue_size: 10,
                    ..Default::default()
                },
            )
            .await;
        limiter.acquire_token("m").await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let waiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                waiter.acquire_token("m").await.unwrap();
                order.lock().await.push(i);
            }));
            wait_for_queue(&limiter, "m", i + 1).await;
        }

        let pump = limiter.spawn_refill_pump();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
        pump.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_wait_times_out_and_leaves_the_queue() {
        let limiter = RateLimiter::default();
        limiter
            .configure_model(
                "slow",
                ModelRateConfig {
                    requests_per_second: 0.01,
                    burst_limit: 1,
                    max_queue_size: 2,
                    ..Default::default()
                },
            )
            .await;
        limiter.acquire_token("slow").await.unwrap();

        let err = limiter
            .acquire_token_with_timeout("slow", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let status = limiter.get_rate_limit_status("slow").await.unwrap();
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_waiters_are_rejected_by_cleanup() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            stale_after: Duration::from_secs(1),
            ..Default::default()
        }));
        limiter
            .configure_model(
                "m",
                ModelRateConfig {
                    requests_per_second: 0.001,
                    burst_limit: 1,
                    acquire_timeout: Duration::from_secs(30),
                    ..Default::default()
                },
            )
            .await;
        limiter.acquire_token("m").await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire_token("m").await })
        };
        wait_for_queue(&limiter, "m", 1).await;

        assert_eq!(limiter.cleanup_stale().await, 0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(limiter.cleanup_stale().await, 1);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RateLimitError::Stale { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_window_exhausts_and_resets() {
        let limiter = RateLimiter::default();
        limiter
            .configure_model(
                "q",
                ModelRateConfig {
                    quota_limit: Some(2),
                    time_window: Duration::from_secs(60),
                    ..Default::default()
                },
            )
            .await;

        limiter.acquire_token("q").await.unwrap();
        limiter.acquire_token("q").await.unwrap();
        let err = limiter.acquire_token("q").await.unwrap_err();
        assert!(matches!(err, RateLimitError::QuotaExceeded { .. }));
        assert_eq!(err.kind(), ErrorKind::Capacity);

        let status = limiter.get_rate_limit_status("q").await.unwrap();
        assert_eq!(status.quota_remaining, Some(0));

        tokio::time::sleep(Duration::from_secs(61)).await;
        limiter.acquire_token("q").await.unwrap();
        let status = limiter.get_rate_limit_status("q").await.unwrap();
        assert_eq!(status.quota_remaining, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_never_exceed_burst() {
        let limiter = RateLimiter::default();
        limiter.configure_model("m1", m1_config()).await;
        limiter.acquire_token("m1").await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        let status = limiter.get_rate_limit_status("m1").await.unwrap();
        assert_eq!(status.tokens, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_clamps_tokens() {
        let limiter = RateLimiter::default();
        limiter.configure_model("m1", m1_config()).await;
        limiter.acquire_token("m1").await.unwrap();

        limiter
            .configure_model(
                "m1",
                ModelRateConfig {
                    burst_limit: 3,
                    ..m1_config()
                },
            )
            .await;
        let status = limiter.get_rate_limit_status("m1").await.unwrap();
        assert_eq!(status.tokens, 3.0);
        assert_eq!(status.burst_limit, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_model_cancels_waiters() {
        let limiter = Arc::new(RateLimiter::default());
        limiter
            .configure_model(
                "m",
                ModelRateConfig {
                    requests_per_second: 0.001,
                    burst_limit: 1,
                    ..Default::default()
                },
            )
            .await;
        limiter.acquire_token("m").await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire_token("m").await })
        };
        wait_for_queue(&limiter, "m", 1).await;

        assert!(limiter.remove_model("m").await);
        assert!(!limiter.is_configured("m").await);
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_refunds_its_token() {
        let limiter = Arc::new(RateLimiter::default());
        limiter
            .configure_model(
                "m",
                ModelRateConfig {
                    requests_per_second: 1.0,
                    burst_limit: 1,
                    ..Default::default()
                },
            )
            .await;
        limiter.acquire_token("m").await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire_token("m").await })
        };
        wait_for_queue(&limiter, "m", 1).await;
        waiter.abort();
        let _ = waiter.await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(limiter.process_queue("m").await, 0);
        let status = limiter.get_rate_limit_status("m").await.unwrap();
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.tokens, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_waiter_does_not_hold_a_queue_slot() {
        let limiter = Arc::new(RateLimiter::default());
        limiter
            .configure_model(
                "m",
                ModelRateConfig {
                    requests_per_second: 0.001,
                    burst_limit: 1,
                    max_queue_size: 1,
                    acquire_timeout: Duration::from_millis(100),
                    ..Default::default()
                },
            )
            .await;
        limiter.acquire_token("m").await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire_token("m").await })
        };
        wait_for_queue(&limiter, "m", 1).await;
        waiter.abort();
        let _ = waiter.await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        // The slot is free again: this caller queues and times out rather
        // than being turned away as full.
        let err = limiter.acquire_token("m").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(limiter.get_rate_limit_status("m").await.unwrap().queue_length, 0);
    }

    #[tokio::test]
    async fn configured_models_are_sorted() {
        let limiter = RateLimiter::default();
        limiter.configure_model("b", ModelRateConfig::default()).await;
        limiter.configure_model("a", ModelRateConfig::default()).await;
        assert_eq!(limiter.configured_models().await, vec!["a", "b"]);
    }
}
