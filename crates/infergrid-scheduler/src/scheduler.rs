//! Priority scheduler — three-lane admission with bounded concurrency.
//!
//! Lanes are served in strict order (high, then normal, then low) with no
//! aging, so sustained high-priority load can starve the low lane.
//! Concurrency is bounded by a semaphore: the dispatcher takes a permit
//! before popping a request, and the spawned request task holds it until
//! the request settles or is cancelled.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, broadcast, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use infergrid_balancer::LoadBalancer;
use infergrid_cache::TieredCache;
use infergrid_core::{ModelId, NodeId, PeriodicTask, Priority, RequestId};
use infergrid_metrics::MetricsCollector;
use infergrid_ratelimit::RateLimiter;

use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::{InferenceRequest, RequestExecutor};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_requests: usize,
    /// Upper bound on a single execution.
    pub request_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueLengths {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueLengths {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

/// How a request settled.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub request_id: RequestId,
    /// Node the request was routed to, when a balancer is attached.
    pub node_id: Option<NodeId>,
    pub output: serde_json::Value,
    /// Served from the cache without executing.
    pub cached: bool,
    /// Time from dequeue to settlement.
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    RequestQueued {
        request_id: RequestId,
        priority: Priority,
    },
    RequestStarted {
        request_id: RequestId,
    },
    RequestCompleted {
        request_id: RequestId,
        duration: Duration,
    },
    RequestFailed {
        request_id: RequestId,
        error: String,
    },
    RequestCancelled {
        request_id: RequestId,
    },
}

type Reply = oneshot::Sender<SchedulerResult<RequestOutcome>>;

/// Handle returned by `schedule_request`.
#[derive(Debug)]
pub struct RequestTicket {
    id: RequestId,
    rx: oneshot::Receiver<SchedulerResult<RequestOutcome>>,
}

impl RequestTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the request to settle.
    pub async fn wait(self) -> SchedulerResult<RequestOutcome> {
        match self.rx.await {
            Ok(result) => result,
            // Task aborted before replying.
            Err(_) => Err(SchedulerError::Cancelled(self.id)),
        }
    }
}

struct QueuedRequest {
    id: RequestId,
    request: InferenceRequest,
    enqueued_at: Instant,
    reply: Reply,
}

struct ActiveRequest {
    model_id: ModelId,
    started: Instant,
    abort: AbortHandle,
}

pub struct PriorityScheduler {
    config: SchedulerConfig,
    /// Indexed by `Priority::index()`.
    lanes: Mutex<[VecDeque<QueuedRequest>; 3]>,
    active: Mutex<HashMap<RequestId, ActiveRequest>>,
    permits: Arc<Semaphore>,
    wake: Notify,
    closed: AtomicBool,
    executor: Arc<dyn RequestExecutor>,
    rate_limiter: Option<Arc<RateLimiter>>,
    balancer: Option<Arc<LoadBalancer>>,
    cache: Option<Arc<TieredCache>>,
    metrics: Option<Arc<MetricsCollector>>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl PriorityScheduler {
    pub fn new(config: SchedulerConfig, executor: Arc<dyn RequestExecutor>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            lanes: Mutex::new(Default::default()),
            active: Mutex::new(HashMap::new()),
            permits,
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            executor,
            rate_limiter: None,
            balancer: None,
            cache: None,
            metrics: None,
            events,
        }
    }

    /// Throttle requests for models the limiter has been configured for.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_load_balancer(mut self, balancer: Arc<LoadBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn with_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    /// Queue a request in its priority lane.
    pub async fn schedule_request(
        &self,
        request: InferenceRequest,
        priority: Priority,
    ) -> SchedulerResult<RequestTicket> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (reply, rx) = oneshot::channel();
        debug!(request_id = %id, model_id = %request.model_id, %priority, "request queued");
        self.lanes.lock().await[priority.index()].push_back(QueuedRequest {
            id: id.clone(),
            request,
            enqueued_at: Instant::now(),
            reply,
        });

        self.emit(SchedulerEvent::RequestQueued {
            request_id: id.clone(),
            priority,
        });
        self.wake.notify_one();
        Ok(RequestTicket { id, rx })
    }

    /// Like `schedule_request`, with the priority given by name.
    pub async fn schedule_request_named(
        &self,
        request: InferenceRequest,
        priority: &str,
    ) -> SchedulerResult<RequestTicket> {
        let priority: Priority = priority.parse()?;
        self.schedule_request(request, priority).await
    }

    /// Withdraw a queued or running request. Returns whether it was found.
    pub async fn cancel_request(&self, request_id: &str) -> bool {
        let queued = {
            let mut lanes = self.lanes.lock().await;
            lanes.iter_mut().find_map(|lane| {
                let pos = lane.iter().position(|q| q.id == request_id)?;
                lane.remove(pos)
            })
        };
        if let Some(queued) = queued {
            let _ = queued
                .reply
                .send(Err(SchedulerError::Cancelled(request_id.to_string())));
            info!(%request_id, "queued request cancelled");
            self.emit(SchedulerEvent::RequestCancelled {
                request_id: request_id.to_string(),
            });
            return true;
        }

        let Some(active) = self.active.lock().await.remove(request_id) else {
            return false;
        };
        active.abort.abort();
        if let Some(balancer) = &self.balancer {
            // Not distributed yet is fine.
            let _ = balancer
                .complete_request(request_id, false, active.started.elapsed())
                .await;
        }
        info!(%request_id, model_id = %active.model_id, "running request cancelled");
        self.emit(SchedulerEvent::RequestCancelled {
            request_id: request_id.to_string(),
        });
        true
    }

    pub async fn queue_lengths(&self) -> QueueLengths {
        let lanes = self.lanes.lock().await;
        QueueLengths {
            high: lanes[Priority::High.index()].len(),
            normal: lanes[Priority::Normal.index()].len(),
            low: lanes[Priority::Low.index()].len(),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    async fn pop_next(&self) -> Option<QueuedRequest> {
        let mut lanes = self.lanes.lock().await;
        lanes.iter_mut().find_map(|lane| lane.pop_front())
    }

    /// Start the dispatcher loop.
    pub fn start(self: &Arc<Self>) -> PeriodicTask {
        let scheduler = Arc::clone(self);
        PeriodicTask::spawn_with_shutdown("scheduler-dispatch", move |mut shutdown| async move {
            info!(
                max_concurrent_requests = scheduler.config.max_concurrent_requests,
                timeout_ms = scheduler.config.request_timeout.as_millis() as u64,
                "scheduler dispatcher started"
            );

            loop {
                let permit = tokio::select! {
                    permit = scheduler.permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        // Semaphore closed by shutdown().
                        Err(_) => break,
                    },
                    _ = shutdown.changed() => break,
                };

                let next = loop {
                    if let Some(queued) = scheduler.pop_next().await {
                        break Some(queued);
                    }
                    tokio::select! {
                        _ = scheduler.wake.notified() => {}
                        _ = shutdown.changed() => break None,
                    }
                };
                let Some(queued) = next else {
                    break;
                };
                scheduler.dispatch(queued, permit).await;
            }
            debug!("scheduler dispatcher stopped");
        })
    }

    async fn dispatch(self: &Arc<Self>, queued: QueuedRequest, permit: OwnedSemaphorePermit) {
        let QueuedRequest {
            id,
            request,
            enqueued_at,
            reply,
        } = queued;
        debug!(
            request_id = %id,
            model_id = %request.model_id,
            waited_ms = enqueued_at.elapsed().as_millis() as u64,
            "request dequeued"
        );

        let model_id = request.model_id.clone();
        let mut active = self.active.lock().await;
        let scheduler = Arc::clone(self);
        let request_id = id.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            scheduler.process(request_id, request, reply).await;
        });
        active.insert(
            id,
            ActiveRequest {
                model_id,
                started: Instant::now(),
                abort: handle.abort_handle(),
            },
        );
    }

    async fn process(&self, request_id: RequestId, request: InferenceRequest, reply: Reply) {
        let started = Instant::now();
        self.emit(SchedulerEvent::RequestStarted {
            request_id: request_id.clone(),
        });

        let result = self.serve(&request_id, &request, started).await;
        let duration = started.elapsed();

        if let Some(metrics) = &self.metrics {
            metrics
                .record_request(&request.model_id, duration, result.is_ok())
                .await;
        }
        self.active.lock().await.remove(&request_id);

        match &result {
            Ok(outcome) => {
                debug!(
                    %request_id,
                    model_id = %request.model_id,
                    duration_ms = duration.as_millis() as u64,
                    cached = outcome.cached,
                    "request completed"
                );
                self.emit(SchedulerEvent::RequestCompleted {
                    request_id: request_id.clone(),
                    duration,
                });
            }
            Err(e) => {
                warn!(%request_id, model_id = %request.model_id, error = %e, "request failed");
                self.emit(SchedulerEvent::RequestFailed {
                    request_id: request_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        let _ = reply.send(result);
    }

    /// Rate limit, route, consult the cache, execute.
    async fn serve(
        &self,
        request_id: &str,
        request: &InferenceRequest,
        started: Instant,
    ) -> SchedulerResult<RequestOutcome> {
        let model_id = &request.model_id;

        if let Some(limiter) = &self.rate_limiter
            && limiter.is_configured(model_id).await
        {
            limiter.acquire_token(model_id).await?;
        }

        let node_id = match &self.balancer {
            Some(balancer) => Some(balancer.distribute_request(request_id, model_id).await?),
            None => None,
        };

        if let Some(cache) = &self.cache
            && let Some(key) = &request.cache_key
            && let Some(output) = cache.get_value(key).await
        {
            debug!(%request_id, %key, "served from cache");
            self.complete_on_node(request_id, node_id.as_deref(), true, started)
                .await;
            return Ok(RequestOutcome {
                request_id: request_id.to_string(),
                node_id,
                output,
                cached: true,
                duration: started.elapsed(),
            });
        }

        let timeout = self.config.request_timeout;
        let result = match tokio::time::timeout(
            timeout,
            self.executor.execute(request, node_id.as_deref()),
        )
        .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(SchedulerError::Execution {
                request_id: request_id.to_string(),
                message: format!("{e:#}"),
            }),
            Err(_) => Err(SchedulerError::Timeout {
                request_id: request_id.to_string(),
                timeout,
            }),
        };
        self.complete_on_node(request_id, node_id.as_deref(), result.is_ok(), started)
            .await;
        let output = result?;

        if let Some(cache) = &self.cache
            && let Some(key) = &request.cache_key
            && let Err(e) = cache.set(key, &output).await
        {
            warn!(%request_id, %key, error = %e, "failed to cache result");
        }

        Ok(RequestOutcome {
            request_id: request_id.to_string(),
            node_id,
            output,
            cached: false,
            duration: started.elapsed(),
        })
    }

    async fn complete_on_node(
        &self,
        request_id: &str,
        node_id: Option<&str>,
        success: bool,
        started: Instant,
    ) {
        if let Some(balancer) = &self.balancer
            && node_id.is_some()
            && let Err(e) = balancer
                .complete_request(request_id, success, started.elapsed())
                .await
        {
            debug!(%request_id, error = %e, "no distribution record to close");
        }
    }

    /// Stop admitting requests, cancel everything queued, abort everything
    /// running. The dispatcher loop exits on its own.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();

        let drained: Vec<QueuedRequest> = {
            let mut lanes = self.lanes.lock().await;
            lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
        };
        let queued = drained.len();
        for q in drained {
            let _ = q.reply.send(Err(SchedulerError::ShutDown));
        }

        let running: Vec<ActiveRequest> = self.active.lock().await.drain().map(|(_, a)| a).collect();
        let aborted = running.len();
        for a in running {
            a.abort.abort();
        }
        self.wake.notify_one();
        info!(queued, aborted, "scheduler shut down");
    }
}
