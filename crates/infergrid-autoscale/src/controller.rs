//! Autoscaling controller — runs scaling operations through their lifecycle.
//!
//! Decisions arrive from the metrics event stream, the periodic sweep, or
//! a manual `scale_model` call. Every path goes through the same overlap
//! guard: a model is reserved before the first suspension point and
//! released once its operation is terminal, or when the call is dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use infergrid_core::{ModelId, ModelMetrics, PeriodicTask};
use infergrid_metrics::MetricsEvent;

use crate::deployment::{Dashboard, DeploymentService};
use crate::error::{AutoscaleError, AutoscaleResult};
use crate::operation::{ScalingEvent, ScalingOperation};
use crate::policy::{ScalingAction, ScalingDecision, ScalingPolicy};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub enabled: bool,
    pub evaluation_interval: Duration,
    /// Operations retained per model.
    pub history_limit: usize,
    /// Metrics older than this are skipped by the periodic sweep.
    pub metrics_max_age: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval: Duration::from_secs(60),
            history_limit: 50,
            metrics_max_age: Duration::from_secs(300),
        }
    }
}

/// How the target replica count is derived from the current one.
enum Target {
    /// Add or remove this many replicas.
    Relative(ScalingAction, u32),
    /// Scale to exactly this many.
    Absolute(u32),
}

pub struct AutoscalingController {
    config: ControllerConfig,
    enabled: AtomicBool,
    deployments: Arc<dyn DeploymentService>,
    policy: Arc<dyn ScalingPolicy>,
    dashboard: Option<Arc<dyn Dashboard>>,
    /// Models with a non-terminal operation. Never held across an await.
    reserved: Mutex<HashSet<ModelId>>,
    active: Mutex<HashMap<ModelId, ScalingOperation>>,
    history: RwLock<HashMap<ModelId, VecDeque<ScalingOperation>>>,
    latest_metrics: RwLock<HashMap<ModelId, (ModelMetrics, Instant)>>,
    events: broadcast::Sender<ScalingEvent>,
}

impl AutoscalingController {
    pub fn new(
        config: ControllerConfig,
        deployments: Arc<dyn DeploymentService>,
        policy: Arc<dyn ScalingPolicy>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            deployments,
            policy,
            dashboard: None,
            reserved: Mutex::new(HashSet::new()),
            active: Mutex::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            latest_metrics: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Publish every settled operation to `dashboard`.
    pub fn with_dashboard(mut self, dashboard: Arc<dyn Dashboard>) -> Self {
        self.dashboard = Some(dashboard);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScalingEvent> {
        self.events.subscribe()
    }

    /// Toggle automatic scaling. Manual `scale_model` is unaffected.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "automatic scaling toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// The non-terminal operation for `model_id`, if any.
    pub async fn active_operation(&self, model_id: &str) -> Option<ScalingOperation> {
        self.active.lock().get(model_id).cloned()
    }

    /// Settled operations for `model_id`, oldest first.
    pub async fn operation_history(&self, model_id: &str) -> Vec<ScalingOperation> {
        self.history
            .read()
            .await
            .get(model_id)
            .map(|ops| ops.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// React to one metrics snapshot.
    ///
    /// Returns the operation run, or `None` when scaling is disabled, the
    /// model is busy, or the policy wants no action.
    pub async fn handle_metrics(&self, metrics: ModelMetrics) -> AutoscaleResult<Option<ScalingOperation>> {
        self.latest_metrics
            .write()
            .await
            .insert(metrics.model_id.clone(), (metrics.clone(), Instant::now()));
        self.evaluate_model(metrics).await
    }

    async fn evaluate_model(&self, metrics: ModelMetrics) -> AutoscaleResult<Option<ScalingOperation>> {
        let model_id = metrics.model_id.clone();
        if !self.is_enabled() {
            return Ok(None);
        }
        if self.reserved.lock().contains(&model_id) {
            debug!(%model_id, "scaling operation in progress, skipping evaluation");
            return Ok(None);
        }

        let decision = self
            .policy
            .evaluate_scaling_decision(&model_id, &metrics)
            .await
            .map_err(|e| AutoscaleError::Policy {
                model_id: model_id.clone(),
                message: format!("{e:#}"),
            })?;
        if decision.action == ScalingAction::NoAction {
            debug!(%model_id, reason = %decision.reason, "no scaling action");
            return Ok(None);
        }

        match self.execute_scaling_operation(decision, Some(metrics)).await {
            Ok(op) => Ok(Some(op)),
            // Lost the race with another path; that one owns the model now.
            Err(AutoscaleError::OperationInProgress(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Re-evaluate every model whose latest metrics are recent enough.
    pub async fn evaluate_all(&self) -> Vec<ScalingOperation> {
        let max_age = self.config.metrics_max_age;
        let mut recent: Vec<ModelMetrics> = self
            .latest_metrics
            .read()
            .await
            .values()
            .filter(|(_, seen)| seen.elapsed() <= max_age)
            .map(|(m, _)| m.clone())
            .collect();
        recent.sort_by(|a, b| a.model_id.cmp(&b.model_id));

        let mut operations = Vec::new();
        for metrics in recent {
            let model_id = metrics.model_id.clone();
            match self.evaluate_model(metrics).await {
                Ok(Some(op)) => operations.push(op),
                Ok(None) => {}
                Err(e) => warn!(%model_id, error = %e, "scaling evaluation failed"),
            }
        }
        operations
    }

    /// Run a policy decision through the operation lifecycle.
    pub async fn execute_scaling_operation(
        &self,
        decision: ScalingDecision,
        metrics: Option<ModelMetrics>,
    ) -> AutoscaleResult<ScalingOperation> {
        if decision.action == ScalingAction::NoAction {
            return Err(AutoscaleError::NoAction(decision.model_id));
        }
        let target = Target::Relative(decision.action, decision.replicas.unwrap_or(1));
        self.run_reserved(&decision.model_id, target, decision.reason, metrics)
            .await
    }

    /// Manually scale `model_id` to exactly `replicas` (floored at one).
    pub async fn scale_model(
        &self,
        model_id: &str,
        replicas: u32,
        reason: &str,
    ) -> AutoscaleResult<ScalingOperation> {
        self.run_reserved(model_id, Target::Absolute(replicas), reason.to_string(), None)
            .await
    }

    async fn run_reserved(
        &self,
        model_id: &str,
        target: Target,
        reason: String,
        metrics: Option<ModelMetrics>,
    ) -> AutoscaleResult<ScalingOperation> {
        let _reservation = self.reserve(model_id)?;
        self.run_operation(model_id, target, reason, metrics).await
    }

    fn reserve(&self, model_id: &str) -> AutoscaleResult<Reservation<'_>> {
        if !self.reserved.lock().insert(model_id.to_string()) {
            return Err(AutoscaleError::OperationInProgress(model_id.to_string()));
        }
        Ok(Reservation {
            controller: self,
            model_id: model_id.to_string(),
        })
    }

    async fn run_operation(
        &self,
        model_id: &str,
        target: Target,
        reason: String,
        metrics: Option<ModelMetrics>,
    ) -> AutoscaleResult<ScalingOperation> {
        let current = self.current_replicas(model_id).await?;
        let (action, target_replicas) = match target {
            Target::Relative(ScalingAction::ScaleDown, n) => {
                (ScalingAction::ScaleDown, current.saturating_sub(n).max(1))
            }
            Target::Relative(action, n) => (action, current.saturating_add(n).max(1)),
            Target::Absolute(n) => {
                let n = n.max(1);
                let action = if n < current {
                    ScalingAction::ScaleDown
                } else {
                    ScalingAction::ScaleUp
                };
                (action, n)
            }
        };

        if target_replicas == current {
            let mut op = ScalingOperation::new(
                model_id,
                action,
                current,
                target_replicas,
                format!("{reason} (no change: already at {current} replicas)"),
                metrics,
            );
            op.complete();
            debug!(%model_id, replicas = current, "scaling is a no-op");
            self.record_history(op.clone()).await;
            return Ok(op);
        }

        let mut op = ScalingOperation::new(model_id, action, current, target_replicas, reason, metrics);
        self.active.lock().insert(model_id.to_string(), op.clone());

        op.start();
        self.active.lock().insert(model_id.to_string(), op.clone());
        info!(
            %model_id,
            operation_id = %op.id,
            %action,
            from = current,
            to = target_replicas,
            reason = %op.reason,
            "scaling started"
        );
        let _ = self.events.send(ScalingEvent::Started(op.clone()));

        match self
            .deployments
            .scale_model_deployment(model_id, target_replicas)
            .await
        {
            Ok(()) => {
                op.complete();
                info!(%model_id, operation_id = %op.id, replicas = target_replicas, "scaling completed");
                let _ = self.events.send(ScalingEvent::Completed(op.clone()));
                self.settle(op.clone()).await;
                Ok(op)
            }
            Err(e) => {
                let message = format!("{e:#}");
                op.fail(message.clone());
                if let Ok(Some(deployment)) = self.deployments.get_model_deployment(model_id).await {
                    op.current_replicas = deployment.replicas;
                }
                error!(%model_id, operation_id = %op.id, error = %message, "scaling failed");
                let _ = self.events.send(ScalingEvent::Failed {
                    operation: op.clone(),
                    error: message.clone(),
                });
                let operation_id = op.id.clone();
                self.settle(op).await;
                Err(AutoscaleError::ScaleFailed {
                    model_id: model_id.to_string(),
                    operation_id,
                    message,
                })
            }
        }
    }

    async fn current_replicas(&self, model_id: &str) -> AutoscaleResult<u32> {
        match self.deployments.get_model_deployment(model_id).await {
            Ok(Some(deployment)) => Ok(deployment.replicas),
            Ok(None) => Err(AutoscaleError::DeploymentNotFound(model_id.to_string())),
            Err(e) => Err(AutoscaleError::Deployment {
                model_id: model_id.to_string(),
                message: format!("{e:#}"),
            }),
        }
    }

    async fn settle(&self, op: ScalingOperation) {
        if let Some(dashboard) = &self.dashboard {
            dashboard.publish_operation(&op).await;
        }
        self.record_history(op).await;
    }

    async fn record_history(&self, op: ScalingOperation) {
        let mut history = self.history.write().await;
        let ring = history.entry(op.model_id.clone()).or_default();
        ring.push_back(op);
        while ring.len() > self.config.history_limit {
            ring.pop_front();
        }
    }

    /// Start the event-driven loop plus the periodic sweep.
    ///
    /// Each metrics event is evaluated on its own task, so a slow scale
    /// call for one model does not hold up the others. In-flight
    /// evaluations are aborted on stop.
    pub fn spawn(self: &Arc<Self>, mut metrics_rx: broadcast::Receiver<MetricsEvent>) -> PeriodicTask {
        let controller = Arc::clone(self);
        let period = self.config.evaluation_interval.max(Duration::from_millis(1));

        PeriodicTask::spawn_with_shutdown("autoscaler", move |mut shutdown| async move {
            info!(interval_secs = period.as_secs(), "autoscaler started");
            let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
            let mut events_open = true;
            let mut inflight = JoinSet::new();

            loop {
                tokio::select! {
                    event = metrics_rx.recv(), if events_open => match event {
                        Ok(MetricsEvent::Collected(metrics)) => {
                            let controller = Arc::clone(&controller);
                            inflight.spawn(async move {
                                let model_id = metrics.model_id.clone();
                                if let Err(e) = controller.handle_metrics(metrics).await {
                                    warn!(%model_id, error = %e, "scaling on metrics failed");
                                }
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "autoscaler lagged behind metrics events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("metrics stream closed, periodic sweep only");
                            events_open = false;
                        }
                    },
                    _ = sweep.tick() => {
                        let controller = Arc::clone(&controller);
                        inflight.spawn(async move {
                            let ops = controller.evaluate_all().await;
                            debug!(operations = ops.len(), "autoscaler sweep finished");
                        });
                    }
                    Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                        if let Err(e) = joined
                            && e.is_panic()
                        {
                            error!(error = %e, "scaling evaluation panicked");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!(inflight = inflight.len(), "autoscaler shutting down");
                        break;
                    }
                }
            }
            inflight.shutdown().await;
        })
    }
}

/// Holds a model's overlap-guard slot; dropping it frees the model even
/// if the operation future was cancelled mid-flight.
struct Reservation<'a> {
    controller: &'a AutoscalingController,
    model_id: ModelId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.controller.active.lock().remove(&self.model_id);
        self.controller.reserved.lock().remove(&self.model_id);
    }
}
