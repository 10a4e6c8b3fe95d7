//! Scaling policies — turn model metrics into scaling decisions.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use infergrid_core::{ModelId, ModelMetrics};

use crate::deployment::DeploymentService;
use crate::error::AutoscaleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
            ScalingAction::NoAction => "no_action",
        })
    }
}

/// What a policy wants done to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub model_id: ModelId,
    pub action: ScalingAction,
    pub reason: String,
    /// Replicas to add or remove. Defaults to one.
    pub replicas: Option<u32>,
}

impl ScalingDecision {
    pub fn no_action(model_id: &str, reason: impl Into<String>) -> Self {
        Self {
            model_id: model_id.to_string(),
            action: ScalingAction::NoAction,
            reason: reason.into(),
            replicas: None,
        }
    }

    pub fn scale_up(model_id: &str, replicas: u32, reason: impl Into<String>) -> Self {
        Self {
            model_id: model_id.to_string(),
            action: ScalingAction::ScaleUp,
            reason: reason.into(),
            replicas: Some(replicas),
        }
    }

    pub fn scale_down(model_id: &str, replicas: u32, reason: impl Into<String>) -> Self {
        Self {
            model_id: model_id.to_string(),
            action: ScalingAction::ScaleDown,
            reason: reason.into(),
            replicas: Some(replicas),
        }
    }
}

#[async_trait]
pub trait ScalingPolicy: Send + Sync {
    async fn evaluate_scaling_decision(
        &self,
        model_id: &str,
        metrics: &ModelMetrics,
    ) -> anyhow::Result<ScalingDecision>;
}

/// Metric the threshold policy compares against its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMetric {
    Rps,
    LatencyP99,
    ErrorRate,
}

impl ScalingMetric {
    fn read(&self, metrics: &ModelMetrics) -> f64 {
        match self {
            ScalingMetric::Rps => metrics.rps,
            ScalingMetric::LatencyP99 => metrics.latency_p99_ms,
            ScalingMetric::ErrorRate => metrics.error_rate,
        }
    }
}

impl fmt::Display for ScalingMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScalingMetric::Rps => "rps",
            ScalingMetric::LatencyP99 => "latency_p99",
            ScalingMetric::ErrorRate => "error_rate",
        })
    }
}

impl FromStr for ScalingMetric {
    type Err = AutoscaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rps" => Ok(ScalingMetric::Rps),
            "latency_p99" => Ok(ScalingMetric::LatencyP99),
            "error_rate" => Ok(ScalingMetric::ErrorRate),
            other => Err(AutoscaleError::UnknownMetric(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdConfig {
    pub metric: ScalingMetric,
    pub target_value: f64,
    pub scale_up_window: Duration,
    pub scale_down_window: Duration,
    pub min_replicas: u32,
    pub max_replicas: u32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            metric: ScalingMetric::Rps,
            target_value: 100.0,
            scale_up_window: Duration::from_secs(30),
            scale_down_window: Duration::from_secs(300),
            min_replicas: 1,
            max_replicas: 10,
        }
    }
}

/// Per-model cooldown tracking.
#[derive(Default)]
struct Cooldown {
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

fn cooled(last: Option<Instant>, window: Duration, now: Instant) -> bool {
    last.is_none_or(|t| now.saturating_duration_since(t) >= window)
}

/// Target-tracking policy: scale proportionally when the metric leaves
/// the band `[0.5 * target, 1.1 * target]`.
pub struct ThresholdPolicy {
    config: ThresholdConfig,
    deployments: Arc<dyn DeploymentService>,
    cooldowns: Mutex<HashMap<ModelId, Cooldown>>,
}

impl ThresholdPolicy {
    pub fn new(config: ThresholdConfig, deployments: Arc<dyn DeploymentService>) -> Self {
        Self {
            config,
            deployments,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Decide for a model currently at `current` replicas.
    pub async fn evaluate_at(&self, model_id: &str, metrics: &ModelMetrics, current: u32) -> ScalingDecision {
        let cfg = &self.config;
        if cfg.target_value <= 0.0 {
            return ScalingDecision::no_action(model_id, "target value is not positive");
        }

        let value = cfg.metric.read(metrics);
        let target = cfg.target_value;
        let ratio = value / target;
        let now = Instant::now();

        let mut cooldowns = self.cooldowns.lock().await;
        let cooldown = cooldowns.entry(model_id.to_string()).or_default();

        // Scale up: value exceeds target (10% headroom).
        if value > target * 1.1 && cooled(cooldown.last_scale_up, cfg.scale_up_window, now) {
            let desired = ((current as f64) * ratio).ceil() as u32;
            let clamped = desired.min(cfg.max_replicas);
            if clamped > current {
                cooldown.last_scale_up = Some(now);
                debug!(%model_id, from = current, to = clamped, metric = %cfg.metric, value, target, "scaling up");
                return ScalingDecision::scale_up(
                    model_id,
                    clamped - current,
                    format!("{} {value:.2} above target {target:.2}", cfg.metric),
                );
            }
        }

        // Scale down: value is well below target.
        if value < target * 0.5
            && current > cfg.min_replicas
            && cooled(cooldown.last_scale_down, cfg.scale_down_window, now)
        {
            let desired = ((current as f64) * ratio).ceil().max(1.0) as u32;
            let clamped = desired.max(cfg.min_replicas);
            if clamped < current {
                cooldown.last_scale_down = Some(now);
                debug!(%model_id, from = current, to = clamped, metric = %cfg.metric, value, target, "scaling down");
                return ScalingDecision::scale_down(
                    model_id,
                    current - clamped,
                    format!("{} {value:.2} below half of target {target:.2}", cfg.metric),
                );
            }
        }

        ScalingDecision::no_action(model_id, format!("{} {value:.2} within target band", cfg.metric))
    }
}

#[async_trait]
impl ScalingPolicy for ThresholdPolicy {
    async fn evaluate_scaling_decision(
        &self,
        model_id: &str,
        metrics: &ModelMetrics,
    ) -> anyhow::Result<ScalingDecision> {
        let Some(deployment) = self.deployments.get_model_deployment(model_id).await? else {
            return Ok(ScalingDecision::no_action(model_id, "model is not deployed"));
        };
        Ok(self.evaluate_at(model_id, metrics, deployment.replicas).await)
    }
}
