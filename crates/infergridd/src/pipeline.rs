//! Builds every component from an [`GridConfig`] and owns their
//! background loops.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use infergrid_autoscale::{
    AutoscalingController, ControllerConfig, InMemoryDeployments, ScalingMetric, ThresholdConfig,
    ThresholdPolicy,
};
use infergrid_balancer::{BalancerConfig, LoadBalancer, StaticMetricsSource};
use infergrid_cache::{CacheConfig, TieredCache};
use infergrid_core::{GridConfig, ModelId, PeriodicTask, parse_duration};
use infergrid_metrics::MetricsCollector;
use infergrid_ratelimit::{ModelRateConfig, RateLimiter, RateLimiterConfig};
use infergrid_scheduler::{PriorityScheduler, SchedulerConfig};

use crate::simulate::{LogDashboard, SimulatedExecutor};

pub struct Pipeline {
    pub scheduler: Arc<PriorityScheduler>,
    pub limiter: Arc<RateLimiter>,
    pub balancer: Arc<LoadBalancer>,
    pub cache: Arc<TieredCache>,
    pub metrics: Arc<MetricsCollector>,
    pub deployments: Arc<InMemoryDeployments>,
    pub autoscaler: Arc<AutoscalingController>,
    pub models: Vec<ModelId>,
}

impl Pipeline {
    pub async fn build(config: &GridConfig) -> anyhow::Result<Self> {
        // ── Rate limiter ───────────────────────────────────────────
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
        for (model_id, rl) in &config.rate_limits {
            limiter
                .configure_model(
                    model_id,
                    ModelRateConfig {
                        requests_per_second: rl.requests_per_second,
                        burst_limit: rl.burst_limit,
                        max_queue_size: rl.max_queue_size,
                        time_window: parse_duration(&rl.time_window)?,
                        quota_limit: rl.quota_limit,
                        acquire_timeout: parse_duration(&rl.acquire_timeout)?,
                    },
                )
                .await;
        }

        // ── Load balancer ──────────────────────────────────────────
        let source = Arc::new(StaticMetricsSource::with_nodes(
            config.nodes.iter().map(|n| (n.id.clone(), n.metrics)),
        ));
        let balancer = Arc::new(
            LoadBalancer::new(BalancerConfig {
                health_check_interval: parse_duration(&config.balancer.health_check_interval)?,
                history_size: config.balancer.history_size,
                seed: config.balancer.seed,
            })
            .with_metrics_source(source),
        );
        for node in &config.nodes {
            balancer.register_node(&node.id).await;
        }
        balancer.check_health().await;

        // ── Cache ──────────────────────────────────────────────────
        let cache = Arc::new(
            TieredCache::open(CacheConfig {
                max_memory_size: config.cache.max_memory_size,
                max_disk_size: config.cache.max_disk_size,
                ttl: parse_duration(&config.cache.ttl)?,
                cleanup_interval: parse_duration(&config.cache.cleanup_interval)?,
                disk_dir: config.cache.disk_dir.clone(),
            })
            .await
            .context("opening cache")?,
        );

        // ── Metrics ────────────────────────────────────────────────
        let metrics = Arc::new(MetricsCollector::new(parse_duration(
            &config.metrics.snapshot_interval,
        )?));
        for model in &config.models {
            metrics.register(&model.id).await;
        }

        // ── Autoscaler ─────────────────────────────────────────────
        let a = &config.autoscale;
        let deployments = Arc::new(InMemoryDeployments::with_models(
            config.models.iter().map(|m| (m.id.clone(), m.replicas)),
        ));
        let metric: ScalingMetric = a.metric.parse().context("autoscale.metric")?;
        let policy = Arc::new(ThresholdPolicy::new(
            ThresholdConfig {
                metric,
                target_value: a.target_value,
                scale_up_window: parse_duration(&a.scale_up_window)?,
                scale_down_window: parse_duration(&a.scale_down_window)?,
                min_replicas: a.min_replicas,
                max_replicas: a.max_replicas,
            },
            deployments.clone(),
        ));
        let autoscaler = Arc::new(
            AutoscalingController::new(
                ControllerConfig {
                    enabled: a.enabled,
                    evaluation_interval: parse_duration(&a.evaluation_interval)?,
                    history_limit: a.history_limit,
                    metrics_max_age: parse_duration(&a.metrics_max_age)?,
                },
                deployments.clone(),
                policy,
            )
            .with_dashboard(Arc::new(LogDashboard)),
        );

        // ── Scheduler ──────────────────────────────────────────────
        let mut latencies = HashMap::new();
        for model in &config.models {
            if let Some(latency) = &model.simulated_latency {
                latencies.insert(model.id.clone(), parse_duration(latency)?);
            }
        }
        let scheduler = Arc::new(
            PriorityScheduler::new(
                SchedulerConfig {
                    max_concurrent_requests: config.scheduler.max_concurrent_requests,
                    request_timeout: parse_duration(&config.scheduler.request_timeout)?,
                },
                Arc::new(SimulatedExecutor::new(latencies)),
            )
            .with_rate_limiter(limiter.clone())
            .with_load_balancer(balancer.clone())
            .with_cache(cache.clone())
            .with_metrics(metrics.clone()),
        );

        info!(
            nodes = config.nodes.len(),
            models = config.models.len(),
            rate_limited = config.rate_limits.len(),
            "pipeline assembled"
        );

        Ok(Self {
            scheduler,
            limiter,
            balancer,
            cache,
            metrics,
            deployments,
            autoscaler,
            models: config.models.iter().map(|m| m.id.clone()).collect(),
        })
    }

    /// Start every background loop. Stop them with [`Pipeline::shutdown`].
    pub fn start(&self) -> Vec<PeriodicTask> {
        vec![
            self.scheduler.start(),
            self.limiter.spawn_refill_pump(),
            self.limiter.spawn_cleanup(),
            self.balancer.spawn_health_checks(),
            self.cache.spawn_cleanup(),
            self.metrics.spawn_snapshots(),
            self.autoscaler.spawn(self.metrics.subscribe()),
        ]
    }

    /// Stop admitting requests, then stop the loops in reverse start order.
    pub async fn shutdown(&self, tasks: Vec<PeriodicTask>) {
        self.scheduler.shutdown().await;
        for task in tasks.into_iter().rev() {
            let name = task.name();
            task.stop().await;
            info!(task = name, "background task stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::generate_load;

    fn config(dir: &std::path::Path) -> GridConfig {
        let toml = format!(
            r#"
[scheduler]
max_concurrent_requests = 2
request_timeout = "5s"

[rate_limits.chat]
requests_per_second = 100.0
burst_limit = 10

[cache]
disk_dir = "{}"

[balancer]
seed = 11

[autoscale]
metric = "rps"
target_value = 1000.0

[[nodes]]
id = "gpu-1"
cpu = 20.0
memory = 30.0

[[nodes]]
id = "gpu-2"
cpu = 95.0
memory = 40.0

[[models]]
id = "chat"
replicas = 2
simulated_latency = "1ms"
"#,
            dir.display()
        );
        GridConfig::from_toml_str(&toml).unwrap()
    }

    #[tokio::test]
    async fn builds_and_serves_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::build(&config(dir.path())).await.unwrap();

        assert!(pipeline.limiter.is_configured("chat").await);
        assert_eq!(pipeline.deployments.replicas("chat").await, Some(2));
        assert_eq!(pipeline.metrics.registered_models().await, vec!["chat".to_string()]);
        let nodes = pipeline.balancer.nodes().await;
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].status, infergrid_core::NodeStatus::Unhealthy);

        let tasks = pipeline.start();
        let first = generate_load(&pipeline.scheduler, &pipeline.models, 4, 4).await;
        assert_eq!(first.completed, 4);
        assert_eq!(first.cached, 0);
        let second = generate_load(&pipeline.scheduler, &pipeline.models, 4, 4).await;
        assert_eq!(second.completed, 4);
        assert_eq!(second.failed, 0);
        assert_eq!(second.cached, 4);
        assert_eq!(pipeline.balancer.node_stats("gpu-1").await.distributed, 8);

        pipeline.shutdown(tasks).await;
        assert_eq!(pipeline.scheduler.active_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_scaling_metric_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.autoscale.metric = "gpu_temperature".to_string();
        let err = Pipeline::build(&cfg).await.err().unwrap();
        assert!(format!("{err:#}").contains("autoscale.metric"));
    }
}
