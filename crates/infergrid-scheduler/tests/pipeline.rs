//! End-to-end: scheduler → rate limiter → balancer → cache → executor,
//! with metrics feeding the autoscaler.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use infergrid_autoscale::{
    AutoscalingController, ControllerConfig, InMemoryDeployments, OperationStatus, ScalingMetric,
    ThresholdConfig, ThresholdPolicy,
};
use infergrid_balancer::{BalancerConfig, LoadBalancer, StaticMetricsSource};
use infergrid_cache::{CacheConfig, TieredCache};
use infergrid_core::{ErrorKind, NodeMetrics, Priority};
use infergrid_metrics::MetricsCollector;
use infergrid_ratelimit::{ModelRateConfig, RateLimiter, RateLimiterConfig};
use infergrid_scheduler::{
    InferenceRequest, PriorityScheduler, RequestExecutor, SchedulerConfig,
};

#[derive(Default)]
struct EchoExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl RequestExecutor for EchoExecutor {
    async fn execute(
        &self,
        request: &InferenceRequest,
        node_id: Option<&str>,
    ) -> anyhow::Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "node": node_id, "prompt": request.payload["prompt"] }))
    }
}

fn node(cpu: f64, memory: f64) -> NodeMetrics {
    NodeMetrics {
        cpu,
        memory,
        ..Default::default()
    }
}

#[tokio::test]
async fn requests_flow_through_every_stage() {
    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
    limiter
        .configure_model(
            "m1",
            ModelRateConfig {
                requests_per_second: 50.0,
                burst_limit: 2,
                max_queue_size: 10,
                ..Default::default()
            },
        )
        .await;
    let pump = limiter.spawn_refill_pump();

    let source = Arc::new(StaticMetricsSource::with_nodes([
        ("a".to_string(), node(10.0, 10.0)),
        ("b".to_string(), node(95.0, 95.0)),
    ]));
    let balancer = Arc::new(
        LoadBalancer::new(BalancerConfig {
            seed: Some(3),
            ..Default::default()
        })
        .with_metrics_source(source),
    );
    balancer.register_node("a").await;
    balancer.register_node("b").await;
    balancer.check_health().await;

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(
        TieredCache::open(CacheConfig {
            disk_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap(),
    );
    let metrics = Arc::new(MetricsCollector::new(Duration::from_secs(60)));

    let executor = Arc::new(EchoExecutor::default());
    let scheduler = Arc::new(
        PriorityScheduler::new(
            SchedulerConfig {
                max_concurrent_requests: 4,
                request_timeout: Duration::from_secs(5),
            },
            executor.clone(),
        )
        .with_rate_limiter(limiter.clone())
        .with_load_balancer(balancer.clone())
        .with_cache(cache.clone())
        .with_metrics(metrics.clone()),
    );
    let dispatcher = scheduler.start();

    let mut tickets = Vec::new();
    for i in 0..6 {
        let request = InferenceRequest::new("m1", json!({ "prompt": format!("p{i}") }))
            .with_cache_key(format!("m1:p{i}"));
        tickets.push(scheduler.schedule_request(request, Priority::Normal).await.unwrap());
    }
    for ticket in tickets {
        let outcome = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.node_id.as_deref(), Some("a"));
        assert!(!outcome.cached);
    }

    // Same prompt again: served from cache, still routed and rate limited.
    let repeat = InferenceRequest::new("m1", json!({ "prompt": "p0" })).with_cache_key("m1:p0");
    let outcome = scheduler
        .schedule_request(repeat, Priority::High)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(outcome.cached);
    assert_eq!(outcome.output, json!({ "node": "a", "prompt": "p0" }));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 6);

    let stats = balancer.node_stats("a").await;
    assert_eq!(stats.distributed, 7);
    assert_eq!(stats.completed, 7);
    assert_eq!(stats.success_rate, Some(1.0));
    assert_eq!(balancer.node_stats("b").await.distributed, 0);
    assert_eq!(metrics.current_request_count("m1").await, 7);

    let status = limiter.get_rate_limit_status("m1").await.unwrap();
    assert!(status.tokens >= 0.0 && status.tokens <= 2.0);

    dispatcher.stop().await;
    pump.stop().await;
}

#[tokio::test]
async fn unrouteable_requests_fail_with_no_healthy_nodes() {
    let balancer = Arc::new(LoadBalancer::new(BalancerConfig::default()));
    let scheduler = Arc::new(
        PriorityScheduler::new(SchedulerConfig::default(), Arc::new(EchoExecutor::default()))
            .with_load_balancer(balancer),
    );
    let dispatcher = scheduler.start();

    let err = scheduler
        .schedule_request(InferenceRequest::new("m1", json!({})), Priority::Low)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoHealthyNodes);
    dispatcher.stop().await;
}

#[tokio::test]
async fn full_rate_limit_queue_rejects_with_capacity() {
    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
    limiter
        .configure_model(
            "m1",
            ModelRateConfig {
                requests_per_second: 0.5,
                burst_limit: 1,
                max_queue_size: 0,
                ..Default::default()
            },
        )
        .await;
    let scheduler = Arc::new(
        PriorityScheduler::new(SchedulerConfig::default(), Arc::new(EchoExecutor::default()))
            .with_rate_limiter(limiter),
    );
    let dispatcher = scheduler.start();

    let first = scheduler
        .schedule_request(InferenceRequest::new("m1", json!({})), Priority::Normal)
        .await
        .unwrap();
    first.wait().await.unwrap();

    let second = scheduler
        .schedule_request(InferenceRequest::new("m1", json!({})), Priority::Normal)
        .await
        .unwrap();
    let err = second.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);

    // Models without a rate limit configuration pass straight through.
    scheduler
        .schedule_request(InferenceRequest::new("other", json!({})), Priority::Normal)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    dispatcher.stop().await;
}

#[tokio::test]
async fn request_metrics_drive_autoscaling() {
    let deployments = Arc::new(InMemoryDeployments::with_models([("m1".to_string(), 1)]));
    let policy = Arc::new(ThresholdPolicy::new(
        ThresholdConfig {
            metric: ScalingMetric::Rps,
            target_value: 0.001,
            scale_up_window: Duration::ZERO,
            scale_down_window: Duration::ZERO,
            min_replicas: 1,
            max_replicas: 4,
        },
        deployments.clone(),
    ));
    let controller = Arc::new(AutoscalingController::new(
        ControllerConfig::default(),
        deployments.clone(),
        policy,
    ));
    let metrics = Arc::new(MetricsCollector::new(Duration::from_secs(60)));
    let autoscaler = controller.spawn(metrics.subscribe());
    let mut scaling_events = controller.subscribe();

    let scheduler = Arc::new(
        PriorityScheduler::new(SchedulerConfig::default(), Arc::new(EchoExecutor::default()))
            .with_metrics(metrics.clone()),
    );
    let dispatcher = scheduler.start();
    for _ in 0..3 {
        scheduler
            .schedule_request(InferenceRequest::new("m1", json!({})), Priority::Normal)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(5)).await;
    metrics.snapshot().await;

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = scaling_events.recv().await.unwrap();
            if event.operation().status == OperationStatus::Completed {
                return event.operation().clone();
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(completed.current_replicas, 1);
    assert_eq!(completed.target_replicas, 4);
    assert_eq!(deployments.replicas("m1").await, Some(4));

    dispatcher.stop().await;
    autoscaler.stop().await;
}
