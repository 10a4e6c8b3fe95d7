//! Node metric polling and scoring.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::RwLock;

use infergrid_core::{NodeId, NodeMetrics};

/// Where the health loop gets a node's current load figures.
#[async_trait]
pub trait NodeMetricsSource: Send + Sync {
    /// Current metrics for `node_id`. An error marks the node unhealthy
    /// until the next successful poll.
    async fn node_metrics(&self, node_id: &str) -> anyhow::Result<NodeMetrics>;
}

/// A metrics source backed by a map, for fixed topologies and tests.
#[derive(Default)]
pub struct StaticMetricsSource {
    metrics: RwLock<HashMap<NodeId, NodeMetrics>>,
}

impl StaticMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = (NodeId, NodeMetrics)>) -> Self {
        Self {
            metrics: RwLock::new(nodes.into_iter().collect()),
        }
    }

    pub async fn set(&self, node_id: &str, metrics: NodeMetrics) {
        self.metrics.write().await.insert(node_id.to_string(), metrics);
    }

    /// Forget a node so that polling it fails.
    pub async fn remove(&self, node_id: &str) {
        self.metrics.write().await.remove(node_id);
    }
}

#[async_trait]
impl NodeMetricsSource for StaticMetricsSource {
    async fn node_metrics(&self, node_id: &str) -> anyhow::Result<NodeMetrics> {
        self.metrics
            .read()
            .await
            .get(node_id)
            .copied()
            .ok_or_else(|| anyhow!("no metrics reported for node {node_id}"))
    }
}

/// Selection weight of a node, in `[0, 1]`.
///
/// Missing latency counts as zero.
pub fn node_weight(metrics: &NodeMetrics) -> f64 {
    let latency = metrics.latency_ms.unwrap_or(0.0);
    let weight = 0.3 * (1.0 - metrics.cpu / 100.0)
        + 0.3 * (1.0 - metrics.memory / 100.0)
        + 0.2 * (1.0 - metrics.request_load / 100.0)
        + 0.2 * (1.0 - (latency / 1000.0).min(1.0));
    if weight.is_nan() {
        return 0.0;
    }
    weight.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(cpu: f64, memory: f64, request_load: f64, latency_ms: Option<f64>) -> NodeMetrics {
        NodeMetrics {
            cpu,
            memory,
            request_load,
            latency_ms,
        }
    }

    #[test]
    fn idle_node_weighs_one() {
        assert_eq!(node_weight(&metrics(0.0, 0.0, 0.0, None)), 1.0);
    }

    #[test]
    fn weight_combines_all_terms() {
        let w = node_weight(&metrics(50.0, 50.0, 50.0, Some(500.0)));
        assert!((w - 0.5).abs() < 1e-9);
    }

    #[test]
    fn latency_term_saturates() {
        let slow = node_weight(&metrics(0.0, 0.0, 0.0, Some(5_000.0)));
        assert!((slow - 0.8).abs() < 1e-9);
    }

    #[test]
    fn weight_is_clamped() {
        assert_eq!(node_weight(&metrics(0.0, 0.0, 900.0, None)), 0.0);
        assert_eq!(node_weight(&metrics(-50.0, -50.0, 0.0, None)), 1.0);
        assert_eq!(node_weight(&metrics(f64::NAN, 0.0, 0.0, None)), 0.0);
    }

    #[tokio::test]
    async fn static_source_reports_and_forgets() {
        let source = StaticMetricsSource::with_nodes([("a".to_string(), metrics(1.0, 2.0, 0.0, None))]);
        assert_eq!(source.node_metrics("a").await.unwrap().memory, 2.0);
        assert!(source.node_metrics("b").await.is_err());

        source.remove("a").await;
        assert!(source.node_metrics("a").await.is_err());
    }
}
