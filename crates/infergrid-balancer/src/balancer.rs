//! Weighted load balancer with a background health-check loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use infergrid_core::{ModelId, NodeId, NodeMetrics, NodeStatus, PeriodicTask, RequestId, epoch_millis};

use crate::error::{BalancerError, BalancerResult};
use crate::health::{NodeMetricsSource, node_weight};

#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// How often `spawn_health_checks` reclassifies every node.
    pub health_check_interval: Duration,
    /// Distribution records kept for per-node statistics.
    pub history_size: usize,
    /// Seed for the selection RNG. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            history_size: 1000,
            seed: None,
        }
    }
}

/// Health record for one registered node.
/// A registered node's last classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHealth {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub metrics: NodeMetrics,
    /// Epoch ms of the last classification.
    pub last_check: u64,
    /// Requests distributed to this node and not yet completed.
    pub in_flight: u64,
}

impl NodeHealth {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeStatus::Healthy,
            metrics: NodeMetrics::default(),
            last_check: epoch_millis(),
            in_flight: 0,
        }
    }
}

/// One routing decision and, once reported, its outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionRecord {
    pub request_id: RequestId,
    pub model_id: ModelId,
    pub node_id: NodeId,
    pub distributed_at: u64,
    pub success: Option<bool>,
    pub latency_ms: Option<f64>,
}

/// Per-node figures derived from the distribution history.
/// Outcome statistics for one node over the retained history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub distributed: usize,
    pub completed: usize,
    /// `None` until at least one request has completed.
    pub success_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BalancerEvent {
    NodeRegistered {
        node_id: NodeId,
    },
    NodeUnregistered {
        node_id: NodeId,
    },
    HealthUpdate {
        node_id: NodeId,
        status: NodeStatus,
        metrics: NodeMetrics,
    },
    RequestDistributed {
        request_id: RequestId,
        node_id: NodeId,
    },
}

/// Distributes requests across healthy nodes by weighted random draw.
pub struct LoadBalancer {
    config: BalancerConfig,
    nodes: RwLock<HashMap<NodeId, NodeHealth>>,
    history: Mutex<VecDeque<DistributionRecord>>,
    rng: Mutex<StdRng>,
    source: Option<Arc<dyn NodeMetricsSource>>,
    events: broadcast::Sender<BalancerEvent>,
}

impl LoadBalancer {
    /// A balancer with no nodes. The RNG is seeded here.
    pub fn new(config: BalancerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            rng: Mutex::new(rng),
            source: None,
            events,
        }
    }

    /// Poll node metrics from `source` on every health check.
    pub fn with_metrics_source(mut self, source: Arc<dyn NodeMetricsSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Settings the balancer was built with.
    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Receive `BalancerEvent`s published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BalancerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BalancerEvent) {
        let _ = self.events.send(event);
    }

    /// Add a node as healthy with zeroed metrics. Re-registering resets it.
    pub async fn register_node(&self, node_id: &str) {
        self.nodes
            .write()
            .await
            .insert(node_id.to_string(), NodeHealth::new(node_id));
        info!(%node_id, "node registered");
        self.emit(BalancerEvent::NodeRegistered {
            node_id: node_id.to_string(),
        });
    }

    /// Forget a node. Returns whether it was registered.
    pub async fn unregister_node(&self, node_id: &str) -> bool {
        let removed = self.nodes.write().await.remove(node_id).is_some();
        if removed {
            info!(%node_id, "node unregistered");
            self.emit(BalancerEvent::NodeUnregistered {
                node_id: node_id.to_string(),
            });
        }
        removed
    }

    /// Snapshot of all registered nodes, ordered by id.
    pub async fn nodes(&self) -> Vec<NodeHealth> {
        let mut nodes: Vec<NodeHealth> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// The node's current health record, if registered.
    pub async fn node(&self, node_id: &str) -> Option<NodeHealth> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Record pushed metrics for a node and reclassify it.
    pub async fn update_node_metrics(
        &self,
        node_id: &str,
        metrics: NodeMetrics,
    ) -> BalancerResult<NodeStatus> {
        let status = NodeStatus::classify(&metrics);
        self.apply_health(node_id, status, metrics).await?;
        Ok(status)
    }

    async fn apply_health(
        &self,
        node_id: &str,
        status: NodeStatus,
        metrics: NodeMetrics,
    ) -> BalancerResult<()> {
        let previous = {
            let mut nodes = self.nodes.write().await;
            let node = nodes
                .get_mut(node_id)
                .ok_or_else(|| BalancerError::NodeNotFound(node_id.to_string()))?;
            let previous = node.status;
            node.status = status;
            node.metrics = metrics;
            node.last_check = epoch_millis();
            previous
        };

        if previous != status {
            info!(%node_id, from = %previous, to = %status, "node health changed");
        }
        self.emit(BalancerEvent::HealthUpdate {
            node_id: node_id.to_string(),
            status,
            metrics,
        });
        Ok(())
    }

    /// Poll every registered node once and reclassify it.
    ///
    /// Without a metrics source the last known metrics are reclassified.
    pub async fn check_health(&self) {
        let snapshot: Vec<(NodeId, NodeMetrics)> = self
            .nodes
            .read()
            .await
            .values()
            .map(|n| (n.node_id.clone(), n.metrics))
            .collect();

        for (node_id, last_metrics) in snapshot {
            let (status, metrics) = match &self.source {
                Some(source) => match source.node_metrics(&node_id).await {
                    Ok(metrics) => (NodeStatus::classify(&metrics), metrics),
                    Err(e) => {
                        warn!(%node_id, error = %e, "health poll failed, marking node unhealthy");
                        (NodeStatus::Unhealthy, last_metrics)
                    }
                },
                None => (NodeStatus::classify(&last_metrics), last_metrics),
            };

            // The node may have been unregistered while we were polling.
            if let Err(e) = self.apply_health(&node_id, status, metrics).await {
                debug!(%node_id, error = %e, "skipping health update");
            }
        }
    }

    /// Start the periodic health-check loop.
    pub fn spawn_health_checks(self: &Arc<Self>) -> PeriodicTask {
        let balancer = Arc::clone(self);
        PeriodicTask::spawn("health-checks", self.config.health_check_interval, move || {
            let balancer = balancer.clone();
            async move {
                balancer.check_health().await;
            }
        })
    }

    /// Pick a healthy node for `request_id` by weighted random draw.
    pub async fn distribute_request(
        &self,
        request_id: &str,
        model_id: &str,
    ) -> BalancerResult<NodeId> {
        let node_id = {
            let mut nodes = self.nodes.write().await;
            let mut candidates: Vec<(&NodeId, f64)> = nodes
                .values()
                .filter(|n| n.status == NodeStatus::Healthy)
                .map(|n| (&n.node_id, node_weight(&n.metrics)))
                .collect();
            if candidates.is_empty() {
                warn!(%request_id, %model_id, "no healthy nodes");
                return Err(BalancerError::NoHealthyNodes {
                    request_id: request_id.to_string(),
                    model_id: model_id.to_string(),
                });
            }
            // Stable order so a seeded RNG reproduces the same picks.
            candidates.sort_by(|a, b| a.0.cmp(b.0));

            let chosen = {
                let mut rng = self.rng.lock().await;
                weighted_pick(&candidates, &mut *rng).clone()
            };
            if let Some(node) = nodes.get_mut(&chosen) {
                node.in_flight += 1;
            }
            chosen
        };

        {
            let mut history = self.history.lock().await;
            history.push_back(DistributionRecord {
                request_id: request_id.to_string(),
                model_id: model_id.to_string(),
                node_id: node_id.clone(),
                distributed_at: epoch_millis(),
                success: None,
                latency_ms: None,
            });
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        debug!(%request_id, %model_id, %node_id, "request distributed");
        self.emit(BalancerEvent::RequestDistributed {
            request_id: request_id.to_string(),
            node_id: node_id.clone(),
        });
        Ok(node_id)
    }

    /// Report the outcome of a distributed request.
    pub async fn complete_request(
        &self,
        request_id: &str,
        success: bool,
        latency: Duration,
    ) -> BalancerResult<()> {
        let node_id = {
            let mut history = self.history.lock().await;
            let record = history
                .iter_mut()
                .rev()
                .find(|r| r.request_id == request_id && r.success.is_none())
                .ok_or_else(|| BalancerError::RequestNotFound(request_id.to_string()))?;
            record.success = Some(success);
            record.latency_ms = Some(latency.as_secs_f64() * 1000.0);
            record.node_id.clone()
        };

        if let Some(node) = self.nodes.write().await.get_mut(&node_id) {
            node.in_flight = node.in_flight.saturating_sub(1);
        }
        Ok(())
    }

    /// Success rate and mean latency for `node_id` over the retained history.
    pub async fn node_stats(&self, node_id: &str) -> NodeStats {
        let history = self.history.lock().await;
        let mut distributed = 0;
        let mut completed = 0;
        let mut succeeded = 0;
        let mut latency_total = 0.0;

        for record in history.iter().filter(|r| r.node_id == node_id) {
            distributed += 1;
            if let Some(success) = record.success {
                completed += 1;
                if success {
                    succeeded += 1;
                }
                latency_total += record.latency_ms.unwrap_or(0.0);
            }
        }

        let (success_rate, avg_latency_ms) = if completed == 0 {
            (None, None)
        } else {
            (
                Some(succeeded as f64 / completed as f64),
                Some(latency_total / completed as f64),
            )
        };
        NodeStats {
            node_id: node_id.to_string(),
            distributed,
            completed,
            success_rate,
            avg_latency_ms,
        }
    }

    /// Distribution records currently retained.
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }
}

/// Cumulative-weight draw: sum the weights, draw in `[0, total)`, then walk
/// the list subtracting weights until the remainder is `<= 0`.
///
/// All-zero weights fall back to a uniform pick.
fn weighted_pick<'a, R: Rng + ?Sized>(candidates: &[(&'a NodeId, f64)], rng: &mut R) -> &'a NodeId {
    let total: f64 = candidates.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return candidates[rng.gen_range(0..candidates.len())].0;
    }

    let mut remaining = rng.gen_range(0.0..total);
    for &(node_id, weight) in candidates {
        remaining -= weight;
        if remaining <= 0.0 {
            return node_id;
        }
    }
    candidates[candidates.len() - 1].0
}
