//! Simulated backends for running the daemon without real inference nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use infergrid_autoscale::{Dashboard, ScalingOperation};
use infergrid_core::{ModelId, Priority};
use infergrid_scheduler::{InferenceRequest, PriorityScheduler, RequestExecutor};

/// Sleeps for a per-model latency and echoes the prompt back.
pub struct SimulatedExecutor {
    latencies: HashMap<ModelId, Duration>,
}

impl SimulatedExecutor {
    pub fn new(latencies: HashMap<ModelId, Duration>) -> Self {
        Self { latencies }
    }
}

#[async_trait]
impl RequestExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        request: &InferenceRequest,
        node_id: Option<&str>,
    ) -> anyhow::Result<serde_json::Value> {
        let latency = self
            .latencies
            .get(&request.model_id)
            .copied()
            .unwrap_or_default();
        tokio::time::sleep(latency).await;
        Ok(json!({
            "model": request.model_id,
            "node": node_id,
            "completion": format!("echo: {}", request.payload["prompt"]),
        }))
    }
}

/// Writes settled scaling operations to the log.
pub struct LogDashboard;

#[async_trait]
impl Dashboard for LogDashboard {
    async fn publish_operation(&self, operation: &ScalingOperation) {
        info!(
            operation_id = %operation.id,
            model_id = %operation.model_id,
            status = %operation.status,
            from = operation.current_replicas,
            to = operation.target_replicas,
            reason = %operation.reason,
            "scaling operation settled"
        );
    }
}

/// Totals from one synthetic load run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub completed: usize,
    pub cached: usize,
    pub failed: usize,
}

/// Submit `count` requests spread over `models`, cycling priorities.
///
/// Prompts repeat every `distinct_prompts` requests so later ones hit
/// the cache.
pub async fn generate_load(
    scheduler: &Arc<PriorityScheduler>,
    models: &[ModelId],
    count: usize,
    distinct_prompts: usize,
) -> LoadSummary {
    const PRIORITIES: [Priority; 3] = [Priority::Normal, Priority::High, Priority::Low];

    let mut summary = LoadSummary::default();
    if models.is_empty() || count == 0 {
        return summary;
    }
    let distinct = distinct_prompts.max(1);

    let mut tickets = Vec::with_capacity(count);
    for i in 0..count {
        let model = &models[i % models.len()];
        let prompt = format!("prompt-{}", i % distinct);
        let request = InferenceRequest::new(model.clone(), json!({ "prompt": prompt }))
            .with_cache_key(format!("{model}:{prompt}"));
        match scheduler
            .schedule_request(request, PRIORITIES[i % PRIORITIES.len()])
            .await
        {
            Ok(ticket) => tickets.push(ticket),
            Err(e) => {
                warn!(error = %e, "failed to submit synthetic request");
                summary.failed += 1;
            }
        }
    }

    for ticket in tickets {
        let id = ticket.id().to_string();
        match ticket.wait().await {
            Ok(outcome) => {
                summary.completed += 1;
                if outcome.cached {
                    summary.cached += 1;
                }
            }
            Err(e) => {
                debug!(request_id = %id, error = %e, "synthetic request failed");
                summary.failed += 1;
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergrid_scheduler::SchedulerConfig;

    #[tokio::test]
    async fn load_repeats_prompts_through_the_cache_key() {
        let scheduler = Arc::new(PriorityScheduler::new(
            SchedulerConfig::default(),
            Arc::new(SimulatedExecutor::new(HashMap::new())),
        ));
        let dispatcher = scheduler.start();

        let models = vec!["a".to_string(), "b".to_string()];
        let summary = generate_load(&scheduler, &models, 6, 2).await;
        // No cache attached, so nothing is served from it.
        assert_eq!(
            summary,
            LoadSummary {
                completed: 6,
                cached: 0,
                failed: 0
            }
        );
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn empty_model_list_submits_nothing() {
        let scheduler = Arc::new(PriorityScheduler::new(
            SchedulerConfig::default(),
            Arc::new(SimulatedExecutor::new(HashMap::new())),
        ));
        assert_eq!(generate_load(&scheduler, &[], 10, 3).await, LoadSummary::default());
    }

    #[tokio::test]
    async fn executor_echoes_prompt_and_node() {
        let executor = SimulatedExecutor::new(HashMap::from([(
            "m".to_string(),
            Duration::from_millis(1),
        )]));
        let request = InferenceRequest::new("m", json!({ "prompt": "hi" }));
        let output = executor.execute(&request, Some("n1")).await.unwrap();
        assert_eq!(output["node"], "n1");
        assert_eq!(output["completion"], "echo: \"hi\"");
    }
}
