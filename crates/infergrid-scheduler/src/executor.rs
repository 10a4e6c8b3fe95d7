//! Requests and the collaborator that executes them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use infergrid_core::ModelId;

/// An inference request as submitted to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model_id: ModelId,
    pub payload: serde_json::Value,
    /// Results are looked up in and written to the cache under this key.
    #[serde(default)]
    pub cache_key: Option<String>,
}

impl InferenceRequest {
    pub fn new(model_id: impl Into<ModelId>, payload: serde_json::Value) -> Self {
        Self {
            model_id: model_id.into(),
            payload,
            cache_key: None,
        }
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }
}

/// Runs a request against a backend node.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// `node_id` is `None` when the scheduler has no load balancer.
    async fn execute(
        &self,
        request: &InferenceRequest,
        node_id: Option<&str>,
    ) -> anyhow::Result<serde_json::Value>;
}
