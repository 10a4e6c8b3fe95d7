//! Deployment and dashboard collaborators.

use std::collections::HashMap;

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use infergrid_core::ModelId;

use crate::operation::ScalingOperation;

/// Replica count a model is currently deployed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDeployment {
    pub model_id: ModelId,
    pub replicas: u32,
}

/// Owns the actual replica counts of deployed models.
#[async_trait]
pub trait DeploymentService: Send + Sync {
    /// `None` when the model has no deployment.
    async fn get_model_deployment(&self, model_id: &str) -> anyhow::Result<Option<ModelDeployment>>;

    /// Scale the model to exactly `replicas`.
    async fn scale_model_deployment(&self, model_id: &str, replicas: u32) -> anyhow::Result<()>;
}

/// Receives every settled operation. Fire-and-forget.
#[async_trait]
pub trait Dashboard: Send + Sync {
    async fn publish_operation(&self, operation: &ScalingOperation);
}

/// Replica counts kept in memory, with a log of every scale call.
#[derive(Default)]
pub struct InMemoryDeployments {
    replicas: RwLock<HashMap<ModelId, u32>>,
    calls: RwLock<Vec<(ModelId, u32)>>,
}

impl InMemoryDeployments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(models: impl IntoIterator<Item = (ModelId, u32)>) -> Self {
        Self {
            replicas: RwLock::new(models.into_iter().collect()),
            calls: RwLock::new(Vec::new()),
        }
    }

    pub async fn insert(&self, model_id: &str, replicas: u32) {
        self.replicas.write().await.insert(model_id.to_string(), replicas);
    }

    pub async fn replicas(&self, model_id: &str) -> Option<u32> {
        self.replicas.read().await.get(model_id).copied()
    }

    /// Every `scale_model_deployment` call, in order.
    pub async fn scale_calls(&self) -> Vec<(ModelId, u32)> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl DeploymentService for InMemoryDeployments {
    async fn get_model_deployment(&self, model_id: &str) -> anyhow::Result<Option<ModelDeployment>> {
        Ok(self.replicas(model_id).await.map(|replicas| ModelDeployment {
            model_id: model_id.to_string(),
            replicas,
        }))
    }

    async fn scale_model_deployment(&self, model_id: &str, replicas: u32) -> anyhow::Result<()> {
        self.calls.write().await.push((model_id.to_string(), replicas));
        let mut deployments = self.replicas.write().await;
        let Some(current) = deployments.get_mut(model_id) else {
            bail!("model {model_id} is not deployed");
        };
        info!(%model_id, from = *current, to = replicas, "deployment scaled");
        *current = replicas;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scale_updates_and_logs() {
        let deployments = InMemoryDeployments::with_models([("m".to_string(), 2)]);
        deployments.scale_model_deployment("m", 4).await.unwrap();
        assert_eq!(deployments.replicas("m").await, Some(4));

        assert!(deployments.scale_model_deployment("x", 1).await.is_err());
        assert_eq!(
            deployments.scale_calls().await,
            vec![("m".to_string(), 4), ("x".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn missing_model_has_no_deployment() {
        let deployments = InMemoryDeployments::new();
        assert!(deployments.get_model_deployment("m").await.unwrap().is_none());

        deployments.insert("m", 1).await;
        let d = deployments.get_model_deployment("m").await.unwrap().unwrap();
        assert_eq!(d.replicas, 1);
    }
}
