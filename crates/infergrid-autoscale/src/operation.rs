//! Scaling operation records and lifecycle events.

use std::fmt;

use serde::{Deserialize, Serialize};

use infergrid_core::{ModelId, ModelMetrics, epoch_millis};

use crate::policy::ScalingAction;

/// `pending → in_progress → {completed, failed}`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        })
    }
}

/// One attempt to change a model's replica count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingOperation {
    pub id: String,
    pub model_id: ModelId,
    pub status: OperationStatus,
    pub action: ScalingAction,
    pub current_replicas: u32,
    pub target_replicas: u32,
    pub reason: String,
    pub error: Option<String>,
    /// Metrics that triggered the decision, when policy-driven.
    pub metrics: Option<ModelMetrics>,
    pub created_at: u64,
    pub completed_at: Option<u64>,
}

impl ScalingOperation {
    pub(crate) fn new(
        model_id: &str,
        action: ScalingAction,
        current_replicas: u32,
        target_replicas: u32,
        reason: String,
        metrics: Option<ModelMetrics>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model_id.to_string(),
            status: OperationStatus::Pending,
            action,
            current_replicas,
            target_replicas,
            reason,
            error: None,
            metrics,
            created_at: epoch_millis(),
            completed_at: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = OperationStatus::InProgress;
    }

    pub(crate) fn complete(&mut self) {
        self.status = OperationStatus::Completed;
        self.completed_at = Some(epoch_millis());
    }

    pub(crate) fn fail(&mut self, error: String) {
        self.status = OperationStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(epoch_millis());
    }
}

/// Lifecycle notifications, published on a broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingEvent {
    Started(ScalingOperation),
    Completed(ScalingOperation),
    Failed {
        operation: ScalingOperation,
        error: String,
    },
}

impl ScalingEvent {
    pub fn operation(&self) -> &ScalingOperation {
        match self {
            ScalingEvent::Started(op) | ScalingEvent::Completed(op) => op,
            ScalingEvent::Failed { operation, .. } => operation,
        }
    }
}
