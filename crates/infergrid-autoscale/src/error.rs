//! Autoscaler error types.

use infergrid_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AutoscaleError {
    #[error("no deployment for model {0}")]
    DeploymentNotFound(String),

    #[error("a scaling operation is already in progress for model {0}")]
    OperationInProgress(String),

    #[error("deployment lookup failed for model {model_id}: {message}")]
    Deployment { model_id: String, message: String },

    #[error("scaling operation {operation_id} for model {model_id} failed: {message}")]
    ScaleFailed {
        model_id: String,
        operation_id: String,
        message: String,
    },

    #[error("scaling policy failed for model {model_id}: {message}")]
    Policy { model_id: String, message: String },

    #[error("decision for model {0} requests no action")]
    NoAction(String),

    #[error("unknown scaling metric: {0}")]
    UnknownMetric(String),
}

impl AutoscaleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AutoscaleError::DeploymentNotFound(_) => ErrorKind::NotFound,
            AutoscaleError::OperationInProgress(_) => ErrorKind::Capacity,
            AutoscaleError::Deployment { .. }
            | AutoscaleError::ScaleFailed { .. }
            | AutoscaleError::Policy { .. } => ErrorKind::TransientIo,
            AutoscaleError::NoAction(_) => ErrorKind::InvalidInput,
            AutoscaleError::UnknownMetric(_) => ErrorKind::Configuration,
        }
    }
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
