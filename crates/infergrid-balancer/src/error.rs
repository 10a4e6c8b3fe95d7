//! Load balancer error types.

use infergrid_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BalancerError {
    #[error("no healthy nodes available for request {request_id} (model {model_id})")]
    NoHealthyNodes {
        request_id: String,
        model_id: String,
    },

    #[error("node not registered: {0}")]
    NodeNotFound(String),

    #[error("no open distribution record for request {0}")]
    RequestNotFound(String),
}

impl BalancerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BalancerError::NoHealthyNodes { .. } => ErrorKind::NoHealthyNodes,
            BalancerError::NodeNotFound(_) | BalancerError::RequestNotFound(_) => {
                ErrorKind::NotFound
            }
        }
    }
}

pub type BalancerResult<T> = Result<T, BalancerError>;
