//! Scheduler error types.

use std::time::Duration;

use infergrid_balancer::BalancerError;
use infergrid_core::{ErrorKind, InvalidPriority};
use infergrid_ratelimit::RateLimitError;
use thiserror::Error;

/// Errors a scheduled request can settle with.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    InvalidPriority(#[from] InvalidPriority),

    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimitError),

    #[error("routing failed: {0}")]
    Routing(#[from] BalancerError),

    #[error("request {request_id} failed: {message}")]
    Execution { request_id: String, message: String },

    #[error("request {request_id} timed out after {timeout:?}")]
    Timeout { request_id: String, timeout: Duration },

    #[error("request {0} was cancelled")]
    Cancelled(String),

    #[error("scheduler is shut down")]
    ShutDown,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::InvalidPriority(_) => ErrorKind::InvalidInput,
            SchedulerError::RateLimited(e) => e.kind(),
            SchedulerError::Routing(e) => e.kind(),
            SchedulerError::Execution { .. } => ErrorKind::TransientIo,
            SchedulerError::Timeout { .. } => ErrorKind::Timeout,
            SchedulerError::Cancelled(_) | SchedulerError::ShutDown => ErrorKind::Cancelled,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
