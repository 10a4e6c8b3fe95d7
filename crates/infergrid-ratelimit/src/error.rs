//! Rate limiter error types.

use std::time::Duration;

use infergrid_core::ErrorKind;
use thiserror::Error;

/// Errors returned by token acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("model not configured for rate limiting: {0}")]
    NotConfigured(String),

    #[error("rate limit queue full for model {model_id} (max {max_queue_size})")]
    QueueFull {
        model_id: String,
        max_queue_size: usize,
    },

    #[error("quota exceeded for model {model_id}, resets in {resets_in:?}")]
    QuotaExceeded {
        model_id: String,
        resets_in: Duration,
    },

    #[error("timed out after {waited:?} waiting for a token for model {model_id}")]
    Timeout { model_id: String, waited: Duration },

    #[error("wait entry for model {model_id} discarded as stale after {age:?}")]
    Stale { model_id: String, age: Duration },

    #[error("token wait for model {model_id} was cancelled")]
    Cancelled { model_id: String },
}

impl RateLimitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RateLimitError::NotConfigured(_) => ErrorKind::Configuration,
            RateLimitError::QueueFull { .. } | RateLimitError::QuotaExceeded { .. } => {
                ErrorKind::Capacity
            }
            RateLimitError::Timeout { .. } | RateLimitError::Stale { .. } => ErrorKind::Timeout,
            RateLimitError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

pub type RateLimitResult<T> = Result<T, RateLimitError>;
