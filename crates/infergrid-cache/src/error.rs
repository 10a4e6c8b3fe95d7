//! Cache error types.

use std::path::PathBuf;

use infergrid_core::ErrorKind;
use thiserror::Error;

use crate::tiered::CacheTier;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot make room for {key} ({size} bytes) in the {tier} tier")]
    Capacity {
        key: String,
        size: u64,
        tier: CacheTier,
    },

    #[error("cache I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Capacity { .. } => ErrorKind::Capacity,
            CacheError::Io { .. } => ErrorKind::TransientIo,
            CacheError::Serialization(_) => ErrorKind::InvalidInput,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
