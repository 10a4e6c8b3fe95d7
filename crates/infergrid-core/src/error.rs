//! Error classes shared by every InferGrid subsystem.
//!
//! Each crate keeps its own `thiserror` enum; `ErrorKind` is the coarse
//! class callers branch on (retry later, shed load, fix config, ...).

use std::fmt;

/// Coarse classification of a subsystem error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A component was used for something it was never configured for.
    Configuration,
    /// A bounded resource (queue, quota, byte budget) is exhausted.
    Capacity,
    /// An operation did not settle within its deadline.
    Timeout,
    /// No backend node is currently eligible for traffic.
    NoHealthyNodes,
    /// A referenced entity (deployment, node, request) does not exist.
    NotFound,
    /// A disk or collaborator I/O failure that may succeed on a later attempt.
    TransientIo,
    /// The caller passed a malformed argument.
    InvalidInput,
    /// The operation was withdrawn before it completed.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NoHealthyNodes => "no_healthy_nodes",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
