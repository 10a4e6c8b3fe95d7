//! infergrid-core — shared vocabulary for the InferGrid serving pipeline.
//!
//! Holds the domain types every subsystem speaks (priorities, node and
//! model metrics), the error-kind taxonomy, the `infergrid.toml` config
//! format, and the `PeriodicTask` handle used by every background loop.

pub mod config;
pub mod error;
pub mod task;
pub mod types;

pub use config::{GridConfig, parse_duration};
pub use error::ErrorKind;
pub use task::PeriodicTask;
pub use types::*;
