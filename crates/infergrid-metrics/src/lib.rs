//! infergrid-metrics — request metrics per model.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── record_request() ← called by the scheduler per settled request
//!   ├── snapshot() → ModelMetrics per model, window reset
//!   │                  └── MetricsEvent::Collected → autoscaler
//!   └── spawn_snapshots() → periodic snapshot loop
//! ```

pub mod collector;

pub use collector::{MetricsCollector, MetricsEvent};
