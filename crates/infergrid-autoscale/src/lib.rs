//! infergrid-autoscale — replica scaling driven by model metrics.
//!
//! # Architecture
//!
//! ```text
//! MetricsEvent::Collected ──┐
//! periodic sweep ───────────┼─▶ AutoscalingController
//!                           │     ├── overlap guard (one live operation per model)
//!                           │     ├── ScalingPolicy::evaluate_scaling_decision()
//!                           │     └── execute_scaling_operation()
//!                           │           pending → in_progress → completed | failed
//!                           │           ├── DeploymentService::scale_model_deployment()
//!                           │           ├── ScalingEvent::{Started, Completed, Failed}
//!                           │           └── Dashboard::publish_operation()
//! scale_model() (manual) ───┘
//! ```
//!
//! # Threshold policy
//!
//! ```text
//! value  = latest metric (rps, latency_p99, error_rate)
//! target = target_value
//!
//! if value > target * 1.1:  desired = ceil(replicas * value / target), capped at max
//! if value < target * 0.5:  desired = ceil(replicas * value / target), floored at min
//! ```
//!
//! Cooldown windows (`scale_up_window`, `scale_down_window`) prevent
//! rapid oscillation.

pub mod controller;
pub mod deployment;
pub mod error;
pub mod operation;
pub mod policy;

pub use controller::{AutoscalingController, ControllerConfig};
pub use deployment::{Dashboard, DeploymentService, InMemoryDeployments, ModelDeployment};
pub use error::{AutoscaleError, AutoscaleResult};
pub use operation::{OperationStatus, ScalingEvent, ScalingOperation};
pub use policy::{
    ScalingAction, ScalingDecision, ScalingMetric, ScalingPolicy, ThresholdConfig, ThresholdPolicy,
};
