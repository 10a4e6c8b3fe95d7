//! infergrid-balancer — routes each request to one healthy backend node.
//!
//! ```text
//!   NodeMetricsSource ──poll──▶ health loop ──classify──▶ NodeHealth map
//!                                                            │
//!   distribute_request(req, model) ◀── healthy nodes ────────┘
//!     weight = 0.3·(1-cpu) + 0.3·(1-mem) + 0.2·(1-load) + 0.2·(1-latency)
//!     cumulative draw over weights (seedable StdRng)
//!     └── DistributionRecord → bounded history → node_stats()
//! ```
//!
//! Only `healthy` nodes receive traffic; `degraded` and `unhealthy` nodes
//! are skipped until a later health check reclassifies them.

pub mod balancer;
pub mod error;
pub mod health;

pub use balancer::{
    BalancerConfig, BalancerEvent, DistributionRecord, LoadBalancer, NodeHealth, NodeStats,
};
pub use error::{BalancerError, BalancerResult};
pub use health::{NodeMetricsSource, StaticMetricsSource, node_weight};
