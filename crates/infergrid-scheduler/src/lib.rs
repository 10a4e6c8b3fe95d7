//! infergrid-scheduler — priority admission for inference requests.
//!
//! The scheduler is the only component that sequences the others. Each
//! request waits in one of three priority lanes until a concurrency slot
//! frees up, then runs through the serving pipeline:
//!
//! # Architecture
//!
//! ```text
//! schedule_request(request, priority)
//!   └── lane: high | normal | low        (strict order, no aging)
//!         └── dispatcher: permit (max_concurrent_requests) → pop first non-empty lane
//!               └── spawned request task
//!                     ├── RateLimiter::acquire_token()     (configured models only)
//!                     ├── LoadBalancer::distribute_request()
//!                     ├── TieredCache::get()               (requests with a cache key)
//!                     ├── RequestExecutor::execute()       (bounded by request_timeout)
//!                     ├── TieredCache::set()
//!                     └── MetricsCollector::record_request()
//! ```

pub mod error;
pub mod executor;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use executor::{InferenceRequest, RequestExecutor};
pub use scheduler::{
    PriorityScheduler, QueueLengths, RequestOutcome, RequestTicket, SchedulerConfig,
    SchedulerEvent,
};
