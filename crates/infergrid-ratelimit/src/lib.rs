//! infergrid-ratelimit — per-model admission throttling.
//!
//! Each configured model owns a token bucket refilled continuously at
//! `requests_per_second` up to `burst_limit`, an optional quota window,
//! and a bounded FIFO queue of callers waiting for a token.
//!
//! # Flow
//!
//! ```text
//! acquire_token(model)
//!   ├── refill bucket, reset expired quota window
//!   ├── grant queued waiters first (FIFO)
//!   ├── token available → granted
//!   └── otherwise → WaitEntry queued (QueueFull past max_queue_size)
//!         ├── process_queue() grants it when tokens refill
//!         ├── caller deadline → Timeout, entry removed
//!         └── stale sweep → Stale, entry removed
//! ```

pub mod error;
pub mod limiter;

pub use error::{RateLimitError, RateLimitResult};
pub use limiter::{ModelRateConfig, RateLimitStatus, RateLimiter, RateLimiterConfig};
