//! infergrid-cache — two-tier result cache.
//!
//! Values are stored as JSON. An entry lives in exactly one tier:
//!
//! ```text
//! set(key, value)
//!   ├── size <= max_memory_size → memory tier (evict LRU until it fits)
//!   └── otherwise               → disk tier, <dir>/<key>.json
//!                                 (evict oldest file by mtime until it fits)
//!
//! get(key)
//!   ├── memory hit  → bump last_access / access_count
//!   ├── disk hit    → promote to memory when the budget allows
//!   └── miss
//! ```
//!
//! Entry size is the serialized JSON byte length. Entries expire once
//! `now - last_access` (memory) or `now - timestamp` (disk) exceeds the
//! TTL; a zero TTL expires everything immediately.

pub mod disk;
pub mod error;
pub mod tiered;

pub use error::{CacheError, CacheResult};
pub use tiered::{CacheConfig, CacheEvent, CacheStats, CacheTier, CleanupStats, TieredCache};
