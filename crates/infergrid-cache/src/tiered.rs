//! Tiered cache — memory first, disk behind it.
//!
//! Lock order is disk → memory; no path takes the memory lock and then
//! waits on the disk lock, and the memory lock is never held across I/O.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::{debug, info};

use infergrid_core::PeriodicTask;

use crate::disk::{self, DiskTier};
use crate::error::{CacheError, CacheResult};

/// Where an entry is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Memory,
    Disk,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheTier::Memory => "memory",
            CacheTier::Disk => "disk",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory tier budget in serialized bytes.
    pub max_memory_size: u64,
    /// Disk tier budget in file bytes.
    pub max_disk_size: u64,
    /// Sliding in memory, measured from the write on disk.
    pub ttl: Duration,
    pub cleanup_interval: Duration,
    /// One JSON file per entry is written here.
    pub disk_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_size: 100 * 1024 * 1024,
            max_disk_size: 1024 * 1024 * 1024,
            ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            disk_dir: PathBuf::from(".infergrid/cache"),
        }
    }
}

/// Counts from one cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub memory_removed: usize,
    pub disk_removed: usize,
}

/// Cache events, published on a broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    ItemCached { key: String, location: CacheTier },
    ItemInvalidated { key: String },
    Cleanup { stats: CleanupStats },
}

/// Hit/miss counters and current occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_usage: u64,
    pub disk_usage: u64,
    pub memory_items: usize,
    pub disk_items: usize,
}

impl CacheStats {
    /// Fraction of lookups served from either tier.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct MemoryEntry {
    value: serde_json::Value,
    size: u64,
    last_access: Instant,
    access_count: u64,
}

#[derive(Default)]
struct MemoryTier {
    entries: HashMap<String, MemoryEntry>,
    usage: u64,
}

impl MemoryTier {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.usage = self.usage.saturating_sub(entry.size);
                true
            }
            None => false,
        }
    }

    /// Drop the least recently accessed entry.
    fn evict_lru(&mut self) -> Option<String> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone())?;
        self.remove(&key);
        Some(key)
    }
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Memory + disk key/value cache for inference results.
pub struct TieredCache {
    config: CacheConfig,
    memory: Mutex<MemoryTier>,
    disk: Mutex<DiskTier>,
    counters: Counters,
    events: broadcast::Sender<CacheEvent>,
}

impl TieredCache {
    /// Open the cache, indexing whatever the disk directory already holds.
    pub async fn open(config: CacheConfig) -> CacheResult<Self> {
        let disk = DiskTier::open(&config.disk_dir, config.max_disk_size).await?;
        info!(
            dir = %config.disk_dir.display(),
            max_memory_size = config.max_memory_size,
            max_disk_size = config.max_disk_size,
            ttl_secs = config.ttl.as_secs(),
            disk_items = disk.len(),
            "tiered cache opened"
        );
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            config,
            memory: Mutex::new(MemoryTier::default()),
            disk: Mutex::new(disk),
            counters: Counters::default(),
            events,
        })
    }

    /// The configuration the cache was opened with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Receive `CacheEvent`s published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }

    fn memory_expired(&self, entry: &MemoryEntry, now: Instant) -> bool {
        self.config.ttl.is_zero() || now.saturating_duration_since(entry.last_access) > self.config.ttl
    }

    /// Look up `key` and deserialize it as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get_value(key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Look up `key`: memory first, then disk (promoting on a hit).
    pub async fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        {
            let mut memory = self.memory.lock().await;
            let now = Instant::now();
            let expired = match memory.entries.get(key) {
                Some(entry) => self.memory_expired(entry, now),
                None => false,
            };
            if expired {
                memory.remove(key);
                debug!(%key, "memory entry expired");
            } else if let Some(entry) = memory.entries.get_mut(key) {
                entry.last_access = now;
                entry.access_count += 1;
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }

        let mut disk = self.disk.lock().await;
        if let Some(record) = disk.read(key).await {
            if disk::is_expired_at(record.timestamp, infergrid_core::epoch_millis(), self.config.ttl) {
                disk.remove(key).await;
                debug!(%key, "disk entry expired");
            } else {
                self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                if self.try_promote(&mut disk, key, &record.data).await {
                    debug!(%key, "promoted disk entry to memory");
                }
                return Some(record.data);
            }
        }
        drop(disk);

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Move a disk entry into memory if it fits the free memory budget
    /// without evicting anything.
    ///
    /// A memory entry for `key` means a concurrent `set` won; the disk copy
    /// is stale and that `set` removes it.
    async fn try_promote(&self, disk: &mut DiskTier, key: &str, value: &serde_json::Value) -> bool {
        let Ok(bytes) = serde_json::to_vec(value) else {
            return false;
        };
        let size = bytes.len() as u64;
        {
            let mut memory = self.memory.lock().await;
            if memory.entries.contains_key(key) {
                return false;
            }
            if memory.usage + size > self.config.max_memory_size {
                return false;
            }
            memory.usage += size;
            memory.entries.insert(
                key.to_string(),
                MemoryEntry {
                    value: value.clone(),
                    size,
                    last_access: Instant::now(),
                    access_count: 1,
                },
            );
        }
        disk.remove(key).await;
        true
    }

    /// Store a value. Returns the tier it landed in.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<CacheTier> {
        let value = serde_json::to_value(value)?;
        let size = serde_json::to_vec(&value)?.len() as u64;

        let tier = if size <= self.config.max_memory_size {
            self.set_memory(key, value, size).await?;
            let mut disk = self.disk.lock().await;
            disk.remove(key).await;
            CacheTier::Memory
        } else {
            let evicted = {
                let mut disk = self.disk.lock().await;
                disk.write(key, value).await?
            };
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            self.memory.lock().await.remove(key);
            CacheTier::Disk
        };

        debug!(%key, size, %tier, "cached");
        self.emit(CacheEvent::ItemCached {
            key: key.to_string(),
            location: tier,
        });
        Ok(tier)
    }

    async fn set_memory(&self, key: &str, value: serde_json::Value, size: u64) -> CacheResult<()> {
        let mut memory = self.memory.lock().await;
        memory.remove(key);

        while memory.usage + size > self.config.max_memory_size {
            match memory.evict_lru() {
                Some(evicted) => {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %evicted, "evicted least recently used entry");
                }
                None => {
                    return Err(CacheError::Capacity {
                        key: key.to_string(),
                        size,
                        tier: CacheTier::Memory,
                    });
                }
            }
        }

        memory.usage += size;
        memory.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                size,
                last_access: Instant::now(),
                access_count: 0,
            },
        );
        Ok(())
    }

    /// Remove `key` from both tiers. Returns whether anything was removed.
    pub async fn invalidate(&self, key: &str) -> bool {
        let in_memory = self.memory.lock().await.remove(key);
        let on_disk = self.disk.lock().await.remove(key).await;
        let removed = in_memory || on_disk;
        if removed {
            debug!(%key, "invalidated");
            self.emit(CacheEvent::ItemInvalidated {
                key: key.to_string(),
            });
        }
        removed
    }

    /// Whether `key` is resident in either tier (expired or not).
    pub async fn contains_key(&self, key: &str) -> bool {
        if self.memory.lock().await.entries.contains_key(key) {
            return true;
        }
        self.disk.lock().await.contains(key)
    }

    /// Number of times `key` has been read from memory, if resident there.
    pub async fn access_count(&self, key: &str) -> Option<u64> {
        self.memory.lock().await.entries.get(key).map(|e| e.access_count)
    }

    /// Remove TTL-expired entries from both tiers.
    pub async fn cleanup(&self) -> CleanupStats {
        let memory_removed = {
            let mut memory = self.memory.lock().await;
            let now = Instant::now();
            let expired: Vec<String> = memory
                .entries
                .iter()
                .filter(|(_, e)| self.memory_expired(e, now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                memory.remove(key);
            }
            expired.len()
        };
        let disk_removed = self.disk.lock().await.remove_expired(self.config.ttl).await;

        let stats = CleanupStats {
            memory_removed,
            disk_removed,
        };
        if memory_removed + disk_removed > 0 {
            info!(memory_removed, disk_removed, "cache cleanup removed expired entries");
        }
        self.emit(CacheEvent::Cleanup { stats });
        stats
    }

    /// Drop every entry in both tiers.
    pub async fn clear(&self) {
        {
            let mut memory = self.memory.lock().await;
            memory.entries.clear();
            memory.usage = 0;
        }
        self.disk.lock().await.clear().await;
        debug!("cache cleared");
    }

    /// Snapshot of the counters and per-tier occupancy.
    pub async fn stats(&self) -> CacheStats {
        let (memory_usage, memory_items) = {
            let memory = self.memory.lock().await;
            (memory.usage, memory.entries.len())
        };
        let (disk_usage, disk_items) = {
            let disk = self.disk.lock().await;
            (disk.usage(), disk.len())
        };
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            memory_usage,
            disk_usage,
            memory_items,
            disk_items,
        }
    }

    /// Start the periodic expiry sweep.
    pub fn spawn_cleanup(self: &Arc<Self>) -> PeriodicTask {
        let cache = Arc::clone(self);
        PeriodicTask::spawn("cache-cleanup", self.config.cleanup_interval, move || {
            let cache = cache.clone();
            async move {
                cache.cleanup().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergrid_core::ErrorKind;
    use serde::Deserialize;
    use tempfile::TempDir;

    fn config(dir: &TempDir, max_memory_size: u64) -> CacheConfig {
        CacheConfig {
            max_memory_size,
            max_disk_size: 1024 * 1024,
            ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(1),
            disk_dir: dir.path().to_path_buf(),
        }
    }

    /// A JSON string that serializes to exactly `len` bytes.
    fn payload(len: usize) -> String {
        "x".repeat(len - 2)
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Completion {
        text: String,
        tokens: u32,
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(config(&dir, 1024)).await.unwrap();

        let value = Completion {
            text: "hello".to_string(),
            tokens: 3,
        };
        assert_eq!(cache.set("k", &value).await.unwrap(), CacheTier::Memory);
        let got: Option<Completion> = cache.get("k").await.unwrap();
        assert_eq!(got, Some(value));

        let stats = cache.stats().await;
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.memory_items, 1);
        assert_eq!(cache.access_count("k").await, Some(1));
    }

    #[tokio::test]
    async fn second_item_evicts_first_when_budget_is_tight() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(config(&dir, 100)).await.unwrap();

        cache.set("first", &payload(60)).await.unwrap();
        assert_eq!(cache.stats().await.memory_usage, 60);
        cache.set("second", &payload(60)).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.memory_usage, 60);
        assert!(stats.memory_usage <= 100);
        assert!(cache.get_value("first").await.is_none());
        assert!(cache.get_value("second").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_is_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(config(&dir, 100)).await.unwrap();

        cache.set("a", &payload(30)).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("b", &payload(30)).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("c", &payload(30)).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;

        // Touch "a" so "b" becomes the oldest.
        cache.get_value("a").await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("d", &payload(30)).await.unwrap();

        assert!(cache.contains_key("a").await);
        assert!(!cache.contains_key("b").await);
        assert!(cache.contains_key("c").await);
        assert!(cache.contains_key("d").await);
    }

    #[tokio::test]
    async fn oversized_values_go_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(config(&dir, 100)).await.unwrap();

        let big = payload(200);
        assert_eq!(cache.set("big", &big).await.unwrap(), CacheTier::Disk);

        let raw = std::fs::read(dir.path().join("big.json")).unwrap();
        let record: disk::DiskRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record.data, serde_json::json!(big));
        assert!(record.timestamp > 0);

        let got: Option<String> = cache.get("big").await.unwrap();
        assert_eq!(got, Some(big));
        let stats = cache.stats().await;
        assert_eq!(stats.disk_hits, 1);
        // Too large for memory, so it stays on disk.
        assert_eq!(stats.disk_items, 1);
        assert_eq!(stats.memory_items, 0);
    }

    #[tokio::test]
    async fn disk_hit_is_promoted_when_memory_has_room() {
        let dir = tempfile::tempdir().unwrap();
        {
            let small = TieredCache::open(config(&dir, 10)).await.unwrap();
            assert_eq!(small.set("k", &payload(50)).await.unwrap(), CacheTier::Disk);
        }

        let cache = TieredCache::open(config(&dir, 1000)).await.unwrap();
        assert!(cache.get_value("k").await.is_some());
        assert!(cache.get_value("k").await.is_some());

        let stats = cache.stats().await;
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.disk_items, 0);
        assert_eq!(stats.memory_items, 1);
    }

    #[tokio::test]
    async fn zero_ttl_is_always_expired() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir, 1000);
        cfg.ttl = Duration::ZERO;
        let cache = TieredCache::open(cfg).await.unwrap();

        cache.set("k", &"v").await.unwrap();
        assert!(cache.get_value("k").await.is_none());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_entries_expire_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(config(&dir, 1000)).await.unwrap();

        cache.set("k", &"v").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.get_value("k").await.is_some());

        // Access refreshed last_access, so 61s from the set is still fresh.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get_value("k").await.is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get_value("k").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_sweeps_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let stale = disk::DiskRecord {
            data: serde_json::json!("old"),
            timestamp: 1_000,
        };
        std::fs::write(dir.path().join("old.json"), serde_json::to_vec(&stale).unwrap()).unwrap();
        std::fs::write(dir.path().join("broken.json"), b"][").unwrap();

        let cache = TieredCache::open(config(&dir, 1000)).await.unwrap();
        let mut events = cache.subscribe();
        cache.set("fresh", &"v").await.unwrap();
        cache.set("mem", &"v").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let stats = cache.cleanup().await;
        assert_eq!(stats.memory_removed, 2);
        assert_eq!(stats.disk_removed, 2);
        assert_eq!(cache.stats().await.disk_items, 0);

        let mut saw_cleanup = false;
        while let Ok(event) = events.try_recv() {
            if let CacheEvent::Cleanup { stats: s } = event {
                assert_eq!(s, stats);
                saw_cleanup = true;
            }
        }
        assert!(saw_cleanup);
    }

    #[tokio::test]
    async fn invalidate_removes_from_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(config(&dir, 100)).await.unwrap();
        let mut events = cache.subscribe();

        cache.set("m", &"small").await.unwrap();
        cache.set("d", &payload(150)).await.unwrap();

        assert!(cache.invalidate("m").await);
        assert!(cache.invalidate("d").await);
        assert!(!cache.invalidate("missing").await);

        let stats = cache.stats().await;
        assert_eq!(stats.memory_usage, 0);
        assert_eq!(stats.disk_usage, 0);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event);
        }
        assert_eq!(
            kinds,
            vec![
                CacheEvent::ItemCached {
                    key: "m".into(),
                    location: CacheTier::Memory
                },
                CacheEvent::ItemCached {
                    key: "d".into(),
                    location: CacheTier::Disk
                },
                CacheEvent::ItemInvalidated { key: "m".into() },
                CacheEvent::ItemInvalidated { key: "d".into() },
            ]
        );
    }

    #[tokio::test]
    async fn rewriting_a_key_moves_it_between_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(config(&dir, 100)).await.unwrap();

        cache.set("k", &payload(150)).await.unwrap();
        cache.set("k", &"now small").await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.disk_items, 0);
        assert_eq!(stats.memory_items, 1);
        let got: Option<String> = cache.get("k").await.unwrap();
        assert_eq!(got.as_deref(), Some("now small"));
    }

    #[tokio::test]
    async fn disk_budget_evicts_oldest_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir, 10);
        // Each record is the payload plus the {"data":..,"timestamp":..} wrapper.
        cfg.max_disk_size = 150;
        let cache = TieredCache::open(cfg).await.unwrap();

        cache.set("one", &payload(60)).await.unwrap();
        // Separate modification times.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.set("two", &payload(60)).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.disk_items, 1);
        assert_eq!(stats.evictions, 1);
        assert!(!dir.path().join("one.json").exists());
        assert!(dir.path().join("two.json").exists());
    }

    #[tokio::test]
    async fn type_mismatch_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(config(&dir, 1000)).await.unwrap();
        cache.set("k", &"text").await.unwrap();

        let err = cache.get::<u32>("k").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn hit_rate_counts_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(config(&dir, 1000)).await.unwrap();
        cache.set("k", &1).await.unwrap();
        cache.get_value("k").await;
        cache.get_value("nope").await;
        assert_eq!(cache.stats().await.hit_rate(), 0.5);

        cache.clear().await;
        assert!(!cache.contains_key("k").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_set_wins_over_disk_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let large = payload(2000);

        for _ in 0..100 {
            // Written while the memory budget was too small, so it sits on
            // disk but fits in memory once reopened with a larger budget.
            {
                let small = TieredCache::open(config(&dir, 1000)).await.unwrap();
                assert_eq!(small.set("k", &large).await.unwrap(), CacheTier::Disk);
            }
            let cache = Arc::new(TieredCache::open(config(&dir, 1_000_000)).await.unwrap());

            let reader = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_value("k").await })
            };
            let writer = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.set("k", "new").await })
            };
            reader.await.unwrap();
            assert_eq!(writer.await.unwrap().unwrap(), CacheTier::Memory);

            assert_eq!(cache.get::<String>("k").await.unwrap().as_deref(), Some("new"));
            let stats = cache.stats().await;
            assert_eq!(stats.memory_usage, 5);
            assert_eq!(stats.memory_items, 1);
            assert_eq!(stats.disk_items, 0);
        }
    }
}
