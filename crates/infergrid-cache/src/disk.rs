//! Disk tier — one JSON file per entry under the cache directory.
//!
//! File contents are `{"data": <value>, "timestamp": <epoch-ms>}` and the
//! file name is the key with anything outside `[A-Za-z0-9_-]`
//! percent-encoded, plus `.json`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::tiered::CacheTier;

/// Persisted shape of a disk entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub data: serde_json::Value,
    /// Unix epoch milliseconds at write time.
    pub timestamp: u64,
}

/// Map a cache key to a safe file stem.
pub fn file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

pub(crate) fn is_expired_at(timestamp: u64, now_ms: u64, ttl: Duration) -> bool {
    ttl.is_zero() || now_ms.saturating_sub(timestamp) > ttl.as_millis() as u64
}

/// Disk bookkeeping: which stems exist and how many bytes they occupy.
pub(crate) struct DiskTier {
    dir: PathBuf,
    max_size: u64,
    index: HashMap<String, u64>,
    usage: u64,
}

impl DiskTier {
    /// Open the directory, creating it if needed, and index existing files.
    pub(crate) async fn open(dir: &Path, max_size: u64) -> CacheResult<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;

        let mut tier = Self {
            dir: dir.to_path_buf(),
            max_size,
            index: HashMap::new(),
            usage: 0,
        };

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(dir, e))?
        {
            let path = entry.path();
            let Some(stem) = json_stem(&path) else {
                continue;
            };
            match entry.metadata().await {
                Ok(meta) if meta.is_file() => {
                    tier.usage += meta.len();
                    tier.index.insert(stem, meta.len());
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable cache file"),
            }
        }

        debug!(dir = %dir.display(), files = tier.index.len(), bytes = tier.usage, "disk tier indexed");
        Ok(tier)
    }

    pub(crate) fn usage(&self) -> u64 {
        self.usage
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.index.contains_key(&file_stem(key))
    }

    fn path_for_stem(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.json"))
    }

    /// Read an entry. Unreadable or corrupt files are deleted and reported
    /// as absent.
    pub(crate) async fn read(&mut self, key: &str) -> Option<DiskRecord> {
        let stem = file_stem(key);
        if !self.index.contains_key(&stem) {
            return None;
        }
        let path = self.path_for_stem(&stem);

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(%key, path = %path.display(), error = %e, "cache file unreadable, dropping");
                self.remove_stem(&stem).await;
                return None;
            }
        };
        match serde_json::from_slice::<DiskRecord>(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(%key, path = %path.display(), error = %e, "cache file corrupt, dropping");
                self.remove_stem(&stem).await;
                None
            }
        }
    }

    /// Persist an entry, evicting the oldest files first when the budget
    /// would be exceeded. Returns the number of files evicted.
    pub(crate) async fn write(&mut self, key: &str, data: serde_json::Value) -> CacheResult<u64> {
        let record = DiskRecord {
            data,
            timestamp: infergrid_core::epoch_millis(),
        };
        let bytes = serde_json::to_vec(&record)?;
        let size = bytes.len() as u64;
        if size > self.max_size {
            return Err(CacheError::Capacity {
                key: key.to_string(),
                size,
                tier: CacheTier::Disk,
            });
        }

        let stem = file_stem(key);
        self.remove_stem(&stem).await;

        let mut evicted = 0;
        while self.usage + size > self.max_size {
            if !self.evict_oldest().await? {
                return Err(CacheError::Capacity {
                    key: key.to_string(),
                    size,
                    tier: CacheTier::Disk,
                });
            }
            evicted += 1;
        }

        let path = self.path_for_stem(&stem);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| CacheError::io(&path, e))?;
        self.usage += size;
        self.index.insert(stem, size);
        Ok(evicted)
    }

    pub(crate) async fn remove(&mut self, key: &str) -> bool {
        self.remove_stem(&file_stem(key)).await
    }

    async fn remove_stem(&mut self, stem: &str) -> bool {
        let Some(size) = self.index.remove(stem) else {
            return false;
        };
        self.usage = self.usage.saturating_sub(size);
        let path = self.path_for_stem(stem);
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to delete cache file");
        }
        true
    }

    /// Delete the indexed file with the oldest modification time.
    async fn evict_oldest(&mut self) -> CacheResult<bool> {
        let mut oldest: Option<(SystemTime, String)> = None;
        for stem in self.index.keys() {
            let path = self.path_for_stem(stem);
            let modified = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.modified().map_err(|e| CacheError::io(&path, e))?,
                // Vanished underneath us; evict it first.
                Err(_) => SystemTime::UNIX_EPOCH,
            };
            if oldest.as_ref().is_none_or(|(t, _)| modified < *t) {
                oldest = Some((modified, stem.clone()));
            }
        }

        match oldest {
            Some((_, stem)) => {
                debug!(%stem, "evicting oldest disk entry");
                Ok(self.remove_stem(&stem).await)
            }
            None => Ok(false),
        }
    }

    /// Remove expired or unreadable files. Returns how many were removed.
    pub(crate) async fn remove_expired(&mut self, ttl: Duration) -> usize {
        let now_ms = infergrid_core::epoch_millis();
        let stems: Vec<String> = self.index.keys().cloned().collect();
        let mut removed = 0;

        for stem in stems {
            let path = self.path_for_stem(&stem);
            let expired = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<DiskRecord>(&bytes) {
                    Ok(record) => is_expired_at(record.timestamp, now_ms, ttl),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cache file corrupt, dropping");
                        true
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cache file unreadable, dropping");
                    true
                }
            };
            if expired && self.remove_stem(&stem).await {
                removed += 1;
            }
        }
        removed
    }

    pub(crate) async fn clear(&mut self) {
        let stems: Vec<String> = self.index.keys().cloned().collect();
        for stem in stems {
            self.remove_stem(&stem).await;
        }
    }
}

fn json_stem(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}
