//! Record cache so repeated runs skip keys that were already fetched.
//!
//! Epistemic foundation:
//! - K_i: A cached record for a key is the record the source returned for it
//! - B_i: A cache file may be missing or unreadable → treated as a miss
//! - I^B: Crash during write → temp file + rename, never a torn entry

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::models::{HarvestError, Record, Result};

/// Cache hit/miss counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

/// Keyed record cache consulted before fetching.
pub trait RecordCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Record>;

    fn put(&self, key: &str, record: &Record) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn stats(&self) -> CacheStats;
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn observe<T>(&self, found: Option<T>) -> Option<T> {
        match found {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

/// In-memory cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    records: DashMap<String, Record>,
    counters: Counters,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Record> {
        self.counters
            .observe(self.records.get(key).map(|r| r.value().clone()))
    }

    fn put(&self, key: &str, record: &Record) -> Result<()> {
        self.records.insert(key.to_string(), record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.records.clear();
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.records.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }
}

/// One JSON file per key, named by the SHA-256 of the key.
#[derive(Debug)]
pub struct DiskCache {
    dir: PathBuf,
    counters: Counters,
}

impl DiskCache {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| HarvestError::io("creating cache dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            counters: Counters::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{:x}.json", digest))
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.dir.join("*.json");
        let files = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| HarvestError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(files)
    }

    fn read_entry(path: &Path) -> Option<Record> {
        let file = File::open(path).ok()?;
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable cache entry, ignoring");
                None
            }
        }
    }
}

impl RecordCache for DiskCache {
    fn get(&self, key: &str) -> Option<Record> {
        let found = Self::read_entry(&self.path_for(key));
        if found.is_some() {
            debug!(key = %key, "Cache hit");
        }
        self.counters.observe(found)
    }

    fn put(&self, key: &str, record: &Record) -> Result<()> {
        let path = self.path_for(key);
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        let file =
            File::create(&temp_path).map_err(|e| HarvestError::io("creating cache entry", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record)
            .map_err(|e| HarvestError::Internal(format!("Serializing cache entry: {e}")))?;
        writer
            .flush()
            .map_err(|e| HarvestError::io("flushing cache entry", e))?;

        fs::rename(&temp_path, &path).map_err(|e| HarvestError::io("renaming cache entry", e))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        for path in self.entry_files()? {
            fs::remove_file(&path).map_err(|e| HarvestError::io("removing cache entry", e))?;
        }
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entry_files().map(|f| f.len()).unwrap_or(0),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record_from;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Record {
        record_from([("id", json!("32001")), ("name", json!("Acme Supply"))])
    }

    #[test]
    fn test_memory_cache_hits_and_misses() {
        let cache = MemoryCache::new();
        assert!(cache.get("32001").is_none());
        cache.put("32001", &sample()).unwrap();
        assert_eq!(cache.get("32001"), Some(sample()));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_disk_cache_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = DiskCache::new(dir.path()).unwrap();
            cache.put("32001", &sample()).unwrap();
            cache.put("key/with spaces", &sample()).unwrap();
        }

        let cache = DiskCache::new(dir.path()).unwrap();
        assert_eq!(cache.get("32001"), Some(sample()));
        assert_eq!(cache.get("key/with spaces"), Some(sample()));
        assert_eq!(cache.stats().entries, 2);

        cache.clear().unwrap();
        assert!(cache.get("32001").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_disk_cache_ignores_corrupt_entry() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path()).unwrap();
        fs::write(cache.path_for("bad"), "{ not json").unwrap();
        assert!(cache.get("bad").is_none());
    }
}
