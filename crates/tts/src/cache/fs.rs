//! Filesystem tier
//!
//! Blobs are stored under their key hex next to a `metadata.json` sidecar
//! mapping key -> {written_at, last_accessed, size}. Eviction is LRU by
//! last access once the byte cap is exceeded; the cap can be overshot by
//! at most the one write in flight.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use voxcall_core::{Error, Result};

use super::{CacheKey, CacheTier, TierStats};

const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileMeta {
    written_at: i64,
    last_accessed: i64,
    size: u64,
}

pub struct FsTier {
    dir: PathBuf,
    max_bytes: u64,
    ttl: Duration,
    meta: Mutex<HashMap<String, FileMeta>>,
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

impl FsTier {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::CacheBackendUnavailable(format!("create {dir:?}: {e}")))?;

        let meta = Self::load_metadata(&dir);
        Ok(Self {
            dir,
            max_bytes,
            ttl,
            meta: Mutex::new(meta),
        })
    }

    fn load_metadata(dir: &Path) -> HashMap<String, FileMeta> {
        let path = dir.join(METADATA_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "cache metadata unreadable, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    fn save_metadata(&self, meta: &HashMap<String, FileMeta>) {
        let path = self.dir.join(METADATA_FILE);
        match serde_json::to_vec(meta) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes) {
                    tracing::warn!(error = %e, "failed to persist cache metadata");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode cache metadata"),
        }
    }

    fn blob_path(&self, key_hex: &str) -> PathBuf {
        self.dir.join(key_hex)
    }

    fn remove_blob(&self, key_hex: &str) {
        let path = self.blob_path(key_hex);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, path = %path.display(), "failed to remove cache blob");
            }
        }
    }

    /// Evict least-recently-accessed entries until the total is within
    /// the byte cap. The entry just written is protected so a fresh write
    /// can overshoot the cap by at most itself. Caller holds the metadata
    /// lock.
    fn enforce_size_cap(&self, meta: &mut HashMap<String, FileMeta>, protect: Option<&str>) {
        let mut total: u64 = meta.values().map(|m| m.size).sum();
        if total <= self.max_bytes {
            return;
        }

        let mut by_access: Vec<(String, i64, u64)> = meta
            .iter()
            .filter(|(k, _)| protect != Some(k.as_str()))
            .map(|(k, m)| (k.clone(), m.last_accessed, m.size))
            .collect();
        by_access.sort_by_key(|&(_, accessed, _)| accessed);

        for (key, _, size) in by_access {
            if total <= self.max_bytes {
                break;
            }
            self.remove_blob(&key);
            meta.remove(&key);
            total = total.saturating_sub(size);
        }
    }

    /// Drop expired entries and re-enforce the byte cap. Called by the
    /// periodic sweep; expiry is additionally observed on every `get`.
    pub fn purge(&self) -> usize {
        let now = now_epoch();
        let ttl_s = self.ttl.as_secs() as i64;
        let mut meta = self.meta.lock();

        let expired: Vec<String> = meta
            .iter()
            .filter(|(_, m)| now - m.written_at > ttl_s)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            self.remove_blob(key);
            meta.remove(key);
        }

        self.enforce_size_cap(&mut meta, None);
        self.save_metadata(&meta);
        expired.len()
    }

    /// Spawn the hourly-ish cleanup loop. Exits when the stop signal
    /// flips to true.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.purge();
                        if removed > 0 {
                            tracing::debug!(removed, "filesystem cache sweep");
                        }
                    }
                    result = stop.changed() => {
                        if result.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl CacheTier for FsTier {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let key_hex = key.as_hex().to_string();
        let now = now_epoch();
        let ttl_s = self.ttl.as_secs() as i64;

        {
            let mut meta = self.meta.lock();
            match meta.get(&key_hex) {
                None => return Ok(None),
                Some(m) if now - m.written_at > ttl_s => {
                    self.remove_blob(&key_hex);
                    meta.remove(&key_hex);
                    self.save_metadata(&meta);
                    return Ok(None);
                }
                Some(_) => {}
            }
        }

        let data = match fs::read(self.blob_path(&key_hex)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut meta = self.meta.lock();
                meta.remove(&key_hex);
                self.save_metadata(&meta);
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::CacheBackendUnavailable(format!(
                    "read {key_hex}: {e}"
                )))
            }
        };

        let mut meta = self.meta.lock();
        if let Some(m) = meta.get_mut(&key_hex) {
            m.last_accessed = now;
        }
        self.save_metadata(&meta);

        Ok(Some(data))
    }

    async fn set(&self, key: &CacheKey, value: &[u8]) -> Result<()> {
        let key_hex = key.as_hex().to_string();

        fs::write(self.blob_path(&key_hex), value)
            .map_err(|e| Error::CacheBackendUnavailable(format!("write {key_hex}: {e}")))?;

        let now = now_epoch();
        let mut meta = self.meta.lock();
        meta.insert(
            key_hex.clone(),
            FileMeta {
                written_at: now,
                last_accessed: now,
                size: value.len() as u64,
            },
        );
        self.enforce_size_cap(&mut meta, Some(&key_hex));
        self.save_metadata(&meta);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let key_hex = key.as_hex().to_string();
        let mut meta = self.meta.lock();
        let existed = meta.remove(&key_hex).is_some();
        if existed {
            self.remove_blob(&key_hex);
            self.save_metadata(&meta);
        }
        Ok(existed)
    }

    async fn clear(&self) -> Result<usize> {
        let mut meta = self.meta.lock();
        let count = meta.len();
        for key in meta.keys() {
            self.remove_blob(key);
        }
        meta.clear();
        self.save_metadata(&meta);
        Ok(count)
    }

    async fn stats(&self) -> TierStats {
        let meta = self.meta.lock();
        TierStats {
            name: "filesystem",
            entries: meta.len(),
            bytes: meta.values().map(|m| m.size).sum(),
            healthy: self.dir.exists(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key(text: &str) -> CacheKey {
        CacheKey::compute(text, "p", None, 1.0, &BTreeMap::new())
    }

    #[tokio::test]
    async fn round_trip_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FsTier::new(dir.path(), 1024 * 1024, Duration::from_secs(60)).unwrap();

        tier.set(&key("a"), b"audio bytes").await.unwrap();
        assert_eq!(tier.get(&key("a")).await.unwrap().unwrap(), b"audio bytes");

        // Blob named by key hex, sidecar present.
        assert!(dir.path().join(key("a").as_hex()).exists());
        assert!(dir.path().join(METADATA_FILE).exists());
    }

    #[tokio::test]
    async fn metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tier = FsTier::new(dir.path(), 1024, Duration::from_secs(60)).unwrap();
            tier.set(&key("persist"), b"kept").await.unwrap();
        }

        let reopened = FsTier::new(dir.path(), 1024, Duration::from_secs(60)).unwrap();
        assert_eq!(
            reopened.get(&key("persist")).await.unwrap().unwrap(),
            b"kept"
        );
    }

    #[tokio::test]
    async fn size_cap_evicts_least_recently_accessed() {
        let dir = tempfile::tempdir().unwrap();
        // Cap fits two 40-byte blobs but not three.
        let tier = FsTier::new(dir.path(), 100, Duration::from_secs(60)).unwrap();

        tier.set(&key("a"), &[1u8; 40]).await.unwrap();
        tier.set(&key("b"), &[2u8; 40]).await.unwrap();

        // The write that overflows the cap evicts older entries, never
        // itself.
        tier.get(&key("a")).await.unwrap();
        tier.set(&key("c"), &[3u8; 40]).await.unwrap();

        let stats = tier.stats().await;
        assert!(stats.bytes <= 100);
        assert!(tier.get(&key("c")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_entries_vanish_on_access() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FsTier::new(dir.path(), 1024, Duration::from_secs(0)).unwrap();

        tier.set(&key("a"), b"old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(tier.get(&key("a")).await.unwrap().is_none());
        assert!(!dir.path().join(key("a").as_hex()).exists());
    }

    #[tokio::test]
    async fn purge_removes_expired_and_reports_count() {
        let dir = tempfile::tempdir().unwrap();
        let tier = Arc::new(FsTier::new(dir.path(), 1024, Duration::from_secs(0)).unwrap());

        tier.set(&key("a"), b"1").await.unwrap();
        tier.set(&key("b"), b"2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(tier.purge(), 2);
        assert_eq!(tier.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn clear_removes_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FsTier::new(dir.path(), 1024, Duration::from_secs(60)).unwrap();

        tier.set(&key("a"), b"1").await.unwrap();
        tier.set(&key("b"), b"2").await.unwrap();
        assert_eq!(tier.clear().await.unwrap(), 2);
        assert!(!dir.path().join(key("a").as_hex()).exists());
    }
}
