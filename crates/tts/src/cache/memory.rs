//! In-process LRU tier

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use voxcall_core::Result;

use super::{CacheKey, CacheTier, TierStats};

struct MemoryEntry {
    data: Vec<u8>,
    /// Refreshed on every access; drives both TTL and LRU eviction
    touched: Instant,
}

/// Bounded in-memory tier. Lock sharding comes from the underlying map.
pub struct MemoryTier {
    entries: DashMap<String, MemoryEntry>,
    max_entries: usize,
    ttl: Duration,
}

impl MemoryTier {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            ttl,
        }
    }

    /// Drop the least recently touched entry. Linear scan is fine at the
    /// configured sizes (default 100 entries).
    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().touched)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Remove entries past their TTL; used by tests and periodic sweeps.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.touched.elapsed() <= ttl);
        before - self.entries.len()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        // Expiration is observed on access, not just by sweeps.
        let expired = match self.entries.get(key.as_hex()) {
            Some(entry) => entry.touched.elapsed() > self.ttl,
            None => return Ok(None),
        };

        if expired {
            self.entries.remove(key.as_hex());
            return Ok(None);
        }

        let mut entry = match self.entries.get_mut(key.as_hex()) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        entry.touched = Instant::now();
        Ok(Some(entry.data.clone()))
    }

    async fn set(&self, key: &CacheKey, value: &[u8]) -> Result<()> {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key.as_hex()) {
            self.evict_oldest();
        }

        self.entries.insert(
            key.as_hex().to_string(),
            MemoryEntry {
                data: value.to_vec(),
                touched: Instant::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entries.remove(key.as_hex()).is_some())
    }

    async fn clear(&self) -> Result<usize> {
        let count = self.entries.len();
        self.entries.clear();
        Ok(count)
    }

    async fn stats(&self) -> TierStats {
        TierStats {
            name: "memory",
            entries: self.entries.len(),
            bytes: self
                .entries
                .iter()
                .map(|entry| entry.value().data.len() as u64)
                .sum(),
            healthy: true,
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
    async fn round_trip() {
        let tier = MemoryTier::new(10, Duration::from_secs(60));
        tier.set(&key("a"), b"one").await.unwrap();
        assert_eq!(tier.get(&key("a")).await.unwrap().unwrap(), b"one");
        assert!(tier.get(&key("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eviction_drops_least_recently_used() {
        let tier = MemoryTier::new(2, Duration::from_secs(60));
        tier.set(&key("a"), b"1").await.unwrap();
        tier.set(&key("b"), b"2").await.unwrap();

        // Touch "a" so "b" becomes the eviction candidate.
        tier.get(&key("a")).await.unwrap();
        tier.set(&key("c"), b"3").await.unwrap();

        assert!(tier.get(&key("a")).await.unwrap().is_some());
        assert!(tier.get(&key("b")).await.unwrap().is_none());
        assert!(tier.get(&key("c")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expiry_observed_on_access() {
        let tier = MemoryTier::new(10, Duration::from_millis(10));
        tier.set(&key("a"), b"1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(tier.get(&key("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_removes_expired_entries() {
        let tier = MemoryTier::new(10, Duration::from_millis(10));
        tier.set(&key("a"), b"1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tier.purge_expired(), 1);
        assert_eq!(tier.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn overwrite_at_capacity_keeps_size() {
        let tier = MemoryTier::new(2, Duration::from_secs(60));
        tier.set(&key("a"), b"1").await.unwrap();
        tier.set(&key("b"), b"2").await.unwrap();
        tier.set(&key("a"), b"updated").await.unwrap();

        assert_eq!(tier.stats().await.entries, 2);
        assert_eq!(tier.get(&key("a")).await.unwrap().unwrap(), b"updated");
    }
}
