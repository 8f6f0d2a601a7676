//! Multi-tier audio cache
//!
//! Tier order is fastest first: memory, then the shared KV store, then the
//! filesystem. A hit in a slower tier is promoted to the faster ones in
//! the background; the returning `get` never waits for promotion.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use voxcall_core::Result;

mod fs;
mod kv;
mod memory;

pub use fs::FsTier;
pub use kv::{KvTier, MemoryKv, SharedKv};
pub use memory::MemoryTier;

/// Content address of one synthesis result.
///
/// SHA-256 over the canonical parameter string
/// `text|provider|voice|speed|k1=v1|k2=v2...` with extras sorted by key.
/// The voice component is included verbatim, so style instructions and
/// voice ids can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(
        text: &str,
        provider: &str,
        voice: Option<&str>,
        speed: f32,
        extras: &BTreeMap<String, String>,
    ) -> Self {
        let mut canonical = format!("{}|{}|{}|{}", text, provider, voice.unwrap_or(""), speed);
        for (key, value) in extras {
            canonical.push('|');
            canonical.push_str(key);
            canonical.push('=');
            canonical.push_str(value);
        }

        let digest = Sha256::digest(canonical.as_bytes());
        Self(hex::encode(digest))
    }

    /// Hex digest; doubles as the filesystem blob name
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-tier statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct TierStats {
    pub name: &'static str,
    pub entries: usize,
    pub bytes: u64,
    pub healthy: bool,
}

/// One storage tier.
///
/// Implementations are safe under concurrent access; a failing backend
/// returns `CacheBackendUnavailable` and the tiered cache skips it.
#[async_trait]
pub trait CacheTier: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &CacheKey, value: &[u8]) -> Result<()>;

    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// Remove every entry; returns how many were removed.
    async fn clear(&self) -> Result<usize>;

    async fn stats(&self) -> TierStats;
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub gets: u64,
    pub sets: u64,
    pub hits: u64,
    pub misses: u64,
    pub tier_hits: HashMap<&'static str, u64>,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.gets == 0 {
            0.0
        } else {
            self.hits as f64 / self.gets as f64
        }
    }
}

/// The tier stack.
pub struct TieredCache {
    tiers: Vec<Arc<dyn CacheTier>>,
    stats: Mutex<CacheStats>,
}

impl TieredCache {
    pub fn new(tiers: Vec<Arc<dyn CacheTier>>) -> Self {
        Self {
            tiers,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Probe tiers in order. On a hit the value is promoted to every
    /// faster tier in a background task.
    pub async fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.stats.lock().gets += 1;

        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some(value)) => {
                    {
                        let mut stats = self.stats.lock();
                        stats.hits += 1;
                        *stats.tier_hits.entry(tier.name()).or_insert(0) += 1;
                    }

                    if index > 0 {
                        self.promote(key.clone(), value.clone(), index);
                    }
                    return Some(value);
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(tier = tier.name(), error = %e, "cache tier get failed");
                    continue;
                }
            }
        }

        self.stats.lock().misses += 1;
        None
    }

    /// Write to every tier. Tier failures are logged, not propagated.
    pub async fn set(&self, key: &CacheKey, value: &[u8]) {
        self.stats.lock().sets += 1;

        for tier in &self.tiers {
            if let Err(e) = tier.set(key, value).await {
                tracing::warn!(tier = tier.name(), error = %e, "cache tier set failed");
            }
        }
    }

    pub async fn delete(&self, key: &CacheKey) -> bool {
        let mut deleted = false;
        for tier in &self.tiers {
            match tier.delete(key).await {
                Ok(d) => deleted |= d,
                Err(e) => {
                    tracing::warn!(tier = tier.name(), error = %e, "cache tier delete failed");
                }
            }
        }
        deleted
    }

    /// Clear all tiers; returns entries removed from the largest tier.
    pub async fn clear(&self) -> usize {
        let mut max_removed = 0;
        for tier in &self.tiers {
            match tier.clear().await {
                Ok(removed) => max_removed = max_removed.max(removed),
                Err(e) => {
                    tracing::warn!(tier = tier.name(), error = %e, "cache tier clear failed");
                }
            }
        }
        max_removed
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    pub async fn tier_stats(&self) -> Vec<TierStats> {
        let mut out = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            out.push(tier.stats().await);
        }
        out
    }

    /// Fire-and-forget copy of a hit into every faster tier. Promotion is
    /// an idempotent `set`: values are content-addressed, so concurrent
    /// promotions of the same key are harmless.
    fn promote(&self, key: CacheKey, value: Vec<u8>, found_at: usize) {
        let faster: Vec<Arc<dyn CacheTier>> = self.tiers[..found_at].to_vec();
        tokio::spawn(async move {
            for tier in faster {
                if let Err(e) = tier.set(&key, &value).await {
                    tracing::debug!(tier = tier.name(), error = %e, "cache promotion failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn extras(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn key_is_deterministic() {
        let a = CacheKey::compute("hello", "cloud", Some("nova"), 1.0, &extras(&[]));
        let b = CacheKey::compute("hello", "cloud", Some("nova"), 1.0, &extras(&[]));
        assert_eq!(a, b);
        assert_eq!(a.as_hex().len(), 64);
    }

    #[test]
    fn key_changes_with_every_component() {
        let base = CacheKey::compute("hello", "cloud", Some("nova"), 1.0, &extras(&[]));

        assert_ne!(
            base,
            CacheKey::compute("hello!", "cloud", Some("nova"), 1.0, &extras(&[]))
        );
        assert_ne!(
            base,
            CacheKey::compute("hello", "other", Some("nova"), 1.0, &extras(&[]))
        );
        assert_ne!(
            base,
            CacheKey::compute("hello", "cloud", Some("echo"), 1.0, &extras(&[]))
        );
        assert_ne!(
            base,
            CacheKey::compute("hello", "cloud", Some("nova"), 1.25, &extras(&[]))
        );
        assert_ne!(
            base,
            CacheKey::compute("hello", "cloud", Some("nova"), 1.0, &extras(&[("pitch", "2")]))
        );
    }

    #[test]
    fn extras_order_does_not_matter() {
        let a = CacheKey::compute("t", "p", None, 1.0, &extras(&[("a", "1"), ("b", "2")]));
        let b = CacheKey::compute("t", "p", None, 1.0, &extras(&[("b", "2"), ("a", "1")]));
        assert_eq!(a, b);
    }

    #[test]
    fn styled_voice_never_collides_with_id() {
        let id = CacheKey::compute("t", "p", Some("nova"), 1.0, &extras(&[]));
        let style = CacheKey::compute("t", "p", Some("calm and warm"), 1.0, &extras(&[]));
        assert_ne!(id, style);
    }

    // Memory tier only: set then get round-trips and stats add up.
    #[tokio::test]
    async fn memory_only_round_trip() {
        let cache = TieredCache::new(vec![Arc::new(MemoryTier::new(
            100,
            Duration::from_secs(3600),
        ))]);

        let key = CacheKey::compute("k", "p", None, 1.0, &BTreeMap::new());
        let value = vec![0xAA; 100];
        cache.set(&key, &value).await;

        let got = cache.get(&key).await.unwrap();
        assert_eq!(got.len(), 100);
        assert!(got.iter().all(|&b| b == 0xAA));

        let stats = cache.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.tier_hits.get("memory"), Some(&1));
        assert!((stats.hit_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn miss_is_counted() {
        let cache = TieredCache::new(vec![Arc::new(MemoryTier::new(
            10,
            Duration::from_secs(60),
        ))]);
        let key = CacheKey::compute("missing", "p", None, 1.0, &BTreeMap::new());

        assert!(cache.get(&key).await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn lower_tier_hit_promotes_to_memory() {
        let memory = Arc::new(MemoryTier::new(10, Duration::from_secs(60)));
        let kv = Arc::new(KvTier::new(
            Arc::new(MemoryKv::new()),
            "tts:",
            Duration::from_secs(60),
        ));

        let key = CacheKey::compute("promoted", "p", None, 1.0, &BTreeMap::new());
        kv.set(&key, b"audio").await.unwrap();

        let cache = TieredCache::new(vec![memory.clone(), kv]);
        assert_eq!(cache.get(&key).await.unwrap(), b"audio");

        // Promotion is async; poll until the memory tier holds the value.
        for _ in 0..50 {
            if memory.get(&key).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(memory.get(&key).await.unwrap().unwrap(), b"audio");
    }
}
