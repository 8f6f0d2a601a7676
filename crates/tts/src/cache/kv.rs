//! Shared KV tier
//!
//! The deployment's shared store (hash maps, TTL keys, pattern scans)
//! lives outside this workspace; the engine only depends on the
//! [`SharedKv`] seam. [`MemoryKv`] backs tests and single-node setups.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use voxcall_core::{Error, Result};

use super::{CacheKey, CacheTier, TierStats};

/// Minimal contract the engine needs from the shared store.
#[async_trait]
pub trait SharedKv: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set with a server-side TTL.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys matching `prefix*`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<()>;
}

/// In-process [`SharedKv`] implementation.
pub struct MemoryKv {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedKv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let expired = match self.entries.get(key) {
            Some(entry) => Instant::now() >= entry.value().1,
            None => return Ok(None),
        };
        if expired {
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|entry| entry.value().0.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Cache tier over a [`SharedKv`].
pub struct KvTier {
    kv: std::sync::Arc<dyn SharedKv>,
    prefix: String,
    ttl: Duration,
}

impl KvTier {
    pub fn new(kv: std::sync::Arc<dyn SharedKv>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            ttl,
        }
    }

    fn full_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key.as_hex())
    }

    fn backend_error(e: Error) -> Error {
        match e {
            e @ Error::CacheBackendUnavailable(_) => e,
            other => Error::CacheBackendUnavailable(other.to_string()),
        }
    }
}

#[async_trait]
impl CacheTier for KvTier {
    fn name(&self) -> &'static str {
        "kv"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        self.kv
            .get(&self.full_key(key))
            .await
            .map_err(Self::backend_error)
    }

    async fn set(&self, key: &CacheKey, value: &[u8]) -> Result<()> {
        self.kv
            .set_with_ttl(&self.full_key(key), value, self.ttl)
            .await
            .map_err(Self::backend_error)
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.kv
            .delete(&self.full_key(key))
            .await
            .map_err(Self::backend_error)
    }

    async fn clear(&self) -> Result<usize> {
        let keys = self
            .kv
            .scan_prefix(&self.prefix)
            .await
            .map_err(Self::backend_error)?;

        let mut removed = 0;
        for key in &keys {
            if self.kv.delete(key).await.map_err(Self::backend_error)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> TierStats {
        let (entries, healthy) = match self.kv.scan_prefix(&self.prefix).await {
            Ok(keys) => (keys.len(), self.kv.ping().await.is_ok()),
            Err(_) => (0, false),
        };

        TierStats {
            name: "kv",
            entries,
            bytes: 0,
            healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn key(text: &str) -> CacheKey {
        CacheKey::compute(text, "p", None, 1.0, &BTreeMap::new())
    }

    #[tokio::test]
    async fn round_trip_with_prefix() {
        let kv = Arc::new(MemoryKv::new());
        let tier = KvTier::new(kv.clone(), "tts:", Duration::from_secs(60));

        tier.set(&key("a"), b"audio").await.unwrap();
        assert_eq!(tier.get(&key("a")).await.unwrap().unwrap(), b"audio");

        // The raw store sees the prefixed key.
        let raw_keys = kv.scan_prefix("tts:").await.unwrap();
        assert_eq!(raw_keys.len(), 1);
        assert!(raw_keys[0].starts_with("tts:"));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let tier = KvTier::new(Arc::new(MemoryKv::new()), "tts:", Duration::from_millis(10));
        tier.set(&key("a"), b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(tier.get(&key("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_only_touches_prefixed_keys() {
        let kv = Arc::new(MemoryKv::new());
        kv.set_with_ttl("other:key", b"keep", Duration::from_secs(60))
            .await
            .unwrap();

        let tier = KvTier::new(kv.clone(), "tts:", Duration::from_secs(60));
        tier.set(&key("a"), b"1").await.unwrap();
        tier.set(&key("b"), b"2").await.unwrap();

        assert_eq!(tier.clear().await.unwrap(), 2);
        assert_eq!(kv.get("other:key").await.unwrap().unwrap(), b"keep");
    }
}
