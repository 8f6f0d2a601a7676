//! Pre-warmed provider pools
//!
//! One pool per (provider, voice). Entries are exclusive while checked
//! out, cool down on return, and expire on idle TTL. A maintenance pass
//! keeps each pool inside its size bounds and recycles errored entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use voxcall_config::PoolSettings;
use voxcall_core::{Error, Result};

use crate::provider::TtsProvider;

/// Creates a fresh provider instance for a pool entry.
pub type ProviderFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn TtsProvider>> + Send + Sync>;

/// Lifecycle of one pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Initializing,
    Available,
    InUse,
    CoolingDown,
    Error,
    Terminated,
}

struct PoolEntry {
    provider: Arc<dyn TtsProvider>,
    status: EntryStatus,
    created_at: Instant,
    last_used_at: Instant,
    /// Set while cooling down; promotion happens when it elapses
    cooldown_until: Option<Instant>,
    usage_count: u64,
    error_count: u64,
    current_session_id: Option<String>,
}

impl PoolEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_used_at.elapsed() > ttl
    }
}

/// Public view of an entry, for stats and debugging.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub id: String,
    pub status: EntryStatus,
    pub age: Duration,
    pub idle: Duration,
    pub usage_count: u64,
    pub error_count: u64,
    pub current_session_id: Option<String>,
}

/// A checked-out provider handed out by the [`PoolManager`]. Return it
/// with [`PoolCheckout::release`]; the entry stays `InUse` (and invisible
/// to other callers) until then.
pub struct PoolCheckout {
    pool: Arc<ProviderPool>,
    entry_id: String,
    provider: Arc<dyn TtsProvider>,
}

impl PoolCheckout {
    pub fn provider(&self) -> &Arc<dyn TtsProvider> {
        &self.provider
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    /// Give the entry back. `failed` routes it through `Error` instead of
    /// the cool-down path.
    pub fn release(self, failed: bool) {
        self.pool.give_back(&self.entry_id, failed);
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub request_count: u64,
    pub checkout_count: u64,
    pub checkout_failures: u64,
    pub creation_failures: u64,
    pub provider_errors: u64,
    pub pool_expansions: u64,
    pub pool_contractions: u64,
    pub avg_checkout_latency_ms: f64,
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
    pub utilisation: f64,
}

struct PoolState {
    entries: HashMap<String, PoolEntry>,
    /// Entries being created outside the lock; counted into size so
    /// concurrent checkouts cannot overshoot `max`.
    creating: usize,
    request_count: u64,
    checkout_count: u64,
    checkout_failures: u64,
    creation_failures: u64,
    provider_errors: u64,
    pool_expansions: u64,
    pool_contractions: u64,
    checkout_latencies_ms: Vec<f64>,
}

impl PoolState {
    fn size(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status != EntryStatus::Terminated)
            .count()
            + self.creating
    }

    fn count(&self, status: EntryStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }

    fn record_latency(&mut self, ms: f64) {
        self.checkout_latencies_ms.push(ms);
        if self.checkout_latencies_ms.len() > 100 {
            let excess = self.checkout_latencies_ms.len() - 100;
            self.checkout_latencies_ms.drain(..excess);
        }
    }

    /// Promote cooled-down entries whose timer elapsed; expired ones are
    /// terminated instead.
    fn promote_cooled(&mut self, ttl: Duration) {
        let now = Instant::now();
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.status == EntryStatus::CoolingDown
                    && e.cooldown_until.is_some_and(|until| now >= until)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let expired = self
                .entries
                .get(&id)
                .map(|e| e.is_expired(ttl))
                .unwrap_or(false);
            if expired {
                self.entries.remove(&id);
            } else if let Some(entry) = self.entries.get_mut(&id) {
                entry.status = EntryStatus::Available;
                entry.cooldown_until = None;
            }
        }
    }
}

/// Pool of pre-warmed provider instances for one (provider, voice) pair.
pub struct ProviderPool {
    provider_name: String,
    voice_id: String,
    settings: PoolSettings,
    factory: ProviderFactory,
    state: Mutex<PoolState>,
}

impl ProviderPool {
    /// Create the pool and eagerly warm up `warm_up` entries, health
    /// checking each. Instances that fail the check land in `Error`
    /// without consuming an available slot.
    pub async fn new(
        provider_name: impl Into<String>,
        voice_id: impl Into<String>,
        settings: PoolSettings,
        factory: ProviderFactory,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            provider_name: provider_name.into(),
            voice_id: voice_id.into(),
            settings,
            factory,
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                creating: 0,
                request_count: 0,
                checkout_count: 0,
                checkout_failures: 0,
                creation_failures: 0,
                provider_errors: 0,
                pool_expansions: 0,
                pool_contractions: 0,
                checkout_latencies_ms: Vec::new(),
            }),
        });

        for _ in 0..pool.settings.warm_up {
            if let Err(e) = pool.create_entry(EntryStatus::Available).await {
                tracing::warn!(
                    provider = %pool.provider_name,
                    voice = %pool.voice_id,
                    error = %e,
                    "pool warm-up entry failed"
                );
            }
        }

        pool
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.provider_name, self.voice_id)
    }

    fn cool_down(&self) -> Duration {
        Duration::from_secs(self.settings.cool_down_s)
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.settings.ttl_s)
    }

    /// Instantiate, health check, and register one entry in the given
    /// initial status (`InUse` when the creator claims it directly, so no
    /// concurrent checkout can steal it between insert and claim).
    /// Instances failing the health check land in `Error`.
    async fn create_entry(&self, initial: EntryStatus) -> Result<(String, Arc<dyn TtsProvider>)> {
        let provider = match (self.factory)(&self.provider_name) {
            Ok(p) => p,
            Err(e) => {
                self.state.lock().creation_failures += 1;
                return Err(e);
            }
        };

        let report = provider.health_check().await;
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        let healthy = report.is_healthy();
        let status = if healthy {
            initial
        } else {
            tracing::warn!(
                provider = %self.provider_name,
                detail = ?report.detail,
                "new pool entry failed health check"
            );
            EntryStatus::Error
        };

        let mut state = self.state.lock();
        state.entries.insert(
            id.clone(),
            PoolEntry {
                provider: Arc::clone(&provider),
                status,
                created_at: now,
                last_used_at: now,
                cooldown_until: None,
                usage_count: 0,
                error_count: 0,
                current_session_id: None,
            },
        );
        if !healthy {
            state.provider_errors += 1;
            return Err(Error::ProviderUnavailable(format!(
                "{} failed warm-up health check",
                self.key()
            )));
        }
        Ok((id, provider))
    }

    /// Check out an available entry. Never waits for an in-use entry:
    /// grows the pool synchronously when below `max`, otherwise returns
    /// `PoolExhausted`.
    pub async fn checkout(&self) -> Result<(String, Arc<dyn TtsProvider>)> {
        let started = Instant::now();

        enum Plan {
            Use(String, Arc<dyn TtsProvider>),
            Create,
            Exhausted,
        }

        let plan = {
            let mut state = self.state.lock();
            let state = &mut *state;
            state.request_count += 1;
            state.promote_cooled(self.ttl());

            let claimed = state
                .entries
                .iter_mut()
                .find(|(_, e)| e.status == EntryStatus::Available)
                .map(|(id, entry)| {
                    entry.status = EntryStatus::InUse;
                    entry.usage_count += 1;
                    entry.last_used_at = Instant::now();
                    (id.clone(), Arc::clone(&entry.provider))
                });

            match claimed {
                Some((id, provider)) => {
                    state.checkout_count += 1;
                    let latency = started.elapsed().as_secs_f64() * 1000.0;
                    state.record_latency(latency);
                    Plan::Use(id, provider)
                }
                None if state.size() < self.settings.max => {
                    state.creating += 1;
                    Plan::Create
                }
                None => {
                    state.checkout_failures += 1;
                    Plan::Exhausted
                }
            }
        };

        match plan {
            Plan::Use(id, provider) => Ok((id, provider)),
            Plan::Exhausted => Err(Error::PoolExhausted(self.key())),
            Plan::Create => {
                let created = self.create_entry(EntryStatus::InUse).await;
                let mut state = self.state.lock();
                state.creating -= 1;

                let (id, provider) = match created {
                    Ok(pair) => pair,
                    Err(e) => {
                        state.checkout_failures += 1;
                        return Err(e);
                    }
                };

                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.usage_count += 1;
                }
                state.checkout_count += 1;
                state.pool_expansions += 1;
                let latency = started.elapsed().as_secs_f64() * 1000.0;
                state.record_latency(latency);
                Ok((id, provider))
            }
        }
    }

    /// Return an entry. Failed entries go to `Error` for the maintenance
    /// pass to recycle; healthy ones cool down before becoming available
    /// again.
    pub fn give_back(&self, entry_id: &str, failed: bool) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(entry_id) else {
            tracing::warn!(entry = entry_id, "returned unknown pool entry");
            return;
        };
        if entry.status != EntryStatus::InUse {
            tracing::warn!(entry = entry_id, status = ?entry.status, "returned entry not in use");
            return;
        }

        entry.last_used_at = Instant::now();
        entry.current_session_id = None;
        if failed {
            entry.status = EntryStatus::Error;
            entry.error_count += 1;
            state.provider_errors += 1;
        } else {
            entry.status = EntryStatus::CoolingDown;
            entry.cooldown_until = Some(Instant::now() + self.cool_down());
        }
    }

    /// Attach a session id to a checked-out entry (incremental synthesis).
    pub fn bind_session(&self, entry_id: &str, session_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| Error::SessionNotFound(entry_id.to_string()))?;
        if entry.status != EntryStatus::InUse {
            return Err(Error::InvalidInput(format!(
                "entry {entry_id} is not checked out"
            )));
        }
        entry.current_session_id = Some(session_id.to_string());
        Ok(())
    }

    /// One maintenance pass: promote cooled entries, expire idle ones,
    /// scale with utilisation, contract surplus, recycle errors, and
    /// restore the minimum size.
    pub async fn run_maintenance(&self) {
        let ttl = self.ttl();

        let to_create = {
            let mut state = self.state.lock();
            state.promote_cooled(ttl);

            // (a) expired idle entries are terminated
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| {
                    matches!(
                        e.status,
                        EntryStatus::Available | EntryStatus::CoolingDown
                    ) && e.is_expired(ttl)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                state.entries.remove(id);
            }

            // (d) errored entries are terminated; future checkouts recreate
            let errored: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.status == EntryStatus::Error)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &errored {
                state.entries.remove(id);
            }

            // (c) contract surplus availability down to min, oldest idle first
            let size = state.size();
            let available = state.count(EntryStatus::Available);
            if available > 1 && size > self.settings.min {
                let surplus = (size - self.settings.min).min(available - 1);
                let mut idle: Vec<(String, Instant)> = state
                    .entries
                    .iter()
                    .filter(|(_, e)| e.status == EntryStatus::Available)
                    .map(|(id, e)| (id.clone(), e.last_used_at))
                    .collect();
                idle.sort_by_key(|&(_, used)| used);
                for (id, _) in idle.into_iter().take(surplus) {
                    state.entries.remove(&id);
                    state.pool_contractions += 1;
                }
            }

            // (b) scale up under load, and restore the floor after expiry
            let size = state.size();
            let in_use = state.count(EntryStatus::InUse);
            let utilisation = if size > 0 {
                in_use as f64 / size as f64
            } else {
                1.0
            };

            let mut to_create = 0usize;
            if size < self.settings.min {
                to_create = self.settings.min - size;
            } else if utilisation >= self.settings.scaling_threshold && size < self.settings.max {
                to_create = 1;
            }
            state.creating += to_create;
            to_create
        };

        for _ in 0..to_create {
            let result = self.create_entry(EntryStatus::Available).await;
            let mut state = self.state.lock();
            state.creating -= 1;
            match result {
                Ok(_) => state.pool_expansions += 1,
                Err(e) => {
                    tracing::warn!(pool = %self.key(), error = %e, "maintenance expansion failed")
                }
            }
        }
    }

    /// Spawn the periodic maintenance loop.
    pub fn spawn_maintenance(
        self: Arc<Self>,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_maintenance().await,
                    result = stop.changed() => {
                        if result.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Terminate everything, in-use entries included.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
    }

    pub fn entries(&self) -> Vec<EntryInfo> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .map(|(id, e)| EntryInfo {
                id: id.clone(),
                status: e.status,
                age: e.created_at.elapsed(),
                idle: e.last_used_at.elapsed(),
                usage_count: e.usage_count,
                error_count: e.error_count,
                current_session_id: e.current_session_id.clone(),
            })
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let size = state.size();
        let in_use = state.count(EntryStatus::InUse);
        let avg = if state.checkout_latencies_ms.is_empty() {
            0.0
        } else {
            state.checkout_latencies_ms.iter().sum::<f64>()
                / state.checkout_latencies_ms.len() as f64
        };

        PoolStats {
            request_count: state.request_count,
            checkout_count: state.checkout_count,
            checkout_failures: state.checkout_failures,
            creation_failures: state.creation_failures,
            provider_errors: state.provider_errors,
            pool_expansions: state.pool_expansions,
            pool_contractions: state.pool_contractions,
            avg_checkout_latency_ms: avg,
            size,
            available: state.count(EntryStatus::Available),
            in_use,
            utilisation: if size > 0 {
                in_use as f64 / size as f64
            } else {
                0.0
            },
        }
    }
}

/// All pools, keyed by `provider:voice`.
pub struct PoolManager {
    pools: DashMap<String, Arc<ProviderPool>>,
    settings: PoolSettings,
    factory: ProviderFactory,
    last_use: DashMap<String, Instant>,
}

impl PoolManager {
    pub fn new(settings: PoolSettings, factory: ProviderFactory) -> Self {
        Self {
            pools: DashMap::new(),
            settings,
            factory,
            last_use: DashMap::new(),
        }
    }

    fn pool_key(provider: &str, voice: &str) -> String {
        format!("{provider}:{voice}")
    }

    /// Fetch or lazily create (and warm) the pool for a pair.
    pub async fn pool(&self, provider: &str, voice: &str) -> Arc<ProviderPool> {
        let key = Self::pool_key(provider, voice);
        self.last_use.insert(key.clone(), Instant::now());

        if let Some(pool) = self.pools.get(&key) {
            return Arc::clone(&pool);
        }

        let pool = ProviderPool::new(
            provider.to_string(),
            voice.to_string(),
            self.settings.clone(),
            Arc::clone(&self.factory),
        )
        .await;

        // Another task may have created it meanwhile; first insert wins.
        self.pools
            .entry(key)
            .or_insert_with(|| Arc::clone(&pool))
            .clone()
    }

    pub async fn checkout(&self, provider: &str, voice: &str) -> Result<PoolCheckout> {
        let pool = self.pool(provider, voice).await;
        let (entry_id, provider) = pool.checkout().await?;
        Ok(PoolCheckout {
            pool,
            entry_id,
            provider,
        })
    }

    /// Try each provider in order until one yields an entry.
    pub async fn checkout_with_fallback(
        &self,
        providers: &[String],
        voice: &str,
    ) -> Result<PoolCheckout> {
        let mut last_error = Error::PoolExhausted(format!("no providers for voice {voice}"));
        for provider in providers {
            match self.checkout(provider, voice).await {
                Ok(checkout) => return Ok(checkout),
                Err(e) => {
                    tracing::debug!(provider = %provider, error = %e, "pool checkout failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Run maintenance across every pool.
    pub async fn run_maintenance(&self) {
        let pools: Vec<Arc<ProviderPool>> =
            self.pools.iter().map(|p| Arc::clone(p.value())).collect();
        for pool in pools {
            pool.run_maintenance().await;
        }
    }

    /// Drop pools that have not been used for `max_idle`.
    pub fn cleanup_unused_pools(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = self
            .last_use
            .iter()
            .filter(|entry| entry.value().elapsed() > max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in stale {
            if let Some((_, pool)) = self.pools.remove(&key) {
                pool.shutdown();
                removed += 1;
            }
            self.last_use.remove(&key);
        }
        removed
    }

    pub fn spawn_maintenance(
        self: Arc<Self>,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_maintenance().await,
                    result = stop.changed() => {
                        if result.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        for pool in self.pools.iter() {
            pool.value().shutdown();
        }
        self.pools.clear();
        self.last_use.clear();
    }

    pub fn stats(&self) -> HashMap<String, PoolStats> {
        self.pools
            .iter()
            .map(|p| (p.key().clone(), p.value().stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::NullTtsProvider;

    fn factory() -> ProviderFactory {
        Arc::new(|name: &str| {
            Ok(Arc::new(NullTtsProvider::new(name)) as Arc<dyn TtsProvider>)
        })
    }

    fn settings(min: usize, max: usize, warm_up: usize) -> PoolSettings {
        PoolSettings {
            min,
            max,
            warm_up,
            ttl_s: 3600,
            cool_down_s: 0,
            scaling_threshold: 0.7,
        }
    }

    #[tokio::test]
    async fn warm_up_creates_available_entries() {
        let pool = ProviderPool::new("p", "v", settings(1, 5, 2), factory()).await;
        let stats = pool.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.available, 2);
    }

    // Two concurrent checkouts grow to max, a third is refused, and
    // maintenance contracts back to min after returns.
    #[tokio::test]
    async fn grows_to_max_then_exhausts() {
        let pool = ProviderPool::new("p", "v", settings(1, 2, 1), factory()).await;

        let (id_a, _) = pool.checkout().await.unwrap();
        let (id_b, _) = pool.checkout().await.unwrap();
        assert_eq!(pool.stats().size, 2);
        assert_eq!(pool.stats().in_use, 2);

        let third = pool.checkout().await;
        assert!(matches!(third, Err(Error::PoolExhausted(_))));
        assert_eq!(pool.stats().checkout_failures, 1);

        pool.give_back(&id_a, false);
        pool.give_back(&id_b, false);
        assert_eq!(pool.stats().in_use, 0);

        // cool_down_s = 0: the maintenance pass promotes, then contracts.
        pool.run_maintenance().await;
        let stats = pool.stats();
        assert_eq!(stats.size, 1);
        assert!(stats.pool_contractions >= 1);
    }

    #[tokio::test]
    async fn checkout_ids_are_exclusive() {
        let pool = ProviderPool::new("p", "v", settings(1, 4, 4), factory()).await;

        let mut ids = Vec::new();
        for _ in 0..4 {
            let (id, _) = pool.checkout().await.unwrap();
            ids.push(id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn failed_return_goes_through_error_and_recycles() {
        let pool = ProviderPool::new("p", "v", settings(1, 2, 1), factory()).await;

        let (id, _) = pool.checkout().await.unwrap();
        pool.give_back(&id, true);

        let entries = pool.entries();
        let entry = entries.iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.status, EntryStatus::Error);

        // Maintenance terminates the errored entry and restores the floor.
        pool.run_maintenance().await;
        let stats = pool.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.available, 1);
        assert!(!pool.entries().iter().any(|e| e.id == id));
    }

    #[tokio::test]
    async fn cooldown_precedes_availability() {
        let mut s = settings(1, 2, 1);
        s.cool_down_s = 60;
        let pool = ProviderPool::new("p", "v", s, factory()).await;

        let (id, _) = pool.checkout().await.unwrap();
        pool.give_back(&id, false);

        let entries = pool.entries();
        assert_eq!(
            entries.iter().find(|e| e.id == id).unwrap().status,
            EntryStatus::CoolingDown
        );

        // Still cooling: the entry is not handed out, so the pool grows
        // instead.
        let (other, _) = pool.checkout().await.unwrap();
        assert_ne!(other, id);
    }

    #[tokio::test]
    async fn cooled_entry_becomes_available_again() {
        let pool = ProviderPool::new("p", "v", settings(1, 1, 1), factory()).await;

        let (id, _) = pool.checkout().await.unwrap();
        pool.give_back(&id, false);

        // cool_down_s = 0: the next checkout promotes and reuses it.
        let (again, _) = pool.checkout().await.unwrap();
        assert_eq!(again, id);
        pool.give_back(&again, false);
    }

    #[tokio::test]
    async fn maintenance_scales_up_under_load() {
        let pool = ProviderPool::new("p", "v", settings(1, 3, 1), factory()).await;

        // One entry, fully utilised.
        let (_held, _) = pool.checkout().await.unwrap();
        pool.run_maintenance().await;

        let stats = pool.stats();
        assert_eq!(stats.size, 2);
        assert!(stats.pool_expansions >= 1);
    }

    #[tokio::test]
    async fn session_binding_requires_checked_out_entry() {
        let pool = ProviderPool::new("p", "v", settings(1, 2, 1), factory()).await;

        let (id, _) = pool.checkout().await.unwrap();
        pool.bind_session(&id, "session-1").unwrap();
        assert_eq!(
            pool.entries()
                .iter()
                .find(|e| e.id == id)
                .unwrap()
                .current_session_id
                .as_deref(),
            Some("session-1")
        );

        pool.give_back(&id, false);
        assert!(pool.bind_session(&id, "session-2").is_err());
    }

    #[tokio::test]
    async fn manager_routes_by_provider_and_voice() {
        let manager = PoolManager::new(settings(1, 2, 1), factory());

        let a = manager.checkout("alpha", "v1").await.unwrap();
        let b = manager.checkout("beta", "v1").await.unwrap();
        assert_eq!(a.provider().name(), "alpha");
        assert_eq!(b.provider().name(), "beta");

        let stats = manager.stats();
        assert!(stats.contains_key("alpha:v1"));
        assert!(stats.contains_key("beta:v1"));

        a.release(false);
        b.release(false);
    }

    #[tokio::test]
    async fn manager_fallback_order() {
        let factory: ProviderFactory = Arc::new(|name: &str| {
            if name == "broken" {
                Err(Error::ProviderUnavailable("no such backend".into()))
            } else {
                Ok(Arc::new(NullTtsProvider::new(name)) as Arc<dyn TtsProvider>)
            }
        });
        let manager = PoolManager::new(settings(1, 2, 0), factory);

        let checkout = manager
            .checkout_with_fallback(&["broken".into(), "ok".into()], "v")
            .await
            .unwrap();
        assert_eq!(checkout.provider().name(), "ok");
        checkout.release(false);
    }

    #[tokio::test]
    async fn unused_pools_are_cleaned_up() {
        let manager = PoolManager::new(settings(1, 2, 0), factory());
        manager.pool("p", "v").await;
        assert_eq!(manager.cleanup_unused_pools(Duration::ZERO), 1);
        assert!(manager.stats().is_empty());
    }
}
