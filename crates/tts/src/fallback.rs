//! Provider health tracking and failover
//!
//! The controller owns the provider registry and decides which backend
//! callers get. Demotion happens inline on reported failures; recovery is
//! driven by the periodic health loop, which is the one authoritative
//! path back to the primary. `reset_to_primary` exists as an operational
//! override only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use voxcall_config::FallbackSettings;
use voxcall_core::{Error, EventBus, Result, TtsEventKind};

use crate::provider::TtsProvider;

/// Health state tracked per provider.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub is_healthy: bool,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub last_check_at: Option<Instant>,
    pub recovery_attempts: u32,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            is_healthy: true,
            failure_count: 0,
            last_error: None,
            last_check_at: None,
            recovery_attempts: 0,
        }
    }
}

#[derive(Debug)]
struct ControllerState {
    health: HashMap<String, ProviderHealth>,
    current: String,
    fallbacks_taken: u64,
    recoveries: u64,
    health_checks: u64,
}

/// Snapshot returned by [`FallbackController::snapshot`].
#[derive(Debug, Clone)]
pub struct FallbackSnapshot {
    pub current: String,
    pub primary: String,
    pub fallbacks_taken: u64,
    pub recoveries: u64,
    pub health_checks: u64,
    pub providers: HashMap<String, ProviderHealth>,
}

/// Tracks provider health, demotes on failure, recovers via health loop.
pub struct FallbackController {
    providers: HashMap<String, Arc<dyn TtsProvider>>,
    primary: String,
    fallback_order: Vec<String>,
    settings: FallbackSettings,
    events: EventBus,
    state: Mutex<ControllerState>,
}

impl std::fmt::Debug for FallbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackController")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("primary", &self.primary)
            .field("fallback_order", &self.fallback_order)
            .field("settings", &self.settings)
            .field("state", &self.state)
            .finish()
    }
}

impl FallbackController {
    pub fn new(
        providers: Vec<Arc<dyn TtsProvider>>,
        primary: impl Into<String>,
        fallback_order: Vec<String>,
        settings: FallbackSettings,
        events: EventBus,
    ) -> Result<Self> {
        let primary = primary.into();
        let providers: HashMap<String, Arc<dyn TtsProvider>> = providers
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();

        if !providers.contains_key(&primary) {
            return Err(Error::Config(format!("unknown primary provider {primary}")));
        }
        for name in &fallback_order {
            if !providers.contains_key(name) {
                return Err(Error::Config(format!("unknown fallback provider {name}")));
            }
        }

        let health = providers
            .keys()
            .map(|name| (name.clone(), ProviderHealth::default()))
            .collect();

        Ok(Self {
            providers,
            fallback_order,
            settings,
            events,
            state: Mutex::new(ControllerState {
                health,
                current: primary.clone(),
                fallbacks_taken: 0,
                recoveries: 0,
                health_checks: 0,
            }),
            primary,
        })
    }

    /// The provider callers should use right now.
    pub fn current(&self) -> Arc<dyn TtsProvider> {
        let name = self.state.lock().current.clone();
        Arc::clone(&self.providers[&name])
    }

    pub fn current_name(&self) -> String {
        self.state.lock().current.clone()
    }

    pub fn primary_name(&self) -> &str {
        &self.primary
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn TtsProvider>> {
        self.providers.get(name).map(Arc::clone)
    }

    /// All registered provider names, primary first, then fallback order.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names = vec![self.primary.clone()];
        names.extend(self.fallback_order.iter().cloned());
        names
    }

    /// Record a failure against a provider; at `max_failures` consecutive
    /// failures it is marked unhealthy.
    pub fn record_failure(&self, name: &str, error: &Error) {
        let mut state = self.state.lock();
        let max_failures = self.settings.max_failures;
        if let Some(health) = state.health.get_mut(name) {
            health.failure_count += 1;
            health.last_error = Some(error.to_string());
            if health.failure_count >= max_failures && health.is_healthy {
                tracing::warn!(
                    provider = name,
                    failures = health.failure_count,
                    "provider marked unhealthy"
                );
                health.is_healthy = false;
            }
        }
    }

    /// Operational force-demote, regardless of failure counts.
    pub fn mark_provider_failed(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(health) = state.health.get_mut(name) {
            health.is_healthy = false;
            health.last_error = Some("manually demoted".into());
        }
    }

    /// Record a success; resets the consecutive-failure count.
    pub fn record_success(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(health) = state.health.get_mut(name) {
            health.failure_count = 0;
            health.last_error = None;
        }
    }

    /// Switch to the first healthy candidate after a failure of the
    /// current provider. Returns whether a switch happened and the
    /// provider to use next (unchanged on failure to switch).
    pub fn try_fallback(&self, error: &Error) -> (bool, Arc<dyn TtsProvider>) {
        let switched_to = {
            let mut state = self.state.lock();
            let from = state.current.clone();

            // Demote the current provider first.
            let max_failures = self.settings.max_failures;
            if let Some(health) = state.health.get_mut(&from) {
                health.failure_count += 1;
                health.last_error = Some(error.to_string());
                if health.failure_count >= max_failures {
                    health.is_healthy = false;
                }
            }

            // Fallbacks in priority order; the primary as last resort
            // when it is not the one that just failed.
            let mut candidates: Vec<&String> = self.fallback_order.iter().collect();
            if from != self.primary {
                candidates.push(&self.primary);
            }

            let chosen = candidates
                .into_iter()
                .filter(|name| **name != from)
                .find(|name| state.health.get(*name).is_some_and(|h| h.is_healthy))
                .cloned();

            match chosen {
                Some(to) => {
                    state.current = to.clone();
                    state.fallbacks_taken += 1;
                    tracing::info!(from = %from, to = %to, "fell back to alternate provider");
                    Some((from, to))
                }
                None => {
                    tracing::error!(current = %from, "no healthy provider available for fallback");
                    None
                }
            }
        };

        match switched_to {
            Some((from, to)) => {
                self.events
                    .emit(TtsEventKind::FallbackActivated { from, to: to.clone() }, None);
                (true, Arc::clone(&self.providers[&to]))
            }
            None => (false, self.current()),
        }
    }

    /// Manual revert to the primary. Succeeds only when the primary is
    /// currently believed healthy.
    pub fn reset_to_primary(&self) -> bool {
        let switched = {
            let mut state = self.state.lock();
            if state.current == self.primary {
                return true;
            }
            let healthy = state
                .health
                .get(&self.primary)
                .is_some_and(|h| h.is_healthy);
            if !healthy {
                return false;
            }
            let from = state.current.clone();
            state.current = self.primary.clone();
            state.recoveries += 1;
            from
        };

        self.events.emit(
            TtsEventKind::ProviderChanged {
                from: switched,
                to: self.primary.clone(),
            },
            None,
        );
        true
    }

    /// Explicitly select a provider (facade `change_provider`).
    pub fn set_current(&self, name: &str) -> Result<()> {
        if !self.providers.contains_key(name) {
            return Err(Error::InvalidInput(format!("unknown provider {name}")));
        }
        let from = {
            let mut state = self.state.lock();
            let from = state.current.clone();
            state.current = name.to_string();
            from
        };
        if from != name {
            self.events.emit(
                TtsEventKind::ProviderChanged {
                    from,
                    to: name.to_string(),
                },
                None,
            );
        }
        Ok(())
    }

    /// First provider advertising a capability: the current one when it
    /// qualifies, else primary-then-fallback order.
    pub fn first_capable(
        &self,
        capability: crate::provider::Capability,
    ) -> Result<Arc<dyn TtsProvider>> {
        let current = self.current();
        if current.capabilities().contains(capability) {
            return Ok(current);
        }
        for name in self.provider_names() {
            if let Some(provider) = self.provider(&name) {
                if provider.capabilities().contains(capability) {
                    tracing::info!(provider = %name, ?capability, "selected capable provider");
                    return Ok(provider);
                }
            }
        }
        Err(Error::InvalidInput(format!(
            "no provider advertises {capability:?}"
        )))
    }

    /// Probe one provider and fold the result into its health state.
    pub async fn probe(&self, name: &str) -> bool {
        let provider = match self.providers.get(name) {
            Some(p) => Arc::clone(p),
            None => return false,
        };

        let report = provider.health_check().await;
        let healthy = report.is_healthy();

        let mut state = self.state.lock();
        state.health_checks += 1;
        if let Some(health) = state.health.get_mut(name) {
            health.last_check_at = Some(Instant::now());
            if healthy {
                health.is_healthy = true;
                health.failure_count = 0;
                health.last_error = None;
                health.recovery_attempts = 0;
            } else {
                health.is_healthy = false;
                health.recovery_attempts += 1;
                health.last_error = report.detail.clone();
            }
        }
        healthy
    }

    /// One pass of the health loop body: probe stale and recovering
    /// providers, then revert to the primary if it came back.
    pub async fn run_health_pass(&self) {
        let interval = Duration::from_secs(self.settings.health_check_interval_s);
        let backoff_base = self.settings.recovery_backoff_base_s;

        let due: Vec<String> = {
            let state = self.state.lock();
            self.providers
                .keys()
                .filter(|name| {
                    let Some(health) = state.health.get(*name) else {
                        return false;
                    };
                    let elapsed = health
                        .last_check_at
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::MAX);

                    if health.is_healthy {
                        // Current provider proves itself through traffic.
                        **name != state.current && elapsed >= interval
                    } else {
                        // Exponential backoff with jitter before re-probing.
                        let backoff =
                            backoff_base.saturating_mul(1u64 << health.recovery_attempts.min(16));
                        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
                        elapsed >= Duration::from_secs_f64(backoff as f64 * jitter)
                    }
                })
                .cloned()
                .collect()
        };

        for name in due {
            let healthy = self.probe(&name).await;
            tracing::debug!(provider = %name, healthy, "health probe");
        }

        // The periodic loop is the authoritative revert path.
        let should_revert = {
            let state = self.state.lock();
            state.current != self.primary
                && state
                    .health
                    .get(&self.primary)
                    .is_some_and(|h| h.is_healthy)
        };
        if should_revert && self.reset_to_primary() {
            tracing::info!(primary = %self.primary, "recovered to primary provider");
        }
    }

    /// Spawn the background health loop; exits when the stop signal
    /// flips to true.
    pub fn spawn_health_loop(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.settings.health_check_interval_s.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_health_pass().await,
                    result = stop.changed() => {
                        if result.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn snapshot(&self) -> FallbackSnapshot {
        let state = self.state.lock();
        FallbackSnapshot {
            current: state.current.clone(),
            primary: self.primary.clone(),
            fallbacks_taken: state.fallbacks_taken,
            recoveries: state.recoveries,
            health_checks: state.health_checks,
            providers: state.health.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::NullTtsProvider;

    fn controller(settings: FallbackSettings) -> Arc<FallbackController> {
        let a: Arc<dyn TtsProvider> = Arc::new(NullTtsProvider::new("a"));
        let b: Arc<dyn TtsProvider> = Arc::new(NullTtsProvider::new("b"));
        let c: Arc<dyn TtsProvider> = Arc::new(NullTtsProvider::new("c"));
        Arc::new(
            FallbackController::new(
                vec![a, b, c],
                "a",
                vec!["b".into(), "c".into()],
                settings,
                EventBus::new(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn starts_on_primary() {
        let ctl = controller(FallbackSettings::default());
        assert_eq!(ctl.current_name(), "a");
        assert_eq!(ctl.provider_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn unknown_primary_is_config_error() {
        let a: Arc<dyn TtsProvider> = Arc::new(NullTtsProvider::new("a"));
        let err = FallbackController::new(
            vec![a],
            "missing",
            vec![],
            FallbackSettings::default(),
            EventBus::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn fallback_prefers_earlier_entries() {
        let ctl = controller(FallbackSettings::default());
        let (switched, provider) = ctl.try_fallback(&Error::Timeout("t".into()));
        assert!(switched);
        assert_eq!(provider.name(), "b");
        assert_eq!(ctl.current_name(), "b");
    }

    #[test]
    fn fallback_skips_unhealthy_candidates() {
        let ctl = controller(FallbackSettings::default());
        ctl.mark_provider_failed("b");

        let (switched, provider) = ctl.try_fallback(&Error::Timeout("t".into()));
        assert!(switched);
        assert_eq!(provider.name(), "c");
    }

    #[test]
    fn failure_threshold_marks_unhealthy() {
        let ctl = controller(FallbackSettings::default());
        let err = Error::ProviderUnavailable("down".into());

        ctl.record_failure("b", &err);
        ctl.record_failure("b", &err);
        assert!(ctl.snapshot().providers["b"].is_healthy);

        ctl.record_failure("b", &err);
        assert!(!ctl.snapshot().providers["b"].is_healthy);
    }

    #[test]
    fn no_healthy_candidate_keeps_current() {
        let ctl = controller(FallbackSettings::default());
        ctl.mark_provider_failed("b");
        ctl.mark_provider_failed("c");

        let (switched, provider) = ctl.try_fallback(&Error::Timeout("t".into()));
        assert!(!switched);
        assert_eq!(provider.name(), "a");
    }

    #[test]
    fn reset_to_primary_requires_health() {
        let ctl = controller(FallbackSettings::default());
        ctl.try_fallback(&Error::Timeout("t".into()));
        ctl.mark_provider_failed("a");
        assert!(!ctl.reset_to_primary());

        // After the health flag clears, the manual reset works.
        ctl.state.lock().health.get_mut("a").unwrap().is_healthy = true;
        assert!(ctl.reset_to_primary());
        assert_eq!(ctl.current_name(), "a");
    }

    #[tokio::test]
    async fn health_pass_reverts_to_recovered_primary() {
        let ctl = controller(FallbackSettings {
            max_failures: 1,
            health_check_interval_s: 1,
            recovery_backoff_base_s: 0,
        });

        // Demote the primary and fall over to b.
        let (switched, _) = ctl.try_fallback(&Error::ProviderUnavailable("down".into()));
        assert!(switched);
        assert!(!ctl.snapshot().providers["a"].is_healthy);

        // Null providers always probe healthy, so the pass recovers a.
        ctl.run_health_pass().await;
        assert_eq!(ctl.current_name(), "a");
        assert!(ctl.snapshot().providers["a"].is_healthy);
        assert_eq!(ctl.snapshot().recoveries, 1);
    }

    #[tokio::test]
    async fn probe_failure_counts_recovery_attempts() {
        let failing = Arc::new(NullTtsProvider::new("x"));
        let provider: Arc<dyn TtsProvider> = failing.clone();
        let ctl = FallbackController::new(
            vec![provider],
            "x",
            vec![],
            FallbackSettings::default(),
            EventBus::new(),
        )
        .unwrap();

        // NullTtsProvider's health probe always succeeds; verify the
        // success path resets counters set by prior failures.
        ctl.mark_provider_failed("x");
        assert!(ctl.probe("x").await);
        let health = &ctl.snapshot().providers["x"];
        assert!(health.is_healthy);
        assert_eq!(health.recovery_attempts, 0);
    }
}
