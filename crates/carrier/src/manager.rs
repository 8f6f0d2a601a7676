//! Streaming session manager
//!
//! Creates, tracks, and reaps per-call sessions. The idle sweep is an
//! independent long-lived task with a stop signal; it terminates sessions
//! whose buffers have been silent longer than the configured timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use voxcall_config::StreamingSettings;
use voxcall_core::{Error, EventBus, Result};

use crate::client::{AudioFormat, CarrierApi};
use crate::session::{SessionState, SessionStats, StreamingSession};

/// Default chunk capacity of each session's buffer.
const SESSION_BUFFER_CHUNKS: usize = 256;

/// Aggregate manager statistics.
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub sessions_completed: u64,
    pub sessions_terminated: u64,
}

/// Owns every live [`StreamingSession`].
pub struct StreamingManager {
    carrier: Arc<dyn CarrierApi>,
    settings: StreamingSettings,
    events: EventBus,
    sessions: DashMap<String, Arc<StreamingSession>>,
    counters: parking_lot::Mutex<ManagerStats>,
}

impl StreamingManager {
    pub fn new(carrier: Arc<dyn CarrierApi>, settings: StreamingSettings, events: EventBus) -> Self {
        Self {
            carrier,
            settings,
            events,
            sessions: DashMap::new(),
            counters: parking_lot::Mutex::new(ManagerStats::default()),
        }
    }

    /// Register a session for a call. One session per call; the
    /// concurrent-session cap guards carrier quotas.
    pub fn create(
        &self,
        call_id: &str,
        format: AudioFormat,
        sample_rate: u32,
        sample_width: u16,
        channels: u16,
    ) -> Result<Arc<StreamingSession>> {
        if self.sessions.contains_key(call_id) {
            return Err(Error::InvalidInput(format!(
                "call {call_id} already has a streaming session"
            )));
        }
        if self.sessions.len() >= self.settings.max_concurrent_sessions {
            return Err(Error::InvalidInput(format!(
                "session limit reached ({})",
                self.settings.max_concurrent_sessions
            )));
        }

        let session = StreamingSession::new(
            call_id,
            format,
            sample_rate,
            sample_width,
            channels,
            SESSION_BUFFER_CHUNKS,
            Arc::clone(&self.carrier),
            self.events.clone(),
        );

        self.sessions.insert(call_id.to_string(), Arc::clone(&session));
        self.counters.lock().sessions_created += 1;
        tracing::debug!(call_id, "streaming session registered");
        Ok(session)
    }

    fn session(&self, call_id: &str) -> Result<Arc<StreamingSession>> {
        self.sessions
            .get(call_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| Error::SessionNotFound(call_id.to_string()))
    }

    pub async fn start(&self, call_id: &str) -> Result<()> {
        self.session(call_id)?.start().await
    }

    pub fn add_wav(&self, call_id: &str, wav: &[u8]) -> Result<()> {
        self.session(call_id)?.add_wav(wav)
    }

    pub fn add_chunk(&self, call_id: &str, chunk: voxcall_core::AudioChunk) -> Result<()> {
        self.session(call_id)?.add_chunk(chunk)
    }

    pub fn pause(&self, call_id: &str) -> Result<()> {
        self.session(call_id)?.pause()
    }

    pub fn resume(&self, call_id: &str) -> Result<()> {
        self.session(call_id)?.resume()
    }

    /// Complete and deregister a session.
    pub async fn complete(&self, call_id: &str) -> Result<()> {
        let session = self.session(call_id)?;
        let result = session.complete().await;
        self.sessions.remove(call_id);
        self.counters.lock().sessions_completed += 1;
        result
    }

    /// Abort and deregister a session.
    pub async fn terminate(&self, call_id: &str, error: Option<String>) -> Result<()> {
        let session = self.session(call_id)?;
        session.terminate(error).await;
        self.sessions.remove(call_id);
        self.counters.lock().sessions_terminated += 1;
        Ok(())
    }

    pub fn session_state(&self, call_id: &str) -> Result<SessionState> {
        Ok(self.session(call_id)?.state())
    }

    pub fn session_stats(&self, call_id: &str) -> Result<SessionStats> {
        Ok(self.session(call_id)?.stats())
    }

    pub fn all_session_stats(&self) -> HashMap<String, SessionStats> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    pub fn stats(&self) -> ManagerStats {
        let mut stats = self.counters.lock().clone();
        stats.active_sessions = self.sessions.len();
        stats
    }

    /// Terminate sessions idle past the timeout and reap finished ones.
    pub async fn run_sweep(&self) {
        let timeout = Duration::from_secs(self.settings.session_timeout_s);

        let stale: Vec<(String, Arc<StreamingSession>)> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.state().is_terminal() || session.last_activity().elapsed() > timeout
            })
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (call_id, session) in stale {
            if !session.state().is_terminal() {
                tracing::warn!(call_id = %call_id, "terminating idle streaming session");
                session
                    .terminate(Some("session idle timeout".into()))
                    .await;
                self.counters.lock().sessions_terminated += 1;
            }
            self.sessions.remove(&call_id);
        }
    }

    /// Spawn the periodic idle sweep; half the timeout keeps worst-case
    /// overstay bounded.
    pub fn spawn_sweep(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = Duration::from_secs((self.settings.session_timeout_s / 2).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_sweep().await,
                    result = stop.changed() => {
                        if result.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Terminate every session (graceful shutdown).
    pub async fn shutdown(&self) {
        let all: Vec<Arc<StreamingSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in all {
            session.terminate(None).await;
        }
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxcall_core::AudioChunk;

    use crate::session::tests::MockCarrier;

    fn settings() -> StreamingSettings {
        StreamingSettings {
            chunk_ms: 20,
            max_concurrent_sessions: 2,
            session_timeout_s: 300,
            retry_attempts: 3,
            retry_backoff_factor: 2.0,
        }
    }

    fn wav_20ms() -> Vec<u8> {
        AudioChunk::silence(20.0, 8000, 2, 1).to_wav().unwrap()
    }

    #[tokio::test]
    async fn create_start_complete() {
        let carrier = MockCarrier::new();
        let manager = StreamingManager::new(carrier.clone(), settings(), EventBus::new());

        manager.create("c1", AudioFormat::Wav, 8000, 2, 1).unwrap();
        manager.start("c1").await.unwrap();
        manager.add_wav("c1", &wav_20ms()).unwrap();
        manager.complete("c1").await.unwrap();

        assert!(manager.session_state("c1").is_err());
        let ops = carrier.ops();
        assert_eq!(ops.first().map(String::as_str), Some("streaming_start"));
        assert_eq!(ops.last().map(String::as_str), Some("streaming_stop"));

        let stats = manager.stats();
        assert_eq!(stats.sessions_created, 1);
        assert_eq!(stats.sessions_completed, 1);
        assert_eq!(stats.active_sessions, 0);
    }

    #[tokio::test]
    async fn duplicate_call_rejected() {
        let manager = StreamingManager::new(MockCarrier::new(), settings(), EventBus::new());
        manager.create("c1", AudioFormat::Wav, 8000, 2, 1).unwrap();
        assert!(manager.create("c1", AudioFormat::Wav, 8000, 2, 1).is_err());
    }

    #[tokio::test]
    async fn session_cap_enforced() {
        let manager = StreamingManager::new(MockCarrier::new(), settings(), EventBus::new());
        manager.create("c1", AudioFormat::Wav, 8000, 2, 1).unwrap();
        manager.create("c2", AudioFormat::Wav, 8000, 2, 1).unwrap();
        assert!(manager.create("c3", AudioFormat::Wav, 8000, 2, 1).is_err());
    }

    #[tokio::test]
    async fn unknown_call_is_session_not_found() {
        let manager = StreamingManager::new(MockCarrier::new(), settings(), EventBus::new());
        let err = manager.add_wav("ghost", &wav_20ms()).unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn sweep_terminates_idle_sessions() {
        let mut s = settings();
        s.session_timeout_s = 0;
        let manager = StreamingManager::new(MockCarrier::new(), s, EventBus::new());

        manager.create("idle", AudioFormat::Wav, 8000, 2, 1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.run_sweep().await;

        assert!(manager.session_state("idle").is_err());
        assert_eq!(manager.stats().sessions_terminated, 1);
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let manager = StreamingManager::new(MockCarrier::new(), settings(), EventBus::new());
        manager.create("c1", AudioFormat::Wav, 8000, 2, 1).unwrap();
        manager.start("c1").await.unwrap();

        manager.shutdown().await;
        assert_eq!(manager.stats().active_sessions, 0);
    }
}
