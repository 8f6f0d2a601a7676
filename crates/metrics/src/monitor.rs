//! Call quality monitor
//!
//! Subscribes to the engine event bus and folds events into per-call
//! records. Records are finalised and persisted as dated JSON files when
//! monitoring ends; aggregation queries scan in-memory records plus any
//! loaded history.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use voxcall_core::{Error, EventBus, Result, TtsEvent, TtsEventKind};

use crate::record::{CallQualityRecord, CallStatus};

/// Aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePeriod {
    Today,
    Week,
    Month,
    All,
}

/// Summary over a set of calls.
#[derive(Debug, Clone, Default)]
pub struct AggregateReport {
    pub call_count: usize,
    pub completed: usize,
    pub failed: usize,
    pub interrupted: usize,
    pub avg_duration_ms: f64,
    pub avg_generation_ms: f64,
    pub total_chunks: u64,
    pub total_errors: usize,
}

/// Event-driven per-call metrics collection.
pub struct CallQualityMonitor {
    metrics_dir: PathBuf,
    records: DashMap<String, Arc<Mutex<CallQualityRecord>>>,
    stop_tx: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CallQualityMonitor {
    /// Create the monitor and subscribe it to the event bus. Must run
    /// inside a Tokio runtime: the listener task is spawned here.
    pub fn new(metrics_dir: impl Into<PathBuf>, events: &EventBus) -> Result<Arc<Self>> {
        let metrics_dir = metrics_dir.into();
        fs::create_dir_all(&metrics_dir)
            .map_err(|e| Error::Config(format!("metrics dir {metrics_dir:?}: {e}")))?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = Arc::new(Self {
            metrics_dir,
            records: DashMap::new(),
            stop_tx,
            listener: Mutex::new(None),
        });

        let mut rx = events.subscribe();
        let worker = Arc::clone(&monitor);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(event) => worker.handle_event(event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "metrics listener lagged behind event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    result = stop_rx.changed() => {
                        if result.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *monitor.listener.lock() = Some(handle);

        Ok(monitor)
    }

    /// Begin collecting for a call. Idempotent.
    pub fn start_call_monitoring(&self, call_id: &str) {
        self.records
            .entry(call_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CallQualityRecord::new(call_id))));
    }

    /// Finalise the record, persist it, and return a snapshot.
    pub fn end_call_monitoring(
        &self,
        call_id: &str,
        status: CallStatus,
    ) -> Result<CallQualityRecord> {
        let record = self
            .records
            .get(call_id)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| Error::SessionNotFound(call_id.to_string()))?;

        let snapshot = {
            let mut record = record.lock();
            record.finalize(status);
            record.clone()
        };

        self.persist(&snapshot);
        Ok(snapshot)
    }

    pub fn record_error(&self, call_id: &str, kind: &str, message: &str, component: &str) {
        if let Some(record) = self.records.get(call_id) {
            record.lock().record_error(kind, message, component);
        }
    }

    pub fn start_phase(&self, call_id: &str, phase: &str) {
        if let Some(record) = self.records.get(call_id) {
            record.lock().start_phase(phase);
        }
    }

    pub fn end_phase(&self, call_id: &str, phase: &str) {
        if let Some(record) = self.records.get(call_id) {
            record.lock().end_phase(phase);
        }
    }

    /// Snapshot of one record, if monitored.
    pub fn call_metrics(&self, call_id: &str) -> Option<CallQualityRecord> {
        self.records.get(call_id).map(|r| r.lock().clone())
    }

    /// Fold one event into its call's record. Events without a call id
    /// have nowhere to land and are skipped.
    fn handle_event(&self, event: TtsEvent) {
        let Some(call_id) = event.call_id.as_ref() else {
            return;
        };
        let Some(record) = self.records.get(call_id.as_str()) else {
            return;
        };
        let mut record = record.lock();

        match event.kind {
            TtsEventKind::GenerationEnd { duration_ms, .. } => {
                record.record_generation(duration_ms);
            }
            TtsEventKind::GenerationError { provider, error } => {
                record.record_error("generation_error", &error, &provider);
            }
            TtsEventKind::FirstResponseLatency { latency_ms, .. } => {
                record.record_first_chunk_latency(latency_ms);
            }
            TtsEventKind::ChunkUploaded {
                session_id, bytes, ..
            } => {
                record.record_chunk(bytes as u64);
                record.session_chunk(&session_id, bytes as u64);
            }
            TtsEventKind::CacheHit { .. } => record.record_cache(true),
            TtsEventKind::CacheMiss => record.record_cache(false),
            TtsEventKind::StreamingStart { session_id } => {
                record.session_started(&session_id);
            }
            TtsEventKind::StreamingEnd { session_id, status } => {
                record.session_ended(&session_id, &status);
            }
            TtsEventKind::StreamingError { session_id, error } => {
                record.session_ended(&session_id, "error");
                record.record_error("streaming_error", &error, "carrier");
            }
            TtsEventKind::ProviderError { provider, error } => {
                record.record_error("provider_error", &error, &provider);
            }
            TtsEventKind::DialogTurnEnd { .. } => record.record_turn(),
            TtsEventKind::BufferOverflow { .. } => {
                record.record_error("buffer_overflow", "audio buffer at capacity", "buffer");
            }
            _ => {}
        }
    }

    fn persist(&self, record: &CallQualityRecord) {
        let filename = format!(
            "{}_{}.json",
            Utc::now().format("%Y%m%d_%H%M%S"),
            record.call_id
        );
        let path = self.metrics_dir.join(filename);

        match serde_json::to_vec_pretty(record) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes) {
                    tracing::error!(path = %path.display(), error = %e, "failed to persist call metrics");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode call metrics"),
        }
    }

    /// Load persisted records back into memory; returns how many were
    /// added. Records already in memory win.
    pub fn load_historical(&self, days: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let entries = match fs::read_dir(&self.metrics_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read metrics dir");
                return 0;
            }
        };

        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = fs::read(&path) else { continue };
            let Ok(record) = serde_json::from_slice::<CallQualityRecord>(&bytes) else {
                continue;
            };
            if record.started_at < cutoff || self.records.contains_key(&record.call_id) {
                continue;
            }
            self.records
                .insert(record.call_id.clone(), Arc::new(Mutex::new(record)));
            loaded += 1;
        }
        loaded
    }

    /// Aggregate finalised records in the given window.
    pub fn aggregate(&self, period: TimePeriod) -> AggregateReport {
        let cutoff = match period {
            TimePeriod::Today => Some(
                Utc::now()
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc())
                    .unwrap_or_else(Utc::now),
            ),
            TimePeriod::Week => Some(Utc::now() - ChronoDuration::days(7)),
            TimePeriod::Month => Some(Utc::now() - ChronoDuration::days(30)),
            TimePeriod::All => None,
        };

        let mut report = AggregateReport::default();
        let mut durations = Vec::new();
        let mut generations = Vec::new();

        for entry in self.records.iter() {
            let record = entry.value().lock();
            if !record.is_finalized() {
                continue;
            }
            if let Some(cutoff) = cutoff {
                if record.started_at < cutoff {
                    continue;
                }
            }

            report.call_count += 1;
            match record.status {
                CallStatus::Completed => report.completed += 1,
                CallStatus::Failed => report.failed += 1,
                CallStatus::Interrupted => report.interrupted += 1,
                CallStatus::InProgress => {}
            }
            report.total_chunks += record.chunks_sent;
            report.total_errors += record.errors.len();

            if let Some(derived) = &record.derived {
                durations.push(derived.duration_ms);
                generations.push(derived.avg_generation_ms);
            }
        }

        let avg = |xs: &[f64]| {
            if xs.is_empty() {
                0.0
            } else {
                xs.iter().sum::<f64>() / xs.len() as f64
            }
        };
        report.avg_duration_ms = avg(&durations);
        report.avg_generation_ms = avg(&generations);
        report
    }

    /// Stop the event listener.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        self.listener.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use voxcall_core::CallId;

    async fn drain(events: &EventBus) {
        // Give the listener task a few ticks to consume the bus.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = events;
    }

    #[tokio::test]
    async fn events_fold_into_records() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let monitor = CallQualityMonitor::new(dir.path(), &events).unwrap();

        monitor.start_call_monitoring("c1");
        let call = Some(CallId::from("c1"));

        events.emit(
            TtsEventKind::GenerationEnd {
                provider: "cloud".into(),
                duration_ms: 120.0,
                bytes: 4000,
            },
            call.clone(),
        );
        events.emit(
            TtsEventKind::StreamingStart {
                session_id: "s1".into(),
            },
            call.clone(),
        );
        events.emit(
            TtsEventKind::ChunkUploaded {
                session_id: "s1".into(),
                bytes: 320,
                latency_ms: 12.0,
            },
            call.clone(),
        );
        events.emit(TtsEventKind::CacheHit { tier: "memory".into() }, call.clone());
        drain(&events).await;

        let record = monitor.call_metrics("c1").unwrap();
        assert_eq!(record.generation_times_ms, vec![120.0]);
        assert_eq!(record.chunks_sent, 1);
        assert_eq!(record.cache_hits, 1);
        assert_eq!(record.sessions["s1"].chunks, 1);
        monitor.shutdown();
    }

    #[tokio::test]
    async fn events_for_unmonitored_calls_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let monitor = CallQualityMonitor::new(dir.path(), &events).unwrap();

        events.emit(
            TtsEventKind::CacheMiss,
            Some(CallId::from("never-started")),
        );
        drain(&events).await;

        assert!(monitor.call_metrics("never-started").is_none());
        monitor.shutdown();
    }

    #[tokio::test]
    async fn end_monitoring_persists_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let monitor = CallQualityMonitor::new(dir.path(), &events).unwrap();

        monitor.start_call_monitoring("call-42");
        monitor.record_error("call-42", "timeout", "provider slow", "provider");
        let record = monitor
            .end_call_monitoring("call-42", CallStatus::Completed)
            .unwrap();

        assert!(record.is_finalized());
        assert_eq!(record.errors.len(), 1);

        let files: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("_call-42.json"));
        // Dated prefix: YYYYMMDD_HHMMSS
        assert_eq!(files[0].split('_').next().unwrap().len(), 8);
        monitor.shutdown();
    }

    #[tokio::test]
    async fn end_monitoring_unknown_call_fails() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let monitor = CallQualityMonitor::new(dir.path(), &events).unwrap();

        assert!(monitor
            .end_call_monitoring("ghost", CallStatus::Completed)
            .is_err());
        monitor.shutdown();
    }

    #[tokio::test]
    async fn aggregate_counts_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let monitor = CallQualityMonitor::new(dir.path(), &events).unwrap();

        for (call_id, status) in [
            ("c1", CallStatus::Completed),
            ("c2", CallStatus::Completed),
            ("c3", CallStatus::Failed),
            ("c4", CallStatus::Interrupted),
        ] {
            monitor.start_call_monitoring(call_id);
            monitor.end_call_monitoring(call_id, status).unwrap();
        }

        // An in-progress call is not aggregated.
        monitor.start_call_monitoring("open");

        let report = monitor.aggregate(TimePeriod::Today);
        assert_eq!(report.call_count, 4);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.interrupted, 1);

        let all = monitor.aggregate(TimePeriod::All);
        assert_eq!(all.call_count, 4);
        monitor.shutdown();
    }

    #[tokio::test]
    async fn historical_records_reload() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new();

        {
            let monitor = CallQualityMonitor::new(dir.path(), &events).unwrap();
            monitor.start_call_monitoring("old-call");
            monitor
                .end_call_monitoring("old-call", CallStatus::Completed)
                .unwrap();
            monitor.shutdown();
        }

        let fresh = CallQualityMonitor::new(dir.path(), &events).unwrap();
        assert_eq!(fresh.aggregate(TimePeriod::All).call_count, 0);

        assert_eq!(fresh.load_historical(30), 1);
        assert_eq!(fresh.aggregate(TimePeriod::All).call_count, 1);
        assert!(fresh.call_metrics("old-call").unwrap().is_finalized());
        fresh.shutdown();
    }
}
