//! Per-call quality record

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final status of a monitored call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    InProgress,
    Completed,
    Failed,
    Interrupted,
}

/// One recorded error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallError {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    pub component: String,
}

/// Accumulated time in one named phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseTimer {
    pub total_ms: f64,
    pub visits: u32,
    /// Set while the phase is open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

/// Streaming-session sub-record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    pub chunks: u64,
    pub bytes: u64,
}

/// Averages computed at finalisation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub duration_ms: f64,
    pub avg_generation_ms: f64,
    pub avg_first_chunk_latency_ms: f64,
    pub cache_hit_ratio: f64,
    pub error_count: usize,
}

/// Everything measured about one call. Mutable only until
/// [`CallQualityRecord::finalize`]; afterwards updates are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallQualityRecord {
    pub call_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: CallStatus,

    pub generation_times_ms: Vec<f64>,
    pub first_chunk_latencies_ms: Vec<f64>,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub dialog_turns: u64,

    pub errors: Vec<CallError>,
    pub phases: HashMap<String, PhaseTimer>,
    pub sessions: HashMap<String, SessionRecord>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub derived: Option<DerivedMetrics>,

    #[serde(default)]
    finalized: bool,
}

impl CallQualityRecord {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: CallStatus::InProgress,
            generation_times_ms: Vec::new(),
            first_chunk_latencies_ms: Vec::new(),
            chunks_sent: 0,
            bytes_sent: 0,
            cache_hits: 0,
            cache_misses: 0,
            dialog_turns: 0,
            errors: Vec::new(),
            phases: HashMap::new(),
            sessions: HashMap::new(),
            derived: None,
            finalized: false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn record_generation(&mut self, duration_ms: f64) {
        if self.finalized {
            return;
        }
        self.generation_times_ms.push(duration_ms);
    }

    pub fn record_first_chunk_latency(&mut self, latency_ms: f64) {
        if self.finalized {
            return;
        }
        self.first_chunk_latencies_ms.push(latency_ms);
    }

    pub fn record_chunk(&mut self, bytes: u64) {
        if self.finalized {
            return;
        }
        self.chunks_sent += 1;
        self.bytes_sent += bytes;
    }

    pub fn record_cache(&mut self, hit: bool) {
        if self.finalized {
            return;
        }
        if hit {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }
    }

    pub fn record_turn(&mut self) {
        if self.finalized {
            return;
        }
        self.dialog_turns += 1;
    }

    pub fn record_error(
        &mut self,
        kind: impl Into<String>,
        message: impl Into<String>,
        component: impl Into<String>,
    ) {
        if self.finalized {
            return;
        }
        self.errors.push(CallError {
            at: Utc::now(),
            kind: kind.into(),
            message: message.into(),
            component: component.into(),
        });
    }

    /// Open a phase; a second open while running is ignored.
    pub fn start_phase(&mut self, name: &str) {
        if self.finalized {
            return;
        }
        let timer = self.phases.entry(name.to_string()).or_default();
        if timer.opened_at.is_none() {
            timer.opened_at = Some(Utc::now());
        }
    }

    /// Close a phase, adding the elapsed time and a visit.
    pub fn end_phase(&mut self, name: &str) {
        if self.finalized {
            return;
        }
        if let Some(timer) = self.phases.get_mut(name) {
            if let Some(opened) = timer.opened_at.take() {
                let elapsed = Utc::now()
                    .signed_duration_since(opened)
                    .num_milliseconds()
                    .max(0) as f64;
                timer.total_ms += elapsed;
                timer.visits += 1;
            }
        }
    }

    pub fn session_started(&mut self, session_id: &str) {
        if self.finalized {
            return;
        }
        self.sessions.insert(
            session_id.to_string(),
            SessionRecord {
                session_id: session_id.to_string(),
                started_at: Utc::now(),
                ended_at: None,
                status: "streaming".into(),
                chunks: 0,
                bytes: 0,
            },
        );
    }

    pub fn session_chunk(&mut self, session_id: &str, bytes: u64) {
        if self.finalized {
            return;
        }
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.chunks += 1;
            session.bytes += bytes;
        }
    }

    pub fn session_ended(&mut self, session_id: &str, status: &str) {
        if self.finalized {
            return;
        }
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.ended_at = Some(Utc::now());
            session.status = status.to_string();
        }
    }

    /// Close the record: open phases are ended, averages computed, and
    /// all further mutation refused.
    pub fn finalize(&mut self, status: CallStatus) {
        if self.finalized {
            return;
        }

        let open: Vec<String> = self
            .phases
            .iter()
            .filter(|(_, t)| t.opened_at.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        for name in open {
            self.end_phase(&name);
        }

        self.ended_at = Some(Utc::now());
        self.status = status;

        let avg = |xs: &[f64]| {
            if xs.is_empty() {
                0.0
            } else {
                xs.iter().sum::<f64>() / xs.len() as f64
            }
        };
        let cache_total = self.cache_hits + self.cache_misses;

        self.derived = Some(DerivedMetrics {
            duration_ms: self
                .ended_at
                .unwrap_or_else(Utc::now)
                .signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as f64,
            avg_generation_ms: avg(&self.generation_times_ms),
            avg_first_chunk_latency_ms: avg(&self.first_chunk_latencies_ms),
            cache_hit_ratio: if cache_total == 0 {
                0.0
            } else {
                self.cache_hits as f64 / cache_total as f64
            },
            error_count: self.errors.len(),
        });

        self.finalized = true;
    }
}
