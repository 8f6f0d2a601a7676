//! Engine event bus
//!
//! Components publish lifecycle events here; the call quality monitor is
//! the main subscriber. Events carry their call id explicitly at emission
//! time, so handlers never consult shared "current call" state.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::call::CallId;

/// Default ring capacity of the broadcast channel
const DEFAULT_CAPACITY: usize = 256;

/// What happened, with kind-specific payload fields.
#[derive(Debug, Clone)]
pub enum TtsEventKind {
    GenerationStart {
        provider: String,
        text_len: usize,
    },
    GenerationEnd {
        provider: String,
        duration_ms: f64,
        bytes: usize,
    },
    GenerationError {
        provider: String,
        error: String,
    },

    StreamingStart {
        session_id: String,
    },
    StreamingEnd {
        session_id: String,
        status: String,
    },
    StreamingError {
        session_id: String,
        error: String,
    },
    ChunkUploaded {
        session_id: String,
        bytes: usize,
        latency_ms: f64,
    },

    SessionStart {
        session_id: String,
    },
    SessionEnd {
        session_id: String,
        status: String,
    },

    ProviderChanged {
        from: String,
        to: String,
    },
    ProviderError {
        provider: String,
        error: String,
    },
    FallbackActivated {
        from: String,
        to: String,
    },

    CacheHit {
        tier: String,
    },
    CacheMiss,

    DialogTurnStart {
        turn_id: String,
        text_len: usize,
    },
    FragmentProcessing {
        turn_id: String,
        index: usize,
    },
    FirstResponseLatency {
        turn_id: String,
        latency_ms: f64,
    },
    DialogPause {
        turn_id: String,
        pause_ms: u64,
    },
    DialogTurnEnd {
        turn_id: String,
        fragment_count: usize,
        duration_ms: f64,
    },
    /// A fragment failed over mid-stream after audio was already yielded;
    /// the caller received audio from two providers for one fragment.
    MixedProviderAudio {
        turn_id: String,
        fragment_index: usize,
    },

    BufferOverflow {
        session_id: Option<String>,
    },
    BufferUnderflow {
        session_id: Option<String>,
    },

    LatencyMeasured {
        operation: String,
        latency_ms: f64,
    },
}

impl TtsEventKind {
    /// Short label used for logging and aggregation buckets
    pub fn label(&self) -> &'static str {
        match self {
            TtsEventKind::GenerationStart { .. } => "generation_start",
            TtsEventKind::GenerationEnd { .. } => "generation_end",
            TtsEventKind::GenerationError { .. } => "generation_error",
            TtsEventKind::StreamingStart { .. } => "streaming_start",
            TtsEventKind::StreamingEnd { .. } => "streaming_end",
            TtsEventKind::StreamingError { .. } => "streaming_error",
            TtsEventKind::ChunkUploaded { .. } => "chunk_uploaded",
            TtsEventKind::SessionStart { .. } => "session_start",
            TtsEventKind::SessionEnd { .. } => "session_end",
            TtsEventKind::ProviderChanged { .. } => "provider_changed",
            TtsEventKind::ProviderError { .. } => "provider_error",
            TtsEventKind::FallbackActivated { .. } => "fallback_activated",
            TtsEventKind::CacheHit { .. } => "cache_hit",
            TtsEventKind::CacheMiss => "cache_miss",
            TtsEventKind::DialogTurnStart { .. } => "dialog_turn_start",
            TtsEventKind::FragmentProcessing { .. } => "fragment_processing",
            TtsEventKind::FirstResponseLatency { .. } => "first_response_latency",
            TtsEventKind::DialogPause { .. } => "dialog_pause",
            TtsEventKind::DialogTurnEnd { .. } => "dialog_turn_end",
            TtsEventKind::MixedProviderAudio { .. } => "mixed_provider_audio",
            TtsEventKind::BufferOverflow { .. } => "buffer_overflow",
            TtsEventKind::BufferUnderflow { .. } => "buffer_underflow",
            TtsEventKind::LatencyMeasured { .. } => "latency_measured",
        }
    }
}

/// An event with attribution and timing.
#[derive(Debug, Clone)]
pub struct TtsEvent {
    pub kind: TtsEventKind,
    pub call_id: Option<CallId>,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast bus for [`TtsEvent`].
///
/// Cloning is cheap; all clones publish to the same channel. Subscribers
/// that fall behind lose the oldest events (broadcast semantics), which is
/// acceptable for monitoring.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TtsEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event attributed to `call_id`.
    ///
    /// Emission never fails: with no subscribers the event is dropped.
    pub fn emit(&self, kind: TtsEventKind, call_id: Option<CallId>) {
        let event = TtsEvent {
            kind,
            call_id,
            timestamp: Utc::now(),
        };
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TtsEvent> {
        self.tx.subscribe()
    }

    /// Current number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(
            TtsEventKind::CacheHit {
                tier: "memory".into(),
            },
            Some(CallId::from("call-1")),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind.label(), "cache_hit");
        assert_eq!(event.call_id.unwrap().as_str(), "call-1");
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(TtsEventKind::CacheMiss, None);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
