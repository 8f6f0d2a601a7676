//! Per-call quality metrics
//!
//! Event-driven collection of latencies, chunk counts, errors, and phase
//! durations per call, with JSON persistence and time-window aggregation.

pub mod monitor;
pub mod record;

pub use monitor::{AggregateReport, CallQualityMonitor, TimePeriod};
pub use record::{
    CallError, CallQualityRecord, CallStatus, DerivedMetrics, PhaseTimer, SessionRecord,
};
