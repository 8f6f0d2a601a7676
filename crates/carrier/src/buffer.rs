//! Streaming audio buffer
//!
//! Bounded FIFO of audio chunks between synthesis and the uploader.
//! Fill level is measured in buffered playback milliseconds; thresholds
//! drive edge-triggered callbacks so the owner can react to starvation
//! before the carrier runs dry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use voxcall_core::{AudioChunk, Error, Result};

/// Buffer fill levels, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLevel {
    Empty,
    Critical,
    Low,
    Normal,
    High,
    Overflow,
}

/// Threshold boundaries in buffered milliseconds.
#[derive(Debug, Clone)]
pub struct BufferThresholds {
    /// Playback may start once this much audio is buffered
    pub ready_ms: f64,
    pub critical_ms: f64,
    pub low_ms: f64,
    pub normal_ms: f64,
    pub high_ms: f64,
    pub overflow_ms: f64,
}

impl Default for BufferThresholds {
    fn default() -> Self {
        Self {
            ready_ms: 500.0,
            critical_ms: 200.0,
            low_ms: 500.0,
            normal_ms: 2000.0,
            high_ms: 5000.0,
            overflow_ms: 10_000.0,
        }
    }
}

/// Statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct BufferStats {
    pub chunks: usize,
    pub bytes: u64,
    pub duration_ms: f64,
    pub total_chunks_added: u64,
    pub total_chunks_retrieved: u64,
    pub overflow_count: u64,
    pub underflow_count: u64,
    pub peak_chunks: usize,
    pub peak_bytes: u64,
    pub peak_duration_ms: f64,
}

type LevelCallback = Arc<dyn Fn(BufferLevel) + Send + Sync>;

struct Inner {
    queue: VecDeque<AudioChunk>,
    duration_ms: f64,
    bytes: u64,
    level: BufferLevel,
    stats: BufferStats,
    last_add: Option<Instant>,
    last_get: Option<Instant>,
    callbacks: Vec<(BufferLevel, LevelCallback)>,
}

impl Inner {
    fn compute_level(&self, thresholds: &BufferThresholds) -> BufferLevel {
        if self.queue.is_empty() {
            BufferLevel::Empty
        } else if self.duration_ms <= thresholds.critical_ms {
            BufferLevel::Critical
        } else if self.duration_ms <= thresholds.low_ms {
            BufferLevel::Low
        } else if self.duration_ms <= thresholds.normal_ms {
            BufferLevel::Normal
        } else if self.duration_ms <= thresholds.high_ms {
            BufferLevel::High
        } else {
            BufferLevel::Overflow
        }
    }

    /// Recompute the level; returns callbacks to fire if it changed.
    fn update_level(&mut self, thresholds: &BufferThresholds) -> Vec<(BufferLevel, LevelCallback)> {
        let previous = self.level;
        let current = self.compute_level(thresholds);
        self.level = current;

        if current == previous {
            return Vec::new();
        }
        if previous != BufferLevel::Empty && current == BufferLevel::Empty {
            self.stats.underflow_count += 1;
        }
        if current == BufferLevel::Overflow {
            self.stats.overflow_count += 1;
        }

        self.callbacks
            .iter()
            .filter(|(level, _)| *level == current)
            .map(|(level, cb)| (*level, Arc::clone(cb)))
            .collect()
    }
}

/// Thread-safe bounded chunk queue. Multiple producers, one consumer.
pub struct AudioBuffer {
    max_size: usize,
    thresholds: BufferThresholds,
    inner: Mutex<Inner>,
    ready: Notify,
    empty: Notify,
}

impl AudioBuffer {
    pub fn new(max_size: usize, thresholds: BufferThresholds) -> Self {
        Self {
            max_size,
            thresholds,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                duration_ms: 0.0,
                bytes: 0,
                level: BufferLevel::Empty,
                stats: BufferStats::default(),
                last_add: None,
                last_get: None,
                callbacks: Vec::new(),
            }),
            ready: Notify::new(),
            empty: Notify::new(),
        }
    }

    /// Append a chunk. Fails with `BufferOverflow` at capacity; the
    /// rejected chunk stays with the caller and nothing buffered is lost.
    pub fn push(&self, chunk: AudioChunk) -> Result<()> {
        let fired = {
            let mut inner = self.inner.lock();
            if inner.queue.len() >= self.max_size {
                inner.stats.overflow_count += 1;
                let fired: Vec<(BufferLevel, LevelCallback)> = inner
                    .callbacks
                    .iter()
                    .filter(|(level, _)| *level == BufferLevel::Overflow)
                    .map(|(level, cb)| (*level, Arc::clone(cb)))
                    .collect();
                drop(inner);
                for (level, cb) in fired {
                    cb(level);
                }
                return Err(Error::BufferOverflow);
            }

            inner.duration_ms += chunk.duration_ms;
            inner.bytes += chunk.size() as u64;
            inner.queue.push_back(chunk);
            inner.stats.total_chunks_added += 1;
            inner.last_add = Some(Instant::now());

            inner.stats.peak_chunks = inner.stats.peak_chunks.max(inner.queue.len());
            inner.stats.peak_bytes = inner.stats.peak_bytes.max(inner.bytes);
            inner.stats.peak_duration_ms = inner.stats.peak_duration_ms.max(inner.duration_ms);

            inner.update_level(&self.thresholds)
        };

        for (level, cb) in fired {
            cb(level);
        }

        if self.is_ready() {
            self.ready.notify_waiters();
        }
        Ok(())
    }

    /// Remove and return the oldest chunk.
    pub fn pop(&self) -> Option<AudioChunk> {
        let (chunk, fired, emptied) = {
            let mut inner = self.inner.lock();
            let chunk = inner.queue.pop_front()?;
            inner.duration_ms = (inner.duration_ms - chunk.duration_ms).max(0.0);
            inner.bytes = inner.bytes.saturating_sub(chunk.size() as u64);
            inner.stats.total_chunks_retrieved += 1;
            inner.last_get = Some(Instant::now());

            let fired = inner.update_level(&self.thresholds);
            let emptied = inner.queue.is_empty();
            (chunk, fired, emptied)
        };

        for (level, cb) in fired {
            cb(level);
        }
        if emptied {
            self.empty.notify_waiters();
        }
        Some(chunk)
    }

    /// Discard everything buffered; returns the number of chunks dropped.
    pub fn clear(&self) -> usize {
        let (dropped, fired) = {
            let mut inner = self.inner.lock();
            let dropped = inner.queue.len();
            inner.queue.clear();
            inner.duration_ms = 0.0;
            inner.bytes = 0;
            let fired = inner.update_level(&self.thresholds);
            (dropped, fired)
        };

        for (level, cb) in fired {
            cb(level);
        }
        if dropped > 0 {
            self.empty.notify_waiters();
        }
        dropped
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().duration_ms >= self.thresholds.ready_ms
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn duration_ms(&self) -> f64 {
        self.inner.lock().duration_ms
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn level(&self) -> BufferLevel {
        self.inner.lock().level
    }

    /// Instant of the most recent push or pop; drives idle-session sweeps.
    pub fn last_activity(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        match (inner.last_add, inner.last_get) {
            (Some(a), Some(g)) => Some(a.max(g)),
            (a, g) => a.or(g),
        }
    }

    /// Register a callback fired exactly once each time the level changes
    /// *into* `level`.
    pub fn on_level(&self, level: BufferLevel, callback: impl Fn(BufferLevel) + Send + Sync + 'static) {
        self.inner.lock().callbacks.push((level, Arc::new(callback)));
    }

    /// Block until the buffered duration reaches the ready threshold.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            if self.is_ready() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_ready();
            }
        }
    }

    /// Block until the queue drains completely.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.empty.notified();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_empty();
            }
        }
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.chunks = inner.queue.len();
        stats.bytes = inner.bytes;
        stats.duration_ms = inner.duration_ms;
        stats
    }
}
