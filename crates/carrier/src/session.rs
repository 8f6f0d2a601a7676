//! Per-call streaming session
//!
//! One session per live call: a bounded audio buffer, a dedicated
//! uploader task draining it in FIFO order, and a single-writer state
//! machine guarded by the session mutex.
//!
//! ```text
//! Initializing -> Ready -> Streaming -> {Paused <-> Streaming} -> Completed
//!                          |
//!                          +-> Terminated / Error   (from any non-terminal state)
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use voxcall_core::{AudioChunk, CallId, Error, EventBus, Result, TtsEventKind};

use crate::buffer::{AudioBuffer, BufferThresholds};
use crate::client::{AudioDescriptor, AudioFormat, CarrierApi};

/// Terminal upload failures tolerated back-to-back before the session is
/// torn down.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Rolling latency window length.
const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ready,
    Streaming,
    Paused,
    Completed,
    Error,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Error | SessionState::Terminated
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub total_chunks_sent: u64,
    pub total_bytes_sent: u64,
    pub upload_errors: u64,
    pub consecutive_errors: u32,
    pub avg_upload_latency_ms: f64,
}

struct StatsInner {
    total_chunks_sent: u64,
    total_bytes_sent: u64,
    upload_errors: u64,
    consecutive_errors: u32,
    latencies_ms: VecDeque<f64>,
}

/// Streaming session for one call.
pub struct StreamingSession {
    call_id: String,
    command_id: String,
    client_state: Option<String>,
    format: AudioFormat,
    sample_rate: u32,
    sample_width: u16,
    channels: u16,

    carrier: Arc<dyn CarrierApi>,
    events: EventBus,
    buffer: Arc<AudioBuffer>,

    state: Mutex<SessionState>,
    stream_id: Mutex<Option<String>>,
    stats: Mutex<StatsInner>,
    created_at: Instant,

    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    uploader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingSession {
    pub fn new(
        call_id: impl Into<String>,
        format: AudioFormat,
        sample_rate: u32,
        sample_width: u16,
        channels: u16,
        buffer_max_chunks: usize,
        carrier: Arc<dyn CarrierApi>,
        events: EventBus,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = Arc::new(Self {
            call_id: call_id.into(),
            command_id: Uuid::new_v4().to_string(),
            client_state: None,
            format,
            sample_rate,
            sample_width,
            channels,
            carrier,
            events,
            buffer: Arc::new(AudioBuffer::new(
                buffer_max_chunks,
                BufferThresholds::default(),
            )),
            state: Mutex::new(SessionState::Initializing),
            stream_id: Mutex::new(None),
            stats: Mutex::new(StatsInner {
                total_chunks_sent: 0,
                total_bytes_sent: 0,
                upload_errors: 0,
                consecutive_errors: 0,
                latencies_ms: VecDeque::new(),
            }),
            created_at: Instant::now(),
            stop_tx,
            stop_rx,
            uploader: Mutex::new(None),
        });

        // Registration complete: the session is ready to be started.
        *session.state.lock() = SessionState::Ready;
        session
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    fn call_ref(&self) -> Option<CallId> {
        Some(CallId::new(self.call_id.clone()))
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn stream_id(&self) -> Option<String> {
        self.stream_id.lock().clone()
    }

    pub fn buffer(&self) -> &Arc<AudioBuffer> {
        &self.buffer
    }

    /// Negotiated audio format: (sample_rate, sample_width, channels).
    pub fn audio_format(&self) -> (u32, u16, u16) {
        (self.sample_rate, self.sample_width, self.channels)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Instant of the last buffer activity, or creation time.
    pub fn last_activity(&self) -> Instant {
        self.buffer.last_activity().unwrap_or(self.created_at)
    }

    /// Issue `streaming_start` and spawn the uploader.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock();
            match *state {
                SessionState::Ready => {}
                SessionState::Streaming => return Ok(()),
                other => {
                    return Err(Error::SessionTerminated(format!(
                        "cannot start from {other:?}"
                    )))
                }
            }
        }

        let descriptor = AudioDescriptor {
            content_type: self.format.content_type().to_string(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        };

        let stream_id = self
            .carrier
            .streaming_start(
                &self.call_id,
                self.client_state.as_deref(),
                &self.command_id,
                &descriptor,
            )
            .await?;

        *self.stream_id.lock() = Some(stream_id.clone());
        *self.state.lock() = SessionState::Streaming;

        self.events.emit(
            TtsEventKind::StreamingStart {
                session_id: stream_id,
            },
            self.call_ref(),
        );

        let worker = Arc::clone(&self);
        let stop = self.stop_rx.clone();
        *self.uploader.lock() = Some(tokio::spawn(async move {
            worker.upload_loop(stop).await;
        }));

        tracing::info!(call_id = %self.call_id, "streaming session started");
        Ok(())
    }

    /// Enqueue a PCM chunk for upload.
    pub fn add_chunk(&self, chunk: AudioChunk) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(Error::SessionTerminated(self.call_id.clone()));
        }
        self.buffer.push(chunk)
    }

    /// Enqueue WAV-framed audio (decoded to a chunk first).
    pub fn add_wav(&self, wav: &[u8]) -> Result<()> {
        self.add_chunk(AudioChunk::from_wav(wav)?)
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Streaming => {
                *state = SessionState::Paused;
                Ok(())
            }
            other => Err(Error::InvalidInput(format!("cannot pause from {other:?}"))),
        }
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Paused => {
                *state = SessionState::Streaming;
                Ok(())
            }
            other => Err(Error::InvalidInput(format!("cannot resume from {other:?}"))),
        }
    }

    /// Drain the buffer, stop the carrier stream, and complete.
    pub async fn complete(&self) -> Result<()> {
        match self.state() {
            SessionState::Streaming | SessionState::Paused => {}
            SessionState::Completed => return Ok(()),
            other => {
                return Err(Error::SessionTerminated(format!(
                    "cannot complete from {other:?}"
                )))
            }
        }

        // Give the uploader time proportional to what is buffered.
        let buffered_ms = self.buffer.duration_ms();
        let drain_timeout = Duration::from_millis(buffered_ms as u64 + 5000);
        if !self.buffer.wait_until_empty(drain_timeout).await {
            tracing::warn!(
                call_id = %self.call_id,
                remaining_chunks = self.buffer.len(),
                "completing with undrained buffer"
            );
        }

        let _ = self.stop_tx.send(true);
        self.carrier.streaming_stop(&self.call_id).await?;
        *self.state.lock() = SessionState::Completed;

        self.events.emit(
            TtsEventKind::StreamingEnd {
                session_id: self.stream_id().unwrap_or_default(),
                status: "completed".into(),
            },
            self.call_ref(),
        );

        tracing::info!(call_id = %self.call_id, "streaming session completed");
        Ok(())
    }

    /// Abort path: stop the uploader, discard buffered audio, and mark
    /// the session failed or terminated.
    pub async fn terminate(&self, error: Option<String>) {
        let was_streaming = {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            let was_streaming =
                matches!(*state, SessionState::Streaming | SessionState::Paused);
            *state = if error.is_some() {
                SessionState::Error
            } else {
                SessionState::Terminated
            };
            was_streaming
        };

        let _ = self.stop_tx.send(true);
        let dropped = self.buffer.clear();
        if dropped > 0 {
            tracing::debug!(call_id = %self.call_id, dropped, "discarded buffered chunks");
        }

        if was_streaming {
            if let Err(e) = self.carrier.streaming_stop(&self.call_id).await {
                tracing::warn!(call_id = %self.call_id, error = %e, "streaming_stop during terminate failed");
            }
        }

        if let Some(error) = error {
            tracing::warn!(call_id = %self.call_id, error = %error, "streaming session terminated with error");
            self.events.emit(
                TtsEventKind::StreamingError {
                    session_id: self.stream_id().unwrap_or_default(),
                    error,
                },
                self.call_ref(),
            );
        } else {
            self.events.emit(
                TtsEventKind::StreamingEnd {
                    session_id: self.stream_id().unwrap_or_default(),
                    status: "terminated".into(),
                },
                self.call_ref(),
            );
        }
    }

    /// Frame a chunk for the carrier according to the session format.
    fn payload(&self, chunk: &AudioChunk) -> Result<Vec<u8>> {
        match self.format {
            AudioFormat::Wav => chunk.to_wav(),
            // Non-WAV sessions carry the provider's bytes verbatim.
            AudioFormat::Mp3 | AudioFormat::Raw => Ok(chunk.data.clone()),
        }
    }

    async fn upload_loop(self: Arc<Self>, stop: watch::Receiver<bool>) {
        tracing::debug!(call_id = %self.call_id, "uploader started");

        loop {
            if *stop.borrow() {
                break;
            }

            match self.state() {
                SessionState::Streaming => {}
                SessionState::Paused => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                _ => break,
            }

            let Some(chunk) = self.buffer.pop() else {
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            };

            let payload = match self.payload(&chunk) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(call_id = %self.call_id, error = %e, "unframeable chunk dropped");
                    continue;
                }
            };

            let started = Instant::now();
            let result = self
                .carrier
                .stream_chunk(&self.call_id, self.format.content_type(), &payload)
                .await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok(()) => {
                    {
                        let mut stats = self.stats.lock();
                        stats.total_chunks_sent += 1;
                        stats.total_bytes_sent += payload.len() as u64;
                        stats.consecutive_errors = 0;
                        stats.latencies_ms.push_back(latency_ms);
                        if stats.latencies_ms.len() > LATENCY_WINDOW {
                            stats.latencies_ms.pop_front();
                        }
                    }
                    self.events.emit(
                        TtsEventKind::ChunkUploaded {
                            session_id: self.stream_id().unwrap_or_default(),
                            bytes: payload.len(),
                            latency_ms,
                        },
                        self.call_ref(),
                    );
                }
                Err(e) => {
                    let consecutive = {
                        let mut stats = self.stats.lock();
                        stats.upload_errors += 1;
                        stats.consecutive_errors += 1;
                        stats.consecutive_errors
                    };
                    tracing::warn!(
                        call_id = %self.call_id,
                        error = %e,
                        consecutive,
                        "chunk upload failed"
                    );

                    if consecutive >= MAX_CONSECUTIVE_ERRORS {
                        self.terminate(Some(format!("too many consecutive upload errors: {e}")))
                            .await;
                        break;
                    }
                }
            }
        }

        tracing::debug!(call_id = %self.call_id, "uploader exited");
    }

    pub fn stats(&self) -> SessionStats {
        let stats = self.stats.lock();
        let avg = if stats.latencies_ms.is_empty() {
            0.0
        } else {
            stats.latencies_ms.iter().sum::<f64>() / stats.latencies_ms.len() as f64
        };
        SessionStats {
            total_chunks_sent: stats.total_chunks_sent,
            total_bytes_sent: stats.total_bytes_sent,
            upload_errors: stats.upload_errors,
            consecutive_errors: stats.consecutive_errors,
            avg_upload_latency_ms: avg,
        }
    }
}
