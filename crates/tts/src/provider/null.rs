//! Offline silence provider
//!
//! Produces valid WAV silence sized to the input text. Used as the
//! last-resort fallback when every cloud backend is down, and by tests
//! that need a deterministic provider without network access.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use voxcall_core::{AudioChunk, Error, Result};

use super::{
    drain_complete_sentences, AudioStream, Capability, CapabilitySet, ProviderHealthReport,
    SynthesisRequest, TtsProvider, VoiceInfo,
};

/// Approximate speech pacing used to size the silence
const MS_PER_CHAR: f64 = 50.0;

const SAMPLE_RATE: u32 = 8000;
const SAMPLE_WIDTH: u16 = 2;
const CHANNELS: u16 = 1;

struct NullSession {
    speed: f32,
    buffer: String,
}

/// Provider that synthesizes silence.
pub struct NullTtsProvider {
    name: String,
    capabilities: CapabilitySet,
    voices: Vec<VoiceInfo>,
    sessions: DashMap<String, NullSession>,
    /// Error injected into the next `fail_remaining` synth calls (tests
    /// and fault drills)
    injected_failure: Mutex<Option<Error>>,
    fail_remaining: AtomicU32,
}

impl NullTtsProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: CapabilitySet::new([
                Capability::Batch,
                Capability::Stream,
                Capability::Incremental,
            ]),
            voices: vec![VoiceInfo::new("default")],
            sessions: DashMap::new(),
            injected_failure: Mutex::new(None),
            fail_remaining: AtomicU32::new(0),
        }
    }

    pub fn with_voices(mut self, voices: impl IntoIterator<Item = String>) -> Self {
        self.voices = voices.into_iter().map(VoiceInfo::new).collect();
        self
    }

    /// Make the next `times` synthesis calls fail with `error`.
    pub fn inject_failure(&self, error: Error, times: u32) {
        *self.injected_failure.lock() = Some(error);
        self.fail_remaining.store(times, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> Option<Error> {
        if self.fail_remaining.load(Ordering::SeqCst) == 0 {
            return None;
        }
        if self.fail_remaining.fetch_sub(1, Ordering::SeqCst) == 0 {
            self.fail_remaining.store(0, Ordering::SeqCst);
            return None;
        }
        self.injected_failure.lock().clone()
    }

    fn render(&self, text: &str, speed: f32) -> Result<Vec<u8>> {
        if text.is_empty() {
            return Err(Error::InvalidInput("empty text".into()));
        }
        let speed = if speed > 0.0 { speed } else { 1.0 };
        let duration_ms = text.chars().count() as f64 * MS_PER_CHAR / speed as f64;
        AudioChunk::silence(duration_ms, SAMPLE_RATE, SAMPLE_WIDTH, CHANNELS).to_wav()
    }
}

#[async_trait]
impl TtsProvider for NullTtsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        if let Some(error) = self.take_injected_failure() {
            return Err(error);
        }
        self.render(&request.text, request.speed)
    }

    async fn synthesize_stream(&self, request: &SynthesisRequest) -> Result<AudioStream> {
        if let Some(error) = self.take_injected_failure() {
            return Err(error);
        }

        let audio = self.render(&request.text, request.speed)?;

        // Emit in three chunks to exercise consumers' chunk handling.
        let chunk_len = audio.len().div_ceil(3).max(1);
        let chunks: Vec<Result<Vec<u8>>> = audio
            .chunks(chunk_len)
            .map(|c| Ok(c.to_vec()))
            .collect();

        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn begin_session(
        &self,
        session_id: &str,
        _voice: Option<&str>,
        speed: f32,
    ) -> Result<()> {
        self.sessions.insert(
            session_id.to_string(),
            NullSession {
                speed,
                buffer: String::new(),
            },
        );
        Ok(())
    }

    async fn add_session_text(&self, session_id: &str, text: &str) -> Result<Vec<Vec<u8>>> {
        let (sentences, speed) = {
            let mut session = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

            if !session.buffer.is_empty() && !session.buffer.ends_with(char::is_whitespace) {
                session.buffer.push(' ');
            }
            session.buffer.push_str(text);

            let (sentences, rest) = drain_complete_sentences(&session.buffer);
            session.buffer = rest;
            (sentences, session.speed)
        };

        sentences
            .into_iter()
            .map(|sentence| self.render(&sentence, speed))
            .collect()
    }

    async fn end_session(&self, session_id: &str) -> Result<Vec<Vec<u8>>> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let remainder = session.buffer.trim();
        if remainder.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![self.render(remainder, session.speed)?])
    }

    fn list_voices(&self) -> Vec<VoiceInfo> {
        self.voices.clone()
    }

    async fn health_check(&self) -> ProviderHealthReport {
        ProviderHealthReport::ok()
    }
}
