//! TTS provider abstraction
//!
//! One trait over every backend. Capability advertising is authoritative:
//! callers consult [`TtsProvider::capabilities`] before invoking the
//! optional streaming and incremental-session methods.

use std::collections::{BTreeMap, HashSet};
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use voxcall_core::{Error, Result};

mod http;
mod null;

pub use http::{HttpProviderConfig, HttpTtsProvider};
pub use null::NullTtsProvider;

/// Stream of opaque audio byte chunks from a provider.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Optional behaviours a backend may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// One-shot synthesis returning complete audio
    Batch,
    /// Chunked synthesis via [`TtsProvider::synthesize_stream`]
    Stream,
    /// Incremental text sessions (begin/add/end)
    Incremental,
    /// The voice argument is a free-form style instruction, not an id
    VoiceStyle,
}

/// Set of advertised capabilities.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet(HashSet<Capability>);

impl CapabilitySet {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self(capabilities.into_iter().collect())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

/// One synthesizable voice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceInfo {
    pub id: String,
    pub name: String,
}

impl VoiceInfo {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }
}

/// Health probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Degraded,
    Error,
}

/// Result of [`TtsProvider::health_check`].
#[derive(Debug, Clone)]
pub struct ProviderHealthReport {
    pub status: HealthStatus,
    pub detail: Option<String>,
}

impl ProviderHealthReport {
    pub fn ok() -> Self {
        Self {
            status: HealthStatus::Ok,
            detail: None,
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            detail: Some(detail.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthStatus::Ok | HealthStatus::Degraded)
    }
}

/// Parameters for one synthesis.
///
/// `extras` is ordered so cache keys derived from it are deterministic.
#[derive(Debug, Clone, Default)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: Option<String>,
    pub speed: f32,
    pub extras: BTreeMap<String, String>,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            speed: 1.0,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }
}

/// Uniform contract over TTS backends.
///
/// Failures surface as the engine error taxonomy: `ProviderUnavailable`,
/// `RateLimited` and `Timeout` are retry-eligible, `InvalidInput` is not.
#[async_trait]
pub trait TtsProvider: Send + Sync + 'static {
    /// Stable backend name (also part of every cache key)
    fn name(&self) -> &str;

    fn capabilities(&self) -> &CapabilitySet;

    /// Extra request parameters that affect the audio output.
    ///
    /// The facade refuses extras outside this list so unknown parameters
    /// can never cause silent cache collisions.
    fn cache_params(&self) -> Vec<String> {
        Vec::new()
    }

    /// Synthesize the full audio for a request.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>>;

    /// Synthesize as a chunk stream. Only valid when [`Capability::Stream`]
    /// is advertised.
    async fn synthesize_stream(&self, request: &SynthesisRequest) -> Result<AudioStream> {
        let _ = request;
        Err(Error::InvalidInput(format!(
            "{} does not support streaming",
            self.name()
        )))
    }

    /// Open an incremental session. Only valid with [`Capability::Incremental`].
    async fn begin_session(
        &self,
        session_id: &str,
        voice: Option<&str>,
        speed: f32,
    ) -> Result<()> {
        let _ = (session_id, voice, speed);
        Err(Error::InvalidInput(format!(
            "{} does not support incremental sessions",
            self.name()
        )))
    }

    /// Feed text into a session. Returns audio for sentences the added
    /// text completed.
    async fn add_session_text(&self, session_id: &str, text: &str) -> Result<Vec<Vec<u8>>> {
        let _ = (session_id, text);
        Err(Error::InvalidInput(format!(
            "{} does not support incremental sessions",
            self.name()
        )))
    }

    /// Close a session, flushing any buffered text.
    async fn end_session(&self, session_id: &str) -> Result<Vec<Vec<u8>>> {
        let _ = session_id;
        Err(Error::InvalidInput(format!(
            "{} does not support incremental sessions",
            self.name()
        )))
    }

    fn list_voices(&self) -> Vec<VoiceInfo>;

    fn has_voice(&self, voice_id: &str) -> bool {
        self.list_voices().iter().any(|v| v.id == voice_id)
    }

    async fn health_check(&self) -> ProviderHealthReport;
}

/// Split buffered session text at sentence boundaries.
///
/// Returns the complete sentences and the unfinished remainder. Shared by
/// incremental-session implementations.
pub(crate) fn drain_complete_sentences(buffer: &str) -> (Vec<String>, String) {
    let mut sentences = Vec::new();
    let mut start = 0;
    let chars: Vec<(usize, char)> = buffer.char_indices().collect();

    for (i, &(pos, c)) in chars.iter().enumerate() {
        if matches!(c, '.' | '!' | '?') {
            let next = chars.get(i + 1).map(|&(_, n)| n);
            if next.is_none() || next.is_some_and(|n| n.is_whitespace()) {
                let end = pos + c.len_utf8();
                let sentence = buffer[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = end;
            }
        }
    }

    (sentences, buffer[start..].trim_start().to_string())
}
