//! Generic JSON-over-HTTP TTS backend
//!
//! Covers the cloud providers: one base URL, bearer auth, a `synthesize`
//! endpoint returning audio bytes and a chunked `synthesize/stream`
//! variant. Backend-specific shapes are handled by configuration rather
//! than per-vendor structs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

use voxcall_core::{Error, Result};

use super::{
    drain_complete_sentences, AudioStream, Capability, CapabilitySet, HealthStatus,
    ProviderHealthReport, SynthesisRequest, TtsProvider, VoiceInfo,
};

/// Configuration for an HTTP backend.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Provider name used in cache keys and logs
    pub name: String,
    /// API base URL, no trailing slash
    pub endpoint: String,
    /// Bearer token; empty disables the Authorization header
    pub api_key: String,
    /// Per-request deadline
    pub timeout: Duration,
    /// Voices the backend accepts; empty means unrestricted
    pub voices: Vec<String>,
    /// Voice argument is a natural-language style instruction
    pub voice_style: bool,
    /// Extra request parameters that affect the audio output
    pub cache_params: Vec<String>,
}

impl HttpProviderConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
            voices: Vec::new(),
            voice_style: false,
            cache_params: Vec::new(),
        }
    }

    /// Build from the provider's settings section.
    pub fn from_settings(
        name: impl Into<String>,
        settings: &voxcall_config::ProviderSettings,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
            timeout: Duration::from_secs(settings.timeout_s),
            voices: settings.voices.clone(),
            voice_style: settings.voice_style,
            cache_params: settings.cache_params.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SynthesizeBody<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    speed: f32,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    extras: HashMap<&'a str, &'a str>,
}

struct HttpSession {
    voice: Option<String>,
    speed: f32,
    buffer: String,
}

/// HTTP TTS backend.
pub struct HttpTtsProvider {
    config: HttpProviderConfig,
    capabilities: CapabilitySet,
    client: Client,
    sessions: DashMap<String, HttpSession>,
}

impl HttpTtsProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(Error::Config(format!(
                "provider {} has no endpoint",
                config.name
            )));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;

        let mut capabilities = vec![Capability::Batch, Capability::Stream, Capability::Incremental];
        if config.voice_style {
            capabilities.push(Capability::VoiceStyle);
        }

        Ok(Self {
            capabilities: CapabilitySet::new(capabilities),
            client,
            sessions: DashMap::new(),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.config.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.config.api_key)
        }
    }

    /// Map a transport failure onto the engine taxonomy.
    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(format!("{}: {e}", self.config.name))
        } else {
            Error::ProviderUnavailable(format!("{}: {e}", self.config.name))
        }
    }

    /// Map a non-2xx response onto the engine taxonomy.
    async fn status_error(&self, response: Response) -> Error {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        let detail = detail.chars().take(200).collect::<String>();
        let name = &self.config.name;

        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Error::InvalidInput(format!("{name}: {detail}"))
            }
            StatusCode::REQUEST_TIMEOUT => Error::Timeout(format!("{name}: {detail}")),
            StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(format!("{name}: {detail}")),
            s if s.is_server_error() => {
                Error::ProviderUnavailable(format!("{name}: HTTP {s}: {detail}"))
            }
            s => Error::ProviderUnavailable(format!("{name}: HTTP {s}: {detail}")),
        }
    }

    async fn post_synthesize(&self, path: &str, request: &SynthesisRequest) -> Result<Response> {
        let body = SynthesizeBody {
            text: &request.text,
            voice: request.voice.as_deref(),
            speed: request.speed,
            extras: request
                .extras
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
        };

        let response = self
            .apply_auth(self.client.post(self.url(path)))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }

        Ok(response)
    }
}

#[async_trait]
impl TtsProvider for HttpTtsProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    fn cache_params(&self) -> Vec<String> {
        self.config.cache_params.clone()
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        if request.text.is_empty() {
            return Err(Error::InvalidInput("empty text".into()));
        }

        let response = self.post_synthesize("synthesize", request).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;

        tracing::debug!(
            provider = %self.config.name,
            bytes = bytes.len(),
            "synthesized audio"
        );
        Ok(bytes.to_vec())
    }

    async fn synthesize_stream(&self, request: &SynthesisRequest) -> Result<AudioStream> {
        if request.text.is_empty() {
            return Err(Error::InvalidInput("empty text".into()));
        }

        let response = self.post_synthesize("synthesize/stream", request).await?;
        let name = self.config.name.clone();

        let stream = response.bytes_stream().map(move |item| match item {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(e) if e.is_timeout() => Err(Error::Timeout(format!("{name}: {e}"))),
            Err(e) => Err(Error::ProviderUnavailable(format!("{name}: {e}"))),
        });

        Ok(Box::pin(stream))
    }

    async fn begin_session(
        &self,
        session_id: &str,
        voice: Option<&str>,
        speed: f32,
    ) -> Result<()> {
        self.sessions.insert(
            session_id.to_string(),
            HttpSession {
                voice: voice.map(str::to_string),
                speed,
                buffer: String::new(),
            },
        );
        Ok(())
    }

    async fn add_session_text(&self, session_id: &str, text: &str) -> Result<Vec<Vec<u8>>> {
        let (sentences, voice, speed) = {
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
            (sentences, session.voice.clone(), session.speed)
        };

        let mut chunks = Vec::with_capacity(sentences.len());
        for sentence in sentences {
            let mut request = SynthesisRequest::new(sentence).with_speed(speed);
            request.voice = voice.clone();
            chunks.push(self.synthesize(&request).await?);
        }
        Ok(chunks)
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

        let mut request = SynthesisRequest::new(remainder).with_speed(session.speed);
        request.voice = session.voice.clone();
        Ok(vec![self.synthesize(&request).await?])
    }

    fn list_voices(&self) -> Vec<VoiceInfo> {
        self.config.voices.iter().map(VoiceInfo::new).collect()
    }

    fn has_voice(&self, voice_id: &str) -> bool {
        // Style providers accept any instruction; unrestricted backends
        // accept any id.
        self.config.voice_style || self.config.voices.is_empty()
            || self.config.voices.iter().any(|v| v == voice_id)
    }

    async fn health_check(&self) -> ProviderHealthReport {
        let response = self
            .apply_auth(self.client.get(self.url("health")))
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => {
                // A JSON body may refine the status; a bare 200 is "ok".
                match r.json::<Value>().await {
                    Ok(body) => match body.get("status").and_then(Value::as_str) {
                        Some("ok") | Some("healthy") | None => ProviderHealthReport::ok(),
                        Some("degraded") => ProviderHealthReport {
                            status: HealthStatus::Degraded,
                            detail: body
                                .get("detail")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        },
                        Some(other) => ProviderHealthReport::error(other.to_string()),
                    },
                    Err(_) => ProviderHealthReport::ok(),
                }
            }
            Ok(r) => ProviderHealthReport::error(format!("HTTP {}", r.status())),
            Err(e) => ProviderHealthReport::error(e.to_string()),
        }
    }
}
