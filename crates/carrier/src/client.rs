//! Carrier HTTP client
//!
//! The call state machine talks to the carrier through [`CarrierApi`];
//! [`HttpCarrierClient`] is the production implementation. Retry-safe
//! requests retry on transport errors and 5xx/408/429; the streaming
//! chunk POST retries on transport errors only, never on a
//! server-acknowledged failure.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

use voxcall_core::{Error, Result};

/// Audio container accepted by the carrier's streaming endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    Raw,
}

impl AudioFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mp3",
            AudioFormat::Raw => "audio/raw",
        }
    }
}

/// Stream descriptor sent with `streaming_start`.
#[derive(Debug, Clone, Serialize)]
pub struct AudioDescriptor {
    pub content_type: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Result of the two-step media upload.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub id: String,
    pub public_url: String,
}

/// The carrier endpoints the engine depends on.
#[async_trait]
pub trait CarrierApi: Send + Sync + 'static {
    /// Open the audio stream for a call; returns the carrier stream id.
    async fn streaming_start(
        &self,
        call_id: &str,
        client_state: Option<&str>,
        command_id: &str,
        descriptor: &AudioDescriptor,
    ) -> Result<String>;

    /// Upload one audio chunk to a streaming call.
    async fn stream_chunk(&self, call_id: &str, content_type: &str, chunk: &[u8]) -> Result<()>;

    async fn streaming_stop(&self, call_id: &str) -> Result<()>;

    /// Two-step blob upload for non-realtime playback.
    async fn upload_media(&self, data: &[u8], content_type: &str) -> Result<MediaUpload>;

    async fn play_audio(&self, call_id: &str, audio_url: &str) -> Result<()>;

    async fn record_start(&self, call_id: &str) -> Result<()>;

    async fn record_stop(&self, call_id: &str) -> Result<()>;

    async fn hangup(&self, call_id: &str) -> Result<()>;
}

/// Production client over the carrier's JSON API.
pub struct HttpCarrierClient {
    client: Client,
    api_base: String,
    api_key: String,
    retry_attempts: u32,
    retry_backoff_factor: f64,
}

impl HttpCarrierClient {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        retry_attempts: u32,
        retry_backoff_factor: f64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("carrier http client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.into(),
            api_key: api_key.into(),
            retry_attempts: retry_attempts.max(1),
            retry_backoff_factor,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }

    fn call_action(&self, call_id: &str, action: &str) -> String {
        self.url(&format!("calls/{call_id}/actions/{action}"))
    }

    fn transport_error(e: &reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(format!("carrier: {e}"))
        } else {
            Error::ProviderUnavailable(format!("carrier unreachable: {e}"))
        }
    }

    async fn rejection(response: Response) -> Error {
        let status = response.status();
        let detail = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| {
                body.get("errors")?
                    .get(0)?
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();
        Error::CarrierRejected(format!("HTTP {status}: {detail}"))
    }

    fn status_is_retryable(status: StatusCode) -> bool {
        status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
    }

    /// Send with exponential backoff. `retry_rejections` controls whether
    /// retryable HTTP statuses are retried; transport errors always are.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> RequestBuilder,
        retry_rejections: bool,
    ) -> Result<Response> {
        let mut last_error = None;

        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                let backoff = self.retry_backoff_factor * f64::from(1u32 << (attempt - 1));
                let jitter = rand::thread_rng().gen_range(0.8..=1.2);
                tokio::time::sleep(Duration::from_secs_f64(backoff * jitter)).await;
            }

            match build().bearer_auth(&self.api_key).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let retryable = Self::status_is_retryable(response.status());
                    if retryable && retry_rejections && attempt + 1 < self.retry_attempts {
                        tracing::warn!(
                            status = %response.status(),
                            attempt,
                            "carrier request failed, retrying"
                        );
                        last_error = Some(Self::rejection(response).await);
                        continue;
                    }
                    return Err(Self::rejection(response).await);
                }
                Err(e) => {
                    if attempt + 1 < self.retry_attempts {
                        tracing::warn!(error = %e, attempt, "carrier transport error, retrying");
                        last_error = Some(Self::transport_error(&e));
                        continue;
                    }
                    return Err(Self::transport_error(&e));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::ProviderUnavailable("carrier retries exhausted".into())))
    }
}

#[async_trait]
impl CarrierApi for HttpCarrierClient {
    async fn streaming_start(
        &self,
        call_id: &str,
        client_state: Option<&str>,
        command_id: &str,
        descriptor: &AudioDescriptor,
    ) -> Result<String> {
        let url = self.call_action(call_id, "streaming_start");
        let body = serde_json::json!({
            "client_state": client_state,
            "command_id": command_id,
            "audio_stream": descriptor,
        });

        let response = self
            .send_with_retry(|| self.client.post(&url).json(&body), true)
            .await?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::CarrierRejected(format!("streaming_start body: {e}")))?;

        payload
            .get("data")
            .and_then(|d| d.get("stream_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::CarrierRejected("streaming_start returned no stream_id".into()))
    }

    async fn stream_chunk(&self, call_id: &str, content_type: &str, chunk: &[u8]) -> Result<()> {
        let url = self.call_action(call_id, "streaming");
        let chunk = chunk.to_vec();
        let content_type = content_type.to_string();

        // Audio chunks are not idempotent server-side: a rejection is
        // final, only transport errors retry.
        self.send_with_retry(
            || {
                self.client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, content_type.clone())
                    .body(chunk.clone())
            },
            false,
        )
        .await?;
        Ok(())
    }

    async fn streaming_stop(&self, call_id: &str) -> Result<()> {
        let url = self.call_action(call_id, "streaming_stop");
        self.send_with_retry(|| self.client.post(&url), true)
            .await?;
        Ok(())
    }

    async fn upload_media(&self, data: &[u8], content_type: &str) -> Result<MediaUpload> {
        // Step 1: register the blob, receiving an upload URL.
        let url = self.url("media");
        let body = serde_json::json!({ "content_type": content_type });
        let response = self
            .send_with_retry(|| self.client.post(&url).json(&body), true)
            .await?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::CarrierRejected(format!("media body: {e}")))?;
        let media = payload
            .get("data")
            .ok_or_else(|| Error::CarrierRejected("media response missing data".into()))?;

        let id = media
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::CarrierRejected("media response missing id".into()))?
            .to_string();
        let upload_url = media
            .get("upload_url")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::CarrierRejected("media response missing upload_url".into()))?
            .to_string();
        let public_url = media
            .get("public_url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // Step 2: PUT the bytes to the signed URL (no bearer auth).
        let data = data.to_vec();
        let content_type = content_type.to_string();
        let mut last_error = None;
        for attempt in 0..self.retry_attempts {
            match self
                .client
                .put(&upload_url)
                .header(reqwest::header::CONTENT_TYPE, content_type.clone())
                .body(data.clone())
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    return Ok(MediaUpload { id, public_url });
                }
                Ok(response) => return Err(Self::rejection(response).await),
                Err(e) => {
                    last_error = Some(Self::transport_error(&e));
                    if attempt + 1 < self.retry_attempts {
                        let backoff = self.retry_backoff_factor * f64::from(1u32 << attempt);
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::ProviderUnavailable("media upload failed".into())))
    }

    async fn play_audio(&self, call_id: &str, audio_url: &str) -> Result<()> {
        let url = self.call_action(call_id, "play_audio");
        let body = serde_json::json!({ "audio_url": audio_url });
        self.send_with_retry(|| self.client.post(&url).json(&body), true)
            .await?;
        Ok(())
    }

    async fn record_start(&self, call_id: &str) -> Result<()> {
        let url = self.call_action(call_id, "record_start");
        self.send_with_retry(|| self.client.post(&url), true)
            .await?;
        Ok(())
    }

    async fn record_stop(&self, call_id: &str) -> Result<()> {
        let url = self.call_action(call_id, "record_stop");
        self.send_with_retry(|| self.client.post(&url), true)
            .await?;
        Ok(())
    }

    async fn hangup(&self, call_id: &str) -> Result<()> {
        let url = self.call_action(call_id, "hangup");
        self.send_with_retry(|| self.client.post(&url), true)
            .await?;
        Ok(())
    }
}
