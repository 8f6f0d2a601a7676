//! TTS facade
//!
//! Public entry points for the call state machine. Composes the provider
//! registry, fallback controller, pools, cache, fragmenter, and
//! predictive generator behind a handful of operations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use voxcall_carrier::{CarrierApi, MediaUpload};
use voxcall_config::Settings;
use voxcall_core::{CallId, Error, EventBus, Result, TtsEventKind};

use crate::cache::{CacheKey, CacheStats, FsTier, KvTier, MemoryTier, SharedKv, TierStats, TieredCache};
use crate::fallback::{FallbackController, FallbackSnapshot};
use crate::fragmenter::DialogFragmenter;
use crate::pool::{PoolManager, PoolStats, ProviderFactory};
use crate::predictive::{
    BackgroundSynthesizer, CallSynthesisDefaults, PredictiveGenerator, PredictiveStats,
};
use crate::provider::{AudioStream, Capability, SynthesisRequest, TtsProvider};

/// Interval of the pool maintenance loop.
const POOL_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Interval of the filesystem cache sweep.
const FS_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Aggregated health view returned by [`TtsService::health`].
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    pub fallback: FallbackSnapshot,
    pub cache: CacheStats,
    pub cache_tiers: Vec<TierStats>,
    pub pools: HashMap<String, PoolStats>,
    pub prediction: PredictiveStats,
}

/// The TTS engine facade.
pub struct TtsService {
    settings: Settings,
    events: EventBus,
    cache: Arc<TieredCache>,
    fs_tier: Option<Arc<FsTier>>,
    fallback: Arc<FallbackController>,
    pools: Arc<PoolManager>,
    fragmenter: Arc<DialogFragmenter>,
    predictive: Arc<PredictiveGenerator>,
    carrier: Option<Arc<dyn CarrierApi>>,

    stop_tx: watch::Sender<bool>,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TtsService {
    /// Assemble the engine from settings and a provider registry.
    ///
    /// `kv` supplies the shared store backing the KV cache tier (ignored
    /// unless that tier is enabled); `carrier` enables
    /// `synthesize_and_upload`. Must run inside a Tokio runtime: the
    /// prediction worker pool is spawned here.
    pub fn new(
        settings: Settings,
        providers: Vec<Arc<dyn TtsProvider>>,
        kv: Option<Arc<dyn SharedKv>>,
        carrier: Option<Arc<dyn CarrierApi>>,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        if providers.is_empty() {
            return Err(Error::Config("no providers registered".into()));
        }

        // Cache tiers, fastest first.
        let mut tiers: Vec<Arc<dyn crate::cache::CacheTier>> = vec![Arc::new(MemoryTier::new(
            settings.cache.memory.max_entries,
            Duration::from_secs(settings.cache.memory.ttl_s),
        ))];

        if settings.cache.kv.enabled {
            match &kv {
                Some(kv) => tiers.push(Arc::new(KvTier::new(
                    Arc::clone(kv),
                    settings.cache.kv.prefix.clone(),
                    Duration::from_secs(settings.cache.kv.ttl_s),
                ))),
                None => {
                    return Err(Error::Config(
                        "cache.kv.enabled requires a shared KV store".into(),
                    ))
                }
            }
        }

        let mut fs_tier = None;
        if settings.cache.filesystem.enabled {
            let dir = if settings.cache.filesystem.dir.is_empty() {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir)
                    .join(".voxcall_cache")
            } else {
                PathBuf::from(&settings.cache.filesystem.dir)
            };
            let tier = Arc::new(FsTier::new(
                dir,
                settings.cache.filesystem.max_bytes,
                Duration::from_secs(settings.cache.filesystem.ttl_s),
            )?);
            fs_tier = Some(Arc::clone(&tier));
            tiers.push(tier);
        }

        let cache = Arc::new(TieredCache::new(tiers));

        let fallback = Arc::new(FallbackController::new(
            providers.clone(),
            settings.default_provider.clone(),
            settings.fallback_providers.clone(),
            settings.fallback.clone(),
            events.clone(),
        )?);

        // Shared provider instances back the pool entries; the pool still
        // bounds concurrent use per (provider, voice).
        let registry: HashMap<String, Arc<dyn TtsProvider>> = providers
            .iter()
            .map(|p| (p.name().to_string(), Arc::clone(p)))
            .collect();
        let factory: ProviderFactory = Arc::new(move |name: &str| {
            registry
                .get(name)
                .map(Arc::clone)
                .ok_or_else(|| Error::Config(format!("unknown provider {name}")))
        });
        let pools = Arc::new(PoolManager::new(settings.pool.clone(), factory));

        let fragmenter = Arc::new(DialogFragmenter::new(settings.dialog.clone()));

        let (stop_tx, _) = watch::channel(false);

        // Background synthesis goes through the registry so predictive
        // tasks honour the same provider health state as live requests.
        let predictive = PredictiveGenerator::new(
            Arc::clone(&cache),
            Arc::new(RegistrySynthesizer {
                fallback: Arc::clone(&fallback),
            }),
            events.clone(),
            settings.prediction.depth,
            settings.prediction.workers,
            settings.prediction.enabled,
        );

        Ok(Arc::new(Self {
            predictive,
            settings,
            events,
            cache,
            fs_tier,
            fallback,
            pools,
            fragmenter,
            carrier,
            stop_tx,
            background: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the engine's background loops (fallback health, pool
    /// maintenance, filesystem cache sweep). Call once after `new`.
    pub fn start_background_tasks(&self) {
        let mut handles = self.background.lock();
        if !handles.is_empty() {
            return;
        }

        handles.push(
            Arc::clone(&self.fallback).spawn_health_loop(self.stop_tx.subscribe()),
        );
        handles.push(
            Arc::clone(&self.pools)
                .spawn_maintenance(POOL_MAINTENANCE_INTERVAL, self.stop_tx.subscribe()),
        );
        if let Some(fs) = &self.fs_tier {
            handles.push(
                Arc::clone(fs).spawn_cleanup(FS_CACHE_SWEEP_INTERVAL, self.stop_tx.subscribe()),
            );
        }
    }

    /// Stop background loops, pools, and prediction workers.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        self.predictive.shutdown();
        self.pools.shutdown();
        self.background.lock().clear();
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn fragmenter(&self) -> &Arc<DialogFragmenter> {
        &self.fragmenter
    }

    pub fn predictive(&self) -> &Arc<PredictiveGenerator> {
        &self.predictive
    }

    // Helpers -------------------------------------------------------------

    /// Map a logical voice id for a provider; unknown ids pass through.
    fn map_voice(&self, voice: Option<&str>, provider: &str) -> Option<String> {
        map_voice_in(&self.settings.voice_map, voice, provider)
    }

    /// Refuse extras a provider has not published as cache-affecting.
    fn check_extras(provider: &dyn TtsProvider, request: &SynthesisRequest) -> Result<()> {
        if request.extras.is_empty() {
            return Ok(());
        }
        let known = provider.cache_params();
        for key in request.extras.keys() {
            if !known.iter().any(|k| k == key) {
                return Err(Error::InvalidInput(format!(
                    "provider {} does not declare cache parameter {key}",
                    provider.name()
                )));
            }
        }
        Ok(())
    }

    fn cache_key(provider: &str, request: &SynthesisRequest) -> CacheKey {
        CacheKey::compute(
            &request.text,
            provider,
            request.voice.as_deref(),
            request.speed,
            &request.extras,
        )
    }

    /// Synthesize on a specific provider through its pool, with events.
    async fn generate_on(
        &self,
        provider_name: &str,
        request: &SynthesisRequest,
        call: Option<&CallId>,
    ) -> Result<Vec<u8>> {
        if let Some(provider) = self.fallback.provider(provider_name) {
            Self::check_extras(provider.as_ref(), request)?;
        }

        let voice_key = request.voice.as_deref().unwrap_or("default");
        let checkout = self.pools.checkout(provider_name, voice_key).await?;
        let provider = Arc::clone(checkout.provider());

        self.events.emit(
            TtsEventKind::GenerationStart {
                provider: provider_name.to_string(),
                text_len: request.text.len(),
            },
            call.cloned(),
        );

        let started = Instant::now();
        let result = provider.synthesize(request).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(audio) => {
                checkout.release(false);
                self.fallback.record_success(provider_name);
                self.events.emit(
                    TtsEventKind::GenerationEnd {
                        provider: provider_name.to_string(),
                        duration_ms: elapsed_ms,
                        bytes: audio.len(),
                    },
                    call.cloned(),
                );
                Ok(audio)
            }
            Err(e) => {
                checkout.release(true);
                self.events.emit(
                    TtsEventKind::GenerationError {
                        provider: provider_name.to_string(),
                        error: e.to_string(),
                    },
                    call.cloned(),
                );
                Err(e)
            }
        }
    }

    // Public operations ---------------------------------------------------

    /// Full-audio synthesis with cache and single-fallback retry.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
        speed: f32,
        use_cache: bool,
        call: Option<&CallId>,
    ) -> Result<Vec<u8>> {
        let mut request = SynthesisRequest::new(text).with_speed(speed);
        request.voice = voice.map(str::to_string);
        self.synthesize_request(request, use_cache, call).await
    }

    /// Like [`Self::synthesize`] but with full request control, including
    /// provider extras.
    pub async fn synthesize_request(
        &self,
        request: SynthesisRequest,
        use_cache: bool,
        call: Option<&CallId>,
    ) -> Result<Vec<u8>> {
        if request.text.is_empty() {
            return Err(Error::InvalidInput("empty text".into()));
        }

        let logical_voice = request.voice.clone();
        let provider_name = self.fallback.current_name();
        let mut request = request;
        request.voice = self.map_voice(logical_voice.as_deref(), &provider_name);

        let key = Self::cache_key(&provider_name, &request);
        if use_cache {
            if let Some(audio) = self.cache.get(&key).await {
                self.events.emit(
                    TtsEventKind::CacheHit {
                        tier: "tiered".into(),
                    },
                    call.cloned(),
                );
                return Ok(audio);
            }
            self.events.emit(TtsEventKind::CacheMiss, call.cloned());
        }

        match self.generate_on(&provider_name, &request, call).await {
            Ok(audio) => {
                if use_cache {
                    self.cache.set(&key, &audio).await;
                }
                Ok(audio)
            }
            Err(e) if e.is_retryable() || matches!(e, Error::PoolExhausted(_)) => {
                let (switched, fallback_provider) = self.fallback.try_fallback(&e);
                if !switched {
                    return Err(e);
                }

                // Re-map the voice for the new backend; the cache entry is
                // keyed per provider.
                let fallback_name = fallback_provider.name().to_string();
                let mut retry = request.clone();
                retry.voice = self.map_voice(logical_voice.as_deref(), &fallback_name);
                let retry_key = Self::cache_key(&fallback_name, &retry);

                let audio = self.generate_on(&fallback_name, &retry, call).await?;
                if use_cache {
                    self.cache.set(&retry_key, &audio).await;
                }
                Ok(audio)
            }
            Err(e) => Err(e),
        }
    }

    /// Find a provider advertising a capability: the current one if
    /// possible, else the first registered fallback that has it.
    fn provider_with_capability(&self, capability: Capability) -> Result<Arc<dyn TtsProvider>> {
        self.fallback.first_capable(capability)
    }

    /// Chunked synthesis. Requires a stream-capable provider; falls back
    /// to a capable one when the current provider cannot stream.
    pub async fn synthesize_stream(
        &self,
        text: &str,
        voice: Option<&str>,
        speed: f32,
    ) -> Result<AudioStream> {
        if text.is_empty() {
            return Err(Error::InvalidInput("empty text".into()));
        }

        let provider = self.provider_with_capability(Capability::Stream)?;
        let mut request = SynthesisRequest::new(text).with_speed(speed);
        request.voice = self.map_voice(voice, provider.name());

        match provider.synthesize_stream(&request).await {
            Ok(stream) => Ok(self.stream_with_midstream_fallback(stream, request)),
            Err(e) if e.is_retryable() => {
                // Nothing yielded yet: a clean retry on a fallback.
                let (switched, fallback_provider) = self.fallback.try_fallback(&e);
                if !switched || !fallback_provider.capabilities().contains(Capability::Stream) {
                    return Err(e);
                }
                let mut retry = request.clone();
                retry.voice = self.map_voice(voice, fallback_provider.name());
                let stream = fallback_provider.synthesize_stream(&retry).await?;
                Ok(self.stream_with_midstream_fallback(stream, retry))
            }
            Err(e) => Err(e),
        }
    }

    /// Wrap a provider stream so that an error before the first chunk
    /// retries once on a fallback. Once audio has been yielded the chunks
    /// stand and the error is surfaced.
    fn stream_with_midstream_fallback(
        &self,
        upstream: AudioStream,
        request: SynthesisRequest,
    ) -> AudioStream {
        let fallback = Arc::clone(&self.fallback);
        Box::pin(stream! {
            let mut upstream = upstream;
            let mut yielded = false;
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) => {
                        yielded = true;
                        yield Ok(chunk);
                    }
                    Err(e) if e.is_retryable() && !yielded => {
                        let (switched, provider) = fallback.try_fallback(&e);
                        if !switched || !provider.capabilities().contains(Capability::Stream) {
                            yield Err(e);
                            return;
                        }
                        match provider.synthesize_stream(&request).await {
                            Ok(mut retry_stream) => {
                                while let Some(item) = retry_stream.next().await {
                                    yield item;
                                }
                                return;
                            }
                            Err(retry_err) => {
                                yield Err(retry_err);
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        })
    }

    /// Dialog-paced streaming: fragments with inter-fragment pauses and
    /// lifecycle events. Interruption stops emission at the next fragment
    /// boundary.
    pub async fn synthesize_dialog_stream(
        &self,
        text: &str,
        voice: Option<&str>,
        speed: f32,
        urgency: f32,
        turn_id: Option<String>,
        call: Option<CallId>,
    ) -> Result<AudioStream> {
        if text.is_empty() {
            return Err(Error::InvalidInput("empty text".into()));
        }

        // The whole turn runs on one stream-capable provider unless a
        // fragment fails over mid-turn.
        self.provider_with_capability(Capability::Stream)?;

        let fragments = self
            .fragmenter
            .fragment_turn(text, urgency, turn_id.clone());
        let turn_id = fragments
            .first()
            .map(|f| f.turn_id.clone())
            .unwrap_or_default();

        self.fragmenter.begin_turn();
        self.events.emit(
            TtsEventKind::DialogTurnStart {
                turn_id: turn_id.clone(),
                text_len: text.len(),
            },
            call.clone(),
        );

        let fragmenter = Arc::clone(&self.fragmenter);
        let events = self.events.clone();
        let fallback = Arc::clone(&self.fallback);
        let voice_map = self.settings.voice_map.clone();
        let voice = voice.map(str::to_string);
        let text = text.to_string();

        Ok(Box::pin(stream! {
            let started = Instant::now();
            let mut first_chunk_seen = false;
            let mut emitted = 0usize;

            for fragment in fragments {
                if fragmenter.is_interrupted() {
                    tracing::debug!(turn_id = %turn_id, "dialog turn interrupted");
                    break;
                }

                events.emit(
                    TtsEventKind::FragmentProcessing {
                        turn_id: fragment.turn_id.clone(),
                        index: fragment.index,
                    },
                    call.clone(),
                );

                let provider = match fallback.first_capable(Capability::Stream) {
                    Ok(p) => p,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };
                let mut request = SynthesisRequest::new(&fragment.text).with_speed(speed);
                request.voice = map_voice_in(&voice_map, voice.as_deref(), provider.name());

                let mut fragment_yielded = false;
                let mut failed = false;

                match provider.synthesize_stream(&request).await {
                    Ok(mut chunks) => {
                        while let Some(item) = chunks.next().await {
                            match item {
                                Ok(chunk) => {
                                    if !first_chunk_seen {
                                        first_chunk_seen = true;
                                        events.emit(
                                            TtsEventKind::FirstResponseLatency {
                                                turn_id: fragment.turn_id.clone(),
                                                latency_ms: started.elapsed().as_secs_f64()
                                                    * 1000.0,
                                            },
                                            call.clone(),
                                        );
                                    }
                                    fragment_yielded = true;
                                    yield Ok(chunk);
                                }
                                Err(e) if e.is_retryable() => {
                                    // Retry this fragment on a fallback. Audio
                                    // already yielded for it stands; flag the mix.
                                    let (switched, fb) = fallback.try_fallback(&e);
                                    if !switched
                                        || !fb.capabilities().contains(Capability::Stream)
                                    {
                                        yield Err(e);
                                        failed = true;
                                        break;
                                    }
                                    if fragment_yielded {
                                        events.emit(
                                            TtsEventKind::MixedProviderAudio {
                                                turn_id: fragment.turn_id.clone(),
                                                fragment_index: fragment.index,
                                            },
                                            call.clone(),
                                        );
                                    }
                                    let mut retry = request.clone();
                                    retry.voice =
                                        map_voice_in(&voice_map, voice.as_deref(), fb.name());
                                    match fb.synthesize_stream(&retry).await {
                                        Ok(mut retry_chunks) => {
                                            while let Some(item) = retry_chunks.next().await {
                                                match item {
                                                    Ok(chunk) => {
                                                        fragment_yielded = true;
                                                        yield Ok(chunk);
                                                    }
                                                    Err(e) => {
                                                        yield Err(e);
                                                        failed = true;
                                                        break;
                                                    }
                                                }
                                            }
                                        }
                                        Err(e) => {
                                            yield Err(e);
                                            failed = true;
                                        }
                                    }
                                    break;
                                }
                                Err(e) => {
                                    yield Err(e);
                                    failed = true;
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        failed = true;
                    }
                }

                if failed {
                    break;
                }
                emitted += 1;

                if fragment.pause_after_ms > 0 {
                    events.emit(
                        TtsEventKind::DialogPause {
                            turn_id: fragment.turn_id.clone(),
                            pause_ms: fragment.pause_after_ms,
                        },
                        call.clone(),
                    );
                    tokio::time::sleep(Duration::from_millis(fragment.pause_after_ms)).await;
                }
            }

            events.emit(
                TtsEventKind::DialogTurnEnd {
                    turn_id: turn_id.clone(),
                    fragment_count: emitted,
                    duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                },
                call.clone(),
            );
            fragmenter.complete_turn(&turn_id, &text, emitted, started);
        }))
    }

    /// Style-directed synthesis. Requires a `voice_style` provider;
    /// plain synthesis is the last resort.
    pub async fn synthesize_with_style(
        &self,
        text: &str,
        style: &str,
        speed: f32,
        call: Option<&CallId>,
    ) -> Result<Vec<u8>> {
        match self.provider_with_capability(Capability::VoiceStyle) {
            Ok(provider) => {
                // The style instruction is the voice, verbatim, so styled
                // audio gets its own cache entries.
                let mut request = SynthesisRequest::new(text).with_speed(speed);
                request.voice = Some(style.to_string());

                let key = Self::cache_key(provider.name(), &request);
                if let Some(audio) = self.cache.get(&key).await {
                    return Ok(audio);
                }

                let audio = self.generate_on(provider.name(), &request, call).await?;
                self.cache.set(&key, &audio).await;
                Ok(audio)
            }
            Err(_) => {
                tracing::warn!("no style-capable provider, falling back to plain synthesis");
                self.synthesize(text, None, speed, true, call).await
            }
        }
    }

    /// Synthesize and push the result to the carrier's object storage.
    /// Not for realtime streaming.
    pub async fn synthesize_and_upload(
        &self,
        text: &str,
        voice: Option<&str>,
        speed: f32,
        call: Option<&CallId>,
    ) -> Result<MediaUpload> {
        let carrier = self
            .carrier
            .as_ref()
            .ok_or_else(|| Error::Config("no carrier configured for media upload".into()))?;

        let audio = self.synthesize(text, voice, speed, true, call).await?;
        carrier.upload_media(&audio, "audio/wav").await
    }

    /// Swap the active provider. Switching to the primary goes through
    /// the controller's reset so health bookkeeping stays consistent.
    pub fn change_provider(&self, name: &str) -> Result<bool> {
        let before = self.fallback.current_name();
        if before == name {
            return Ok(false);
        }
        if name == self.fallback.primary_name() {
            return Ok(self.fallback.reset_to_primary());
        }
        self.fallback.set_current(name)?;
        Ok(true)
    }

    /// Drop every cache tier's contents; returns entries removed.
    pub async fn clear_cache(&self) -> usize {
        self.cache.clear().await
    }

    /// Pre-synthesize common phrases into the cache.
    pub async fn prewarm_cache(&self, phrases: &[String], voices: &[Option<String>]) -> usize {
        let mut warmed = 0;
        let voices: Vec<Option<String>> = if voices.is_empty() {
            vec![None]
        } else {
            voices.to_vec()
        };

        for phrase in phrases {
            for voice in &voices {
                match self
                    .synthesize(phrase, voice.as_deref(), 1.0, true, None)
                    .await
                {
                    Ok(_) => warmed += 1,
                    Err(e) => {
                        tracing::warn!(phrase = %phrase, error = %e, "prewarm failed");
                    }
                }
            }
        }
        warmed
    }

    /// Register a call with the predictive generator.
    pub async fn start_call_prediction(&self, call_id: &str, flow_id: &str) -> Result<Vec<String>> {
        let provider = self.fallback.current_name();
        let defaults = CallSynthesisDefaults {
            voice: self.map_voice(None, &provider),
            provider,
            speed: 1.0,
        };
        self.predictive.start_call(call_id, flow_id, defaults).await
    }

    /// Run one fallback health pass immediately (operational tooling;
    /// the background loop does this periodically).
    pub async fn force_health_check(&self) {
        self.fallback.run_health_pass().await;
    }

    /// Force-demote a provider regardless of failure counts.
    pub fn mark_provider_failed(&self, name: &str) {
        self.fallback.mark_provider_failed(name);
    }

    pub fn current_provider(&self) -> String {
        self.fallback.current_name()
    }

    pub async fn health(&self) -> ServiceHealth {
        ServiceHealth {
            fallback: self.fallback.snapshot(),
            cache: self.cache.stats(),
            cache_tiers: self.cache.tier_stats().await,
            pools: self.pools.stats(),
            prediction: self.predictive.stats(),
        }
    }
}

/// Look up a logical voice for a provider; unknown ids pass through.
fn map_voice_in(
    voice_map: &HashMap<String, HashMap<String, String>>,
    voice: Option<&str>,
    provider: &str,
) -> Option<String> {
    let voice = voice?;
    Some(
        voice_map
            .get(voice)
            .and_then(|per_provider| per_provider.get(provider))
            .cloned()
            .unwrap_or_else(|| voice.to_string()),
    )
}

/// Routes predictive synthesis through the provider registry.
struct RegistrySynthesizer {
    fallback: Arc<FallbackController>,
}

#[async_trait]
impl BackgroundSynthesizer for RegistrySynthesizer {
    async fn synthesize_for_cache(
        &self,
        provider: &str,
        request: &SynthesisRequest,
    ) -> Result<Vec<u8>> {
        let provider = self
            .fallback
            .provider(provider)
            .ok_or_else(|| Error::Config(format!("unknown provider {provider}")))?;
        provider.synthesize(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use voxcall_carrier::AudioDescriptor;
    use voxcall_core::TtsEvent;

    use crate::provider::NullTtsProvider;

    struct UploadOnlyCarrier;

    #[async_trait]
    impl CarrierApi for UploadOnlyCarrier {
        async fn streaming_start(
            &self,
            _call_id: &str,
            _client_state: Option<&str>,
            _command_id: &str,
            _descriptor: &AudioDescriptor,
        ) -> Result<String> {
            Err(Error::CarrierRejected("not supported in this mock".into()))
        }

        async fn stream_chunk(
            &self,
            _call_id: &str,
            _content_type: &str,
            _chunk: &[u8],
        ) -> Result<()> {
            Err(Error::CarrierRejected("not supported in this mock".into()))
        }

        async fn streaming_stop(&self, _call_id: &str) -> Result<()> {
            Ok(())
        }

        async fn upload_media(&self, _data: &[u8], _content_type: &str) -> Result<MediaUpload> {
            Ok(MediaUpload {
                id: "media-9".into(),
                public_url: "https://cdn.carrier.test/media-9".into(),
            })
        }

        async fn play_audio(&self, _call_id: &str, _audio_url: &str) -> Result<()> {
            Ok(())
        }

        async fn record_start(&self, _call_id: &str) -> Result<()> {
            Ok(())
        }

        async fn record_stop(&self, _call_id: &str) -> Result<()> {
            Ok(())
        }

        async fn hangup(&self, _call_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_settings(primary: &str, fallbacks: &[&str]) -> Settings {
        let mut settings = Settings::with_provider(primary);
        settings.fallback_providers = fallbacks.iter().map(|s| s.to_string()).collect();
        settings.cache.filesystem.enabled = false;
        settings.pool.cool_down_s = 0;
        settings
    }

    fn service_with(
        settings: Settings,
        providers: Vec<Arc<dyn TtsProvider>>,
        carrier: Option<Arc<dyn CarrierApi>>,
    ) -> Arc<TtsService> {
        TtsService::new(settings, providers, None, carrier, EventBus::new()).unwrap()
    }

    fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<TtsEvent>) -> Vec<String> {
        let mut labels = Vec::new();
        while let Ok(event) = rx.try_recv() {
            labels.push(event.kind.label().to_string());
        }
        labels
    }

    #[tokio::test]
    async fn synthesize_populates_and_hits_cache() {
        let service = service_with(
            test_settings("offline", &[]),
            vec![Arc::new(NullTtsProvider::new("offline"))],
            None,
        );

        let first = service
            .synthesize("Good morning!", None, 1.0, true, None)
            .await
            .unwrap();
        let second = service
            .synthesize("Good morning!", None, 1.0, true, None)
            .await
            .unwrap();
        assert_eq!(first, second);

        let health = service.health().await;
        assert_eq!(health.cache.sets, 1);
        assert_eq!(health.cache.hits, 1);
        service.shutdown();
    }

    #[tokio::test]
    async fn cache_bypass_generates_again() {
        let service = service_with(
            test_settings("offline", &[]),
            vec![Arc::new(NullTtsProvider::new("offline"))],
            None,
        );

        service
            .synthesize("hello", None, 1.0, false, None)
            .await
            .unwrap();
        service
            .synthesize("hello", None, 1.0, false, None)
            .await
            .unwrap();

        let health = service.health().await;
        assert_eq!(health.cache.gets, 0);
        assert_eq!(health.cache.sets, 0);
        service.shutdown();
    }

    // The primary fails, the fallback serves, and the health loop brings
    // the primary back.
    #[tokio::test]
    async fn fallback_and_recovery() {
        let primary = Arc::new(NullTtsProvider::new("a"));
        primary.inject_failure(Error::Timeout("injected".into()), 1);

        let mut settings = test_settings("a", &["b"]);
        settings.fallback.max_failures = 3;
        settings.fallback.health_check_interval_s = 1;
        settings.fallback.recovery_backoff_base_s = 0;

        let service = service_with(
            settings,
            vec![primary, Arc::new(NullTtsProvider::new("b"))],
            None,
        );

        // First call times out on a and is served by b.
        service.synthesize("hi", None, 1.0, false, None).await.unwrap();
        assert_eq!(service.current_provider(), "b");

        // Second call stays on b.
        service.synthesize("hi", None, 1.0, false, None).await.unwrap();
        assert_eq!(service.current_provider(), "b");

        // After a passing probe, the controller reverts to a.
        service.force_health_check().await;
        assert_eq!(service.current_provider(), "a");
        service.synthesize("hi", None, 1.0, false, None).await.unwrap();
        assert_eq!(service.current_provider(), "a");
        service.shutdown();
    }

    #[tokio::test]
    async fn undeclared_extras_are_refused() {
        let service = service_with(
            test_settings("offline", &[]),
            vec![Arc::new(NullTtsProvider::new("offline"))],
            None,
        );

        let request = SynthesisRequest::new("hello").with_extra("pitch", "high");
        let err = service
            .synthesize_request(request, true, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        service.shutdown();
    }

    #[tokio::test]
    async fn dialog_stream_yields_audio_and_events() {
        let service = service_with(
            test_settings("offline", &[]),
            vec![Arc::new(NullTtsProvider::new("offline"))],
            None,
        );
        let mut events = service.events().subscribe();

        let mut stream = service
            .synthesize_dialog_stream(
                "Hello there. How are you doing today? I hope so!",
                None,
                1.0,
                1.0,
                Some("turn-1".into()),
                Some(CallId::from("call-1")),
            )
            .await
            .unwrap();

        let mut chunks = 0;
        while let Some(item) = stream.next().await {
            item.unwrap();
            chunks += 1;
        }
        assert!(chunks > 0);

        let labels = drain_events(&mut events);
        assert!(labels.contains(&"dialog_turn_start".to_string()));
        assert!(labels.contains(&"fragment_processing".to_string()));
        assert!(labels.contains(&"first_response_latency".to_string()));
        assert!(labels.contains(&"dialog_turn_end".to_string()));
        service.shutdown();
    }

    #[tokio::test]
    async fn interrupt_stops_dialog_stream() {
        let service = service_with(
            test_settings("offline", &[]),
            vec![Arc::new(NullTtsProvider::new("offline"))],
            None,
        );

        let stream = service
            .synthesize_dialog_stream(
                "One sentence. Another sentence. And a third one.",
                None,
                1.0,
                1.0,
                Some("turn-2".into()),
                None,
            )
            .await
            .unwrap();

        // Interrupt before any fragment is consumed: nothing is emitted.
        assert!(service.fragmenter().interrupt());
        let chunks: Vec<_> = stream.collect().await;
        assert!(chunks.is_empty());
        service.shutdown();
    }

    #[tokio::test]
    async fn style_synthesis_uses_style_capable_provider() {
        let mut config = crate::provider::HttpProviderConfig::new(
            "styled",
            "https://tts.invalid.example/v1",
        );
        config.voice_style = true;
        // The HTTP provider never gets a request in this test; the style
        // path is exercised against the cache.
        let styled = Arc::new(crate::provider::HttpTtsProvider::new(config).unwrap());

        let service = service_with(
            test_settings("offline", &["styled"]),
            vec![Arc::new(NullTtsProvider::new("offline")), styled],
            None,
        );

        // Pre-fill the cache under the style key so no HTTP call happens.
        let mut request = SynthesisRequest::new("hello");
        request.voice = Some("calm and warm".into());
        let key = TtsService::cache_key("styled", &request);
        service.cache.set(&key, b"styled-audio").await;

        let audio = service
            .synthesize_with_style("hello", "calm and warm", 1.0, None)
            .await
            .unwrap();
        assert_eq!(audio, b"styled-audio");
        service.shutdown();
    }

    #[tokio::test]
    async fn style_falls_back_to_plain_without_capable_provider() {
        let service = service_with(
            test_settings("offline", &[]),
            vec![Arc::new(NullTtsProvider::new("offline"))],
            None,
        );

        let audio = service
            .synthesize_with_style("hello", "excited", 1.0, None)
            .await
            .unwrap();
        assert!(!audio.is_empty());
        service.shutdown();
    }

    #[tokio::test]
    async fn upload_requires_carrier() {
        let service = service_with(
            test_settings("offline", &[]),
            vec![Arc::new(NullTtsProvider::new("offline"))],
            None,
        );
        let err = service
            .synthesize_and_upload("hello", None, 1.0, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "config_error");
        service.shutdown();
    }

    #[tokio::test]
    async fn upload_returns_media_handle() {
        let service = service_with(
            test_settings("offline", &[]),
            vec![Arc::new(NullTtsProvider::new("offline"))],
            Some(Arc::new(UploadOnlyCarrier)),
        );

        let media = service
            .synthesize_and_upload("hello", None, 1.0, None)
            .await
            .unwrap();
        assert_eq!(media.id, "media-9");
        assert!(media.public_url.starts_with("https://"));
        service.shutdown();
    }

    #[tokio::test]
    async fn change_provider_round_trip() {
        let service = service_with(
            test_settings("a", &["b"]),
            vec![
                Arc::new(NullTtsProvider::new("a")),
                Arc::new(NullTtsProvider::new("b")),
            ],
            None,
        );

        assert!(service.change_provider("b").unwrap());
        assert_eq!(service.current_provider(), "b");
        assert!(!service.change_provider("b").unwrap());

        // Back to the primary goes through the controller's reset.
        assert!(service.change_provider("a").unwrap());
        assert_eq!(service.current_provider(), "a");

        assert!(service.change_provider("ghost").is_err());
        service.shutdown();
    }

    #[tokio::test]
    async fn voice_map_applies_per_provider() {
        let mut settings = test_settings("offline", &[]);
        settings.voice_map.insert(
            "warm".into(),
            HashMap::from([("offline".to_string(), "voice-a".to_string())]),
        );
        let service = service_with(
            settings,
            vec![Arc::new(NullTtsProvider::new("offline"))],
            None,
        );

        assert_eq!(
            service.map_voice(Some("warm"), "offline").as_deref(),
            Some("voice-a")
        );
        // Unknown ids pass through unchanged.
        assert_eq!(
            service.map_voice(Some("mystery"), "offline").as_deref(),
            Some("mystery")
        );
        service.shutdown();
    }

    #[tokio::test]
    async fn prewarm_fills_cache() {
        let service = service_with(
            test_settings("offline", &[]),
            vec![Arc::new(NullTtsProvider::new("offline"))],
            None,
        );

        let phrases = vec!["Just a moment, please.".to_string(), "Thank you.".to_string()];
        let warmed = service.prewarm_cache(&phrases, &[]).await;
        assert_eq!(warmed, 2);
        assert_eq!(service.health().await.cache.sets, 2);

        // A later synthesize of a prewarmed phrase is a pure cache hit.
        service
            .synthesize("Thank you.", None, 1.0, true, None)
            .await
            .unwrap();
        assert_eq!(service.health().await.cache.hits, 1);
        service.shutdown();
    }

    #[tokio::test]
    async fn clear_cache_empties_tiers() {
        let service = service_with(
            test_settings("offline", &[]),
            vec![Arc::new(NullTtsProvider::new("offline"))],
            None,
        );

        service
            .synthesize("to be cleared", None, 1.0, true, None)
            .await
            .unwrap();
        assert!(service.clear_cache().await >= 1);

        service
            .synthesize("to be cleared", None, 1.0, true, None)
            .await
            .unwrap();
        let health = service.health().await;
        assert_eq!(health.cache.sets, 2);
        service.shutdown();
    }
}
