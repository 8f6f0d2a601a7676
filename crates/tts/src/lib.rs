//! voxcall TTS engine
//!
//! Real-time text-to-speech for outbound voice calls: interchangeable
//! providers with health-based fallback, pre-warmed provider pools, a
//! multi-tier audio cache, dialog-paced fragmenting, and predictive
//! pre-generation driven by call-flow graphs.

pub mod cache;
pub mod fallback;
pub mod fragmenter;
pub mod pool;
pub mod predictive;
pub mod provider;
pub mod service;

pub use cache::{CacheKey, CacheStats, FsTier, KvTier, MemoryKv, MemoryTier, SharedKv, TieredCache};
pub use fallback::{FallbackController, FallbackSnapshot, ProviderHealth};
pub use fragmenter::{DialogFragmenter, TurnState};
pub use pool::{EntryStatus, PoolCheckout, PoolManager, PoolStats, ProviderFactory, ProviderPool};
pub use predictive::{
    BackgroundSynthesizer, CallFlow, CallFlowStep, CallSynthesisDefaults, PredictionPriority,
    PredictiveGenerator, PredictiveStats,
};
pub use provider::{
    AudioStream, Capability, CapabilitySet, HealthStatus, HttpProviderConfig, HttpTtsProvider,
    NullTtsProvider, ProviderHealthReport, SynthesisRequest, TtsProvider, VoiceInfo,
};
pub use service::{ServiceHealth, TtsService};
