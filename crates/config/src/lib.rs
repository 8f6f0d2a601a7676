//! Configuration for the voxcall TTS engine

pub mod settings;

pub use settings::{
    CacheSettings, CarrierSettings, DialogSettings, FallbackSettings, FsCacheSettings,
    KvCacheSettings, MemoryCacheSettings, MetricsSettings, PoolSettings, PredictionSettings,
    ProviderSettings, Settings, StreamingSettings,
};
