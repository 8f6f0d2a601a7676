//! Main settings module

use std::collections::HashMap;
use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use voxcall_core::Error;

/// Top-level engine settings.
///
/// Every section has serde defaults so a minimal file containing only
/// `default_provider` is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Name of the provider used until a fallback is triggered
    pub default_provider: String,

    /// Fallback provider names in priority order
    #[serde(default)]
    pub fallback_providers: Vec<String>,

    /// Per-provider backend configuration, keyed by provider name
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,

    /// Voice map: logical voice id -> provider name -> concrete voice
    #[serde(default)]
    pub voice_map: HashMap<String, HashMap<String, String>>,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub fallback: FallbackSettings,

    #[serde(default)]
    pub dialog: DialogSettings,

    #[serde(default)]
    pub streaming: StreamingSettings,

    #[serde(default)]
    pub prediction: PredictionSettings,

    #[serde(default)]
    pub carrier: CarrierSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,
}

/// One TTS backend's connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Base URL of the backend API (empty for local/offline providers)
    #[serde(default)]
    pub endpoint: String,

    /// Bearer token; empty means unauthenticated
    #[serde(default)]
    pub api_key: String,

    /// Default voice when the request leaves it unset
    #[serde(default)]
    pub default_voice: Option<String>,

    /// Known voice ids; empty means the backend accepts any voice
    #[serde(default)]
    pub voices: Vec<String>,

    /// Per-request deadline in seconds
    #[serde(default = "default_provider_timeout_s")]
    pub timeout_s: u64,

    /// Whether this backend interprets the voice as a style instruction
    #[serde(default)]
    pub voice_style: bool,

    /// Extra request parameters this backend declares as affecting the
    /// audio output (anything else is refused)
    #[serde(default)]
    pub cache_params: Vec<String>,
}

fn default_provider_timeout_s() -> u64 {
    30
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            default_voice: None,
            voices: Vec::new(),
            timeout_s: default_provider_timeout_s(),
            voice_style: false,
            cache_params: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub memory: MemoryCacheSettings,
    #[serde(default)]
    pub kv: KvCacheSettings,
    #[serde(default)]
    pub filesystem: FsCacheSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCacheSettings {
    #[serde(default = "default_memory_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_memory_ttl_s")]
    pub ttl_s: u64,
}

fn default_memory_max_entries() -> usize {
    100
}

fn default_memory_ttl_s() -> u64 {
    3600
}

impl Default for MemoryCacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_memory_max_entries(),
            ttl_s: default_memory_ttl_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_kv_ttl_s")]
    pub ttl_s: u64,
    #[serde(default = "default_kv_prefix")]
    pub prefix: String,
}

fn default_kv_ttl_s() -> u64 {
    86_400
}

fn default_kv_prefix() -> String {
    "tts:".to_string()
}

impl Default for KvCacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_s: default_kv_ttl_s(),
            prefix: default_kv_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsCacheSettings {
    #[serde(default = "default_fs_enabled")]
    pub enabled: bool,
    #[serde(default = "default_fs_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_fs_ttl_s")]
    pub ttl_s: u64,
    /// Cache directory; empty means `<home>/.voxcall_cache`
    #[serde(default)]
    pub dir: String,
}

fn default_fs_enabled() -> bool {
    true
}

fn default_fs_max_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_fs_ttl_s() -> u64 {
    30 * 24 * 3600
}

impl Default for FsCacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_fs_enabled(),
            max_bytes: default_fs_max_bytes(),
            ttl_s: default_fs_ttl_s(),
            dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_min")]
    pub min: usize,
    #[serde(default = "default_pool_max")]
    pub max: usize,
    #[serde(default = "default_pool_ttl_s")]
    pub ttl_s: u64,
    #[serde(default = "default_pool_warm_up")]
    pub warm_up: usize,
    #[serde(default = "default_pool_cool_down_s")]
    pub cool_down_s: u64,
    #[serde(default = "default_pool_scaling_threshold")]
    pub scaling_threshold: f64,
}

fn default_pool_min() -> usize {
    1
}

fn default_pool_max() -> usize {
    5
}

fn default_pool_ttl_s() -> u64 {
    3600
}

fn default_pool_warm_up() -> usize {
    1
}

fn default_pool_cool_down_s() -> u64 {
    5
}

fn default_pool_scaling_threshold() -> f64 {
    0.7
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min: default_pool_min(),
            max: default_pool_max(),
            ttl_s: default_pool_ttl_s(),
            warm_up: default_pool_warm_up(),
            cool_down_s: default_pool_cool_down_s(),
            scaling_threshold: default_pool_scaling_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSettings {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_health_check_interval_s")]
    pub health_check_interval_s: u64,
    #[serde(default = "default_recovery_backoff_base_s")]
    pub recovery_backoff_base_s: u64,
}

fn default_max_failures() -> u32 {
    3
}

fn default_health_check_interval_s() -> u64 {
    300
}

fn default_recovery_backoff_base_s() -> u64 {
    30
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            health_check_interval_s: default_health_check_interval_s(),
            recovery_backoff_base_s: default_recovery_backoff_base_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogSettings {
    #[serde(default = "default_min_fragment_size")]
    pub min_fragment_size: usize,
    #[serde(default = "default_initial_fragment_length")]
    pub initial_fragment_length: usize,
    #[serde(default = "default_max_sentence_length")]
    pub max_sentence_length: usize,
    #[serde(default = "default_inter_sentence_pause_ms")]
    pub inter_sentence_pause_ms: u64,
    #[serde(default = "default_end_of_turn_pause_ms")]
    pub end_of_turn_pause_ms: u64,
}

fn default_min_fragment_size() -> usize {
    5
}

fn default_initial_fragment_length() -> usize {
    15
}

fn default_max_sentence_length() -> usize {
    100
}

fn default_inter_sentence_pause_ms() -> u64 {
    300
}

fn default_end_of_turn_pause_ms() -> u64 {
    800
}

impl Default for DialogSettings {
    fn default() -> Self {
        Self {
            min_fragment_size: default_min_fragment_size(),
            initial_fragment_length: default_initial_fragment_length(),
            max_sentence_length: default_max_sentence_length(),
            inter_sentence_pause_ms: default_inter_sentence_pause_ms(),
            end_of_turn_pause_ms: default_end_of_turn_pause_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSettings {
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u64,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_session_timeout_s")]
    pub session_timeout_s: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,
}

fn default_chunk_ms() -> u64 {
    20
}

fn default_max_concurrent_sessions() -> usize {
    50
}

fn default_session_timeout_s() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            chunk_ms: default_chunk_ms(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            session_timeout_s: default_session_timeout_s(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_factor: default_retry_backoff_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSettings {
    #[serde(default = "default_prediction_depth")]
    pub depth: usize,
    #[serde(default = "default_prediction_workers")]
    pub workers: usize,
    #[serde(default = "default_prediction_enabled")]
    pub enabled: bool,
}

fn default_prediction_depth() -> usize {
    2
}

fn default_prediction_workers() -> usize {
    2
}

fn default_prediction_enabled() -> bool {
    true
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            depth: default_prediction_depth(),
            workers: default_prediction_workers(),
            enabled: default_prediction_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierSettings {
    #[serde(default = "default_carrier_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_carrier_api_base() -> String {
    "https://api.telnyx.com/v2".to_string()
}

impl Default for CarrierSettings {
    fn default() -> Self {
        Self {
            api_base: default_carrier_api_base(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_metrics_dir")]
    pub dir: String,
}

fn default_metrics_dir() -> String {
    "metrics".to_string()
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            dir: default_metrics_dir(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus `VOXCALL_*`
    /// environment overrides (`VOXCALL_POOL__MAX=8` style nesting).
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix("VOXCALL").separator("__"))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Cross-field validation applied after deserialization.
    pub fn validate(&self) -> Result<(), Error> {
        if self.default_provider.is_empty() {
            return Err(Error::Config("default_provider must be set".into()));
        }

        if self.pool.min > self.pool.max {
            return Err(Error::Config(format!(
                "pool.min ({}) exceeds pool.max ({})",
                self.pool.min, self.pool.max
            )));
        }

        if self.pool.warm_up > self.pool.max {
            return Err(Error::Config(format!(
                "pool.warm_up ({}) exceeds pool.max ({})",
                self.pool.warm_up, self.pool.max
            )));
        }

        if !(0.0..=1.0).contains(&self.pool.scaling_threshold) {
            return Err(Error::Config(
                "pool.scaling_threshold must be within [0, 1]".into(),
            ));
        }

        if !(1..=5).contains(&self.prediction.depth) {
            return Err(Error::Config(
                "prediction.depth must be within 1..=5".into(),
            ));
        }

        if self.prediction.workers == 0 {
            return Err(Error::Config("prediction.workers must be positive".into()));
        }

        if self.dialog.min_fragment_size == 0 {
            return Err(Error::Config(
                "dialog.min_fragment_size must be positive".into(),
            ));
        }

        if self.streaming.retry_backoff_factor < 1.0 {
            return Err(Error::Config(
                "streaming.retry_backoff_factor must be >= 1.0".into(),
            ));
        }

        for name in &self.fallback_providers {
            if name == &self.default_provider {
                return Err(Error::Config(format!(
                    "fallback provider {name} duplicates the primary"
                )));
            }
        }

        Ok(())
    }

    /// Settings with only the required field filled in; used by tests and
    /// embedded setups that configure programmatically.
    pub fn with_provider(name: impl Into<String>) -> Self {
        Self {
            default_provider: name.into(),
            fallback_providers: Vec::new(),
            providers: HashMap::new(),
            voice_map: HashMap::new(),
            cache: CacheSettings::default(),
            pool: PoolSettings::default(),
            fallback: FallbackSettings::default(),
            dialog: DialogSettings::default(),
            streaming: StreamingSettings::default(),
            prediction: PredictionSettings::default(),
            carrier: CarrierSettings::default(),
            metrics: MetricsSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::with_provider("primary");
        assert_eq!(settings.cache.memory.max_entries, 100);
        assert_eq!(settings.cache.memory.ttl_s, 3600);
        assert!(!settings.cache.kv.enabled);
        assert_eq!(settings.cache.kv.prefix, "tts:");
        assert!(settings.cache.filesystem.enabled);
        assert_eq!(settings.cache.filesystem.max_bytes, 1024 * 1024 * 1024);
        assert_eq!(settings.pool.min, 1);
        assert_eq!(settings.pool.max, 5);
        assert_eq!(settings.pool.cool_down_s, 5);
        assert_eq!(settings.fallback.max_failures, 3);
        assert_eq!(settings.dialog.inter_sentence_pause_ms, 300);
        assert_eq!(settings.dialog.end_of_turn_pause_ms, 800);
        assert_eq!(settings.streaming.chunk_ms, 20);
        assert_eq!(settings.streaming.max_concurrent_sessions, 50);
        assert_eq!(settings.prediction.depth, 2);
        assert!(settings.prediction.enabled);
    }

    #[test]
    fn minimal_file_loads() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "default_provider = \"primary\"").unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.default_provider, "primary");
        assert_eq!(settings.pool.max, 5);
    }

    #[test]
    fn validation_rejects_inverted_pool_bounds() {
        let mut settings = Settings::with_provider("primary");
        settings.pool.min = 10;
        settings.pool.max = 2;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validation_rejects_primary_in_fallbacks() {
        let mut settings = Settings::with_provider("primary");
        settings.fallback_providers = vec!["primary".into()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validation_rejects_out_of_range_depth() {
        let mut settings = Settings::with_provider("primary");
        settings.prediction.depth = 9;
        assert!(settings.validate().is_err());
    }
}
