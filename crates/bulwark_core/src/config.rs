//! Coordinator configuration.
//!
//! One typed struct with documented defaults, loadable from JSON, plus a
//! [`ConfigPatch`] for partial runtime reconfiguration. Durations are
//! serialized as whole milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field holds an unusable value
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What was wrong
        reason: String,
    },

    /// Config file could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl From<ConfigError> for crate::error::CoordError {
    fn from(err: ConfigError) -> Self {
        let field = match &err {
            ConfigError::Invalid { field, .. } => (*field).to_string(),
            ConfigError::Io(_) | ConfigError::Parse(_) => "config".to_string(),
        };
        crate::error::CoordError::Validation {
            field,
            reason: err.to_string(),
        }
    }
}

/// Which throttle checks apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleMode {
    /// Token bucket and sliding window must both admit
    #[default]
    Both,
    /// Token bucket only
    TokenBucket,
    /// Sliding window only
    SlidingWindow,
}

impl ThrottleMode {
    /// Whether the token bucket is consulted
    #[must_use]
    pub const fn uses_bucket(&self) -> bool {
        matches!(self, Self::Both | Self::TokenBucket)
    }

    /// Whether the sliding window is consulted
    #[must_use]
    pub const fn uses_window(&self) -> bool {
        matches!(self, Self::Both | Self::SlidingWindow)
    }
}

/// Retry backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Load-adaptive throttling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Enable the probabilistic load throttle
    pub enabled: bool,
    /// Load EMA above which throttling starts (0.0 - 1.0)
    pub threshold: f64,
    /// EMA smoothing factor (0.0 - 1.0]
    pub alpha: f64,
    /// Highest rejection probability for Low requests
    pub max_probability: f64,
    /// Latency treated as full load
    #[serde(with = "duration_ms")]
    pub latency_target: Duration,
    /// Queue depth treated as full load
    pub queue_reference: usize,
    /// Retry hint handed to adaptively throttled callers
    #[serde(with = "duration_ms")]
    pub retry_after: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.8,
            alpha: 0.3,
            max_probability: 0.5,
            latency_target: Duration::from_secs(1),
            queue_reference: 50,
            retry_after: Duration::from_millis(250),
        }
    }
}

/// Full coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Token bucket capacity
    pub max_burst: u32,
    /// Token bucket refill rate
    pub rate_per_second: f64,
    /// Sliding window span
    #[serde(with = "duration_ms")]
    pub window: Duration,
    /// Requests admitted per sliding window
    pub window_max_requests: u32,
    /// Which throttle checks apply
    pub throttle_mode: ThrottleMode,
    /// Hard cap on concurrent backend executions
    pub max_concurrent: usize,
    /// Largest batch issued as one backend call
    pub batch_max_size: usize,
    /// Smallest group issued as a batch; smaller groups run individually
    pub batch_min_size: usize,
    /// Longest a group waits for more members
    #[serde(with = "duration_ms")]
    pub batch_max_wait: Duration,
    /// Adjust the target batch size from observed efficiency
    pub adaptive_batch_sizing: bool,
    /// TTL used when a cache policy names none
    #[serde(with = "duration_ms")]
    pub cache_ttl_default: Duration,
    /// Tier-1 capacity
    pub cache_max_entries: usize,
    /// How long past its TTL a value may still be served as a fallback
    #[serde(with = "duration_ms")]
    pub max_staleness: Duration,
    /// Consecutive failures that open a breaker
    pub breaker_failure_threshold: u32,
    /// Base cooldown before a half-open probe
    #[serde(with = "duration_ms")]
    pub breaker_reset_timeout: Duration,
    /// Probes admitted while half-open
    pub half_open_max_attempts: u32,
    /// Cooldown growth after a failed probe
    pub breaker_backoff_multiplier: f64,
    /// Cooldown ceiling
    #[serde(with = "duration_ms")]
    pub breaker_max_reset_timeout: Duration,
    /// How long a finished dedup outcome keeps serving repeats
    #[serde(with = "duration_ms")]
    pub dedup_grace: Duration,
    /// Throttle waits attempted for auto-wait callers before giving up
    pub auto_wait_max_attempts: u32,
    /// Retry backoff
    pub retry: RetryConfig,
    /// Load-adaptive throttling
    pub adaptive: AdaptiveConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_burst: 20,
            rate_per_second: 10.0,
            window: Duration::from_secs(1),
            window_max_requests: 30,
            throttle_mode: ThrottleMode::Both,
            max_concurrent: 6,
            batch_max_size: 50,
            batch_min_size: 2,
            batch_max_wait: Duration::from_millis(10),
            adaptive_batch_sizing: true,
            cache_ttl_default: Duration::from_secs(300),
            cache_max_entries: 1_000,
            max_staleness: Duration::from_secs(1_800),
            breaker_failure_threshold: 5,
            breaker_reset_timeout: Duration::from_secs(30),
            half_open_max_attempts: 1,
            breaker_backoff_multiplier: 1.5,
            breaker_max_reset_timeout: Duration::from_secs(300),
            dedup_grace: Duration::from_millis(50),
            auto_wait_max_attempts: 5,
            retry: RetryConfig::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse from a JSON string and validate
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or a value is out of range
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file and validate
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is invalid
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Pretty JSON rendering
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check every field for a usable value
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.max_burst == 0 {
            return Err(invalid("max_burst", "must be at least 1"));
        }
        if !(self.rate_per_second.is_finite() && self.rate_per_second > 0.0) {
            return Err(invalid("rate_per_second", "must be a positive number"));
        }
        if self.window.is_zero() {
            return Err(invalid("window", "must be non-zero"));
        }
        if self.window_max_requests == 0 {
            return Err(invalid("window_max_requests", "must be at least 1"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("max_concurrent", "must be at least 1"));
        }
        if self.batch_min_size == 0 {
            return Err(invalid("batch_min_size", "must be at least 1"));
        }
        if self.batch_min_size > self.batch_max_size {
            return Err(invalid(
                "batch_min_size",
                format!(
                    "{} exceeds batch_max_size {}",
                    self.batch_min_size, self.batch_max_size
                ),
            ));
        }
        if self.cache_max_entries == 0 {
            return Err(invalid("cache_max_entries", "must be at least 1"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(invalid("breaker_failure_threshold", "must be at least 1"));
        }
        if self.half_open_max_attempts == 0 {
            return Err(invalid("half_open_max_attempts", "must be at least 1"));
        }
        if !(self.breaker_backoff_multiplier >= 1.0) {
            return Err(invalid("breaker_backoff_multiplier", "must be >= 1.0"));
        }
        if self.breaker_max_reset_timeout < self.breaker_reset_timeout {
            return Err(invalid(
                "breaker_max_reset_timeout",
                "must not be below breaker_reset_timeout",
            ));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(invalid("retry.multiplier", "must be >= 1.0"));
        }
        if !(self.adaptive.threshold > 0.0 && self.adaptive.threshold <= 1.0) {
            return Err(invalid("adaptive.threshold", "must be in (0, 1]"));
        }
        if !(self.adaptive.alpha > 0.0 && self.adaptive.alpha <= 1.0) {
            return Err(invalid("adaptive.alpha", "must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.adaptive.max_probability) {
            return Err(invalid("adaptive.max_probability", "must be in [0, 1]"));
        }
        Ok(())
    }

    /// Copy with a patch applied, validated
    ///
    /// # Errors
    ///
    /// Returns error if the patched configuration is invalid
    pub fn patched(&self, patch: &ConfigPatch) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        patch.apply(&mut next);
        next.validate()?;
        Ok(next)
    }

    /// Breaker settings
    #[must_use]
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            reset_timeout: self.breaker_reset_timeout,
            half_open_max_attempts: self.half_open_max_attempts,
            backoff_multiplier: self.breaker_backoff_multiplier,
            max_reset_timeout: self.breaker_max_reset_timeout,
        }
    }

    /// Throttle settings
    #[must_use]
    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            max_burst: self.max_burst,
            rate_per_second: self.rate_per_second,
            window: self.window,
            window_max_requests: self.window_max_requests,
            mode: self.throttle_mode,
            adaptive: self.adaptive.clone(),
        }
    }

    /// Batch settings
    #[must_use]
    pub fn batch(&self) -> BatchConfig {
        BatchConfig {
            max_size: self.batch_max_size,
            min_size: self.batch_min_size,
            max_wait: self.batch_max_wait,
            adaptive_sizing: self.adaptive_batch_sizing,
        }
    }

    /// Cache settings
    #[must_use]
    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: self.cache_ttl_default,
            max_entries: self.cache_max_entries,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Base cooldown
    pub reset_timeout: Duration,
    /// Probes admitted while half-open
    pub half_open_max_attempts: u32,
    /// Cooldown growth after a failed probe
    pub backoff_multiplier: f64,
    /// Cooldown ceiling
    pub max_reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        CoordinatorConfig::default().breaker()
    }
}

/// Throttler settings
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    /// Token bucket capacity
    pub max_burst: u32,
    /// Token refill rate
    pub rate_per_second: f64,
    /// Sliding window span
    pub window: Duration,
    /// Requests per window
    pub window_max_requests: u32,
    /// Active checks
    pub mode: ThrottleMode,
    /// Adaptive layer
    pub adaptive: AdaptiveConfig,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        CoordinatorConfig::default().throttle()
    }
}

/// Batch coordinator settings
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Largest batch
    pub max_size: usize,
    /// Smallest batch
    pub min_size: usize,
    /// Longest wait for members
    pub max_wait: Duration,
    /// Adaptive target sizing
    pub adaptive_sizing: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        CoordinatorConfig::default().batch()
    }
}

/// Cache settings
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// TTL when none is given
    pub default_ttl: Duration,
    /// Tier-1 capacity
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CoordinatorConfig::default().cache()
    }
}

/// Partial configuration update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct ConfigPatch {
    pub max_burst: Option<u32>,
    pub rate_per_second: Option<f64>,
    #[serde(with = "option_duration_ms")]
    pub window: Option<Duration>,
    pub window_max_requests: Option<u32>,
    pub throttle_mode: Option<ThrottleMode>,
    pub max_concurrent: Option<usize>,
    pub batch_max_size: Option<usize>,
    pub batch_min_size: Option<usize>,
    #[serde(with = "option_duration_ms")]
    pub batch_max_wait: Option<Duration>,
    pub adaptive_batch_sizing: Option<bool>,
    #[serde(with = "option_duration_ms")]
    pub cache_ttl_default: Option<Duration>,
    pub cache_max_entries: Option<usize>,
    #[serde(with = "option_duration_ms")]
    pub max_staleness: Option<Duration>,
    pub breaker_failure_threshold: Option<u32>,
    #[serde(with = "option_duration_ms")]
    pub breaker_reset_timeout: Option<Duration>,
    pub half_open_max_attempts: Option<u32>,
    pub breaker_backoff_multiplier: Option<f64>,
    #[serde(with = "option_duration_ms")]
    pub breaker_max_reset_timeout: Option<Duration>,
    #[serde(with = "option_duration_ms")]
    pub dedup_grace: Option<Duration>,
    pub auto_wait_max_attempts: Option<u32>,
    pub retry: Option<RetryConfig>,
    pub adaptive: Option<AdaptiveConfig>,
}

impl ConfigPatch {
    /// Empty patch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite every field that is set
    pub fn apply(&self, config: &mut CoordinatorConfig) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = &self.$field {
                        config.$field = value.clone();
                    }
                )*
            };
        }
        set!(
            max_burst,
            rate_per_second,
            window,
            window_max_requests,
            throttle_mode,
            max_concurrent,
            batch_max_size,
            batch_min_size,
            batch_max_wait,
            adaptive_batch_sizing,
            cache_ttl_default,
            cache_max_entries,
            max_staleness,
            breaker_failure_threshold,
            breaker_reset_timeout,
            half_open_max_attempts,
            breaker_backoff_multiplier,
            breaker_max_reset_timeout,
            dedup_grace,
            auto_wait_max_attempts,
            retry,
            adaptive,
        );
    }

    /// Whether any throttle field is set
    #[must_use]
    pub fn touches_throttle(&self) -> bool {
        self.max_burst.is_some()
            || self.rate_per_second.is_some()
            || self.window.is_some()
            || self.window_max_requests.is_some()
            || self.throttle_mode.is_some()
            || self.adaptive.is_some()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::time::duration_millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&crate::time::duration_millis(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_burst, 20);
        assert_eq!(config.max_concurrent, 6);
        assert_eq!(config.half_open_max_attempts, 1);
        assert_eq!(config.breaker_max_reset_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let config = CoordinatorConfig::default();
        let json = config.to_json_pretty().unwrap();
        assert!(json.contains("\"batch_max_wait\": 10"));
        let parsed = CoordinatorConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            CoordinatorConfig::from_json_str(r#"{"max_burst": 3, "throttle_mode": "token_bucket"}"#)
                .unwrap();
        assert_eq!(config.max_burst, 3);
        assert_eq!(config.throttle_mode, ThrottleMode::TokenBucket);
        assert_eq!(config.window_max_requests, 30);
    }

    #[test]
    fn test_validate_rejects_bad_batch_bounds() {
        let config = CoordinatorConfig {
            batch_min_size: 10,
            batch_max_size: 5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "batch_min_size", .. }));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = CoordinatorConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_patch_applies_only_set_fields() {
        let patch = ConfigPatch {
            max_concurrent: Some(2),
            batch_max_wait: Some(Duration::from_millis(25)),
            ..ConfigPatch::new()
        };
        let config = CoordinatorConfig::default().patched(&patch).unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.batch_max_wait, Duration::from_millis(25));
        assert_eq!(config.max_burst, 20);
        assert!(!patch.touches_throttle());
    }

    #[test]
    fn test_patch_rejected_when_invalid() {
        let patch = ConfigPatch {
            rate_per_second: Some(-1.0),
            ..ConfigPatch::new()
        };
        assert!(CoordinatorConfig::default().patched(&patch).is_err());
        assert!(patch.touches_throttle());
    }

    #[test]
    fn test_patch_from_json() {
        let patch: ConfigPatch =
            serde_json::from_str(r#"{"breaker_reset_timeout": 5000}"#).unwrap();
        assert_eq!(patch.breaker_reset_timeout, Some(Duration::from_secs(5)));
        assert!(patch.window.is_none());
    }

    #[test]
    fn test_patch_covers_cache_breaker_backoff_and_dedup() {
        let patch: ConfigPatch = serde_json::from_str(
            r#"{"cache_max_entries": 64, "breaker_backoff_multiplier": 2.0,
                "breaker_max_reset_timeout": 60000, "dedup_grace": 250}"#,
        )
        .unwrap();
        let config = CoordinatorConfig::default().patched(&patch).unwrap();
        assert_eq!(config.cache_max_entries, 64);
        assert_eq!(config.breaker_backoff_multiplier, 2.0);
        assert_eq!(config.breaker_max_reset_timeout, Duration::from_secs(60));
        assert_eq!(config.dedup_grace, Duration::from_millis(250));
        assert!(!patch.touches_throttle());
    }

    #[test]
    fn test_throttle_mode_flags() {
        assert!(ThrottleMode::Both.uses_bucket() && ThrottleMode::Both.uses_window());
        assert!(!ThrottleMode::TokenBucket.uses_window());
        assert!(!ThrottleMode::SlidingWindow.uses_bucket());
    }
}
