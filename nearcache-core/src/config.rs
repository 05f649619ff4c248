//! Configuration types

use crate::error::{ConfigError, NearCacheResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest reconciliation interval accepted when reconciliation is enabled.
pub const MIN_RECONCILIATION_INTERVAL_SECONDS: u64 = 30;

/// Default reconciliation interval.
pub const DEFAULT_RECONCILIATION_INTERVAL_SECONDS: u64 = 60;

/// Default number of lost invalidations tolerated before a full clear.
pub const DEFAULT_MAX_TOLERATED_MISS_COUNT: u64 = 10;

/// Default number of records examined per eviction.
pub const DEFAULT_EVICTION_SAMPLING_COUNT: usize = 8;

/// Default number of eviction candidates carried between evictions.
pub const DEFAULT_EVICTION_SAMPLING_POOL_SIZE: usize = 16;

/// Rule for picking a victim when the store holds more than `max_entries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EvictionPolicy {
    /// Least recently accessed record goes first.
    #[default]
    Lru,
    /// Least frequently accessed record goes first.
    Lfu,
    /// Any record.
    Random,
    /// Eviction disabled, the store grows without bound.
    None,
}

impl EvictionPolicy {
    /// Returns true if this policy ever evicts.
    pub fn is_bounded(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// How values are held in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InMemoryFormat {
    /// Values are kept as live objects.
    Object,
    /// Values are kept pre-serialized and decoded on every read.
    #[default]
    Binary,
}

/// Near cache configuration for a single map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearCacheConfig {
    /// Name of the map this near cache fronts.
    pub name: String,
    /// When false, the client talks to the remote map directly.
    pub enabled: bool,
    /// Maximum number of records before eviction kicks in.
    pub max_entries: usize,
    pub eviction_policy: EvictionPolicy,
    /// Records drawn at random each time a victim is needed.
    pub eviction_sampling_count: usize,
    /// Best candidates remembered across evictions.
    pub eviction_sampling_pool_size: usize,
    /// Seconds after creation a record expires (0 = never).
    pub time_to_live_seconds: u64,
    /// Seconds without access after which a record expires (0 = never).
    pub max_idle_seconds: u64,
    /// Subscribe to server-pushed invalidations.
    pub invalidate_on_change: bool,
    pub in_memory_format: InMemoryFormat,
}

impl Default for NearCacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            enabled: true,
            max_entries: i32::MAX as usize,
            eviction_policy: EvictionPolicy::Lru,
            eviction_sampling_count: DEFAULT_EVICTION_SAMPLING_COUNT,
            eviction_sampling_pool_size: DEFAULT_EVICTION_SAMPLING_POOL_SIZE,
            time_to_live_seconds: 0,
            max_idle_seconds: 0,
            invalidate_on_change: true,
            in_memory_format: InMemoryFormat::Binary,
        }
    }
}

impl NearCacheConfig {
    /// Create a config for the named map with default values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_eviction_sampling_count(mut self, count: usize) -> Self {
        self.eviction_sampling_count = count;
        self
    }

    pub fn with_eviction_sampling_pool_size(mut self, size: usize) -> Self {
        self.eviction_sampling_pool_size = size;
        self
    }

    pub fn with_time_to_live_seconds(mut self, seconds: u64) -> Self {
        self.time_to_live_seconds = seconds;
        self
    }

    pub fn with_max_idle_seconds(mut self, seconds: u64) -> Self {
        self.max_idle_seconds = seconds;
        self
    }

    pub fn with_invalidate_on_change(mut self, enabled: bool) -> Self {
        self.invalidate_on_change = enabled;
        self
    }

    pub fn with_in_memory_format(mut self, format: InMemoryFormat) -> Self {
        self.in_memory_format = format;
        self
    }

    /// Time to live as a duration, `None` when records never expire by age.
    pub fn time_to_live(&self) -> Option<Duration> {
        (self.time_to_live_seconds > 0).then(|| Duration::from_secs(self.time_to_live_seconds))
    }

    /// Idle window as a duration, `None` when records never idle out.
    pub fn max_idle(&self) -> Option<Duration> {
        (self.max_idle_seconds > 0).then(|| Duration::from_secs(self.max_idle_seconds))
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - name is not empty
    /// - max_entries > 0 whenever the eviction policy is bounded
    /// - eviction sampling count and pool size > 0 whenever the policy is bounded
    pub fn validate(&self) -> NearCacheResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name".to_string(),
                value: format!("{:?}", self.name),
                reason: "near cache name must not be empty".to_string(),
            }
            .into());
        }

        if self.eviction_policy.is_bounded() && self.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_entries".to_string(),
                value: self.max_entries.to_string(),
                reason: format!(
                    "max_entries must be greater than 0 when eviction policy is {:?}",
                    self.eviction_policy
                ),
            }
            .into());
        }

        if self.eviction_policy.is_bounded() {
            for (field, value) in [
                ("eviction_sampling_count", self.eviction_sampling_count),
                ("eviction_sampling_pool_size", self.eviction_sampling_pool_size),
            ] {
                if value == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: field.to_string(),
                        value: value.to_string(),
                        reason: format!("{} must be greater than 0", field),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }
}

/// Process-wide anti-entropy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Seconds between reconciliation runs (0 disables reconciliation).
    pub interval_seconds: u64,
    /// Lost invalidations a tracker tolerates before clearing its whole cache.
    pub max_tolerated_miss_count: u64,
    /// How far a partition's local sequence may trail the authoritative one
    /// before reconciliation clears that partition's entries.
    pub sequence_lag_tolerance: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_RECONCILIATION_INTERVAL_SECONDS,
            max_tolerated_miss_count: DEFAULT_MAX_TOLERATED_MISS_COUNT,
            sequence_lag_tolerance: 0,
        }
    }
}

impl ReconciliationConfig {
    /// Create a config with the given interval and default thresholds.
    pub fn with_interval_seconds(interval_seconds: u64) -> Self {
        Self {
            interval_seconds,
            ..Self::default()
        }
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `NEARCACHE_RECONCILIATION_INTERVAL_SECONDS` (default: 60)
    /// - `NEARCACHE_MAX_TOLERATED_MISS_COUNT` (default: 10)
    /// - `NEARCACHE_SEQUENCE_LAG_TOLERANCE` (default: 0)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            interval_seconds: std::env::var("NEARCACHE_RECONCILIATION_INTERVAL_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.interval_seconds),
            max_tolerated_miss_count: std::env::var("NEARCACHE_MAX_TOLERATED_MISS_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_tolerated_miss_count),
            sequence_lag_tolerance: std::env::var("NEARCACHE_SEQUENCE_LAG_TOLERANCE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sequence_lag_tolerance),
        }
    }

    /// The period of the reconciliation task, or `None` when disabled.
    ///
    /// Fails for a positive interval below
    /// [`MIN_RECONCILIATION_INTERVAL_SECONDS`].
    pub fn effective_period(&self) -> NearCacheResult<Option<Duration>> {
        match self.interval_seconds {
            0 => Ok(None),
            secs if secs < MIN_RECONCILIATION_INTERVAL_SECONDS => Err(ConfigError::InvalidValue {
                field: "reconciliation.interval_seconds".to_string(),
                value: secs.to_string(),
                reason: format!(
                    "reconciliation interval must be 0 (disabled) or at least {} seconds",
                    MIN_RECONCILIATION_INTERVAL_SECONDS
                ),
            }
            .into()),
            secs => Ok(Some(Duration::from_secs(secs))),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NearCacheError;
    use std::sync::Mutex;

    #[test]
    fn test_near_cache_config_defaults() {
        let config = NearCacheConfig::new("orders");
        assert_eq!(config.name, "orders");
        assert!(config.enabled);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert_eq!(config.time_to_live(), None);
        assert_eq!(config.max_idle(), None);
        assert!(config.invalidate_on_change);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_near_cache_config_builder() {
        let config = NearCacheConfig::new("orders")
            .with_max_entries(100)
            .with_eviction_policy(EvictionPolicy::Lfu)
            .with_time_to_live_seconds(30)
            .with_max_idle_seconds(10)
            .with_invalidate_on_change(false)
            .with_in_memory_format(InMemoryFormat::Object);

        assert_eq!(config.max_entries, 100);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lfu);
        assert_eq!(config.time_to_live(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_idle(), Some(Duration::from_secs(10)));
        assert!(!config.invalidate_on_change);
        assert_eq!(config.in_memory_format, InMemoryFormat::Object);
    }

    #[test]
    fn test_zero_max_entries_rejected_when_bounded() {
        let config = NearCacheConfig::new("orders").with_max_entries(0);
        match config.validate() {
            Err(NearCacheError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "max_entries");
            }
            other => panic!("expected max_entries error, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_max_entries_allowed_without_eviction() {
        let config = NearCacheConfig::new("orders")
            .with_max_entries(0)
            .with_eviction_policy(EvictionPolicy::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_sampling_rejected_when_bounded() {
        for config in [
            NearCacheConfig::new("orders").with_eviction_sampling_count(0),
            NearCacheConfig::new("orders").with_eviction_sampling_pool_size(0),
        ] {
            match config.validate() {
                Err(NearCacheError::Config(ConfigError::InvalidValue { field, .. })) => {
                    assert!(field.starts_with("eviction_sampling"), "field {}", field);
                }
                other => panic!("expected sampling error, got {:?}", other),
            }
        }

        let unbounded = NearCacheConfig::new("orders")
            .with_eviction_policy(EvictionPolicy::None)
            .with_eviction_sampling_count(0);
        assert!(unbounded.validate().is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(NearCacheConfig::new("  ").validate().is_err());
    }

    #[test]
    fn test_reconciliation_zero_disables() {
        let config = ReconciliationConfig::with_interval_seconds(0);
        assert_eq!(config.effective_period().expect("valid"), None);
    }

    #[test]
    fn test_reconciliation_below_minimum_rejected() {
        let config = ReconciliationConfig::with_interval_seconds(15);
        assert!(matches!(
            config.effective_period(),
            Err(NearCacheError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_reconciliation_period_in_millis() {
        let config = ReconciliationConfig::with_interval_seconds(50);
        let period = config.effective_period().expect("valid").expect("enabled");
        assert_eq!(period.as_millis(), 50_000);
    }

    #[test]
    fn test_config_serde_roundtrip_uses_variant_names() {
        let config = NearCacheConfig::new("orders").with_eviction_policy(EvictionPolicy::Random);
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(json.contains("\"Random\""));
        let back: NearCacheConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const RECONCILIATION_VARS: [&str; 3] = [
        "NEARCACHE_RECONCILIATION_INTERVAL_SECONDS",
        "NEARCACHE_MAX_TOLERATED_MISS_COUNT",
        "NEARCACHE_SEQUENCE_LAG_TOLERANCE",
    ];

    /// Run `f` with exactly `vars` set among the reconciliation variables.
    fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for name in RECONCILIATION_VARS {
            std::env::remove_var(name);
        }
        for (name, value) in vars {
            std::env::set_var(name, value);
        }
        let result = f();
        for name in RECONCILIATION_VARS {
            std::env::remove_var(name);
        }
        result
    }

    #[test]
    fn test_from_env_defaults_when_unset() {
        let config = with_env(&[], ReconciliationConfig::from_env);
        assert_eq!(config, ReconciliationConfig::default());
    }

    #[test]
    fn test_from_env_reads_every_variable() {
        let config = with_env(
            &[
                ("NEARCACHE_RECONCILIATION_INTERVAL_SECONDS", "45"),
                ("NEARCACHE_MAX_TOLERATED_MISS_COUNT", "3"),
                ("NEARCACHE_SEQUENCE_LAG_TOLERANCE", "7"),
            ],
            ReconciliationConfig::from_env,
        );
        assert_eq!(config.interval_seconds, 45);
        assert_eq!(config.max_tolerated_miss_count, 3);
        assert_eq!(config.sequence_lag_tolerance, 7);
        assert_eq!(
            config.effective_period().expect("valid"),
            Some(Duration::from_secs(45))
        );
    }

    #[test]
    fn test_from_env_ignores_unparseable_values() {
        let config = with_env(
            &[
                ("NEARCACHE_RECONCILIATION_INTERVAL_SECONDS", "soon"),
                ("NEARCACHE_MAX_TOLERATED_MISS_COUNT", "-1"),
                ("NEARCACHE_SEQUENCE_LAG_TOLERANCE", ""),
            ],
            ReconciliationConfig::from_env,
        );
        assert_eq!(config, ReconciliationConfig::default());
    }

    #[test]
    fn test_from_env_interval_bounds() {
        let disabled = with_env(
            &[("NEARCACHE_RECONCILIATION_INTERVAL_SECONDS", "0")],
            ReconciliationConfig::from_env,
        );
        assert_eq!(disabled.effective_period().expect("valid"), None);

        let too_short = with_env(
            &[("NEARCACHE_RECONCILIATION_INTERVAL_SECONDS", "15")],
            ReconciliationConfig::from_env,
        );
        assert_eq!(too_short.interval_seconds, 15);
        assert!(too_short.effective_period().is_err());
    }
}
