use std::fmt;
use std::path::Path;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

use crate::conflict::resolution::{ConflictResolution, MergeStrategy};
use crate::errors::{OperationError, Result};
use crate::metrics::HealthThresholds;

/// Policy bucket an operation's [`LockConfig`] is looked up by.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Inventory,
    Reservation,
    Pricing,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Inventory => "inventory",
            ResourceClass::Reservation => "reservation",
            ResourceClass::Pricing => "pricing",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concurrency and invariant policy for one resource class.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub max_retry_attempts: u32,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
    pub conflict_resolution: ConflictResolution,
    pub merge_strategy: MergeStrategy,
    pub allow_negative_stock: bool,
    pub enforce_reservation_limit: bool,
    pub require_approval: bool,
    /// Unresolved conflicts above which monitoring raises a warning.
    pub conflict_threshold: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            lock_timeout: Duration::from_secs(30),
            conflict_resolution: ConflictResolution::Retry,
            merge_strategy: MergeStrategy::Sum,
            allow_negative_stock: false,
            enforce_reservation_limit: true,
            require_approval: false,
            conflict_threshold: 10,
        }
    }
}

/// Engine-wide configuration.
///
/// Immutable while operations run; swap it with
/// [`Engine::reload_config`](crate::engine::Engine::reload_config).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub classes: HashMap<ResourceClass, LockConfig>,
    /// Largest share of current stock a single reservation may take.
    pub reservation_limit_fraction: f64,
    /// Largest relative price change a single update may apply.
    pub max_price_change_fraction: f64,
    #[serde(with = "duration_ms")]
    pub approval_timeout: Duration,
    /// How long terminal operations and conflict records are kept.
    #[serde(with = "duration_ms")]
    pub history_retention: Duration,
    pub health: HealthThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut classes = HashMap::new();
        classes.insert(ResourceClass::Inventory, LockConfig::default());
        classes.insert(
            ResourceClass::Reservation,
            LockConfig {
                max_retry_attempts: 5,
                retry_delay: Duration::from_millis(50),
                ..LockConfig::default()
            },
        );
        classes.insert(
            ResourceClass::Pricing,
            LockConfig {
                conflict_resolution: ConflictResolution::Fail,
                merge_strategy: MergeStrategy::LastWriterWins,
                require_approval: true,
                conflict_threshold: 3,
                ..LockConfig::default()
            },
        );

        Self {
            classes,
            reservation_limit_fraction: 0.8,
            max_price_change_fraction: 0.5,
            approval_timeout: Duration::from_secs(300),
            history_retention: Duration::from_secs(3600),
            health: HealthThresholds::default(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| OperationError::Configuration(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            OperationError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Replaces the policy for one resource class.
    pub fn with_class(mut self, class: ResourceClass, config: LockConfig) -> Self {
        self.classes.insert(class, config);
        self
    }

    /// Looks up the policy for a resource class.
    pub fn lock_config(&self, class: ResourceClass) -> Result<&LockConfig> {
        self.classes.get(&class).ok_or_else(|| {
            OperationError::Configuration(format!("no lock config for resource class {}", class))
        })
    }

    pub fn validate(&self) -> Result<()> {
        check_fraction("reservation_limit_fraction", self.reservation_limit_fraction)?;
        check_fraction("max_price_change_fraction", self.max_price_change_fraction)?;

        for (class, policy) in &self.classes {
            if policy.lock_timeout.is_zero() {
                return Err(OperationError::Configuration(format!(
                    "{}: lock_timeout must be positive",
                    class
                )));
            }
            if policy.conflict_resolution == ConflictResolution::Retry
                && policy.max_retry_attempts == 0
            {
                return Err(OperationError::Configuration(format!(
                    "{}: retry resolution needs max_retry_attempts > 0",
                    class
                )));
            }
        }
        Ok(())
    }
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(OperationError::Configuration(format!(
            "{} must be in (0, 1], got {}",
            name, value
        )))
    }
}

/// Intervals of the housekeeping loops run by [`Monitor`](crate::monitor::Monitor).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MonitoringConfig {
    #[serde(with = "duration_ms")]
    pub conflict_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub purge_interval: Duration,
    #[serde(with = "duration_ms")]
    pub throughput_interval: Duration,
    #[serde(with = "duration_ms")]
    pub lock_reap_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            conflict_check_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(300),
            throughput_interval: Duration::from_secs(10),
            lock_reap_interval: Duration::from_secs(1),
        }
    }
}

/// Durations travel as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
