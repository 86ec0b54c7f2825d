//! Configuration for the supervisor and the storage engine.
//!
//! All durations use humantime encoding in serialized form ("1s", "15m").
//! Constructors validate cross-field constraints; deserialized configs must
//! be validated explicitly via `validate()`.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Minimum journal size: 1 MB. Smaller journals thrash the rotation path.
const MIN_JOURNAL_SIZE: u64 = 1024 * 1024;

/// Errors raised when a configuration value is invalid.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Supervisor configuration.
///
/// # Validation Rules
///
/// - `frequency` and `grace_period` must be non-zero
/// - `job_id_batch` must be non-zero
/// - `agency_prefix` must start with `/` and not end with one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SupervisionConfig {
    /// Root prefix of the agency tree this cluster lives under.
    #[serde(default = "default_agency_prefix")]
    pub agency_prefix: String,
    /// Interval between supervisor ticks.
    #[serde(default = "default_frequency")]
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub frequency: Duration,
    /// Minimum time a node stays BAD (and the leader stays stable) before it
    /// may be marked FAILED.
    #[serde(default = "default_grace_period")]
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub grace_period: Duration,
    /// Number of job ids claimed per `/Sync/LatestID` increment.
    #[serde(default = "default_job_id_batch")]
    pub job_id_batch: u64,
    /// Whether shrink may schedule `removeServer` for useless failed servers.
    ///
    /// The upstream behavior keeps this off and routes shrink exclusively
    /// through `cleanOutServer`.
    #[serde(default)]
    pub shrink_via_remove_server: bool,
}

#[bon::bon]
impl SupervisionConfig {
    /// Creates a new supervision configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any field is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_agency_prefix())] agency_prefix: String,
        #[builder(default = default_frequency())] frequency: Duration,
        #[builder(default = default_grace_period())] grace_period: Duration,
        #[builder(default = default_job_id_batch())] job_id_batch: u64,
        #[builder(default = false)] shrink_via_remove_server: bool,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { agency_prefix, frequency, grace_period, job_id_batch, shrink_via_remove_server };
        config.validate()?;
        Ok(config)
    }
}

impl SupervisionConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frequency.is_zero() {
            return Err(ConfigError::Validation { message: "frequency must be > 0".to_string() });
        }
        if self.grace_period.is_zero() {
            return Err(ConfigError::Validation { message: "grace_period must be > 0".to_string() });
        }
        if self.job_id_batch == 0 {
            return Err(ConfigError::Validation { message: "job_id_batch must be > 0".to_string() });
        }
        if !self.agency_prefix.starts_with('/') || self.agency_prefix.ends_with('/') {
            return Err(ConfigError::Validation {
                message: format!(
                    "agency_prefix must start with '/' and not end with one, got {:?}",
                    self.agency_prefix
                ),
            });
        }
        Ok(())
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            agency_prefix: default_agency_prefix(),
            frequency: default_frequency(),
            grace_period: default_grace_period(),
            job_id_batch: default_job_id_batch(),
            shrink_via_remove_server: false,
        }
    }
}

/// Storage engine configuration.
///
/// # Validation Rules
///
/// - `journal_size` must be >= 1 MB
/// - `lock_timeout` must be non-zero
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// Default size of a freshly created journal datafile, in bytes.
    ///
    /// Individual collections may override this.
    #[serde(default = "default_journal_size")]
    pub journal_size: u64,
    /// Upper bound on waiting for the per-collection write lock.
    #[serde(default = "default_lock_timeout")]
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub lock_timeout: Duration,
}

#[bon::bon]
impl StorageConfig {
    /// Creates a new storage configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any field is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_journal_size())] journal_size: u64,
        #[builder(default = default_lock_timeout())] lock_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { journal_size, lock_timeout };
        config.validate()?;
        Ok(config)
    }
}

impl StorageConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.journal_size < MIN_JOURNAL_SIZE {
            return Err(ConfigError::Validation {
                message: format!(
                    "journal_size must be >= {MIN_JOURNAL_SIZE} (1 MB), got {}",
                    self.journal_size
                ),
            });
        }
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::Validation { message: "lock_timeout must be > 0".to_string() });
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { journal_size: default_journal_size(), lock_timeout: default_lock_timeout() }
    }
}

fn default_agency_prefix() -> String {
    "/arango".to_string()
}

fn default_frequency() -> Duration {
    Duration::from_secs(1)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_job_id_batch() -> u64 {
    10_000
}

fn default_journal_size() -> u64 {
    32 * 1024 * 1024
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_supervision_defaults_are_valid() {
        let config = SupervisionConfig::default();
        config.validate().expect("defaults should be valid");
        assert_eq!(config.agency_prefix, "/arango");
        assert_eq!(config.frequency, Duration::from_secs(1));
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.job_id_batch, 10_000);
        assert!(!config.shrink_via_remove_server);
    }

    #[test]
    fn test_supervision_builder_matches_default() {
        let built = SupervisionConfig::builder().build().unwrap();
        assert_eq!(built, SupervisionConfig::default());
    }

    #[test]
    fn test_supervision_rejects_zero_frequency() {
        let result = SupervisionConfig::builder().frequency(Duration::ZERO).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_supervision_rejects_bad_prefix() {
        for prefix in ["arango", "/arango/"] {
            let result = SupervisionConfig::builder().agency_prefix(prefix.to_string()).build();
            assert!(result.is_err(), "prefix {prefix:?} should be rejected");
        }
    }

    #[test]
    fn test_storage_defaults_are_valid() {
        let config = StorageConfig::default();
        config.validate().expect("defaults should be valid");
        assert_eq!(config.lock_timeout, Duration::from_secs(900));
    }

    #[test]
    fn test_storage_rejects_tiny_journal() {
        let result = StorageConfig::builder().journal_size(1024).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_duration_fields_roundtrip_humantime() {
        let config = SupervisionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"1s\""), "got: {json}");
        let back: SupervisionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: SupervisionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SupervisionConfig::default());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation { message: "test error".to_string() };
        assert_eq!(err.to_string(), "invalid config: test error");
    }
}
