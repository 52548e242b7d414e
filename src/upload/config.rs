//! Uploader Configuration
//!
//! Loadable from TOML. Durations are written as milliseconds.
//!
//! ```toml
//! build_id = "b-1234"
//! invocation_id = "inv-5678"
//! close_timeout = 30000
//!
//! [retry]
//! max_attempts = 4
//! base_delay = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Exponential back-off factor between retry attempts
pub const BACKOFF_MULTIPLIER: f64 = 1.6;

/// Attempts beyond this one back off no further
pub const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Retry policy for failed stream instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed without progress before giving up (default: 4)
    pub max_attempts: u32,
    /// Delay before the first retry; later ones grow by 1.6x (default: 1000ms)
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryConfig {
    /// Short delays so tests exercising the retry path stay fast
    pub fn test() -> Self {
        RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(5),
        }
    }

    /// `base_delay * 1.6^attempt`, with the exponent capped at
    /// `MAX_BACKOFF_EXPONENT`. Saturates rather than overflowing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = BACKOFF_MULTIPLIER.powi(attempt.min(MAX_BACKOFF_EXPONENT) as i32);
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }
}

/// Configuration for a build event upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Identifies the build on the remote service
    pub build_id: String,
    /// Identifies this invocation within the build
    pub invocation_id: String,
    /// Forced abort if close has not completed within this window (0 = wait forever)
    #[serde(with = "duration_millis")]
    pub close_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        UploaderConfig {
            build_id: "build".to_string(),
            invocation_id: "invocation".to_string(),
            close_timeout: Duration::ZERO,
            retry: RetryConfig::default(),
        }
    }
}

impl UploaderConfig {
    /// Configuration for testing (fast retries, no close timeout)
    pub fn test() -> Self {
        UploaderConfig {
            build_id: "test-build".to_string(),
            invocation_id: "test-invocation".to_string(),
            close_timeout: Duration::ZERO,
            retry: RetryConfig::test(),
        }
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: UploaderConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build_id.trim().is_empty() {
            return Err(ConfigError::Invalid("build_id must not be empty".to_string()));
        }
        if self.invocation_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "invocation_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Error loading or validating configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Io { path: String, message: String },
    Parse(String),
    Invalid(String),
    /// The uploader was constructed outside a tokio runtime
    NoRuntime(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, message } => {
                write!(f, "cannot read config {}: {}", path, message)
            }
            ConfigError::Parse(msg) => write!(f, "invalid config syntax: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
            ConfigError::NoRuntime(msg) => write!(f, "no tokio runtime available: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = UploaderConfig::default();
        assert_eq!(config.close_timeout, Duration::ZERO);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_growth() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0).as_millis(), 1000);
        assert_eq!(retry.delay_for_attempt(1).as_millis(), 1600);
        assert_eq!(retry.delay_for_attempt(2).as_millis(), 2560);
    }

    #[test]
    fn test_backoff_exponent_is_capped() {
        let retry = RetryConfig {
            max_attempts: u32::MAX,
            base_delay: Duration::from_millis(1),
        };
        let ceiling = retry.delay_for_attempt(MAX_BACKOFF_EXPONENT);
        assert_eq!(retry.delay_for_attempt(150), ceiling);
        assert_eq!(retry.delay_for_attempt(u32::MAX), ceiling);
        assert!(ceiling > retry.delay_for_attempt(MAX_BACKOFF_EXPONENT - 1));
    }

    #[test]
    fn test_backoff_saturates_on_huge_base_delay() {
        let retry = RetryConfig {
            max_attempts: 4,
            base_delay: Duration::MAX,
        };
        assert_eq!(retry.delay_for_attempt(3), Duration::MAX);
    }

    #[test]
    fn test_parse_toml() {
        let config = UploaderConfig::from_toml_str(
            r#"
            build_id = "b-1"
            invocation_id = "i-1"
            close_timeout = 2500

            [retry]
            max_attempts = 2
            base_delay = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.build_id, "b-1");
        assert_eq!(config.close_timeout, Duration::from_millis(2500));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = UploaderConfig::from_toml_str("build_id = \"only\"").unwrap();
        assert_eq!(config.build_id, "only");
        assert_eq!(config.invocation_id, "invocation");
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_rejects_empty_ids() {
        let err = UploaderConfig::from_toml_str("build_id = \"  \"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_syntax() {
        let err = UploaderConfig::from_toml_str("close_timeout = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "build_id = \"from-file\"\nclose_timeout = 10").unwrap();
        let config = UploaderConfig::load(file.path()).unwrap();
        assert_eq!(config.build_id, "from-file");
        assert_eq!(config.close_timeout, Duration::from_millis(10));

        let missing = UploaderConfig::load(Path::new("/nonexistent/uploader.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = UploaderConfig::test().with_close_timeout(Duration::from_millis(100));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: UploaderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
