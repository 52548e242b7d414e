//! Logging Configuration
//!
//! Settings come from environment variables so the uploader can be tuned
//! without touching its TOML config. Standard `RUST_LOG` syntax is honored.

/// Logging configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Filter directives (default: info)
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Include the module path of each event
    pub with_target: bool,
    /// Service name attached to every event (default: bes-uploader)
    pub service_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            json: false,
            with_target: true,
            service_name: "bes-uploader".to_string(),
        }
    }
}

impl LogConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = LogConfig::default();
        LogConfig {
            filter: lookup("RUST_LOG")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.filter),
            json: lookup("BES_LOG_JSON")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.json),
            with_target: lookup("BES_LOG_TARGET")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.with_target),
            service_name: lookup("BES_SERVICE").unwrap_or(defaults.service_name),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes" | "on")
}
