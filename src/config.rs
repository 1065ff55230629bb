//! Configuration for the drowsiness agent

use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Sampling and debounce settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Remote classifier settings
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sampling and debounce settings. Read-only once the scheduler is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Consecutive CLOSED/YAWN observations that raise the alarm
    #[serde(default = "default_threshold")]
    pub drowsiness_threshold: u32,

    /// Delay between the end of one cycle and the start of the next
    #[serde(default = "default_interval")]
    pub analysis_interval_ms: u64,

    /// Consecutive frame-less cycles before a warning is logged
    #[serde(default = "default_skip_warn")]
    pub frame_skip_warn_after: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            drowsiness_threshold: default_threshold(),
            analysis_interval_ms: default_interval(),
            frame_skip_warn_after: default_skip_warn(),
        }
    }
}

impl MonitorConfig {
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms)
    }
}

/// Remote classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Model name used in the generateContent path
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL or full `:generateContent` URL
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Falls back to `GEMINI_API_KEY` when unset
    #[serde(default)]
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            endpoint: None,
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_threshold() -> u32 {
    3
}

fn default_interval() -> u64 {
    2000
}

fn default_skip_warn() -> u32 {
    5
}

fn default_model() -> String {
    crate::classifier::DEFAULT_MODEL.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from defaults, an optional file, then `DROWSY_*` env vars.
    pub fn load(path: Option<&str>) -> AgentResult<Self> {
        let config = Self::build(path).map_err(|e| AgentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn build(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        // e.g. DROWSY_MONITOR__DROWSINESS_THRESHOLD=4
        builder = builder.add_source(
            config::Environment::with_prefix("DROWSY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> AgentResult<()> {
        if self.monitor.drowsiness_threshold == 0 {
            return Err(AgentError::Config(
                "monitor.drowsiness_threshold must be at least 1".to_string(),
            ));
        }
        if self.monitor.analysis_interval_ms == 0 {
            return Err(AgentError::Config(
                "monitor.analysis_interval_ms must be positive".to_string(),
            ));
        }
        if self.classifier.request_timeout_secs == 0 {
            return Err(AgentError::Config(
                "classifier.request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
