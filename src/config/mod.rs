use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub recovery: RecoveryConfig,
    pub detector: DetectorConfig,
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Retry and backoff configuration for the recovery engine
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Delay before the first attempt.
    pub initial_delay_ms: u64,
    /// Factor applied to the delay after every failed attempt. Must be > 1.
    pub backoff_multiplier: f64,
    /// Attempts for strategies registered without an explicit limit.
    pub default_max_retries: u32,
    /// Optional deadline for a single `recover` call.
    pub attempt_timeout_ms: Option<u64>,
}

/// Failure classifier configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub history_capacity: usize,
}

/// Metrics monitor configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub default_sample_size: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let defaults = RecoveryConfig::default();
        let recovery = RecoveryConfig {
            initial_delay_ms: parse_var("RECOVERY_INITIAL_DELAY_MS")?
                .unwrap_or(defaults.initial_delay_ms),
            backoff_multiplier: parse_var("RECOVERY_BACKOFF_MULTIPLIER")?
                .unwrap_or(defaults.backoff_multiplier),
            default_max_retries: parse_var("RECOVERY_MAX_RETRIES")?
                .unwrap_or(defaults.default_max_retries),
            attempt_timeout_ms: parse_var("RECOVERY_ATTEMPT_TIMEOUT_MS")?,
        };

        let detector = DetectorConfig {
            history_capacity: parse_var("DETECTOR_HISTORY_CAPACITY")?
                .unwrap_or(DetectorConfig::default().history_capacity),
        };

        let metrics = MetricsConfig {
            default_sample_size: parse_var("METRICS_DEFAULT_SAMPLE_SIZE")?
                .unwrap_or(MetricsConfig::default().default_sample_size),
        };

        let config = Config {
            logging,
            recovery,
            detector,
            metrics,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot operate with.
    pub fn validate(&self) -> Result<(), AppError> {
        let multiplier = self.recovery.backoff_multiplier;
        if !multiplier.is_finite() || multiplier <= 1.0 {
            return Err(AppError::Config {
                message: format!(
                    "RECOVERY_BACKOFF_MULTIPLIER must be greater than 1, got {}",
                    self.recovery.backoff_multiplier
                ),
            });
        }
        if self.detector.history_capacity == 0 {
            return Err(AppError::Config {
                message: "DETECTOR_HISTORY_CAPACITY must be greater than 0".to_string(),
            });
        }
        if self.metrics.default_sample_size == 0 {
            return Err(AppError::Config {
                message: "METRICS_DEFAULT_SAMPLE_SIZE must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Read and parse an optional environment variable. Unset is `None`,
/// set-but-unparseable is a configuration error.
fn parse_var<T: FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| AppError::Config {
            message: format!("{} has an invalid value: '{}'", key, raw),
        }),
        Err(_) => Ok(None),
    }
}

impl RecoveryConfig {
    /// Delay slept before the given 1-based attempt:
    /// `initial_delay * backoff_multiplier^(attempt - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_micros((ms.max(0.0) * 1000.0).round() as u64)
    }

    /// Per-attempt deadline, if configured.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            backoff_multiplier: 1.5,
            default_max_retries: 3,
            attempt_timeout_ms: None,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            default_sample_size: 100,
        }
    }
}
