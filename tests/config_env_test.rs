//! Config environment variable tests
//!
//! These tests verify that Config::from_env() reads and validates
//! environment variable overrides. Config::from_env() also loads a .env
//! file via dotenvy, so each test sets the variables it asserts on.
//!
//! Tests use #[serial] to prevent race conditions with shared env vars.

use render_healing::config::{Config, LogFormat};
use render_healing::AppError;
use serial_test::serial;
use std::env;

const VARS: &[&str] = &[
    "LOG_LEVEL",
    "LOG_FORMAT",
    "RECOVERY_INITIAL_DELAY_MS",
    "RECOVERY_BACKOFF_MULTIPLIER",
    "RECOVERY_MAX_RETRIES",
    "RECOVERY_ATTEMPT_TIMEOUT_MS",
    "DETECTOR_HISTORY_CAPACITY",
    "METRICS_DEFAULT_SAMPLE_SIZE",
];

fn reset_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_config_from_env_defaults() {
    reset_env();

    let config = Config::from_env().unwrap();
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(config.recovery.initial_delay_ms, 1000);
    assert_eq!(config.recovery.backoff_multiplier, 1.5);
    assert_eq!(config.recovery.default_max_retries, 3);
    assert_eq!(config.recovery.attempt_timeout_ms, None);
    assert_eq!(config.detector.history_capacity, 1000);
    assert_eq!(config.metrics.default_sample_size, 100);
}

#[test]
#[serial]
fn test_config_from_env_json_log_format() {
    reset_env();
    env::set_var("LOG_FORMAT", "JSON");
    env::set_var("LOG_LEVEL", "debug");

    let config = Config::from_env().unwrap();
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.logging.level, "debug");

    reset_env();
}

#[test]
#[serial]
fn test_config_from_env_custom_recovery() {
    reset_env();
    env::set_var("RECOVERY_INITIAL_DELAY_MS", "250");
    env::set_var("RECOVERY_BACKOFF_MULTIPLIER", "2.0");
    env::set_var("RECOVERY_MAX_RETRIES", "5");
    env::set_var("RECOVERY_ATTEMPT_TIMEOUT_MS", "30000");

    let config = Config::from_env().unwrap();
    assert_eq!(config.recovery.initial_delay_ms, 250);
    assert_eq!(config.recovery.backoff_multiplier, 2.0);
    assert_eq!(config.recovery.default_max_retries, 5);
    assert_eq!(config.recovery.attempt_timeout_ms, Some(30000));

    reset_env();
}

#[test]
#[serial]
fn test_config_from_env_buffer_sizes() {
    reset_env();
    env::set_var("DETECTOR_HISTORY_CAPACITY", "50");
    env::set_var("METRICS_DEFAULT_SAMPLE_SIZE", " 20 ");

    let config = Config::from_env().unwrap();
    assert_eq!(config.detector.history_capacity, 50);
    assert_eq!(config.metrics.default_sample_size, 20);

    reset_env();
}

#[test]
#[serial]
fn test_config_from_env_unparseable_value() {
    reset_env();
    env::set_var("RECOVERY_MAX_RETRIES", "lots");

    let result = Config::from_env();
    match result {
        Err(AppError::Config { message }) => assert!(message.contains("RECOVERY_MAX_RETRIES")),
        other => panic!("expected config error, got {:?}", other),
    }

    reset_env();
}

#[test]
#[serial]
fn test_config_from_env_rejects_shrinking_backoff() {
    reset_env();
    env::set_var("RECOVERY_BACKOFF_MULTIPLIER", "0.5");

    assert!(matches!(Config::from_env(), Err(AppError::Config { .. })));

    reset_env();
}

#[test]
#[serial]
fn test_config_from_env_rejects_zero_capacity() {
    reset_env();
    env::set_var("DETECTOR_HISTORY_CAPACITY", "0");

    assert!(Config::from_env().is_err());

    reset_env();
}
