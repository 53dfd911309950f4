//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use blitnet::config::{NetworkConfig, MAX_FRAME_SIZE_LIMIT, MIN_FRAME_SIZE_LIMIT};
use blitnet::protocol::dispatcher::HandlerIdEncoding;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_transport_address() {
    let mut config = NetworkConfig::default();
    config.transport.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors
        .iter()
        .any(|e| e.contains("Invalid transport address format")));
}

#[test]
fn test_empty_transport_address() {
    let mut config = NetworkConfig::default();
    config.transport.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_frame_size_limit_bounds() {
    let mut config = NetworkConfig::default();
    config.transport.frame_size_limit = MIN_FRAME_SIZE_LIMIT - 1;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Frame size limit too small")));

    config.transport.frame_size_limit = MAX_FRAME_SIZE_LIMIT + 1;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Frame size limit too large")));

    config.transport.frame_size_limit = MIN_FRAME_SIZE_LIMIT;
    assert!(config.validate().is_empty());
}

#[test]
fn test_zero_writer_capacity() {
    let mut config = NetworkConfig::default();
    config.pool.writer_capacity = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Writer capacity must be greater than 0")));
}

#[test]
fn test_max_pooled_capacity_below_writer_capacity() {
    let mut config = NetworkConfig::default();
    config.pool.writer_capacity = 4096;
    config.pool.max_pooled_capacity = 1024;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("cannot be smaller than writer capacity")));
}

#[test]
fn test_excessive_preallocated_writers() {
    let mut config = NetworkConfig::default();
    config.pool.preallocated_writers = 100_000;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Preallocated writers very high")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_output() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();
    config.transport.address = String::new();
    config.pool.writer_capacity = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 3,
        "Should have at least 3 errors, got {}",
        errors.len()
    );
}

#[test]
fn test_validate_strict_joins_errors() {
    let mut config = NetworkConfig::default();
    config.transport.address = String::new();

    let error = config.validate_strict().unwrap_err().to_string();
    assert!(error.contains("Configuration validation failed"));
    assert!(error.contains("cannot be empty"));
}

#[test]
fn test_toml_sections() {
    let config = NetworkConfig::from_toml(
        r#"
        [transport]
        address = "0.0.0.0:9000"
        frame_size_limit = 4096

        [dispatcher]
        handler_ids = "stable_hash"
        record_diagnostics = true

        [logging]
        log_level = "debug"
        "#,
    )
    .unwrap();

    assert_eq!(config.transport.address, "0.0.0.0:9000");
    assert_eq!(config.transport.frame_size_limit, 4096);
    assert_eq!(config.dispatcher.handler_ids, HandlerIdEncoding::StableHash);
    assert!(config.dispatcher.record_diagnostics);
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.validate().is_empty());
}

#[test]
fn test_invalid_toml_rejected() {
    assert!(NetworkConfig::from_toml("[dispatcher]\nhandler_ids = \"numbers\"").is_err());
    assert!(NetworkConfig::from_toml("[logging]\nlog_level = \"loud\"").is_err());
}

#[test]
fn test_save_and_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blitnet.toml");

    let config = NetworkConfig::default_with_overrides(|c| {
        c.transport.frame_size_limit = 2048;
        c.dispatcher.handler_ids = HandlerIdEncoding::StableHash;
    });
    config.save_to_file(&path).unwrap();

    let loaded = NetworkConfig::from_file(&path).unwrap();
    assert_eq!(loaded.transport.frame_size_limit, 2048);
    assert_eq!(loaded.dispatcher.handler_ids, HandlerIdEncoding::StableHash);
}

#[test]
fn test_missing_file_reported() {
    let dir = tempfile::tempdir().unwrap();
    let result = NetworkConfig::from_file(dir.path().join("absent.toml"));
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("Failed to open config file"));
}
