//! CLI argument validation functions
//!
//! This module provides custom validation functions for CLI arguments
//! that go beyond what clap can validate automatically.

use std::fs;
use std::path::PathBuf;

use crate::models::SignalKind;

/// Validate a worker id: non-empty, no whitespace
pub fn validate_worker_id(id_str: &str) -> Result<String, String> {
    let id = id_str.trim();

    if id.is_empty() {
        return Err("Worker id cannot be empty".to_string());
    }

    if id.chars().any(char::is_whitespace) {
        return Err(format!("Worker id cannot contain whitespace, got: '{}'", id_str));
    }

    if id.len() > 255 {
        return Err("Worker id is too long (maximum 255 characters)".to_string());
    }

    Ok(id.to_string())
}

/// Validate a strictly positive number of seconds
pub fn validate_positive_u64(value_str: &str) -> Result<u64, String> {
    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("Expected a positive number, got: '{}'", value_str))?;

    if value == 0 {
        return Err("Value must be greater than 0".to_string());
    }

    Ok(value)
}

/// Validate a strictly positive count
pub fn validate_positive_usize(value_str: &str) -> Result<usize, String> {
    let value: usize = value_str
        .parse()
        .map_err(|_| format!("Expected a positive number, got: '{}'", value_str))?;

    if value == 0 {
        return Err("Value must be greater than 0".to_string());
    }

    Ok(value)
}

/// Validate a listing limit between 1 and 1000
pub fn validate_list_limit(value_str: &str) -> Result<i64, String> {
    let value: i64 = value_str
        .parse()
        .map_err(|_| format!("Limit must be a number, got: '{}'", value_str))?;

    if !(1..=1000).contains(&value) {
        return Err("Limit must be between 1 and 1000".to_string());
    }

    Ok(value)
}

pub fn validate_signal(signal_str: &str) -> Result<SignalKind, String> {
    signal_str.parse()
}

/// Validate that a file path is accessible (exists and is readable)
pub fn validate_config_file_path(path_str: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(format!("Configuration file does not exist: '{}'", path_str));
    }

    if !path.is_file() {
        return Err(format!("Configuration path is not a file: '{}'", path_str));
    }

    match fs::File::open(&path) {
        Ok(_) => Ok(path),
        Err(e) => Err(format!(
            "Cannot read configuration file '{}': {}",
            path_str, e
        )),
    }
}

/// Validate rollback steps is a positive number
pub fn validate_rollback_steps(steps_str: &str) -> Result<u32, String> {
    let steps: u32 = steps_str.parse().map_err(|_| {
        format!(
            "Rollback steps must be a valid positive number, got: '{}'",
            steps_str
        )
    })?;

    if steps == 0 {
        return Err("Rollback steps must be greater than 0".to_string());
    }

    // Reasonable upper limit to prevent accidental mass rollbacks
    if steps > 100 {
        return Err("Rollback steps cannot exceed 100 for safety reasons".to_string());
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_validation() {
        for id in ["10.0.0.12", "batch-1", "  w1  "] {
            assert!(validate_worker_id(id).is_ok(), "{} should be valid", id);
        }
        assert_eq!(validate_worker_id("  w1 ").unwrap(), "w1");

        let long = "x".repeat(300);
        for id in ["", "   ", "two words", long.as_str()] {
            assert!(validate_worker_id(id).is_err(), "'{}' should be invalid", id);
        }
    }

    #[test]
    fn test_positive_numbers() {
        assert_eq!(validate_positive_u64("5").unwrap(), 5);
        assert_eq!(validate_positive_usize("25").unwrap(), 25);
        for value in ["0", "-1", "abc", ""] {
            assert!(validate_positive_u64(value).is_err());
            assert!(validate_positive_usize(value).is_err());
        }
    }

    #[test]
    fn test_list_limit() {
        assert_eq!(validate_list_limit("20").unwrap(), 20);
        for value in ["0", "1001", "x"] {
            assert!(validate_list_limit(value).is_err());
        }
    }

    #[test]
    fn test_config_file_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        assert!(validate_config_file_path(path).is_ok());

        let dir = tempfile::tempdir().unwrap();
        assert!(validate_config_file_path(dir.path().to_str().unwrap()).is_err());
        assert!(validate_config_file_path("/definitely/missing.toml").is_err());
    }

    #[test]
    fn test_rollback_steps_validation() {
        for steps in ["1", "5", "100"] {
            assert!(validate_rollback_steps(steps).is_ok(), "Steps {} should be valid", steps);
        }
        for steps in ["0", "101", "-1", "abc", ""] {
            assert!(validate_rollback_steps(steps).is_err(), "Steps '{}' should be invalid", steps);
        }
    }
}
