//! Aggregated core configuration. Every section falls back to its defaults
//! when absent from the host-supplied JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image_cache::{ImageCacheConfig, ImageCacheError};
use crate::retry::RetryPolicy;
use crate::sync::SyncConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("retry policy '{policy}': {reason}")]
    RetryPolicy { policy: &'static str, reason: String },

    #[error("image cache: {0}")]
    ImageCache(String),

    #[error("sync: {0}")]
    Sync(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Policy for host-initiated calls routed through the shared engine.
    pub retry: RetryPolicy,
    pub image_cache: ImageCacheConfig,
    pub sync: SyncConfig,
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_policy("retry", &self.retry)?;
        validate_policy("sync.history_retry", &self.sync.history_retry)?;
        validate_policy("sync.send_retry", &self.sync.send_retry)?;
        validate_policy("sync.upload_retry", &self.sync.upload_retry)?;
        validate_policy("sync.push_connect_retry", &self.sync.push_connect_retry)?;

        self.image_cache.validate().map_err(|e| match e {
            ImageCacheError::Config(reason) => ConfigError::ImageCache(reason),
            other => ConfigError::ImageCache(other.to_string()),
        })?;

        if self.sync.read_receipt_debounce_ms > 60_000 {
            return Err(ConfigError::Sync(
                "read_receipt_debounce_ms must be at most 60000".into(),
            ));
        }
        Ok(())
    }
}

fn validate_policy(policy: &'static str, p: &RetryPolicy) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::RetryPolicy {
        policy,
        reason: reason.to_string(),
    };

    if p.max_attempts == 0 {
        return Err(invalid("max_attempts must be > 0"));
    }
    if !p.backoff_multiplier.is_finite() || p.backoff_multiplier < 1.0 {
        return Err(invalid("backoff_multiplier must be finite and >= 1.0"));
    }
    if p.base_delay_ms > p.max_delay_ms {
        return Err(invalid("base_delay_ms must not exceed max_delay_ms"));
    }
    if p.retryable_status_codes.iter().any(|c| !(100..=599).contains(c)) {
        return Err(invalid("retryable_status_codes must be valid HTTP statuses"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config = CoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.image_cache.disk_max_file_bytes, 5 * 1024 * 1024);
        assert_eq!(config.image_cache.max_dimension, 1920);
        assert_eq!(config.sync.read_receipt_debounce_ms, 500);
        assert_eq!(config.sync.push_connect_retry.max_attempts, 5);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let json = r#"{
            "retry": { "max_attempts": 4 },
            "image_cache": { "memory_max_entries": 20 },
            "sync": { "read_receipt_debounce_ms": 250, "prefetch_attachments": false }
        }"#;
        let config = CoreConfig::from_json_str(json).unwrap();
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.image_cache.memory_max_entries, 20);
        assert_eq!(config.image_cache.initial_quality, 90);
        assert_eq!(config.sync.read_receipt_debounce_ms, 250);
        assert!(!config.sync.prefetch_attachments);
    }

    #[test]
    fn rejects_inverted_delays() {
        let json = r#"{ "sync": { "send_retry": { "base_delay_ms": 9000, "max_delay_ms": 10 } } }"#;
        let err = CoreConfig::from_json_str(json).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::RetryPolicy {
                policy: "sync.send_retry",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_attempts_and_bad_cache() {
        let mut config = CoreConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.image_cache.quality_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ImageCache(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            CoreConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
