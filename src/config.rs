//! YAML configuration file support.
//!
//! All tunables for a run live in one file: rate limiting, retries, the
//! limiter state machine, the cache store, matching weights, pipeline
//! sizing, and the HTTP transport. Every section is optional and falls back
//! to its defaults.
//!
//! ## Example
//!
//! ```yaml
//! concurrency_cap: 8
//!
//! rate_limit:
//!   rate_base: 35.0
//!   capacity: 35.0
//!
//! matcher:
//!   title_weight: 0.65
//!   year_weight: 0.20
//!   metadata_weight: 0.15
//!   high_confidence: 0.75
//!   min_confidence: 0.30
//!   max_fallback_rounds: 3
//!
//! pipeline:
//!   queue_capacity: 2048
//!   parser_workers: 4
//!   match_workers: 4
//!   extensions: ["mkv", "mp4", "avi"]
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::client::HttpApiConfig;
use crate::matcher::MatchConfig;
use crate::pipeline::PipelineConfig;
use crate::resilience::{LimiterConfig, RateLimitConfig, RetryConfig};

/// Errors that can occur when loading a configuration file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Top-level configuration for one organizer run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CoreConfig {
    /// Maximum simultaneous in-flight API requests.
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: usize,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub matcher: MatchConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub http: HttpApiConfig,
}

fn default_concurrency_cap() -> usize {
    8
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: default_concurrency_cap(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            limiter: LimiterConfig::default(),
            cache: CacheConfig::default(),
            matcher: MatchConfig::default(),
            pipeline: PipelineConfig::default(),
            http: HttpApiConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load and validate a YAML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML configuration from a string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_cap == 0 {
            return Err(invalid("concurrency_cap must be >= 1"));
        }

        if self.rate_limit.rate_base <= 0.0 {
            return Err(invalid("rate_limit.rate_base must be > 0"));
        }
        if self.rate_limit.capacity <= 0.0 {
            return Err(invalid("rate_limit.capacity must be > 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be >= 1"));
        }
        if self.retry.base_delay.is_zero() {
            return Err(invalid("retry.base_delay must be > 0"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(invalid("retry.max_delay must be >= retry.base_delay"));
        }

        for (name, p) in [
            ("limiter.p_throttle", self.limiter.p_throttle),
            ("limiter.p_recover", self.limiter.p_recover),
            ("limiter.p_sleep", self.limiter.p_sleep),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(invalid(format!("{name} must be within [0, 1]")));
            }
        }
        if self.limiter.p_recover >= self.limiter.p_throttle {
            return Err(invalid("limiter.p_recover must be < limiter.p_throttle"));
        }
        if self.limiter.hysteresis == 0 {
            return Err(invalid("limiter.hysteresis must be >= 1"));
        }
        if self.limiter.half_open_probes == 0 {
            return Err(invalid("limiter.half_open_probes must be >= 1"));
        }
        if self.limiter.sleep_min > self.limiter.sleep_max {
            return Err(invalid("limiter.sleep_min must be <= limiter.sleep_max"));
        }
        if self.limiter.cooldown_factor < 1.0 {
            return Err(invalid("limiter.cooldown_factor must be >= 1.0"));
        }

        if self.cache.max_bytes == 0 {
            return Err(invalid("cache.max_bytes must be > 0"));
        }

        let weight_sum =
            self.matcher.title_weight + self.matcher.year_weight + self.matcher.metadata_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(invalid(format!(
                "matcher weights must sum to 1.0, got {weight_sum}"
            )));
        }
        if self.matcher.min_confidence >= self.matcher.high_confidence {
            return Err(invalid(
                "matcher.min_confidence must be < matcher.high_confidence",
            ));
        }
        if !(0.0..=1.0).contains(&self.matcher.high_confidence)
            || !(0.0..=1.0).contains(&self.matcher.min_confidence)
        {
            return Err(invalid("matcher thresholds must be within [0, 1]"));
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(invalid("pipeline.queue_capacity must be >= 1"));
        }
        if self.pipeline.parser_workers == 0 || self.pipeline.match_workers == 0 {
            return Err(invalid("pipeline worker counts must be >= 1"));
        }
        if self.pipeline.extensions.is_empty() {
            return Err(invalid("pipeline.extensions must not be empty"));
        }

        if self.http.base_url.is_empty() {
            return Err(invalid("http.base_url must not be empty"));
        }
        if self.http.connect_timeout.is_zero() || self.http.request_timeout.is_zero() {
            return Err(invalid("http timeouts must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_partial_yaml() {
        let yaml = r#"
concurrency_cap: 4
matcher:
  title_weight: 0.5
  year_weight: 0.3
  metadata_weight: 0.2
  high_confidence: 0.8
  min_confidence: 0.4
  max_fallback_rounds: 2
pipeline:
  queue_capacity: 64
  parser_workers: 2
  match_workers: 2
  extensions: ["mkv"]
"#;
        let config = CoreConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.concurrency_cap, 4);
        assert_eq!(config.matcher.max_fallback_rounds, 2);
        assert_eq!(config.pipeline.queue_capacity, 64);
        // Untouched sections keep their defaults.
        assert_eq!(config.rate_limit, RateLimitConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"concurrency_cap: 2\n").unwrap();
        let config = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.concurrency_cap, 2);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let yaml = r#"
matcher:
  title_weight: 0.9
  year_weight: 0.3
  metadata_weight: 0.15
  high_confidence: 0.75
  min_confidence: 0.3
  max_fallback_rounds: 3
"#;
        let err = CoreConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let mut config = CoreConfig::default();
        config.matcher.min_confidence = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_recover_threshold_below_throttle_threshold() {
        let mut config = CoreConfig::default();
        config.limiter.p_recover = 0.5;
        config.limiter.p_throttle = 0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = CoreConfig::default();
        config.concurrency_cap = 0;
        assert!(config.validate().is_err());
    }
}
