//! Runtime configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::capabilities::PowerPreference;
use crate::{Error, Result};

/// Top-level configuration for a [`GpuContext`](crate::GpuContext)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Buffer pool behaviour
    #[serde(default)]
    pub pool: PoolConfig,

    /// Power preferences tried in order when probing for an adapter
    #[serde(default = "default_power_preferences")]
    pub power_preferences: Vec<PowerPreference>,

    /// Use half-precision matmul when the device supports it
    #[serde(default = "default_true")]
    pub prefer_f16: bool,

    /// Workgroup-size auto-tuning
    #[serde(default)]
    pub autotune: AutotuneConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            power_preferences: default_power_preferences(),
            prefer_f16: true,
            autotune: AutotuneConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse configuration from a JSON string
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or fails validation
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// # Errors
    /// Returns [`Error::Configuration`] for values the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.power_preferences.is_empty() {
            return Err(Error::Configuration(
                "power_preferences must not be empty".into(),
            ));
        }
        if self.autotune.iterations == 0 {
            return Err(Error::Configuration(
                "autotune.iterations must be at least 1".into(),
            ));
        }
        if let Some(bad) = self
            .autotune
            .candidates
            .iter()
            .find(|c| **c == 0 || !c.is_power_of_two())
        {
            return Err(Error::Configuration(format!(
                "autotune candidate {bad} is not a power of two"
            )));
        }
        Ok(())
    }
}

/// Buffer pool limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Keep released buffers for reuse; when false they are destroyed
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Free buffers kept per (usage, bucket) pair
    #[serde(default = "default_max_buffers_per_bucket")]
    pub max_buffers_per_bucket: usize,

    /// Free buffers kept across all buckets
    #[serde(default = "default_max_pooled_buffers")]
    pub max_pooled_buffers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_buffers_per_bucket: default_max_buffers_per_bucket(),
            max_pooled_buffers: default_max_pooled_buffers(),
        }
    }
}

/// Auto-tuner settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutotuneConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Timed dispatches per candidate
    #[serde(default = "default_autotune_iterations")]
    pub iterations: u32,

    /// Workgroup invocation counts to try
    #[serde(default = "default_autotune_candidates")]
    pub candidates: Vec<u32>,
}

impl Default for AutotuneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            iterations: default_autotune_iterations(),
            candidates: default_autotune_candidates(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_power_preferences() -> Vec<PowerPreference> {
    vec![
        PowerPreference::HighPerformance,
        PowerPreference::LowPower,
        PowerPreference::Default,
    ]
}

fn default_max_buffers_per_bucket() -> usize {
    8
}

fn default_max_pooled_buffers() -> usize {
    64
}

fn default_autotune_iterations() -> u32 {
    3
}

fn default_autotune_candidates() -> Vec<u32> {
    vec![64, 128, 256]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert!(config.pool.enabled);
        assert_eq!(config.pool.max_buffers_per_bucket, 8);
        assert_eq!(config.pool.max_pooled_buffers, 64);
        assert!(config.prefer_f16);
        assert!(!config.autotune.enabled);
        assert_eq!(config.autotune.candidates, vec![64, 128, 256]);
    }

    #[test]
    fn test_partial_override() {
        let json = r#"{
            "pool": { "enabled": false },
            "power_preferences": ["low_power"],
            "prefer_f16": false
        }"#;
        let config = RuntimeConfig::from_json_str(json).unwrap();
        assert!(!config.pool.enabled);
        assert_eq!(config.pool.max_buffers_per_bucket, 8);
        assert_eq!(config.power_preferences, vec![PowerPreference::LowPower]);
        assert!(!config.prefer_f16);
    }

    #[test]
    fn test_rejects_empty_preferences() {
        let err = RuntimeConfig::from_json_str(r#"{"power_preferences": []}"#).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "got {err:?}");
    }

    #[test]
    fn test_rejects_non_power_of_two_candidate() {
        let err =
            RuntimeConfig::from_json_str(r#"{"autotune": {"candidates": [64, 96]}}"#).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "got {err:?}");
    }

    #[test]
    fn test_malformed_json() {
        let err = RuntimeConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)), "got {err:?}");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"autotune": {{"enabled": true, "iterations": 5}}}}"#).unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert!(config.autotune.enabled);
        assert_eq!(config.autotune.iterations, 5);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = RuntimeConfig::from_file("/nonexistent/ember.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)), "got {err:?}");
    }
}
