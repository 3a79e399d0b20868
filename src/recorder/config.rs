//! Buffer configuration
//!
//! All durations are stored in milliseconds so the JSON form stays readable.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Upper bound for the pre-buffer, post-buffer and segment lengths (one day)
pub const MAX_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// How the post-buffer is recorded once a capture is triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PostBufferStrategy {
    /// One `begin(post_buffer)` call
    Continuous,
    /// Fixed-length segments until the post-buffer duration is covered
    Segmented {
        #[serde(rename = "segmentMs")]
        segment_ms: u64,
    },
}

impl Default for PostBufferStrategy {
    fn default() -> Self {
        Self::Continuous
    }
}

/// Configuration for buffering and triggered capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferConfig {
    /// Footage kept from before the trigger
    #[serde(default = "default_pre_buffer_ms")]
    pub pre_buffer_ms: u64,

    /// Footage recorded after the trigger
    #[serde(default = "default_post_buffer_ms")]
    pub post_buffer_ms: u64,

    /// Length of each buffering segment
    #[serde(default = "default_segment_ms")]
    pub segment_ms: u64,

    /// Extra time granted to the post-buffer before it is stopped early
    #[serde(default = "default_grace_margin_ms")]
    pub grace_margin_ms: u64,

    /// How long to wait for an in-flight segment to honor an early stop
    #[serde(default = "default_early_stop_timeout_ms")]
    pub early_stop_timeout_ms: u64,

    /// Pause between failed buffering attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Consecutive failures before buffering is reported as degraded
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,

    #[serde(default)]
    pub post_buffer_strategy: PostBufferStrategy,

    /// Upper bound on post-buffer segments for the segmented strategy
    #[serde(default = "default_max_post_segments")]
    pub max_post_segments: usize,

    /// Where merged captures are written when no path is given
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_pre_buffer_ms() -> u64 {
    9_000
}

fn default_post_buffer_ms() -> u64 {
    5_000
}

fn default_segment_ms() -> u64 {
    3_000
}

fn default_grace_margin_ms() -> u64 {
    2_000
}

fn default_early_stop_timeout_ms() -> u64 {
    2_000
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_degraded_threshold() -> u32 {
    3
}

fn default_max_post_segments() -> usize {
    16
}

fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("replay-buffer").join("captures")
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            pre_buffer_ms: default_pre_buffer_ms(),
            post_buffer_ms: default_post_buffer_ms(),
            segment_ms: default_segment_ms(),
            grace_margin_ms: default_grace_margin_ms(),
            early_stop_timeout_ms: default_early_stop_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            degraded_threshold: default_degraded_threshold(),
            post_buffer_strategy: PostBufferStrategy::default(),
            max_post_segments: default_max_post_segments(),
            output_dir: default_output_dir(),
        }
    }
}

impl BufferConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No buffer config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;

        tracing::debug!("Loaded buffer config from {:?}: {:?}", path, config);
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Copy of this config with new pre/post durations
    pub fn with_durations(&self, pre_buffer: Duration, post_buffer: Duration) -> Self {
        Self {
            pre_buffer_ms: saturating_millis(pre_buffer),
            post_buffer_ms: saturating_millis(post_buffer),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("preBufferMs", self.pre_buffer_ms),
            ("postBufferMs", self.post_buffer_ms),
            ("segmentMs", self.segment_ms),
        ];
        for (name, value) in required {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
            if value > MAX_DURATION_MS {
                return Err(ConfigError::Invalid(format!(
                    "{} must be at most {}ms",
                    name, MAX_DURATION_MS
                )));
            }
        }

        if let PostBufferStrategy::Segmented { segment_ms: 0 } = self.post_buffer_strategy {
            return Err(ConfigError::Invalid(
                "postBufferStrategy.segmented.segmentMs must be greater than zero".to_string(),
            ));
        }
        if self.max_post_segments == 0 {
            return Err(ConfigError::Invalid(
                "maxPostSegments must be greater than zero".to_string(),
            ));
        }
        if self.degraded_threshold == 0 {
            return Err(ConfigError::Invalid(
                "degradedThreshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pre_buffer(&self) -> Duration {
        Duration::from_millis(self.pre_buffer_ms)
    }

    pub fn post_buffer(&self) -> Duration {
        Duration::from_millis(self.post_buffer_ms)
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_ms)
    }

    pub fn grace_margin(&self) -> Duration {
        Duration::from_millis(self.grace_margin_ms)
    }

    pub fn early_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.early_stop_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Hard limit for the whole post-buffer phase
    pub fn post_buffer_deadline(&self) -> Duration {
        self.post_buffer() + self.grace_margin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = BufferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pre_buffer(), Duration::from_secs(9));
        assert_eq!(config.post_buffer_deadline(), Duration::from_secs(7));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "preBufferMs": 30000,
            "postBufferStrategy": { "segmented": { "segmentMs": 2000 } }
        }"#;
        let config: BufferConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.pre_buffer_ms, 30_000);
        assert_eq!(config.segment_ms, 3_000);
        assert_eq!(
            config.post_buffer_strategy,
            PostBufferStrategy::Segmented { segment_ms: 2_000 }
        );
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let config = BufferConfig {
            segment_ms: 0,
            ..BufferConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = BufferConfig {
            post_buffer_strategy: PostBufferStrategy::Segmented { segment_ms: 0 },
            ..BufferConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_saturate_and_are_rejected() {
        let config = BufferConfig::default().with_durations(Duration::MAX, Duration::from_secs(5));
        assert_eq!(config.pre_buffer_ms, u64::MAX);
        assert_eq!(config.post_buffer_ms, 5000);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = BufferConfig::default()
            .with_durations(Duration::from_millis(MAX_DURATION_MS), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = BufferConfig::load(&dir.path().join("missing.json")).unwrap();
        assert_eq!(config, BufferConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config").join("buffer.json");
        let config = BufferConfig::default()
            .with_durations(Duration::from_secs(20), Duration::from_secs(10));

        config.save(&path).unwrap();
        let loaded = BufferConfig::load(&path).unwrap();

        assert_eq!(loaded.pre_buffer_ms, 20_000);
        assert_eq!(loaded.post_buffer_ms, 10_000);
    }
}
