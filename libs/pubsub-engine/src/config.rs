use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::BrokerError;

/// Broker configuration, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Root directory: one subdirectory per topic.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// fsync the active segment after every flushed batch.
    #[serde(default = "default_fsync")]
    pub fsync: bool,

    /// Capacity of each topic's notification channel.
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,

    /// Segment rotation thresholds.
    #[serde(default)]
    pub segment: SegmentConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_fsync() -> bool {
    true
}

fn default_notify_capacity() -> usize {
    64
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
            notify_capacity: default_notify_capacity(),
            segment: SegmentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SegmentConfig {
    /// Roll once the active segment holds at least this many bytes.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: Option<u64>,

    /// Roll once the active segment has been open this long.
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

fn default_max_bytes() -> Option<u64> {
    Some(1024 * 1024 * 1024)
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            max_age_secs: None,
        }
    }
}

impl SegmentConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

impl BrokerConfig {
    /// Config rooted at `data_dir`, everything else default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, BrokerError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| BrokerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.notify_capacity == 0 {
            return Err(BrokerError::Config("notify_capacity must be > 0".into()));
        }
        if self.segment.max_bytes == Some(0) {
            return Err(BrokerError::Config("segment.max_bytes must be > 0".into()));
        }
        if self.segment.max_age_secs == Some(0) {
            return Err(BrokerError::Config("segment.max_age_secs must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = BrokerConfig::parse("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert!(config.fsync);
        assert_eq!(config.notify_capacity, 64);
        assert_eq!(config.segment, SegmentConfig::default());
    }

    #[test]
    fn parses_segment_table() {
        let config = BrokerConfig::parse(
            r#"
            data_dir = "/var/lib/pubsub"
            fsync = false

            [segment]
            max_bytes = 4096
            max_age_secs = 3600
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/pubsub"));
        assert!(!config.fsync);
        assert_eq!(config.segment.max_bytes, Some(4096));
        assert_eq!(config.segment.max_age(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn rejects_zero_thresholds() {
        let err = BrokerConfig::parse("[segment]\nmax_bytes = 0").unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
        let err = BrokerConfig::parse("notify_capacity = 0").unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }
}
