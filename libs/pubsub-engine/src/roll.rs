use std::time::Duration;

use crate::config::SegmentConfig;
use crate::segment::ActiveSegmentStats;

/// Decides when a topic closes its active segment and starts a new one.
///
/// Asked once at the start of every append batch; a batch never spans two
/// segments.
pub trait RollPolicy: Send + Sync + std::fmt::Debug {
    fn should_roll(&self, active: &ActiveSegmentStats) -> bool;
}

/// Roll on size or age, whichever is crossed first. Empty segments are
/// never rolled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeAgePolicy {
    pub max_bytes: Option<u64>,
    pub max_age: Option<Duration>,
}

impl SizeAgePolicy {
    pub fn from_config(config: &SegmentConfig) -> Self {
        Self {
            max_bytes: config.max_bytes,
            max_age: config.max_age(),
        }
    }
}

impl RollPolicy for SizeAgePolicy {
    fn should_roll(&self, active: &ActiveSegmentStats) -> bool {
        if active.records == 0 {
            return false;
        }
        self.max_bytes.is_some_and(|max| active.bytes >= max)
            || self.max_age.is_some_and(|max| active.age >= max)
    }
}

/// Single segment forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRoll;

impl RollPolicy for NeverRoll {
    fn should_roll(&self, _active: &ActiveSegmentStats) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(bytes: u64, records: u64, age_secs: u64) -> ActiveSegmentStats {
        ActiveSegmentStats {
            offset_begin: 0,
            bytes,
            records,
            age: Duration::from_secs(age_secs),
        }
    }

    #[test]
    fn size_threshold() {
        let policy = SizeAgePolicy {
            max_bytes: Some(100),
            max_age: None,
        };
        assert!(!policy.should_roll(&stats(99, 3, 1_000_000)));
        assert!(policy.should_roll(&stats(100, 3, 0)));
    }

    #[test]
    fn age_threshold() {
        let policy = SizeAgePolicy {
            max_bytes: None,
            max_age: Some(Duration::from_secs(60)),
        };
        assert!(!policy.should_roll(&stats(u64::MAX, 1, 59)));
        assert!(policy.should_roll(&stats(0, 1, 60)));
    }

    #[test]
    fn empty_segment_never_rolls() {
        let policy = SizeAgePolicy {
            max_bytes: Some(1),
            max_age: Some(Duration::ZERO),
        };
        assert!(!policy.should_roll(&stats(0, 0, 10)));
        assert!(!NeverRoll.should_roll(&stats(u64::MAX, u64::MAX, u64::MAX)));
    }

    #[test]
    fn from_config_defaults_to_one_gib() {
        let policy = SizeAgePolicy::from_config(&SegmentConfig::default());
        assert_eq!(policy.max_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(policy.max_age, None);
    }
}
