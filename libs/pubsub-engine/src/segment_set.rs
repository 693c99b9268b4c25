use std::path::Path;

use crate::error::{BrokerError, Result};
use crate::segment::Segment;

/// A topic's segments ordered by `offset_begin`. Only the last one is open
/// for appends; all earlier ones are sealed.
#[derive(Debug, Clone, Default)]
pub struct SegmentSet {
    segments: Vec<Segment>,
}

impl SegmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists `topic_dir`, keeps files with the segment extension and sorts
    /// them by the offset in their name.
    ///
    /// Only duplicate start offsets are rejected here. A gap between two
    /// segments surfaces as `CorruptFrame` when a reader crosses it.
    pub async fn discover(topic_dir: &Path) -> Result<Self> {
        let mut entries = tokio::fs::read_dir(topic_dir)
            .await
            .map_err(BrokerError::io(format!("read dir {}", topic_dir.display())))?;

        let mut segments = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(BrokerError::io(format!("read dir {}", topic_dir.display())))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(BrokerError::io(format!("stat {}", entry.path().display())))?;
            if !file_type.is_file() {
                continue;
            }
            match Segment::from_path(entry.path()) {
                Some(segment) => segments.push(segment),
                None => {
                    tracing::debug!(path = %entry.path().display(), "ignoring non-segment file");
                }
            }
        }

        segments.sort_by_key(Segment::offset_begin);
        if let Some(pair) = segments
            .windows(2)
            .find(|w| w[0].offset_begin() == w[1].offset_begin())
        {
            return Err(BrokerError::CorruptFrame(format!(
                "segments {} and {} both start at offset {}",
                pair[0].path().display(),
                pair[1].path().display(),
                pair[0].offset_begin()
            )));
        }

        Ok(Self { segments })
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn first(&self) -> Option<&Segment> {
        self.segments.first()
    }

    /// The active segment.
    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// The last segment with `offset_begin <= offset`, or the first segment
    /// when `offset` precedes all of them. `None` only for an empty set.
    pub fn locate(&self, offset: u64) -> Option<&Segment> {
        let idx = self
            .segments
            .partition_point(|s| s.offset_begin() <= offset);
        match idx {
            0 => self.segments.first(),
            n => self.segments.get(n - 1),
        }
    }

    /// The segment right after the one starting at `offset_begin`.
    pub fn next_after(&self, offset_begin: u64) -> Option<&Segment> {
        let idx = self
            .segments
            .partition_point(|s| s.offset_begin() <= offset_begin);
        self.segments.get(idx)
    }

    /// Adds a new active segment. It must start after the current one.
    pub fn push(&mut self, segment: Segment) -> Result<()> {
        if let Some(last) = self.segments.last() {
            if segment.offset_begin() <= last.offset_begin() {
                return Err(BrokerError::InvalidArgument(format!(
                    "segment at offset {} does not follow active segment at {}",
                    segment.offset_begin(),
                    last.offset_begin()
                )));
            }
        }
        self.segments.push(segment);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use tempfile::TempDir;

    fn set_of(begins: &[u64]) -> SegmentSet {
        let mut set = SegmentSet::new();
        for &b in begins {
            set.push(Segment::in_dir(&PathBuf::from("/t"), b)).unwrap();
        }
        set
    }

    #[test]
    fn locate_picks_last_segment_not_after_offset() {
        let set = set_of(&[0, 100, 250]);
        assert_eq!(set.locate(0).unwrap().offset_begin(), 0);
        assert_eq!(set.locate(99).unwrap().offset_begin(), 0);
        assert_eq!(set.locate(100).unwrap().offset_begin(), 100);
        assert_eq!(set.locate(249).unwrap().offset_begin(), 100);
        assert_eq!(set.locate(250).unwrap().offset_begin(), 250);
        assert_eq!(set.locate(u64::MAX).unwrap().offset_begin(), 250);
    }

    #[test]
    fn locate_before_earliest_falls_back_to_first() {
        let set = set_of(&[50, 80]);
        assert_eq!(set.locate(10).unwrap().offset_begin(), 50);
        assert!(SegmentSet::new().locate(0).is_none());
    }

    #[test]
    fn next_after_walks_forward() {
        let set = set_of(&[0, 100, 250]);
        assert_eq!(set.next_after(0).unwrap().offset_begin(), 100);
        assert_eq!(set.next_after(100).unwrap().offset_begin(), 250);
        assert!(set.next_after(250).is_none());
    }

    #[test]
    fn push_rejects_out_of_order_segment() {
        let mut set = set_of(&[0, 100]);
        assert!(set.push(Segment::in_dir(&PathBuf::from("/t"), 100)).is_err());
        assert!(set.push(Segment::in_dir(&PathBuf::from("/t"), 50)).is_err());
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn discover_sorts_and_ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        for name in [
            "000000000300.pubsub",
            "000000000000.pubsub",
            "000000000120.pubsub",
            "notes.txt",
            "000000000500.log",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("000000000900.pubsub")).unwrap();

        let set = SegmentSet::discover(dir.path()).await.unwrap();
        let begins: Vec<u64> = set.iter().map(Segment::offset_begin).collect();
        assert_eq!(begins, vec![0, 120, 300]);
        assert_eq!(set.last().unwrap().path(), dir.path().join("000000000300.pubsub"));
    }

    #[tokio::test]
    async fn discover_rejects_duplicate_start_offsets() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("000000000007.pubsub"), b"").unwrap();
        std::fs::write(dir.path().join("0000000000007.pubsub"), b"").unwrap();

        let err = SegmentSet::discover(dir.path()).await.unwrap_err();
        assert!(matches!(err, BrokerError::CorruptFrame(_)));
    }

    #[tokio::test]
    async fn discover_missing_dir_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = SegmentSet::discover(&dir.path().join("missing")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }
}
