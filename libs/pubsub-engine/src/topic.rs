use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::message::Record;
use crate::reader::TailingReader;
use crate::roll::{RollPolicy, SizeAgePolicy};
use crate::segment::{Segment, SegmentWriter};
use crate::segment_set::SegmentSet;

/// Per-topic settings handed down by the broker.
#[derive(Debug, Clone)]
pub struct TopicOptions {
    pub fsync: bool,
    pub notify_capacity: usize,
    pub roll_policy: Arc<dyn RollPolicy>,
}

impl TopicOptions {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            fsync: config.fsync,
            notify_capacity: config.notify_capacity,
            roll_policy: Arc::new(SizeAgePolicy::from_config(&config.segment)),
        }
    }
}

/// Committed byte length of the active segment.
#[derive(Debug, Clone, Copy, Default)]
struct CommitMark {
    segment_begin: u64,
    len: u64,
}

/// A named, independently ordered message stream backed by segment files.
///
/// Appends are serialized by the writer mutex. Readers never take it: they
/// read flushed bytes straight from the files and wait on the notification
/// channel when they run out.
pub struct Topic {
    name: String,
    dir: PathBuf,
    segments: RwLock<SegmentSet>,
    /// Active segment; `None` until the first segment is created.
    writer: Mutex<Option<SegmentWriter>>,
    /// Offset the next appended message will get. Only advanced after flush.
    next_offset: AtomicU64,
    /// Readers never read the active segment past this mark.
    commit: RwLock<CommitMark>,
    /// Notification channel: unit signal after every committed batch.
    notify_tx: broadcast::Sender<()>,
    fsync: bool,
    roll_policy: Arc<dyn RollPolicy>,
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("next_offset", &self.next_offset())
            .finish()
    }
}

impl Topic {
    /// A topic with no segments yet. Nothing touches the disk until the
    /// first append.
    pub fn new(name: String, dir: PathBuf, options: TopicOptions) -> Self {
        let (notify_tx, _) = broadcast::channel(options.notify_capacity);
        Self {
            name,
            dir,
            segments: RwLock::new(SegmentSet::new()),
            writer: Mutex::new(None),
            next_offset: AtomicU64::new(0),
            commit: RwLock::new(CommitMark::default()),
            notify_tx,
            fsync: options.fsync,
            roll_policy: options.roll_policy,
        }
    }

    /// Reopens a topic from its directory: discovers segments, repairs the
    /// tail of the active one and resumes appending after its last frame.
    pub async fn open(name: String, dir: PathBuf, options: TopicOptions) -> Result<Self> {
        let segments = SegmentSet::discover(&dir).await?;
        let fsync = options.fsync;
        let topic = Self::new(name, dir, options);

        let Some(active) = segments.last().cloned() else {
            tracing::info!(topic = %topic.name, "found topic without segments");
            return Ok(topic);
        };

        let tail = active.recover().await?;
        let writer = active.open_for_append(&tail, fsync).await?;
        let next_offset = active.offset_begin() + tail.records;
        tracing::info!(
            topic = %topic.name,
            segments = segments.len(),
            next_offset,
            "opened topic"
        );

        *topic.segments_write() = segments;
        topic.mark_committed(&writer);
        *topic.writer.lock().await = Some(writer);
        topic.next_offset.store(next_offset, Ordering::Release);
        Ok(topic)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset the next appended message will get; everything below it is
    /// flushed and readable.
    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire)
    }

    /// Snapshot of the segment set.
    pub fn segments(&self) -> SegmentSet {
        self.segments_read().clone()
    }

    pub(crate) fn locate(&self, offset: u64) -> Option<Segment> {
        self.segments_read().locate(offset).cloned()
    }

    pub(crate) fn segment_after(&self, offset_begin: u64) -> Option<Segment> {
        self.segments_read().next_after(offset_begin).cloned()
    }

    /// How many bytes of the segment starting at `offset_begin` belong to
    /// committed batches. Segments before the active one are sealed and
    /// fully readable; one created for a batch still in flight has none.
    pub(crate) fn readable_len(&self, offset_begin: u64) -> u64 {
        let mark = *self.commit_read();
        match offset_begin.cmp(&mark.segment_begin) {
            std::cmp::Ordering::Less => u64::MAX,
            std::cmp::Ordering::Equal => mark.len,
            std::cmp::Ordering::Greater => 0,
        }
    }

    /// Registers a listener woken after every committed append. Wake-ups are
    /// hints; a lagged receiver just means "look again".
    pub fn listen(&self) -> broadcast::Receiver<()> {
        self.notify_tx.subscribe()
    }

    /// Appends `records` in order as one batch and returns the offsets they
    /// were assigned.
    ///
    /// Each message is one frame write; the batch is flushed once and only
    /// then are listeners notified. On failure the active segment is cut
    /// back to its last flushed length and no offsets are consumed.
    pub async fn append(&self, records: Vec<Record>) -> Result<Range<u64>> {
        let mut guard = self.writer.lock().await;
        let first = self.next_offset();
        if records.is_empty() {
            return Ok(first..first);
        }

        let writer = self.active_writer(&mut *guard).await?;
        let mut next = first;
        for record in records {
            let message = record.into_message(next);
            if let Err(e) = writer.append(&message).await {
                self.abort_batch(writer).await;
                return Err(e.with_context(format!("topic '{}'", self.name)));
            }
            next += 1;
        }
        if let Err(e) = writer.flush().await {
            self.abort_batch(writer).await;
            return Err(e.with_context(format!("topic '{}'", self.name)));
        }

        self.mark_committed(writer);
        self.next_offset.store(next, Ordering::Release);
        drop(guard);

        // Ignore if no listeners.
        let _ = self.notify_tx.send(());
        tracing::debug!(topic = %self.name, first, next, "appended batch");
        Ok(first..next)
    }

    /// Creates the topic directory and first segment if they do not exist.
    pub async fn ensure_segment(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let writer = self.start_segment(self.next_offset()).await?;
            *guard = Some(writer);
        }
        Ok(())
    }

    /// Tailing reader starting at `offset`; see [`TailingReader`].
    pub fn read_from(self: &Arc<Self>, offset: u64, cancel: CancellationToken) -> TailingReader {
        TailingReader::new(Arc::clone(self), offset, cancel)
    }

    /// The segment this batch goes to, creating the first one or rolling
    /// over when the policy says so. A failed roll keeps the old writer.
    async fn active_writer<'a>(
        &self,
        slot: &'a mut Option<SegmentWriter>,
    ) -> Result<&'a mut SegmentWriter> {
        let roll = match slot.as_ref() {
            Some(active) => self.roll_policy.should_roll(&active.stats()),
            None => true,
        };
        let writer = match slot.take() {
            Some(active) if !roll => active,
            sealed => match self.start_segment(self.next_offset()).await {
                Ok(writer) => {
                    if let Some(sealed) = sealed {
                        let stats = sealed.stats();
                        tracing::info!(
                            topic = %self.name,
                            offset_begin = stats.offset_begin,
                            records = stats.records,
                            bytes = stats.bytes,
                            "sealed segment"
                        );
                    }
                    writer
                }
                Err(e) => {
                    *slot = sealed;
                    return Err(e);
                }
            },
        };
        Ok(slot.insert(writer))
    }

    async fn start_segment(&self, offset_begin: u64) -> Result<SegmentWriter> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(BrokerError::io(format!("mkdir {}", self.dir.display())))?;
        let segment = Segment::in_dir(&self.dir, offset_begin);
        let writer = segment.create(self.fsync).await?;
        self.segments_write().push(segment.clone())?;
        tracing::info!(
            topic = %self.name,
            path = %segment.path().display(),
            offset_begin,
            "created segment"
        );
        Ok(writer)
    }

    async fn abort_batch(&self, writer: &mut SegmentWriter) {
        if let Err(e) = writer.rollback().await {
            tracing::warn!(
                topic = %self.name,
                path = %writer.segment().path().display(),
                error = %e,
                "rollback of failed batch failed, segment may end in a torn frame"
            );
        } else {
            tracing::warn!(topic = %self.name, "rolled back failed batch");
        }
    }

    fn mark_committed(&self, writer: &SegmentWriter) {
        let stats = writer.stats();
        *self.commit_write() = CommitMark {
            segment_begin: stats.offset_begin,
            len: stats.bytes,
        };
    }

    fn segments_read(&self) -> RwLockReadGuard<'_, SegmentSet> {
        match self.segments.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(topic = %self.name, "segment set read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn segments_write(&self) -> RwLockWriteGuard<'_, SegmentSet> {
        match self.segments.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(topic = %self.name, "segment set write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn commit_read(&self) -> RwLockReadGuard<'_, CommitMark> {
        self.commit.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn commit_write(&self) -> RwLockWriteGuard<'_, CommitMark> {
        self.commit.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
