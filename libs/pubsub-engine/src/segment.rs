use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::BytesMut;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{BrokerError, Result};
use crate::frame::FrameCodec;
use crate::message::Message;

/// Extension of segment files; anything else in a topic directory is ignored.
pub const SEGMENT_EXTENSION: &str = "pubsub";

const OFFSET_DIGITS: usize = 12;
const READ_CHUNK: usize = 64 * 1024;

/// One append-only file holding a contiguous range of a topic's offsets,
/// starting at `offset_begin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    path: PathBuf,
    offset_begin: u64,
}

impl Segment {
    pub fn new(path: PathBuf, offset_begin: u64) -> Self {
        Self { path, offset_begin }
    }

    /// The segment that starts at `offset_begin` inside `topic_dir`.
    pub fn in_dir(topic_dir: &Path, offset_begin: u64) -> Self {
        Self::new(topic_dir.join(file_name(offset_begin)), offset_begin)
    }

    /// Builds a segment from an existing file, if its name is a segment name.
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let offset_begin = parse_file_name(name)?;
        Some(Self::new(path, offset_begin))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset_begin(&self) -> u64 {
        self.offset_begin
    }

    /// Creates the file (it must not exist yet) and opens it for append.
    pub async fn create(&self, fsync: bool) -> Result<SegmentWriter> {
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&self.path)
            .await
            .map_err(BrokerError::io(format!("create {}", self.path.display())))?;
        Ok(SegmentWriter::new(self.clone(), file, 0, 0, fsync))
    }

    /// Reopens an existing segment for append after `recover` told us where
    /// its valid data ends.
    pub async fn open_for_append(&self, tail: &RecoveredTail, fsync: bool) -> Result<SegmentWriter> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(BrokerError::io(format!("open {}", self.path.display())))?;
        Ok(SegmentWriter::new(
            self.clone(),
            file,
            tail.valid_len,
            tail.records,
            fsync,
        ))
    }

    /// Opens the segment for sequential decoding from byte 0.
    pub async fn open_for_read(&self) -> Result<SegmentReader> {
        let file = File::open(&self.path)
            .await
            .map_err(BrokerError::io(format!("open {}", self.path.display())))?;
        Ok(SegmentReader {
            segment: self.clone(),
            file,
            buf: BytesMut::new(),
            codec: FrameCodec,
            consumed: 0,
        })
    }

    /// Scans the whole segment and truncates a torn trailing frame.
    ///
    /// A checksum failure anywhere is returned as an error: only an
    /// incomplete tail is treated as an interrupted write.
    pub async fn recover(&self) -> Result<RecoveredTail> {
        let mut reader = self.open_for_read().await?;
        let mut records = 0u64;
        loop {
            match reader.next_frame()? {
                Some(_) => records += 1,
                None => {
                    if reader.fill().await? == 0 {
                        break;
                    }
                }
            }
        }

        let valid_len = reader.consumed();
        let leftover = reader.buffered();
        drop(reader);

        if leftover > 0 {
            tracing::warn!(
                path = %self.path.display(),
                valid_len,
                torn_bytes = leftover,
                "truncating torn frame at end of segment"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&self.path)
                .await
                .map_err(BrokerError::io(format!("open {}", self.path.display())))?;
            file.set_len(valid_len)
                .await
                .map_err(BrokerError::io(format!("truncate {}", self.path.display())))?;
            file.sync_all()
                .await
                .map_err(BrokerError::io(format!("sync {}", self.path.display())))?;
        }

        Ok(RecoveredTail { records, valid_len })
    }
}

/// `000000000042.pubsub`
pub fn file_name(offset_begin: u64) -> String {
    format!("{offset_begin:0width$}.{SEGMENT_EXTENSION}", width = OFFSET_DIGITS)
}

/// Start offset encoded in a segment file name, `None` for foreign files.
pub fn parse_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    if stem.len() < OFFSET_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Result of scanning the active segment at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredTail {
    /// Complete frames in the segment.
    pub records: u64,
    /// Byte length covered by those frames.
    pub valid_len: u64,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append handle of the active segment. Owned by exactly one topic.
#[derive(Debug)]
pub struct SegmentWriter {
    segment: Segment,
    file: File,
    codec: FrameCodec,
    scratch: BytesMut,
    /// Bytes handed to the file, flushed or not.
    len: u64,
    /// Bytes known to be flushed; rollback target.
    committed_len: u64,
    records: u64,
    committed_records: u64,
    opened_at: Instant,
    fsync: bool,
}

impl SegmentWriter {
    fn new(segment: Segment, file: File, len: u64, records: u64, fsync: bool) -> Self {
        Self {
            segment,
            file,
            codec: FrameCodec,
            scratch: BytesMut::new(),
            len,
            committed_len: len,
            records,
            committed_records: records,
            opened_at: Instant::now(),
            fsync,
        }
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Encodes `message` and writes its frame with a single write.
    pub async fn append(&mut self, message: &Message) -> Result<()> {
        self.scratch.clear();
        self.codec.encode(message, &mut self.scratch)?;
        self.file
            .write_all(&self.scratch)
            .await
            .map_err(BrokerError::io(format!("write {}", self.segment.path.display())))?;
        self.len += self.scratch.len() as u64;
        self.records += 1;
        Ok(())
    }

    /// Durability and visibility barrier: nothing appended before this call
    /// may be announced to readers until it returns.
    pub async fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(BrokerError::io(format!("flush {}", self.segment.path.display())))?;
        if self.fsync {
            self.file
                .sync_data()
                .await
                .map_err(BrokerError::io(format!("sync {}", self.segment.path.display())))?;
        }
        self.committed_len = self.len;
        self.committed_records = self.records;
        Ok(())
    }

    /// Drops everything written since the last successful flush.
    pub async fn rollback(&mut self) -> Result<()> {
        // Let any in-flight write land before cutting it off.
        let _ = self.file.flush().await;
        self.file
            .set_len(self.committed_len)
            .await
            .map_err(BrokerError::io(format!("truncate {}", self.segment.path.display())))?;
        self.len = self.committed_len;
        self.records = self.committed_records;
        Ok(())
    }

    pub fn stats(&self) -> ActiveSegmentStats {
        ActiveSegmentStats {
            offset_begin: self.segment.offset_begin,
            bytes: self.committed_len,
            records: self.committed_records,
            age: self.opened_at.elapsed(),
        }
    }
}

/// What a roll policy gets to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSegmentStats {
    pub offset_begin: u64,
    pub bytes: u64,
    pub records: u64,
    /// Time since this process opened the segment.
    pub age: std::time::Duration,
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Sequential frame reader over one segment file.
///
/// Never treats end of file as final: `fill` simply returns 0 when no new
/// bytes exist yet and picks them up on a later call.
#[derive(Debug)]
pub struct SegmentReader {
    segment: Segment,
    file: File,
    buf: BytesMut,
    codec: FrameCodec,
    /// Bytes of complete frames decoded so far.
    consumed: u64,
}

impl SegmentReader {
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Decodes the next buffered frame, `None` if the buffer holds no
    /// complete frame.
    pub fn next_frame(&mut self) -> Result<Option<Message>> {
        let before = self.buf.len();
        let message = self.codec.decode(&mut self.buf)?;
        self.consumed += (before - self.buf.len()) as u64;
        Ok(message)
    }

    /// Reads the next chunk of the file into the buffer. Returns the number
    /// of new bytes, 0 when nothing beyond the current end has been written.
    pub async fn fill(&mut self) -> Result<usize> {
        self.fill_to(u64::MAX).await
    }

    /// Like [`fill`](Self::fill), but never reads past byte `limit` of the
    /// file. Bytes beyond it may belong to a batch that gets rolled back.
    pub async fn fill_to(&mut self, limit: u64) -> Result<usize> {
        let read = self.consumed + self.buf.len() as u64;
        let room = limit.saturating_sub(read).min(READ_CHUNK as u64);
        if room == 0 {
            return Ok(0);
        }
        self.buf.reserve(room as usize);
        (&mut self.file)
            .take(room)
            .read_buf(&mut self.buf)
            .await
            .map_err(BrokerError::io(format!("read {}", self.segment.path.display())))
    }

    /// Asserts the segment ended on a frame boundary; call once it is known
    /// to be sealed and drained.
    pub fn finish(&mut self) -> Result<()> {
        match self.codec.decode_eof(&mut self.buf)? {
            None => Ok(()),
            Some(message) => Err(BrokerError::CorruptFrame(format!(
                "undelivered frame at offset {} while closing {}",
                message.offset,
                self.segment.path.display()
            ))),
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Bytes read from disk but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
