use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::error::{BrokerError, Result};
use crate::message::Message;
use crate::segment::{Segment, SegmentReader};
use crate::topic::Topic;

/// Where the reader stands relative to the data on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Bytes known to exist are being decoded.
    Replaying,
    /// Caught up; parked on the topic's notification channel.
    Waiting,
}

/// Open segment plus the offset of the next frame in it.
#[derive(Debug)]
struct Cursor {
    reader: SegmentReader,
    position: u64,
}

/// Per-subscriber cursor over a topic: replays what is on disk from the
/// requested offset, then keeps waiting for new appends instead of ending.
///
/// Frames before `start` are decoded and discarded. If `start` precedes the
/// earliest segment, delivery begins at that segment's first message.
/// Ends only on cancellation (`Ok(None)`) or on an I/O or corruption error.
pub struct TailingReader {
    topic: Arc<Topic>,
    start: u64,
    notify: broadcast::Receiver<()>,
    cancel: CancellationToken,
    cursor: Option<Cursor>,
    state: ReaderState,
    done: bool,
}

impl std::fmt::Debug for TailingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailingReader")
            .field("topic", &self.topic.name())
            .field("start", &self.start)
            .field("position", &self.position())
            .field("state", &self.state)
            .finish()
    }
}

enum Wake {
    Notified,
    Cancelled,
}

impl TailingReader {
    pub(crate) fn new(topic: Arc<Topic>, start: u64, cancel: CancellationToken) -> Self {
        // Listen before the first read so no append between "found nothing"
        // and "start waiting" goes unnoticed.
        let notify = topic.listen();
        Self {
            topic,
            start,
            notify,
            cancel,
            cursor: None,
            state: ReaderState::Replaying,
            done: false,
        }
    }

    pub fn topic(&self) -> &str {
        self.topic.name()
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Offset of the next frame the reader will decode, once a segment is open.
    pub fn position(&self) -> Option<u64> {
        self.cursor.as_ref().map(|c| c.position)
    }

    /// Next message at or after the start offset.
    ///
    /// Blocks while no further data exists. Returns `Ok(None)` once the
    /// cancellation token fires; the open segment file is released then.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        if self.done {
            return Ok(None);
        }
        match self.advance().await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(e.with_context(format!("topic '{}'", self.topic.name())))
            }
        }
    }

    /// Adapts the reader into a stream that ends on cancellation and yields
    /// at most one error.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Message>> + Send + 'static {
        async_stream::try_stream! {
            while let Some(message) = self.next().await? {
                yield message;
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<Message>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let Some(cursor) = self.cursor.as_mut() else {
                match self.topic.locate(self.start) {
                    Some(segment) => self.cursor = Some(Self::open(segment).await?),
                    // Topic exists but nothing was ever written.
                    None => {
                        if let Wake::Cancelled = self.wait().await {
                            return Ok(None);
                        }
                    }
                }
                continue;
            };

            // Frames at or past the committed offset may belong to a batch
            // that is still being written or is about to be rolled back;
            // `fill_to` below keeps their bytes out of the buffer too.
            if cursor.position >= self.topic.next_offset() {
                if let Wake::Cancelled = self.wait().await {
                    return Ok(None);
                }
                continue;
            }

            if let Some(message) = cursor.reader.next_frame()? {
                let position = cursor.position;
                cursor.position += 1;
                if position < self.start {
                    continue;
                }
                self.set_state(ReaderState::Replaying);
                return Ok(Some(message));
            }

            let begin = cursor.reader.segment().offset_begin();
            if cursor.reader.fill_to(self.topic.readable_len(begin)).await? > 0 {
                continue;
            }

            // No committed bytes beyond what we have. A later segment means
            // this one is sealed: drain it once more, then hand off.
            if let Some(next) = self.topic.segment_after(begin) {
                if cursor.reader.fill_to(self.topic.readable_len(begin)).await? > 0 {
                    continue;
                }
                cursor.reader.finish()?;
                if cursor.position != next.offset_begin() {
                    return Err(BrokerError::CorruptFrame(format!(
                        "segment at offset {begin} ends at {} but next segment starts at {}",
                        cursor.position,
                        next.offset_begin()
                    )));
                }
                tracing::debug!(
                    topic = %self.topic.name(),
                    from = begin,
                    to = next.offset_begin(),
                    "reader switching segment"
                );
                self.cursor = Some(Self::open(next).await?);
                continue;
            }

            if let Wake::Cancelled = self.wait().await {
                return Ok(None);
            }
        }
    }

    async fn open(segment: Segment) -> Result<Cursor> {
        let position = segment.offset_begin();
        let reader = segment.open_for_read().await?;
        Ok(Cursor { reader, position })
    }

    async fn wait(&mut self) -> Wake {
        self.set_state(ReaderState::Waiting);
        let wake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Cancelled,
            res = self.notify.recv() => match res {
                Ok(()) | Err(RecvError::Lagged(_)) => Wake::Notified,
                // Not reachable while the reader holds the topic.
                Err(RecvError::Closed) => Wake::Cancelled,
            },
        };
        if let Wake::Notified = wake {
            self.set_state(ReaderState::Replaying);
        }
        wake
    }

    fn set_state(&mut self, state: ReaderState) {
        if self.state != state {
            tracing::trace!(topic = %self.topic.name(), ?state, position = ?self.position(), "reader state");
            self.state = state;
        }
    }

    fn close(&mut self) {
        self.done = true;
        self.cursor = None;
        tracing::info!(topic = %self.topic.name(), start = self.start, "subscription closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::message::Record;
    use crate::roll::NeverRoll;
    use crate::topic::TopicOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    fn topic(dir: &TempDir) -> Arc<Topic> {
        let options = TopicOptions {
            fsync: false,
            notify_capacity: 4,
            roll_policy: Arc::new(NeverRoll),
        };
        Arc::new(Topic::new("t".into(), dir.path().join("t"), options))
    }

    #[tokio::test]
    async fn waits_on_empty_topic_then_delivers() {
        let dir = TempDir::new().unwrap();
        let topic = topic(&dir);
        let mut reader = topic.read_from(0, CancellationToken::new());

        let pending = tokio::time::timeout(Duration::from_millis(50), reader.next()).await;
        assert!(pending.is_err());
        assert_eq!(reader.state(), ReaderState::Waiting);

        topic.append(vec![Record::value("first")]).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.offset, 0);
        assert_eq!(msg.value, "first");
        assert_eq!(reader.state(), ReaderState::Replaying);
    }

    #[tokio::test]
    async fn cancellation_releases_file_and_ends() {
        let dir = TempDir::new().unwrap();
        let topic = topic(&dir);
        topic.append(vec![Record::value("a")]).await.unwrap();

        let token = CancellationToken::new();
        let mut reader = topic.read_from(0, token.clone());
        assert_eq!(reader.next().await.unwrap().unwrap().value, "a");
        assert_eq!(reader.position(), Some(1));

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };
        let end = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap();
        assert!(end.is_none());
        assert_eq!(reader.position(), None);
        canceller.await.unwrap();

        // Cancellation wins over data that arrives afterwards.
        topic.append(vec![Record::value("b")]).await.unwrap();
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lagged_listener_still_catches_up() {
        let dir = TempDir::new().unwrap();
        let topic = topic(&dir);
        let mut reader = topic.read_from(0, CancellationToken::new());

        // More notifications than the channel holds.
        for i in 0..10 {
            topic.append(vec![Record::value(format!("m{i}"))]).await.unwrap();
        }
        for i in 0..10u64 {
            let msg = tokio::time::timeout(Duration::from_secs(5), reader.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(msg.offset, i);
        }
    }

    #[tokio::test]
    async fn uncommitted_bytes_are_never_delivered() {
        let dir = TempDir::new().unwrap();
        let topic = topic(&dir);
        topic.append(vec![Record::value("a")]).await.unwrap();
        let path = topic.segments().first().unwrap().path().to_path_buf();
        let committed = std::fs::metadata(&path).unwrap().len();

        // A batch whose frame reached the file but was never flushed.
        let stale = frame::encode(&Record::value("STALE").into_message(1)).unwrap();
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut raw, &stale).unwrap();

        let mut reader = topic.read_from(0, CancellationToken::new());
        assert_eq!(reader.next().await.unwrap().unwrap().value, "a");

        // It fails and is cut off; the next batch reuses offset 1.
        raw.set_len(committed).unwrap();
        drop(raw);
        topic.append(vec![Record::value("fresh-value")]).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.offset, 1);
        assert_eq!(msg.value, "fresh-value");
    }
}
