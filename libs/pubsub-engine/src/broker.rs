use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::message::Record;
use crate::reader::TailingReader;
use crate::roll::RollPolicy;
use crate::topic::{Topic, TopicOptions};

/// Longest topic name accepted, in bytes.
pub const MAX_TOPIC_NAME_LEN: usize = 255;

// ═══════════════════════════════════════════════════════════════
//  Broker
// ═══════════════════════════════════════════════════════════════

/// Registry of topics under one data directory.
///
/// Topics are created on first append (or explicitly) and never removed.
/// The registry lock only guards the map; appends and reads run on the
/// topic itself.
#[derive(Debug)]
pub struct Broker {
    data_dir: PathBuf,
    options: TopicOptions,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl Broker {
    /// Opens the data directory, creating it if needed, and restores every
    /// topic found in it. A topic that fails to open fails the whole call.
    pub async fn open(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let options = TopicOptions::from_config(&config);
        Self::open_with(config.data_dir, options).await
    }

    /// Like [`Broker::open`] with a custom roll policy.
    pub async fn open_with_roll_policy(
        config: BrokerConfig,
        roll_policy: Arc<dyn RollPolicy>,
    ) -> Result<Self> {
        config.validate()?;
        let options = TopicOptions {
            roll_policy,
            ..TopicOptions::from_config(&config)
        };
        Self::open_with(config.data_dir, options).await
    }

    async fn open_with(data_dir: PathBuf, options: TopicOptions) -> Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(BrokerError::io(format!("mkdir {}", data_dir.display())))?;

        let mut entries = tokio::fs::read_dir(&data_dir)
            .await
            .map_err(BrokerError::io(format!("read dir {}", data_dir.display())))?;

        let mut topics = HashMap::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(BrokerError::io(format!("read dir {}", data_dir.display())))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(BrokerError::io(format!("stat {}", entry.path().display())))?;
            if !file_type.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                tracing::warn!(path = %entry.path().display(), "skipping topic dir with non-UTF-8 name");
                continue;
            };
            if let Err(e) = validate_topic_name(&name) {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping dir that is not a valid topic name");
                continue;
            }

            let topic = Topic::open(name.clone(), entry.path(), options.clone())
                .await
                .map_err(|e| e.with_context(format!("open topic '{name}'")))?;
            topics.insert(name, Arc::new(topic));
        }

        tracing::info!(data_dir = %data_dir.display(), topics = topics.len(), "broker opened");
        Ok(Self {
            data_dir,
            options,
            topics: RwLock::new(topics),
        })
    }

    /// Appends a batch to `topic`, creating the topic if this is its first
    /// message. Returns the offsets assigned to the batch, in order.
    pub async fn append(&self, topic: &str, records: Vec<Record>) -> Result<Range<u64>> {
        validate_topic_name(topic)?;
        let topic = self.get_or_insert(topic);
        topic.append(records).await
    }

    /// Tailing reader over `topic` starting at `offset`.
    ///
    /// Fails with `TopicNotFound` if the topic does not exist and with
    /// `InvalidArgument` for a malformed name. Reading
    /// an existing topic that has no messages yet simply waits.
    pub fn stream_from(
        &self,
        topic: &str,
        offset: u64,
        cancel: CancellationToken,
    ) -> Result<TailingReader> {
        validate_topic_name(topic)?;
        let topic = self
            .topic(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        tracing::info!(topic = %topic.name(), offset, "subscription opened");
        Ok(topic.read_from(offset, cancel))
    }

    /// Creates `name` with an empty first segment unless it already exists.
    pub async fn create_topic(&self, name: &str) -> Result<Arc<Topic>> {
        validate_topic_name(name)?;
        let topic = self.get_or_insert(name);
        topic.ensure_segment().await?;
        Ok(topic)
    }

    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics_read().get(name).cloned()
    }

    /// Known topic names, sorted.
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics_read().keys().cloned().collect();
        names.sort();
        names
    }

    fn get_or_insert(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topic(name) {
            return topic;
        }
        let mut topics = self.topics_write();
        let topic = topics.entry(name.to_string()).or_insert_with(|| {
            tracing::info!(topic = %name, "created topic");
            Arc::new(Topic::new(
                name.to_string(),
                self.data_dir.join(name),
                self.options.clone(),
            ))
        });
        Arc::clone(topic)
    }

    fn topics_read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Topic>>> {
        match self.topics.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn topics_write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Topic>>> {
        match self.topics.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Topic names become directory names: ASCII letters, digits, `.`, `_`
/// and `-`, at most 255 bytes, and never `.` or `..`.
pub fn validate_topic_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BrokerError::InvalidArgument("topic name is empty".into()));
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return Err(BrokerError::InvalidArgument(format!(
            "topic name is {} bytes, max {MAX_TOPIC_NAME_LEN}",
            name.len()
        )));
    }
    if name == "." || name == ".." {
        return Err(BrokerError::InvalidArgument(format!("topic name '{name}' is reserved")));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(BrokerError::InvalidArgument(format!(
            "topic name '{name}' contains invalid character {c:?}"
        )));
    }
    Ok(())
}
