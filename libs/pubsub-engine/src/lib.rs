//! Persistent log storage and streaming delivery for the pub/sub broker.
//!
//! Each topic is a directory of append-only segment files holding
//! checksummed frames. [`Broker::append`] writes a batch and wakes all
//! tailers of that topic; [`Broker::stream_from`] replays from an offset
//! and then keeps following the topic until cancelled.

pub mod broker;
pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod reader;
pub mod roll;
pub mod segment;
pub mod segment_set;
pub mod topic;

pub use broker::{validate_topic_name, Broker};
pub use config::{BrokerConfig, SegmentConfig};
pub use error::{BrokerError, ErrorKind, Result};
pub use message::{Message, Record};
pub use reader::{ReaderState, TailingReader};
pub use roll::{NeverRoll, RollPolicy, SizeAgePolicy};
pub use topic::Topic;
