use bytes::Bytes;

/// A message as stored in a segment and delivered to subscribers.
///
/// Encoded with protobuf inside each frame:
/// `offset = 1 (uint64)`, `key = 2 (bytes)`, `value = 3 (bytes)`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Message {
    /// Position within the topic, assigned by the broker on append.
    #[prost(uint64, tag = "1")]
    pub offset: u64,
    #[prost(bytes = "bytes", tag = "2")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub value: Bytes,
}

/// What a producer hands to `append`: key and value, no offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

impl Record {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Record with an empty key.
    pub fn value(value: impl Into<Bytes>) -> Self {
        Self::new(Bytes::new(), value)
    }

    pub(crate) fn into_message(self, offset: u64) -> Message {
        Message {
            offset,
            key: self.key,
            value: self.value,
        }
    }
}
