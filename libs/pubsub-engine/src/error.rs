/// Category of a broker error. Lets the transport layer pick a status code
/// and lets subscribers decide whether resubscribing makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Topic does not exist (subscribe only).
    NotFound,
    /// Checksum, length or marker mismatch while decoding a frame.
    CorruptFrame,
    /// Underlying filesystem error on open/read/write/flush.
    Io,
    /// Malformed request: bad topic name, oversized payload.
    InvalidArgument,
    /// Invalid configuration, fail at startup.
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => f.write_str("not_found"),
            ErrorKind::CorruptFrame => f.write_str("corrupt_frame"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::InvalidArgument => f.write_str("invalid_argument"),
            ErrorKind::Config => f.write_str("config"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for BrokerError {
    fn from(source: std::io::Error) -> Self {
        BrokerError::Io {
            context: "io".to_string(),
            source,
        }
    }
}

impl BrokerError {
    /// Build a `map_err` adapter that tags an I/O error with what was being done.
    ///
    /// ```ignore
    /// File::open(&path).await.map_err(BrokerError::io(format!("open {}", path.display())))?;
    /// ```
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> BrokerError {
        let context = context.into();
        move |source| BrokerError::Io { context, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::TopicNotFound(_) => ErrorKind::NotFound,
            BrokerError::CorruptFrame(_) => ErrorKind::CorruptFrame,
            BrokerError::Io { .. } => ErrorKind::Io,
            BrokerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BrokerError::Config(_) => ErrorKind::Config,
        }
    }

    /// Add context to the error.
    ///
    /// The topic name of `TopicNotFound` is kept as-is so callers can still
    /// report which topic was missing.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            BrokerError::CorruptFrame(msg) => BrokerError::CorruptFrame(format!("{ctx}: {msg}")),
            BrokerError::Io { context, source } => BrokerError::Io {
                context: format!("{ctx}: {context}"),
                source,
            },
            BrokerError::InvalidArgument(msg) => {
                BrokerError::InvalidArgument(format!("{ctx}: {msg}"))
            }
            BrokerError::Config(msg) => BrokerError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
