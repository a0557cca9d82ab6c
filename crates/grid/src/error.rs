use thiserror::Error;

/// Errors that can occur in overlay networking operations.
///
/// Policy rejections (blocked address, duplicate peer, self-connection) are
/// not errors; they are reported through [`crate::registry::Admission`].
#[derive(Error, Debug)]
pub enum GridError {
    /// Payload text could not be encoded or decoded for its packet kind
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Wire protocol violation or unexpected packet
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to establish connection to peer
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer discovery mechanism failed
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Startup prerequisite missing (for example local addresses not loaded)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Routine name is not registered with the scheduler
    #[error("unknown routine: {0}")]
    UnknownRoutine(String),

    /// Framed packet would exceed the wire size limit
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Operation timed out waiting for the remote side
    #[error("timeout")]
    Timeout,

    /// Communication channel was closed
    #[error("channel closed")]
    ChannelClosed,

    /// Content store failure
    #[error("store error: {0}")]
    Store(#[from] weave_storage::StoreError),

    /// I/O operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for GridError {
    fn from(e: serde_json::Error) -> Self {
        GridError::Serialization(e.to_string())
    }
}

/// Convenience Result type for grid operations
pub type Result<T> = std::result::Result<T, GridError>;
