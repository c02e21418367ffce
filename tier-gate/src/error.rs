use std::time::Duration;

/// Failures talking to the shared store.
///
/// These are the only operator-visible failures on the request path; each
/// component decides what to do with them according to its [`crate::FailPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or dropped the connection.
    #[error("shared store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured bound.
    #[error("shared store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something we could not interpret.
    #[error("unexpected reply from shared store: {0}")]
    Protocol(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// Errors produced by [`crate::TaskQueue`].
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue already holds `max_depth` items.
    #[error("queue {queue} is full ({depth} items)")]
    Full { queue: String, depth: u64 },

    /// The item could not be handed to the store.
    #[error("enqueue failed: {0}")]
    EnqueueFailed(#[source] StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("queue payload could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),

    /// The item exceeded its retry ceiling and now sits on the dead-letter queue.
    #[error("item {id} dead-lettered after {attempts} attempts")]
    DeadLettered { id: String, attempts: u32 },

    /// The visibility timeout elapsed before the consumer settled the item.
    #[error("lease on item {id} expired before it was settled")]
    LeaseExpired { id: String },
}

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while assembling a [`crate::Gate`].
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
