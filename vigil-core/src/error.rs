use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Broker channel closed: {0}")]
    ChannelClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LeaseError {
    /// Connectivity failures that a reconnect is expected to fix.
    pub fn is_transient(&self) -> bool {
        match self {
            LeaseError::Store(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            LeaseError::Broker(err) => {
                err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_timeout()
            }
            LeaseError::ChannelClosed(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LeaseError>;
