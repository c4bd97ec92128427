//! Error types for outbound.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The backing store could not start a transaction. Transient: the
    /// dispatcher logs it and tries again on the next poll.
    #[error("queue store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("handler already registered for work type '{0}'")]
    AlreadyRegistered(String),

    #[error("all transports unavailable (last error: {last_error})")]
    AllTransportsUnavailable { last_error: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient errors are retried on a later poll; everything else is
    /// either a bug or a startup failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::Database(_) | Error::AllTransportsUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
