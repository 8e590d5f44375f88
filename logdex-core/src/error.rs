//! The four error categories the host can observe.
//!
//! A `heed::Error` never maps to `Deadlock`/`LockTimeout`: LMDB has no
//! such variants. Those two categories are produced exclusively by the
//! lock-acquisition layer in [`crate::txn`].

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// This caller was selected as deadlock victim; the transaction is
    /// effectively aborted. Retry the whole transaction from its root `begin`.
    #[error("deadlock detected, transaction aborted")]
    Deadlock,

    /// A lock was not granted within the configured `lock_timeout`.
    #[error("lock not granted within {0:?}")]
    LockTimeout(std::time::Duration),

    /// Write-collision on a document identifier. Non-retryable.
    #[error("document {0} already exists in this segment")]
    DocExists(u64),

    /// Any other structural, I/O, or programming failure.
    #[error("{message}")]
    Error {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Error { message: message.into(), source: None }
    }

    pub fn wrap(message: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Error { message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Deadlock | Error::LockTimeout(_))
    }
}

impl From<heed::Error> for Error {
    fn from(source: heed::Error) -> Self {
        Error::wrap("storage engine error", source)
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::wrap("i/o error", source)
    }
}
