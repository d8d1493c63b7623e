//! Error hierarchy for the mirror client.
//!
//! Split by layer: [`StoreError`] for outcomes of remote CRUD/watch calls,
//! [`WatchError`] for the watch subsystem, [`RegistryError`] for type-pattern
//! registration. Only `StoreError::ConnectionFailed` is ever retried, and only
//! inside the connection layer.

use std::fmt;
use std::sync::Arc;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Outcomes of networked CRUD and watch calls
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Watch subsystem failures, all terminal for their watcher
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Type-pattern registration failures
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Configuration loading/validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `Connection::close` while watched trees remain registered
    #[error("connection closed with {0} tree(s) still open")]
    OpenTrees(usize),

    /// Unrecoverable failures
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key already exists: {0}")]
    KeyAlreadyExists(String),

    /// Compare-and-swap/delete guard mismatch. Never retried here; CAS loops
    /// are the caller's responsibility.
    #[error("precondition failed on {key}: {reason}")]
    PreconditionFailed { key: String, reason: String },

    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// Transient transport failure, retried up to the configured bound.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The remote delivered an event at or below the last consumed index.
    /// Fatal protocol violation; the watcher stops rather than guess.
    #[error("watch event out of sequence: last read {last_read}, got {index}")]
    OutOfSequence { last_read: u64, index: u64 },

    /// Raised to every current and future `sync()` caller once the watcher
    /// has stopped, wrapping the original cause.
    #[error("watch stopped: {reason}")]
    Stopped { reason: StopReason },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("type already registered at {pattern}")]
    DuplicateRegistration { pattern: String },

    #[error("empty segment in pattern {pattern:?}")]
    EmptySegment { pattern: String },
}

/// Terminal outcome of a watcher.
#[derive(Debug, Clone)]
pub enum StopReason {
    /// Stopped by an explicit `close()`.
    Closed,
    /// Stopped by a failure; the cause is shared with every waiter.
    Failed(Arc<Error>),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Closed => write!(f, "closed"),
            StopReason::Failed(cause) => write!(f, "{cause}"),
        }
    }
}

impl Error {
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Error::Store(StoreError::KeyNotFound(_)))
    }

    pub fn is_key_already_exists(&self) -> bool {
        matches!(self, Error::Store(StoreError::KeyAlreadyExists(_)))
    }

    pub fn is_connection_failed(&self) -> bool {
        matches!(self, Error::Store(StoreError::ConnectionFailed(_)))
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Error::Store(StoreError::PreconditionFailed { .. }))
    }
}
