//! Error types for the replicator.

use docsync_revision::RevisionError;
use docsync_transport::{close_code, CloseKind, CloseStatus, NetworkErrorKind};
use std::io;
use thiserror::Error;

/// Result type for replicator operations.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// How the replicator reacts to a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff.
    Transient,
    /// Retried with backoff and when the network comes back.
    NetworkDependent,
    /// Never retried.
    Permanent,
}

/// Classifies the status a connection closed with.
///
/// Normal closures are classified as permanent; callers handle them before
/// asking.
pub fn classify(status: &CloseStatus) -> ErrorClass {
    match status.kind {
        CloseKind::Normal => ErrorClass::Permanent,
        CloseKind::Io(kind) => classify_io(kind),
        CloseKind::Network(kind) => match kind {
            NetworkErrorKind::DnsFailure
            | NetworkErrorKind::UnknownHost
            | NetworkErrorKind::HostUnreachable
            | NetworkErrorKind::NetworkDown => ErrorClass::NetworkDependent,
            NetworkErrorKind::Timeout => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        },
        CloseKind::Http(408 | 429 | 500 | 502 | 503 | 504) => ErrorClass::Transient,
        CloseKind::Http(_) => ErrorClass::Permanent,
        CloseKind::WebSocket(close_code::GOING_AWAY | close_code::ABNORMAL) => ErrorClass::Transient,
        CloseKind::WebSocket(_) => ErrorClass::Permanent,
    }
}

fn classify_io(kind: io::ErrorKind) -> ErrorClass {
    match kind {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::TimedOut
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ErrorClass::Transient,
        io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::NetworkDown => ErrorClass::NetworkDependent,
        _ => ErrorClass::Permanent,
    }
}

/// Errors reported by the replicator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicatorError {
    /// The connection closed abnormally.
    #[error("connection closed: {0}")]
    Closed(CloseStatus),

    /// The configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation requires a stopped replicator.
    #[error("replicator is not stopped")]
    NotStopped,

    /// The replicator task is gone.
    #[error("replicator task has shut down")]
    Shutdown,

    /// The remote revision conflicts with local history.
    #[error("document {doc_id:?} is in conflict")]
    Conflict {
        /// Document ID.
        doc_id: String,
    },

    /// The replication protocol failed.
    #[error("replication protocol error: {0}")]
    Protocol(String),

    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ReplicatorError {
    /// Returns the close status, if this error came from the connection.
    pub fn close_status(&self) -> Option<&CloseStatus> {
        match self {
            ReplicatorError::Closed(status) => Some(status),
            _ => None,
        }
    }

    /// Returns true if the error is retried with backoff.
    pub fn is_transient(&self) -> bool {
        self.close_status()
            .is_some_and(|status| classify(status) == ErrorClass::Transient)
    }

    /// Returns true if the error depends on network availability.
    pub fn is_network_dependent(&self) -> bool {
        self.close_status()
            .is_some_and(|status| classify(status) == ErrorClass::NetworkDependent)
    }

    /// Returns true for a document conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ReplicatorError::Conflict { .. } | ReplicatorError::Storage(StorageError::Conflict { .. })
        )
    }
}

/// Errors reported by a storage engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// No such document or revision.
    #[error("not found: {doc_id:?} {rev_id:?}")]
    NotFound {
        /// Document ID.
        doc_id: String,
        /// Revision ID, if one was requested.
        rev_id: Option<String>,
    },

    /// The write would create a conflict and conflicts were not allowed.
    #[error("revision {rev_id} of {doc_id:?} conflicts with the current revision")]
    Conflict {
        /// Document ID.
        doc_id: String,
        /// Rejected revision.
        rev_id: String,
    },

    /// Commit without a matching begin.
    #[error("no transaction in progress")]
    NoTransaction,

    /// Invalid revision data.
    #[error("revision error: {0}")]
    Revision(#[from] RevisionError),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}
