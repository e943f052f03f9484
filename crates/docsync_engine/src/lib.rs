//! # docsync Engine
//!
//! Replicator state machine for docsync.
//!
//! This crate provides:
//! - The replicator: start/stop, status and per-document events
//! - Exponential backoff with a retry budget for one-shot replications
//! - Reachability monitoring that retries a stalled continuous replication
//!   as soon as the network comes back
//! - Suspend/resume for hosts that background the application
//! - Throttled checkpoints stored in the local database
//! - Authenticators and the storage and replication-protocol capabilities
//!   the replicator drives
//!
//! ## Architecture
//!
//! ```text
//!   Replicator (handle) ──commands──▶ replicator task ──open/send/close──▶ TransportManager
//!                                        ▲   ▲   ▲
//!              transport events ─────────┘   │   └───── reachability / lifecycle
//!              local changes (Storage) ──────┘
//! ```
//!
//! The task owns the connection, the protocol session, the retry timer and
//! the reachability watch. Callers only see published status snapshots.
//!
//! ## Key Invariants
//!
//! - Activity reaches `Busy` only after the handshake succeeds
//! - The retry counter resets on every successful connection
//! - A checkpoint reset is consumed by the next connection attempt
//! - Only the final `Stopped` status carries an error; retries show as `Offline`
//! - Permanent failures are never retried

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod checkpoint;
mod config;
mod error;
mod lifecycle;
mod protocol;
mod reachability;
mod replicator;
mod status;
mod storage;

pub use auth::{
    Authenticator, BasicAuthenticator, CookieJar, SessionAuthenticator, TokenAuthenticator,
    DEFAULT_SESSION_COOKIE,
};
pub use docsync_revision::{RevisionHistory, RevisionId};
pub use docsync_transport::{CloseKind, CloseStatus, Connector, NetworkErrorKind};

pub use checkpoint::{checkpoint_id, Checkpoint};
pub use config::{
    ReplicatorConfig, ReplicatorType, RetryPolicy, DEFAULT_MAX_RETRY_WAIT,
    DEFAULT_ONE_SHOT_RETRIES,
};
pub use error::{
    classify, ErrorClass, ReplicatorError, ReplicatorResult, StorageError, StorageResult,
};
pub use lifecycle::{AppState, LifecycleSource, ManualLifecycle, NoopLifecycle};
pub use protocol::{
    ProtocolContext, ProtocolEvent, ProtocolFactory, ReplicationProtocol, SessionParams,
};
pub use reachability::{
    assess, InterfaceSource, NetInterface, Reachability, ReachabilityConfig, ReachabilityMonitor,
    ReachabilityWatch, StaticInterfaces, SystemInterfaces,
};
pub use replicator::{Replicator, ReplicatorBuilder};
pub use status::{Activity, DocumentReplication, ListenerToken, Progress, ReplicatorStatus};
pub use storage::{ChangeCallback, DocumentChange, MemoryStorage, Revision, Storage};
