//! Replication protocol capability.
//!
//! Framing and the replication message exchange live outside this crate.
//! The replicator owns the connection and feeds the protocol through
//! [`ReplicationProtocol`]; the protocol answers by queueing frames and
//! events on a [`ProtocolContext`].

use crate::checkpoint::Checkpoint;
use crate::config::ReplicatorType;
use crate::status::{DocumentReplication, Progress};
use crate::storage::{DocumentChange, Storage};
use bytes::Bytes;
use docsync_transport::CloseStatus;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// What a protocol session is started with.
#[derive(Clone)]
pub struct SessionParams {
    /// URL the connection ended up at.
    pub url: Url,
    /// Sub-protocol selected by the server.
    pub protocol: Option<String>,
    /// Replication direction.
    pub replicator_type: ReplicatorType,
    /// Keep running after catching up.
    pub continuous: bool,
    /// Channel filter.
    pub channels: Vec<String>,
    /// Document ID filter.
    pub document_ids: Vec<String>,
    /// Keep-alive interval.
    pub heartbeat: Duration,
    /// Position to resume from.
    pub checkpoint: Checkpoint,
    /// Local database.
    pub storage: Arc<dyn Storage>,
}

/// Something a protocol session reports to the replicator.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Transferring.
    Busy,
    /// Caught up. A non-continuous replicator closes the connection.
    Idle,
    /// Progress changed.
    Progress(Progress),
    /// A document finished.
    DocumentEnded(DocumentReplication),
    /// The replication position advanced.
    Checkpoint(Checkpoint),
    /// The session wants the connection closed.
    Close(CloseStatus),
}

/// Collects what a protocol callback wants done.
#[derive(Debug, Default)]
pub struct ProtocolContext {
    frames: Vec<Bytes>,
    events: Vec<ProtocolEvent>,
}

impl ProtocolContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes for the connection.
    pub fn send(&mut self, frame: impl Into<Bytes>) {
        self.frames.push(frame.into());
    }

    /// Reports an event.
    pub fn emit(&mut self, event: ProtocolEvent) {
        self.events.push(event);
    }

    /// Returns the queued frames.
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// Returns the reported events.
    pub fn events(&self) -> &[ProtocolEvent] {
        &self.events
    }

    pub(crate) fn take(&mut self) -> (Vec<Bytes>, Vec<ProtocolEvent>) {
        (std::mem::take(&mut self.frames), std::mem::take(&mut self.events))
    }
}

/// One replication session over one connection.
pub trait ReplicationProtocol: Send {
    /// The connection opened.
    fn on_open(&mut self, ctx: &mut ProtocolContext);

    /// Bytes arrived. They are acknowledged to the transport on return.
    fn on_data(&mut self, ctx: &mut ProtocolContext, data: &[u8]);

    /// A queued frame of `bytes` bytes was written.
    fn on_write_completed(&mut self, ctx: &mut ProtocolContext, bytes: usize) {
        let _ = (ctx, bytes);
    }

    /// Local documents changed.
    fn on_local_change(&mut self, ctx: &mut ProtocolContext, changes: &[DocumentChange]) {
        let _ = (ctx, changes);
    }

    /// The connection closed. No further calls follow.
    fn on_close(&mut self, status: &CloseStatus) {
        let _ = status;
    }
}

/// Creates a protocol session per connection.
pub trait ProtocolFactory: Send + Sync {
    /// Sub-protocols offered in the upgrade request.
    fn protocols(&self) -> Vec<String> {
        Vec::new()
    }

    /// Starts a session.
    fn create(&self, params: SessionParams) -> Box<dyn ReplicationProtocol>;
}
