//! Replicator status, document events and listener registration.

use crate::error::ReplicatorError;
use docsync_revision::RevisionId;
use parking_lot::Mutex;
use std::sync::Arc;

/// What the replicator is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activity {
    /// Not running.
    Stopped,
    /// Waiting to retry, or suspended.
    Offline,
    /// Opening a connection.
    Connecting,
    /// Connected and caught up.
    Idle,
    /// Connected and transferring.
    Busy,
}

impl Activity {
    /// Returns true unless stopped.
    pub fn is_running(self) -> bool {
        self != Activity::Stopped
    }
}

/// Replication progress. `completed` never exceeds `total` once the
/// protocol has reported both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Units done.
    pub completed: u64,
    /// Units known.
    pub total: u64,
}

impl Progress {
    /// Creates a progress value.
    pub fn new(completed: u64, total: u64) -> Self {
        Self { completed, total }
    }
}

/// Snapshot reported to status listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorStatus {
    /// Current activity.
    pub activity: Activity,
    /// Current progress.
    pub progress: Progress,
    /// Set only when the replicator stopped because of an error.
    pub error: Option<ReplicatorError>,
}

impl ReplicatorStatus {
    pub(crate) fn stopped() -> Self {
        Self {
            activity: Activity::Stopped,
            progress: Progress::default(),
            error: None,
        }
    }
}

/// A document finished replicating, successfully or not.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentReplication {
    /// Document ID.
    pub doc_id: String,
    /// Revision that was transferred, if known.
    pub rev_id: Option<RevisionId>,
    /// True if the document was pushed, false if pulled.
    pub is_push: bool,
    /// True if the revision is a deletion.
    pub is_deleted: bool,
    /// Set if the document failed.
    pub error: Option<ReplicatorError>,
}

impl DocumentReplication {
    /// A successfully pulled document.
    pub fn pulled(doc_id: impl Into<String>, rev_id: RevisionId) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: Some(rev_id),
            is_push: false,
            is_deleted: false,
            error: None,
        }
    }

    /// A successfully pushed document.
    pub fn pushed(doc_id: impl Into<String>, rev_id: RevisionId) -> Self {
        Self {
            is_push: true,
            ..Self::pulled(doc_id, rev_id)
        }
    }

    /// Marks the revision as a deletion.
    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }

    /// Attaches an error.
    pub fn with_error(mut self, error: ReplicatorError) -> Self {
        self.error = Some(error);
        self
    }

    /// Returns true for a pulled revision that conflicts with local history.
    pub fn is_pull_conflict(&self) -> bool {
        !self.is_push && self.error.as_ref().is_some_and(ReplicatorError::is_conflict)
    }
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

type StatusListener = Arc<dyn Fn(&ReplicatorStatus) + Send + Sync>;
type DocumentListener = Arc<dyn Fn(&DocumentReplication) + Send + Sync>;

/// Registered status and document listeners.
#[derive(Default)]
pub(crate) struct Listeners {
    inner: Mutex<ListenerLists>,
}

#[derive(Default)]
struct ListenerLists {
    next: u64,
    status: Vec<(ListenerToken, StatusListener)>,
    documents: Vec<(ListenerToken, DocumentListener)>,
}

impl ListenerLists {
    fn token(&mut self) -> ListenerToken {
        self.next += 1;
        ListenerToken(self.next)
    }
}

impl Listeners {
    pub(crate) fn add_status(&self, listener: StatusListener) -> ListenerToken {
        let mut lists = self.inner.lock();
        let token = lists.token();
        lists.status.push((token, listener));
        token
    }

    pub(crate) fn add_document(&self, listener: DocumentListener) -> ListenerToken {
        let mut lists = self.inner.lock();
        let token = lists.token();
        lists.documents.push((token, listener));
        token
    }

    pub(crate) fn remove(&self, token: ListenerToken) -> bool {
        let mut lists = self.inner.lock();
        let before = lists.status.len() + lists.documents.len();
        lists.status.retain(|(t, _)| *t != token);
        lists.documents.retain(|(t, _)| *t != token);
        before != lists.status.len() + lists.documents.len()
    }

    /// Listeners run without the lock held, so they may remove themselves.
    pub(crate) fn notify_status(&self, status: &ReplicatorStatus) {
        let listeners: Vec<_> = self.inner.lock().status.iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(status);
        }
    }

    pub(crate) fn notify_document(&self, document: &DocumentReplication) {
        let listeners: Vec<_> = self
            .inner
            .lock()
            .documents
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(document);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_register_and_remove() {
        let listeners = Listeners::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let token = listeners.add_status(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        listeners.notify_status(&ReplicatorStatus::stopped());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(listeners.remove(token));
        assert!(!listeners.remove(token));
        listeners.notify_status(&ReplicatorStatus::stopped());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pull_conflict_detection() {
        let rev = RevisionId::new(2, "abc");
        let conflict = ReplicatorError::Conflict {
            doc_id: "doc".into(),
        };

        let doc = DocumentReplication::pulled("doc", rev.clone()).with_error(conflict.clone());
        assert!(doc.is_pull_conflict());

        let pushed = DocumentReplication::pushed("doc", rev.clone()).with_error(conflict);
        assert!(!pushed.is_pull_conflict());

        let other = DocumentReplication::pulled("doc", rev)
            .with_error(ReplicatorError::Protocol("bad body".into()));
        assert!(!other.is_pull_conflict());
    }
}
