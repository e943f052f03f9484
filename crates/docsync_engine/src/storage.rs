//! Storage engine contract and an in-memory implementation.
//!
//! The replicator never reads documents itself: the replication protocol
//! does, through [`Storage`]. The replicator only uses the store for
//! checkpoints, change notifications and conflict resolution.

use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use docsync_revision::{RevisionHistory, RevisionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A stored document revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev_id: RevisionId,
    /// Parent revision, `None` for the first revision.
    pub parent: Option<RevisionId>,
    /// Canonical body bytes.
    pub body: Bytes,
    /// True for a deletion.
    pub deleted: bool,
    /// Local sequence assigned when stored.
    pub sequence: u64,
}

/// A local write that should be pushed.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// Document ID.
    pub doc_id: String,
    /// New revision.
    pub rev_id: RevisionId,
    /// Local sequence.
    pub sequence: u64,
    /// True for a deletion.
    pub deleted: bool,
}

/// Callback invoked with each committed batch of local changes.
pub type ChangeCallback = Arc<dyn Fn(&[DocumentChange]) + Send + Sync>;

/// Storage engine capability used by replication.
///
/// Methods are synchronous and may block. The replicator runs conflict
/// resolution on a blocking task.
pub trait Storage: Send + Sync {
    /// Unique, stable ID of the local database.
    fn uuid(&self) -> Uuid;

    /// Starts a transaction. Transactions nest.
    fn begin_transaction(&self) -> StorageResult<()>;

    /// Commits the innermost transaction.
    fn commit_transaction(&self) -> StorageResult<()>;

    /// Returns a revision, or the current revision when `rev_id` is `None`.
    fn get_revision(&self, doc_id: &str, rev_id: Option<&RevisionId>) -> StorageResult<Option<Revision>>;

    /// Stores a revision as a child of `parent`.
    ///
    /// Unless `allow_conflict` is set, `parent` must be the document's
    /// current revision (or `None` for a new or deleted document);
    /// otherwise [`StorageError::Conflict`] is returned. Returns the
    /// assigned sequence.
    fn put_revision(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
        parent: Option<&RevisionId>,
        body: Bytes,
        deleted: bool,
        allow_conflict: bool,
    ) -> StorageResult<u64>;

    /// Returns the history of `rev_id`, tip first.
    fn revision_history(&self, doc_id: &str, rev_id: &RevisionId) -> StorageResult<RevisionHistory>;

    /// Resolves a document with more than one live leaf revision.
    fn resolve_conflict(&self, doc_id: &str) -> StorageResult<()>;

    /// Registers a change callback, returning its ID.
    fn add_change_listener(&self, callback: ChangeCallback) -> u64;

    /// Unregisters a change callback.
    fn remove_change_listener(&self, id: u64);

    /// Reads a checkpoint record.
    fn get_checkpoint(&self, id: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Writes a checkpoint record; `None` deletes it.
    fn set_checkpoint(&self, id: &str, data: Option<&[u8]>) -> StorageResult<()>;
}

/// In-memory [`Storage`] for tests and examples.
///
/// Conflicts are resolved by keeping the highest leaf revision.
pub struct MemoryStorage {
    uuid: Uuid,
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    documents: HashMap<String, DocumentEntry>,
    checkpoints: HashMap<String, Vec<u8>>,
    sequence: u64,
    depth: usize,
    pending: Vec<DocumentChange>,
    listeners: Vec<(u64, ChangeCallback)>,
    next_listener: u64,
    resolved: Vec<String>,
}

impl MemoryInner {
    fn put(
        &mut self,
        doc_id: &str,
        rev_id: &RevisionId,
        parent: Option<&RevisionId>,
        body: Bytes,
        deleted: bool,
        allow_conflict: bool,
    ) -> StorageResult<u64> {
        let sequence = self.sequence + 1;
        let doc = self.documents.entry(doc_id.to_string()).or_default();
        if let Some(existing) = doc.revisions.get(rev_id) {
            return Ok(existing.sequence);
        }
        if let Some(parent) = parent {
            if !doc.revisions.contains_key(parent) && !allow_conflict {
                return Err(StorageError::NotFound {
                    doc_id: doc_id.to_string(),
                    rev_id: Some(parent.to_string()),
                });
            }
        }

        let extends_current = match (doc.current(), parent) {
            (None, _) => true,
            (Some(current), None) => current.deleted,
            (Some(current), Some(parent)) => current.rev_id == *parent,
        };
        if !extends_current && !allow_conflict {
            return Err(StorageError::Conflict {
                doc_id: doc_id.to_string(),
                rev_id: rev_id.to_string(),
            });
        }

        if let Some(parent) = parent {
            doc.leaves.retain(|leaf| leaf != parent);
        }
        doc.leaves.push(rev_id.clone());
        doc.revisions.insert(
            rev_id.clone(),
            Revision {
                doc_id: doc_id.to_string(),
                rev_id: rev_id.clone(),
                parent: parent.cloned(),
                body,
                deleted,
                sequence,
            },
        );
        self.sequence = sequence;
        self.pending.push(DocumentChange {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.clone(),
            sequence,
            deleted,
        });
        Ok(sequence)
    }
}

#[derive(Default)]
struct DocumentEntry {
    revisions: HashMap<RevisionId, Revision>,
    leaves: Vec<RevisionId>,
}

impl DocumentEntry {
    fn current(&self) -> Option<&Revision> {
        self.leaves
            .iter()
            .filter_map(|id| self.revisions.get(id))
            .max_by(|a, b| (!a.deleted, &a.rev_id).cmp(&(!b.deleted, &b.rev_id)))
    }
}

impl MemoryStorage {
    /// Creates an empty store with a random UUID.
    pub fn new() -> Self {
        Self::with_uuid(Uuid::new_v4())
    }

    /// Creates an empty store with a fixed UUID.
    pub fn with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Returns the live leaf revisions of a document, highest first.
    pub fn leaves(&self, doc_id: &str) -> Vec<RevisionId> {
        let inner = self.inner.lock();
        let mut leaves = inner
            .documents
            .get(doc_id)
            .map(|doc| doc.leaves.clone())
            .unwrap_or_default();
        leaves.sort_by(|a, b| b.cmp(a));
        leaves
    }

    /// Returns the documents passed to [`Storage::resolve_conflict`].
    pub fn resolved_conflicts(&self) -> Vec<String> {
        self.inner.lock().resolved.clone()
    }

    /// Returns the last assigned sequence.
    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().sequence
    }

    /// Creates or updates a document with a generated revision ID.
    pub fn save(&self, doc_id: &str, body: impl Into<Bytes>) -> StorageResult<RevisionId> {
        let body = body.into();
        let parent = self.get_revision(doc_id, None)?.map(|rev| rev.rev_id);
        let rev_id = RevisionId::digest(parent.as_ref(), false, &body);
        self.put_revision(doc_id, &rev_id, parent.as_ref(), body, false, false)?;
        Ok(rev_id)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn begin_transaction(&self) -> StorageResult<()> {
        self.inner.lock().depth += 1;
        Ok(())
    }

    fn commit_transaction(&self) -> StorageResult<()> {
        let (changes, listeners) = {
            let mut inner = self.inner.lock();
            if inner.depth == 0 {
                return Err(StorageError::NoTransaction);
            }
            inner.depth -= 1;
            if inner.depth > 0 || inner.pending.is_empty() {
                return Ok(());
            }
            let listeners: Vec<_> = inner.listeners.iter().map(|(_, l)| l.clone()).collect();
            (std::mem::take(&mut inner.pending), listeners)
        };
        for listener in listeners {
            listener(&changes);
        }
        Ok(())
    }

    fn get_revision(&self, doc_id: &str, rev_id: Option<&RevisionId>) -> StorageResult<Option<Revision>> {
        let inner = self.inner.lock();
        let Some(doc) = inner.documents.get(doc_id) else {
            return Ok(None);
        };
        Ok(match rev_id {
            Some(rev_id) => doc.revisions.get(rev_id).cloned(),
            None => doc.current().cloned(),
        })
    }

    fn put_revision(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
        parent: Option<&RevisionId>,
        body: Bytes,
        deleted: bool,
        allow_conflict: bool,
    ) -> StorageResult<u64> {
        self.begin_transaction()?;
        let result = self
            .inner
            .lock()
            .put(doc_id, rev_id, parent, body, deleted, allow_conflict);
        self.commit_transaction()?;
        result
    }

    fn revision_history(&self, doc_id: &str, rev_id: &RevisionId) -> StorageResult<RevisionHistory> {
        let inner = self.inner.lock();
        let not_found = || StorageError::NotFound {
            doc_id: doc_id.to_string(),
            rev_id: Some(rev_id.to_string()),
        };
        let doc = inner.documents.get(doc_id).ok_or_else(not_found)?;

        let mut ids = Vec::new();
        let mut next = Some(rev_id.clone());
        while let Some(id) = next {
            let rev = doc.revisions.get(&id).ok_or_else(not_found)?;
            next = rev.parent.clone();
            ids.push(id);
        }
        Ok(RevisionHistory::new(ids))
    }

    fn resolve_conflict(&self, doc_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.resolved.push(doc_id.to_string());
        let doc = inner.documents.get_mut(doc_id).ok_or_else(|| StorageError::NotFound {
            doc_id: doc_id.to_string(),
            rev_id: None,
        })?;
        if let Some(winner) = doc.current().map(|rev| rev.rev_id.clone()) {
            doc.leaves.retain(|leaf| *leaf == winner);
        }
        Ok(())
    }

    fn add_change_listener(&self, callback: ChangeCallback) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_listener += 1;
        let id = inner.next_listener;
        inner.listeners.push((id, callback));
        id
    }

    fn remove_change_listener(&self, id: u64) {
        self.inner.lock().listeners.retain(|(listener, _)| *listener != id);
    }

    fn get_checkpoint(&self, id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().checkpoints.get(id).cloned())
    }

    fn set_checkpoint(&self, id: &str, data: Option<&[u8]>) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        match data {
            Some(data) => inner.checkpoints.insert(id.to_string(), data.to_vec()),
            None => inner.checkpoints.remove(id),
        };
        Ok(())
    }
}
