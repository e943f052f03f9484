//! Replication checkpoints.
//!
//! A checkpoint records how far each direction has got: the last local
//! sequence pushed and the last remote sequence pulled. It is stored in the
//! local database under an ID derived from everything that determines what
//! gets replicated, so changing the target or the filters starts over.

use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorResult, StorageError};
use crate::storage::Storage;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Replication position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last local sequence pushed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<u64>,
    /// Last remote sequence pulled (opaque).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl Checkpoint {
    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.remote.is_none()
    }
}

/// Derives the checkpoint ID for a local database and configuration.
pub fn checkpoint_id(local: Uuid, config: &ReplicatorConfig) -> String {
    let mut channels: Vec<&str> = config.channels.iter().map(String::as_str).collect();
    channels.sort_unstable();
    let mut document_ids: Vec<&str> = config.document_ids.iter().map(String::as_str).collect();
    document_ids.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(local.as_bytes());
    hash_field(&mut hasher, config.target.as_str());
    hash_field(&mut hasher, config.replicator_type.as_str());
    for list in [channels, document_ids] {
        hasher.update((list.len() as u64).to_be_bytes());
        for item in list {
            hash_field(&mut hasher, item);
        }
    }
    format!("cp-{}", STANDARD.encode(hasher.finalize()))
}

fn hash_field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

/// Loads and saves the checkpoint of one replicator, throttling saves.
pub(crate) struct Checkpointer {
    id: String,
    storage: Arc<dyn Storage>,
    interval: Duration,
    current: Checkpoint,
    dirty: bool,
    last_save: Option<Instant>,
}

impl Checkpointer {
    pub(crate) fn new(storage: Arc<dyn Storage>, config: &ReplicatorConfig) -> Self {
        Self {
            id: checkpoint_id(storage.uuid(), config),
            storage,
            interval: config.checkpoint_interval,
            current: Checkpoint::default(),
            dirty: false,
            last_save: None,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Reads the saved checkpoint. An unreadable record counts as empty.
    pub(crate) fn load(&mut self) -> ReplicatorResult<&Checkpoint> {
        self.current = match self.storage.get_checkpoint(&self.id)? {
            Some(data) => serde_json::from_slice(&data).unwrap_or_else(|err| {
                warn!(checkpoint = %self.id, error = %err, "discarding unreadable checkpoint");
                Checkpoint::default()
            }),
            None => Checkpoint::default(),
        };
        self.dirty = false;
        debug!(checkpoint = %self.id, local = ?self.current.local, remote = ?self.current.remote, "loaded checkpoint");
        Ok(&self.current)
    }

    /// Deletes the saved checkpoint.
    pub(crate) fn reset(&mut self) -> ReplicatorResult<()> {
        self.storage.set_checkpoint(&self.id, None)?;
        self.current = Checkpoint::default();
        self.dirty = false;
        debug!(checkpoint = %self.id, "checkpoint reset");
        Ok(())
    }

    /// Records a new position.
    ///
    /// Saves immediately if the last save is at least one interval old;
    /// otherwise returns the time at which [`flush`](Self::flush) should run.
    pub(crate) fn update(&mut self, checkpoint: Checkpoint) -> ReplicatorResult<Option<Instant>> {
        if checkpoint == self.current {
            return Ok(None);
        }
        self.current = checkpoint;
        self.dirty = true;

        let now = Instant::now();
        match self.last_save {
            Some(last) if now < last + self.interval => Ok(Some(last + self.interval)),
            _ => {
                self.save(now)?;
                Ok(None)
            }
        }
    }

    /// Saves the checkpoint if it changed since the last save.
    pub(crate) fn flush(&mut self) -> ReplicatorResult<()> {
        if self.dirty {
            self.save(Instant::now())?;
        }
        Ok(())
    }

    fn save(&mut self, now: Instant) -> ReplicatorResult<()> {
        let data = serde_json::to_vec(&self.current)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.storage.set_checkpoint(&self.id, Some(&data))?;
        self.dirty = false;
        self.last_save = Some(now);
        debug!(checkpoint = %self.id, local = ?self.current.local, remote = ?self.current.remote, "saved checkpoint");
        Ok(())
    }
}
