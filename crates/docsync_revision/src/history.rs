//! Revision histories and their compact wire encoding.
//!
//! A history lists a document's revisions from the current tip back
//! towards the root. When generations descend one at a time it is sent as
//! `{"start": <tip generation>, "ids": [<suffixes>]}`; any gap or malformed
//! entry forces the fully-qualified list form.

use crate::error::{RevisionError, RevisionResult};
use crate::rev_id::RevisionId;
use serde::{Deserialize, Serialize};

/// An ordered list of revisions, tip first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RevisionHistory {
    ids: Vec<RevisionId>,
}

impl RevisionHistory {
    /// Creates a history from IDs ordered tip to root.
    pub fn new(ids: Vec<RevisionId>) -> Self {
        Self { ids }
    }

    /// Returns the current tip, if any.
    pub fn tip(&self) -> Option<&RevisionId> {
        self.ids.first()
    }

    /// Returns the number of revisions in the history.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the history has no revisions.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterates over the revisions, tip first.
    pub fn iter(&self) -> impl Iterator<Item = &RevisionId> {
        self.ids.iter()
    }

    /// Returns the revisions as a slice.
    pub fn as_slice(&self) -> &[RevisionId] {
        &self.ids
    }

    /// Returns the index of `id` in the history.
    pub fn position_of(&self, id: &RevisionId) -> Option<usize> {
        self.ids.iter().position(|candidate| candidate == id)
    }

    /// Keeps at most `max_depth` revisions, dropping the oldest.
    pub fn truncate(&mut self, max_depth: usize) {
        self.ids.truncate(max_depth);
    }

    /// Returns the part of the history the peer is missing.
    ///
    /// The result holds the revisions newer than the first one found in
    /// `known`, tip first; the known revision itself is excluded. Without a
    /// common ancestor the whole history is returned.
    pub fn ancestors_after(&self, known: &[RevisionId]) -> RevisionHistory {
        let end = self
            .ids
            .iter()
            .position(|id| known.contains(id))
            .unwrap_or(self.ids.len());
        Self::new(self.ids[..end].to_vec())
    }

    /// Returns true if every entry is well-formed and generations descend
    /// by exactly one.
    pub fn is_contiguous(&self) -> bool {
        self.first_gap().is_none()
    }

    fn first_gap(&self) -> Option<usize> {
        let start = self.ids.first()?.generation();
        self.ids.iter().enumerate().find_map(|(i, id)| {
            let expected = start.checked_sub(i as u64).filter(|g| *g > 0);
            (!id.is_well_formed() || Some(id.generation()) != expected).then_some(i)
        })
    }

    /// Encodes the history, compacting it when generations are contiguous.
    pub fn encode(&self) -> RevisionResult<EncodedHistory> {
        let tip = self.tip().ok_or(RevisionError::Empty)?;
        if !self.is_contiguous() {
            return Ok(EncodedHistory::Full(
                self.ids.iter().map(|id| id.as_str().to_string()).collect(),
            ));
        }
        Ok(EncodedHistory::Compact {
            start: tip.generation(),
            ids: self
                .ids
                .iter()
                .filter_map(|id| id.suffix().map(str::to_string))
                .collect(),
        })
    }

    /// Encodes the history in compact form, failing on the first gap.
    pub fn compact(&self) -> RevisionResult<EncodedHistory> {
        if self.is_empty() {
            return Err(RevisionError::Empty);
        }
        match self.first_gap() {
            Some(index) => Err(RevisionError::NotContiguous { index }),
            None => self.encode(),
        }
    }

    /// Consumes the history, returning the IDs tip first.
    pub fn into_vec(self) -> Vec<RevisionId> {
        self.ids
    }
}

impl FromIterator<RevisionId> for RevisionHistory {
    fn from_iter<I: IntoIterator<Item = RevisionId>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a RevisionHistory {
    type Item = &'a RevisionId;
    type IntoIter = std::slice::Iter<'a, RevisionId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

/// Wire form of a [`RevisionHistory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncodedHistory {
    /// Contiguous run: tip generation plus suffixes, tip first.
    Compact {
        /// Generation of the first (tip) suffix.
        start: u64,
        /// Suffixes, tip first.
        ids: Vec<String>,
    },
    /// Fully-qualified IDs, tip first.
    Full(Vec<String>),
}

impl EncodedHistory {
    /// Rebuilds the history.
    pub fn expand(&self) -> RevisionResult<RevisionHistory> {
        match self {
            EncodedHistory::Compact { start, ids } => {
                if ids.is_empty() {
                    return Err(RevisionError::Empty);
                }
                if *start < ids.len() as u64 {
                    return Err(RevisionError::StartTooSmall {
                        start: *start,
                        len: ids.len(),
                    });
                }
                Ok(ids
                    .iter()
                    .enumerate()
                    .map(|(i, suffix)| RevisionId::new(start - i as u64, suffix))
                    .collect())
            }
            EncodedHistory::Full(ids) => {
                if ids.is_empty() {
                    return Err(RevisionError::Empty);
                }
                Ok(ids.iter().map(|id| RevisionId::from(id.as_str())).collect())
            }
        }
    }
}
