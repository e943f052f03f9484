//! Revision identifiers.

use crate::error::{RevisionError, RevisionResult};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Longest parent ID prefix hashed into a new revision's digest.
const MAX_PARENT_LEN: usize = u8::MAX as usize;

/// A document revision identifier.
///
/// Well-formed IDs (`"<generation>-<suffix>"`) order by generation and then
/// byte-wise by suffix. Malformed IDs are kept verbatim, behave as
/// generation 0, and order among themselves by case-insensitive text.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RevisionId {
    text: String,
    /// Zero when the ID is malformed.
    generation: u64,
    /// Byte offset of the suffix; only meaningful when `generation > 0`.
    suffix_at: usize,
}

impl RevisionId {
    /// Parses a well-formed revision ID.
    pub fn parse(text: &str) -> RevisionResult<Self> {
        match split(text) {
            Some((generation, suffix_at)) => Ok(Self {
                text: text.to_string(),
                generation,
                suffix_at,
            }),
            None => Err(RevisionError::Malformed(text.to_string())),
        }
    }

    /// Builds an ID from a generation and a suffix.
    ///
    /// A zero generation or an empty suffix yields an opaque (malformed) ID.
    pub fn new(generation: u64, suffix: &str) -> Self {
        Self::from(format!("{generation}-{suffix}"))
    }

    /// Computes the ID of a new revision.
    ///
    /// The digest covers the parent ID (length-prefixed with one byte and
    /// truncated to 255 bytes), a deletion flag byte and the canonical body.
    pub fn digest(parent: Option<&RevisionId>, deleted: bool, body: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        match parent {
            Some(parent) => {
                let bytes = parent.text.as_bytes();
                let len = bytes.len().min(MAX_PARENT_LEN);
                hasher.update([len as u8]);
                hasher.update(&bytes[..len]);
            }
            None => hasher.update([0u8]),
        }
        hasher.update([u8::from(deleted)]);
        hasher.update(body);

        let generation = parent.map_or(0, RevisionId::generation) + 1;
        Self::new(generation, &hex::encode(hasher.finalize()))
    }

    /// Returns the ID as text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the generation, or 0 for a malformed ID.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the suffix of a well-formed ID.
    pub fn suffix(&self) -> Option<&str> {
        self.is_well_formed().then(|| &self.text[self.suffix_at..])
    }

    /// Returns true if the ID parsed as `<generation>-<suffix>`.
    pub fn is_well_formed(&self) -> bool {
        self.generation > 0
    }
}

/// Splits `text` into a generation and the suffix offset.
fn split(text: &str) -> Option<(u64, usize)> {
    let dash = text.find('-')?;
    let (digits, suffix) = (&text[..dash], &text[dash + 1..]);
    if digits.is_empty()
        || suffix.is_empty()
        || digits.starts_with('0')
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let generation = digits.parse::<u64>().ok()?;
    Some((generation, dash + 1))
}

impl From<String> for RevisionId {
    fn from(text: String) -> Self {
        let (generation, suffix_at) = split(&text).unwrap_or((0, 0));
        Self {
            text,
            generation,
            suffix_at,
        }
    }
}

impl From<&str> for RevisionId {
    fn from(text: &str) -> Self {
        Self::from(text.to_string())
    }
}

impl From<RevisionId> for String {
    fn from(id: RevisionId) -> Self {
        id.text
    }
}

impl FromStr for RevisionId {
    type Err = RevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_well_formed(), other.is_well_formed()) {
            (true, true) => self.generation.cmp(&other.generation).then_with(|| {
                self.text.as_bytes()[self.suffix_at..].cmp(&other.text.as_bytes()[other.suffix_at..])
            }),
            (false, false) => {
                let lhs = self.text.bytes().map(|b| b.to_ascii_lowercase());
                let rhs = other.text.bytes().map(|b| b.to_ascii_lowercase());
                lhs.cmp(rhs).then_with(|| self.text.cmp(&other.text))
            }
            (false, true) => Ordering::Less,
            (true, false) => Ordering::Greater,
        }
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevisionId({:?})", self.text)
    }
}
