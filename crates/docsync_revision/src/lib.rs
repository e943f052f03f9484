//! # docsync Revisions
//!
//! Revision identifiers and revision histories for docsync.
//!
//! This crate provides:
//! - `RevisionId` parsing, ordering and digest generation
//! - `RevisionHistory` (tip to root) with truncation helpers
//! - `EncodedHistory`, the compact wire form of a history
//!
//! This is a pure crate with no I/O operations.
//!
//! ## Revision ID Format
//!
//! A well-formed ID is `"<generation>-<suffix>"` where `generation` is a
//! positive integer and `suffix` is an opaque, non-empty byte string
//! (normally a lowercase hex digest). Anything else is kept as opaque text
//! and sorts below every well-formed ID.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod history;
mod rev_id;

pub use error::{RevisionError, RevisionResult};
pub use history::{EncodedHistory, RevisionHistory};
pub use rev_id::RevisionId;
