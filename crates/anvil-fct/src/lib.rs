//! # anvil-fct
//!
//! The File Content Table (FCT): a durable, concurrent mapping from a
//! file's kernel-level identity to the content hash last observed at that
//! identity's current version.
//!
//! The FCT is what lets the Anvil scheduler decide, without rehashing,
//! whether a file's bytes are still the bytes it saw last time. Callers
//! open a file themselves and ask the table two questions:
//!
//! - [`FileContentTable::probe`] — "do I already know this file's hash?"
//! - [`FileContentTable::record`] — "remember this hash for this file".
//!
//! Entries are keyed by [`FileIdentity`] (volume + file id), so hits
//! survive renames and are shared across hardlinks, while any content
//! mutation advances the file's version and turns the entry into a miss.
//!
//! ## Surfaces
//!
//! - Table core: concurrent probe/record with generational TTL ([`table`]).
//! - Persistence: envelope-framed on-disk format with TTL decay on every
//!   round-trip ([`FileContentTable::save`] / [`FileContentTable::load`]).
//! - Change observer: applies change-journal scan events to live entries
//!   ([`JournalObserver`]).
//! - Visitor: iterates live entries by reopening their identities
//!   ([`FileContentTable::visit`]).

mod counters;
mod envelope;
mod observer;
mod persistence;
mod table;
mod visitor;

pub use anvil_identity::{
    FileId, FileIdentity, IdentityError, IdentityKind, VersionedFileIdentity,
};
pub use counters::{CounterSnapshot, FctCounters};
pub use observer::{ChangedFileIdInfo, JournalObserver, LinkImpact};
pub use table::{FileContentTable, ProbeHit, DEFAULT_TTL};
pub use visitor::{HandleAccessor, ShareMode};

use std::io;

use thiserror::Error;

/// Content hash as produced by the engine's hasher (BLAKE3, 32 bytes).
/// The table treats it as opaque; it never rehashes content itself.
pub type ContentHash = [u8; 32];

/// Length of a [`ContentHash`] in bytes.
pub const CONTENT_HASH_LEN: usize = 32;

/// Name of the hash algorithm recorded in the on-disk envelope. A table
/// saved under a different algorithm loads as invalid-format.
pub const HASH_ALGORITHM_NAME: &str = "Blake3";

/// Errors surfaced by table persistence. Probe and record never fail;
/// they degrade to misses and anonymous identities instead.
#[derive(Error, Debug)]
pub enum FctError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid table format: {0}")]
    InvalidFormat(String),
}

pub type Result<T> = std::result::Result<T, FctError>;
