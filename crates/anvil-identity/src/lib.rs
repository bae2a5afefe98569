//! # anvil-identity
//!
//! Versioned kernel-level file identity for the Anvil build engine.
//!
//! A [`FileIdentity`] names a file object the way the kernel does: by
//! volume and file id rather than by path. Two hardlinked paths share one
//! identity, a rename keeps it, and deleting then recreating a file
//! produces a new one. Every identity carries a [`version`](VersionedFileIdentity)
//! that advances whenever the file's content changes, which lets callers
//! use `(identity, version)` as a cache key that survives renames but is
//! invalidated by writes.
//!
//! ## Weak vs. strong versions
//!
//! A *weak* version is merely observed and may correspond to an in-flight
//! mutation. A *strong* version is established by [`establish_strong_identity`],
//! which sequences itself after every previously handed-out version for
//! that identity, so the returned version postdates any mutation the
//! process has seen.
//!
//! ## Platform notes
//!
//! Unix has no change journal, so versions here are derived from the
//! file's mtime and made strictly monotone per identity by a process-wide
//! high-water table. The monotonicity guarantee therefore holds *within a
//! single process*; across processes an mtime rollback can alias an old
//! version. Callers that persist versions accept the same staleness
//! window as any mtime-based fingerprint check.

use std::fs::File;
use std::io;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while querying or establishing a versioned identity.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// The filesystem cannot produce versioned identities (no usable
    /// device/inode information). Callers treat this as "mechanism off".
    #[error("versioned file identity is not supported by this filesystem")]
    NotSupported,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// 128-bit file object id. On Unix the low word is the inode number and
/// the high word is reserved (zero).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FileId {
    pub high: u64,
    pub low: u64,
}

/// Kernel-level name of a file on the local machine.
///
/// Stable across renames and shared by hardlinks; a delete-and-recreate
/// yields a different identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FileIdentity {
    /// Id of the physical volume holding the file (`st_dev`).
    pub volume_id: u64,
    /// Id of the file object on that volume.
    pub file_id: FileId,
}

impl FileIdentity {
    /// The all-zero identity used when the OS cannot provide one.
    pub const fn anonymous() -> Self {
        Self {
            volume_id: 0,
            file_id: FileId { high: 0, low: 0 },
        }
    }

    pub fn is_anonymous(&self) -> bool {
        *self == Self::anonymous()
    }
}

/// How a version was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityKind {
    /// No identity could be established.
    Anonymous,
    /// Version was observed without any sequencing guarantee.
    Weak,
    /// Version is guaranteed to postdate prior mutations at this identity.
    Strong,
}

/// A file identity together with the version at which it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedFileIdentity {
    pub identity: FileIdentity,
    pub version: u64,
    pub kind: IdentityKind,
}

impl VersionedFileIdentity {
    /// Placeholder returned when versioned identity is unavailable; never
    /// stored in any table.
    pub const fn anonymous() -> Self {
        Self {
            identity: FileIdentity::anonymous(),
            version: 0,
            kind: IdentityKind::Anonymous,
        }
    }

    /// Copy of this identity with the version marked strong. Valid only
    /// when the caller has proof the version was strongly established.
    pub fn promote_to_strong(self) -> Self {
        Self {
            kind: IdentityKind::Strong,
            ..self
        }
    }
}

/// Per-identity high-water marks for versions handed out by this process.
///
/// mtime alone is not strictly monotone (coarse clocks, backdated
/// timestamps), so every strong establishment bumps past the last version
/// returned for the identity, and weak queries never report below it.
static HIGH_WATER: Lazy<DashMap<FileIdentity, u64>> = Lazy::new(DashMap::new);

/// Observe the file's current identity and version without any sequencing
/// guarantee. Cheap; suitable for cache probes.
pub fn query_weak_identity(file: &File) -> Result<VersionedFileIdentity> {
    let meta = file.metadata()?;
    let identity = identity_from_metadata(&meta)?;
    let observed = version_from_metadata(&meta);
    let version = match HIGH_WATER.get(&identity) {
        Some(mark) => observed.max(*mark),
        None => observed,
    };
    Ok(VersionedFileIdentity {
        identity,
        version,
        kind: IdentityKind::Weak,
    })
}

/// Establish a version guaranteed to postdate every mutation this process
/// has observed at the file's identity.
///
/// With `flush` set the file's data and metadata are forced to disk first,
/// so the version corresponds to a quiescent on-disk state; without it the
/// version is sequenced by the process-local high-water table only. Pass
/// `flush` when the handle may have been written through.
pub fn establish_strong_identity(file: &File, flush: bool) -> Result<VersionedFileIdentity> {
    if flush {
        file.sync_all()?;
    }
    let meta = file.metadata()?;
    let identity = identity_from_metadata(&meta)?;
    let observed = version_from_metadata(&meta);
    let mut mark = HIGH_WATER.entry(identity).or_insert(0);
    let version = observed.max(*mark + 1);
    *mark = version;
    drop(mark);
    Ok(VersionedFileIdentity {
        identity,
        version,
        kind: IdentityKind::Strong,
    })
}

#[cfg(unix)]
fn identity_from_metadata(meta: &std::fs::Metadata) -> Result<FileIdentity> {
    use std::os::unix::fs::MetadataExt;

    let dev = meta.dev();
    let ino = meta.ino();
    if dev == 0 && ino == 0 {
        return Err(IdentityError::NotSupported);
    }
    Ok(FileIdentity {
        volume_id: dev,
        file_id: FileId { high: 0, low: ino },
    })
}

/// Fold mtime into a single u64: seconds in the high bits, nanoseconds in
/// the low 30. ctime is deliberately excluded: renames and permission
/// changes touch ctime but not content, and identity must survive both.
#[cfg(unix)]
fn version_from_metadata(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;

    let sec = meta.mtime() as u64;
    let nsec = (meta.mtime_nsec() as u64) & 0x3FFF_FFFF;
    (sec << 30) | nsec
}

#[cfg(not(unix))]
fn identity_from_metadata(_meta: &std::fs::Metadata) -> Result<FileIdentity> {
    Err(IdentityError::NotSupported)
}

#[cfg(not(unix))]
fn version_from_metadata(_meta: &std::fs::Metadata) -> u64 {
    0
}
