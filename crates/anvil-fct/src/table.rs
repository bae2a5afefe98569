//! Table core: the concurrent identity → entry map with probe/record and
//! generational TTL bookkeeping.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tracing::{trace, warn};

use anvil_identity::{
    establish_strong_identity, query_weak_identity, FileIdentity, IdentityError,
    VersionedFileIdentity,
};

use crate::counters::FctCounters;
use crate::ContentHash;

/// TTL given to freshly recorded or freshly hit entries. An unused entry
/// survives this many persist round-trips before eviction.
pub const DEFAULT_TTL: u16 = 255;

/// Value stored per identity.
///
/// `version` is always a strong version; `ttl` counts the remaining
/// persist round-trips before the entry is dropped (0 means "evict at the
/// next save").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub version: u64,
    pub hash: ContentHash,
    pub length: i64,
    pub ttl: u16,
}

/// State shared between table handles and journal observers.
pub(crate) struct TableShared {
    pub entries: DashMap<FileIdentity, Entry>,
    pub counters: FctCounters,
    journal_warning_logged: AtomicBool,
}

impl TableShared {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
            counters: FctCounters::default(),
            journal_warning_logged: AtomicBool::new(false),
        }
    }

    /// Log the "no versioned identity" diagnostic exactly once per table.
    /// Subsequent unsupported operations stay silent.
    pub(crate) fn warn_identity_unsupported(&self, path: &Path) {
        if self
            .journal_warning_logged
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            warn!(
                path = %path.display(),
                "versioned file identity is unavailable; file content table is disabled"
            );
        }
    }
}

/// Successful probe result: the identity (promoted to strong), the hash
/// recorded for it, and the file length at that version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHit {
    pub identity: VersionedFileIdentity,
    pub hash: ContentHash,
    pub length: i64,
}

/// Durable, concurrent map from kernel file identity to the content hash
/// last recorded at that identity's current version.
///
/// Cloning is cheap and shares the underlying map, so one table can be
/// handed to many engine threads. See the crate docs for the probe/record
/// contract.
#[derive(Clone)]
pub struct FileContentTable {
    pub(crate) shared: Arc<TableShared>,
    default_ttl: u16,
    is_stub: bool,
}

impl FileContentTable {
    /// Create an empty table.
    ///
    /// `default_ttl` must be positive; it bounds how many persist
    /// round-trips an unused entry survives.
    pub fn new(default_ttl: u16) -> Self {
        assert!(default_ttl > 0, "default_ttl must be positive");
        Self {
            shared: Arc::new(TableShared::new()),
            default_ttl,
            is_stub: false,
        }
    }

    /// Create a stub table: every probe misses and every record is
    /// dropped, exactly as if the OS never supported versioned identity.
    /// Lets callers disable the mechanism without branching at call sites.
    pub fn stub() -> Self {
        Self {
            is_stub: true,
            ..Self::new(DEFAULT_TTL)
        }
    }

    /// Copy `other`'s entries while applying one TTL decrement, exactly as
    /// a save/load round-trip would: entries already at TTL zero are
    /// dropped, surviving TTLs are clamped to the new default and
    /// decremented. Used to age a table without touching disk.
    pub fn create_from(other: &FileContentTable, new_default_ttl: Option<u16>) -> Self {
        let default_ttl = new_default_ttl.unwrap_or(other.default_ttl);
        let table = Self::new(default_ttl);
        for item in other.shared.entries.iter() {
            let entry = *item.value();
            if entry.ttl == 0 {
                continue;
            }
            table.shared.entries.insert(
                *item.key(),
                Entry {
                    ttl: entry.ttl.min(default_ttl) - 1,
                    ..entry
                },
            );
        }
        table
    }

    pub fn default_ttl(&self) -> u16 {
        self.default_ttl
    }

    pub fn is_stub(&self) -> bool {
        self.is_stub
    }

    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// Access the table's telemetry counters.
    pub fn counters(&self) -> &FctCounters {
        &self.shared.counters
    }

    /// Ask whether the table already knows the content hash for the file
    /// behind `handle`.
    ///
    /// Returns a hit only when the file's current version equals the
    /// version stored at its identity; any content mutation since the last
    /// [`record`](Self::record) turns this into a miss. A hit refreshes
    /// the entry's TTL and reports the identity as strong: the hit proves
    /// the last recorder established the version strongly, so the caller
    /// may track it without re-establishing.
    pub fn probe(&self, path: &Path, handle: &File) -> Option<ProbeHit> {
        let start = Instant::now();
        let result = self.probe_inner(path, handle);
        self.shared.counters.add_probe_duration(start.elapsed());
        result
    }

    fn probe_inner(&self, path: &Path, handle: &File) -> Option<ProbeHit> {
        let weak = match self.query_weak(handle) {
            Ok(weak) => weak,
            Err(IdentityError::NotSupported) => {
                self.shared.warn_identity_unsupported(path);
                return None;
            }
            Err(err) => {
                trace!(path = %path.display(), error = %err, "probe: identity query failed");
                return None;
            }
        };

        let mut entry = match self.shared.entries.get_mut(&weak.identity) {
            Some(entry) => entry,
            None => {
                self.shared
                    .counters
                    .num_file_id_mismatch
                    .fetch_add(1, Ordering::Relaxed);
                trace!(
                    path = %path.display(),
                    volume_id = weak.identity.volume_id,
                    "probe miss: identity not in table"
                );
                return None;
            }
        };

        if entry.version != weak.version {
            trace!(
                path = %path.display(),
                stored_version = entry.version,
                observed_version = weak.version,
                "probe miss: version drift"
            );
            return None;
        }

        // Skip the write when the TTL is already at max; refreshing an
        // untouched counter is the common case under repeated probes.
        if entry.ttl != self.default_ttl {
            entry.ttl = self.default_ttl;
        }
        let hit = ProbeHit {
            identity: weak.promote_to_strong(),
            hash: entry.hash,
            length: entry.length,
        };
        drop(entry);

        self.shared.counters.num_hit.fetch_add(1, Ordering::Relaxed);
        trace!(path = %path.display(), version = hit.identity.version, "probe hit");
        Some(hit)
    }

    /// Remember `hash` as the content of the file behind `handle`.
    ///
    /// Establishes a strong version first, so the stored version postdates
    /// the hashed bytes by at most the establishment itself; repeated
    /// records of an unchanged file keep advancing the stored version,
    /// which is what lets subsequent probes match.
    ///
    /// `strict` selects a full flush during establishment and defaults to
    /// the handle's writability (a writable handle may have unflushed
    /// writes behind it). On any identity failure the record is dropped
    /// and the anonymous identity is returned; the caller simply stays
    /// uncached.
    pub fn record(
        &self,
        path: &Path,
        handle: &File,
        hash: ContentHash,
        length: i64,
        strict: Option<bool>,
    ) -> VersionedFileIdentity {
        let start = Instant::now();
        let result = self.record_inner(path, handle, hash, length, strict);
        self.shared.counters.add_record_duration(start.elapsed());
        result
    }

    fn record_inner(
        &self,
        path: &Path,
        handle: &File,
        hash: ContentHash,
        length: i64,
        strict: Option<bool>,
    ) -> VersionedFileIdentity {
        let strict = strict.unwrap_or_else(|| handle_is_writable(handle));
        let strong = match self.establish_strong(handle, strict) {
            Ok(strong) => strong,
            Err(IdentityError::NotSupported) => {
                self.shared.warn_identity_unsupported(path);
                return VersionedFileIdentity::anonymous();
            }
            Err(err) => {
                trace!(path = %path.display(), error = %err, "record: identity establishment failed");
                return VersionedFileIdentity::anonymous();
            }
        };

        let new_entry = Entry {
            version: strong.version,
            hash,
            length,
            ttl: self.default_ttl,
        };

        match self.shared.entries.entry(strong.identity) {
            MapEntry::Vacant(slot) => {
                slot.insert(new_entry);
            }
            MapEntry::Occupied(mut slot) => {
                let existing = *slot.get();
                // A racing thread may have recorded a later version; the
                // numerically greater version always wins.
                if existing.version <= new_entry.version {
                    if existing.hash == new_entry.hash && existing.version != new_entry.version {
                        self.shared
                            .counters
                            .num_usn_mismatch
                            .fetch_add(1, Ordering::Relaxed);
                    } else if existing.hash != new_entry.hash {
                        self.shared
                            .counters
                            .num_content_mismatch
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    slot.insert(new_entry);
                }
            }
        }

        trace!(
            path = %path.display(),
            version = strong.version,
            length,
            "recorded content hash"
        );
        strong
    }

    fn query_weak(&self, handle: &File) -> anvil_identity::Result<VersionedFileIdentity> {
        if self.is_stub {
            return Err(IdentityError::NotSupported);
        }
        query_weak_identity(handle)
    }

    fn establish_strong(
        &self,
        handle: &File,
        flush: bool,
    ) -> anvil_identity::Result<VersionedFileIdentity> {
        if self.is_stub {
            return Err(IdentityError::NotSupported);
        }
        establish_strong_identity(handle, flush)
    }
}

impl std::fmt::Debug for FileContentTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileContentTable")
            .field("entries", &self.shared.entries.len())
            .field("default_ttl", &self.default_ttl)
            .field("is_stub", &self.is_stub)
            .finish()
    }
}

/// Whether the handle was opened with write access, via `F_GETFL`.
/// Unknown access modes err toward `true` (full flush on record).
#[cfg(unix)]
fn handle_is_writable(handle: &File) -> bool {
    use std::os::unix::io::AsRawFd;

    let flags = unsafe { libc::fcntl(handle.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return true;
    }
    let mode = flags & libc::O_ACCMODE;
    mode == libc::O_WRONLY || mode == libc::O_RDWR
}

#[cfg(not(unix))]
fn handle_is_writable(_handle: &File) -> bool {
    true
}
