//! Diagnostic visitor: walk live entries by reopening their identities.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

use anvil_identity::{query_weak_identity, FileIdentity};

use crate::table::FileContentTable;
use crate::ContentHash;

/// Sharing requested when the accessor reopens a file by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    ReadOnly,
    /// Tolerate concurrent deletion of the file while it is open.
    ReadDelete,
}

/// Reverse lookup from identity to an open handle, provided by the
/// engine's file accessor. The table has no path index of its own.
pub trait HandleAccessor {
    fn open_by_identity(
        &self,
        identity: &FileIdentity,
        share: ShareMode,
    ) -> io::Result<(File, PathBuf)>;
}

impl FileContentTable {
    /// Visit every live entry whose file still exists at its recorded
    /// version. `f` returns `false` to stop early. Entries that cannot be
    /// reopened or whose version has drifted are skipped. Entries are
    /// never mutated.
    pub fn visit<A, F>(&self, accessor: &A, share: ShareMode, mut f: F)
    where
        A: HandleAccessor,
        F: FnMut(&FileIdentity, &File, &Path, u64, &ContentHash) -> bool,
    {
        if self.is_stub() {
            return;
        }

        // Snapshot so no shard lock is held across accessor callouts.
        let snapshot: Vec<(FileIdentity, u64, ContentHash)> = self
            .shared
            .entries
            .iter()
            .map(|item| (*item.key(), item.value().version, item.value().hash))
            .collect();

        for (identity, version, hash) in snapshot {
            let (handle, path) = match accessor.open_by_identity(&identity, share) {
                Ok(opened) => opened,
                Err(err) => {
                    trace!(
                        volume_id = identity.volume_id,
                        error = %err,
                        "visit: identity not openable, skipping"
                    );
                    continue;
                }
            };
            let current = match query_weak_identity(&handle) {
                Ok(weak) => weak,
                Err(_) => continue,
            };
            if current.identity != identity || current.version != version {
                trace!(
                    volume_id = identity.volume_id,
                    "visit: version drift, skipping"
                );
                continue;
            }
            if !f(&identity, &handle, &path, version, &hash) {
                break;
            }
        }
    }
}
