//! Change-journal observer: applies externally scanned change records to
//! live table entries.
//!
//! The journal scanner runs elsewhere in the engine and feeds each scan
//! pass through a [`JournalObserver`]: `begin_scan`, one `on_change` per
//! record, `end_scan`. The observer owns only the shared map and
//! counters, not the table handle, so it can be torn down independently.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use anvil_identity::FileIdentity;

use crate::table::{FileContentTable, TableShared};

/// How a change record affects the links of its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkImpact {
    /// Content or metadata change with no link lifecycle effect.
    None,
    /// One link (of possibly several) was removed or renamed.
    SingleLink,
    /// The last link is gone; the file object no longer exists.
    AllLinks,
}

/// One change record as delivered by the journal scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFileIdInfo {
    pub identity: FileIdentity,
    /// Version the scanner had previously tracked for this identity.
    pub last_tracked_version: u64,
    /// Version of the new change record.
    pub version: u64,
    pub link_impact: LinkImpact,
}

/// Sink for journal scan events, obtained from
/// [`FileContentTable::observer_interface`].
pub struct JournalObserver {
    shared: Arc<TableShared>,
    is_stub: bool,
    updated_this_pass: HashSet<FileIdentity>,
    updated_count: u64,
    removed_count: u64,
}

impl FileContentTable {
    /// Interface through which a journal scan mutates this table's
    /// entries. A stub table's observer ignores all events.
    pub fn observer_interface(&self) -> JournalObserver {
        JournalObserver {
            shared: Arc::clone(&self.shared),
            is_stub: self.is_stub(),
            updated_this_pass: HashSet::new(),
            updated_count: 0,
            removed_count: 0,
        }
    }
}

impl JournalObserver {
    /// Reset per-pass state. Call once before each scan pass.
    pub fn begin_scan(&mut self) {
        self.updated_this_pass.clear();
        self.updated_count = 0;
        self.removed_count = 0;
    }

    /// Apply one change record. Records never fail from the table's
    /// perspective; irrelevant or stale records are ignored.
    pub fn on_change(&mut self, info: &ChangedFileIdInfo) {
        if self.is_stub {
            return;
        }

        match info.link_impact {
            LinkImpact::AllLinks => {
                // The file object is gone; drop the entry unless a racing
                // record already stored something newer than this event.
                let removed = self
                    .shared
                    .entries
                    .remove_if(&info.identity, |_, entry| info.version > entry.version);
                if removed.is_some() {
                    self.removed_count += 1;
                    trace!(
                        volume_id = info.identity.volume_id,
                        version = info.version,
                        "journal scan removed entry (all links gone)"
                    );
                }
            }
            LinkImpact::SingleLink | LinkImpact::None => {
                let Some(mut entry) = self.shared.entries.get_mut(&info.identity) else {
                    return;
                };
                if info.version <= entry.version {
                    return;
                }
                // A compound operation (rename, timestamp change) emits a
                // burst of records. The first record promotes the entry;
                // the rest must recognize the promoted state rather than
                // treat it as a stale mismatch.
                let follows_known_state = self.updated_this_pass.contains(&info.identity)
                    || entry.version == info.last_tracked_version;
                if !follows_known_state {
                    return;
                }
                entry.version = info.version;
                drop(entry);
                self.updated_this_pass.insert(info.identity);
                self.updated_count += 1;
                trace!(
                    volume_id = info.identity.volume_id,
                    version = info.version,
                    "journal scan advanced entry version"
                );
            }
        }
    }

    /// Flush per-pass tallies into the table counters. Call once after
    /// each scan pass.
    pub fn end_scan(&mut self) {
        self.shared
            .counters
            .merge_scan(self.updated_count, self.removed_count);
        debug!(
            updated = self.updated_count,
            removed = self.removed_count,
            "journal scan pass applied to file content table"
        );
        self.updated_this_pass.clear();
        self.updated_count = 0;
        self.removed_count = 0;
    }
}
