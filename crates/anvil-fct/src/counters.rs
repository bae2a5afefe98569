//! Telemetry counters for the file content table.
//!
//! All fields are atomics so every table surface can tally without
//! coordination; [`FctCounters::snapshot`] produces a plain struct for
//! reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Counter collection shared by the table, the persistence layer, and the
/// journal observer.
#[derive(Debug, Default)]
pub struct FctCounters {
    /// Live entry count, sampled at save/load.
    pub num_entries: AtomicU64,
    /// Probes answered from the table.
    pub num_hit: AtomicU64,
    /// Probes for identities the table has never seen.
    pub num_file_id_mismatch: AtomicU64,
    /// Records that replaced an entry with identical hash but a different
    /// version (benign: repeated strong establishment or multiple links).
    pub num_usn_mismatch: AtomicU64,
    /// Records that replaced an entry with a different hash.
    pub num_content_mismatch: AtomicU64,
    /// Entries dropped at save time because their TTL reached zero.
    pub num_evicted: AtomicU64,
    /// Entries whose version was advanced by journal scan events.
    pub num_updated_by_scan: AtomicU64,
    /// Entries removed because the journal reported all links gone.
    pub num_removed_by_scan: AtomicU64,

    load_duration_us: AtomicU64,
    save_duration_us: AtomicU64,
    probe_duration_us: AtomicU64,
    record_duration_us: AtomicU64,
}

impl FctCounters {
    pub(crate) fn add_load_duration(&self, d: Duration) {
        self.load_duration_us
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_save_duration(&self, d: Duration) {
        self.save_duration_us
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_probe_duration(&self, d: Duration) {
        self.probe_duration_us
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_record_duration(&self, d: Duration) {
        self.record_duration_us
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    /// Fold one journal scan pass into the cumulative counters.
    pub(crate) fn merge_scan(&self, updated: u64, removed: u64) {
        self.num_updated_by_scan.fetch_add(updated, Ordering::Relaxed);
        self.num_removed_by_scan.fetch_add(removed, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            num_entries: self.num_entries.load(Ordering::Relaxed),
            num_hit: self.num_hit.load(Ordering::Relaxed),
            num_file_id_mismatch: self.num_file_id_mismatch.load(Ordering::Relaxed),
            num_usn_mismatch: self.num_usn_mismatch.load(Ordering::Relaxed),
            num_content_mismatch: self.num_content_mismatch.load(Ordering::Relaxed),
            num_evicted: self.num_evicted.load(Ordering::Relaxed),
            num_updated_by_scan: self.num_updated_by_scan.load(Ordering::Relaxed),
            num_removed_by_scan: self.num_removed_by_scan.load(Ordering::Relaxed),
            load_duration: Duration::from_micros(self.load_duration_us.load(Ordering::Relaxed)),
            save_duration: Duration::from_micros(self.save_duration_us.load(Ordering::Relaxed)),
            probe_duration: Duration::from_micros(self.probe_duration_us.load(Ordering::Relaxed)),
            record_duration: Duration::from_micros(
                self.record_duration_us.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Point-in-time copy of [`FctCounters`] for logging and reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub num_entries: u64,
    pub num_hit: u64,
    pub num_file_id_mismatch: u64,
    pub num_usn_mismatch: u64,
    pub num_content_mismatch: u64,
    pub num_evicted: u64,
    pub num_updated_by_scan: u64,
    pub num_removed_by_scan: u64,
    pub load_duration: Duration,
    pub save_duration: Duration,
    pub probe_duration: Duration,
    pub record_duration: Duration,
}
