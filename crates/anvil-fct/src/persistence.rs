//! Table persistence: envelope-framed save/load with generational TTL
//! decay, plus the async façade.
//!
//! Saving skips entries whose TTL has reached zero; loading clamps each
//! TTL to the table's default and ages it by one. An entry therefore
//! survives `default_ttl` consecutive round-trips without being probed
//! before it disappears. Loading decodes on the calling thread while a
//! worker drains decoded entries into the map, so load wall-time tracks
//! disk read time.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use anvil_identity::{FileId, FileIdentity};

use crate::envelope::{finish_checksum, EnvelopeHeader, EnvelopeWriter};
use crate::table::{Entry, FileContentTable};
use crate::{FctError, Result, CONTENT_HASH_LEN};

/// Serialized entry size: volume id, 128-bit file id, version, hash,
/// length, ttl.
const ENTRY_WIRE_LEN: usize = 8 + 16 + 8 + CONTENT_HASH_LEN + 8 + 2;

/// Channel depth between the decode loop and the map-insert worker.
const INSERT_QUEUE_DEPTH: usize = 1024;

impl FileContentTable {
    /// Serialize the table to `path`.
    ///
    /// Entries whose TTL reached zero are evicted (not written). I/O
    /// errors propagate; the in-memory table is unaffected either way.
    /// The write is not crash-atomic: callers that need atomicity write
    /// to a temporary path and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let start = Instant::now();

        // Snapshot first so concurrent records cannot tear the body.
        let mut live = Vec::with_capacity(self.len());
        let mut evicted = 0u64;
        for item in self.shared.entries.iter() {
            let entry = *item.value();
            if entry.ttl == 0 {
                evicted += 1;
                continue;
            }
            live.push((*item.key(), entry));
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let envelope = EnvelopeWriter::begin(&mut writer)?;
        let mut hasher = envelope.hasher();
        let mut body_len = 0u64;

        let count = (live.len() as u32).to_le_bytes();
        writer.write_all(&count)?;
        hasher.update(&count);
        body_len += count.len() as u64;

        let mut buf = [0u8; ENTRY_WIRE_LEN];
        for (identity, entry) in &live {
            encode_entry(&mut buf, identity, entry);
            writer.write_all(&buf)?;
            hasher.update(&buf);
            body_len += ENTRY_WIRE_LEN as u64;
        }

        let checksum = finish_checksum(hasher, body_len);
        writer.flush()?;
        let mut file = writer
            .into_inner()
            .map_err(|e| FctError::Io(e.into_error()))?;
        envelope.patch(&mut file, body_len, checksum)?;
        file.sync_all()?;

        let counters = &self.shared.counters;
        counters.num_evicted.fetch_add(evicted, Ordering::Relaxed);
        counters.num_entries.store(live.len() as u64, Ordering::Relaxed);
        counters.add_save_duration(start.elapsed());

        debug!(
            path = %path.display(),
            entries = live.len(),
            evicted,
            "saved file content table"
        );
        Ok(())
    }

    /// Load a table from `path`, or `None` on any recoverable failure
    /// (missing file, invalid format, I/O error). Never panics and never
    /// returns a partially-populated table.
    pub fn load(path: &Path, default_ttl: u16) -> Option<FileContentTable> {
        match Self::load_table(path, default_ttl) {
            Ok(table) => Some(table),
            Err(err) => {
                log_load_failure(path, &err);
                None
            }
        }
    }

    /// Load a table from `path`, falling back to an empty table on any
    /// recoverable failure. Never fails.
    pub fn load_or_create(path: &Path, default_ttl: u16) -> FileContentTable {
        match Self::load_table(path, default_ttl) {
            Ok(table) => table,
            Err(err) => {
                log_load_failure(path, &err);
                FileContentTable::new(default_ttl)
            }
        }
    }

    fn load_table(path: &Path, default_ttl: u16) -> Result<FileContentTable> {
        assert!(default_ttl > 0, "default_ttl must be positive");
        let start = Instant::now();

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let header = EnvelopeHeader::read(&mut reader)?;

        let mut body = Vec::new();
        (&mut reader).take(header.body_len).read_to_end(&mut body)?;
        header.verify(&body)?;

        if body.len() < 4 {
            return Err(FctError::InvalidFormat("body too short".into()));
        }
        let count = u32_at(&body, 0) as usize;
        let expected = 4 + count * ENTRY_WIRE_LEN;
        if expected as u64 != header.body_len {
            return Err(FctError::InvalidFormat(format!(
                "entry count {} does not fit body length {}",
                count, header.body_len
            )));
        }

        let table = FileContentTable::new(default_ttl);
        // Drain decoded entries into the map from a worker so decoding
        // overlaps with insertion; the worker is joined before returning.
        std::thread::scope(|scope| -> Result<()> {
            let (tx, rx) = crossbeam_channel::bounded::<(FileIdentity, Entry)>(INSERT_QUEUE_DEPTH);
            let shared = Arc::clone(&table.shared);
            scope.spawn(move || {
                for (identity, entry) in rx {
                    shared.entries.insert(identity, entry);
                }
            });

            let mut offset = 4;
            for _ in 0..count {
                let (identity, mut entry) = decode_entry(&body[offset..offset + ENTRY_WIRE_LEN])?;
                offset += ENTRY_WIRE_LEN;
                // One generation passes per round-trip.
                entry.ttl = entry.ttl.min(default_ttl) - 1;
                let _ = tx.send((identity, entry));
            }
            drop(tx);
            Ok(())
        })?;

        let counters = &table.shared.counters;
        counters.num_entries.store(count as u64, Ordering::Relaxed);
        counters.add_load_duration(start.elapsed());

        debug!(
            path = %path.display(),
            entries = count,
            "loaded file content table"
        );
        Ok(table)
    }

    /// [`save`](Self::save) on a blocking worker so async callers are not
    /// stalled behind table I/O.
    pub async fn save_async(&self, path: impl AsRef<Path>) -> Result<()> {
        let table = self.clone();
        let path = path.as_ref().to_path_buf();
        match tokio::task::spawn_blocking(move || table.save(&path)).await {
            Ok(result) => result,
            Err(join_err) => Err(FctError::Io(io::Error::other(join_err))),
        }
    }

    /// [`load_or_create`](Self::load_or_create) on a blocking worker.
    pub async fn load_or_create_async(
        path: impl AsRef<Path>,
        default_ttl: u16,
    ) -> FileContentTable {
        let path = path.as_ref().to_path_buf();
        match tokio::task::spawn_blocking(move || Self::load_or_create(&path, default_ttl)).await {
            Ok(table) => table,
            Err(_) => FileContentTable::new(default_ttl),
        }
    }
}

fn log_load_failure(path: &Path, err: &FctError) {
    match err {
        FctError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no file content table on disk; starting fresh");
        }
        FctError::InvalidFormat(reason) => {
            warn!(
                path = %path.display(),
                reason = %reason,
                "file content table has invalid format; starting fresh"
            );
        }
        FctError::Io(io_err) => {
            warn!(
                path = %path.display(),
                error = %io_err,
                "failed to read file content table; starting fresh"
            );
        }
    }
}

fn encode_entry(buf: &mut [u8; ENTRY_WIRE_LEN], identity: &FileIdentity, entry: &Entry) {
    buf[0..8].copy_from_slice(&identity.volume_id.to_le_bytes());
    buf[8..16].copy_from_slice(&identity.file_id.high.to_le_bytes());
    buf[16..24].copy_from_slice(&identity.file_id.low.to_le_bytes());
    buf[24..32].copy_from_slice(&entry.version.to_le_bytes());
    buf[32..64].copy_from_slice(&entry.hash);
    buf[64..72].copy_from_slice(&entry.length.to_le_bytes());
    buf[72..74].copy_from_slice(&entry.ttl.to_le_bytes());
}

fn decode_entry(buf: &[u8]) -> Result<(FileIdentity, Entry)> {
    let identity = FileIdentity {
        volume_id: u64_at(buf, 0),
        file_id: FileId {
            high: u64_at(buf, 8),
            low: u64_at(buf, 16),
        },
    };
    let version = u64_at(buf, 24);
    let mut hash = [0u8; CONTENT_HASH_LEN];
    hash.copy_from_slice(&buf[32..64]);
    let length = i64_at(buf, 64);
    let ttl = u16_at(buf, 72);
    // Zero is the in-memory pre-eviction sentinel; it is never written.
    if ttl == 0 {
        return Err(FctError::InvalidFormat("entry with zero ttl".into()));
    }
    Ok((
        identity,
        Entry {
            version,
            hash,
            length,
            ttl,
        },
    ))
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn i64_at(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}
