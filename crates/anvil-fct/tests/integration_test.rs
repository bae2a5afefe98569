//! End-to-end scenarios for the file content table: record/probe flows
//! against real files, persistence round-trips, TTL decay across
//! generations, journal-driven removal, and on-disk corruption safety.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anvil_fct::{
    ChangedFileIdInfo, ContentHash, FileContentTable, LinkImpact, DEFAULT_TTL,
};

fn hash_of(data: &[u8]) -> ContentHash {
    *blake3::hash(data).as_bytes()
}

/// Advance a file's mtime well past coarse-clock granularity so an
/// external mutation is unambiguous to the version derivation.
fn bump_mtime(path: &Path, seconds_ahead: i64) {
    let later = filetime::FileTime::from_unix_time(
        filetime::FileTime::now().unix_seconds() + seconds_ahead,
        0,
    );
    filetime::set_file_mtime(path, later).unwrap();
}

fn record_path(table: &FileContentTable, path: &Path, data: &[u8]) -> anvil_fct::VersionedFileIdentity {
    let handle = File::open(path).unwrap();
    table.record(path, &handle, hash_of(data), data.len() as i64, None)
}

#[test]
fn test_record_then_probe_after_reopen() {
    let temp = tempfile::TempDir::new().unwrap();
    let file = temp.path().join("F");
    fs::write(&file, b"hello").unwrap();

    let table = FileContentTable::new(DEFAULT_TTL);
    let recorded = record_path(&table, &file, b"hello");
    assert!(!recorded.identity.is_anonymous());

    let reopened = File::open(&file).unwrap();
    let hit = table.probe(&file, &reopened).expect("hit after reopen");
    assert_eq!(hit.identity.version, recorded.version);
    assert_eq!(hit.hash, hash_of(b"hello"));
    assert_eq!(hit.length, 5);
}

#[test]
fn test_content_change_misses() {
    let temp = tempfile::TempDir::new().unwrap();
    let file = temp.path().join("F");
    fs::write(&file, b"hello").unwrap();

    let table = FileContentTable::new(DEFAULT_TTL);
    record_path(&table, &file, b"hello");

    let mut writer = fs::OpenOptions::new().write(true).open(&file).unwrap();
    writer.write_all(b"helloX").unwrap();
    drop(writer);
    bump_mtime(&file, 2);

    assert!(table.probe(&file, &File::open(&file).unwrap()).is_none());
}

#[test]
fn test_rename_preserves_hit() {
    let temp = tempfile::TempDir::new().unwrap();
    let f = temp.path().join("F");
    let g = temp.path().join("G");
    fs::write(&f, b"hello").unwrap();

    let table = FileContentTable::new(DEFAULT_TTL);
    let recorded = record_path(&table, &f, b"hello");

    fs::rename(&f, &g).unwrap();
    let hit = table
        .probe(&g, &File::open(&g).unwrap())
        .expect("rename keeps the identity");
    assert_eq!(hit.identity.version, recorded.version);
    assert_eq!(hit.hash, hash_of(b"hello"));
}

#[test]
fn test_delete_and_recreate_misses() {
    let temp = tempfile::TempDir::new().unwrap();
    let file = temp.path().join("F");
    fs::write(&file, b"hello").unwrap();

    let table = FileContentTable::new(DEFAULT_TTL);
    // Hold the original handle so the inode cannot be recycled.
    let original = File::open(&file).unwrap();
    record_path(&table, &file, b"hello");

    fs::remove_file(&file).unwrap();
    fs::write(&file, b"hello").unwrap();

    assert!(table.probe(&file, &File::open(&file).unwrap()).is_none());
    drop(original);
}

#[test]
fn test_ttl_eviction_over_round_trips() {
    let temp = tempfile::TempDir::new().unwrap();
    let file = temp.path().join("F");
    let table_path = temp.path().join("fct.bin");
    fs::write(&file, b"hello").unwrap();

    let mut table = FileContentTable::new(2);
    record_path(&table, &file, b"hello");

    for _ in 0..4 {
        table.save(&table_path).unwrap();
        table = FileContentTable::load(&table_path, 2).expect("intermediate loads succeed");
    }

    assert!(table.is_empty());
    assert!(table.probe(&file, &File::open(&file).unwrap()).is_none());
}

#[test]
fn test_concurrent_records_converge_on_highest_version() {
    let temp = tempfile::TempDir::new().unwrap();
    let file = temp.path().join("F");
    fs::write(&file, b"hello").unwrap();

    let table = FileContentTable::new(DEFAULT_TTL);
    let mut versions = Vec::new();
    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let table = table.clone();
                let file = file.clone();
                scope.spawn(move || record_path(&table, &file, b"hello").version)
            })
            .collect();
        for worker in workers {
            versions.push(worker.join().unwrap());
        }
    });

    let highest = versions.iter().copied().max().unwrap();
    let hit = table
        .probe(&file, &File::open(&file).unwrap())
        .expect("table still answers after the race");
    assert_eq!(hit.identity.version, highest);
}

#[test]
fn test_round_trip_preserves_probe_answers() {
    let temp = tempfile::TempDir::new().unwrap();
    let table_path = temp.path().join("fct.bin");
    let table = FileContentTable::new(DEFAULT_TTL);

    let mut files = Vec::new();
    for i in 0..8 {
        let path = temp.path().join(format!("f{}.txt", i));
        let data = format!("file number {}", i).into_bytes();
        fs::write(&path, &data).unwrap();
        record_path(&table, &path, &data);
        files.push((path, data));
    }

    table.save(&table_path).unwrap();
    let loaded = FileContentTable::load(&table_path, DEFAULT_TTL).expect("clean load");
    assert_eq!(loaded.len(), files.len());

    for (path, data) in &files {
        let before = table.probe(path, &File::open(path).unwrap());
        let after = loaded.probe(path, &File::open(path).unwrap());
        assert_eq!(before, after, "probe answers must match for {:?}", path);
        assert_eq!(after.unwrap().hash, hash_of(data));
    }
}

#[test]
fn test_hit_resets_ttl_across_generations() {
    let temp = tempfile::TempDir::new().unwrap();
    let file = temp.path().join("F");
    let table_path = temp.path().join("fct.bin");
    fs::write(&file, b"hello").unwrap();

    let table = FileContentTable::new(3);
    record_path(&table, &file, b"hello");

    // One round-trip ages the entry, a probe restores it to full TTL, so
    // it survives another three round-trips.
    table.save(&table_path).unwrap();
    let table = FileContentTable::load(&table_path, 3).unwrap();
    table
        .probe(&file, &File::open(&file).unwrap())
        .expect("still live after one generation");

    let mut aged = table;
    for _ in 0..3 {
        aged.save(&table_path).unwrap();
        aged = FileContentTable::load(&table_path, 3).unwrap();
    }
    assert_eq!(aged.len(), 1, "refreshed entry survives default_ttl generations");
}

#[test]
fn test_observer_removal_survives_round_trip() {
    let temp = tempfile::TempDir::new().unwrap();
    let file = temp.path().join("F");
    let table_path = temp.path().join("fct.bin");
    fs::write(&file, b"hello").unwrap();

    let table = FileContentTable::new(DEFAULT_TTL);
    let recorded = record_path(&table, &file, b"hello");

    let mut observer = table.observer_interface();
    observer.begin_scan();
    observer.on_change(&ChangedFileIdInfo {
        identity: recorded.identity,
        last_tracked_version: recorded.version,
        version: recorded.version + 1,
        link_impact: LinkImpact::AllLinks,
    });
    observer.end_scan();

    assert!(table.probe(&file, &File::open(&file).unwrap()).is_none());

    table.save(&table_path).unwrap();
    let reloaded = FileContentTable::load(&table_path, DEFAULT_TTL).unwrap();
    assert!(reloaded.is_empty(), "no stale entry after save/load");
}

#[test]
fn test_stub_end_to_end() {
    let temp = tempfile::TempDir::new().unwrap();
    let file = temp.path().join("F");
    let table_path = temp.path().join("fct.bin");
    fs::write(&file, b"hello").unwrap();

    let stub = FileContentTable::stub();
    let recorded = record_path(&stub, &file, b"hello");
    assert!(recorded.identity.is_anonymous());
    assert!(stub.probe(&file, &File::open(&file).unwrap()).is_none());

    stub.save(&table_path).unwrap();
    let loaded = FileContentTable::load(&table_path, DEFAULT_TTL).unwrap();
    assert!(loaded.is_empty());
    assert!(!loaded.is_stub());
}

/// Flip every byte of a saved table one at a time; each mutation must be
/// rejected wholesale. The format has no padding, so no offset is exempt.
#[test]
fn test_any_single_byte_corruption_fails_load() {
    let temp = tempfile::TempDir::new().unwrap();
    let table_path = temp.path().join("fct.bin");
    let table = FileContentTable::new(DEFAULT_TTL);

    for i in 0..2 {
        let path = temp.path().join(format!("f{}.txt", i));
        let data = format!("corruption target {}", i).into_bytes();
        fs::write(&path, &data).unwrap();
        record_path(&table, &path, &data);
    }
    table.save(&table_path).unwrap();

    let pristine = fs::read(&table_path).unwrap();
    let corrupt_path = temp.path().join("corrupt.bin");
    for offset in 0..pristine.len() {
        let mut mutated = pristine.clone();
        mutated[offset] ^= 0x01;
        fs::write(&corrupt_path, &mutated).unwrap();
        assert!(
            FileContentTable::load(&corrupt_path, DEFAULT_TTL).is_none(),
            "byte flip at offset {} must invalidate the table",
            offset
        );
    }

    // The pristine bytes still load.
    fs::write(&corrupt_path, &pristine).unwrap();
    assert!(FileContentTable::load(&corrupt_path, DEFAULT_TTL).is_some());
}

#[test]
fn test_create_from_matches_disk_round_trip() {
    let temp = tempfile::TempDir::new().unwrap();
    let file = temp.path().join("F");
    let table_path = temp.path().join("fct.bin");
    fs::write(&file, b"hello").unwrap();

    let table = FileContentTable::new(5);
    record_path(&table, &file, b"hello");

    table.save(&table_path).unwrap();
    let via_disk = FileContentTable::load(&table_path, 5).unwrap();
    let via_copy = FileContentTable::create_from(&table, None);

    let disk_hit = via_disk.probe(&file, &File::open(&file).unwrap());
    let copy_hit = via_copy.probe(&file, &File::open(&file).unwrap());
    assert_eq!(disk_hit, copy_hit);
}

#[test]
fn test_probe_counts_hits_and_misses() {
    let temp = tempfile::TempDir::new().unwrap();
    let known = temp.path().join("known.txt");
    let unknown = temp.path().join("unknown.txt");
    fs::write(&known, b"known").unwrap();
    fs::write(&unknown, b"unknown").unwrap();

    let table = FileContentTable::new(DEFAULT_TTL);
    record_path(&table, &known, b"known");

    table.probe(&known, &File::open(&known).unwrap()).unwrap();
    assert!(table.probe(&unknown, &File::open(&unknown).unwrap()).is_none());

    let snapshot = table.counters().snapshot();
    assert_eq!(snapshot.num_hit, 1);
    assert_eq!(snapshot.num_file_id_mismatch, 1);
}

#[test]
fn test_strict_record_flushes_writable_handle() {
    let temp = tempfile::TempDir::new().unwrap();
    let file = temp.path().join("F");
    let mut handle = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(&file)
        .unwrap();
    handle.write_all(b"written through handle").unwrap();

    let table = FileContentTable::new(DEFAULT_TTL);
    // strict defaults to true for a writable handle; the record must land.
    let recorded = table.record(
        &file,
        &handle,
        hash_of(b"written through handle"),
        22,
        None,
    );
    assert!(!recorded.identity.is_anonymous());
    drop(handle);

    let hit = table
        .probe(&file, &File::open(&file).unwrap())
        .expect("record through a writable handle is probeable");
    assert_eq!(hit.length, 22);
}

fn path_map_for(table_dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| table_dir.join(format!("v{}.txt", i)))
        .collect()
}

#[test]
fn test_visitor_sees_recorded_files() {
    use anvil_fct::{HandleAccessor, ShareMode};
    use std::collections::HashMap;
    use std::io;

    struct Accessor(HashMap<anvil_fct::FileIdentity, PathBuf>);
    impl HandleAccessor for Accessor {
        fn open_by_identity(
            &self,
            identity: &anvil_fct::FileIdentity,
            _share: ShareMode,
        ) -> io::Result<(File, PathBuf)> {
            let path = self
                .0
                .get(identity)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
            Ok((File::open(path)?, path.clone()))
        }
    }

    let temp = tempfile::TempDir::new().unwrap();
    let table = FileContentTable::new(DEFAULT_TTL);
    let mut paths = HashMap::new();
    for path in path_map_for(temp.path(), 3) {
        let data = path.file_name().unwrap().to_string_lossy().into_owned();
        fs::write(&path, data.as_bytes()).unwrap();
        let recorded = record_path(&table, &path, data.as_bytes());
        paths.insert(recorded.identity, path);
    }

    let mut visited = 0;
    table.visit(&Accessor(paths), ShareMode::ReadOnly, |_, _, path, _, hash| {
        let data = fs::read(path).unwrap();
        assert_eq!(*hash, hash_of(&data));
        visited += 1;
        true
    });
    assert_eq!(visited, 3);
}
