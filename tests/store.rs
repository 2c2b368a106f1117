use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tierdb::disk::{level_name, random_uuid, Builder, Metadata};
use tierdb::{Entry, Error, Options, TierDb};

fn test_options(dir: &TempDir) -> Options {
    Options::with_paths(vec![dir.path().to_path_buf()])
}

/// Settings that force a flush on nearly every write and keep the
/// background ticks short enough for tests.
fn tiny_options(dir: &TempDir) -> Options {
    let mut opts = test_options(dir);
    opts.key_capacity = 32;
    opts.val_capacity = 32;
    opts.period = Duration::from_secs(3600);
    opts.compact_tick = Duration::from_millis(10);
    opts.snapshot_tick = Duration::from_millis(2);
    opts.msize = 1024;
    opts.zsize = 1024;
    opts
}

fn wait_for<F: FnMut() -> bool>(mut cond: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_basic_set_get() {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let db = TierDb::open("basic", test_options(&dir)).unwrap();

    db.set(b"a", b"1").unwrap();
    db.set(b"b", b"2").unwrap();

    let entry = db.get(b"a").unwrap().unwrap();
    assert_eq!(entry.value, b"1".to_vec());
    assert!(!entry.deleted);
    let entry = db.get(b"b").unwrap().unwrap();
    assert_eq!(entry.value, b"2".to_vec());
    assert!(db.get(b"c").unwrap().is_none());

    let keys: Vec<Vec<u8>> = db.scan().unwrap().map(|entry| entry.key).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

    // entries that could never land in a leaf block are rejected up front
    assert!(matches!(
        db.set(b"big", &vec![0u8; 10_000]),
        Err(Error::EntryTooLarge)
    ));
    db.close().unwrap();
}

#[test]
fn test_flush_boundary() {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let db = TierDb::open("flushy", tiny_options(&dir)).unwrap();

    for i in 0..10_000u32 {
        db.set(format!("k{:04}", i).as_bytes(), format!("v{}", i).as_bytes())
            .unwrap();
    }
    wait_for(|| !db.disk_levels().is_empty(), "a disk level to appear");

    let entry = db.get(b"k0005").unwrap().unwrap();
    assert_eq!(entry.value, b"v5".to_vec());
    for i in (0..10_000u32).step_by(997) {
        let entry = db.get(format!("k{:04}", i).as_bytes()).unwrap().unwrap();
        assert_eq!(entry.value, format!("v{}", i).into_bytes());
    }

    // every key is somewhere; the merged scan sees each exactly once
    wait_for(
        || db.scan().unwrap().filter(|entry| !entry.deleted).count() == 10_000,
        "all keys to settle",
    );
    db.validate().unwrap();
    db.close().unwrap();
}

#[test]
fn test_tombstone_through_flush() {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let mut opts = tiny_options(&dir);
    opts.dgm = true;
    let db = TierDb::open("dgm", opts).unwrap();

    db.set(b"x", b"1").unwrap();
    db.delete(b"x").unwrap();
    let entry = db.get(b"x").unwrap().unwrap();
    assert!(entry.deleted);

    // push enough data through to carry the tombstone onto disk
    for i in 0..2000u32 {
        db.set(format!("fill{:05}", i).as_bytes(), b"padding").unwrap();
    }
    wait_for(|| !db.disk_levels().is_empty(), "a disk level to appear");

    let entry = db.get(b"x").unwrap().unwrap();
    assert!(entry.deleted, "tombstone must survive the flush");

    db.compact().unwrap();
    let entry = db.get(b"x").unwrap().unwrap();
    assert!(entry.deleted, "tombstone must survive compaction");

    // a new set resurrects the key across tiers
    db.set(b"x", b"2").unwrap();
    let entry = db.get(b"x").unwrap().unwrap();
    assert!(!entry.deleted);
    assert_eq!(entry.value, b"2".to_vec());
    db.close().unwrap();
}

#[test]
fn test_cas() {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let db = TierDb::open("cas", test_options(&dir)).unwrap();

    let (_, cas1) = db.set(b"k", b"v").unwrap();
    let (old, cas2) = db.set_cas(b"k", b"w", cas1).unwrap();
    assert_eq!(old.unwrap().value, b"v".to_vec());
    assert!(cas2 > cas1);

    assert!(matches!(
        db.set_cas(b"k", b"z", cas1),
        Err(Error::InvalidCas)
    ));
    assert_eq!(db.get(b"k").unwrap().unwrap().value, b"w".to_vec());

    // cas 0 means "expect absent"
    assert!(matches!(db.set_cas(b"k", b"z", 0), Err(Error::InvalidCas)));
    db.set_cas(b"fresh", b"1", 0).unwrap();
    db.close().unwrap();
}

#[test]
fn test_delete_semantics_without_dgm() {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let db = TierDb::open("harddel", test_options(&dir)).unwrap();

    assert!(matches!(db.delete(b"missing"), Err(Error::KeyNotFound)));
    db.set(b"k", b"v").unwrap();
    let (old, _) = db.delete(b"k").unwrap();
    assert_eq!(old.unwrap().value, b"v".to_vec());
    assert!(db.get(b"k").unwrap().is_none());
    db.close().unwrap();
}

#[test]
fn test_recovery() {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();

    {
        let db = TierDb::open("recover", tiny_options(&dir)).unwrap();
        for i in 0..1000u32 {
            db.set(format!("key{:04}", i).as_bytes(), format!("val{}", i).as_bytes())
                .unwrap();
        }
        // wait until everything has been flushed out of memory, so close
        // (which keeps no write-ahead log) loses nothing
        wait_for(
            || db.mem_count() == 0 && !db.disk_levels().is_empty(),
            "all keys flushed",
        );
        assert_eq!(db.seqno(), 1000);
        db.close().unwrap();
    }

    let db = TierDb::open("recover", tiny_options(&dir)).unwrap();
    assert!(!db.disk_levels().is_empty());
    // the recovered seqno comes from the newest disk's metadata trailer
    assert_eq!(db.seqno(), 1000);
    for i in 0..1000u32 {
        let entry = db
            .get(format!("key{:04}", i).as_bytes())
            .unwrap()
            .unwrap_or_else(|| panic!("key{:04} lost across recovery", i));
        assert_eq!(entry.value, format!("val{}", i).into_bytes());
    }
    // recovery keeps a single version per level on disk
    let mut seen = std::collections::HashSet::new();
    for dirent in std::fs::read_dir(dir.path()).unwrap() {
        let fname = dirent.unwrap().file_name().into_string().unwrap();
        let parts: Vec<&str> = fname.split('-').collect();
        assert_eq!(parts.len(), 4, "unexpected file {}", fname);
        assert!(seen.insert(parts[1].to_string()), "duplicate level {}", fname);
    }
    db.validate().unwrap();
    db.close().unwrap();
}

#[test]
fn test_adjacent_levels_compact() {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;

    // lay down two adjacent level files, the state recovery would find
    // after an interrupted run; the newer level holds newer versions of
    // the first 400 keys
    for (level, range, seqno_base) in [(15usize, 0..600u32, 0u64), (14usize, 0..400u32, 1000u64)] {
        let name = level_name("adj", level, 1, &random_uuid());
        let mut builder = Builder::new(&name, dir.path(), 1024, 1024).unwrap();
        let entries = range.clone().map(|i| {
            Entry::new(
                format!("key{:04}", i).into_bytes(),
                format!("L{}v{}", level, i).into_bytes(),
                seqno_base + i as u64 + 1,
            )
        });
        builder.build(entries).unwrap();
        builder
            .finish(&Metadata::new(seqno_base + range.end as u64, now))
            .unwrap();
    }

    let mut opts = test_options(&dir);
    opts.compact_tick = Duration::from_millis(10);
    let db = TierDb::open("adj", opts).unwrap();

    // footprint(14)/footprint(15) is far above the default ratio, so the
    // compactor merges the pair into the deepest slot
    wait_for(|| db.disk_levels().len() == 1, "levels to merge");
    let levels = db.disk_levels();
    assert_eq!(levels[0].0, 15);
    assert_eq!(levels[0].1, 2);

    // newer-level records win for overlapping keys
    let entry = db.get(b"key0005").unwrap().unwrap();
    assert_eq!(entry.value, b"L14v5".to_vec());
    let entry = db.get(b"key0500").unwrap().unwrap();
    assert_eq!(entry.value, b"L15v500".to_vec());
    assert_eq!(db.scan().unwrap().count(), 600);
    db.close().unwrap();
}

#[test]
fn test_close_idempotent() {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let db = TierDb::open("closer", test_options(&dir)).unwrap();
    db.set(b"a", b"1").unwrap();
    db.close().unwrap();
    db.close().unwrap();
    assert!(matches!(db.get(b"a"), Err(Error::Closed)));
    assert!(matches!(db.set(b"a", b"2"), Err(Error::Closed)));
}

#[test]
fn test_destroy_removes_files() {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let db = TierDb::open("gone", tiny_options(&dir)).unwrap();
    for i in 0..500u32 {
        db.set(format!("key{:03}", i).as_bytes(), b"some value").unwrap();
    }
    wait_for(|| !db.disk_levels().is_empty(), "a disk level to appear");
    db.destroy().unwrap();

    let leftovers: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter_map(|dirent| dirent.file_name().into_string().ok())
        .filter(|fname| fname.starts_with("gone-"))
        .collect();
    assert!(leftovers.is_empty(), "files left behind: {:?}", leftovers);
}

#[test]
fn test_concurrent_readers_and_writers() {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let db = std::sync::Arc::new(TierDb::open("concurrent", tiny_options(&dir)).unwrap());

    let writer = {
        let db = db.clone();
        std::thread::spawn(move || {
            for i in 0..5000u32 {
                db.set(format!("key{:05}", i).as_bytes(), format!("val{}", i).as_bytes())
                    .unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let db = db.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    if let Some(entry) = db.get(b"key00000").unwrap() {
                        assert_eq!(entry.value, b"val0".to_vec());
                    }
                    let mut last: Option<Vec<u8>> = None;
                    for entry in db.scan().unwrap().take(100) {
                        if let Some(last) = &last {
                            assert!(entry.key > *last, "scan must stay sorted");
                        }
                        last = Some(entry.key);
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    wait_for(
        || db.scan().unwrap().filter(|e| !e.deleted).count() == 5000,
        "all writes visible",
    );
    db.validate().unwrap();
    db.close().unwrap();
}
