use super::*;
use pretty_hex::PrettyHex;
use std::time::{Duration, Instant};
use tracing::debug_span;

#[static_init::dynamic]
static INIT_LOGGER: () = {
    use tracing_subscriber::fmt::format::FmtSpan;

    tracing_subscriber::fmt::fmt()
        .compact()
        .with_max_level(tracing_subscriber::filter::LevelFilter::TRACE)
        .with_level(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
        .with_test_writer()
        .without_time()
        .with_ansi(false)
        .init();
};

fn options(dir: &Path) -> DiskDataStoreOptions {
    DiskDataStoreOptions {
        application_name: "test".to_string(),
        store_folder: dir.to_path_buf(),
        max_size_per_session: 1000,
        file_channel_pool_capacity: 4,
    }
}

#[track_caller]
fn assert_page(store: &dyn DataStore, session_id: &str, page_id: u32, expected: &[u8]) {
    let Some(actual) = store.get_data(session_id, page_id) else {
        panic!("page {page_id} of session {session_id} is missing");
    };
    if actual != expected {
        panic!(
            "page {page_id} of session {session_id} has the wrong contents.\nexpected:\n{:?}\nactual:\n{:?}",
            expected.hex_dump(),
            actual.hex_dump()
        );
    }
}

/// Generates page contents that differ for every (page, version).
fn page_bytes(page_id: u32, version: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (page_id as usize * 31 + version as usize * 7 + i) as u8)
        .collect()
}

#[test]
fn store_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();

    store.store_data("s1", 1, b"hello");
    store.store_data("s1", 2, b"world");
    assert_page(&store, "s1", 1, b"hello");
    assert_page(&store, "s1", 2, b"world");

    assert!(store.get_data("s1", 3).is_none());
    assert!(store.get_data("nobody", 1).is_none());

    // Reading never creates a session.
    assert_eq!(store.session_ids(), ["s1"]);
    assert!(store.folder().session_data_file("s1").exists());
}

#[test]
fn empty_data_reads_back_as_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();

    store.store_data("s1", 1, b"");
    assert!(store.get_data("s1", 1).is_none());
    assert!(store.session_ids().is_empty());
    assert!(!store.folder().session_folder("s1").exists());
}

#[test]
fn restore_returns_newest_contents() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();

    store.store_data("s1", 7, &page_bytes(7, 0, 100));
    store.store_data("s1", 7, &page_bytes(7, 1, 50));
    store.store_data("s1", 7, &page_bytes(7, 2, 200));
    assert_page(&store, "s1", 7, &page_bytes(7, 2, 200));

    let entry = store.session_entry("s1").unwrap();
    assert_eq!(entry.num_pages(), 1);
    entry.check_invariants().unwrap();
}

#[test]
fn oldest_page_is_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(DiskDataStoreOptions {
        max_size_per_session: 100,
        ..options(dir.path())
    })
    .unwrap();

    store.store_data("s1", 1, &[1; 60]);
    store.store_data("s1", 2, &[2; 60]);

    assert!(store.get_data("s1", 1).is_none());
    assert_page(&store, "s1", 2, &[2; 60]);
}

#[test]
fn budget_holds_over_many_stores() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();

    for i in 0..200u32 {
        let _span = debug_span!("store", i).entered();
        let page_id = i % 17;
        let len = 20 + (i as usize * 37) % 180;
        store.store_data("s1", page_id, &page_bytes(page_id, i, len));

        let entry = store.session_entry("s1").unwrap();
        entry.check_invariants().unwrap();
        let snapshot = entry.snapshot().unwrap();
        let total: u64 = snapshot
            .windows
            .iter()
            .map(|w| w.file_part_size as u64)
            .sum();
        assert!(total <= store.max_size_per_session());

        // The page just stored is always readable.
        assert_page(&store, "s1", page_id, &page_bytes(page_id, i, len));
    }
}

#[test]
fn remove_data() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();

    store.store_data("s1", 1, b"one");
    store.store_data("s1", 2, b"two");
    store.remove_data("s1", 1);
    store.remove_data("s1", 99);
    store.remove_data("nobody", 1);

    assert!(store.get_data("s1", 1).is_none());
    assert_page(&store, "s1", 2, b"two");
}

#[test]
fn remove_session_is_total() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();

    store.store_data("s1", 1, b"one");
    store.store_data("s2", 1, b"other");
    let entry = store.session_entry("s1").unwrap();
    let data_file = store.folder().session_data_file("s1");
    assert!(data_file.exists());

    store.remove_session("s1");

    assert!(store.get_data("s1", 1).is_none());
    assert!(!data_file.exists());
    assert!(!store.folder().session_folder("s1").exists());
    assert!(!store.file_channel_pool().is_open(&data_file));
    assert_page(&store, "s2", 1, b"other");

    // A reference obtained before the removal sees nothing and writes nothing.
    entry.save_page(store.file_channel_pool(), 2, b"late");
    assert!(!data_file.exists());

    // The session id can be used again.
    store.store_data("s1", 1, b"new");
    assert_page(&store, "s1", 1, b"new");
}

#[test]
fn remove_session_does_not_stall_other_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();
    store.store_data("b", 1, b"bee");

    // A file where the folder of "a" should be makes the first store of "a" retry for a while,
    // holding the entry of "a" locked.
    let blocker = store.folder().session_folder("a");
    std::fs::write(&blocker, b"").unwrap();

    std::thread::scope(|scope| {
        let store = &store;
        let writer = scope.spawn(move || store.store_data("a", 1, b"aye"));
        while store.session_entry("a").is_none() {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));

        let remover = scope.spawn(move || store.remove_session("a"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished());

        let start = Instant::now();
        assert_page(store, "b", 1, b"bee");
        store.store_data("b", 2, b"buzz");
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(150),
            "session b waited {elapsed:?} for the removal of session a"
        );

        writer.join().unwrap();
        remover.join().unwrap();
    });

    assert_eq!(store.session_ids(), ["b"]);
    assert!(store.get_data("a", 1).is_none());
    assert_page(&store, "b", 2, b"buzz");
}

#[test]
fn store_during_removal_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();

    store.store_data("s1", 1, b"one");
    let entry = store.session_entry("s1").unwrap();

    // While the removal runs, the unbound entry is still the one that stores find.
    entry.unbind(store.file_channel_pool());
    store.store_data("s1", 2, b"two");
    assert!(store.get_data("s1", 2).is_none());
    assert!(!store.folder().session_folder("s1").exists());

    // Finishing the removal takes the unbound entry out of the map.
    store.remove_session("s1");
    assert!(store.session_ids().is_empty());

    store.store_data("s1", 3, b"three");
    assert_page(&store, "s1", 3, b"three");
    assert!(!Arc::ptr_eq(&entry, &store.session_entry("s1").unwrap()));
}

#[test]
fn session_folder_that_cannot_be_created() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();

    let blocker = store.folder().session_folder("s1");
    std::fs::write(&blocker, b"not a folder").unwrap();

    store.store_data("s1", 1, b"lost");
    assert!(store.get_data("s1", 1).is_none());
    let entry = store.session_entry("s1").unwrap();
    assert_eq!(entry.num_pages(), 0);
    assert!(entry.page_window(1).is_none());
    assert_eq!(std::fs::read(&blocker).unwrap(), b"not a folder");

    // Once the folder can be created, the next store creates it.
    std::fs::remove_file(&blocker).unwrap();
    store.store_data("s1", 1, b"kept");
    assert_page(&store, "s1", 1, b"kept");
    assert!(store.folder().session_data_file("s1").is_file());
    entry.check_invariants().unwrap();
}

#[test]
fn index_is_reloaded_and_deleted() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = DiskDataStore::new(options(dir.path())).unwrap();
        store.store_data("s1", 1, b"one");
        store.store_data("s1", 2, b"two");
        store.store_data("s2", 9, b"nine");
        store.store_data("gone", 1, b"removed");
        store.remove_session("gone");
        store.destroy();
        assert!(store.folder().index_file().exists());
    }

    let store = DiskDataStore::new(options(dir.path())).unwrap();
    assert!(!store.folder().index_file().exists());
    assert_eq!(store.session_ids(), ["s1", "s2"]);
    assert_page(&store, "s1", 1, b"one");
    assert_page(&store, "s1", 2, b"two");
    assert_page(&store, "s2", 9, b"nine");
    assert!(store.get_data("gone", 1).is_none());

    // New writes reuse the restored window tables.
    store.store_data("s1", 3, b"three");
    assert_page(&store, "s1", 1, b"one");
    assert_page(&store, "s1", 3, b"three");
    store.session_entry("s1").unwrap().check_invariants().unwrap();
}

#[test]
fn corrupt_index_is_ignored_and_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let folder = StoreFolder::new(dir.path(), "test");
    std::fs::create_dir_all(folder.root()).unwrap();
    std::fs::write(folder.index_file(), b"this is not an index").unwrap();

    let store = DiskDataStore::new(options(dir.path())).unwrap();
    assert!(store.session_ids().is_empty());
    assert!(!folder.index_file().exists());
}

#[test]
fn empty_index_file_is_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let folder = StoreFolder::new(dir.path(), "test");
    std::fs::create_dir_all(folder.root()).unwrap();
    std::fs::write(folder.index_file(), b"").unwrap();

    let store = DiskDataStore::new(options(dir.path())).unwrap();
    assert!(store.session_ids().is_empty());
    assert!(!folder.index_file().exists());
}

#[test]
fn destroy_without_sessions_writes_no_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();
    store.destroy();
    assert!(!store.folder().index_file().exists());
}

#[test]
fn store_folder_layout() {
    let folder = StoreFolder::new(Path::new("/srv/pages"), "shop");
    assert_eq!(folder.root(), Path::new("/srv/pages/shop-filestore"));
    assert_eq!(
        folder.index_file(),
        Path::new("/srv/pages/shop-filestore/PageStoreIndex")
    );
    assert_eq!(
        folder.session_data_file("node1:AB/C*D"),
        Path::new("/srv/pages/shop-filestore/node1_AB_C_D/data")
    );
}

#[test]
fn sanitize_session_ids() {
    assert_eq!(sanitize_session_id("ABC123"), "ABC123");
    assert_eq!(sanitize_session_id("a*b/c:d\\e"), "a_b_c_d_e");
    assert_eq!(sanitize_session_id(".."), "__");
    assert_eq!(sanitize_session_id("."), "_");
    assert_eq!(sanitize_session_id(""), "_");
    assert_eq!(sanitize_session_id("a.b"), "a.b");
}

#[test]
fn store_folder_cannot_be_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();

    let result = DiskDataStore::new(DiskDataStoreOptions {
        store_folder: blocker,
        ..options(dir.path())
    });
    assert!(result.is_err());
}

#[cfg(unix)]
#[test]
fn store_folder_permission_denied() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let read_only = dir.path().join("read-only");
    std::fs::create_dir(&read_only).unwrap();
    std::fs::set_permissions(&read_only, std::fs::Permissions::from_mode(0o500)).unwrap();

    // Permissions do not apply to root.
    if std::fs::create_dir(read_only.join("writable")).is_ok() {
        println!("folder permissions are not enforced; skipping");
        return;
    }

    let result = DiskDataStore::new(DiskDataStoreOptions {
        store_folder: read_only.clone(),
        ..options(dir.path())
    });
    std::fs::set_permissions(&read_only, std::fs::Permissions::from_mode(0o700)).unwrap();

    let Err(e) = result else {
        panic!("the store was created in a read-only folder");
    };
    let message = format!("{e:#}");
    assert!(message.contains("permission denied"), "{message}");
    assert!(message.contains("`store_folder`"), "{message}");
    assert!(message.contains("`MemoryDataStore`"), "{message}");
}

#[test]
fn session_ids_that_share_a_folder() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();

    store.store_data("a:b", 1, b"colon");
    let folder = store.folder().session_folder("a_b");
    assert_eq!(folder, store.folder().session_folder("a:b"));

    {
        let sessions = store.lock_sessions();
        assert_eq!(session_sharing_folder(&sessions, "a_b", &folder), Some("a:b"));
        assert_eq!(session_sharing_folder(&sessions, "a:b", &folder), None);
        assert_eq!(
            session_sharing_folder(&sessions, "c", &store.folder().session_folder("c")),
            None
        );
    }

    // The second session is still created; a warning names both.
    store.store_data("a_b", 1, b"underscore");
    assert_eq!(store.session_ids(), ["a:b", "a_b"]);
    assert_page(&store, "a_b", 1, b"underscore");
}

#[test]
fn pool_stays_within_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(options(dir.path())).unwrap();
    let capacity = store.file_channel_pool().capacity();

    for i in 0..20u32 {
        store.store_data(&format!("session{i}"), 1, &page_bytes(1, i, 10));
        assert!(store.file_channel_pool().num_open_files() <= capacity);
    }

    for i in 0..20u32 {
        assert_page(&store, &format!("session{i}"), 1, &page_bytes(1, i, 10));
        assert!(store.file_channel_pool().num_open_files() <= capacity);
    }
}

#[test]
fn concurrent_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(DiskDataStoreOptions {
        max_size_per_session: 100_000,
        ..options(dir.path())
    })
    .unwrap();

    std::thread::scope(|scope| {
        for t in 0..8u32 {
            let store = &store;
            scope.spawn(move || {
                let session_id = format!("session{t}");
                for round in 0..20u32 {
                    for page_id in 0..5u32 {
                        let data = page_bytes(page_id + t * 100, round, 50 + page_id as usize);
                        store.store_data(&session_id, page_id, &data);
                        assert_page(store, &session_id, page_id, &data);
                    }
                }
            });
        }
    });

    for t in 0..8u32 {
        let session_id = format!("session{t}");
        for page_id in 0..5u32 {
            let data = page_bytes(page_id + t * 100, 19, 50 + page_id as usize);
            assert_page(&store, &session_id, page_id, &data);
        }
        store
            .session_entry(&session_id)
            .unwrap()
            .check_invariants()
            .unwrap();
    }
}

#[test]
fn concurrent_writers_in_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskDataStore::new(DiskDataStoreOptions {
        max_size_per_session: 100_000,
        ..options(dir.path())
    })
    .unwrap();

    // Each thread owns a distinct set of page ids within the same session.
    std::thread::scope(|scope| {
        for t in 0..4u32 {
            let store = &store;
            scope.spawn(move || {
                for round in 0..10u32 {
                    for k in 0..3u32 {
                        let page_id = t * 10 + k;
                        store.store_data("shared", page_id, &page_bytes(page_id, round, 40));
                    }
                }
            });
        }
    });

    let entry = store.session_entry("shared").unwrap();
    entry.check_invariants().unwrap();
    assert_eq!(entry.num_pages(), 12);
    for t in 0..4u32 {
        for k in 0..3u32 {
            let page_id = t * 10 + k;
            assert_page(&store, "shared", page_id, &page_bytes(page_id, 9, 40));
        }
    }
}

#[test]
fn memory_store_has_the_same_contract() {
    let store = MemoryDataStore::new(3);
    store.store_data("s1", 1, b"one");
    store.store_data("s1", 1, b"uno");
    store.store_data("s1", 2, b"");
    assert_page(&store, "s1", 1, b"uno");
    assert!(store.get_data("s1", 2).is_none());

    store.remove_session("s1");
    assert!(store.get_data("s1", 1).is_none());
}
