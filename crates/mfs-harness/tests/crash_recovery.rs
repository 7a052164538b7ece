#![forbid(unsafe_code)]
//! Crash-consistency scenarios: power loss is dropping the mounted
//! filesystem (losing every volatile cache) and re-mounting the device.

use mfs_core::dev;
use mfs_harness::{init_tracing, mount, mount_fresh, read_to_vec};
use mfs_types::NodeKind;

#[test]
fn create_write_fsync_survives_crash() {
    init_tracing();
    let (disk, fs) = mount_fresh();
    let root = fs.root();

    let a = fs.create(&root, "a", NodeKind::File).expect("create");
    fs.write_file(&a, b"hello", 0).expect("write");
    fs.fsync(&a).expect("fsync");

    // Power loss.
    drop((root, a));
    drop(fs);

    let fs = mount(&disk);
    let root = fs.root();
    let a = fs.lookup(&root, "a").expect("lookup").expect("a exists");
    let body = read_to_vec(&fs, &a);
    assert_eq!(body, b"hello");
    assert_eq!(a.size(), 5);
}

#[test]
fn unfsynced_data_is_lost_on_crash() {
    init_tracing();
    let (disk, fs) = mount_fresh();
    let root = fs.root();
    let a = fs.create(&root, "a", NodeKind::File).expect("create");
    fs.write_file(&a, b"volatile", 0).expect("write");
    // No fsync, no sync.

    drop((root, a));
    drop(fs);
    let fs = mount(&disk);
    let root = fs.root();
    assert!(fs.lookup(&root, "a").expect("lookup").is_none());
}

#[test]
fn fsync_flushes_dependency_closure_only() {
    init_tracing();
    let (disk, fs) = mount_fresh();
    let root = fs.root();

    let d = fs.create(&root, "d", NodeKind::Dir).expect("d");
    let f = fs.create(&d, "f", NodeKind::File).expect("f");
    fs.write_file(&f, b"deep", 0).expect("write");
    // A sibling created concurrently but never fsynced.
    let _e = fs.create(&root, "e", NodeKind::File).expect("e");

    fs.fsync(&f).expect("fsync f");

    drop((root, d, f, _e));
    drop(fs);
    let fs = mount(&disk);
    let root = fs.root();

    // The closure pulled f's create and, transitively, d's create.
    let d = fs.lookup(&root, "d").expect("lookup").expect("d exists");
    let f = fs.lookup(&d, "f").expect("lookup").expect("f exists");
    assert_eq!(read_to_vec(&fs, &f), b"deep");
    // The sibling's create was outside the closure.
    assert!(fs.lookup(&root, "e").expect("lookup").is_none());
}

#[test]
fn fsync_of_directory_persists_its_entries() {
    init_tracing();
    let (disk, fs) = mount_fresh();
    let root = fs.root();

    let d = fs.create(&root, "d", NodeKind::Dir).expect("d");
    fs.create(&d, "one", NodeKind::File).expect("one");
    fs.create(&d, "two", NodeKind::File).expect("two");
    fs.fsync(&d).expect("fsync dir");

    drop(root);
    drop(d);
    drop(fs);
    let fs = mount(&disk);
    let root = fs.root();
    let d = fs.lookup(&root, "d").expect("lookup").expect("d");
    let mut names: Vec<String> = fs
        .readdir(&d)
        .expect("readdir")
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    names.sort();
    assert_eq!(names, vec!["one", "two"]);
}

#[test]
fn unlink_while_open_defers_inode_reclaim() {
    init_tracing();
    let (disk, fs) = mount_fresh();
    let root = fs.root();

    let a = fs.create(&root, "a", NodeKind::File).expect("create");
    fs.write_file(&a, b"still here", 0).expect("write");
    fs.sync().expect("sync");
    let inum = fs.identity_maps().inum_of(a.id()).expect("mapped");

    fs.unlink(&root, "a").expect("unlink");
    // The descriptor is still open: contents remain readable.
    assert_eq!(read_to_vec(&fs, &a), b"still here");
    // The on-disk inode still exists; only the name is gone.
    fs.sync().expect("sync unlink");
    assert!(fs.store().iget(inum).expect("iget").kind().is_some());

    // Last close enqueues the deferred delete; the next sync applies it.
    drop(a);
    fs.sync().expect("sync delete");
    assert_eq!(fs.store().iget(inum).expect("iget").kind(), None);

    drop(root);
    drop(fs);
    let fs = mount(&disk);
    let root = fs.root();
    assert!(fs.lookup(&root, "a").expect("lookup").is_none());
    assert_eq!(fs.store().iget(inum).expect("iget").kind(), None);
}

#[test]
fn recovery_after_caches_dropped_midstream() {
    init_tracing();
    let (disk, fs) = mount_fresh();
    let root = fs.root();

    // A mix of flushed and unflushed state, with cache eviction in the
    // middle to force demand paging on the survivors.
    let keep = fs.create(&root, "keep", NodeKind::File).expect("keep");
    fs.write_file(&keep, b"first", 0).expect("write");
    fs.sync().expect("sync");
    dev::evict_caches(&fs, b"1");
    dev::evict_caches(&fs, b"2");

    fs.write_file(&keep, b"FIRST", 0).expect("overwrite");
    let _lost = fs.create(&root, "lost", NodeKind::File).expect("lost");

    drop((root, keep, _lost));
    drop(fs);
    let fs = mount(&disk);
    let root = fs.root();
    let keep = fs.lookup(&root, "keep").expect("lookup").expect("keep");
    // The overwrite never synced; the first version survived.
    assert_eq!(read_to_vec(&fs, &keep), b"first");
    assert!(fs.lookup(&root, "lost").expect("lookup").is_none());
}

#[test]
fn identity_maps_stay_consistent() {
    init_tracing();
    let (_disk, fs) = mount_fresh();
    let root = fs.root();

    let d = fs.create(&root, "d", NodeKind::Dir).expect("d");
    let f = fs.create(&d, "f", NodeKind::File).expect("f");
    assert!(fs.identity_maps().is_consistent(f.id()));
    fs.sync().expect("sync");
    assert!(fs.identity_maps().is_consistent(f.id()));
    assert!(fs.identity_maps().is_consistent(d.id()));

    // Unlink opens the documented delete window; once the last reference
    // drops and the delete is applied, both maps forget the mnode.
    let f_id = f.id();
    fs.unlink(&d, "f").expect("unlink");
    drop(f);
    fs.sync().expect("sync");
    assert!(fs.identity_maps().inum_of(f_id).is_none());
    assert!(fs.identity_maps().is_consistent(f_id));
}
