#![forbid(unsafe_code)]
//! Concurrency scenarios: parallel metadata producers over the per-core
//! log, and allocator invariants under churn.

use mfs_harness::{fresh_disk, init_tracing, mount, mount_fresh, read_to_vec};
use mfs_types::{BlockNumber, NodeKind};
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn parallel_creates_fuse_into_one_namespace() {
    init_tracing();
    // 32 files plus root and journal: needs more than the default 16
    // inode slots.
    let disk = fresh_disk(2048, 128);
    let fs = mount(&disk);
    let root = fs.root();

    let mut handles = Vec::new();
    for t in 0..4_u32 {
        let fs = Arc::clone(&fs);
        let root = Arc::clone(&root);
        handles.push(std::thread::spawn(move || {
            for i in 0..8_u32 {
                let name = format!("t{t}_f{i}");
                let f = fs.create(&root, &name, NodeKind::File).expect("create");
                fs.write_file(&f, name.as_bytes(), 0).expect("write");
            }
        }));
    }
    for h in handles {
        h.join().expect("producer");
    }
    fs.sync().expect("sync");

    drop(root);
    drop(fs);
    let fs = mount(&disk);
    let root = fs.root();
    let entries = fs.readdir(&root).expect("readdir");
    assert_eq!(entries.len(), 32);
    for t in 0..4_u32 {
        for i in 0..8_u32 {
            let name = format!("t{t}_f{i}");
            let f = fs.lookup(&root, &name).expect("lookup").expect("present");
            assert_eq!(read_to_vec(&fs, &f), name.as_bytes());
        }
    }
}

#[test]
fn concurrent_fsync_and_writers_serialise_on_the_journal() {
    init_tracing();
    let (_disk, fs) = mount_fresh();
    let root = fs.root();

    let mut handles = Vec::new();
    for t in 0..4_u32 {
        let fs = Arc::clone(&fs);
        let root = Arc::clone(&root);
        handles.push(std::thread::spawn(move || {
            let f = fs
                .create(&root, &format!("w{t}"), NodeKind::File)
                .expect("create");
            for round in 0..4_u32 {
                fs.write_file(&f, &[t as u8; 512], u64::from(round) * 512)
                    .expect("write");
                fs.fsync(&f).expect("fsync");
            }
        }));
    }
    for h in handles {
        h.join().expect("worker");
    }

    for t in 0..4_u32 {
        let f = fs
            .lookup(&root, &format!("w{t}"))
            .expect("lookup")
            .expect("present");
        let body = read_to_vec(&fs, &f);
        assert_eq!(body.len(), 2048);
        assert!(body.iter().all(|b| *b == t as u8));
    }
}

#[test]
fn create_unlink_churn_returns_all_blocks() {
    init_tracing();
    let (_disk, fs) = mount_fresh();
    let root = fs.root();
    let alloc = Arc::clone(fs.store().allocator());
    let free_before = alloc.free_count();

    for round in 0..3_u32 {
        let mut handles = Vec::new();
        for t in 0..4_u32 {
            let fs = Arc::clone(&fs);
            let root = Arc::clone(&root);
            handles.push(std::thread::spawn(move || {
                let name = format!("churn_{round}_{t}");
                let f = fs.create(&root, &name, NodeKind::File).expect("create");
                fs.write_file(&f, &[0x5A; 8192], 0).expect("write");
                fs.fsync(&f).expect("fsync");
                fs.unlink(&root, &name).expect("unlink");
            }));
        }
        for h in handles {
            h.join().expect("worker");
        }
        // Apply the unlinks and the drop-enqueued deletes.
        fs.sync().expect("sync");
    }

    // Every file block went back; only the root directory kept growth is
    // possible, and its data block was preallocated by mkfs.
    assert_eq!(alloc.free_count(), free_before);

    // The dual representation agrees bit for bit.
    let listed: HashSet<BlockNumber> = alloc.freelist_blocks().into_iter().collect();
    assert_eq!(listed.len() as u64, alloc.free_count());
    let (scanned_free, total) = alloc.scan_free();
    assert_eq!(scanned_free, alloc.free_count());
    for bno in 0..total {
        #[allow(clippy::cast_possible_truncation)]
        let bno = BlockNumber(bno as u32);
        assert_eq!(alloc.is_free(bno), listed.contains(&bno));
    }
}

#[test]
fn delete_is_deferred_past_concurrent_readers() {
    init_tracing();
    let (_disk, fs) = mount_fresh();
    let root = fs.root();

    let f = fs.create(&root, "shared", NodeKind::File).expect("create");
    fs.write_file(&f, &[7_u8; 4096], 0).expect("write");
    fs.sync().expect("sync");
    fs.unlink(&root, "shared").expect("unlink");

    let mut handles = Vec::new();
    for _ in 0..4 {
        let fs = Arc::clone(&fs);
        let f = Arc::clone(&f);
        handles.push(std::thread::spawn(move || {
            for _ in 0..16 {
                let body = read_to_vec(&fs, &f);
                assert!(body.iter().all(|b| *b == 7));
            }
        }));
    }
    for h in handles {
        h.join().expect("reader");
    }

    let inum = fs.identity_maps().inum_of(f.id()).expect("mapped");
    drop(f);
    fs.sync().expect("sync delete");
    assert_eq!(fs.store().iget(inum).expect("iget").kind(), None);
}
