#![forbid(unsafe_code)]
//! The same image and mount path over a real file-backed device.

use mfs_block::{BlockDevice, FileDisk};
use mfs_core::{MfsConfig, MfsInterface};
use mfs_harness::{format, init_tracing, read_to_vec};
use mfs_types::{BSIZE, NodeKind};
use std::sync::Arc;

#[test]
fn file_backed_device_round_trip() {
    init_tracing();
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");
    tmp.as_file()
        .set_len(2048 * BSIZE as u64)
        .expect("set_len");

    let disk = Arc::new(FileDisk::open(tmp.path()).expect("open"));
    format(disk.as_ref(), 16).expect("format");

    let fs = MfsInterface::mount(Arc::clone(&disk) as Arc<dyn BlockDevice>, &MfsConfig::default())
        .expect("mount");
    let root = fs.root();
    let f = fs.create(&root, "persisted", NodeKind::File).expect("create");
    fs.write_file(&f, b"on real storage", 0).expect("write");
    fs.sync().expect("sync");
    drop((root, f));
    drop(fs);

    // A completely fresh mapping over the same file.
    let disk = Arc::new(FileDisk::open(tmp.path()).expect("reopen"));
    let fs = MfsInterface::mount(disk as Arc<dyn BlockDevice>, &MfsConfig::default())
        .expect("remount");
    let root = fs.root();
    let f = fs
        .lookup(&root, "persisted")
        .expect("lookup")
        .expect("present");
    assert_eq!(read_to_vec(&fs, &f), b"on real storage");
}
