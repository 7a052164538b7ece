#![forbid(unsafe_code)]
//! Image builder and test harness for MFS.
//!
//! `format` lays down a fresh filesystem the way mkfs would: superblock,
//! inode table, free bitmap, a root directory, and the preallocated
//! zero-filled journal file linked at `/sv6journal`. The mount helpers pair
//! a formatted device with a live [`MfsInterface`]; simulating a power loss
//! is dropping the filesystem (volatile caches and all) and re-mounting the
//! same device.

use mfs_alloc::BitmapSlot;
use mfs_block::{BlockDevice, MemDisk};
use mfs_core::{MfsConfig, MfsInterface, Mnode};
use mfs_error::{MfsError, Result};
use mfs_inode::InodeMeta;
use mfs_types::{
    BSIZE, BlockNumber, DINODE_SIZE, DIRENT_SIZE, DIRSIZ, InodeNumber, JOURNAL_FILE_NAME, NDIRECT,
    Name, NodeKind, PHYS_JOURNAL_SIZE, ROOT_INUM, Superblock, inode_block, inode_offset,
    put_le_u32,
};
use std::sync::{Arc, OnceLock};

/// Inode number mkfs assigns to the journal file.
pub const JOURNAL_INUM: InodeNumber = InodeNumber(2);

/// Blocks occupied by the journal file's contents.
pub const JOURNAL_BLOCKS: u32 = (PHYS_JOURNAL_SIZE / BSIZE) as u32;

/// Install a `tracing` subscriber for test binaries. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

fn dirent(inum: InodeNumber, name: &str) -> [u8; DIRENT_SIZE] {
    let mut out = [0_u8; DIRENT_SIZE];
    put_le_u32(&mut out, 0, inum.0);
    let name = Name::new(name).expect("mkfs name");
    out[4..4 + DIRSIZ].copy_from_slice(&name.to_padded());
    out
}

/// Format `dev` as a fresh filesystem with `ninodes` inode slots.
///
/// Layout: root directory data in the first data block, the journal's
/// indirect block next, then the journal's data blocks. Everything up to
/// and including the journal is marked in use in the bitmap.
pub fn format(dev: &dyn BlockDevice, ninodes: u32) -> Result<()> {
    let size = dev.block_count();
    let sb = Superblock {
        size,
        nblocks: size
            .checked_sub(mfs_types::data_start(size, ninodes).0)
            .ok_or_else(|| MfsError::Format("device too small for metadata".to_owned()))?,
        ninodes,
    };
    let ds = sb.data_start().0;
    let root_dir_block = ds;
    let journal_indirect = ds + 1;
    let journal_data = ds + 2;
    let used_end = journal_data + JOURNAL_BLOCKS;
    if used_end + 1 > size {
        return Err(MfsError::Format(format!(
            "device too small: {size} blocks, mkfs needs {}",
            used_end + 1
        )));
    }

    // Superblock.
    let mut block = vec![0_u8; BSIZE];
    sb.encode_into(&mut block);
    dev.write_block(BlockNumber(0), &block)?;

    // Inode table: root directory and the journal file. Both live in the
    // first table block; any remaining table blocks are zero (free slots).
    let mut root = InodeMeta::empty();
    root.kind = Some(NodeKind::Dir);
    root.nlink = 1; // its own `..`
    root.size = (2 * DIRENT_SIZE) as u32;
    root.addrs[0] = root_dir_block;

    let mut journal = InodeMeta::empty();
    journal.kind = Some(NodeKind::File);
    journal.nlink = 1;
    journal.size = u32::try_from(PHYS_JOURNAL_SIZE).expect("journal size fits u32");
    for (i, addr) in journal.addrs[..NDIRECT].iter_mut().enumerate() {
        *addr = journal_data + i as u32;
    }
    journal.addrs[NDIRECT] = journal_indirect;

    let mut table = vec![0_u8; BSIZE];
    let off = inode_offset(ROOT_INUM);
    root.encode_into(&mut table[off..off + DINODE_SIZE]);
    let off = inode_offset(JOURNAL_INUM);
    journal.encode_into(&mut table[off..off + DINODE_SIZE]);
    assert_eq!(inode_block(ROOT_INUM), inode_block(JOURNAL_INUM));
    dev.write_block(inode_block(ROOT_INUM), &table)?;
    let mut b = inode_block(ROOT_INUM).0 + 1;
    while b < ds - mfs_types::bitmap_blocks(size) {
        dev.write_block(BlockNumber(b), &vec![0_u8; BSIZE])?;
        b += 1;
    }

    // Free bitmap: metadata, the root directory block, and the journal are
    // in use; everything after is free.
    let mut bno = 0_u32;
    while bno < size {
        let mut bitmap = vec![0_u8; BSIZE];
        let in_this = (size - bno).min(mfs_types::BPB);
        for bit in 0..in_this {
            if bno + bit < used_end {
                BitmapSlot::of(BlockNumber(bno + bit)).mark_in_use(&mut bitmap);
            }
        }
        dev.write_block(sb.bitmap_block(BlockNumber(bno)), &bitmap)?;
        bno += in_this;
    }

    // Root directory contents: `..` is itself; the journal file is linked
    // here but never materialised into the namespace.
    let mut dir = vec![0_u8; BSIZE];
    dir[..DIRENT_SIZE].copy_from_slice(&dirent(ROOT_INUM, ".."));
    dir[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(&dirent(JOURNAL_INUM, JOURNAL_FILE_NAME));
    dev.write_block(BlockNumber(root_dir_block), &dir)?;

    // Journal indirect block: pointers for the blocks past the direct set.
    let mut indirect = vec![0_u8; BSIZE];
    for i in NDIRECT..JOURNAL_BLOCKS as usize {
        put_le_u32(&mut indirect, 4 * (i - NDIRECT), journal_data + i as u32);
    }
    dev.write_block(BlockNumber(journal_indirect), &indirect)?;

    // Journal contents: zero-filled means empty.
    let zero = vec![0_u8; BSIZE];
    for i in 0..JOURNAL_BLOCKS {
        dev.write_block(BlockNumber(journal_data + i), &zero)?;
    }
    dev.sync()?;
    Ok(())
}

/// A formatted in-memory device of `size` blocks.
pub fn fresh_disk(size: u32, ninodes: u32) -> Arc<MemDisk> {
    let disk = Arc::new(MemDisk::new(size));
    format(disk.as_ref(), ninodes).expect("format");
    disk
}

/// Mount a device with default configuration.
pub fn mount(disk: &Arc<MemDisk>) -> Arc<MfsInterface> {
    MfsInterface::mount(Arc::clone(disk) as Arc<dyn BlockDevice>, &MfsConfig::default())
        .expect("mount")
}

/// A formatted and mounted filesystem: 2048 blocks, 16 inodes.
pub fn mount_fresh() -> (Arc<MemDisk>, Arc<MfsInterface>) {
    let disk = fresh_disk(2048, 16);
    let fs = mount(&disk);
    (disk, fs)
}

/// Read a whole file into a vector.
pub fn read_to_vec(fs: &MfsInterface, m: &Arc<Mnode>) -> Vec<u8> {
    // Adopt the on-disk size before trusting `m.size()`.
    fs.initialize_file(m).expect("initialize");
    let mut out = vec![0_u8; usize::try_from(m.size()).expect("size fits")];
    let n = fs.read_file(m, &mut out, 0).expect("read");
    out.truncate(n);
    out
}
