#![forbid(unsafe_code)]
//! Block I/O layer for MFS.
//!
//! Provides the `BlockDevice` trait, an in-memory device and a file-backed
//! device, a buffer cache with dirty tracking and snapshot write-back, and
//! the physical `Transaction`: an owned bag of block images plus
//! allocated/freed block lists that commits atomically through the journal.

use mfs_error::{MfsError, Result};
use mfs_types::{BSIZE, BlockNumber, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

// ── Block buffer ────────────────────────────────────────────────────────────

/// Owned block image with shared, copy-on-write storage.
///
/// Invariant: length == [`BSIZE`]. Cloning is cheap; mutation through
/// [`make_mut`](Self::make_mut) unshares. Two buffers compare pointer-equal
/// iff they share storage, which the cache uses to decide whether a block
/// was re-dirtied after a transaction snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    /// Wrap an existing image. Panics unless `bytes.len() == BSIZE`.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        assert_eq!(bytes.len(), BSIZE, "block image must be BSIZE bytes");
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: Arc::new(vec![0_u8; BSIZE]),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn make_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.bytes).as_mut_slice()
    }

    /// Whether both buffers share the same storage.
    #[must_use]
    pub fn same_image(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

// ── Devices ─────────────────────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal [`BSIZE`].
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Write barrier: all prior writes reach stable storage before return.
    fn sync(&self) -> Result<()>;
}

fn check_range(block: BlockNumber, count: u32) -> Result<()> {
    if block.0 >= count {
        return Err(MfsError::Format(format!(
            "block out of range: {block} >= {count}"
        )));
    }
    Ok(())
}

fn check_len(data: &[u8]) -> Result<()> {
    if data.len() != BSIZE {
        return Err(MfsError::Format(format!(
            "block size mismatch: got {} expected {BSIZE}",
            data.len()
        )));
    }
    Ok(())
}

/// In-memory block device. Unwritten blocks read back as zeros.
///
/// Writes land on "media" immediately, so simulating a power loss is simply
/// re-mounting over the same device with fresh caches.
#[derive(Debug)]
pub struct MemDisk {
    blocks: RwLock<HashMap<BlockNumber, BlockBuf>>,
    count: u32,
}

impl MemDisk {
    #[must_use]
    pub fn new(count: u32) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            count,
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        check_range(block, self.count)?;
        Ok(self
            .blocks
            .read()
            .get(&block)
            .cloned()
            .unwrap_or_else(BlockBuf::zeroed))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_range(block, self.count)?;
        check_len(data)?;
        self.blocks
            .write()
            .insert(block, BlockBuf::new(data.to_vec()));
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed block device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a shared
/// seek position.
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    count: u32,
    writable: bool,
}

impl FileDisk {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let count = u32::try_from(len / BSIZE as u64)
            .map_err(|_| MfsError::Format("device too large for u32 block numbers".to_owned()))?;
        Ok(Self {
            file,
            count,
            writable,
        })
    }
}

impl BlockDevice for FileDisk {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        check_range(block, self.count)?;
        let mut data = vec![0_u8; BSIZE];
        self.file
            .read_exact_at(&mut data, u64::from(block.0) * BSIZE as u64)?;
        Ok(BlockBuf::new(data))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_range(block, self.count)?;
        check_len(data)?;
        if !self.writable {
            return Err(MfsError::InvalidArgument("device opened read-only"));
        }
        self.file
            .write_all_at(data, u64::from(block.0) * BSIZE as u64)?;
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── Buffer cache ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CacheEntry {
    buf: BlockBuf,
    dirty: bool,
}

/// Read-through block cache with dirty tracking.
///
/// Mutations go through [`modify`](Self::modify), which unshares the cached
/// image, marks the entry dirty, and hands back a snapshot for the caller's
/// transaction. [`writeback_snapshot`](Self::writeback_snapshot) writes a
/// snapshot to its home location and marks the entry clean only if the cache
/// still holds that exact image.
pub struct BufCache {
    dev: Arc<dyn BlockDevice>,
    entries: Mutex<HashMap<BlockNumber, CacheEntry>>,
}

impl std::fmt::Debug for BufCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufCache")
            .field("cached", &self.entries.lock().len())
            .finish()
    }
}

impl BufCache {
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Read a block, populating the cache on miss.
    pub fn get(&self, block: BlockNumber) -> Result<BlockBuf> {
        if let Some(entry) = self.entries.lock().get(&block) {
            return Ok(entry.buf.clone());
        }
        let buf = self.dev.read_block(block)?;
        trace!(target: "mfs::block", block = block.0, "cache_fill");
        let mut entries = self.entries.lock();
        // Another thread may have filled (or even dirtied) the entry while
        // the read was in flight; keep the existing one.
        let entry = entries.entry(block).or_insert(CacheEntry {
            buf: buf.clone(),
            dirty: false,
        });
        Ok(entry.buf.clone())
    }

    /// Mutate a cached block in place and return the resulting image.
    ///
    /// The entry is marked dirty; the returned snapshot is what a transaction
    /// records for the journal.
    pub fn modify(&self, block: BlockNumber, f: impl FnOnce(&mut [u8])) -> Result<BlockBuf> {
        // Fill outside the lock if needed.
        let fill = if self.entries.lock().contains_key(&block) {
            None
        } else {
            Some(self.dev.read_block(block)?)
        };
        let mut entries = self.entries.lock();
        let entry = entries.entry(block).or_insert_with(|| CacheEntry {
            buf: fill.unwrap_or_else(BlockBuf::zeroed),
            dirty: false,
        });
        f(entry.buf.make_mut());
        entry.dirty = true;
        Ok(entry.buf.clone())
    }

    /// Install a block image (recovery replay), replacing any cached copy.
    pub fn install(&self, block: BlockNumber, buf: BlockBuf, dirty: bool) {
        self.entries.lock().insert(block, CacheEntry { buf, dirty });
    }

    /// Write `snapshot` to the block's home location. The cache entry is
    /// marked clean only if it still holds this exact image; a block that was
    /// re-dirtied after the snapshot was taken stays dirty.
    pub fn writeback_snapshot(&self, block: BlockNumber, snapshot: &BlockBuf) -> Result<()> {
        self.dev.write_block(block, snapshot.as_slice())?;
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&block) {
            if entry.buf.same_image(snapshot) {
                entry.dirty = false;
            }
        }
        Ok(())
    }

    /// Blocks currently marked dirty.
    #[must_use]
    pub fn dirty_blocks(&self) -> Vec<BlockNumber> {
        let mut out: Vec<BlockNumber> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(b, _)| *b)
            .collect();
        out.sort_unstable();
        out
    }

    /// Write every dirty block home and issue a device barrier.
    pub fn flush(&self) -> Result<()> {
        let dirty: Vec<(BlockNumber, BlockBuf)> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(b, e)| (*b, e.buf.clone()))
            .collect();
        let count = dirty.len();
        for (block, buf) in dirty {
            self.writeback_snapshot(block, &buf)?;
        }
        self.dev.sync()?;
        debug!(target: "mfs::block", flushed = count, "cache_flush");
        Ok(())
    }

    /// Evict a single block.
    ///
    /// # Panics
    ///
    /// Panics if the block is dirty; evicting unwritten data loses it.
    pub fn evict(&self, block: BlockNumber) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&block) {
            assert!(!entry.dirty, "evicting dirty block {block}");
            entries.remove(&block);
        }
    }

    /// Evict a block only if it is cached and clean. Returns whether an
    /// entry was dropped.
    pub fn evict_if_clean(&self, block: BlockNumber) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&block) {
            Some(entry) if !entry.dirty => {
                entries.remove(&block);
                true
            }
            _ => false,
        }
    }

    /// Drop every clean entry, returning how many were evicted.
    pub fn evict_all_clean(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.dirty);
        let evicted = before - entries.len();
        debug!(target: "mfs::block", evicted, "cache_evict_clean");
        evicted
    }

    #[must_use]
    pub fn cached_blocks(&self) -> usize {
        self.entries.lock().len()
    }

    /// Device write barrier.
    pub fn sync_device(&self) -> Result<()> {
        self.dev.sync()
    }
}

// ── Physical transaction ────────────────────────────────────────────────────

/// Transaction lifecycle: `Open` accepts blocks; `prepare_for_commit`
/// freezes the image set; the journal advances the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Prepared,
    Logged,
    Applied,
    Retired,
}

/// An unordered set of `(block, image)` pairs plus the blocks the operation
/// allocated and freed. Immutable after prepare; no back-pointers from
/// blocks to transactions.
#[derive(Debug)]
pub struct Transaction {
    timestamp: Timestamp,
    blocks: Vec<(BlockNumber, BlockBuf)>,
    index: HashMap<BlockNumber, usize>,
    allocated: Vec<BlockNumber>,
    freed: Vec<BlockNumber>,
    state: TxnState,
}

impl Transaction {
    #[must_use]
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            blocks: Vec::new(),
            index: HashMap::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
            state: TxnState::Open,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Record a block image. A later image for the same block replaces the
    /// earlier one; the set stays unique by block number.
    pub fn add_block(&mut self, block: BlockNumber, image: BlockBuf) {
        assert_eq!(
            self.state,
            TxnState::Open,
            "transaction sealed; cannot add block {block}"
        );
        match self.index.get(&block) {
            Some(&i) => self.blocks[i].1 = image,
            None => {
                self.index.insert(block, self.blocks.len());
                self.blocks.push((block, image));
            }
        }
    }

    pub fn note_allocated(&mut self, block: BlockNumber) {
        assert_eq!(self.state, TxnState::Open);
        self.allocated.push(block);
    }

    pub fn note_freed(&mut self, block: BlockNumber) {
        assert_eq!(self.state, TxnState::Open);
        self.freed.push(block);
    }

    #[must_use]
    pub fn blocks(&self) -> &[(BlockNumber, BlockBuf)] {
        &self.blocks
    }

    #[must_use]
    pub fn allocated_blocks(&self) -> &[BlockNumber] {
        &self.allocated
    }

    #[must_use]
    pub fn freed_blocks(&self) -> &[BlockNumber] {
        &self.freed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.allocated.is_empty() && self.freed.is_empty()
    }

    /// Freeze the image set. Blocks are sorted so the journal lays them out
    /// deterministically.
    pub fn prepare_for_commit(&mut self) {
        assert_eq!(self.state, TxnState::Open);
        self.blocks.sort_by_key(|(b, _)| *b);
        self.index.clear();
        self.state = TxnState::Prepared;
        trace!(
            target: "mfs::block",
            ts = self.timestamp.0,
            blocks = self.blocks.len(),
            "txn_prepared"
        );
    }

    pub fn mark_logged(&mut self) {
        assert_eq!(self.state, TxnState::Prepared);
        self.state = TxnState::Logged;
    }

    pub fn mark_applied(&mut self) {
        assert_eq!(self.state, TxnState::Logged);
        self.state = TxnState::Applied;
    }

    pub fn mark_retired(&mut self) {
        assert_eq!(self.state, TxnState::Applied);
        self.state = TxnState::Retired;
    }

    /// Write every image to its home location through the cache's snapshot
    /// path (entries re-dirtied since the snapshot stay dirty).
    pub fn write_to_disk(&self, cache: &BufCache) -> Result<()> {
        for (block, image) in &self.blocks {
            cache.writeback_snapshot(*block, image)?;
        }
        Ok(())
    }

    /// Recovery path: install each image in the cache and write it home.
    pub fn write_to_disk_update_cache(&self, cache: &BufCache) -> Result<()> {
        for (block, image) in &self.blocks {
            cache.install(*block, image.clone(), false);
            cache.device().write_block(*block, image.as_slice())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_disk_reads_zeros_and_round_trips() {
        let disk = MemDisk::new(8);
        let zero = disk.read_block(BlockNumber(3)).expect("read");
        assert!(zero.as_slice().iter().all(|b| *b == 0));

        disk.write_block(BlockNumber(3), &[0xA5; BSIZE]).expect("write");
        let back = disk.read_block(BlockNumber(3)).expect("read back");
        assert_eq!(back.as_slice(), &[0xA5; BSIZE]);

        assert!(disk.read_block(BlockNumber(8)).is_err());
        assert!(disk.write_block(BlockNumber(0), &[0; 10]).is_err());
    }

    #[test]
    fn file_disk_round_trips() {
        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.as_file()
            .set_len(4 * BSIZE as u64)
            .expect("set_len");
        let disk = FileDisk::open(tmp.path()).expect("open");
        assert_eq!(disk.block_count(), 4);

        disk.write_block(BlockNumber(2), &[0x5C; BSIZE]).expect("write");
        disk.sync().expect("sync");
        let back = disk.read_block(BlockNumber(2)).expect("read");
        assert_eq!(back.as_slice(), &[0x5C; BSIZE]);
    }

    #[test]
    fn cache_read_through_and_dirty_tracking() {
        let disk = Arc::new(MemDisk::new(8));
        disk.write_block(BlockNumber(1), &[7; BSIZE]).expect("seed");
        let cache = BufCache::new(disk.clone());

        let buf = cache.get(BlockNumber(1)).expect("get");
        assert_eq!(buf.as_slice()[0], 7);
        assert!(cache.dirty_blocks().is_empty());

        cache
            .modify(BlockNumber(1), |data| data[0] = 9)
            .expect("modify");
        assert_eq!(cache.dirty_blocks(), vec![BlockNumber(1)]);
        // The device still has the old contents until write-back.
        assert_eq!(disk.read_block(BlockNumber(1)).expect("raw").as_slice()[0], 7);

        cache.flush().expect("flush");
        assert!(cache.dirty_blocks().is_empty());
        assert_eq!(disk.read_block(BlockNumber(1)).expect("raw").as_slice()[0], 9);
    }

    #[test]
    fn writeback_snapshot_keeps_re_dirtied_blocks_dirty() {
        let disk = Arc::new(MemDisk::new(8));
        let cache = BufCache::new(disk.clone());

        let snap = cache
            .modify(BlockNumber(2), |data| data[0] = 1)
            .expect("first write");
        // Re-dirty after the snapshot was taken.
        cache
            .modify(BlockNumber(2), |data| data[1] = 2)
            .expect("second write");

        cache.writeback_snapshot(BlockNumber(2), &snap).expect("writeback");
        // Snapshot landed on the device...
        assert_eq!(disk.read_block(BlockNumber(2)).expect("raw").as_slice()[0], 1);
        assert_eq!(disk.read_block(BlockNumber(2)).expect("raw").as_slice()[1], 0);
        // ...but the newer image is still pending.
        assert_eq!(cache.dirty_blocks(), vec![BlockNumber(2)]);
    }

    #[test]
    fn evict_clean_keeps_dirty_entries() {
        let disk = Arc::new(MemDisk::new(8));
        let cache = BufCache::new(disk);
        cache.get(BlockNumber(0)).expect("fill clean");
        cache
            .modify(BlockNumber(1), |data| data[0] = 1)
            .expect("dirty");

        assert_eq!(cache.evict_all_clean(), 1);
        assert_eq!(cache.cached_blocks(), 1);
        assert_eq!(cache.dirty_blocks(), vec![BlockNumber(1)]);
    }

    #[test]
    #[should_panic(expected = "evicting dirty block")]
    fn evicting_dirty_block_panics() {
        let disk = Arc::new(MemDisk::new(8));
        let cache = BufCache::new(disk);
        cache
            .modify(BlockNumber(1), |data| data[0] = 1)
            .expect("dirty");
        cache.evict(BlockNumber(1));
    }

    #[test]
    fn transaction_dedupes_blocks_and_walks_states() {
        let mut tr = Transaction::new(Timestamp(5));
        let mut first = BlockBuf::zeroed();
        first.make_mut()[0] = 1;
        let mut second = BlockBuf::zeroed();
        second.make_mut()[0] = 2;

        tr.add_block(BlockNumber(9), first);
        tr.add_block(BlockNumber(9), second.clone());
        tr.add_block(BlockNumber(4), BlockBuf::zeroed());
        tr.note_allocated(BlockNumber(4));
        tr.note_freed(BlockNumber(7));

        assert_eq!(tr.blocks().len(), 2);
        tr.prepare_for_commit();
        // Sorted by block number after prepare; last image wins.
        assert_eq!(tr.blocks()[0].0, BlockNumber(4));
        assert_eq!(tr.blocks()[1].0, BlockNumber(9));
        assert_eq!(tr.blocks()[1].1.as_slice()[0], 2);

        tr.mark_logged();
        tr.mark_applied();
        tr.mark_retired();
        assert_eq!(tr.state(), TxnState::Retired);
    }

    #[test]
    #[should_panic(expected = "transaction sealed")]
    fn sealed_transaction_rejects_blocks() {
        let mut tr = Transaction::new(Timestamp(1));
        tr.prepare_for_commit();
        tr.add_block(BlockNumber(1), BlockBuf::zeroed());
    }
}
