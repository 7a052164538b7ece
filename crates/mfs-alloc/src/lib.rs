#![forbid(unsafe_code)]
//! Block allocation.
//!
//! The allocator keeps two representations of the on-disk free bitmap:
//!
//! 1. **Free-bit vector** — one entry per block, addressed by block number,
//!    giving O(1) free. Each bit carries its own write lock; the flag itself
//!    is readable without any lock.
//! 2. **Freelist** — a separately locked deque threading the free bits,
//!    giving O(1) allocate without a scan.
//!
//! Invariant: a bit's free flag is set iff the block is linked in the
//! freelist (observed at quiescent points; `free_block` links the bit right
//! after publishing the flag).
//!
//! Lock order: per-bit then freelist on the free path, never both held.
//! The allocate path takes a bit's write lock while still holding the
//! freelist lock, which cannot deadlock because the bit has just been
//! unlinked and no `free_block` caller can hold its lock while waiting on
//! the freelist.

use mfs_block::{BufCache, Transaction};
use mfs_error::Result;
use mfs_types::{BPB, BlockNumber, Superblock};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

// ── Bitmap slots ────────────────────────────────────────────────────────────

/// A block's position inside its bitmap block image.
///
/// The on-disk bitmap stores one bit per block, set while the block is in
/// use. `BitmapSlot::of(bno)` resolves a block number to its byte and mask
/// within the image that [`Superblock::bitmap_block`] maps it to, so
/// callers never juggle raw bit indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapSlot {
    byte: usize,
    mask: u8,
}

impl BitmapSlot {
    /// The slot covering `bno` within its bitmap block.
    #[must_use]
    pub fn of(bno: BlockNumber) -> Self {
        let bit = bno.0 % BPB;
        Self {
            byte: (bit / 8) as usize,
            mask: 1 << (bit % 8),
        }
    }

    /// Whether the covered block is marked in use.
    #[must_use]
    pub fn in_use(self, image: &[u8]) -> bool {
        image.get(self.byte).is_some_and(|b| b & self.mask != 0)
    }

    /// Mark the covered block in use.
    pub fn mark_in_use(self, image: &mut [u8]) {
        if let Some(byte) = image.get_mut(self.byte) {
            *byte |= self.mask;
        }
    }

    /// Mark the covered block free.
    pub fn mark_free(self, image: &mut [u8]) {
        if let Some(byte) = image.get_mut(self.byte) {
            *byte &= !self.mask;
        }
    }
}

// ── Free-bit vector ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct FreeBit {
    is_free: AtomicBool,
    write_lock: Mutex<()>,
}

/// The in-memory block allocator.
///
/// Constructed empty at boot and populated by [`initialize`] *after* journal
/// recovery, because replayed transactions may rewrite bitmap blocks.
#[derive(Debug)]
pub struct FreeBitVector {
    bits: OnceLock<Box<[FreeBit]>>,
    freelist: Mutex<VecDeque<u32>>,
    free_count: AtomicU64,
}

impl Default for FreeBitVector {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeBitVector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bits: OnceLock::new(),
            freelist: Mutex::new(VecDeque::new()),
            free_count: AtomicU64::new(0),
        }
    }

    fn bits(&self) -> &[FreeBit] {
        self.bits
            .get()
            .expect("free-bit vector used before initialization")
    }

    /// Read the bitmap blocks and materialise the vector, threading every
    /// free bit onto the freelist.
    pub fn initialize(&self, cache: &BufCache, sb: &Superblock) -> Result<()> {
        let mut bits = Vec::with_capacity(sb.size as usize);
        let mut freelist = self.freelist.lock();
        assert!(
            self.bits.get().is_none() && freelist.is_empty(),
            "free-bit vector initialized twice"
        );

        let mut free = 0_u64;
        let mut b = 0_u32;
        while b < sb.size {
            let image = cache.get(sb.bitmap_block(BlockNumber(b)))?;
            let nbits = BPB.min(sb.size - b);
            for bi in 0..nbits {
                let bno = BlockNumber(b + bi);
                let is_free = !BitmapSlot::of(bno).in_use(image.as_slice());
                bits.push(FreeBit {
                    is_free: AtomicBool::new(is_free),
                    write_lock: Mutex::new(()),
                });
                if is_free {
                    freelist.push_back(bno.0);
                    free += 1;
                }
            }
            b += BPB;
        }

        self.free_count.store(free, Ordering::Release);
        self.bits
            .set(bits.into_boxed_slice())
            .expect("free-bit vector initialized twice");
        debug!(target: "mfs::alloc", total = sb.size, free, "free_bit_vector_initialized");
        Ok(())
    }

    /// Pop a free block off the freelist in O(1). Returns `None` when the
    /// device is out of blocks; callers surface that as `ENOSPC`.
    pub fn alloc_block(&self) -> Option<BlockNumber> {
        let bits = self.bits();
        let mut freelist = self.freelist.lock();
        let bno = freelist.pop_front()?;

        // The bit is already unlinked, so taking its write lock under the
        // freelist lock cannot contend with the free path.
        let bit = &bits[bno as usize];
        let _guard = bit.write_lock.lock();
        assert!(
            bit.is_free.load(Ordering::Acquire),
            "allocating in-use block {bno}"
        );
        bit.is_free.store(false, Ordering::Release);
        self.free_count.fetch_sub(1, Ordering::AcqRel);
        trace!(target: "mfs::alloc", block = bno, "alloc_block");
        Some(BlockNumber(bno))
    }

    /// Mark `bno` free and relink it. Freeing an already-free block is a
    /// fatal invariant violation.
    pub fn free_block(&self, bno: BlockNumber) {
        let bits = self.bits();
        let bit = &bits[bno.0 as usize];
        {
            let _guard = bit.write_lock.lock();
            assert!(
                !bit.is_free.load(Ordering::Acquire),
                "freeing free block {bno}"
            );
            bit.is_free.store(true, Ordering::Release);
        }
        // Bit lock dropped before taking the freelist lock; holding both
        // here would invert the allocate path's order.
        self.freelist.lock().push_front(bno.0);
        self.free_count.fetch_add(1, Ordering::AcqRel);
        trace!(target: "mfs::alloc", block = bno.0, "free_block");
    }

    /// Current free-block count.
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.free_count.load(Ordering::Acquire)
    }

    /// Total tracked blocks.
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.bits().len() as u64
    }

    /// Whether `bno` is currently marked free. Lock-free read.
    #[must_use]
    pub fn is_free(&self, bno: BlockNumber) -> bool {
        self.bits()[bno.0 as usize].is_free.load(Ordering::Acquire)
    }

    /// Approximate free count by scanning the vector without locks.
    ///
    /// Traversing the freelist would be exact but would hold the freelist
    /// lock and stall concurrent allocation; this snapshot is what the
    /// statistics device reports.
    #[must_use]
    pub fn scan_free(&self) -> (u64, u64) {
        let bits = self.bits();
        let free = bits
            .iter()
            .filter(|bit| bit.is_free.load(Ordering::Relaxed))
            .count() as u64;
        (free, bits.len() as u64)
    }

    /// Snapshot of the freelist contents, for invariant checks.
    #[must_use]
    pub fn freelist_blocks(&self) -> Vec<BlockNumber> {
        self.freelist.lock().iter().map(|b| BlockNumber(*b)).collect()
    }
}

// ── On-disk bitmap updates ──────────────────────────────────────────────────

/// Mark `blocks` in use in the on-disk bitmap, pulling every touched bitmap
/// block image into `tr`.
pub fn balloc_on_disk(
    blocks: &[BlockNumber],
    sb: &Superblock,
    cache: &BufCache,
    tr: &mut Transaction,
) -> Result<()> {
    for bno in blocks {
        let bitmap_block = sb.bitmap_block(*bno);
        let slot = BitmapSlot::of(*bno);
        let image = cache.modify(bitmap_block, |data| {
            slot.mark_in_use(data);
        })?;
        tr.add_block(bitmap_block, image);
    }
    Ok(())
}

/// Clear `blocks` in the on-disk bitmap, pulling every touched bitmap block
/// image into `tr`. Clearing an already-clear bit is a fatal invariant
/// violation (double free reaching the disk).
pub fn bfree_on_disk(
    blocks: &[BlockNumber],
    sb: &Superblock,
    cache: &BufCache,
    tr: &mut Transaction,
) -> Result<()> {
    for bno in blocks {
        let bitmap_block = sb.bitmap_block(*bno);
        let slot = BitmapSlot::of(*bno);
        let image = cache.modify(bitmap_block, |data| {
            assert!(
                slot.in_use(data),
                "block {bno} already free in on-disk bitmap"
            );
            slot.mark_free(data);
        })?;
        tr.add_block(bitmap_block, image);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfs_block::{BlockDevice, MemDisk};
    use mfs_types::{BSIZE, Timestamp};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn small_fs() -> (Arc<MemDisk>, BufCache, Superblock) {
        let sb = Superblock {
            size: 64,
            nblocks: 61,
            ninodes: 16,
        };
        let disk = Arc::new(MemDisk::new(sb.size));
        // Mark the metadata blocks (superblock, inode table, bitmap) in use.
        let mut bitmap = vec![0_u8; BSIZE];
        for b in 0..sb.data_start().0 {
            BitmapSlot::of(BlockNumber(b)).mark_in_use(&mut bitmap);
        }
        disk.write_block(sb.bitmap_block(BlockNumber(0)), &bitmap)
            .expect("seed bitmap");
        let cache = BufCache::new(disk.clone());
        (disk, cache, sb)
    }

    #[test]
    fn bitmap_slot_round_trip() {
        let mut image = vec![0_u8; BSIZE];
        let a = BlockNumber(0);
        let b = BlockNumber(9);
        // A block past one bitmap block's coverage wraps to its own image.
        let wrapped = BlockNumber(BPB + 9);
        assert_eq!(BitmapSlot::of(b), BitmapSlot::of(wrapped));

        assert!(!BitmapSlot::of(a).in_use(&image));
        BitmapSlot::of(a).mark_in_use(&mut image);
        BitmapSlot::of(b).mark_in_use(&mut image);
        assert!(BitmapSlot::of(a).in_use(&image));
        assert!(BitmapSlot::of(b).in_use(&image));
        assert!(!BitmapSlot::of(BlockNumber(8)).in_use(&image));

        BitmapSlot::of(b).mark_free(&mut image);
        assert!(!BitmapSlot::of(b).in_use(&image));
        assert!(BitmapSlot::of(a).in_use(&image));
    }

    fn initialized(cache: &BufCache, sb: &Superblock) -> FreeBitVector {
        let v = FreeBitVector::new();
        v.initialize(cache, sb).expect("initialize");
        v
    }

    #[test]
    fn initialize_threads_only_free_bits() {
        let (_disk, cache, sb) = small_fs();
        let v = initialized(&cache, &sb);

        let meta = sb.data_start().0 as u64;
        assert_eq!(v.free_count(), u64::from(sb.size) - meta);
        assert!(!v.is_free(BlockNumber(0)));
        assert!(v.is_free(sb.data_start()));
        assert_eq!(v.freelist_blocks().len() as u64, v.free_count());
    }

    #[test]
    fn alloc_returns_each_block_once_until_freed() {
        let (_disk, cache, sb) = small_fs();
        let v = initialized(&cache, &sb);

        let mut seen = HashSet::new();
        while let Some(b) = v.alloc_block() {
            assert!(seen.insert(b), "block {b} allocated twice");
            assert!(!v.is_free(b));
        }
        assert_eq!(v.free_count(), 0);

        for b in &seen {
            v.free_block(*b);
        }
        assert_eq!(v.free_count(), seen.len() as u64);
    }

    #[test]
    fn freelist_matches_free_flags() {
        let (_disk, cache, sb) = small_fs();
        let v = initialized(&cache, &sb);

        let a = v.alloc_block().expect("alloc");
        let b = v.alloc_block().expect("alloc");
        v.free_block(a);

        let listed: HashSet<BlockNumber> = v.freelist_blocks().into_iter().collect();
        for bno in 0..sb.size {
            let bno = BlockNumber(bno);
            assert_eq!(
                v.is_free(bno),
                listed.contains(&bno),
                "free flag and freelist disagree on {bno}"
            );
        }
        assert!(!listed.contains(&b));
    }

    #[test]
    #[should_panic(expected = "freeing free block")]
    fn double_free_is_fatal() {
        let (_disk, cache, sb) = small_fs();
        let v = initialized(&cache, &sb);
        let b = v.alloc_block().expect("alloc");
        v.free_block(b);
        v.free_block(b);
    }

    #[test]
    fn on_disk_bitmap_updates_flow_through_transaction() {
        let (_disk, cache, sb) = small_fs();
        let target = sb.data_start();
        let mut tr = Transaction::new(Timestamp(1));

        balloc_on_disk(&[target], &sb, &cache, &mut tr).expect("balloc");
        assert_eq!(tr.blocks().len(), 1);
        let image = cache.get(sb.bitmap_block(target)).expect("bitmap");
        assert!(BitmapSlot::of(target).in_use(image.as_slice()));

        bfree_on_disk(&[target], &sb, &cache, &mut tr).expect("bfree");
        let image = cache.get(sb.bitmap_block(target)).expect("bitmap");
        assert!(!BitmapSlot::of(target).in_use(image.as_slice()));
        // Same bitmap block touched twice: the transaction holds one image.
        assert_eq!(tr.blocks().len(), 1);
    }

    #[test]
    #[should_panic(expected = "already free in on-disk bitmap")]
    fn clearing_clear_bit_is_fatal() {
        let (_disk, cache, sb) = small_fs();
        let mut tr = Transaction::new(Timestamp(1));
        bfree_on_disk(&[sb.data_start()], &sb, &cache, &mut tr).expect("bfree");
    }

    #[test]
    fn concurrent_alloc_free_preserves_invariants() {
        let (_disk, cache, sb) = small_fs();
        let v = Arc::new(initialized(&cache, &sb));
        let initial = v.free_count();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let v = Arc::clone(&v);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if let Some(b) = v.alloc_block() {
                        v.free_block(b);
                    }
                }
            }));
        }
        for h in handles {
            h.join().expect("worker");
        }

        assert_eq!(v.free_count(), initial);
        let listed: HashSet<BlockNumber> = v.freelist_blocks().into_iter().collect();
        assert_eq!(listed.len() as u64, initial);
        for bno in 0..sb.size {
            let bno = BlockNumber(bno);
            assert_eq!(v.is_free(bno), listed.contains(&bno));
        }
    }
}
