#![forbid(unsafe_code)]
//! Inode management.
//!
//! The on-disk inode table cache: read, allocate, update, truncate, and the
//! byte-granular `readi`/`writei` I/O paths, plus the directory-entry
//! primitives `dirlookup`/`dirlink`/`dirunlink`.
//!
//! Every mutation routes through a [`Transaction`]: the touched block images
//! are recorded there and only reach their home locations via the journal.
//! Reads never take an inode's exclusive lock; they snapshot the small
//! metadata record under a shared lock and do block I/O outside it.

use mfs_alloc::FreeBitVector;
use mfs_block::{BufCache, Transaction};
use mfs_error::{MfsError, Result};
use mfs_types::{
    BSIZE, BlockNumber, DINODE_SIZE, DIRENT_SIZE, DIRSIZ, InodeNumber, MAXFILE_BLOCKS, NDIRECT,
    Name, NodeKind, Superblock, inode_block, inode_offset, put_le_u16, put_le_u32, read_fixed,
    read_le_u16, read_le_u32,
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

// ── On-disk inode record ────────────────────────────────────────────────────

/// Decoded on-disk inode: type, link count, size, and block pointers
/// (12 direct plus one single-indirect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMeta {
    pub kind: Option<NodeKind>,
    pub nlink: u16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
}

impl InodeMeta {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            kind: None,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let kind =
            NodeKind::from_disk(read_le_u16(raw, 0).map_err(format_err)?).map_err(format_err)?;
        let nlink = read_le_u16(raw, 2).map_err(format_err)?;
        let size = read_le_u32(raw, 4).map_err(format_err)?;
        let mut addrs = [0_u32; NDIRECT + 1];
        for (i, addr) in addrs.iter_mut().enumerate() {
            *addr = read_le_u32(raw, 8 + 4 * i).map_err(format_err)?;
        }
        Ok(Self {
            kind,
            nlink,
            size,
            addrs,
        })
    }

    pub fn encode_into(&self, raw: &mut [u8]) {
        raw[..DINODE_SIZE].fill(0);
        put_le_u16(raw, 0, self.kind.map_or(0, NodeKind::to_disk));
        put_le_u16(raw, 2, self.nlink);
        put_le_u32(raw, 4, self.size);
        for (i, addr) in self.addrs.iter().enumerate() {
            put_le_u32(raw, 8 + 4 * i, *addr);
        }
    }
}

fn format_err(e: mfs_types::ParseError) -> MfsError {
    MfsError::Format(e.to_string())
}

// ── In-memory inode ─────────────────────────────────────────────────────────

/// Cached in-memory inode.
///
/// Metadata lives under a reader/writer lock; a sequence counter is bumped
/// around every write so readers can detect change cheaply, and the size is
/// mirrored into an atomic for lock-free `size()`.
#[derive(Debug)]
pub struct Inode {
    pub inum: InodeNumber,
    seq: AtomicU64,
    size_mirror: AtomicU64,
    meta: RwLock<InodeMeta>,
}

impl Inode {
    fn new(inum: InodeNumber, meta: InodeMeta) -> Self {
        Self {
            inum,
            seq: AtomicU64::new(0),
            size_mirror: AtomicU64::new(u64::from(meta.size)),
            meta: RwLock::new(meta),
        }
    }

    /// Snapshot the metadata under the shared lock.
    #[must_use]
    pub fn read(&self) -> RwLockReadGuard<'_, InodeMeta> {
        self.meta.read()
    }

    /// Current on-disk type.
    #[must_use]
    pub fn kind(&self) -> Option<NodeKind> {
        self.meta.read().kind
    }

    /// Current link count.
    #[must_use]
    pub fn nlink(&self) -> u16 {
        self.meta.read().nlink
    }

    /// Lock-free size read.
    #[must_use]
    pub fn size(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)] // mirror of a u32 field
        {
            self.size_mirror.load(Ordering::Acquire) as u32
        }
    }

    /// Sequence counter; odd while a write is in progress.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Begin an exclusive metadata update, bumping the sequence counter.
    fn write_begin(&self) -> InodeWriteGuard<'_> {
        let meta = self.meta.write();
        self.seq.fetch_add(1, Ordering::AcqRel);
        InodeWriteGuard {
            inode: self,
            meta: Some(meta),
        }
    }
}

/// Exclusive inode guard. Dropping it publishes the size mirror and closes
/// the sequence window.
struct InodeWriteGuard<'a> {
    inode: &'a Inode,
    meta: Option<RwLockWriteGuard<'a, InodeMeta>>,
}

impl Deref for InodeWriteGuard<'_> {
    type Target = InodeMeta;

    fn deref(&self) -> &InodeMeta {
        self.meta.as_ref().expect("guard alive")
    }
}

impl DerefMut for InodeWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut InodeMeta {
        self.meta.as_mut().expect("guard alive")
    }
}

impl Drop for InodeWriteGuard<'_> {
    fn drop(&mut self) {
        let size = self.meta.as_ref().map_or(0, |m| m.size);
        self.inode
            .size_mirror
            .store(u64::from(size), Ordering::Release);
        self.meta.take();
        self.inode.seq.fetch_add(1, Ordering::AcqRel);
    }
}

// ── Inode store ─────────────────────────────────────────────────────────────

/// The inode-table cache over a buffer cache and block allocator.
pub struct InodeStore {
    cache: Arc<BufCache>,
    sb: Superblock,
    alloc: Arc<FreeBitVector>,
    inodes: Mutex<HashMap<InodeNumber, Arc<Inode>>>,
    /// Serialises `ialloc` table scans.
    alloc_lock: Mutex<()>,
}

impl std::fmt::Debug for InodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeStore")
            .field("sb", &self.sb)
            .field("cached", &self.inodes.lock().len())
            .finish()
    }
}

impl InodeStore {
    #[must_use]
    pub fn new(cache: Arc<BufCache>, sb: Superblock, alloc: Arc<FreeBitVector>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            sb,
            alloc,
            inodes: Mutex::new(HashMap::new()),
            alloc_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BufCache> {
        &self.cache
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<FreeBitVector> {
        &self.alloc
    }

    /// Return the cached in-memory inode, loading from disk on miss.
    pub fn iget(&self, inum: InodeNumber) -> Result<Arc<Inode>> {
        assert!(
            inum.is_valid() && inum.0 < self.sb.ninodes,
            "inode number {inum} out of range"
        );
        let mut inodes = self.inodes.lock();
        if let Some(ip) = inodes.get(&inum) {
            return Ok(Arc::clone(ip));
        }
        let image = self.cache.get(inode_block(inum))?;
        let off = inode_offset(inum);
        let meta = InodeMeta::parse(&image.as_slice()[off..off + DINODE_SIZE])?;
        let ip = Arc::new(Inode::new(inum, meta));
        inodes.insert(inum, Arc::clone(&ip));
        Ok(ip)
    }

    /// Allocate a free on-disk inode slot of the given kind, writing the new
    /// record through `tr`.
    pub fn ialloc(&self, kind: NodeKind, tr: &mut Transaction) -> Result<Arc<Inode>> {
        let _scan = self.alloc_lock.lock();
        for raw in 1..self.sb.ninodes {
            let inum = InodeNumber(raw);
            let image = self.cache.get(inode_block(inum))?;
            let off = inode_offset(inum);
            let on_disk = InodeMeta::parse(&image.as_slice()[off..off + DINODE_SIZE])?;
            if on_disk.kind.is_some() {
                continue;
            }

            let ip = self.iget(inum)?;
            {
                let mut meta = ip.write_begin();
                *meta = InodeMeta::empty();
                meta.kind = Some(kind);
                self.iupdate_locked(inum, &meta, tr)?;
            }
            trace!(target: "mfs::inode", inum = inum.0, %kind, "ialloc");
            return Ok(ip);
        }
        Err(MfsError::NoSpace)
    }

    /// Write the inode's current metadata into its table block via `tr`.
    pub fn iupdate(&self, ip: &Inode, tr: &mut Transaction) -> Result<()> {
        let meta = *ip.read();
        self.iupdate_locked(ip.inum, &meta, tr)
    }

    fn iupdate_locked(
        &self,
        inum: InodeNumber,
        meta: &InodeMeta,
        tr: &mut Transaction,
    ) -> Result<()> {
        let block = inode_block(inum);
        let off = inode_offset(inum);
        let image = self.cache.modify(block, |data| {
            meta.encode_into(&mut data[off..off + DINODE_SIZE]);
        })?;
        tr.add_block(block, image);
        Ok(())
    }

    /// Re-parse every cached inode from the current block images.
    ///
    /// Journal recovery rewrites metadata blocks underneath the cache;
    /// inodes read before replay must adopt the recovered state.
    pub fn reload_cached(&self) -> Result<()> {
        let inodes: Vec<Arc<Inode>> = self.inodes.lock().values().cloned().collect();
        for ip in inodes {
            let image = self.cache.get(inode_block(ip.inum))?;
            let off = inode_offset(ip.inum);
            let meta = InodeMeta::parse(&image.as_slice()[off..off + DINODE_SIZE])?;
            let mut guard = ip.write_begin();
            *guard = meta;
        }
        Ok(())
    }

    /// Release the on-disk inode. The caller must already have truncated it
    /// and dropped every directory entry.
    pub fn free_inode(&self, ip: &Inode, tr: &mut Transaction) -> Result<()> {
        let mut meta = ip.write_begin();
        assert_eq!(meta.nlink, 0, "freeing linked inode {}", ip.inum);
        assert_eq!(meta.size, 0, "freeing non-truncated inode {}", ip.inum);
        *meta = InodeMeta::empty();
        self.iupdate_locked(ip.inum, &meta, tr)?;
        trace!(target: "mfs::inode", inum = ip.inum.0, "free_inode");
        Ok(())
    }

    // ── Block mapping ───────────────────────────────────────────────────

    /// Resolve file block `bn` without allocating. `None` is a hole.
    fn block_for(&self, meta: &InodeMeta, bn: usize) -> Result<Option<BlockNumber>> {
        if bn < NDIRECT {
            return Ok((meta.addrs[bn] != 0).then(|| BlockNumber(meta.addrs[bn])));
        }
        let idx = bn - NDIRECT;
        if idx >= BSIZE / 4 || meta.addrs[NDIRECT] == 0 {
            return Ok(None);
        }
        let image = self.cache.get(BlockNumber(meta.addrs[NDIRECT]))?;
        let addr = read_le_u32(image.as_slice(), 4 * idx).map_err(format_err)?;
        Ok((addr != 0).then_some(BlockNumber(addr)))
    }

    /// Map `bn` to its block, allocating data and indirect blocks on demand.
    /// Returns the block and whether it was freshly allocated.
    fn block_for_alloc(
        &self,
        meta: &mut InodeMeta,
        bn: usize,
        tr: &mut Transaction,
    ) -> Result<(BlockNumber, bool)> {
        if bn < NDIRECT {
            if meta.addrs[bn] != 0 {
                return Ok((BlockNumber(meta.addrs[bn]), false));
            }
            let bno = self.alloc_data_block(tr)?;
            meta.addrs[bn] = bno.0;
            return Ok((bno, true));
        }

        let idx = bn - NDIRECT;
        assert!(idx < BSIZE / 4, "block index {bn} beyond single indirect");

        if meta.addrs[NDIRECT] == 0 {
            let ind = self.alloc_data_block(tr)?;
            let image = self.cache.modify(ind, |data| data.fill(0))?;
            tr.add_block(ind, image);
            meta.addrs[NDIRECT] = ind.0;
        }
        let ind_block = BlockNumber(meta.addrs[NDIRECT]);

        let image = self.cache.get(ind_block)?;
        let addr = read_le_u32(image.as_slice(), 4 * idx).map_err(format_err)?;
        if addr != 0 {
            return Ok((BlockNumber(addr), false));
        }

        let bno = self.alloc_data_block(tr)?;
        let image = self.cache.modify(ind_block, |data| {
            put_le_u32(data, 4 * idx, bno.0);
        })?;
        tr.add_block(ind_block, image);
        Ok((bno, true))
    }

    fn alloc_data_block(&self, tr: &mut Transaction) -> Result<BlockNumber> {
        let bno = self.alloc.alloc_block().ok_or(MfsError::NoSpace)?;
        tr.note_allocated(bno);
        Ok(bno)
    }

    // ── File I/O ────────────────────────────────────────────────────────

    /// Read up to `dst.len()` bytes at byte offset `off`, returning the
    /// count. Reads past the size return a short count; holes read zeros.
    pub fn readi(&self, ip: &Inode, dst: &mut [u8], off: u32) -> Result<usize> {
        let meta = *ip.read();
        if off >= meta.size {
            return Ok(0);
        }
        let n = dst.len().min((meta.size - off) as usize);

        let mut done = 0_usize;
        while done < n {
            let pos = off as usize + done;
            let bn = pos / BSIZE;
            let start = pos % BSIZE;
            let chunk = (BSIZE - start).min(n - done);
            match self.block_for(&meta, bn)? {
                Some(bno) => {
                    let image = self.cache.get(bno)?;
                    dst[done..done + chunk]
                        .copy_from_slice(&image.as_slice()[start..start + chunk]);
                }
                None => dst[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(n)
    }

    /// Write `src` at byte offset `off`, allocating blocks as needed and
    /// recording every touched image in `tr`. Extends the size when the
    /// write ends past it; writing past the current size leaves a hole.
    pub fn writei(&self, ip: &Inode, src: &[u8], off: u32, tr: &mut Transaction) -> Result<usize> {
        let end = off as usize + src.len();
        if end > MAXFILE_BLOCKS * BSIZE {
            return Err(MfsError::InvalidArgument("write past maximum file size"));
        }

        let mut meta = ip.write_begin();
        let mut done = 0_usize;
        while done < src.len() {
            let pos = off as usize + done;
            let bn = pos / BSIZE;
            let start = pos % BSIZE;
            let chunk = (BSIZE - start).min(src.len() - done);

            let (bno, fresh) = self.block_for_alloc(&mut meta, bn, tr)?;
            let image = self.cache.modify(bno, |data| {
                if fresh {
                    data.fill(0);
                }
                data[start..start + chunk].copy_from_slice(&src[done..done + chunk]);
            })?;
            tr.add_block(bno, image);
            done += chunk;
        }

        #[allow(clippy::cast_possible_truncation)] // end <= MAXFILE_BLOCKS * BSIZE < u32::MAX
        if end as u32 > meta.size {
            meta.size = end as u32;
        }
        self.iupdate_locked(ip.inum, &meta, tr)?;
        Ok(src.len())
    }

    /// Update the size field without touching data blocks.
    pub fn update_size(&self, ip: &Inode, size: u32, tr: &mut Transaction) -> Result<()> {
        let mut meta = ip.write_begin();
        meta.size = size;
        self.iupdate_locked(ip.inum, &meta, tr)
    }

    /// Free all data blocks past `new_size`, recording the frees in `tr`.
    ///
    /// The freed blocks stay allocated in the in-memory vector until the
    /// transaction commits; the journal's post-processing releases them.
    pub fn itrunc(&self, ip: &Inode, new_size: u32, tr: &mut Transaction) -> Result<()> {
        let mut meta = ip.write_begin();
        let keep = (new_size as usize).div_ceil(BSIZE);

        for bn in keep..NDIRECT {
            if meta.addrs[bn] != 0 {
                tr.note_freed(BlockNumber(meta.addrs[bn]));
                meta.addrs[bn] = 0;
            }
        }

        if meta.addrs[NDIRECT] != 0 {
            let ind_block = BlockNumber(meta.addrs[NDIRECT]);
            let keep_ind = keep.saturating_sub(NDIRECT);
            let image = self.cache.get(ind_block)?;
            let mut zeroed = Vec::new();
            for idx in keep_ind..BSIZE / 4 {
                let addr = read_le_u32(image.as_slice(), 4 * idx).map_err(format_err)?;
                if addr != 0 {
                    zeroed.push(idx);
                    tr.note_freed(BlockNumber(addr));
                }
            }
            if keep_ind == 0 {
                tr.note_freed(ind_block);
                meta.addrs[NDIRECT] = 0;
            } else if !zeroed.is_empty() {
                let image = self.cache.modify(ind_block, |data| {
                    for idx in zeroed {
                        put_le_u32(data, 4 * idx, 0);
                    }
                })?;
                tr.add_block(ind_block, image);
            }
        }

        meta.size = new_size;
        self.iupdate_locked(ip.inum, &meta, tr)?;
        trace!(target: "mfs::inode", inum = ip.inum.0, new_size, "itrunc");
        Ok(())
    }

    // ── Directory entries ───────────────────────────────────────────────

    /// Look a name up in a directory, returning the entry's inode number.
    pub fn dirlookup(&self, dp: &Inode, name: &Name) -> Result<Option<InodeNumber>> {
        assert!(dp.kind().is_some_and(NodeKind::is_dir));
        Ok(self
            .find_entry(dp, |entry_name, _| entry_name == *name)?
            .map(|(_, inum, _)| inum))
    }

    /// All live entries of a directory, in table order.
    pub fn read_dirents(&self, dp: &Inode) -> Result<Vec<(Name, InodeNumber)>> {
        let mut out = Vec::new();
        self.for_each_slot(dp, |slot, _| {
            let inum = read_le_u32(slot, 0).unwrap_or(0);
            if inum != 0 {
                out.push((decode_entry_name(dp, slot), InodeNumber(inum)));
            }
            false
        })?;
        Ok(out)
    }

    /// Add a `name → inum` entry to directory `dp` and take a link on the
    /// target. `dp`'s own link count is never adjusted here; a directory's
    /// `..` claim on its parent is expressed as an explicit `..` entry.
    pub fn dirlink(
        &self,
        dp: &Inode,
        name: &Name,
        inum: InodeNumber,
        isdir: bool,
        tr: &mut Transaction,
    ) -> Result<()> {
        assert!(dp.kind().is_some_and(NodeKind::is_dir));

        let mut free_slot = None;
        let existing = self.for_each_slot(dp, |slot, off| {
            let slot_inum = read_le_u32(slot, 0).unwrap_or(0);
            if slot_inum == 0 {
                if free_slot.is_none() {
                    free_slot = Some(off);
                }
                return false;
            }
            decode_entry_name(dp, slot) == *name
        })?;
        assert!(
            existing.is_none(),
            "dirlink: name {name} already present in directory {}",
            dp.inum
        );
        let off = free_slot.unwrap_or(dp.size());

        let mut entry = [0_u8; DIRENT_SIZE];
        put_le_u32(&mut entry, 0, inum.0);
        entry[4..4 + DIRSIZ].copy_from_slice(&name.to_padded());
        self.writei(dp, &entry, off, tr)?;

        let target = self.iget(inum)?;
        {
            let mut meta = target.write_begin();
            assert_eq!(
                meta.kind.is_some_and(NodeKind::is_dir),
                isdir,
                "dirlink type mismatch for {inum}"
            );
            meta.nlink += 1;
            self.iupdate_locked(inum, &meta, tr)?;
        }
        trace!(target: "mfs::inode", dir = dp.inum.0, %name, inum = inum.0, "dirlink");
        Ok(())
    }

    /// Remove the `name → inum` entry from `dp` and drop the target's link.
    pub fn dirunlink(
        &self,
        dp: &Inode,
        name: &Name,
        inum: InodeNumber,
        isdir: bool,
        tr: &mut Transaction,
    ) -> Result<()> {
        assert!(dp.kind().is_some_and(NodeKind::is_dir));

        let found = self.find_entry(dp, |entry_name, _| entry_name == *name)?;
        let Some((_, entry_inum, off)) = found else {
            panic!("dirunlink: name {name} missing from directory {}", dp.inum);
        };
        assert_eq!(entry_inum, inum, "dirunlink: stale inum for {name}");

        let zero = [0_u8; DIRENT_SIZE];
        self.writei(dp, &zero, off, tr)?;

        let target = self.iget(inum)?;
        {
            let mut meta = target.write_begin();
            assert_eq!(meta.kind.is_some_and(NodeKind::is_dir), isdir);
            assert!(meta.nlink > 0, "dirunlink: target {inum} has no links");
            meta.nlink -= 1;
            self.iupdate_locked(inum, &meta, tr)?;
        }
        trace!(target: "mfs::inode", dir = dp.inum.0, %name, inum = inum.0, "dirunlink");
        Ok(())
    }

    /// Drop the inode's clean data blocks from the buffer cache.
    pub fn drop_bufcache(&self, ip: &Inode) -> usize {
        let meta = *ip.read();
        let mut evicted = 0_usize;
        for addr in &meta.addrs[..NDIRECT] {
            if *addr != 0 && self.cache.evict_if_clean(BlockNumber(*addr)) {
                evicted += 1;
            }
        }
        if meta.addrs[NDIRECT] != 0 {
            let ind_block = BlockNumber(meta.addrs[NDIRECT]);
            if let Ok(image) = self.cache.get(ind_block) {
                for idx in 0..BSIZE / 4 {
                    let addr = read_le_u32(image.as_slice(), 4 * idx).unwrap_or(0);
                    if addr != 0 && self.cache.evict_if_clean(BlockNumber(addr)) {
                        evicted += 1;
                    }
                }
            }
            if self.cache.evict_if_clean(ind_block) {
                evicted += 1;
            }
        }
        evicted
    }

    // ── Scan helpers ────────────────────────────────────────────────────

    /// Walk every entry slot (live or empty) in `dp`. The callback returns
    /// `true` to stop; `for_each_slot` then reports the stop offset.
    fn for_each_slot(
        &self,
        dp: &Inode,
        mut f: impl FnMut(&[u8], u32) -> bool,
    ) -> Result<Option<u32>> {
        let size = dp.size();
        let mut buf = vec![0_u8; BSIZE];
        let mut base = 0_u32;
        while base < size {
            let n = self.readi(dp, &mut buf, base)?;
            if n == 0 {
                break;
            }
            for slot_start in (0..n).step_by(DIRENT_SIZE) {
                if slot_start + DIRENT_SIZE > n {
                    break;
                }
                #[allow(clippy::cast_possible_truncation)] // offsets fit u32 with size
                let off = base + slot_start as u32;
                if f(&buf[slot_start..slot_start + DIRENT_SIZE], off) {
                    return Ok(Some(off));
                }
            }
            #[allow(clippy::cast_possible_truncation)]
            {
                base += n as u32;
            }
        }
        Ok(None)
    }

    /// Find the first live entry matching the predicate.
    fn find_entry(
        &self,
        dp: &Inode,
        mut pred: impl FnMut(Name, InodeNumber) -> bool,
    ) -> Result<Option<(Name, InodeNumber, u32)>> {
        let mut found = None;
        self.for_each_slot(dp, |slot, off| {
            let inum = read_le_u32(slot, 0).unwrap_or(0);
            if inum == 0 {
                return false;
            }
            let name = decode_entry_name(dp, slot);
            if pred(name, InodeNumber(inum)) {
                found = Some((name, InodeNumber(inum), off));
                return true;
            }
            false
        })?;
        Ok(found)
    }
}

/// Decode a live slot's name; a malformed name on disk is corruption.
fn decode_entry_name(dp: &Inode, slot: &[u8]) -> Name {
    let raw: [u8; DIRSIZ] = read_fixed(slot, 4).expect("slot is DIRENT_SIZE bytes");
    match Name::from_padded(&raw) {
        Ok(name) => name,
        Err(e) => panic!("corrupt dirent in inode {}: {e}", dp.inum),
    }
}
