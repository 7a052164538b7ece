//! The MFS facade.
//!
//! Everything the VFS layer calls: mount and recovery, lazy mnode
//! population, namespace mutation (which only appends to the logical log),
//! file page I/O, and the `fsync`/`sync` paths that drive the assembler and
//! the physical journal.

use crate::ident::IdentityMaps;
use crate::mnode::{Mnode, Page};
use mfs_alloc::FreeBitVector;
use mfs_block::{BlockDevice, BufCache, Transaction};
use mfs_error::{MfsError, Result};
use mfs_inode::InodeStore;
use mfs_journal::Journal;
use mfs_oplog::{LogicalLog, MetadataOp, OplogConfig};
use mfs_types::{
    BSIZE, BlockNumber, DIRSIZ, JOURNAL_FILE_NAME, MnodeId, NodeKind, ROOT_INUM, Superblock,
    Timestamp,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Mount-time configuration.
#[derive(Debug, Clone, Default)]
pub struct MfsConfig {
    pub oplog: OplogConfig,
}

/// The glue facade over the store, the logical log, and the journal.
pub struct MfsInterface {
    pub(crate) store: Arc<InodeStore>,
    pub(crate) ident: IdentityMaps,
    journal: Journal,
    log: Arc<LogicalLog>,
    next_mnode_id: AtomicU64,
    root: OnceLock<Arc<Mnode>>,
    /// Serialises renames that move directories.
    rename_lock: Mutex<()>,
}

impl std::fmt::Debug for MfsInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MfsInterface")
            .field("sb", self.store.superblock())
            .finish()
    }
}

impl MfsInterface {
    /// Mount the filesystem on `dev`.
    ///
    /// Recovery runs before the free-bit vector is built, because replayed
    /// transactions may rewrite the bitmap blocks.
    pub fn mount(dev: Arc<dyn BlockDevice>, config: &MfsConfig) -> Result<Arc<Self>> {
        let cache = Arc::new(BufCache::new(dev));
        let sb_image = cache.get(BlockNumber(0))?;
        let sb = Superblock::parse(sb_image.as_slice())
            .map_err(|e| MfsError::Format(e.to_string()))?;

        let alloc = Arc::new(FreeBitVector::new());
        let store = InodeStore::new(cache, sb, Arc::clone(&alloc));

        let journal = Journal::open(&store)?;
        let replay = journal.process_journal()?;
        alloc.initialize(store.cache(), &sb)?;

        let log = Arc::new(LogicalLog::new(config.oplog));
        log.preload(&config.oplog);

        let fs = Arc::new(Self {
            store,
            ident: IdentityMaps::default(),
            journal,
            log,
            next_mnode_id: AtomicU64::new(1),
            root: OnceLock::new(),
            rename_lock: Mutex::new(()),
        });
        fs.load_root()?;
        info!(
            target: "mfs::core",
            size = sb.size,
            ninodes = sb.ninodes,
            replayed = replay.sealed_transactions,
            "mounted"
        );
        Ok(fs)
    }

    fn next_id(&self) -> MnodeId {
        MnodeId(self.next_mnode_id.fetch_add(1, Ordering::AcqRel))
    }

    /// The root mnode, built on first use.
    pub fn load_root(&self) -> Result<Arc<Mnode>> {
        if let Some(root) = self.root.get() {
            return Ok(Arc::clone(root));
        }
        let ip = self.store.iget(ROOT_INUM)?;
        assert_eq!(ip.kind(), Some(NodeKind::Dir), "root inode is not a directory");
        let m = Mnode::new_root(self.next_id(), Arc::clone(&self.log));
        self.ident.bind(&m, ROOT_INUM);
        let root = self.root.get_or_init(|| m);
        Ok(Arc::clone(root))
    }

    #[must_use]
    pub fn root(&self) -> Arc<Mnode> {
        Arc::clone(self.root.get().expect("mounted"))
    }

    // ── Oplog append protocol ───────────────────────────────────────────

    /// Open `cpu`'s append window: an operation at `ts` is being built.
    pub fn metadata_op_start(&self, cpu: usize, ts: Timestamp) {
        self.log.update_start_tsc(cpu, ts);
    }

    /// Close `cpu`'s append window.
    pub fn metadata_op_end(&self, cpu: usize, ts: Timestamp) {
        self.log.update_end_tsc(cpu, ts);
    }

    /// Append a metadata operation to the logical log.
    pub fn add_to_metadata_log(&self, cpu: usize, op: MetadataOp) {
        self.log.add_operation(cpu, op);
    }

    #[must_use]
    pub fn oplog(&self) -> &Arc<LogicalLog> {
        &self.log
    }

    /// Bracketed append through a checked-out core slot. The slot is ours
    /// alone until the window closes, so the barrier can trust it.
    fn log_operation(&self, build: impl FnOnce(Timestamp) -> MetadataOp) {
        let slot = self.log.checkout_core();
        let cpu = slot.index();
        let ts = self.log.clock().next();
        self.metadata_op_start(cpu, ts);
        self.add_to_metadata_log(cpu, build(ts));
        self.metadata_op_end(cpu, ts);
    }

    // ── Lazy population ─────────────────────────────────────────────────

    /// Build (or find) the mnode for an on-disk inode reached through a
    /// directory scan. Directories get their `..` reference to `parent`.
    fn load_dir_entry(&self, inum: mfs_types::InodeNumber, parent: &Arc<Mnode>) -> Result<Option<Arc<Mnode>>> {
        if let Some(m) = self.ident.mnode_by_inum(inum) {
            return Ok(Some(m));
        }
        let ip = self.store.iget(inum)?;
        let Some(kind) = ip.kind() else {
            return Ok(None);
        };
        let m = Mnode::new(self.next_id(), kind, Arc::clone(&self.log));
        self.ident.bind(&m, inum);
        if kind.is_dir() {
            m.as_dir()
                .entries
                .lock()
                .insert("..".to_owned(), Arc::clone(parent));
        }
        Ok(Some(m))
    }

    /// Populate a directory mnode from its on-disk entries on first use.
    ///
    /// `.` is never stored. `..` is skipped here: a child's `..` is
    /// installed when the child is built, and the root's `..` is itself by
    /// construction. The journal file is not part of the namespace.
    pub fn initialize_dir(&self, m: &Arc<Mnode>) -> Result<()> {
        assert!(m.is_dir());
        if !m.mark_initialized() {
            return Ok(());
        }
        let Some(inum) = self.ident.inum_of(m.id()) else {
            return Ok(());
        };
        let is_root = inum == ROOT_INUM;
        let dp = self.store.iget(inum)?;
        for (name, child_inum) in self.store.read_dirents(&dp)? {
            if name.is_dotdot() || (is_root && name.as_str() == JOURNAL_FILE_NAME) {
                continue;
            }
            let Some(child) = self.load_dir_entry(child_inum, m)? else {
                continue;
            };
            // Each entry holds an mnode link, mirroring the on-disk count.
            child.link_acquire();
            m.as_dir()
                .entries
                .lock()
                .insert(name.as_str().to_owned(), child);
        }
        debug!(target: "mfs::core", mnode = m.id().0, inum = inum.0, "dir_initialized");
        Ok(())
    }

    /// Adopt the on-disk file size on first reference, so page reads can
    /// tell demand-load from fresh allocation.
    pub fn initialize_file(&self, m: &Arc<Mnode>) -> Result<()> {
        assert!(!m.is_dir());
        if !m.mark_initialized() {
            return Ok(());
        }
        if let Some(inum) = self.ident.inum_of(m.id()) {
            let ip = self.store.iget(inum)?;
            m.as_file()
                .size
                .store(u64::from(ip.size()), Ordering::Release);
        }
        Ok(())
    }

    // ── Namespace operations ────────────────────────────────────────────

    /// Create a file, directory, or symlink under `parent`.
    pub fn create(&self, parent: &Arc<Mnode>, name: &str, kind: NodeKind) -> Result<Arc<Mnode>> {
        self.check_dir(parent)?;
        check_name(name)?;
        self.initialize_dir(parent)?;

        let m = {
            let mut entries = parent.as_dir().entries.lock();
            if entries.contains_key(name) {
                return Err(MfsError::Exists);
            }
            let m = Mnode::new(self.next_id(), kind, Arc::clone(&self.log));
            self.ident.register(&m);
            m.mark_initialized();
            if kind.is_dir() {
                m.as_dir()
                    .entries
                    .lock()
                    .insert("..".to_owned(), Arc::clone(parent));
            }
            entries.insert(name.to_owned(), Arc::clone(&m));
            m.link_acquire();
            m
        };

        self.log_operation(|ts| MetadataOp::Create {
            mnode: m.id(),
            parent: parent.id(),
            kind,
            name: name.to_owned(),
            timestamp: ts,
        });
        debug!(target: "mfs::core", mnode = m.id().0, name, %kind, "create");
        Ok(m)
    }

    /// Resolve one name in a directory. `.` is implicit; the root's `..`
    /// is itself.
    pub fn lookup(&self, dir: &Arc<Mnode>, name: &str) -> Result<Option<Arc<Mnode>>> {
        self.check_dir(dir)?;
        if name == "." {
            return Ok(Some(Arc::clone(dir)));
        }
        self.initialize_dir(dir)?;
        if name == ".." {
            let entry = dir.as_dir().entries.lock().get("..").cloned();
            return Ok(Some(entry.unwrap_or_else(|| Arc::clone(dir))));
        }
        Ok(dir.as_dir().entries.lock().get(name).cloned())
    }

    /// Add a hard link to a file.
    pub fn link(&self, dir: &Arc<Mnode>, name: &str, m: &Arc<Mnode>) -> Result<()> {
        self.check_dir(dir)?;
        check_name(name)?;
        if m.is_dir() {
            return Err(MfsError::IsDirectory);
        }
        self.initialize_dir(dir)?;

        {
            let mut entries = dir.as_dir().entries.lock();
            if entries.contains_key(name) {
                return Err(MfsError::Exists);
            }
            entries.insert(name.to_owned(), Arc::clone(m));
            m.link_acquire();
        }

        self.log_operation(|ts| MetadataOp::Link {
            parent: dir.id(),
            name: name.to_owned(),
            mnode: m.id(),
            kind: m.kind(),
            timestamp: ts,
        });
        Ok(())
    }

    /// Remove one name. Directories must be empty. The on-disk inode
    /// outlives this call; its delete is enqueued when the last reference
    /// drops.
    pub fn unlink(&self, dir: &Arc<Mnode>, name: &str) -> Result<()> {
        self.check_dir(dir)?;
        check_name(name)?;
        self.initialize_dir(dir)?;

        let removed = {
            let entries = dir.as_dir().entries.lock();
            let Some(m) = entries.get(name) else {
                return Err(MfsError::NotFound(name.to_owned()));
            };
            Arc::clone(m)
        };

        if removed.is_dir() {
            self.initialize_dir(&removed)?;
            let child_entries = removed.as_dir().entries.lock();
            if child_entries.keys().any(|k| k != "..") {
                return Err(MfsError::NotEmpty);
            }
        }

        {
            let mut entries = dir.as_dir().entries.lock();
            entries.remove(name);
            removed.link_release();
        }
        if removed.is_dir() {
            // Drop the child's `..` pin on this directory.
            removed.as_dir().entries.lock().remove("..");
        }

        self.log_operation(|ts| MetadataOp::Unlink {
            parent: dir.id(),
            name: name.to_owned(),
            mnode: removed.id(),
            kind: removed.kind(),
            timestamp: ts,
        });
        debug!(target: "mfs::core", mnode = removed.id().0, name, "unlink");
        Ok(())
        // `removed` drops here; if that was the last reference the
        // deferred delete lands after the unlink in timestamp order.
    }

    /// Move `name` from `parent` to `new_name` in `new_parent`, replacing
    /// a compatible target. Renames that move a directory serialise on a
    /// global lock.
    pub fn rename(
        &self,
        parent: &Arc<Mnode>,
        name: &str,
        new_parent: &Arc<Mnode>,
        new_name: &str,
    ) -> Result<()> {
        self.check_dir(parent)?;
        self.check_dir(new_parent)?;
        check_name(name)?;
        check_name(new_name)?;
        self.initialize_dir(parent)?;
        self.initialize_dir(new_parent)?;

        let m = self
            .lookup(parent, name)?
            .ok_or_else(|| MfsError::NotFound(name.to_owned()))?;

        let _serial = if m.is_dir() {
            // Moving a directory re-parents a subtree; two such renames
            // must not interleave or they could create a cycle.
            let guard = self.rename_lock.lock();
            self.check_not_ancestor(&m, new_parent)?;
            Some(guard)
        } else {
            None
        };

        if parent.id() == new_parent.id() && name == new_name {
            return Ok(());
        }

        let displaced = {
            let mut target_entries = new_parent.as_dir().entries.lock();
            if let Some(existing) = target_entries.get(new_name) {
                if existing.is_dir() {
                    return Err(MfsError::IsDirectory);
                }
                if m.is_dir() {
                    return Err(MfsError::NotDirectory);
                }
            }
            let displaced = target_entries.insert(new_name.to_owned(), Arc::clone(&m));
            m.link_acquire();
            displaced
        };
        if let Some(old) = &displaced {
            old.link_release();
        }

        {
            let mut entries = parent.as_dir().entries.lock();
            entries.remove(name);
            m.link_release();
        }

        if m.is_dir() && parent.id() != new_parent.id() {
            m.as_dir()
                .entries
                .lock()
                .insert("..".to_owned(), Arc::clone(new_parent));
        }

        self.log_operation(|ts| MetadataOp::Rename {
            parent: parent.id(),
            name: name.to_owned(),
            new_parent: new_parent.id(),
            new_name: new_name.to_owned(),
            mnode: m.id(),
            kind: m.kind(),
            timestamp: ts,
        });
        debug!(
            target: "mfs::core",
            mnode = m.id().0,
            from = name,
            to = new_name,
            "rename"
        );
        Ok(())
    }

    /// Live entries of a directory, `..` excluded.
    pub fn readdir(&self, dir: &Arc<Mnode>) -> Result<Vec<(String, MnodeId)>> {
        self.check_dir(dir)?;
        self.initialize_dir(dir)?;
        Ok(dir
            .as_dir()
            .entries
            .lock()
            .iter()
            .filter(|(name, _)| name.as_str() != "..")
            .map(|(name, m)| (name.clone(), m.id()))
            .collect())
    }

    /// Create a symlink whose content is `target`.
    pub fn symlink(&self, parent: &Arc<Mnode>, name: &str, target: &str) -> Result<Arc<Mnode>> {
        let m = self.create(parent, name, NodeKind::Symlink)?;
        self.write_file(&m, target.as_bytes(), 0)?;
        Ok(m)
    }

    /// Read a symlink's target.
    pub fn readlink(&self, m: &Arc<Mnode>) -> Result<String> {
        if m.kind() != NodeKind::Symlink {
            return Err(MfsError::InvalidArgument("not a symlink"));
        }
        let mut buf = vec![0_u8; usize::try_from(m.size()).unwrap_or(0)];
        let n = self.read_file(m, &mut buf, 0)?;
        buf.truncate(n);
        String::from_utf8(buf).map_err(|_| MfsError::InvalidArgument("symlink target not UTF-8"))
    }

    fn check_dir(&self, m: &Arc<Mnode>) -> Result<()> {
        if !m.is_dir() {
            return Err(MfsError::NotDirectory);
        }
        Ok(())
    }

    /// Reject moving a directory under its own descendant.
    fn check_not_ancestor(&self, m: &Arc<Mnode>, new_parent: &Arc<Mnode>) -> Result<()> {
        let mut cursor = Arc::clone(new_parent);
        loop {
            if cursor.id() == m.id() {
                return Err(MfsError::InvalidArgument(
                    "cannot move a directory under itself",
                ));
            }
            let up = cursor.as_dir().entries.lock().get("..").cloned();
            match up {
                Some(next) if next.id() != cursor.id() => cursor = next,
                _ => return Ok(()),
            }
        }
    }

    // ── File page I/O ───────────────────────────────────────────────────

    /// Read from a file's page index, demand-loading pages from the disk
    /// on first touch. Reads past the size return a short count.
    pub fn read_file(&self, m: &Arc<Mnode>, dst: &mut [u8], pos: u64) -> Result<usize> {
        if m.is_dir() {
            return Err(MfsError::IsDirectory);
        }
        self.initialize_file(m)?;
        let size = m.size();
        if pos >= size {
            return Ok(0);
        }
        let n = dst.len().min((size - pos) as usize);
        let file = m.as_file();
        let backing = self.ident.inum_of(m.id());

        let mut done = 0_usize;
        while done < n {
            let at = pos + done as u64;
            #[allow(clippy::cast_possible_truncation)] // file sizes are u32-bounded
            let page_idx = (at / BSIZE as u64) as u32;
            let start = (at % BSIZE as u64) as usize;
            let chunk = (BSIZE - start).min(n - done);

            let mut pages = file.pages.lock();
            if !pages.contains_key(&page_idx) {
                let mut page = Page::zeroed();
                if let Some(inum) = backing {
                    let ip = self.store.iget(inum)?;
                    self.store
                        .readi(&ip, &mut page.bytes, page_idx * BSIZE as u32)?;
                }
                pages.insert(page_idx, page);
            }
            let page = pages.get(&page_idx).expect("just inserted");
            dst[done..done + chunk].copy_from_slice(&page.bytes[start..start + chunk]);
            done += chunk;
        }
        Ok(n)
    }

    /// Write into the page index and extend the size. Nothing reaches the
    /// disk until `fsync`/`sync`; a full device fails the write up front so
    /// existing data is unaffected.
    pub fn write_file(&self, m: &Arc<Mnode>, src: &[u8], pos: u64) -> Result<usize> {
        if m.is_dir() {
            return Err(MfsError::IsDirectory);
        }
        self.initialize_file(m)?;
        let file = m.as_file();
        let _resize = file.resizer.lock();
        let backing = self.ident.inum_of(m.id());
        let disk_size = match backing {
            Some(inum) => u64::from(self.store.iget(inum)?.size()),
            None => 0,
        };

        let mut done = 0_usize;
        while done < src.len() {
            let at = pos + done as u64;
            #[allow(clippy::cast_possible_truncation)]
            let page_idx = (at / BSIZE as u64) as u32;
            let start = (at % BSIZE as u64) as usize;
            let chunk = (BSIZE - start).min(src.len() - done);

            let mut pages = file.pages.lock();
            if !pages.contains_key(&page_idx) {
                let page_start = u64::from(page_idx) * BSIZE as u64;
                let mut page = Page::zeroed();
                if page_start < disk_size {
                    let ip = self.store.iget(backing.expect("backed"))?;
                    self.store
                        .readi(&ip, &mut page.bytes, page_idx * BSIZE as u32)?;
                } else if self.store.allocator().free_count() == 0 {
                    // A page with no backing block yet; refuse while the
                    // device is full rather than failing later in fsync.
                    return Err(MfsError::NoSpace);
                }
                pages.insert(page_idx, page);
            }
            let page = pages.get_mut(&page_idx).expect("just inserted");
            page.bytes[start..start + chunk].copy_from_slice(&src[done..done + chunk]);
            page.dirty = true;
            done += chunk;
        }

        let end = pos + src.len() as u64;
        if end > file.size.load(Ordering::Acquire) {
            file.size.store(end, Ordering::Release);
        }
        Ok(src.len())
    }

    /// Shrink or extend the in-memory file. Pages wholly past the new size
    /// are reclaimed; the partial tail is zeroed. The on-disk truncation
    /// happens at the next sync.
    pub fn truncate(&self, m: &Arc<Mnode>, len: u64) -> Result<()> {
        if m.is_dir() {
            return Err(MfsError::IsDirectory);
        }
        self.initialize_file(m)?;
        let file = m.as_file();
        let _resize = file.resizer.lock();

        if len < file.size.load(Ordering::Acquire) {
            let mut pages = file.pages.lock();
            #[allow(clippy::cast_possible_truncation)]
            let boundary = (len / BSIZE as u64) as u32;
            let cut = (len % BSIZE as u64) as usize;
            pages.retain(|idx, _| *idx < boundary || (*idx == boundary && cut > 0));
            if cut > 0 {
                if let Some(page) = pages.get_mut(&boundary) {
                    page.bytes[cut..].fill(0);
                    page.dirty = true;
                }
            }
        }
        file.size.store(len, Ordering::Release);
        Ok(())
    }

    /// Flush a file's dirty pages and size through one transaction.
    pub fn sync_file(&self, m: &Arc<Mnode>) -> Result<()> {
        assert!(!m.is_dir());
        if !m.is_initialized() {
            return Ok(());
        }
        let Some(inum) = self.ident.inum_of(m.id()) else {
            // Never reached the disk; the metadata flush that creates the
            // inode runs before the data path on every sync.
            return Ok(());
        };
        let file = m.as_file();
        let _resize = file.resizer.lock();
        let ip = self.store.iget(inum)?;
        let mem_size = file.size.load(Ordering::Acquire);
        let disk_size = u64::from(ip.size());

        let dirty: Vec<(u32, Vec<u8>)> = {
            let pages = file.pages.lock();
            pages
                .iter()
                .filter(|(idx, page)| {
                    page.dirty && u64::from(**idx) * (BSIZE as u64) < mem_size
                })
                .map(|(idx, page)| (*idx, page.bytes.clone()))
                .collect()
        };
        if dirty.is_empty() && mem_size == disk_size {
            return Ok(());
        }

        let ts = self.log.clock().next();
        let mut tr = Transaction::new(ts);
        let result = (|| -> Result<()> {
            for (idx, bytes) in &dirty {
                let page_start = u64::from(*idx) * BSIZE as u64;
                let n = BSIZE.min((mem_size - page_start) as usize);
                self.store
                    .writei(&ip, &bytes[..n], *idx * BSIZE as u32, &mut tr)?;
            }
            #[allow(clippy::cast_possible_truncation)] // sizes are u32-bounded
            if mem_size < disk_size {
                self.store.itrunc(&ip, mem_size as u32, &mut tr)?;
            } else {
                self.store.update_size(&ip, mem_size as u32, &mut tr)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {}
            Err(MfsError::NoSpace) => {
                // Short write. The pages written so far, the blocks they
                // claimed, and the inode all agree; commit that prefix so
                // the failure leaves no half-recorded allocations behind.
                self.store.iupdate(&ip, &mut tr)?;
                self.journal.prepare_for_commit().commit_single(tr)?;
                return Err(MfsError::NoSpace);
            }
            Err(e) => return Err(e),
        }

        self.journal.prepare_for_commit().commit_single(tr)?;

        let mut pages = file.pages.lock();
        for (idx, bytes) in &dirty {
            if let Some(page) = pages.get_mut(idx) {
                if page.bytes == *bytes {
                    page.dirty = false;
                }
            }
        }
        debug!(target: "mfs::core", mnode = m.id().0, pages = dirty.len(), "file_synced");
        Ok(())
    }

    // ── The original page-level entry points ────────────────────────────

    /// Read file bytes straight from the inode layer.
    pub fn load_file_page(&self, id: MnodeId, buf: &mut [u8], pos: u32) -> Result<usize> {
        let ip = self.get_inode(id, "load_file_page");
        self.store.readi(&ip, buf, pos)
    }

    /// Write file bytes through a transaction.
    pub fn sync_file_page(
        &self,
        id: MnodeId,
        buf: &[u8],
        pos: u32,
        tr: &mut Transaction,
    ) -> Result<usize> {
        let ip = self.get_inode(id, "sync_file_page");
        self.store.writei(&ip, buf, pos, tr)
    }

    /// The on-disk file size.
    #[must_use]
    pub fn get_file_size(&self, id: MnodeId) -> u32 {
        self.get_inode(id, "get_file_size").size()
    }

    /// Update the on-disk size field.
    pub fn update_file_size(&self, id: MnodeId, size: u32, tr: &mut Transaction) -> Result<()> {
        let ip = self.get_inode(id, "update_file_size");
        self.store.update_size(&ip, size, tr)
    }

    /// Truncate the on-disk file and drop the mnode's pages past `off`.
    pub fn truncate_file(&self, id: MnodeId, off: u32, tr: &mut Transaction) -> Result<()> {
        let ip = self.get_inode(id, "truncate_file");
        self.store.itrunc(&ip, off, tr)?;
        if let Some(m) = self.ident.mnode_by_id(id) {
            if !m.is_dir() {
                let boundary = off.div_ceil(BSIZE as u32);
                m.as_file().pages.lock().retain(|idx, _| *idx < boundary);
            }
        }
        Ok(())
    }

    // ── Sync and fsync ──────────────────────────────────────────────────

    /// Apply every logged metadata operation and flush the journal.
    pub fn process_metadata_log_and_flush(&self) -> Result<()> {
        let mut journal = self.journal.prepare_for_commit();
        let ops = {
            let max = self.log.clock().current();
            let mut guard = self.log.wait_synchronize(max);
            guard.take_all()
        };
        for op in ops {
            let mut tr = Transaction::new(op.timestamp());
            self.apply_op(&op, &mut tr)?;
            journal.add_transaction(tr);
        }
        journal.flush()
    }

    /// Apply only the dependency closure of `id` and flush the journal.
    /// Operations outside the closure stay logged for a later flush.
    pub fn process_metadata_log_and_flush_for(
        &self,
        max: Timestamp,
        id: MnodeId,
        isdir: bool,
    ) -> Result<()> {
        let mut journal = self.journal.prepare_for_commit();
        let ops = {
            let mut guard = self.log.wait_synchronize(max);
            guard.take_dependent(id, isdir)
        };
        for op in ops {
            let mut tr = Transaction::new(op.timestamp());
            self.apply_op(&op, &mut tr)?;
            journal.add_transaction(tr);
        }
        journal.flush()
    }

    /// Durability point for one mnode: its metadata dependency closure,
    /// then (for files) its data pages.
    pub fn fsync(&self, m: &Arc<Mnode>) -> Result<()> {
        let max = self.log.clock().current();
        self.process_metadata_log_and_flush_for(max, m.id(), m.is_dir())?;
        if !m.is_dir() {
            self.sync_file(m)?;
        }
        Ok(())
    }

    /// Full filesystem sync: all metadata, then every dirty file.
    pub fn sync(&self) -> Result<()> {
        self.process_metadata_log_and_flush()?;
        self.sync_dirty_files()
    }

    /// Flush every mapped file's dirty pages.
    pub fn sync_dirty_files(&self) -> Result<()> {
        for m in self.ident.live_mapped_mnodes() {
            if !m.is_dir() {
                self.sync_file(&m)?;
            }
        }
        Ok(())
    }

    // ── Cache eviction and statistics ───────────────────────────────────

    /// Drop clean buffer-cache blocks belonging to mapped files.
    pub fn evict_bufcache(&self) -> usize {
        info!(target: "mfs::core", "evict_caches: dropping buffer-cache blocks");
        let mut evicted = 0_usize;
        for m in self.ident.live_mapped_mnodes() {
            if m.is_dir() {
                continue;
            }
            if let Some(inum) = self.ident.inum_of(m.id()) {
                if let Ok(ip) = self.store.iget(inum) {
                    evicted += self.store.drop_bufcache(&ip);
                }
            }
        }
        evicted
    }

    /// Drop clean page-cache pages of initialized files. Uninitialized
    /// files are skipped: they have no pages, and initialization itself
    /// costs memory.
    pub fn evict_pagecache(&self) -> usize {
        info!(target: "mfs::core", "evict_caches: dropping page-cache pages");
        let mut evicted = 0_usize;
        for m in self.ident.live_mapped_mnodes() {
            if m.is_dir() || !m.is_initialized() {
                continue;
            }
            let mut pages = m.as_file().pages.lock();
            let before = pages.len();
            pages.retain(|_, page| page.dirty);
            evicted += before - pages.len();
        }
        evicted
    }

    /// Approximate free-block statistics for the blkstats device.
    #[must_use]
    pub fn free_block_stats(&self) -> (u64, u64) {
        self.store.allocator().scan_free()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<InodeStore> {
        &self.store
    }

    #[must_use]
    pub fn identity_maps(&self) -> &IdentityMaps {
        &self.ident
    }
}

/// Names arriving from the VFS: bounded, no separators, not `.`/`..`.
fn check_name(name: &str) -> Result<()> {
    if name.len() > DIRSIZ {
        return Err(MfsError::NameTooLong);
    }
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(MfsError::InvalidArgument("invalid name"));
    }
    Ok(())
}
