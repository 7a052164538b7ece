//! In-memory namespace nodes.
//!
//! An mnode is the filesystem's logical object: a directory holds a map
//! from names to mnode references, a file holds a sparse page index. Shared
//! ownership is plain `Arc`; a directory entry pins its child, and a child
//! directory pins its parent only through its `..` reference.

use mfs_oplog::{LogicalLog, MetadataOp};
use mfs_types::{BSIZE, MnodeId, NodeKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::trace;

/// One cached file page.
#[derive(Debug, Clone)]
pub(crate) struct Page {
    pub bytes: Vec<u8>,
    pub dirty: bool,
}

impl Page {
    pub(crate) fn zeroed() -> Self {
        Self {
            bytes: vec![0_u8; BSIZE],
            dirty: false,
        }
    }
}

/// Directory state: insertion-ordered is irrelevant; names are unique.
/// `.` is implicit and never stored; `..` is stored for non-root
/// directories and does not count toward the child's link tally.
#[derive(Debug, Default)]
pub(crate) struct DirState {
    pub entries: Mutex<BTreeMap<String, Arc<Mnode>>>,
}

/// File state: a sparse page index plus a size field whose changes are
/// serialised by the resizer lock. Pages strictly past the size may exist
/// transiently; truncation reclaims them.
#[derive(Debug, Default)]
pub(crate) struct FileState {
    pub pages: Mutex<BTreeMap<u32, Page>>,
    pub size: AtomicU64,
    pub resizer: Mutex<()>,
}

#[derive(Debug)]
pub(crate) enum MnodeState {
    Dir(DirState),
    File(FileState),
}

/// In-memory namespace node. The id never changes and is never reused.
#[derive(Debug)]
pub struct Mnode {
    id: MnodeId,
    kind: NodeKind,
    log: Arc<LogicalLog>,
    /// Directory entries currently naming this node (`..` excluded).
    links: AtomicU32,
    initialized: AtomicBool,
    pub(crate) state: MnodeState,
}

impl Mnode {
    pub(crate) fn new(id: MnodeId, kind: NodeKind, log: Arc<LogicalLog>) -> Arc<Self> {
        let state = match kind {
            NodeKind::Dir => MnodeState::Dir(DirState::default()),
            NodeKind::File | NodeKind::Symlink => MnodeState::File(FileState::default()),
        };
        Arc::new(Self {
            id,
            kind,
            log,
            links: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            state,
        })
    }

    /// The root mnode starts with one link: its own `..` is itself, and
    /// that self-reference is accounted for here so the root is never
    /// considered unlinked.
    pub(crate) fn new_root(id: MnodeId, log: Arc<LogicalLog>) -> Arc<Self> {
        let root = Self::new(id, NodeKind::Dir, log);
        root.links.store(1, Ordering::Release);
        root
    }

    #[must_use]
    pub fn id(&self) -> MnodeId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    #[must_use]
    pub fn links(&self) -> u32 {
        self.links.load(Ordering::Acquire)
    }

    pub(crate) fn link_acquire(&self) {
        self.links.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn link_release(&self) {
        let prev = self.links.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "mnode {} link underflow", self.id);
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Returns whether this call performed the transition.
    pub(crate) fn mark_initialized(&self) -> bool {
        !self.initialized.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn as_dir(&self) -> &DirState {
        match &self.state {
            MnodeState::Dir(dir) => dir,
            MnodeState::File(_) => panic!("mnode {} is not a directory", self.id),
        }
    }

    pub(crate) fn as_file(&self) -> &FileState {
        match &self.state {
            MnodeState::File(file) => file,
            MnodeState::Dir(_) => panic!("mnode {} is not a file", self.id),
        }
    }

    /// In-memory file size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.as_file().size.load(Ordering::Acquire)
    }
}

impl Drop for Mnode {
    /// The last reference to an unlinked mnode enqueues the deferred
    /// on-disk delete. Unlink itself only removes the directory entry:
    /// user space may still hold open descriptors, so the inode can be
    /// reclaimed only once the link count is zero *and* the last reference
    /// is gone — which is exactly this drop.
    fn drop(&mut self) {
        if self.links.load(Ordering::Acquire) != 0 {
            return;
        }
        let slot = self.log.checkout_core();
        let cpu = slot.index();
        let ts = self.log.clock().next();
        self.log.update_start_tsc(cpu, ts);
        self.log.add_operation(
            cpu,
            MetadataOp::Delete {
                mnode: self.id,
                timestamp: ts,
            },
        );
        self.log.update_end_tsc(cpu, ts);
        trace!(target: "mfs::core", mnode = self.id.0, ts = ts.0, "delete_enqueued");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfs_oplog::OplogConfig;
    use mfs_types::Timestamp;

    fn test_log() -> Arc<LogicalLog> {
        Arc::new(LogicalLog::new(OplogConfig {
            cores: 1,
            per_core_capacity: 8,
        }))
    }

    fn drain(log: &LogicalLog) -> Vec<MetadataOp> {
        log.wait_synchronize(Timestamp(u64::MAX)).take_all()
    }

    #[test]
    fn unlinked_mnode_enqueues_delete_on_drop() {
        let log = test_log();
        let m = Mnode::new(MnodeId(7), NodeKind::File, Arc::clone(&log));
        m.link_acquire();
        m.link_release();
        drop(m);

        let ops = drain(&log);
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0],
            MetadataOp::Delete {
                mnode: MnodeId(7),
                ..
            }
        ));
    }

    #[test]
    fn linked_mnode_drops_without_delete() {
        let log = test_log();
        let m = Mnode::new(MnodeId(8), NodeKind::File, Arc::clone(&log));
        m.link_acquire();
        drop(m);
        assert!(drain(&log).is_empty());
    }

    #[test]
    fn root_self_link_prevents_delete() {
        let log = test_log();
        let root = Mnode::new_root(MnodeId(1), Arc::clone(&log));
        assert_eq!(root.links(), 1);
        drop(root);
        assert!(drain(&log).is_empty());
    }

    #[test]
    #[should_panic(expected = "link underflow")]
    fn link_underflow_is_fatal() {
        let log = test_log();
        let m = Mnode::new(MnodeId(9), NodeKind::File, log);
        m.link_release();
    }
}
