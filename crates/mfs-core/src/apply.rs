//! The transaction assembler.
//!
//! Converts one logical operation into inode-level mutations attributed to
//! a physical transaction: every touched block image lands in the
//! transaction's block set, every allocation and free in its lists. All
//! application happens under the journal's exclusive commit lock, in
//! ascending timestamp order.

use crate::interface::MfsInterface;
use mfs_block::Transaction;
use mfs_error::Result;
use mfs_inode::Inode;
use mfs_oplog::MetadataOp;
use mfs_types::{InodeNumber, MnodeId, Name, NodeKind};
use std::sync::Arc;
use tracing::trace;

impl MfsInterface {
    /// Apply one logical operation to `tr`.
    pub(crate) fn apply_op(&self, op: &MetadataOp, tr: &mut Transaction) -> Result<()> {
        trace!(target: "mfs::core", ts = op.timestamp().0, mnode = op.mnode().0, "apply_op");
        match op {
            MetadataOp::Create {
                mnode,
                parent,
                kind,
                name,
                ..
            } => {
                // Sync the parent directory entry too.
                self.create_node_if_new(*mnode, *parent, *kind, name, tr, true)?;
                Ok(())
            }
            MetadataOp::Link {
                parent,
                name,
                mnode,
                kind,
                ..
            } => self.create_directory_entry(*parent, name, *mnode, *kind, tr),
            MetadataOp::Unlink {
                parent, name, ..
            } => self.unlink_old_inode(*parent, name, tr),
            MetadataOp::Rename {
                parent,
                name,
                new_parent,
                new_name,
                mnode,
                kind,
                ..
            } => {
                // Both halves share `tr`, so the rename is atomic under a
                // crash: either both directory updates commit or neither.
                self.create_directory_entry(*new_parent, new_name, *mnode, *kind, tr)?;
                if kind.is_dir() && parent != new_parent {
                    self.rewire_dotdot(*mnode, *parent, *new_parent, tr)?;
                }
                self.unlink_old_inode(*parent, name, tr)
            }
            MetadataOp::Delete { mnode, .. } => self.delete_old_inode(*mnode, tr),
        }
    }

    /// Resolve an mnode id to its on-disk inode. A missing mapping here is
    /// a broken create-dependency invariant.
    pub(crate) fn get_inode(&self, id: MnodeId, tag: &str) -> Arc<Inode> {
        let inum = self
            .ident
            .inum_of(id)
            .unwrap_or_else(|| panic!("{tag}: mapping for mnode {id} does not exist"));
        self.store
            .iget(inum)
            .unwrap_or_else(|e| panic!("{tag}: inode {inum} unreadable: {e}"))
    }

    /// Create the on-disk object for an mnode that has none yet. Returns
    /// the inode number, or `None` if the mnode already has one.
    ///
    /// The parent is always on disk by the time the child's create is
    /// applied: creates are logged with global timestamps, so a parent's
    /// create precedes its children's in the replay order. That invariant
    /// is asserted, not re-established.
    fn create_node_if_new(
        &self,
        id: MnodeId,
        parent: MnodeId,
        kind: NodeKind,
        name: &str,
        tr: &mut Transaction,
        link_in_parent: bool,
    ) -> Result<Option<InodeNumber>> {
        if self.ident.inum_of(id).is_some() {
            return Ok(None);
        }
        let parent_inum = self
            .ident
            .inum_of(parent)
            .unwrap_or_else(|| panic!("create: parent {parent} does not exist on disk"));

        let ip = self.store.ialloc(kind, tr)?;
        self.ident.bind_id(id, ip.inum);

        if kind.is_dir() {
            // The child's `..` entry claims a link on the parent.
            self.store.dirlink(
                &ip,
                &Name::new("..").expect("dotdot"),
                parent_inum,
                true,
                tr,
            )?;
        }
        self.store.iupdate(&ip, tr)?;

        if link_in_parent {
            let parenti = self.store.iget(parent_inum)?;
            self.store
                .dirlink(&parenti, &wire_name(name), ip.inum, kind.is_dir(), tr)?;
        }
        trace!(target: "mfs::core", mnode = id.0, inum = ip.inum.0, "created_on_disk");
        Ok(Some(ip.inum))
    }

    /// Create a directory entry for a name that exists in memory but not on
    /// disk. If the name already maps to a different inode, the stale entry
    /// is unlinked first and its inode truncated once the link count hits
    /// zero.
    fn create_directory_entry(
        &self,
        parent: MnodeId,
        name: &str,
        id: MnodeId,
        kind: NodeKind,
        tr: &mut Transaction,
    ) -> Result<()> {
        let dp = self.get_inode(parent, "create_directory_entry");
        let wire = wire_name(name);

        if let Some(existing) = self.store.dirlookup(&dp, &wire)? {
            if self.ident.inum_of(id) == Some(existing) {
                return Ok(());
            }
            // The name now refers to a different inode; displace the old one.
            let old = self.store.iget(existing)?;
            let old_isdir = old.kind().is_some_and(NodeKind::is_dir);
            self.store.dirunlink(&dp, &wire, existing, old_isdir, tr)?;
            if old.nlink() == 0 {
                if old_isdir {
                    // The displaced directory's `..` claim dies with it.
                    let dotdot = Name::new("..").expect("dotdot");
                    if let Some(pp) = self.store.dirlookup(&old, &dotdot)? {
                        self.store.dirunlink(&old, &dotdot, pp, true, tr)?;
                    }
                }
                self.store.itrunc(&old, 0, tr)?;
                self.ident.remove_inum(existing);
            }
        }

        match self.ident.inum_of(id) {
            Some(inum) => {
                self.store.dirlink(&dp, &wire, inum, kind.is_dir(), tr)?;
            }
            None => {
                let inum = self
                    .create_node_if_new(id, parent, kind, name, tr, false)?
                    .expect("node had no inode mapping");
                self.store.dirlink(&dp, &wire, inum, kind.is_dir(), tr)?;
            }
        }
        Ok(())
    }

    /// Remove a directory entry that no longer exists in memory. The inode
    /// itself is not deleted: user space may still hold open descriptors,
    /// so deletion is deferred to the `delete` operation emitted when the
    /// mnode's last reference drops.
    fn unlink_old_inode(&self, parent: MnodeId, name: &str, tr: &mut Transaction) -> Result<()> {
        let dp = self.get_inode(parent, "unlink_old_inode");
        let wire = wire_name(name);
        let Some(target_inum) = self.store.dirlookup(&dp, &wire)? else {
            return Ok(());
        };
        let target = self.store.iget(target_inum)?;
        let isdir = target.kind().is_some_and(NodeKind::is_dir);
        self.store.dirunlink(&dp, &wire, target_inum, isdir, tr)?;

        if target.nlink() == 0 {
            self.ident.remove_inum(target_inum);
        }
        Ok(())
    }

    /// Point a renamed directory's on-disk `..` at its new parent, moving
    /// the `..` link claim between the two parents.
    fn rewire_dotdot(
        &self,
        id: MnodeId,
        old_parent: MnodeId,
        new_parent: MnodeId,
        tr: &mut Transaction,
    ) -> Result<()> {
        let child = self.get_inode(id, "rewire_dotdot");
        let new_parent_inum = self
            .ident
            .inum_of(new_parent)
            .unwrap_or_else(|| panic!("rename: new parent {new_parent} does not exist on disk"));
        let dotdot = Name::new("..").expect("dotdot");

        if let Some(old_inum) = self.store.dirlookup(&child, &dotdot)? {
            let expected = self.ident.inum_of(old_parent);
            assert_eq!(
                expected,
                Some(old_inum),
                "rename: stale .. target in mnode {id}"
            );
            self.store.dirunlink(&child, &dotdot, old_inum, true, tr)?;
        }
        self.store
            .dirlink(&child, &dotdot, new_parent_inum, true, tr)
    }

    /// Delete the inode and its contents from the disk; the last step of
    /// the unlink protocol.
    fn delete_old_inode(&self, id: MnodeId, tr: &mut Transaction) -> Result<()> {
        let ip = self.get_inode(id, "delete_old_inode");

        // A dying directory releases its `..` claim on the parent.
        if ip.kind().is_some_and(NodeKind::is_dir) {
            let dotdot = Name::new("..").expect("dotdot");
            if let Some(parent_inum) = self.store.dirlookup(&ip, &dotdot)? {
                self.store.dirunlink(&ip, &dotdot, parent_inum, true, tr)?;
            }
        }

        self.store.itrunc(&ip, 0, tr)?;
        self.store.free_inode(&ip, tr)?;
        self.ident.remove_id(id);
        Ok(())
    }
}

/// Operation records carry plain strings; entries on disk are bounded
/// names. The namespace layer validated them on entry, so failure here is
/// corruption of the log itself.
fn wire_name(name: &str) -> Name {
    Name::new(name).unwrap_or_else(|e| panic!("logged name {name:?} is invalid: {e}"))
}
