//! Identity maps.
//!
//! Three small maps bridge the mnode and inode namespaces: the mnode
//! registry (`id → mnode`), `inum → mnode`, and `id → inum`. The
//! mnode-valued maps hold weak references so they never delay reclamation:
//! when the last strong reference to an unlinked mnode drops, its deferred
//! delete is enqueued from the drop path with these entries still present.

use crate::mnode::Mnode;
use mfs_types::{InodeNumber, MnodeId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Bidirectional mnode/inode identity maps plus the mnode registry.
///
/// Invariant: outside the create window (mnode exists, inode not yet
/// allocated) and the delete window (inode freed, mnode lingering until
/// last close), an id present in either direction is present in both.
#[derive(Debug, Default)]
pub struct IdentityMaps {
    mnodes: Mutex<HashMap<MnodeId, Weak<Mnode>>>,
    inum_to_mnode: Mutex<HashMap<InodeNumber, Weak<Mnode>>>,
    mnode_to_inode: Mutex<HashMap<MnodeId, InodeNumber>>,
}

impl IdentityMaps {
    /// Register a freshly built mnode. No inode mapping yet: that window
    /// closes when the create operation is applied.
    pub fn register(&self, m: &Arc<Mnode>) {
        self.mnodes.lock().insert(m.id(), Arc::downgrade(m));
    }

    /// Install both directions of the identity mapping for `m`.
    pub fn bind(&self, m: &Arc<Mnode>, inum: InodeNumber) {
        self.mnodes.lock().insert(m.id(), Arc::downgrade(m));
        self.inum_to_mnode.lock().insert(inum, Arc::downgrade(m));
        self.mnode_to_inode.lock().insert(m.id(), inum);
    }

    /// Install the inode side for an mnode id whose node may already be
    /// gone (applied operations outlive their mnodes).
    pub fn bind_id(&self, id: MnodeId, inum: InodeNumber) {
        let mnode = self.mnodes.lock().get(&id).cloned();
        if let Some(weak) = mnode {
            self.inum_to_mnode.lock().insert(inum, weak);
        }
        self.mnode_to_inode.lock().insert(id, inum);
    }

    #[must_use]
    pub fn mnode_by_id(&self, id: MnodeId) -> Option<Arc<Mnode>> {
        self.mnodes.lock().get(&id).and_then(Weak::upgrade)
    }

    #[must_use]
    pub fn mnode_by_inum(&self, inum: InodeNumber) -> Option<Arc<Mnode>> {
        self.inum_to_mnode.lock().get(&inum).and_then(Weak::upgrade)
    }

    /// The `mnode → inode` direction (`inode_lookup` in the facade).
    #[must_use]
    pub fn inum_of(&self, id: MnodeId) -> Option<InodeNumber> {
        self.mnode_to_inode.lock().get(&id).copied()
    }

    pub fn remove_inum(&self, inum: InodeNumber) {
        self.inum_to_mnode.lock().remove(&inum);
    }

    /// Drop the mnode-side mapping after the on-disk delete.
    pub fn remove_id(&self, id: MnodeId) {
        self.mnode_to_inode.lock().remove(&id);
        self.mnodes.lock().remove(&id);
    }

    /// Every live mnode currently known through the inode map.
    #[must_use]
    pub fn live_mapped_mnodes(&self) -> Vec<Arc<Mnode>> {
        self.inum_to_mnode
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Both-or-neither check for the identity invariant (test support).
    #[must_use]
    pub fn is_consistent(&self, id: MnodeId) -> bool {
        let inum = self.inum_of(id);
        match inum {
            Some(inum) => self.inum_to_mnode.lock().contains_key(&inum),
            None => true,
        }
    }
}
