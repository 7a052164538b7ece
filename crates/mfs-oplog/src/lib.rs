#![forbid(unsafe_code)]
//! The logical operation log.
//!
//! Metadata syscalls append tagged operation records to a per-core buffer
//! and return without touching the disk. Appending takes only the local
//! core's mutex — the hot path never contends across cores. A consumer
//! fusing the log at timestamp `T` waits until every core has published all
//! operations with timestamps ≤ `T`, then merges the per-core buffers into
//! one globally ordered vector.
//!
//! Each core publishes a `(start_tsc, end_tsc)` window: `start_tsc` is set
//! when an operation begins (before it can be appended), `end_tsc` when it
//! completes. A core with `end_tsc < start_tsc ≤ T` may still be appending
//! an operation that belongs under the barrier, so the consumer waits.
//!
//! The window is a single in-flight slot, so each core admits exactly one
//! appender at a time. Callers without a CPU of their own check a core out
//! of the pool with [`LogicalLog::checkout_core`]; the pool bounds
//! concurrent appenders to the core count and hands a slot to at most one
//! thread at a time, which is what makes the barrier's idle-core
//! conclusion sound.

use mfs_types::{MnodeId, NodeKind, Timestamp};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

// ── Operation clock ─────────────────────────────────────────────────────────

/// Global monotonic timestamp source shared by all cores.
///
/// The single atomic fetch-add is the only cross-core touch on the append
/// path; everything else is core-local.
#[derive(Debug)]
pub struct OpClock {
    value: AtomicU64,
}

impl OpClock {
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            value: AtomicU64::new(start),
        }
    }

    /// Read the latest issued timestamp without advancing.
    #[must_use]
    pub fn current(&self) -> Timestamp {
        Timestamp(self.value.load(Ordering::Acquire))
    }

    /// Draw the next timestamp.
    pub fn next(&self) -> Timestamp {
        Timestamp(self.value.fetch_add(1, Ordering::AcqRel).saturating_add(1))
    }
}

impl Default for OpClock {
    fn default() -> Self {
        Self::new(0)
    }
}

// ── Operations ──────────────────────────────────────────────────────────────

/// One logged metadata mutation. Logical order is strictly timestamp order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataOp {
    Create {
        mnode: MnodeId,
        parent: MnodeId,
        kind: NodeKind,
        name: String,
        timestamp: Timestamp,
    },
    Link {
        parent: MnodeId,
        name: String,
        mnode: MnodeId,
        kind: NodeKind,
        timestamp: Timestamp,
    },
    Unlink {
        parent: MnodeId,
        name: String,
        mnode: MnodeId,
        kind: NodeKind,
        timestamp: Timestamp,
    },
    Rename {
        parent: MnodeId,
        name: String,
        new_parent: MnodeId,
        new_name: String,
        mnode: MnodeId,
        kind: NodeKind,
        timestamp: Timestamp,
    },
    Delete {
        mnode: MnodeId,
        timestamp: Timestamp,
    },
}

impl MetadataOp {
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Create { timestamp, .. }
            | Self::Link { timestamp, .. }
            | Self::Unlink { timestamp, .. }
            | Self::Rename { timestamp, .. }
            | Self::Delete { timestamp, .. } => *timestamp,
        }
    }

    /// The mnode this operation is about.
    #[must_use]
    pub fn mnode(&self) -> MnodeId {
        match self {
            Self::Create { mnode, .. }
            | Self::Link { mnode, .. }
            | Self::Unlink { mnode, .. }
            | Self::Rename { mnode, .. }
            | Self::Delete { mnode, .. } => *mnode,
        }
    }

    /// The directories this operation mutates.
    fn parents(&self) -> [Option<MnodeId>; 2] {
        match self {
            Self::Create { parent, .. }
            | Self::Link { parent, .. }
            | Self::Unlink { parent, .. } => [Some(*parent), None],
            Self::Rename {
                parent, new_parent, ..
            } => [Some(*parent), Some(*new_parent)],
            Self::Delete { .. } => [None, None],
        }
    }

    /// Whether this operation belongs to the dependency closure.
    ///
    /// Any operation on an mnode already in the set is dependent. For a
    /// directory fsync, creates of children of set members are dependent
    /// (the new entry must reach the fsynced subtree's directories), as is
    /// any operation that mutates the fsynced directory itself.
    fn depends_on(&self, set: &HashSet<MnodeId>, target: MnodeId, isdir: bool) -> bool {
        if set.contains(&self.mnode()) {
            return true;
        }
        if !isdir {
            return false;
        }
        match self {
            Self::Create { parent, .. } => set.contains(parent),
            _ => self.parents().iter().flatten().any(|p| *p == target),
        }
    }

    /// Grow the dependency set with every mnode this operation names.
    fn collect_ids(&self, set: &mut HashSet<MnodeId>) {
        set.insert(self.mnode());
        for parent in self.parents().iter().flatten() {
            set.insert(*parent);
        }
    }
}

// ── Per-core buffers ────────────────────────────────────────────────────────

/// Configuration for the logical log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OplogConfig {
    /// Number of per-core append buffers.
    pub cores: usize,
    /// Capacity reserved per core by `preload`.
    pub per_core_capacity: usize,
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            cores: std::thread::available_parallelism().map_or(4, usize::from),
            per_core_capacity: 1024,
        }
    }
}

#[derive(Debug, Default)]
struct CoreLog {
    ops: Mutex<Vec<MetadataOp>>,
    start_tsc: AtomicU64,
    end_tsc: AtomicU64,
}

impl CoreLog {
    /// Whether an operation with a timestamp ≤ `max` may still be appended.
    fn in_flight(&self, max: Timestamp) -> bool {
        let start = self.start_tsc.load(Ordering::Acquire);
        let end = self.end_tsc.load(Ordering::Acquire);
        start <= max.0 && end < start
    }
}

/// The multi-producer, single-consumer logical log.
pub struct LogicalLog {
    clock: OpClock,
    cores: Box<[CoreLog]>,
    fused: Mutex<Vec<MetadataOp>>,
    barrier_lock: Mutex<()>,
    barrier_cond: Condvar,
    /// Cores not currently checked out to an appender.
    free_slots: Mutex<Vec<usize>>,
    slot_cond: Condvar,
}

impl std::fmt::Debug for LogicalLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalLog")
            .field("cores", &self.cores.len())
            .field("fused", &self.fused.lock().len())
            .finish()
    }
}

impl LogicalLog {
    #[must_use]
    pub fn new(config: OplogConfig) -> Self {
        assert!(config.cores > 0, "logical log needs at least one core");
        let cores = (0..config.cores).map(|_| CoreLog::default()).collect();
        Self {
            clock: OpClock::default(),
            cores,
            fused: Mutex::new(Vec::new()),
            barrier_lock: Mutex::new(()),
            barrier_cond: Condvar::new(),
            free_slots: Mutex::new((0..config.cores).collect()),
            slot_cond: Condvar::new(),
        }
    }

    #[must_use]
    pub fn clock(&self) -> &OpClock {
        &self.clock
    }

    #[must_use]
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Check a core out of the pool for one append bracket, blocking until
    /// one is free.
    ///
    /// The returned guard is the exclusive right to that core's window:
    /// only its holder may call `update_start_tsc`/`add_operation`/
    /// `update_end_tsc` with the slot's index, and the core returns to the
    /// pool when the guard drops. Callers driving the raw cpu-indexed entry
    /// points directly (a kernel with pinned per-CPU execution) carry the
    /// same exclusivity obligation themselves.
    pub fn checkout_core(&self) -> CoreSlot<'_> {
        let mut free = self.free_slots.lock();
        while free.is_empty() {
            self.slot_cond.wait(&mut free);
        }
        let index = free.pop().expect("slot pool non-empty");
        CoreSlot { log: self, index }
    }

    /// Warm the per-core buffers.
    pub fn preload(&self, config: &OplogConfig) {
        for core in &self.cores {
            core.ops.lock().reserve(config.per_core_capacity);
        }
    }

    /// Open `cpu`'s append window at `ts`.
    pub fn update_start_tsc(&self, cpu: usize, ts: Timestamp) {
        self.cores[cpu].start_tsc.store(ts.0, Ordering::Release);
    }

    /// Close `cpu`'s append window at `ts` and wake waiting consumers.
    pub fn update_end_tsc(&self, cpu: usize, ts: Timestamp) {
        self.cores[cpu].end_tsc.store(ts.0, Ordering::Release);
        let _guard = self.barrier_lock.lock();
        self.barrier_cond.notify_all();
    }

    /// Append an operation to `cpu`'s local buffer.
    pub fn add_operation(&self, cpu: usize, op: MetadataOp) {
        trace!(
            target: "mfs::oplog",
            cpu,
            ts = op.timestamp().0,
            mnode = op.mnode().0,
            "add_operation"
        );
        self.cores[cpu].ops.lock().push(op);
    }

    /// Block until no core can still append an operation with a timestamp
    /// ≤ `max`, then fuse all such operations into the global vector and
    /// return a guard granting exclusive access to it.
    pub fn wait_synchronize(&self, max: Timestamp) -> OplogGuard<'_> {
        {
            let mut guard = self.barrier_lock.lock();
            loop {
                let blocked = self.cores.iter().any(|core| core.in_flight(max));
                if !blocked {
                    break;
                }
                self.barrier_cond.wait(&mut guard);
            }
        }

        let mut fused = self.fused.lock();
        let mut pulled = 0_usize;
        for core in &self.cores {
            let mut ops = core.ops.lock();
            let mut i = 0;
            while i < ops.len() {
                if ops[i].timestamp() <= max {
                    fused.push(ops.swap_remove(i));
                    pulled += 1;
                } else {
                    i += 1;
                }
            }
        }
        fused.sort_by_key(MetadataOp::timestamp);
        debug!(target: "mfs::oplog", max = max.0, pulled, fused = fused.len(), "wait_synchronize");
        OplogGuard { ops: fused }
    }
}

/// Exclusive hold on one core's append slot.
///
/// At most one `CoreSlot` exists per core at a time; dropping it returns
/// the core to the pool and wakes one waiting appender.
pub struct CoreSlot<'a> {
    log: &'a LogicalLog,
    index: usize,
}

impl CoreSlot<'_> {
    /// The core index this guard owns, for the cpu-indexed entry points.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for CoreSlot<'_> {
    fn drop(&mut self) {
        self.log.free_slots.lock().push(self.index);
        self.log.slot_cond.notify_one();
    }
}

impl std::fmt::Debug for CoreSlot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreSlot").field("index", &self.index).finish()
    }
}

/// Exclusive access to the fused, timestamp-ordered operation vector.
///
/// While the guard is held the vector contains exactly the unflushed
/// operations with timestamps up to the synchronize point, ascending.
pub struct OplogGuard<'a> {
    ops: MutexGuard<'a, Vec<MetadataOp>>,
}

impl OplogGuard<'_> {
    #[must_use]
    pub fn operations(&self) -> &[MetadataOp] {
        &self.ops
    }

    /// Drain every fused operation in timestamp order.
    pub fn take_all(&mut self) -> Vec<MetadataOp> {
        std::mem::take(&mut *self.ops)
    }

    /// Pop the dependency closure of `target`, in timestamp order.
    ///
    /// Walks the fused vector newest-to-oldest with a growing set seeded
    /// with `target`; every index down to zero is inspected. Operations not
    /// selected remain logged for a later flush.
    pub fn take_dependent(&mut self, target: MnodeId, isdir: bool) -> Vec<MetadataOp> {
        let mut set: HashSet<MnodeId> = HashSet::new();
        set.insert(target);

        let mut selected = Vec::new();
        let mut index = self.ops.len();
        while index > 0 {
            index -= 1;
            if self.ops[index].depends_on(&set, target, isdir) {
                let op = self.ops.remove(index);
                op.collect_ids(&mut set);
                selected.push(op);
            }
        }
        selected.reverse();
        debug!(
            target: "mfs::oplog",
            mnode = target.0,
            isdir,
            selected = selected.len(),
            remaining = self.ops.len(),
            "take_dependent"
        );
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn log(cores: usize) -> LogicalLog {
        LogicalLog::new(OplogConfig {
            cores,
            per_core_capacity: 16,
        })
    }

    fn create(mnode: u64, parent: u64, ts: u64) -> MetadataOp {
        MetadataOp::Create {
            mnode: MnodeId(mnode),
            parent: MnodeId(parent),
            kind: NodeKind::File,
            name: format!("n{mnode}"),
            timestamp: Timestamp(ts),
        }
    }

    fn unlink(mnode: u64, parent: u64, ts: u64) -> MetadataOp {
        MetadataOp::Unlink {
            parent: MnodeId(parent),
            name: format!("n{mnode}"),
            mnode: MnodeId(mnode),
            kind: NodeKind::File,
            timestamp: Timestamp(ts),
        }
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = OpClock::default();
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
        assert_eq!(clock.current(), b);
    }

    #[test]
    fn fuse_merges_cores_in_timestamp_order() {
        let log = log(2);
        log.add_operation(0, create(10, 1, 3));
        log.add_operation(1, create(11, 1, 1));
        log.add_operation(0, create(12, 1, 2));
        log.add_operation(1, create(13, 1, 9));

        let mut guard = log.wait_synchronize(Timestamp(5));
        let ts: Vec<u64> = guard.operations().iter().map(|op| op.timestamp().0).collect();
        assert_eq!(ts, vec![1, 2, 3]);

        // The op past the barrier stays in its core buffer.
        let rest = guard.take_all();
        drop(guard);
        assert_eq!(rest.len(), 3);
        let mut later = log.wait_synchronize(Timestamp(100));
        assert_eq!(later.take_all().len(), 1);
    }

    #[test]
    fn barrier_waits_for_in_flight_appender() {
        let log = Arc::new(log(1));
        log.update_start_tsc(0, Timestamp(5));

        let consumer = {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                let mut guard = log.wait_synchronize(Timestamp(10));
                guard.take_all()
            })
        };

        // The consumer must not complete while core 0's window is open.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());

        log.add_operation(0, create(10, 1, 5));
        log.update_end_tsc(0, Timestamp(5));

        let ops = consumer.join().expect("consumer");
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn barrier_ignores_cores_past_the_horizon() {
        let log = log(2);
        // Core 1 is mid-operation, but at a timestamp beyond the barrier.
        log.update_start_tsc(1, Timestamp(50));
        log.add_operation(0, create(10, 1, 2));
        log.update_end_tsc(0, Timestamp(2));

        let mut guard = log.wait_synchronize(Timestamp(10));
        assert_eq!(guard.take_all().len(), 1);
    }

    #[test]
    fn checkout_bounds_appenders_to_core_count() {
        // Far more threads than cores: every bracket still runs on a slot
        // it owns exclusively, and no operation is lost at the barrier.
        let log = Arc::new(log(2));
        let mut handles = Vec::new();
        for i in 0..8_u64 {
            let log = Arc::clone(&log);
            handles.push(std::thread::spawn(move || {
                let slot = log.checkout_core();
                assert!(slot.index() < 2);
                let ts = log.clock().next();
                log.update_start_tsc(slot.index(), ts);
                log.add_operation(slot.index(), create(100 + i, 1, ts.0));
                log.update_end_tsc(slot.index(), ts);
            }));
        }
        for h in handles {
            h.join().expect("appender");
        }

        let mut guard = log.wait_synchronize(log.clock().current());
        let ops = guard.take_all();
        assert_eq!(ops.len(), 8);
        let ts: Vec<u64> = ops.iter().map(|op| op.timestamp().0).collect();
        let mut sorted = ts.clone();
        sorted.sort_unstable();
        assert_eq!(ts, sorted);
    }

    #[test]
    fn checkout_waits_for_a_returned_slot() {
        let log = Arc::new(log(1));
        let held = log.checkout_core();
        assert_eq!(held.index(), 0);

        let waiter = {
            let log = Arc::clone(&log);
            std::thread::spawn(move || log.checkout_core().index())
        };
        // The only slot is checked out; the waiter must block.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.join().expect("waiter"), 0);
    }

    #[test]
    fn closure_pulls_ancestor_creates_only() {
        let log = log(1);
        // create /d, create /e (sibling), create /d/f, unlink /e.
        log.add_operation(0, create(2, 1, 1)); // d under root
        log.add_operation(0, create(3, 1, 2)); // e under root
        log.add_operation(0, create(4, 2, 3)); // f under d
        log.add_operation(0, unlink(3, 1, 4)); // unlink e

        let mut guard = log.wait_synchronize(Timestamp(10));
        let deps = guard.take_dependent(MnodeId(4), false);
        let ts: Vec<u64> = deps.iter().map(|op| op.timestamp().0).collect();
        // f's create pulls d's create; the sibling ops stay behind.
        assert_eq!(ts, vec![1, 3]);
        assert_eq!(guard.operations().len(), 2);
    }

    #[test]
    fn closure_includes_first_logged_operation() {
        let log = log(1);
        log.add_operation(0, create(2, 1, 1));
        let mut guard = log.wait_synchronize(Timestamp(5));
        let deps = guard.take_dependent(MnodeId(2), false);
        assert_eq!(deps.len(), 1);
        assert!(guard.operations().is_empty());
    }

    #[test]
    fn directory_closure_pulls_child_operations() {
        let log = log(1);
        log.add_operation(0, create(2, 1, 1)); // dir d
        log.add_operation(0, create(4, 2, 2)); // d/f
        log.add_operation(0, unlink(4, 2, 3)); // unlink d/f
        log.add_operation(0, create(5, 1, 4)); // sibling of d

        let mut guard = log.wait_synchronize(Timestamp(10));
        let deps = guard.take_dependent(MnodeId(2), true);
        let ts: Vec<u64> = deps.iter().map(|op| op.timestamp().0).collect();
        assert_eq!(ts, vec![1, 2, 3]);
        assert_eq!(guard.operations().len(), 1);
    }

    #[test]
    fn delete_depends_only_on_its_mnode() {
        let log = log(1);
        log.add_operation(0, create(4, 2, 1));
        log.add_operation(
            0,
            MetadataOp::Delete {
                mnode: MnodeId(9),
                timestamp: Timestamp(2),
            },
        );
        let mut guard = log.wait_synchronize(Timestamp(5));
        let deps = guard.take_dependent(MnodeId(9), false);
        assert_eq!(deps.len(), 1);
        assert!(matches!(deps[0], MetadataOp::Delete { .. }));
    }
}
