#![forbid(unsafe_code)]
//! The physical block journal.
//!
//! A write-ahead log of block-level transactions living in the preallocated
//! `sv6journal` file. The write path appends `start · data* · commit`
//! records for each transaction, synchronously flushing between phases, then
//! writes the blocks to their home locations and zero-fills the journal.
//! Recovery replays only transactions with a matching commit record; the
//! commit-then-home ordering guarantees uncommitted transactions never
//! touched home blocks.
//!
//! Records are uniform: a 16-byte header followed by one block image (zero
//! for headers that carry no payload). An all-zero header marks
//! end-of-journal.

use mfs_alloc::{balloc_on_disk, bfree_on_disk};
use mfs_block::{BlockBuf, Transaction};
use mfs_error::{MfsError, Result};
use mfs_inode::{Inode, InodeStore};
use mfs_types::{
    BSIZE, BlockNumber, JOURNAL_FILE_NAME, JOURNAL_HEADER_SIZE, JOURNAL_RECORD_SIZE,
    JournalHeaderKind, Name, PHYS_JOURNAL_SIZE, ROOT_INUM, Timestamp, put_le_u32, put_le_u64,
    read_le_u32, read_le_u64,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Record codec ────────────────────────────────────────────────────────────

fn encode_header(buf: &mut [u8; JOURNAL_HEADER_SIZE], kind: JournalHeaderKind, ts: Timestamp, blocknum: u32) {
    buf.fill(0);
    put_le_u64(buf, 0, ts.0);
    put_le_u32(buf, 8, blocknum);
    buf[12] = kind as u8;
}

struct RawHeader {
    ts: u64,
    blocknum: u32,
    kind: u8,
}

fn decode_header(buf: &[u8; JOURNAL_HEADER_SIZE]) -> RawHeader {
    RawHeader {
        ts: read_le_u64(buf, 0).unwrap_or(0),
        blocknum: read_le_u32(buf, 8).unwrap_or(0),
        kind: buf[12],
    }
}

fn is_zero(buf: &[u8]) -> bool {
    buf.iter().all(|b| *b == 0)
}

// ── Replay statistics ───────────────────────────────────────────────────────

/// Counters from one recovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplayStats {
    /// Records inspected before end-of-journal or an inconsistency.
    pub scanned_records: u64,
    /// Transactions with a matching commit record.
    pub sealed_transactions: u64,
    /// Block images written to their home locations.
    pub replayed_blocks: u64,
    /// Staged data records discarded for lack of a commit.
    pub discarded_blocks: u64,
    /// Whether the scan stopped at a malformed record.
    pub stopped_at_corruption: bool,
}

// ── Journal ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct JournalInner {
    /// Next free byte offset in the journal file; high-water mark of the
    /// current commit cycle.
    offset: u32,
    /// Transactions assembled by the current flush, ascending timestamps.
    pending: Vec<Transaction>,
}

/// The on-device journal. A single exclusive writer at a time: every commit
/// path starts by taking [`prepare_for_commit`](Self::prepare_for_commit).
#[derive(Debug)]
pub struct Journal {
    store: Arc<InodeStore>,
    ino: Arc<Inode>,
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// Locate the preallocated journal file and wrap it.
    pub fn open(store: &Arc<InodeStore>) -> Result<Self> {
        let root = store.iget(ROOT_INUM)?;
        let name = Name::new(JOURNAL_FILE_NAME).expect("journal name is valid");
        let inum = store
            .dirlookup(&root, &name)?
            .ok_or_else(|| MfsError::Format("journal file missing from root directory".to_owned()))?;
        let ino = store.iget(inum)?;
        if ino.kind() != Some(mfs_types::NodeKind::File) {
            return Err(MfsError::Format("journal is not a regular file".to_owned()));
        }
        if ino.size() as usize != PHYS_JOURNAL_SIZE {
            return Err(MfsError::Format(format!(
                "journal file has size {}, expected {PHYS_JOURNAL_SIZE}",
                ino.size()
            )));
        }
        info!(target: "mfs::journal", inum = inum.0, "journal_opened");
        Ok(Self {
            store: Arc::clone(store),
            ino,
            inner: Mutex::new(JournalInner {
                offset: 0,
                pending: Vec::new(),
            }),
        })
    }

    /// Acquire the journal's exclusive commit lock. Concurrent `fsync`
    /// callers serialise here.
    pub fn prepare_for_commit(&self) -> JournalGuard<'_> {
        JournalGuard {
            journal: self,
            inner: self.inner.lock(),
        }
    }

    /// Recovery, run once at mount before the allocator is initialized.
    ///
    /// Reads alternating header/data records from offset zero, seals a
    /// transaction at each matching commit header, and stops at the first
    /// all-zero header, short read, or inconsistency. Sealed transactions
    /// are applied in order; everything else is discarded. Running it twice
    /// produces the same state as running it once.
    pub fn process_journal(&self) -> Result<ReplayStats> {
        let mut inner = self.inner.lock();
        let mut stats = ReplayStats::default();
        let mut sealed: Vec<Transaction> = Vec::new();
        let mut current: Option<u64> = None;
        let mut staged: Vec<(BlockNumber, BlockBuf)> = Vec::new();

        let mut offset = 0_u32;
        while (offset as usize) + JOURNAL_RECORD_SIZE <= PHYS_JOURNAL_SIZE {
            let mut hdr = [0_u8; JOURNAL_HEADER_SIZE];
            if self.store.readi(&self.ino, &mut hdr, offset)? < JOURNAL_HEADER_SIZE {
                break;
            }
            if is_zero(&hdr) {
                break;
            }
            let mut data = vec![0_u8; BSIZE];
            #[allow(clippy::cast_possible_truncation)] // header size is 16
            let data_off = offset + JOURNAL_HEADER_SIZE as u32;
            if self.store.readi(&self.ino, &mut data, data_off)? < BSIZE {
                stats.stopped_at_corruption = true;
                break;
            }

            stats.scanned_records += 1;
            let raw = decode_header(&hdr);
            match JournalHeaderKind::from_disk(raw.kind) {
                Some(JournalHeaderKind::Start) => {
                    current = Some(raw.ts);
                    staged.clear();
                }
                Some(JournalHeaderKind::Data) if current == Some(raw.ts) => {
                    staged.push((BlockNumber(raw.blocknum), BlockBuf::new(data)));
                }
                Some(JournalHeaderKind::Commit) if current == Some(raw.ts) => {
                    let mut tr = Transaction::new(Timestamp(raw.ts));
                    for (bno, image) in staged.drain(..) {
                        tr.add_block(bno, image);
                    }
                    sealed.push(tr);
                    stats.sealed_transactions += 1;
                }
                _ => {
                    warn!(
                        target: "mfs::journal",
                        offset,
                        kind = raw.kind,
                        ts = raw.ts,
                        "journal_scan_stopped"
                    );
                    stats.stopped_at_corruption = true;
                    break;
                }
            }
            #[allow(clippy::cast_possible_truncation)] // record size is 4112
            {
                offset += JOURNAL_RECORD_SIZE as u32;
            }
        }

        stats.discarded_blocks = staged.len() as u64;

        let cache = self.store.cache();
        for tr in &sealed {
            tr.write_to_disk_update_cache(cache)?;
            stats.replayed_blocks += tr.blocks().len() as u64;
        }
        if !sealed.is_empty() {
            // Replay may have rewritten inode-table blocks underneath
            // inodes read while locating the journal.
            self.store.reload_cached()?;
        }

        // The journal is clean once every sealed transaction is home.
        inner.offset = u32::try_from(PHYS_JOURNAL_SIZE).expect("journal size fits u32");
        self.clear_journal(&mut inner)?;

        info!(
            target: "mfs::journal",
            sealed = stats.sealed_transactions,
            replayed = stats.replayed_blocks,
            discarded = stats.discarded_blocks,
            corrupt = stats.stopped_at_corruption,
            "journal_recovered"
        );
        Ok(stats)
    }

    /// Append one uniform record at the current offset via a scratch
    /// transaction. The journal has a fixed capacity; overflowing it would
    /// extend the preallocated file, which is a fatal invariant violation.
    fn append_record(
        &self,
        inner: &mut JournalInner,
        scratch: &mut Transaction,
        kind: JournalHeaderKind,
        ts: Timestamp,
        blocknum: u32,
        data: &[u8],
    ) -> Result<()> {
        assert!(
            inner.offset as usize + JOURNAL_RECORD_SIZE <= PHYS_JOURNAL_SIZE,
            "physical journal overflow at offset {}",
            inner.offset
        );
        assert_eq!(data.len(), BSIZE);

        let mut hdr = [0_u8; JOURNAL_HEADER_SIZE];
        encode_header(&mut hdr, kind, ts, blocknum);
        self.store.writei(&self.ino, &hdr, inner.offset, scratch)?;
        #[allow(clippy::cast_possible_truncation)]
        let data_off = inner.offset + JOURNAL_HEADER_SIZE as u32;
        self.store.writei(&self.ino, data, data_off, scratch)?;
        #[allow(clippy::cast_possible_truncation)]
        {
            inner.offset += JOURNAL_RECORD_SIZE as u32;
        }
        Ok(())
    }

    /// Write a scratch transaction's blocks straight to the device and
    /// barrier. This is the synchronous flush point of the commit protocol.
    fn flush_scratch(&self, scratch: &mut Transaction) -> Result<()> {
        scratch.prepare_for_commit();
        let cache = self.store.cache();
        scratch.write_to_disk(cache)?;
        cache.sync_device()
    }

    /// Zero-fill the journal from offset 0 through the high-water mark and
    /// reset the offset.
    fn clear_journal(&self, inner: &mut JournalInner) -> Result<()> {
        let zero = [0_u8; BSIZE];
        let mut scratch = Transaction::new(Timestamp(0));
        let mut off = 0_u32;
        while off < inner.offset {
            let chunk = (BSIZE as u32).min(inner.offset - off);
            self.store
                .writei(&self.ino, &zero[..chunk as usize], off, &mut scratch)?;
            off += chunk;
        }
        self.flush_scratch(&mut scratch)?;
        inner.offset = 0;
        Ok(())
    }

    /// Commit one transaction: bitmap pre-processing, journal records with
    /// interleaved flushes, home write-back, and journal truncation.
    fn commit_one(&self, inner: &mut JournalInner, mut tr: Transaction) -> Result<()> {
        let ts = tr.timestamp();
        let cache = self.store.cache();
        let sb = *self.store.superblock();

        // Apply the allocation results to the on-disk bitmap, pulling the
        // bitmap blocks into the transaction.
        let allocated = tr.allocated_blocks().to_vec();
        let freed = tr.freed_blocks().to_vec();
        balloc_on_disk(&allocated, &sb, cache, &mut tr)?;
        bfree_on_disk(&freed, &sb, cache, &mut tr)?;

        tr.prepare_for_commit();

        let zero = [0_u8; BSIZE];
        let mut scratch = Transaction::new(Timestamp(0));
        self.append_record(inner, &mut scratch, JournalHeaderKind::Start, ts, 0, &zero)?;
        self.flush_scratch(&mut scratch)?;

        let mut scratch = Transaction::new(Timestamp(0));
        for (bno, image) in tr.blocks() {
            self.append_record(
                inner,
                &mut scratch,
                JournalHeaderKind::Data,
                ts,
                bno.0,
                image.as_slice(),
            )?;
        }
        self.flush_scratch(&mut scratch)?;

        let mut scratch = Transaction::new(Timestamp(0));
        self.append_record(inner, &mut scratch, JournalHeaderKind::Commit, ts, 0, &zero)?;
        self.flush_scratch(&mut scratch)?;
        tr.mark_logged();

        // Committed: release the freed blocks in memory and write the
        // transaction home.
        let alloc = self.store.allocator();
        for bno in tr.freed_blocks() {
            alloc.free_block(*bno);
        }
        for (bno, image) in tr.blocks() {
            cache.writeback_snapshot(*bno, image)?;
        }
        cache.sync_device()?;
        tr.mark_applied();

        // All home writes are durable; the journal contents are dead weight
        // and the file is simply zero-filled.
        self.clear_journal(inner)?;
        tr.mark_retired();

        debug!(
            target: "mfs::journal",
            ts = ts.0,
            blocks = tr.blocks().len(),
            allocated = allocated.len(),
            freed = freed.len(),
            "txn_committed"
        );
        Ok(())
    }
}

/// Exclusive journal access held for the duration of a flush.
pub struct JournalGuard<'a> {
    journal: &'a Journal,
    inner: MutexGuard<'a, JournalInner>,
}

impl JournalGuard<'_> {
    /// Queue a transaction for the current flush. Callers append in
    /// ascending timestamp order.
    pub fn add_transaction(&mut self, tr: Transaction) {
        if let Some(last) = self.inner.pending.last() {
            assert!(
                last.timestamp() <= tr.timestamp(),
                "transactions queued out of timestamp order"
            );
        }
        self.inner.pending.push(tr);
    }

    /// Number of queued transactions.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    /// Commit every queued transaction in order.
    pub fn flush(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.inner.pending);
        for tr in pending {
            self.journal.commit_one(&mut self.inner, tr)?;
        }
        Ok(())
    }

    /// Commit a single transaction immediately (the `fsync` data path).
    pub fn commit_single(&mut self, tr: Transaction) -> Result<()> {
        assert!(
            self.inner.pending.is_empty(),
            "single commit with queued transactions"
        );
        self.journal.commit_one(&mut self.inner, tr)
    }
}
