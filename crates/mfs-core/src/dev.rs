//! Device-file endpoints.
//!
//! The enclosing kernel exposes two device files over this module:
//! `/dev/blkstats` (read-only free-block statistics) and
//! `/dev/evict_caches` (one-byte cache-eviction control).

use crate::interface::MfsInterface;
use tracing::warn;

pub use mfs_types::{MAJ_BLKSTATS, MAJ_EVICTCACHES};

/// Produce the `/dev/blkstats` payload.
#[must_use]
pub fn blkstats_read(fs: &MfsInterface) -> String {
    let (free, total) = fs.free_block_stats();
    format!("\nNum free blocks: {free} / {total}\n")
}

/// Handle a write to `/dev/evict_caches`.
///
/// Exactly one byte must be written: `'1'` evicts the buffer cache, `'2'`
/// the page cache. Anything else is a diagnostic and otherwise ignored.
/// Returns the number of bytes consumed, like a device write.
pub fn evict_caches(fs: &MfsInterface, buf: &[u8]) -> usize {
    if buf.len() != 1 {
        warn!(
            target: "mfs::core",
            len = buf.len(),
            "evict_caches: invalid number of characters"
        );
        return buf.len();
    }
    match buf[0] {
        b'1' => {
            fs.evict_bufcache();
        }
        b'2' => {
            fs.evict_pagecache();
        }
        other => {
            warn!(
                target: "mfs::core",
                option = other,
                "evict_caches: invalid option"
            );
        }
    }
    buf.len()
}
