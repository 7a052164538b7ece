#![forbid(unsafe_code)]
//! Core identifiers and on-disk layout for MFS.
//!
//! Everything here is plain data: unit-carrying newtypes for the different
//! integer namespaces (block numbers, inode numbers, mnode ids, log
//! timestamps), the fixed geometry of the simple indexed disk layout, and
//! little-endian codec helpers shared by the inode store and the journal.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Disk geometry ───────────────────────────────────────────────────────────

/// Block size in bytes. Every device, cache, and journal record uses it.
pub const BSIZE: usize = 4096;

/// Bits per bitmap block.
pub const BPB: u32 = (BSIZE * 8) as u32;

/// On-disk inode record size in bytes.
pub const DINODE_SIZE: usize = 64;

/// Inodes per inode-table block.
pub const IPB: u32 = (BSIZE / DINODE_SIZE) as u32;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 12;

/// Block pointers per indirect block.
pub const NINDIRECT: usize = BSIZE / 4;

/// Largest file in blocks (direct + one indirect block).
pub const MAXFILE_BLOCKS: usize = NDIRECT + NINDIRECT;

/// On-disk directory entry size in bytes.
pub const DIRENT_SIZE: usize = 32;

/// Maximum directory-entry name length in bytes.
pub const DIRSIZ: usize = DIRENT_SIZE - 4;

/// Inode number of the root directory.
pub const ROOT_INUM: InodeNumber = InodeNumber(1);

/// Name under which the physical journal file is linked in the root
/// directory. The file is invisible to the namespace.
pub const JOURNAL_FILE_NAME: &str = "sv6journal";

// ── Journal record geometry ─────────────────────────────────────────────────

/// Fixed journal header size: `ts: u64, blocknum: u32, kind: u8, pad: [u8; 3]`.
pub const JOURNAL_HEADER_SIZE: usize = 16;

/// One journal record: a header followed by one block image. Headers that
/// carry no payload (start/commit) are followed by a zero image; the format
/// is uniform to simplify replay.
pub const JOURNAL_RECORD_SIZE: usize = JOURNAL_HEADER_SIZE + BSIZE;

/// Record capacity of the preallocated journal file.
pub const PHYS_JOURNAL_RECORDS: usize = 256;

/// Byte size of the preallocated journal file.
pub const PHYS_JOURNAL_SIZE: usize = PHYS_JOURNAL_RECORDS * JOURNAL_RECORD_SIZE;

/// Journal header kinds. The numeric values are part of the on-disk format
/// and stable across versions. A zero kind only ever appears in an all-zero
/// header, which marks end-of-journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JournalHeaderKind {
    Start = 1,
    Data = 2,
    Commit = 3,
}

impl JournalHeaderKind {
    #[must_use]
    pub fn from_disk(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Start),
            2 => Some(Self::Data),
            3 => Some(Self::Commit),
            _ => None,
        }
    }
}

// ── Device majors ───────────────────────────────────────────────────────────

/// Major number of the read-only free-block statistics device.
pub const MAJ_BLKSTATS: u16 = 10;

/// Major number of the cache-eviction control device.
pub const MAJ_EVICTCACHES: u16 = 11;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Physical block number on the backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

/// On-disk inode number. Inode numbers are 1-indexed; 0 marks an empty
/// directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// In-memory mnode id. Process-wide unique and never reused; a distinct
/// namespace from inode numbers, bridged by the identity maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MnodeId(pub u64);

/// Logical-log timestamp drawn from the monotonic operation clock.
/// Logical order is strictly timestamp order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl InodeNumber {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Node kinds ──────────────────────────────────────────────────────────────

/// Namespace node type. The numeric values double as the on-disk inode type;
/// a raw 0 on disk means a free inode slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum NodeKind {
    Dir = 1,
    File = 2,
    Symlink = 3,
}

impl NodeKind {
    /// Decode an on-disk type field. `Ok(None)` is a free slot.
    pub fn from_disk(raw: u16) -> Result<Option<Self>, ParseError> {
        match raw {
            0 => Ok(None),
            1 => Ok(Some(Self::Dir)),
            2 => Ok(Some(Self::File)),
            3 => Ok(Some(Self::Symlink)),
            _ => Err(ParseError::InvalidField {
                field: "inode_type",
                reason: "unknown on-disk inode type",
            }),
        }
    }

    #[must_use]
    pub fn to_disk(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub fn is_dir(self) -> bool {
        matches!(self, Self::Dir)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dir => "dir",
            Self::File => "file",
            Self::Symlink => "symlink",
        };
        f.write_str(s)
    }
}

// ── Bounded directory-entry name ────────────────────────────────────────────

/// A directory-entry name: non-empty UTF-8 of at most [`DIRSIZ`] bytes,
/// containing neither `/` nor NUL.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Name {
    bytes: [u8; DIRSIZ],
    len: u8,
}

impl Name {
    pub fn new(name: &str) -> Result<Self, ParseError> {
        let raw = name.as_bytes();
        if raw.is_empty() || raw.len() > DIRSIZ {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "must be 1..=DIRSIZ bytes",
            });
        }
        if raw.iter().any(|b| *b == 0 || *b == b'/') {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "must not contain '/' or NUL",
            });
        }
        let mut bytes = [0_u8; DIRSIZ];
        bytes[..raw.len()].copy_from_slice(raw);
        #[allow(clippy::cast_possible_truncation)] // raw.len() <= DIRSIZ < 256
        Ok(Self {
            bytes,
            len: raw.len() as u8,
        })
    }

    /// Decode a NUL-padded on-disk name field.
    pub fn from_padded(raw: &[u8; DIRSIZ]) -> Result<Self, ParseError> {
        let end = raw.iter().position(|b| *b == 0).unwrap_or(DIRSIZ);
        let text = std::str::from_utf8(&raw[..end]).map_err(|_| ParseError::InvalidField {
            field: "name",
            reason: "not valid UTF-8",
        })?;
        Self::new(text)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        // Construction guarantees valid UTF-8.
        std::str::from_utf8(&self.bytes[..usize::from(self.len)]).unwrap_or("")
    }

    /// NUL-padded form for the on-disk entry.
    #[must_use]
    pub fn to_padded(&self) -> [u8; DIRSIZ] {
        self.bytes
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.as_str() == ".."
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({:?})", self.as_str())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Layout math ─────────────────────────────────────────────────────────────

/// Number of blocks occupied by the inode table.
#[must_use]
pub fn inode_table_blocks(ninodes: u32) -> u32 {
    ninodes.div_ceil(IPB)
}

/// Block holding the on-disk record of `inum`. The table starts at block 1,
/// directly after the superblock.
#[must_use]
pub fn inode_block(inum: InodeNumber) -> BlockNumber {
    BlockNumber(1 + inum.0 / IPB)
}

/// Byte offset of `inum`'s record within its table block.
#[must_use]
pub fn inode_offset(inum: InodeNumber) -> usize {
    (inum.0 % IPB) as usize * DINODE_SIZE
}

/// Bitmap block covering block number `bno`.
#[must_use]
pub fn bitmap_block(bno: BlockNumber, ninodes: u32) -> BlockNumber {
    BlockNumber(1 + inode_table_blocks(ninodes) + bno.0 / BPB)
}

/// Number of blocks occupied by the free bitmap for a `size`-block device.
#[must_use]
pub fn bitmap_blocks(size: u32) -> u32 {
    size.div_ceil(BPB)
}

/// First data block: superblock, inode table, and bitmap precede it.
#[must_use]
pub fn data_start(size: u32, ninodes: u32) -> BlockNumber {
    BlockNumber(1 + inode_table_blocks(ninodes) + bitmap_blocks(size))
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// On-disk superblock, stored in block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    /// Total blocks on the device, including metadata.
    pub size: u32,
    /// Data blocks (everything past the bitmap).
    pub nblocks: u32,
    /// Inode-table capacity.
    pub ninodes: u32,
}

impl Superblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let size = read_le_u32(block, 0)?;
        let nblocks = read_le_u32(block, 4)?;
        let ninodes = read_le_u32(block, 8)?;
        if size == 0 || ninodes == 0 {
            return Err(ParseError::InvalidField {
                field: "superblock",
                reason: "zero size or inode count",
            });
        }
        if data_start(size, ninodes).0.saturating_add(nblocks) > size {
            return Err(ParseError::InvalidField {
                field: "superblock",
                reason: "data region exceeds device size",
            });
        }
        Ok(Self {
            size,
            nblocks,
            ninodes,
        })
    }

    pub fn encode_into(&self, block: &mut [u8]) {
        put_le_u32(block, 0, self.size);
        put_le_u32(block, 4, self.nblocks);
        put_le_u32(block, 8, self.ninodes);
    }

    /// First data block on a device with this geometry.
    #[must_use]
    pub fn data_start(&self) -> BlockNumber {
        data_start(self.size, self.ninodes)
    }

    /// Bitmap block covering `bno`.
    #[must_use]
    pub fn bitmap_block(&self, bno: BlockNumber) -> BlockNumber {
        bitmap_block(bno, self.ninodes)
    }
}

// ── Codec errors and little-endian helpers ──────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn put_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_constants_are_consistent() {
        assert_eq!(IPB, 64);
        assert_eq!(DINODE_SIZE * IPB as usize, BSIZE);
        assert_eq!(DIRENT_SIZE * (BSIZE / DIRENT_SIZE), BSIZE);
        assert_eq!(JOURNAL_RECORD_SIZE, 4112);
        assert_eq!(PHYS_JOURNAL_SIZE, 256 * 4112);
    }

    #[test]
    fn layout_math() {
        // 16 inodes fit in one table block.
        assert_eq!(inode_table_blocks(16), 1);
        assert_eq!(inode_block(InodeNumber(1)), BlockNumber(1));
        assert_eq!(inode_offset(InodeNumber(1)), DINODE_SIZE);
        assert_eq!(inode_offset(InodeNumber(0)), 0);
        // 65th inode spills to the second table block.
        assert_eq!(inode_block(InodeNumber(64)), BlockNumber(2));

        // 2048-block device: bitmap is one block after the table.
        assert_eq!(bitmap_blocks(2048), 1);
        assert_eq!(bitmap_block(BlockNumber(0), 16), BlockNumber(2));
        assert_eq!(data_start(2048, 16), BlockNumber(3));
        // A device larger than one bitmap block's coverage.
        assert_eq!(bitmap_blocks(BPB + 1), 2);
        assert_eq!(bitmap_block(BlockNumber(BPB), 16), BlockNumber(3));
    }

    #[test]
    fn name_bounds() {
        assert!(Name::new("a").is_ok());
        assert!(Name::new(&"x".repeat(DIRSIZ)).is_ok());
        assert!(Name::new("").is_err());
        assert!(Name::new(&"x".repeat(DIRSIZ + 1)).is_err());
        assert!(Name::new("a/b").is_err());
        assert!(Name::new("a\0b").is_err());

        let n = Name::new("..").expect("dotdot");
        assert!(n.is_dotdot());
        assert_eq!(n.as_str(), "..");
    }

    #[test]
    fn name_padded_round_trip() {
        let n = Name::new("journal").expect("name");
        let padded = n.to_padded();
        assert_eq!(padded[7], 0);
        let back = Name::from_padded(&padded).expect("decode");
        assert_eq!(back, n);
    }

    #[test]
    fn node_kind_disk_codec() {
        assert_eq!(NodeKind::from_disk(0), Ok(None));
        assert_eq!(NodeKind::from_disk(1), Ok(Some(NodeKind::Dir)));
        assert_eq!(NodeKind::from_disk(2), Ok(Some(NodeKind::File)));
        assert_eq!(NodeKind::from_disk(3), Ok(Some(NodeKind::Symlink)));
        assert!(NodeKind::from_disk(9).is_err());
        assert_eq!(NodeKind::Dir.to_disk(), 1);
    }

    #[test]
    fn journal_header_kind_codec() {
        assert_eq!(JournalHeaderKind::from_disk(1), Some(JournalHeaderKind::Start));
        assert_eq!(JournalHeaderKind::from_disk(2), Some(JournalHeaderKind::Data));
        assert_eq!(JournalHeaderKind::from_disk(3), Some(JournalHeaderKind::Commit));
        assert_eq!(JournalHeaderKind::from_disk(0), None);
        assert_eq!(JournalHeaderKind::from_disk(7), None);
    }

    #[test]
    fn superblock_round_trip() {
        let sb = Superblock {
            size: 2048,
            nblocks: 2045,
            ninodes: 16,
        };
        let mut block = vec![0_u8; BSIZE];
        sb.encode_into(&mut block);
        assert_eq!(Superblock::parse(&block), Ok(sb));
        assert_eq!(sb.data_start(), BlockNumber(3));

        // Zero-filled block 0 is not a valid superblock.
        assert!(Superblock::parse(&vec![0_u8; BSIZE]).is_err());

        // Data region must fit on the device.
        let bad = Superblock {
            size: 10,
            nblocks: 10,
            ninodes: 16,
        };
        let mut block = vec![0_u8; BSIZE];
        bad.encode_into(&mut block);
        assert!(Superblock::parse(&block).is_err());
    }

    #[test]
    fn le_helpers_round_trip() {
        let mut buf = [0_u8; 16];
        put_le_u16(&mut buf, 0, 0x1234);
        put_le_u32(&mut buf, 2, 0xDEAD_BEEF);
        put_le_u64(&mut buf, 6, 0x0102_0304_0506_0708);
        assert_eq!(read_le_u16(&buf, 0), Ok(0x1234));
        assert_eq!(read_le_u32(&buf, 2), Ok(0xDEAD_BEEF));
        assert_eq!(read_le_u64(&buf, 6), Ok(0x0102_0304_0506_0708));
        assert!(read_le_u32(&buf, 14).is_err());
    }
}
