#![forbid(unsafe_code)]
//! MFS core: the in-memory namespace, the logical-to-physical transaction
//! assembler, and the facade the VFS layer drives.
//!
//! Mutating namespace calls append operations to the per-core logical log
//! and return without touching the disk. `fsync` and `sync` fuse logged
//! operations in timestamp order into physical block transactions, commit
//! them through the write-ahead journal, and apply them to the backing
//! store.

mod apply;
pub mod dev;
mod ident;
mod interface;
mod mnode;

pub use ident::IdentityMaps;
pub use interface::{MfsConfig, MfsInterface};
pub use mnode::Mnode;
