//! oxipmem - A persistent-memory sorted key-value store engine
//!
//! This crate provides sorted collections (skip lists) backed by durable
//! doubly-linked records in a persistent-memory heap, together with a
//! parallel recovery subsystem that reconstructs all in-memory indices
//! after an abrupt shutdown:
//! - **Durable records**: fixed-header `DLRecord`s with crash-safe pointer
//!   updates and multi-version chains
//! - **Sorted collections**: in-memory skip-list towers over the durable
//!   level-1 chain, optionally indexed in a global hash table
//! - **Recovery**: linkage repair, checkpoint reconciliation, and a
//!   segment-partitioned parallel index rebuild
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxipmem::prelude::*;
//!
//! // Recover sorted collections from a heap populated by a prior run
//! let mut rebuilder = SortedRebuilder::new(pmem, hash_table, locks,
//!                                          comparators, options, checkpoint);
//! // ... feed records discovered by the scan pass ...
//! let result = rebuilder.rebuild();
//! assert!(result.s.is_ok());
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod allocator;
pub mod batch_log;
pub mod checkpoint;
pub mod comparator;
pub mod config;
pub mod hash_table;
pub mod offset;
pub mod rebuild;
pub mod record;
pub mod skiplist;
pub mod status;
pub mod thread;

// Re-exports for convenience
pub use offset::PmemOffset;
pub use record::{DLRecord, RecordStatus, RecordType};
pub use status::Status;

/// Constants used throughout the library
pub mod constants {
    /// Maximum tower height of a skip-list node
    pub const MAX_SKIPLIST_HEIGHT: usize = 32;

    /// Maximum number of access threads supported
    pub const MAX_ACCESS_THREADS: usize = 96;

    /// Spacing (in elements) between candidate recovery-segment starts
    pub const RESTORE_SKIPLIST_STRIDE: u64 = 10_000;
}

/// Identifier of a sorted collection
pub type CollectionId = u64;

/// Monotonic version stamp carried by every durable record
pub type Timestamp = u64;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::allocator::{PmemAllocator, SpaceEntry};
    pub use crate::checkpoint::Checkpoint;
    pub use crate::comparator::ComparatorRegistry;
    pub use crate::hash_table::{HashTable, LockTable};
    pub use crate::offset::PmemOffset;
    pub use crate::rebuild::{RebuildResult, RecoveryOptions, SortedRebuilder};
    pub use crate::record::{DLRecord, RecordStatus, RecordType};
    pub use crate::skiplist::Skiplist;
    pub use crate::status::Status;
}
