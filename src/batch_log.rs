//! Batch-write log entries consumed during recovery
//!
//! The write path journals every record it is about to link into a batch
//! log. On restart, entries of uncommitted batches are handed to the
//! rebuilder's rollback so partially-applied writes are erased from the
//! persistent chains before any index is rebuilt.

use crate::offset::PmemOffset;

/// Log entry for a sorted-collection element written by a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortedLogEntry {
    /// Heap offset of the journaled element record
    pub offset: PmemOffset,
}

impl SortedLogEntry {
    /// Entry for the record at `offset`
    pub const fn new(offset: PmemOffset) -> Self {
        Self { offset }
    }
}
