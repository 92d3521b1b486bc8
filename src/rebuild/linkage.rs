//! Linkage checks and repair for durable doubly-linked records
//!
//! A record is *linked* when both of its neighbours acknowledge it. A crash
//! between the two neighbour stores of an insert or remove leaves exactly one
//! side acknowledged; that side proves membership, so the missing
//! back-pointer can be persisted to match. A record acknowledged by neither
//! side was never published and is not repairable.

use std::sync::Arc;

use crate::allocator::PmemAllocator;
use crate::record::DLRecord;

/// Linkage queries and repair over one heap
pub struct RecoveryLinkage {
    pmem: Arc<PmemAllocator>,
}

impl RecoveryLinkage {
    /// Linkage utilities for `pmem`
    pub fn new(pmem: Arc<PmemAllocator>) -> Self {
        Self { pmem }
    }

    /// Whether the record's prev neighbour points back at it
    pub fn check_prev_linkage(&self, record: &DLRecord) -> bool {
        let offset = self.pmem.addr2offset(record);
        match self.pmem.offset2addr(record.prev()) {
            Some(prev) => prev.next() == offset,
            None => false,
        }
    }

    /// Whether the record's next neighbour points back at it
    pub fn check_next_linkage(&self, record: &DLRecord) -> bool {
        let offset = self.pmem.addr2offset(record);
        match self.pmem.offset2addr(record.next()) {
            Some(next) => next.prev() == offset,
            None => false,
        }
    }

    /// Whether both neighbours acknowledge the record
    pub fn check_linkage(&self, record: &DLRecord) -> bool {
        self.check_prev_linkage(record) && self.check_next_linkage(record)
    }

    /// Check both sides and repair a single broken one.
    ///
    /// The store that repairs linkage is durable before this returns `true`;
    /// a crash right after the call must leave the chain recoverable.
    pub fn check_and_repair_linkage(&self, record: &DLRecord) -> bool {
        let offset = self.pmem.addr2offset(record);
        match (self.check_prev_linkage(record), self.check_next_linkage(record)) {
            (true, true) => true,
            (true, false) => {
                // The prev side proves membership; persist the missing
                // back-pointer on the next neighbour.
                let Some(next) = self.pmem.offset2addr(record.next()) else {
                    return false;
                };
                if !next.record_type().is_sorted() {
                    return false;
                }
                next.persist_prev(offset);
                true
            }
            (false, true) => {
                let Some(prev) = self.pmem.offset2addr(record.prev()) else {
                    return false;
                };
                if !prev.record_type().is_sorted() {
                    return false;
                }
                prev.persist_next(offset);
                true
            }
            (false, false) => false,
        }
    }
}
