//! Persistent-memory heap allocator
//!
//! This module provides `PmemAllocator`, the owner of the record heap. It
//! hands out offsets, translates between offsets and addresses, and recycles
//! freed space through per-thread arenas so that `purge_and_free` is safe to
//! call from any access thread without extra locking on the hot path.
//!
//! The heap here is an anonymous in-process mapping standing in for a DAX
//! file mapping; offsets and the persistence discipline are identical.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::constants::MAX_ACCESS_THREADS;
use crate::offset::PmemOffset;
use crate::record::{DLRecord, RecordSpec, DL_RECORD_HEADER_SIZE};
use crate::thread::access_thread_id;

/// A span of reclaimable heap space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceEntry {
    /// Start of the span
    pub offset: PmemOffset,
    /// Span length in bytes
    pub size: usize,
}

/// Allocator over a single persistent-memory heap region.
///
/// Offsets returned by [`allocate`](Self::allocate) are 8-byte aligned byte
/// positions from the heap base.
pub struct PmemAllocator {
    base: *mut u8,
    layout: Layout,
    capacity: u64,
    tail: AtomicU64,
    arenas: Vec<Mutex<Vec<SpaceEntry>>>,
}

unsafe impl Send for PmemAllocator {}
unsafe impl Sync for PmemAllocator {}

impl PmemAllocator {
    /// Map a zeroed heap of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        let capacity = (capacity.max(DL_RECORD_HEADER_SIZE) + 7) & !7;
        let layout = Layout::from_size_align(capacity, 8).expect("heap layout");
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Self {
            base,
            layout,
            capacity: capacity as u64,
            tail: AtomicU64::new(0),
            arenas: (0..MAX_ACCESS_THREADS).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Heap capacity in bytes
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes handed out so far from the bump tail
    #[inline]
    pub fn used(&self) -> u64 {
        self.tail.load(Ordering::Relaxed)
    }

    /// Allocate `size` bytes, preferring the calling thread's free arena.
    ///
    /// Returns `None` when the heap is exhausted.
    pub fn allocate(&self, size: usize) -> Option<PmemOffset> {
        let size = (size + 7) & !7;

        let arena = &self.arenas[access_thread_id() % self.arenas.len()];
        {
            let mut free = arena.lock();
            if let Some(pos) = free.iter().position(|entry| entry.size >= size) {
                let entry = free.swap_remove(pos);
                if entry.size > size {
                    free.push(SpaceEntry {
                        offset: entry.offset.add(size as u64),
                        size: entry.size - size,
                    });
                }
                return Some(entry.offset);
            }
        }

        self.tail
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tail| {
                (tail + size as u64 <= self.capacity).then_some(tail + size as u64)
            })
            .ok()
            .map(PmemOffset::new)
    }

    /// Resolve an offset to a record reference.
    ///
    /// Returns `None` for the null offset and for offsets past the heap end,
    /// which recovery treats the same way: no record there.
    #[inline]
    pub fn offset2addr(&self, offset: PmemOffset) -> Option<&DLRecord> {
        if offset.is_null() || offset.raw() + DL_RECORD_HEADER_SIZE as u64 > self.capacity {
            return None;
        }
        Some(unsafe { &*(self.base.add(offset.raw() as usize) as *const DLRecord) })
    }

    /// Resolve a known-valid offset to a record reference.
    ///
    /// Panics in debug builds if the offset is null or out of bounds.
    #[inline]
    pub fn offset2addr_checked(&self, offset: PmemOffset) -> &DLRecord {
        debug_assert!(!offset.is_null());
        debug_assert!(offset.raw() + DL_RECORD_HEADER_SIZE as u64 <= self.capacity);
        unsafe { &*(self.base.add(offset.raw() as usize) as *const DLRecord) }
    }

    /// Offset of a record inside this heap
    #[inline]
    pub fn addr2offset(&self, record: &DLRecord) -> PmemOffset {
        let addr = record as *const DLRecord as usize;
        let base = self.base as usize;
        debug_assert!(addr >= base && addr < base + self.capacity as usize);
        PmemOffset::new((addr - base) as u64)
    }

    /// Persist a fully-formed record at `offset`
    pub fn write_record(&self, offset: PmemOffset, spec: &RecordSpec<'_>) -> &DLRecord {
        let size = DLRecord::record_size_for(spec.key.len(), spec.value.len());
        assert!(offset.raw() + size as u64 <= self.capacity, "record past heap end");
        unsafe { DLRecord::persist_record(self.base.add(offset.raw() as usize), spec) }
    }

    /// Destroy a record and return its space to the calling thread's arena
    pub fn purge_and_free(&self, record: &DLRecord) {
        let entry = SpaceEntry {
            offset: self.addr2offset(record),
            size: record.record_size(),
        };
        record.destroy();
        self.arenas[access_thread_id() % self.arenas.len()]
            .lock()
            .push(entry);
    }

    /// Return a batch of already-destroyed spans to the calling thread's arena
    pub fn batch_free(&self, entries: Vec<SpaceEntry>) {
        if entries.is_empty() {
            return;
        }
        self.arenas[access_thread_id() % self.arenas.len()]
            .lock()
            .extend(entries);
    }
}

impl Drop for PmemAllocator {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}
