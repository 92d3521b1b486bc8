//! Durable record format for the persistent-memory heap
//!
//! This module defines `DLRecord`, the doubly-linked record stored in
//! persistent memory. Each record consists of a fixed 56-byte header
//! followed by the key and value bytes.
//!
//! # Memory Layout
//! ```text
//! +------------------+
//! | prev        (8)  |
//! | next        (8)  |
//! | old_version (8)  |
//! | timestamp   (8)  |
//! | expire_time (8)  |
//! | key_size    (4)  |
//! | value_size  (4)  |
//! | record_type (1)  |
//! | record_status(1) |
//! | padding     (6)  |
//! +------------------+
//! | key bytes        |
//! +------------------+
//! | value bytes      |
//! +------------------+
//! ```
//!
//! The three linkage fields are atomics: recovery threads repair and rewrite
//! them while other threads read them. All pointer updates go through the
//! `persist_*` methods, which publish the store and then fence so that the
//! write is durable before the method returns.

use std::mem;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::offset::PmemOffset;
use crate::Timestamp;

/// Expire time meaning "never expires"
pub const PERSIST_TIME: i64 = i64::MAX;

/// Issue the persistence barrier that orders a prior store before any
/// subsequent persistent access.
///
/// On real persistent memory this is a cache-line write-back plus a store
/// fence; the in-process heap needs only the fence.
#[inline]
pub fn persist_fence() {
    fence(Ordering::SeqCst);
}

/// Type tag of a durable record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Destroyed or never-written space
    Empty = 0,
    /// Header record of a sorted collection
    SortedHeader = 1,
    /// Element record of a sorted collection
    SortedElem = 2,
}

impl RecordType {
    /// Decode from the raw header byte
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RecordType::Empty),
            1 => Some(RecordType::SortedHeader),
            2 => Some(RecordType::SortedElem),
            _ => None,
        }
    }

    /// Check whether this is a sorted-collection record type
    #[inline]
    pub const fn is_sorted(&self) -> bool {
        matches!(self, RecordType::SortedHeader | RecordType::SortedElem)
    }
}

/// Lifecycle status of a durable record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RecordStatus {
    /// Live record
    #[default]
    Normal = 0,
    /// Logically deleted; kept only for older snapshots
    Outdated = 1,
}

impl RecordStatus {
    /// Decode from the raw header byte
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RecordStatus::Normal),
            1 => Some(RecordStatus::Outdated),
            _ => None,
        }
    }
}

/// A durable doubly-linked record in the persistent-memory heap.
///
/// References to `DLRecord` are only ever materialized by the allocator's
/// `offset2addr` family over a heap written through [`DLRecord::persist_record`],
/// which is what makes the byte-slice accessors sound.
#[repr(C)]
pub struct DLRecord {
    prev: AtomicU64,
    next: AtomicU64,
    old_version: AtomicU64,
    timestamp: u64,
    expire_time: i64,
    key_size: u32,
    value_size: u32,
    record_type: AtomicU8,
    record_status: AtomicU8,
    _pad: [u8; 6],
}

/// Header size in bytes; key bytes start here
pub const DL_RECORD_HEADER_SIZE: usize = 56;

const _: () = assert!(mem::size_of::<DLRecord>() == DL_RECORD_HEADER_SIZE);

/// Everything needed to persist a fully-formed record
#[derive(Debug, Clone, Copy)]
pub struct RecordSpec<'a> {
    /// Record type tag
    pub record_type: RecordType,
    /// Record lifecycle status
    pub record_status: RecordStatus,
    /// Version stamp
    pub timestamp: Timestamp,
    /// Absolute expiry in milliseconds since the epoch, or [`PERSIST_TIME`]
    pub expire_time: i64,
    /// Offset of the previous record in the list
    pub prev: PmemOffset,
    /// Offset of the next record in the list
    pub next: PmemOffset,
    /// Offset of the previous version of this key, or null
    pub old_version: PmemOffset,
    /// Key bytes (internal form: collection id prefix + user key for elements)
    pub key: &'a [u8],
    /// Value bytes
    pub value: &'a [u8],
}

impl DLRecord {
    /// Total heap footprint of a record with the given key/value sizes,
    /// rounded up to 8-byte alignment
    #[inline]
    pub const fn record_size_for(key_size: usize, value_size: usize) -> usize {
        (DL_RECORD_HEADER_SIZE + key_size + value_size + 7) & !7
    }

    /// Heap footprint of this record
    #[inline]
    pub fn record_size(&self) -> usize {
        Self::record_size_for(self.key_size as usize, self.value_size as usize)
    }

    /// Write a fully-formed record at `addr` and fence.
    ///
    /// # Safety
    /// `addr` must point to at least `record_size_for(key.len(), value.len())`
    /// writable bytes with 8-byte alignment, and no other thread may access
    /// that region during the write.
    pub unsafe fn persist_record<'a>(addr: *mut u8, spec: &RecordSpec<'_>) -> &'a DLRecord {
        let header = addr as *mut DLRecord;
        header.write(DLRecord {
            prev: AtomicU64::new(spec.prev.raw()),
            next: AtomicU64::new(spec.next.raw()),
            old_version: AtomicU64::new(spec.old_version.raw()),
            timestamp: spec.timestamp,
            expire_time: spec.expire_time,
            key_size: spec.key.len() as u32,
            value_size: spec.value.len() as u32,
            record_type: AtomicU8::new(spec.record_type as u8),
            record_status: AtomicU8::new(spec.record_status as u8),
            _pad: [0; 6],
        });
        let data = addr.add(DL_RECORD_HEADER_SIZE);
        std::ptr::copy_nonoverlapping(spec.key.as_ptr(), data, spec.key.len());
        std::ptr::copy_nonoverlapping(spec.value.as_ptr(), data.add(spec.key.len()), spec.value.len());
        persist_fence();
        &*header
    }

    /// Offset of the previous record
    #[inline]
    pub fn prev(&self) -> PmemOffset {
        PmemOffset::new(self.prev.load(Ordering::Acquire))
    }

    /// Offset of the next record
    #[inline]
    pub fn next(&self) -> PmemOffset {
        PmemOffset::new(self.next.load(Ordering::Acquire))
    }

    /// Offset of the previous version of this key
    #[inline]
    pub fn old_version(&self) -> PmemOffset {
        PmemOffset::new(self.old_version.load(Ordering::Acquire))
    }

    /// Version stamp of this record
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Absolute expiry time in milliseconds since the epoch
    #[inline]
    pub fn expire_time(&self) -> i64 {
        self.expire_time
    }

    /// Record type tag
    #[inline]
    pub fn record_type(&self) -> RecordType {
        RecordType::from_raw(self.record_type.load(Ordering::Acquire)).unwrap_or(RecordType::Empty)
    }

    /// Record lifecycle status
    #[inline]
    pub fn record_status(&self) -> RecordStatus {
        RecordStatus::from_raw(self.record_status.load(Ordering::Acquire))
            .unwrap_or(RecordStatus::Normal)
    }

    /// Key bytes of this record
    #[inline]
    pub fn key(&self) -> &[u8] {
        unsafe {
            let data = (self as *const DLRecord as *const u8).add(DL_RECORD_HEADER_SIZE);
            std::slice::from_raw_parts(data, self.key_size as usize)
        }
    }

    /// Value bytes of this record
    #[inline]
    pub fn value(&self) -> &[u8] {
        unsafe {
            let data = (self as *const DLRecord as *const u8)
                .add(DL_RECORD_HEADER_SIZE + self.key_size as usize);
            std::slice::from_raw_parts(data, self.value_size as usize)
        }
    }

    /// Durably set the prev offset
    #[inline]
    pub fn persist_prev(&self, offset: PmemOffset) {
        self.prev.store(offset.raw(), Ordering::Release);
        persist_fence();
    }

    /// Durably set the next offset
    #[inline]
    pub fn persist_next(&self, offset: PmemOffset) {
        self.next.store(offset.raw(), Ordering::Release);
        persist_fence();
    }

    /// Durably set the old-version offset
    #[inline]
    pub fn persist_old_version(&self, offset: PmemOffset) {
        self.old_version.store(offset.raw(), Ordering::Release);
        persist_fence();
    }

    /// Structural validity check: a sorted record type with a key large
    /// enough for its form (elements carry an 8-byte collection-id prefix)
    pub fn validate(&self) -> bool {
        match self.record_type() {
            RecordType::SortedHeader => true,
            RecordType::SortedElem => self.key_size as usize >= mem::size_of::<u64>(),
            RecordType::Empty => false,
        }
    }

    /// Check whether the record's TTL has elapsed
    pub fn has_expired(&self) -> bool {
        self.expire_time != PERSIST_TIME && self.expire_time <= unix_time_ms()
    }

    /// Durably mark the record destroyed
    pub fn destroy(&self) {
        self.record_type
            .store(RecordType::Empty as u8, Ordering::Release);
        persist_fence();
    }
}

impl std::fmt::Debug for DLRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DLRecord")
            .field("record_type", &self.record_type())
            .field("record_status", &self.record_status())
            .field("timestamp", &self.timestamp)
            .field("prev", &self.prev())
            .field("next", &self.next())
            .field("old_version", &self.old_version())
            .field("key_size", &self.key_size)
            .field("value_size", &self.value_size)
            .finish()
    }
}

fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_record<'a>(buf: &'a mut [u8], spec: &RecordSpec<'_>) -> &'a DLRecord {
        assert!(buf.len() >= DLRecord::record_size_for(spec.key.len(), spec.value.len()));
        unsafe { DLRecord::persist_record(buf.as_mut_ptr(), spec) }
    }

    fn spec<'a>(key: &'a [u8], value: &'a [u8]) -> RecordSpec<'a> {
        RecordSpec {
            record_type: RecordType::SortedElem,
            record_status: RecordStatus::Normal,
            timestamp: 7,
            expire_time: PERSIST_TIME,
            prev: PmemOffset::new(0),
            next: PmemOffset::new(128),
            old_version: PmemOffset::NULL,
            key,
            value,
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(mem::size_of::<DLRecord>(), 56);
    }

    #[test]
    fn test_record_size_alignment() {
        assert_eq!(DLRecord::record_size_for(0, 0), 56);
        assert_eq!(DLRecord::record_size_for(1, 0), 64);
        assert_eq!(DLRecord::record_size_for(8, 8), 72);
        assert_eq!(DLRecord::record_size_for(9, 8), 80);
    }

    #[test]
    fn test_persist_and_read_back() {
        let mut buf = vec![0u8; 128];
        let rec = write_test_record(&mut buf, &spec(b"\0\0\0\0\0\0\0\x07key", b"value"));

        assert_eq!(rec.record_type(), RecordType::SortedElem);
        assert_eq!(rec.record_status(), RecordStatus::Normal);
        assert_eq!(rec.timestamp(), 7);
        assert_eq!(rec.prev(), PmemOffset::new(0));
        assert_eq!(rec.next(), PmemOffset::new(128));
        assert!(rec.old_version().is_null());
        assert_eq!(rec.key(), b"\0\0\0\0\0\0\0\x07key");
        assert_eq!(rec.value(), b"value");
        assert!(rec.validate());
    }

    #[test]
    fn test_persist_pointers() {
        let mut buf = vec![0u8; 128];
        let rec = write_test_record(&mut buf, &spec(b"\0\0\0\0\0\0\0\x07k", b"v"));

        rec.persist_prev(PmemOffset::new(512));
        rec.persist_next(PmemOffset::new(1024));
        rec.persist_old_version(PmemOffset::new(2048));

        assert_eq!(rec.prev().raw(), 512);
        assert_eq!(rec.next().raw(), 1024);
        assert_eq!(rec.old_version().raw(), 2048);
    }

    #[test]
    fn test_validate_rejects_short_elem_key() {
        let mut buf = vec![0u8; 128];
        let rec = write_test_record(&mut buf, &spec(b"abc", b"v"));
        assert!(!rec.validate());
    }

    #[test]
    fn test_destroy() {
        let mut buf = vec![0u8; 128];
        let rec = write_test_record(&mut buf, &spec(b"\0\0\0\0\0\0\0\x07k", b"v"));
        assert!(rec.validate());

        rec.destroy();
        assert_eq!(rec.record_type(), RecordType::Empty);
        assert!(!rec.validate());
    }

    #[test]
    fn test_expiry() {
        let mut buf = vec![0u8; 128];
        let mut s = spec(b"\0\0\0\0\0\0\0\x07k", b"v");
        s.expire_time = 1; // far in the past
        let rec = write_test_record(&mut buf, &s);
        assert!(rec.has_expired());

        let mut buf2 = vec![0u8; 128];
        let rec2 = write_test_record(&mut buf2, &spec(b"\0\0\0\0\0\0\0\x07k", b"v"));
        assert!(!rec2.has_expired());
    }

    #[test]
    fn test_record_type_from_raw() {
        assert_eq!(RecordType::from_raw(0), Some(RecordType::Empty));
        assert_eq!(RecordType::from_raw(1), Some(RecordType::SortedHeader));
        assert_eq!(RecordType::from_raw(2), Some(RecordType::SortedElem));
        assert_eq!(RecordType::from_raw(9), None);

        assert!(RecordType::SortedHeader.is_sorted());
        assert!(RecordType::SortedElem.is_sorted());
        assert!(!RecordType::Empty.is_sorted());
    }
}
