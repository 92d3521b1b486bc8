//! Skip lists over durable doubly-linked record chains

use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::allocator::PmemAllocator;
use crate::comparator::Comparator;
use crate::constants::MAX_SKIPLIST_HEIGHT;
use crate::hash_table::LockTable;
use crate::offset::PmemOffset;
use crate::record::{DLRecord, RecordType};
use crate::skiplist::node::SkiplistNode;
use crate::status::Status;
use crate::{CollectionId, Timestamp};

/// Durable per-collection configuration, encoded in the header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedCollectionConfigs {
    /// Name of the registered comparator ordering the collection
    pub comparator_name: String,
    /// Whether elements are also indexed in the global hash table
    pub index_with_hashtable: bool,
}

impl Default for SortedCollectionConfigs {
    fn default() -> Self {
        Self {
            comparator_name: crate::comparator::DEFAULT_COMPARATOR_NAME.to_string(),
            index_with_hashtable: true,
        }
    }
}

/// Encode a header value: collection id, flags, and comparator name
pub fn encode_collection_value(id: CollectionId, configs: &SortedCollectionConfigs) -> Vec<u8> {
    let name = configs.comparator_name.as_bytes();
    let mut value = Vec::with_capacity(mem::size_of::<u64>() + 1 + mem::size_of::<u32>() + name.len());
    value.extend_from_slice(&id.to_le_bytes());
    value.push(configs.index_with_hashtable as u8);
    value.extend_from_slice(&(name.len() as u32).to_le_bytes());
    value.extend_from_slice(name);
    value
}

/// Decode a header value written by [`encode_collection_value`]
pub fn decode_collection_value(value: &[u8]) -> Result<(CollectionId, SortedCollectionConfigs), Status> {
    if value.len() < mem::size_of::<u64>() + 1 + mem::size_of::<u32>() {
        return Err(Status::Abort);
    }
    let id = u64::from_le_bytes(value[..8].try_into().expect("8-byte id prefix"));
    let index_with_hashtable = value[8] != 0;
    let name_len = u32::from_le_bytes(value[9..13].try_into().expect("4-byte length")) as usize;
    if value.len() < 13 + name_len {
        return Err(Status::Abort);
    }
    let comparator_name = String::from_utf8(value[13..13 + name_len].to_vec())
        .map_err(|_| Status::Abort)?;
    Ok((
        id,
        SortedCollectionConfigs {
            comparator_name,
            index_with_hashtable,
        },
    ))
}

/// Build the internal key of an element: collection id prefix plus user key
pub fn encode_internal_key(id: CollectionId, user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(mem::size_of::<u64>() + user_key.len());
    key.extend_from_slice(&id.to_le_bytes());
    key.extend_from_slice(user_key);
    key
}

/// Collection id prefix of an internal key
pub fn extract_id(internal_key: &[u8]) -> CollectionId {
    debug_assert!(internal_key.len() >= mem::size_of::<u64>());
    u64::from_le_bytes(internal_key[..8].try_into().expect("8-byte id prefix"))
}

/// User-key suffix of an internal key
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= mem::size_of::<u64>());
    &internal_key[8..]
}

/// Per-level cursor array used to thread tower pointers during a list walk.
///
/// Index 0 is unused; `prevs[i]` is the last node seen whose height reaches
/// level `i`.
pub struct Splice {
    /// Last node seen per level
    pub prevs: [*mut SkiplistNode; MAX_SKIPLIST_HEIGHT + 1],
    /// Offset of the last durable record kept on the chain
    pub prev_pmem_record: PmemOffset,
}

impl Splice {
    /// A splice with every cursor at the list's header
    pub fn new(list: &Skiplist) -> Self {
        Self {
            prevs: [list.header_node().as_ptr(); MAX_SKIPLIST_HEIGHT + 1],
            prev_pmem_record: list.header_offset(),
        }
    }
}

/// An in-memory sorted collection over a durable record chain
pub struct Skiplist {
    header_node: NonNull<SkiplistNode>,
    header_record: *const DLRecord,
    id: CollectionId,
    name: String,
    comparator: Comparator,
    size: AtomicU64,
    index_with_hashtable: bool,
    pmem: Arc<PmemAllocator>,
    locks: Arc<LockTable>,
}

// The header node and record are owned for the list's lifetime; all shared
// mutation goes through atomics or the lock table.
unsafe impl Send for Skiplist {}
unsafe impl Sync for Skiplist {}

impl Skiplist {
    /// Create a collection rooted at `header_record`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        header_record: &DLRecord,
        name: impl Into<String>,
        id: CollectionId,
        comparator: Comparator,
        pmem: Arc<PmemAllocator>,
        locks: Arc<LockTable>,
        index_with_hashtable: bool,
    ) -> Self {
        let header_node = SkiplistNode::alloc(header_record, MAX_SKIPLIST_HEIGHT as u8);
        Self {
            header_node,
            header_record,
            id,
            name: name.into(),
            comparator,
            size: AtomicU64::new(0),
            index_with_hashtable,
            pmem,
            locks,
        }
    }

    /// Collection id
    #[inline]
    pub fn id(&self) -> CollectionId {
        self.id
    }

    /// Collection name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The collection's comparator
    #[inline]
    pub fn comparator(&self) -> Comparator {
        self.comparator
    }

    /// Whether elements are also indexed in the global hash table
    #[inline]
    pub fn index_with_hashtable(&self) -> bool {
        self.index_with_hashtable
    }

    /// The in-memory header node
    #[inline]
    pub fn header_node(&self) -> NonNull<SkiplistNode> {
        self.header_node
    }

    /// The durable header record
    #[inline]
    pub fn header_record(&self) -> &DLRecord {
        unsafe { &*self.header_record }
    }

    /// Heap offset of the durable header record
    #[inline]
    pub fn header_offset(&self) -> PmemOffset {
        self.pmem.addr2offset(self.header_record())
    }

    /// Number of elements
    #[inline]
    pub fn len(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether the collection holds no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add `delta` elements to the collection's size
    #[inline]
    pub fn update_size(&self, delta: u64) {
        self.size.fetch_add(delta, Ordering::Relaxed);
    }

    /// Timestamp of the durable header
    #[inline]
    pub fn header_timestamp(&self) -> Timestamp {
        self.header_record().timestamp()
    }

    /// Collection id of any sorted record: the internal-key prefix for
    /// elements, the encoded value prefix for headers
    pub fn fetch_id(record: &DLRecord) -> CollectionId {
        match record.record_type() {
            RecordType::SortedElem => extract_id(record.key()),
            RecordType::SortedHeader => {
                let value = record.value();
                debug_assert!(value.len() >= mem::size_of::<u64>());
                u64::from_le_bytes(value[..8].try_into().expect("8-byte id prefix"))
            }
            RecordType::Empty => {
                debug_assert!(false, "fetch_id on a destroyed record");
                0
            }
        }
    }

    /// Swap `new` into the chain in place of `old`.
    ///
    /// `old`'s linkage must hold; after return `old` is no longer reachable
    /// from the chain and fails its own linkage check. Returns `false` when
    /// the linkage was already broken.
    pub fn replace(old: &DLRecord, new: &DLRecord, pmem: &PmemAllocator, locks: &LockTable) -> bool {
        let old_offset = pmem.addr2offset(old);
        let new_offset = pmem.addr2offset(new);
        loop {
            let prev_offset = old.prev();
            let next_offset = old.next();
            let _guards = locks.lock_records(&[old_offset, prev_offset, next_offset]);
            if old.prev() != prev_offset || old.next() != next_offset {
                // A neighbour swap raced the lock acquisition; the held
                // stripes may not cover the new neighbours.
                continue;
            }
            let prev_record = pmem.offset2addr_checked(prev_offset);
            let next_record = pmem.offset2addr_checked(next_offset);
            if prev_record.next() != old_offset || next_record.prev() != old_offset {
                return false;
            }

            if prev_offset == old_offset {
                // Empty collection: the header is its own neighbour. The
                // outgoing header keeps a pointer at its successor so a later
                // pass sees its linkage as broken.
                debug_assert!(next_offset == old_offset);
                new.persist_prev(new_offset);
                new.persist_next(new_offset);
                old.persist_prev(new_offset);
            } else {
                new.persist_prev(prev_offset);
                new.persist_next(next_offset);
                prev_record.persist_next(new_offset);
                next_record.persist_prev(new_offset);
            }
            return true;
        }
    }

    /// Unlink `record` from the chain.
    ///
    /// Returns `false` when the linkage was already broken or the record is
    /// a self-looped header.
    pub fn remove(record: &DLRecord, pmem: &PmemAllocator, locks: &LockTable) -> bool {
        let offset = pmem.addr2offset(record);
        loop {
            let prev_offset = record.prev();
            let next_offset = record.next();
            let _guards = locks.lock_records(&[offset, prev_offset, next_offset]);
            if record.prev() != prev_offset || record.next() != next_offset {
                continue;
            }
            if prev_offset == offset {
                return false;
            }
            let prev_record = pmem.offset2addr_checked(prev_offset);
            let next_record = pmem.offset2addr_checked(next_offset);
            if prev_record.next() != offset || next_record.prev() != offset {
                return false;
            }

            prev_record.persist_next(next_offset);
            next_record.persist_prev(prev_offset);
            return true;
        }
    }

    /// Iterate the durable element chain from the header back around to it
    pub fn chain_records(&self) -> ChainIter<'_> {
        let header_offset = self.header_offset();
        ChainIter {
            pmem: self.pmem.as_ref(),
            header_offset,
            cursor: self.header_record().next(),
        }
    }

    /// Records of the nodes reachable at tower `level` (1-based)
    pub fn nodes_at_level(&self, level: usize) -> Vec<&DLRecord> {
        let mut records = Vec::new();
        let mut cursor = unsafe { self.header_node.as_ref() }.relaxed_next(level);
        while let Some(node) = unsafe { cursor.as_ref() } {
            records.push(node.record());
            cursor = node.relaxed_next(level);
        }
        records
    }

    /// Destroy every durable record of the collection and return their
    /// space to the allocator.
    ///
    /// Used for collections classified invalid during recovery; in-memory
    /// nodes are freed when the list is dropped.
    pub fn destroy(&self) {
        let header_offset = self.header_offset();
        let mut cursor = self.header_record().next();
        while cursor != header_offset && !cursor.is_null() {
            let record = self.pmem.offset2addr_checked(cursor);
            if !record.record_type().is_sorted() {
                break;
            }
            cursor = record.next();
            self.pmem.purge_and_free(record);
        }
        if self.header_record().record_type().is_sorted() {
            self.pmem.purge_and_free(self.header_record());
        }
    }
}

impl Drop for Skiplist {
    fn drop(&mut self) {
        unsafe {
            let mut cursor = self.header_node.as_ptr();
            while !cursor.is_null() {
                let next = (*cursor).relaxed_next(1);
                SkiplistNode::dealloc(cursor);
                cursor = next;
            }
        }
    }
}

impl std::fmt::Debug for Skiplist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Skiplist")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.len())
            .field("index_with_hashtable", &self.index_with_hashtable)
            .finish()
    }
}

/// Iterator over the durable records of a collection's chain
pub struct ChainIter<'a> {
    pmem: &'a PmemAllocator,
    header_offset: PmemOffset,
    cursor: PmemOffset,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a DLRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == self.header_offset || self.cursor.is_null() {
            return None;
        }
        let record = self.pmem.offset2addr_checked(self.cursor);
        if !record.record_type().is_sorted() {
            return None;
        }
        self.cursor = record.next();
        Some(record)
    }
}
