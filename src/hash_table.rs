//! Global hash index and striped lock tables
//!
//! The hash table maps internal keys (collection names for headers, id-prefixed
//! user keys for elements) to tagged index pointers. Per-key exclusive access
//! is provided by a striped lock table keyed on the key hash; a second lock
//! table striped on record offsets serializes structural mutations of the
//! persistent doubly-linked lists.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::offset::PmemOffset;
use crate::record::{DLRecord, RecordStatus, RecordType};
use crate::skiplist::{Skiplist, SkiplistNode};
use crate::status::Status;

/// Murmur3 64-bit finalizer, used to spread keys and offsets over stripes
#[inline]
pub(crate) fn mix_hash(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

fn key_hash(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Guard for an exclusively-held stripe
pub type StripeGuard<'a> = MutexGuard<'a, ()>;

/// A striped table of exclusive locks.
///
/// Used both for per-key hash-table locks and for the per-record locks
/// acquired inside persistent-list `Replace`/`Remove`.
pub struct LockTable {
    stripes: Vec<Mutex<()>>,
}

impl LockTable {
    /// Create a table with `n` stripes (rounded up to a power of two)
    pub fn new(n: usize) -> Self {
        let n = n.max(1).next_power_of_two();
        Self {
            stripes: (0..n).map(|_| Mutex::new(())).collect(),
        }
    }

    #[inline]
    fn stripe_of(&self, hash: u64) -> usize {
        (mix_hash(hash) & (self.stripes.len() as u64 - 1)) as usize
    }

    /// Lock the stripe for a hash value
    pub fn lock_hash(&self, hash: u64) -> StripeGuard<'_> {
        self.stripes[self.stripe_of(hash)].lock()
    }

    /// Lock the stripe for a record offset
    pub fn lock_record(&self, offset: PmemOffset) -> StripeGuard<'_> {
        self.lock_hash(offset.raw())
    }

    /// Lock the stripes covering a set of record offsets.
    ///
    /// Stripes are acquired in index order with duplicates skipped, so
    /// concurrent callers over overlapping records cannot deadlock.
    pub fn lock_records(&self, offsets: &[PmemOffset]) -> Vec<StripeGuard<'_>> {
        let mut stripes: Vec<usize> = offsets.iter().map(|o| self.stripe_of(o.raw())).collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes.into_iter().map(|i| self.stripes[i].lock()).collect()
    }
}

/// Tagged pointer stored in a hash entry.
///
/// Recovery indexes an element by its in-memory skip-list node when one was
/// built and by the durable record otherwise; collection headers are indexed
/// by their skip list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPtr {
    /// A durable record with no in-memory node
    Record(*const DLRecord),
    /// An in-memory skip-list node
    Node(*const SkiplistNode),
    /// A whole skip list (collection header entry)
    List(*const Skiplist),
}

// The pointed-to objects live for the lifetime of the engine (records in the
// heap, nodes in their skip list, lists in the collection directory) and are
// only mutated through atomics.
unsafe impl Send for IndexPtr {}
unsafe impl Sync for IndexPtr {}

/// One slot of the global hash index
#[derive(Debug, Clone, Copy)]
pub struct HashEntry {
    /// Type tag of the indexed object
    pub record_type: RecordType,
    /// Lifecycle status of the indexed object
    pub record_status: RecordStatus,
    /// Tagged pointer to the indexed object
    pub ptr: IndexPtr,
}

/// Outcome of a hash-table insert or lookup
#[derive(Debug, Clone, Copy)]
pub struct LookupResult {
    /// `NotFound` when the slot was fresh, `Ok` when it already held a value
    pub s: Status,
    /// The previous entry, when the slot was occupied
    pub existing: Option<HashEntry>,
}

/// The global hash index
pub struct HashTable {
    shards: Vec<RwLock<HashMap<Box<[u8]>, HashEntry>>>,
    key_locks: LockTable,
}

impl HashTable {
    /// Create a table with `num_shards` shards (rounded up to a power of two)
    pub fn new(num_shards: usize) -> Self {
        let num_shards = num_shards.max(1).next_power_of_two();
        Self {
            shards: (0..num_shards).map(|_| RwLock::new(HashMap::new())).collect(),
            key_locks: LockTable::new(num_shards * 16),
        }
    }

    #[inline]
    fn shard_of(&self, hash: u64) -> usize {
        (mix_hash(hash) & (self.shards.len() as u64 - 1)) as usize
    }

    /// Acquire the exclusive per-key lock for `key`.
    ///
    /// Callers hold this around version resolution and the matching insert
    /// so no concurrent thread can swap the key's version underneath them.
    pub fn acquire_lock(&self, key: &[u8]) -> StripeGuard<'_> {
        self.key_locks.lock_hash(key_hash(key))
    }

    /// Insert or overwrite the entry for `key`.
    ///
    /// A fresh slot reports `Status::NotFound`; an occupied slot reports
    /// `Status::Ok` and carries the previous entry.
    pub fn insert(
        &self,
        key: &[u8],
        record_type: RecordType,
        record_status: RecordStatus,
        ptr: IndexPtr,
    ) -> LookupResult {
        let hash = key_hash(key);
        let mut shard = self.shards[self.shard_of(hash)].write();
        let new_entry = HashEntry {
            record_type,
            record_status,
            ptr,
        };
        match shard.entry(key.to_vec().into_boxed_slice()) {
            Entry::Occupied(mut slot) => {
                let existing = *slot.get();
                slot.insert(new_entry);
                LookupResult {
                    s: Status::Ok,
                    existing: Some(existing),
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(new_entry);
                LookupResult {
                    s: Status::NotFound,
                    existing: None,
                }
            }
        }
    }

    /// Look up the entry for `key`
    pub fn lookup(&self, key: &[u8]) -> Option<HashEntry> {
        let hash = key_hash(key);
        self.shards[self.shard_of(hash)].read().get(key).copied()
    }

    /// Remove the entry for `key`, returning it if present
    pub fn remove(&self, key: &[u8]) -> Option<HashEntry> {
        let hash = key_hash(key);
        self.shards[self.shard_of(hash)].write().remove(key)
    }

    /// Number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Whether the table holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
