//! Shared helpers for recovery tests: collaborators plus a synthetic heap
//! builder.

use std::sync::Arc;

use oxipmem::batch_log::SortedLogEntry;
use oxipmem::checkpoint::Checkpoint;
use oxipmem::comparator::ComparatorRegistry;
use oxipmem::hash_table::{HashTable, LockTable};
use oxipmem::prelude::*;
use oxipmem::record::{RecordSpec, PERSIST_TIME};
use oxipmem::skiplist::{
    encode_collection_value, encode_internal_key, extract_user_key, SortedCollectionConfigs,
};
use oxipmem::CollectionId;

/// The engine collaborators a rebuilder runs against
pub struct RecoveryEnv {
    pub pmem: Arc<PmemAllocator>,
    pub hash_table: Arc<HashTable>,
    pub locks: Arc<LockTable>,
    pub comparators: Arc<ComparatorRegistry>,
}

impl RecoveryEnv {
    pub fn new() -> Self {
        Self {
            pmem: Arc::new(PmemAllocator::new(1 << 22)),
            hash_table: Arc::new(HashTable::new(64)),
            locks: Arc::new(LockTable::new(512)),
            comparators: Arc::new(ComparatorRegistry::new()),
        }
    }

    /// Same heap and locks, empty hash index: the state a second recovery
    /// run starts from
    pub fn with_fresh_index(&self) -> Self {
        Self {
            pmem: self.pmem.clone(),
            hash_table: Arc::new(HashTable::new(64)),
            locks: self.locks.clone(),
            comparators: self.comparators.clone(),
        }
    }

    pub fn rebuilder(&self, checkpoint: Checkpoint, options: RecoveryOptions) -> SortedRebuilder {
        SortedRebuilder::new(
            self.pmem.clone(),
            self.hash_table.clone(),
            self.locks.clone(),
            self.comparators.clone(),
            options,
            checkpoint,
        )
    }

    pub fn record(&self, offset: PmemOffset) -> &DLRecord {
        self.pmem.offset2addr_checked(offset)
    }
}

/// Options for a small parallel run with segment starts every 4 elements
pub fn segment_options() -> RecoveryOptions {
    RecoveryOptions {
        segment_based_rebuild: true,
        num_rebuild_threads: 4,
        restore_skiplist_stride: 4,
        max_access_threads: 16,
    }
}

pub fn list_options() -> RecoveryOptions {
    RecoveryOptions {
        segment_based_rebuild: false,
        num_rebuild_threads: 4,
        restore_skiplist_stride: 4,
        max_access_threads: 16,
    }
}

/// One element of a synthetic collection
#[derive(Clone)]
pub struct ElemInit {
    pub user_key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: u64,
    pub status: RecordStatus,
    pub old_version: PmemOffset,
}

pub fn elem(user_key: &str, value: &str, timestamp: u64) -> ElemInit {
    ElemInit {
        user_key: user_key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        timestamp,
        status: RecordStatus::Normal,
        old_version: PmemOffset::NULL,
    }
}

impl ElemInit {
    pub fn outdated(mut self) -> Self {
        self.status = RecordStatus::Outdated;
        self
    }

    pub fn old_version(mut self, offset: PmemOffset) -> Self {
        self.old_version = offset;
        self
    }
}

/// A fully-linked synthetic collection on the heap
pub struct BuiltList {
    pub header: PmemOffset,
    pub elems: Vec<PmemOffset>,
}

/// Write a header and its elements as a circular doubly-linked chain
pub fn build_list(
    env: &RecoveryEnv,
    id: CollectionId,
    name: &str,
    header_ts: u64,
    configs: &SortedCollectionConfigs,
    elems: &[ElemInit],
) -> BuiltList {
    let header_value = encode_collection_value(id, configs);
    let header = env
        .pmem
        .allocate(DLRecord::record_size_for(name.len(), header_value.len()))
        .unwrap();

    let keys: Vec<Vec<u8>> = elems
        .iter()
        .map(|e| encode_internal_key(id, &e.user_key))
        .collect();
    let offsets: Vec<PmemOffset> = elems
        .iter()
        .zip(&keys)
        .map(|(e, key)| {
            env.pmem
                .allocate(DLRecord::record_size_for(key.len(), e.value.len()))
                .unwrap()
        })
        .collect();

    let first = offsets.first().copied().unwrap_or(header);
    let last = offsets.last().copied().unwrap_or(header);

    env.pmem.write_record(
        header,
        &RecordSpec {
            record_type: RecordType::SortedHeader,
            record_status: RecordStatus::Normal,
            timestamp: header_ts,
            expire_time: PERSIST_TIME,
            prev: last,
            next: first,
            old_version: PmemOffset::NULL,
            key: name.as_bytes(),
            value: &header_value,
        },
    );

    for (i, e) in elems.iter().enumerate() {
        let prev = if i == 0 { header } else { offsets[i - 1] };
        let next = if i + 1 == elems.len() {
            header
        } else {
            offsets[i + 1]
        };
        env.pmem.write_record(
            offsets[i],
            &RecordSpec {
                record_type: RecordType::SortedElem,
                record_status: e.status,
                timestamp: e.timestamp,
                expire_time: PERSIST_TIME,
                prev,
                next,
                old_version: e.old_version,
                key: &keys[i],
                value: &e.value,
            },
        );
    }

    BuiltList {
        header,
        elems: offsets,
    }
}

/// An unlinked record standing in for an older version (or crash debris)
pub fn write_orphan(
    env: &RecoveryEnv,
    id: CollectionId,
    user_key: &str,
    value: &str,
    timestamp: u64,
) -> PmemOffset {
    let key = encode_internal_key(id, user_key.as_bytes());
    let offset = env
        .pmem
        .allocate(DLRecord::record_size_for(key.len(), value.len()))
        .unwrap();
    env.pmem.write_record(
        offset,
        &RecordSpec {
            record_type: RecordType::SortedElem,
            record_status: RecordStatus::Normal,
            timestamp,
            expire_time: PERSIST_TIME,
            prev: PmemOffset::NULL,
            next: PmemOffset::NULL,
            old_version: PmemOffset::NULL,
            key: &key,
            value: value.as_bytes(),
        },
    );
    offset
}

/// Feed a built collection through the scan-phase entry points
pub fn ingest(env: &RecoveryEnv, rebuilder: &SortedRebuilder, list: &BuiltList) {
    assert_eq!(rebuilder.add_header(env.record(list.header)), Status::Ok);
    for &offset in &list.elems {
        assert_eq!(rebuilder.add_element(env.record(offset)), Status::Ok);
    }
}

/// User keys along a rebuilt list's durable chain
pub fn chain_user_keys(list: &Skiplist) -> Vec<Vec<u8>> {
    list.chain_records()
        .map(|record| extract_user_key(record.key()).to_vec())
        .collect()
}

/// Walk the chain checking both link directions and the element count
pub fn assert_chain_integrity(env: &RecoveryEnv, list: &Skiplist) {
    let header_offset = env.pmem.addr2offset(list.header_record());
    let mut prev_offset = header_offset;
    let mut steps = 0u64;
    let mut cursor = list.header_record().next();
    while cursor != header_offset {
        let record = env.record(cursor);
        assert_eq!(record.prev(), prev_offset, "prev pointer must match walk");
        assert!(record.old_version().is_null(), "chain records must be canonical");
        prev_offset = cursor;
        cursor = record.next();
        steps += 1;
        assert!(steps <= 1_000_000, "chain does not terminate");
    }
    assert_eq!(env.record(header_offset).prev(), prev_offset);
    assert_eq!(steps, list.len(), "walk length must equal the list size");
}

/// Every tower level must be an ordered subsequence of the level below
pub fn assert_tower_monotonic(list: &Skiplist) {
    let mut below: Vec<Vec<u8>> = list
        .nodes_at_level(1)
        .into_iter()
        .map(|record| record.key().to_vec())
        .collect();
    for level in 2..=oxipmem::constants::MAX_SKIPLIST_HEIGHT {
        let here: Vec<Vec<u8>> = list
            .nodes_at_level(level)
            .into_iter()
            .map(|record| record.key().to_vec())
            .collect();
        assert!(
            is_subsequence(&here, &below),
            "level {level} must be a subsequence of level {}",
            level - 1
        );
        below = here;
    }
}

fn is_subsequence(needle: &[Vec<u8>], haystack: &[Vec<u8>]) -> bool {
    let mut it = haystack.iter();
    needle.iter().all(|n| it.any(|h| h == n))
}

/// Convenience wrapper for rollback entries
pub fn rollback_entry(offset: PmemOffset) -> SortedLogEntry {
    SortedLogEntry::new(offset)
}
