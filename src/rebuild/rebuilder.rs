//! Parallel rebuild of sorted collections after a crash
//!
//! The rebuilder consumes candidate records discovered by the scan pass,
//! classifies collection headers, reconciles multi-version chains against the
//! checkpoint, and reconstructs skip lists and hash entries — either one
//! worker per collection, or with collections partitioned into recovery
//! segments so large lists rebuild in parallel without whole-list locks.

use std::collections::HashMap;
use std::mem;
use std::ptr::{self, null_mut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::allocator::{PmemAllocator, SpaceEntry};
use crate::batch_log::SortedLogEntry;
use crate::checkpoint::Checkpoint;
use crate::comparator::ComparatorRegistry;
use crate::constants::{MAX_SKIPLIST_HEIGHT, RESTORE_SKIPLIST_STRIDE};
use crate::hash_table::{HashTable, IndexPtr, LockTable};
use crate::offset::PmemOffset;
use crate::rebuild::linkage::RecoveryLinkage;
use crate::record::{DLRecord, RecordStatus, RecordType};
use crate::skiplist::{decode_collection_value, new_node_build, Skiplist, SkiplistNode, Splice};
use crate::status::Status;
use crate::thread::{access_thread_id, set_access_thread_id};
use crate::CollectionId;

/// Tuning knobs for a recovery run
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Partition large collections into recovery segments rebuilt in parallel
    pub segment_based_rebuild: bool,
    /// Number of rebuild worker threads (clamped to `max_access_threads`)
    pub num_rebuild_threads: usize,
    /// Spacing (in elements) between candidate segment starts
    pub restore_skiplist_stride: u64,
    /// Maximum number of concurrent access threads of the engine
    pub max_access_threads: usize,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            segment_based_rebuild: true,
            num_rebuild_threads: 8,
            restore_skiplist_stride: RESTORE_SKIPLIST_STRIDE,
            max_access_threads: 64,
        }
    }
}

/// Output of a recovery run
#[derive(Debug, Default)]
pub struct RebuildResult {
    /// First non-Ok status observed, or Ok
    pub s: Status,
    /// Largest collection id seen; seeds future id allocation
    pub max_id: CollectionId,
    /// The live sorted-collection directory
    pub rebuild_skiplists: HashMap<CollectionId, Arc<Skiplist>>,
}

/// A claimed run of a collection's durable chain.
///
/// The start node is always a valid checkpoint-version record; `visited`
/// flips exactly once, under the rebuilder lock.
struct RecoverySegment {
    visited: AtomicBool,
    start_node: *mut SkiplistNode,
}

// Start nodes are shared read-only between workers until exactly one claims
// the segment.
unsafe impl Send for RecoverySegment {}
unsafe impl Sync for RecoverySegment {}

#[derive(Default)]
struct ThreadCache {
    /// Elements seen per collection by this thread during the scan
    visited_skiplists: HashMap<CollectionId, u64>,
    /// Records detached from every chain, pending reclamation
    unlinked_records: Vec<PmemOffset>,
}

/// Collections and segments discovered so far, all behind the one rebuilder
/// mutex.
#[derive(Default)]
struct RebuilderState {
    linked_headers: Vec<PmemOffset>,
    recovery_segments: HashMap<PmemOffset, RecoverySegment>,
    rebuild_skiplists: HashMap<CollectionId, Arc<Skiplist>>,
    invalid_skiplists: HashMap<CollectionId, Arc<Skiplist>>,
}

/// Rebuilds every sorted collection of the engine from its durable records
pub struct SortedRebuilder {
    pmem: Arc<PmemAllocator>,
    hash_table: Arc<HashTable>,
    locks: Arc<LockTable>,
    comparators: Arc<ComparatorRegistry>,
    linkage: RecoveryLinkage,
    checkpoint: Checkpoint,
    segment_based_rebuild: bool,
    num_rebuild_threads: usize,
    restore_skiplist_stride: u64,
    state: Mutex<RebuilderState>,
    thread_cache: Vec<Mutex<ThreadCache>>,
    max_recovered_id: AtomicU64,
    // Worker ids are handed out from here so recovery arenas never collide.
    next_tid: AtomicUsize,
}

impl SortedRebuilder {
    /// Create a rebuilder over the engine's collaborators
    pub fn new(
        pmem: Arc<PmemAllocator>,
        hash_table: Arc<HashTable>,
        locks: Arc<LockTable>,
        comparators: Arc<ComparatorRegistry>,
        options: RecoveryOptions,
        checkpoint: Checkpoint,
    ) -> Self {
        let num_rebuild_threads = options
            .num_rebuild_threads
            .min(options.max_access_threads)
            .max(1);
        Self {
            linkage: RecoveryLinkage::new(pmem.clone()),
            pmem,
            hash_table,
            locks,
            comparators,
            checkpoint,
            segment_based_rebuild: options.segment_based_rebuild,
            num_rebuild_threads,
            restore_skiplist_stride: options.restore_skiplist_stride.max(1),
            state: Mutex::new(RebuilderState::default()),
            thread_cache: (0..num_rebuild_threads)
                .map(|_| Mutex::new(ThreadCache::default()))
                .collect(),
            max_recovered_id: AtomicU64::new(0),
            next_tid: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn recover_to_checkpoint(&self) -> bool {
        self.checkpoint.valid()
    }

    fn add_unlinked_record(&self, offset: PmemOffset) {
        self.thread_cache[access_thread_id() % self.thread_cache.len()]
            .lock()
            .unlinked_records
            .push(offset);
    }

    /// Ingest a collection header discovered by the scan pass.
    ///
    /// Callable concurrently from many scan threads.
    pub fn add_header(&self, header_record: &DLRecord) -> Status {
        debug_assert_eq!(header_record.record_type(), RecordType::SortedHeader);

        if !self.linkage.check_and_repair_linkage(header_record) {
            if !self.recover_to_checkpoint() {
                self.pmem.purge_and_free(header_record);
            } else {
                // This may still be the checkpoint-version ancestor of some
                // live record, so it must survive the chain walks.
                self.add_unlinked_record(self.pmem.addr2offset(header_record));
            }
            return Status::Ok;
        }

        self.state
            .lock()
            .linked_headers
            .push(self.pmem.addr2offset(header_record));
        Status::Ok
    }

    /// Ingest a collection element discovered by the scan pass.
    ///
    /// Callable concurrently from many scan threads. In segment mode, every
    /// `restore_skiplist_stride`-th linked element of a collection that is
    /// its own checkpoint version becomes a recovery-segment start.
    pub fn add_element(&self, record: &DLRecord) -> Status {
        debug_assert_eq!(record.record_type(), RecordType::SortedElem);

        if !self.linkage.check_and_repair_linkage(record) {
            if !self.recover_to_checkpoint() {
                self.pmem.purge_and_free(record);
            } else {
                self.add_unlinked_record(self.pmem.addr2offset(record));
            }
        } else if self.segment_based_rebuild {
            let visited = {
                let mut cache =
                    self.thread_cache[access_thread_id() % self.thread_cache.len()].lock();
                let count = cache
                    .visited_skiplists
                    .entry(Skiplist::fetch_id(record))
                    .or_insert(0);
                *count += 1;
                *count
            };
            if visited % self.restore_skiplist_stride == 0
                && self
                    .find_checkpoint_version(record)
                    .is_some_and(|v| ptr::eq(v, record))
                && record.record_type() == RecordType::SortedElem
            {
                // A segment start always gets a node; retry the draw.
                let start_node = loop {
                    if let Some(node) = new_node_build(record) {
                        break node;
                    }
                };
                self.add_recovery_segment(start_node.as_ptr());
            }
        }
        Status::Ok
    }

    /// Undo one batch-log element before any index is rebuilt.
    ///
    /// A valid prev linkage proves the record's own pointers, so the chain
    /// swap back to the older version (or removal) is safe.
    pub fn rollback(&self, entry: &SortedLogEntry) -> Status {
        let elem = self.pmem.offset2addr_checked(entry.offset);
        if elem.validate() && self.linkage.check_prev_linkage(elem) {
            if !elem.old_version().is_null() {
                let old = self.pmem.offset2addr_checked(elem.old_version());
                let replaced = Skiplist::replace(elem, old, &self.pmem, &self.locks);
                debug_assert!(replaced, "replace must succeed after linkage check");
            } else {
                let removed = Skiplist::remove(elem, &self.pmem, &self.locks);
                debug_assert!(removed, "remove must succeed after linkage check");
            }
        }
        elem.destroy();
        Status::Ok
    }

    /// Rebuild every collection from the ingested records.
    ///
    /// Runs header classification, then the segment- or list-partitioned
    /// index rebuild, then reclamation of everything that did not survive.
    pub fn rebuild(&mut self) -> RebuildResult {
        let mut ret = RebuildResult::default();
        ret.s = self.init_rebuild_lists();
        if ret.s.is_ok() && !self.state.get_mut().rebuild_skiplists.is_empty() {
            ret.s = if self.segment_based_rebuild {
                self.segment_based_index_rebuild()
            } else {
                self.list_based_index_rebuild()
            };
        }
        if ret.s.is_ok() {
            ret.max_id = self.max_recovered_id.load(Ordering::Relaxed);
            ret.rebuild_skiplists = mem::take(&mut self.state.get_mut().rebuild_skiplists);
            self.clean_invalid_records();
        }
        ret
    }

    /// Walk the version chain to the first record at or before the
    /// checkpoint.
    ///
    /// Returns `None` when the chain is exhausted or crosses into another
    /// collection (the slot was reused). Callers hold the hash-table lock
    /// for the record's key while consuming the result.
    fn find_checkpoint_version<'a>(&'a self, record: &'a DLRecord) -> Option<&'a DLRecord> {
        if !self.recover_to_checkpoint() {
            return Some(record);
        }
        let id = Skiplist::fetch_id(record);
        let checkpoint_ts = self.checkpoint.checkpoint_ts();

        let mut curr = record;
        while curr.timestamp() > checkpoint_ts {
            let older = self.pmem.offset2addr(curr.old_version())?;
            if !older.validate() {
                error!(collection = id, "broken checkpoint: invalid older version record");
                return None;
            }
            if Skiplist::fetch_id(older) != id {
                return None;
            }
            curr = older;
        }
        Some(curr)
    }

    /// Classify the ingested headers into collections to rebuild and
    /// collections to destroy.
    fn init_rebuild_lists(&mut self) -> Status {
        let mut headers = mem::take(&mut self.state.get_mut().linked_headers);

        // Keep headers of the same collection adjacent, oldest first, so
        // stale duplicates are recognized.
        headers.sort_by_key(|&offset| {
            let record = self.pmem.offset2addr_checked(offset);
            (Skiplist::fetch_id(record), record.timestamp())
        });

        for i in 0..headers.len() {
            let offset = headers[i];
            let header_record = self.pmem.offset2addr_checked(offset);
            let id = Skiplist::fetch_id(header_record);

            if i + 1 < headers.len()
                && Skiplist::fetch_id(self.pmem.offset2addr_checked(headers[i + 1])) == id
            {
                // A newer header exists: the previous run crashed while
                // updating the header of an empty collection, before breaking
                // the old header's linkage. The old header must still be a
                // self-loop; point it at its successor so it reads as
                // unlinked from here on.
                debug_assert!(
                    header_record.prev() == header_record.next()
                        && header_record.prev() == offset,
                    "stale header with valid linkage must point to itself"
                );
                header_record.persist_prev(headers[i + 1]);
                debug_assert!(
                    !self.linkage.check_prev_linkage(header_record)
                        && !self.linkage.check_next_linkage(header_record)
                );
                self.add_unlinked_record(offset);
                continue;
            }

            let collection_name = header_record.key().to_vec();
            let name = String::from_utf8_lossy(&collection_name).into_owned();
            let (decoded_id, configs) = match decode_collection_value(header_record.value()) {
                Ok(decoded) => decoded,
                Err(s) => {
                    error!(collection = %name, "failed to decode sorted collection value");
                    return s;
                }
            };
            debug_assert_eq!(decoded_id, id);

            let Some(comparator) = self.comparators.get(&configs.comparator_name) else {
                error!(
                    comparator = %configs.comparator_name,
                    collection = %name,
                    "comparator of restoring sorted collection is not registered"
                );
                return Status::InvalidConfiguration;
            };

            self.max_recovered_id.fetch_max(id, Ordering::Relaxed);

            let valid_version = self
                .find_checkpoint_version(header_record)
                .filter(|v| Skiplist::fetch_id(v) == id);
            match valid_version {
                None => {
                    // No live version at the checkpoint, or the version chain
                    // leads into another collection reusing the name. Root an
                    // invalid (hashless) list here so its records can be
                    // destroyed wholesale.
                    let list = Arc::new(Skiplist::new(
                        header_record,
                        name,
                        id,
                        comparator,
                        self.pmem.clone(),
                        self.locks.clone(),
                        false,
                    ));
                    self.state.lock().invalid_skiplists.insert(id, list);
                }
                Some(valid_version) => {
                    let _key_guard = self.hash_table.acquire_lock(&collection_name);

                    if !ptr::eq(valid_version, header_record) {
                        let replaced =
                            Skiplist::replace(header_record, valid_version, &self.pmem, &self.locks);
                        debug_assert!(replaced, "headers in rebuild passed linkage check");
                        self.add_unlinked_record(offset);
                    }

                    let outdated = valid_version.record_status() == RecordStatus::Outdated
                        || valid_version.has_expired();
                    if outdated {
                        let list = Arc::new(Skiplist::new(
                            valid_version,
                            name,
                            id,
                            comparator,
                            self.pmem.clone(),
                            self.locks.clone(),
                            false,
                        ));
                        self.state.lock().invalid_skiplists.insert(id, list);
                    } else {
                        let list = Arc::new(Skiplist::new(
                            valid_version,
                            name,
                            id,
                            comparator,
                            self.pmem.clone(),
                            self.locks.clone(),
                            configs.index_with_hashtable,
                        ));
                        self.state
                            .lock()
                            .rebuild_skiplists
                            .insert(id, list.clone());
                        if self.segment_based_rebuild {
                            // The header is always the first recovery segment
                            // of its collection.
                            self.add_recovery_segment(list.header_node().as_ptr());
                        }

                        valid_version.persist_old_version(PmemOffset::NULL);
                        let s = self
                            .insert_hash_index(&collection_name, IndexPtr::List(Arc::as_ptr(&list)));
                        if !s.is_ok() {
                            error!(collection = %list.name(), "failed to insert skiplist into the hash table during recovery");
                            return s;
                        }
                    }
                }
            }
        }
        Status::Ok
    }

    fn add_recovery_segment(&self, start_node: *mut SkiplistNode) {
        if self.segment_based_rebuild {
            let record_offset = {
                let node = unsafe { &*start_node };
                self.pmem.addr2offset(node.record())
            };
            self.state.lock().recovery_segments.insert(
                record_offset,
                RecoverySegment {
                    visited: AtomicBool::new(false),
                    start_node,
                },
            );
        }
    }

    /// Phase A + Phase B of the segment-partitioned rebuild
    fn segment_based_index_rebuild(&mut self) -> Status {
        info!("segment based rebuild start");
        let segments = mem::take(&mut self.state.get_mut().recovery_segments);
        let rebuild_lists = self.state.get_mut().rebuild_skiplists.clone();
        let this: &Self = self;

        info!(
            segments = segments.len(),
            threads = this.num_rebuild_threads,
            "building segment indexes"
        );
        let failed = AtomicBool::new(false);
        let statuses: Vec<Status> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..this.num_rebuild_threads)
                .map(|_| {
                    scope.spawn(|| this.rebuild_segments_worker(&segments, &rebuild_lists, &failed))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(Status::Abort))
                .collect()
        });
        if let Some(&s) = statuses.iter().find(|s| !s.is_ok()) {
            return s;
        }

        info!(lists = rebuild_lists.len(), "linking tower nodes");
        let lists: Vec<Arc<Skiplist>> = rebuild_lists.values().cloned().collect();
        let cursor = AtomicUsize::new(0);
        let num_workers = this.num_rebuild_threads.min(lists.len()).max(1);
        let statuses: Vec<Status> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..num_workers)
                .map(|_| {
                    scope.spawn(|| {
                        set_access_thread_id(this.next_tid.fetch_add(1, Ordering::AcqRel));
                        loop {
                            let i = cursor.fetch_add(1, Ordering::Relaxed);
                            if i >= lists.len() {
                                break Status::Ok;
                            }
                            let s = this.link_tower_nodes(&lists[i]);
                            if !s.is_ok() {
                                break s;
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(Status::Abort))
                .collect()
        });
        if let Some(&s) = statuses.iter().find(|s| !s.is_ok()) {
            return s;
        }

        info!("segment based rebuild done");
        Status::Ok
    }

    /// One Phase-A worker: claim segments until none are left
    fn rebuild_segments_worker(
        &self,
        segments: &HashMap<PmemOffset, RecoverySegment>,
        rebuild_lists: &HashMap<CollectionId, Arc<Skiplist>>,
        failed: &AtomicBool,
    ) -> Status {
        set_access_thread_id(self.next_tid.fetch_add(1, Ordering::AcqRel));
        for segment in segments.values() {
            if failed.load(Ordering::Relaxed) {
                break;
            }
            // Unlocked read is an optimization; the claim itself happens
            // under the rebuilder lock.
            if segment.visited.load(Ordering::Relaxed) {
                continue;
            }
            {
                let _guard = self.state.lock();
                if segment.visited.load(Ordering::Relaxed) {
                    continue;
                }
                segment.visited.store(true, Ordering::Relaxed);
            }

            let start_node = unsafe { &*segment.start_node };
            let id = Skiplist::fetch_id(start_node.record());
            match rebuild_lists.get(&id) {
                Some(owner) => {
                    let s = self.rebuild_segment_index(segment.start_node, owner, segments);
                    if !s.is_ok() {
                        failed.store(true, Ordering::Relaxed);
                        return s;
                    }
                }
                None => {
                    debug_assert!(
                        self.state.lock().invalid_skiplists.contains_key(&id),
                        "segment start must belong to a known collection"
                    );
                    warn!(collection = id, "skipping recovery segment of an invalid collection");
                    // Nothing will ever link this node; its records are
                    // destroyed wholesale with the invalid list.
                    unsafe { SkiplistNode::dealloc(segment.start_node) };
                }
            }
        }
        Status::Ok
    }

    /// Rebuild the level-1 chain and hash entries of one segment
    fn rebuild_segment_index(
        &self,
        start_node: *mut SkiplistNode,
        owner: &Skiplist,
        segments: &HashMap<PmemOffset, RecoverySegment>,
    ) -> Status {
        let build_hash_index = owner.index_with_hashtable();
        let header_record = owner.header_record();
        let mut num_elems: u64 = 0;

        let start = unsafe { &*start_node };
        let start_record = start.record();
        if !ptr::eq(start_record, header_record) {
            debug_assert_eq!(
                start_record.record_type(),
                RecordType::SortedElem,
                "wrong start node of a recovery segment"
            );
            num_elems += 1;
            if build_hash_index {
                let s = self.insert_hash_index(start_record.key(), IndexPtr::Node(start_node));
                if !s.is_ok() {
                    return s;
                }
            }
        }
        debug_assert!(
            self.find_checkpoint_version(start_record)
                .is_some_and(|v| ptr::eq(v, start_record)),
            "segment start must be its own checkpoint version"
        );
        start_record.persist_old_version(PmemOffset::NULL);

        let mut cur_node = start_node;
        let mut cur_record = start_record;
        loop {
            let next_offset = cur_record.next();
            let next_record = self.pmem.offset2addr_checked(next_offset);
            if ptr::eq(next_record, header_record) {
                unsafe { (*cur_node).relaxed_set_next(1, null_mut()) };
                break;
            }

            if let Some(adjacent) = segments.get(&next_offset) {
                // Segment boundary: the higher-addressed side is linked by
                // exactly this store.
                let adjacent_start = unsafe { &*adjacent.start_node };
                if adjacent_start.record().record_type() == RecordType::SortedElem {
                    unsafe { (*cur_node).relaxed_set_next(1, adjacent.start_node) };
                } else {
                    unsafe { (*cur_node).relaxed_set_next(1, null_mut()) };
                }
                break;
            }

            let internal_key = next_record.key();
            let _key_guard = self.hash_table.acquire_lock(internal_key);
            match self.find_checkpoint_version(next_record) {
                Some(valid_version) if valid_version.record_status() != RecordStatus::Outdated => {
                    if !ptr::eq(valid_version, next_record) {
                        let replaced =
                            Skiplist::replace(next_record, valid_version, &self.pmem, &self.locks);
                        debug_assert!(replaced, "elements in rebuild passed linkage check");
                        self.add_unlinked_record(next_offset);
                    }
                    num_elems += 1;

                    let dram_node = new_node_build(valid_version);
                    if let Some(node) = dram_node {
                        unsafe {
                            (*cur_node).relaxed_set_next(1, node.as_ptr());
                            node.as_ref().relaxed_set_next(1, null_mut());
                        }
                        cur_node = node.as_ptr();
                    }

                    if build_hash_index {
                        let s = match dram_node {
                            Some(node) => {
                                self.insert_hash_index(internal_key, IndexPtr::Node(node.as_ptr()))
                            }
                            None => self.insert_hash_index(
                                internal_key,
                                IndexPtr::Record(valid_version as *const DLRecord),
                            ),
                        };
                        if !s.is_ok() {
                            return s;
                        }
                    }
                    valid_version.persist_old_version(PmemOffset::NULL);
                    cur_record = valid_version;
                }
                _ => {
                    // Absent or logically deleted at the checkpoint: purge
                    // from the chain, reclaim later.
                    let removed = Skiplist::remove(next_record, &self.pmem, &self.locks);
                    debug_assert!(removed, "elements in rebuild passed linkage check");
                    self.add_unlinked_record(next_offset);
                }
            }
        }
        owner.update_size(num_elems);
        Status::Ok
    }

    /// Phase B: stitch tower levels 2+ over the fully-linked level-1 chain
    fn link_tower_nodes(&self, list: &Skiplist) -> Status {
        let mut splice = Splice::new(list);
        let mut next = unsafe { (*splice.prevs[1]).relaxed_next(1) };
        while !next.is_null() {
            let node = unsafe { &*next };
            splice.prevs[1] = next;
            for level in 2..=node.height() as usize {
                unsafe { (*splice.prevs[level]).relaxed_set_next(level, next) };
                splice.prevs[level] = next;
            }
            next = node.relaxed_next(1);
        }
        for level in 1..=MAX_SKIPLIST_HEIGHT {
            unsafe { (*splice.prevs[level]).relaxed_set_next(level, null_mut()) };
        }
        Status::Ok
    }

    /// One worker per collection, splicing every tower level during a single
    /// serial walk
    fn list_based_index_rebuild(&mut self) -> Status {
        info!("list based rebuild start");
        let lists: Vec<Arc<Skiplist>> = self
            .state
            .get_mut()
            .rebuild_skiplists
            .values()
            .cloned()
            .collect();
        let this: &Self = self;

        let cursor = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let num_workers = this.num_rebuild_threads.min(lists.len()).max(1);
        let statuses: Vec<Status> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..num_workers)
                .map(|_| {
                    scope.spawn(|| {
                        set_access_thread_id(this.next_tid.fetch_add(1, Ordering::AcqRel));
                        loop {
                            if failed.load(Ordering::Relaxed) {
                                break Status::Ok;
                            }
                            let i = cursor.fetch_add(1, Ordering::Relaxed);
                            if i >= lists.len() {
                                break Status::Ok;
                            }
                            let s = this.rebuild_skiplist_index(&lists[i]);
                            if !s.is_ok() {
                                failed.store(true, Ordering::Relaxed);
                                break s;
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(Status::Abort))
                .collect()
        });
        let s = statuses
            .into_iter()
            .find(|s| !s.is_ok())
            .unwrap_or(Status::Ok);
        if s.is_ok() {
            info!("list based rebuild done");
        }
        s
    }

    /// Serial whole-list rebuild: version resolution, node allocation, hash
    /// insertion, and tower splicing in one walk
    fn rebuild_skiplist_index(&self, list: &Skiplist) -> Status {
        let build_hash_index = list.index_with_hashtable();
        let header_record = list.header_record();
        let mut num_elems: u64 = 0;
        let mut splice = Splice::new(list);

        loop {
            let prev_record = self.pmem.offset2addr_checked(splice.prev_pmem_record);
            let next_offset = prev_record.next();
            let next_record = self.pmem.offset2addr_checked(next_offset);
            if ptr::eq(next_record, header_record) {
                break;
            }

            let internal_key = next_record.key();
            let _key_guard = self.hash_table.acquire_lock(internal_key);
            match self.find_checkpoint_version(next_record) {
                Some(valid_version) if valid_version.record_status() != RecordStatus::Outdated => {
                    if !ptr::eq(valid_version, next_record) {
                        let replaced =
                            Skiplist::replace(next_record, valid_version, &self.pmem, &self.locks);
                        debug_assert!(replaced, "elements in rebuild passed linkage check");
                        self.add_unlinked_record(next_offset);
                    }
                    num_elems += 1;

                    let dram_node = new_node_build(valid_version);
                    if let Some(node) = dram_node {
                        let node_ref = unsafe { node.as_ref() };
                        for level in 1..=node_ref.height() as usize {
                            unsafe {
                                (*splice.prevs[level]).relaxed_set_next(level, node.as_ptr())
                            };
                            node_ref.relaxed_set_next(level, null_mut());
                            splice.prevs[level] = node.as_ptr();
                        }
                    }

                    if build_hash_index {
                        let s = match dram_node {
                            Some(node) => {
                                self.insert_hash_index(internal_key, IndexPtr::Node(node.as_ptr()))
                            }
                            None => self.insert_hash_index(
                                internal_key,
                                IndexPtr::Record(valid_version as *const DLRecord),
                            ),
                        };
                        if !s.is_ok() {
                            return s;
                        }
                    }
                    valid_version.persist_old_version(PmemOffset::NULL);
                    splice.prev_pmem_record = self.pmem.addr2offset(valid_version);
                }
                _ => {
                    let removed = Skiplist::remove(next_record, &self.pmem, &self.locks);
                    debug_assert!(removed, "elements in rebuild passed linkage check");
                    self.add_unlinked_record(next_offset);
                }
            }
        }
        list.update_size(num_elems);
        Status::Ok
    }

    /// Reclaim unlinked records and destroy invalid collections
    fn clean_invalid_records(&mut self) {
        for cache in &self.thread_cache {
            let mut cache = cache.lock();
            let mut to_free: Vec<SpaceEntry> = Vec::new();
            for offset in cache.unlinked_records.drain(..) {
                let record = self.pmem.offset2addr_checked(offset);
                // A record that is still sorted-typed with valid linkage was
                // reinserted through another path; leave it alone.
                if !record.record_type().is_sorted() || !self.linkage.check_linkage(record) {
                    let size = record.record_size();
                    record.destroy();
                    to_free.push(SpaceEntry { offset, size });
                }
            }
            self.pmem.batch_free(to_free);
            cache.visited_skiplists.clear();
        }

        let invalid = mem::take(&mut self.state.get_mut().invalid_skiplists);
        for list in invalid.into_values() {
            list.destroy();
        }
    }

    /// Insert a hash entry for a rebuilt object.
    ///
    /// A slot that already holds a value is a rebuild-integrity violation:
    /// sorted entries cannot exist in the table before their rebuild.
    fn insert_hash_index(&self, key: &[u8], ptr: IndexPtr) -> Status {
        let (record_type, record_status) = match ptr {
            IndexPtr::Record(record) => {
                let record = unsafe { &*record };
                debug_assert_eq!(record.record_type(), RecordType::SortedElem);
                (RecordType::SortedElem, record.record_status())
            }
            IndexPtr::Node(node) => {
                let record = unsafe { &*node }.record();
                debug_assert_eq!(record.record_type(), RecordType::SortedElem);
                (RecordType::SortedElem, record.record_status())
            }
            IndexPtr::List(list) => {
                let record = unsafe { &*list }.header_record();
                debug_assert_eq!(record.record_type(), RecordType::SortedHeader);
                (RecordType::SortedHeader, record.record_status())
            }
        };

        let result = self.hash_table.insert(key, record_type, record_status, ptr);
        match result.s {
            Status::NotFound => Status::Ok,
            Status::Ok => {
                error!("hash entry of a sorted record existed before its rebuild");
                Status::Abort
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordSpec, PERSIST_TIME};
    use crate::skiplist::{encode_collection_value, encode_internal_key, SortedCollectionConfigs};

    struct Env {
        pmem: Arc<PmemAllocator>,
        hash_table: Arc<HashTable>,
        locks: Arc<LockTable>,
        comparators: Arc<ComparatorRegistry>,
    }

    impl Env {
        fn new() -> Self {
            Self {
                pmem: Arc::new(PmemAllocator::new(1 << 20)),
                hash_table: Arc::new(HashTable::new(64)),
                locks: Arc::new(LockTable::new(256)),
                comparators: Arc::new(ComparatorRegistry::new()),
            }
        }

        fn rebuilder(&self, checkpoint: Checkpoint, segment_based: bool) -> SortedRebuilder {
            SortedRebuilder::new(
                self.pmem.clone(),
                self.hash_table.clone(),
                self.locks.clone(),
                self.comparators.clone(),
                RecoveryOptions {
                    segment_based_rebuild: segment_based,
                    num_rebuild_threads: 2,
                    restore_skiplist_stride: 2,
                    max_access_threads: 8,
                },
                checkpoint,
            )
        }

        fn write(&self, spec: &RecordSpec<'_>) -> PmemOffset {
            let offset = self
                .pmem
                .allocate(DLRecord::record_size_for(spec.key.len(), spec.value.len()))
                .unwrap();
            self.pmem.write_record(offset, spec);
            offset
        }

        fn reserve(&self, key_len: usize, value_len: usize) -> PmemOffset {
            self.pmem
                .allocate(DLRecord::record_size_for(key_len, value_len))
                .unwrap()
        }
    }

    fn header_spec<'a>(
        key: &'a [u8],
        value: &'a [u8],
        timestamp: u64,
        prev: PmemOffset,
        next: PmemOffset,
        old_version: PmemOffset,
    ) -> RecordSpec<'a> {
        RecordSpec {
            record_type: RecordType::SortedHeader,
            record_status: RecordStatus::Normal,
            timestamp,
            expire_time: PERSIST_TIME,
            prev,
            next,
            old_version,
            key,
            value,
        }
    }

    #[test]
    fn test_find_checkpoint_version_no_checkpoint() {
        let env = Env::new();
        let rebuilder = env.rebuilder(Checkpoint::none(), false);

        let key = encode_internal_key(1, b"k");
        let offset = env.write(&RecordSpec {
            record_type: RecordType::SortedElem,
            record_status: RecordStatus::Normal,
            timestamp: 100,
            expire_time: PERSIST_TIME,
            prev: PmemOffset::NULL,
            next: PmemOffset::NULL,
            old_version: PmemOffset::NULL,
            key: &key,
            value: b"v",
        });
        let record = env.pmem.offset2addr_checked(offset);
        let found = rebuilder.find_checkpoint_version(record).unwrap();
        assert!(ptr::eq(found, record));
    }

    #[test]
    fn test_find_checkpoint_version_walks_chain() {
        let env = Env::new();
        let rebuilder = env.rebuilder(Checkpoint::new(15), false);

        let key = encode_internal_key(1, b"k");
        let v10 = env.write(&RecordSpec {
            record_type: RecordType::SortedElem,
            record_status: RecordStatus::Normal,
            timestamp: 10,
            expire_time: PERSIST_TIME,
            prev: PmemOffset::NULL,
            next: PmemOffset::NULL,
            old_version: PmemOffset::NULL,
            key: &key,
            value: b"old",
        });
        let v20 = env.write(&RecordSpec {
            record_type: RecordType::SortedElem,
            record_status: RecordStatus::Normal,
            timestamp: 20,
            expire_time: PERSIST_TIME,
            prev: PmemOffset::NULL,
            next: PmemOffset::NULL,
            old_version: v10,
            key: &key,
            value: b"new",
        });

        let newest = env.pmem.offset2addr_checked(v20);
        let found = rebuilder.find_checkpoint_version(newest).unwrap();
        assert_eq!(env.pmem.addr2offset(found), v10);
        assert_eq!(found.value(), b"old");
    }

    #[test]
    fn test_find_checkpoint_version_exhausted_chain() {
        let env = Env::new();
        let rebuilder = env.rebuilder(Checkpoint::new(5), false);

        let key = encode_internal_key(1, b"k");
        let offset = env.write(&RecordSpec {
            record_type: RecordType::SortedElem,
            record_status: RecordStatus::Normal,
            timestamp: 20,
            expire_time: PERSIST_TIME,
            prev: PmemOffset::NULL,
            next: PmemOffset::NULL,
            old_version: PmemOffset::NULL,
            key: &key,
            value: b"v",
        });
        let record = env.pmem.offset2addr_checked(offset);
        assert!(rebuilder.find_checkpoint_version(record).is_none());
    }

    #[test]
    fn test_find_checkpoint_version_id_reuse() {
        let env = Env::new();
        let rebuilder = env.rebuilder(Checkpoint::new(15), false);

        // Older version belongs to another collection: the slot was reused.
        let other_key = encode_internal_key(9, b"k");
        let old = env.write(&RecordSpec {
            record_type: RecordType::SortedElem,
            record_status: RecordStatus::Normal,
            timestamp: 10,
            expire_time: PERSIST_TIME,
            prev: PmemOffset::NULL,
            next: PmemOffset::NULL,
            old_version: PmemOffset::NULL,
            key: &other_key,
            value: b"other",
        });
        let key = encode_internal_key(1, b"k");
        let new = env.write(&RecordSpec {
            record_type: RecordType::SortedElem,
            record_status: RecordStatus::Normal,
            timestamp: 20,
            expire_time: PERSIST_TIME,
            prev: PmemOffset::NULL,
            next: PmemOffset::NULL,
            old_version: old,
            key: &key,
            value: b"v",
        });
        let record = env.pmem.offset2addr_checked(new);
        assert!(rebuilder.find_checkpoint_version(record).is_none());
    }

    #[test]
    fn test_stale_empty_header_is_purged() {
        let env = Env::new();
        let mut rebuilder = env.rebuilder(Checkpoint::none(), false);

        let value = encode_collection_value(3, &SortedCollectionConfigs::default());
        let old_off = env.reserve(4, value.len());
        let new_off = env.reserve(4, value.len());
        env.pmem
            .write_record(old_off, &header_spec(b"list", &value, 4, old_off, old_off, PmemOffset::NULL));
        env.pmem
            .write_record(new_off, &header_spec(b"list", &value, 9, new_off, new_off, PmemOffset::NULL));

        assert_eq!(
            rebuilder.add_header(env.pmem.offset2addr_checked(old_off)),
            Status::Ok
        );
        assert_eq!(
            rebuilder.add_header(env.pmem.offset2addr_checked(new_off)),
            Status::Ok
        );

        let result = rebuilder.rebuild();
        assert_eq!(result.s, Status::Ok);
        assert_eq!(result.max_id, 3);
        assert_eq!(result.rebuild_skiplists.len(), 1);
        let list = &result.rebuild_skiplists[&3];
        assert_eq!(env.pmem.addr2offset(list.header_record()), new_off);
        assert!(list.is_empty());

        // The stale header was detached and reclaimed.
        let old = env.pmem.offset2addr_checked(old_off);
        assert_eq!(old.record_type(), RecordType::Empty);
        // The surviving one is in the hash table.
        assert!(env.hash_table.lookup(b"list").is_some());
    }

    #[test]
    fn test_missing_comparator_fails_recovery() {
        let env = Env::new();
        let mut rebuilder = env.rebuilder(Checkpoint::none(), false);

        let value = encode_collection_value(
            1,
            &SortedCollectionConfigs {
                comparator_name: "unregistered".to_string(),
                index_with_hashtable: true,
            },
        );
        let offset = env.reserve(4, value.len());
        env.pmem
            .write_record(offset, &header_spec(b"list", &value, 1, offset, offset, PmemOffset::NULL));

        rebuilder.add_header(env.pmem.offset2addr_checked(offset));
        let result = rebuilder.rebuild();
        assert_eq!(result.s, Status::InvalidConfiguration);
    }

    #[test]
    fn test_unlinked_header_purged_without_checkpoint() {
        let env = Env::new();
        let rebuilder = env.rebuilder(Checkpoint::none(), false);

        let value = encode_collection_value(1, &SortedCollectionConfigs::default());
        let offset = env.reserve(4, value.len());
        // Never linked: both pointers still null.
        env.pmem.write_record(
            offset,
            &header_spec(b"list", &value, 1, PmemOffset::NULL, PmemOffset::NULL, PmemOffset::NULL),
        );

        rebuilder.add_header(env.pmem.offset2addr_checked(offset));
        assert_eq!(
            env.pmem.offset2addr_checked(offset).record_type(),
            RecordType::Empty
        );
    }
}
