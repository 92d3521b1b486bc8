//! In-memory skip-list nodes

use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::constants::MAX_SKIPLIST_HEIGHT;
use crate::record::DLRecord;

/// An in-memory node holding the tower of forward pointers for one durable
/// record.
///
/// Levels are 1-based: level 1 is the full element chain, higher levels are
/// sparse. The tower is sized to the node's height, drawn when the node is
/// created.
pub struct SkiplistNode {
    record: *const DLRecord,
    height: u8,
    tower: Box<[AtomicPtr<SkiplistNode>]>,
}

// Nodes are shared across rebuild workers; the tower is atomic and `record`
// points into the heap, which outlives every node.
unsafe impl Send for SkiplistNode {}
unsafe impl Sync for SkiplistNode {}

impl SkiplistNode {
    pub(crate) fn alloc(record: &DLRecord, height: u8) -> NonNull<SkiplistNode> {
        debug_assert!(height >= 1 && height as usize <= MAX_SKIPLIST_HEIGHT);
        let tower = (0..height).map(|_| AtomicPtr::new(null_mut())).collect();
        NonNull::from(Box::leak(Box::new(Self {
            record,
            height,
            tower,
        })))
    }

    /// Free a node previously produced by [`new_node_build`] or a header
    /// allocation.
    ///
    /// # Safety
    /// `ptr` must be a live node pointer and must not be reachable from any
    /// tower afterwards.
    pub(crate) unsafe fn dealloc(ptr: *mut SkiplistNode) {
        drop(Box::from_raw(ptr));
    }

    /// The durable record this node indexes
    #[inline]
    pub fn record(&self) -> &DLRecord {
        unsafe { &*self.record }
    }

    /// Tower height of this node
    #[inline]
    pub fn height(&self) -> u8 {
        self.height
    }

    /// Read the forward pointer at `level` (1-based) without ordering
    #[inline]
    pub fn relaxed_next(&self, level: usize) -> *mut SkiplistNode {
        debug_assert!(level >= 1 && level <= self.height as usize);
        self.tower[level - 1].load(Ordering::Relaxed)
    }

    /// Write the forward pointer at `level` (1-based) without ordering.
    ///
    /// Higher-level pointers written this way become visible to other
    /// threads only across a join or lock edge.
    #[inline]
    pub fn relaxed_set_next(&self, level: usize, node: *mut SkiplistNode) {
        debug_assert!(level >= 1 && level <= self.height as usize);
        self.tower[level - 1].store(node, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for SkiplistNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkiplistNode")
            .field("height", &self.height)
            .field("record", &self.record)
            .finish()
    }
}

fn random_height() -> u8 {
    let mut height = 0u8;
    while (height as usize) < MAX_SKIPLIST_HEIGHT && fastrand::u32(..4) == 0 {
        height += 1;
    }
    height
}

/// Build an in-memory node for `record`, or `None` when the height draw
/// says the record gets no node.
///
/// Callers for whom a node is mandatory (recovery-segment starts) retry
/// until the draw succeeds; elsewhere a missing node just means the element
/// is indexed by its durable record.
pub fn new_node_build(record: &DLRecord) -> Option<NonNull<SkiplistNode>> {
    let height = random_height();
    if height == 0 {
        return None;
    }
    Some(SkiplistNode::alloc(record, height))
}
