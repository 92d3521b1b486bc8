//! Access-thread identity service
//!
//! Every thread touching the persistent heap carries a small integer id used
//! to pick its allocator arena and rebuilder cache slot. Ids are allocated
//! from a global counter, recycled when a thread exits, and can be pinned
//! explicitly by recovery workers that hand out ids from their own counter.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::constants::MAX_ACCESS_THREADS;

/// Global counter for allocating access-thread ids
static NEXT_ACCESS_ID: AtomicUsize = AtomicUsize::new(0);

/// Recycled ids (returned when threads exit)
static FREE_ACCESS_IDS: OnceLock<Mutex<Vec<usize>>> = OnceLock::new();

fn free_access_ids() -> &'static Mutex<Vec<usize>> {
    FREE_ACCESS_IDS.get_or_init(|| Mutex::new(Vec::new()))
}

#[derive(Debug)]
struct AccessIdGuard {
    id: usize,
    // Pinned ids come from an external counter and are not recycled.
    pinned: bool,
}

impl Drop for AccessIdGuard {
    fn drop(&mut self) {
        if !self.pinned {
            free_access_ids().lock().push(self.id);
        }
    }
}

thread_local! {
    static ACCESS_ID: RefCell<Option<AccessIdGuard>> = const { RefCell::new(None) };
}

fn allocate_access_id() -> usize {
    if let Some(id) = free_access_ids().lock().pop() {
        return id;
    }
    NEXT_ACCESS_ID.fetch_add(1, Ordering::AcqRel) % MAX_ACCESS_THREADS
}

/// Get the calling thread's access id, registering the thread on first use
pub fn access_thread_id() -> usize {
    ACCESS_ID.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(guard) = slot.as_ref() {
            return guard.id;
        }
        let id = allocate_access_id();
        *slot = Some(AccessIdGuard { id, pinned: false });
        id
    })
}

/// Pin the calling thread's access id to an externally-assigned value.
///
/// Recovery workers use this with ids drawn from the rebuilder's own counter
/// so that worker arenas and caches never collide during a rebuild.
pub fn set_access_thread_id(id: usize) {
    ACCESS_ID.with(|slot| {
        *slot.borrow_mut() = Some(AccessIdGuard { id, pinned: true });
    });
}
