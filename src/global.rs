//! A process-wide index instance with thread-local operation handles.
//!
//! The explicit-handle API of [`AssocIndex`] is the primary interface; this
//! module mirrors it as free functions over a single global instance for
//! servers that initialize the index once at startup. Threads register
//! themselves implicitly: the first operation a thread performs claims the
//! next free worker slot.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::cell::RefCell;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use conquer_once::OnceCell;

use crate::{AssocIndex, Config, Item, Local, ReclaimFn};

static INDEX: OnceCell<Arc<AssocIndex>> = OnceCell::uninit();
static NEXT_TID: AtomicUsize = AtomicUsize::new(0);

thread_local!(static LOCAL: RefCell<Option<Local>> = RefCell::new(None));

/// Initializes the global index; later calls have no effect.
///
/// A `hashpower_init` of zero selects the default power.
pub fn init(hashpower_init: u32, num_threads: usize, reclaim: ReclaimFn) {
    INDEX.init_once(move || {
        AssocIndex::new(Config::with_params(hashpower_init, num_threads), reclaim)
    });
}

#[inline]
fn index() -> &'static Arc<AssocIndex> {
    INDEX.try_get().expect("the global index has not been initialized")
}

fn with_local<R>(f: impl FnOnce(&mut Local) -> R) -> R {
    LOCAL.with(|cell| {
        let mut slot = cell.borrow_mut();
        let local = slot.get_or_insert_with(|| index().local(NEXT_TID.fetch_add(1, Relaxed)));
        f(local)
    })
}

/// Hashes `key` with the global index's hasher.
#[inline]
pub fn hash(key: &[u8]) -> u32 {
    index().hash(key)
}

/// See [`Local::announce`].
pub fn announce() {
    with_local(|local| local.announce());
}

/// See [`Local::enter_quiescent`].
pub fn enter_quiescent() {
    with_local(|local| local.enter_quiescent());
}

/// See [`Local::leave_quiescent`].
pub fn leave_quiescent() {
    with_local(|local| local.leave_quiescent());
}

/// See [`Local::find`].
pub fn find(key: &[u8], hv: u32) -> Option<NonNull<Item>> {
    with_local(|local| local.find(key, hv))
}

/// See [`Local::insert`].
pub fn insert(item: Box<Item>, hv: u32) -> Result<(), Box<Item>> {
    with_local(|local| local.insert(item, hv))
}

/// See [`Local::delete`].
pub fn delete(key: &[u8], hv: u32) -> bool {
    with_local(|local| local.delete(key, hv))
}

/// See [`Local::replace`].
pub fn replace(old: &Item, new: Box<Item>, hv: u32) -> bool {
    with_local(|local| local.replace(old, new, hv))
}

/// See [`Local::bump`].
pub fn bump(item: &Item, hv: u32) {
    with_local(|local| local.bump(item, hv));
}

/// See [`Local::try_evict`].
pub fn try_evict(origin_slab_id: usize, total_bytes: u64, max_age: u32) -> u64 {
    with_local(|local| local.try_evict(origin_slab_id, total_bytes, max_age))
}

/// Returns the aggregate number of live records.
pub fn current_item_count() -> u64 {
    index().current_item_count()
}

/// Signals the maintenance thread if the table has outgrown its buckets.
pub fn check_expand() {
    index().check_expand();
}

/// Spawns the maintenance thread of the global index.
pub fn start_maintenance() -> io::Result<JoinHandle<()>> {
    index().start_maintenance()
}

/// Asks the maintenance thread of the global index to exit.
pub fn stop_maintenance() {
    index().stop_maintenance();
}
