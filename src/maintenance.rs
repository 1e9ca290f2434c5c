//! The maintenance thread and the incremental resize protocol.
//!
//! Exactly one maintenance thread exists per index. It occupies the thread
//! slot past the workers, is the only mutator of the bucket-array pointers
//! and the `expanding` flag, and idles on a condition variable until
//! [`check_expand`] observes the table outgrowing its buckets. An expansion
//! walks the phases below; the two-epoch drains bracket the migration so
//! that every worker is guaranteed to have observed the overlap window
//! before records start moving, and the swapped-out arrays are guaranteed
//! unreferenced before they are destroyed.

use std::hash::BuildHasher;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, info, warn};

use crate::assoc::{hashmask, hashsize, BucketArray, ClockArray, Table};
use crate::backoff::Backoff;
use crate::ebr::{LocalCtx, Reclaimer};
use crate::item::{key_of, next_of};
use crate::list::List;
use crate::retired::{RawAlloc, Retired};
use crate::AssocIndex;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Maintenance
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The wake-up channel between mutators and the maintenance thread; the only
/// lock in the entire index.
pub(crate) struct Maintenance {
    lock: Mutex<MaintState>,
    cond: Condvar,
}

#[derive(Default)]
struct MaintState {
    expand_requested: bool,
    stop: bool,
}

/***** impl inherent ******************************************************************************/

impl Maintenance {
    #[inline]
    pub fn new() -> Self {
        Self { lock: Mutex::new(MaintState::default()), cond: Condvar::new() }
    }

    /// Asks the maintenance thread to exit once it is idle.
    pub fn request_stop(&self) {
        let mut state = self.lock.lock().unwrap();
        state.stop = true;
        self.cond.notify_all();
    }
}

/// Signals the maintenance thread if the table has outgrown its buckets.
///
/// Called by mutators; uses a try-lock so the data path never blocks.
pub(crate) fn check_expand<S: BuildHasher>(index: &AssocIndex<S>) {
    if let Ok(mut state) = index.maint.lock.try_lock() {
        let power = index.table.hashpower();
        let count = index.table.current_item_count();

        // expand once there are 1.5 times more records than buckets
        if count > (hashsize(power) * 3 / 2) as u64 && power < index.config.max_hashpower() {
            state.expand_requested = true;
            index.maint.cond.notify_one();
        }
    }
}

/// The maintenance thread's main loop.
pub(crate) fn run<S: BuildHasher>(index: Arc<AssocIndex<S>>) {
    let index = &*index;
    let mut recl = Reclaimer::new(index.config.num_threads(), index.config.bag_capacity());
    let mut backoff = Backoff::new();
    recl.enter_quiescent(&index.ebr);

    loop {
        {
            let mut state = index.maint.lock.lock().unwrap();
            while !state.expand_requested && !state.stop {
                state = index.maint.cond.wait(state).unwrap();
            }
            if state.stop {
                break;
            }
            state.expand_requested = false;
        }

        expand(index, &mut recl, &mut backoff);
    }

    recl.drain_all(&index.ebr);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// expansion
////////////////////////////////////////////////////////////////////////////////////////////////////

enum Phase {
    Allocating,
    Announced,
    Migrating,
    Swapping,
    Draining,
}

/// Doubles the table from its current power, or abandons the attempt when
/// the doubled arrays cannot be allocated.
fn expand<S: BuildHasher>(index: &AssocIndex<S>, recl: &mut Reclaimer, backoff: &mut Backoff) {
    let table = &index.table;
    let old_power = table.hashpower();
    if old_power >= index.config.max_hashpower() {
        return;
    }

    let mut phase = Phase::Allocating;
    loop {
        match phase {
            Phase::Allocating => match allocate_generation(table, old_power) {
                Some((buckets, clock)) => {
                    table.install_new_generation(buckets, clock);
                    info!("starting expansion from power {} to {}", old_power, old_power + 1);
                    phase = Phase::Announced;
                }
                None => {
                    warn!("expansion abandoned, could not allocate the doubled arrays");
                    return;
                }
            },
            Phase::Announced => {
                // every worker past this drain has observed the overlap
                // window and routes new inserts to the incoming generation
                drain_epochs(index, recl, 2);
                // stay active with a stale announcement: the epoch cannot
                // advance twice past the migration, so records it traverses
                // cannot be reclaimed under it
                recl.leave_quiescent(&index.ebr);
                phase = Phase::Migrating;
            }
            Phase::Migrating => {
                migrate(index, recl, backoff, old_power);
                phase = Phase::Swapping;
            }
            Phase::Swapping => {
                let (old_buckets, old_clock) = table.swap_generations();
                recl.retire(&index.ebr, Retired::Alloc(RawAlloc::new(old_buckets)));
                recl.retire(&index.ebr, Retired::Alloc(RawAlloc::new(old_clock)));
                phase = Phase::Draining;
            }
            Phase::Draining => {
                // pending readers of the outgoing generation finish here
                drain_epochs(index, recl, 2);
                table.finalize_expansion(old_power + 1);
                info!("expansion to power {} complete", old_power + 1);
                return;
            }
        }
    }
}

/// Allocates the doubled CLOCK and bucket arrays.
///
/// The low half of the new bucket array aliases the current generation's
/// lists; each new high-half bucket starts empty but inherits the CLOCK
/// temperature of the sibling it splits from.
fn allocate_generation(table: &Table, old_power: u32) -> Option<(Box<BucketArray>, Box<ClockArray>)> {
    let old_size = hashsize(old_power);
    let new_size = hashsize(old_power + 1);
    let old_clock = table.clock();
    let old_buckets = table.buckets();

    let mut counters = Vec::new();
    counters.try_reserve_exact(new_size).ok()?;
    for bucket in 0..new_size {
        let temperature =
            if bucket >= old_size { old_clock.get(bucket - old_size) } else { 0 };
        counters.push(AtomicU8::new(temperature));
    }

    let mut lists = Vec::new();
    lists.try_reserve_exact(new_size).ok()?;
    for bucket in 0..new_size {
        if bucket < old_size {
            lists.push(Arc::clone(&old_buckets.lists[bucket]));
        } else {
            lists.push(List::new());
        }
    }

    Some((
        Box::new(BucketArray { lists: lists.into_boxed_slice() }),
        Box::new(ClockArray { counters: counters.into_boxed_slice() }),
    ))
}

/// Moves every record whose doubled-mask bucket differs from its current one
/// into the incoming generation.
fn migrate<S: BuildHasher>(
    index: &AssocIndex<S>,
    recl: &mut Reclaimer,
    backoff: &mut Backoff,
    old_power: u32,
) {
    let table = &index.table;
    let mask = hashmask(old_power + 1);
    let tid = recl.tid();
    let buckets = table.buckets();
    let new_buckets = match table.new_buckets() {
        Some(new_buckets) => new_buckets,
        None => return,
    };

    for bucket in 0..hashsize(old_power) {
        let list = &buckets.lists[bucket];
        let tail = list.tail_ptr();

        let mut node = unsafe { next_of(list.head_ptr()) }.load(SeqCst).unmarked_ptr();
        while node != tail {
            // a successful re-insert rewrites the successor, capture it first
            let next = unsafe { next_of(node) }.load(SeqCst).unmarked_ptr();
            let key = unsafe { key_of(node) };
            let dest = (index.hash(key) & mask) as usize;

            if dest != bucket {
                let mut cx = LocalCtx { ebr: &index.ebr, recl: &mut *recl, backoff: &mut *backoff };
                let mut found = false;
                if let Some(unlinked) = list.delete(key, false, &mut found, &mut cx) {
                    if new_buckets.lists[dest].insert(unlinked, &mut cx) {
                        debug!("moved record from bucket {} to {}", bucket, dest);
                    } else {
                        // a concurrent inserter won the destination bucket;
                        // the unlinked record is unreachable now
                        debug!("record already present in bucket {}, retiring it", dest);
                        unsafe { cx.retire_item(unlinked.as_ptr()) };
                        table.add_items(tid, -1);
                    }
                }
            }

            node = next;
        }
    }
}

/// Cooperates in epoch advancement until the global epoch has moved by
/// `epochs`, sleeping briefly between polls; returns with the thread
/// quiescent.
fn drain_epochs<S: BuildHasher>(index: &AssocIndex<S>, recl: &mut Reclaimer, epochs: u64) {
    let target = index.ebr.current_epoch().value() + epochs;
    while index.ebr.current_epoch().value() < target {
        recl.announce(&index.ebr);
        recl.enter_quiescent(&index.ebr);
        thread::sleep(index.config.maintenance_sleep());
    }
}
