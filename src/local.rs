//! Per-thread operation handles.
//!
//! Every worker thread obtains one [`Local`] from its index and funnels all
//! operations through it: the handle owns the thread's epoch [`Reclaimer`],
//! its CLOCK hand and its CAS backoff state. Operations assume the thread
//! has announced the current epoch; pointers returned by [`Local::find`]
//! remain valid until the thread next enters quiescence.

use core::ptr::NonNull;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::Arc;

use crate::backoff::Backoff;
use crate::ebr::{LocalCtx, Reclaimer};
use crate::item::Item;
use crate::AssocIndex;

/// The bucket `hv` selects in an array of `len` slots (`len` a power of two).
#[inline]
fn bucket_of(hv: u32, len: usize) -> usize {
    hv as usize & (len - 1)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Local
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single thread's handle onto an [`AssocIndex`].
pub struct Local<S = RandomState> {
    index: Arc<AssocIndex<S>>,
    hand: u32,
    recl: Reclaimer,
    backoff: Backoff,
}

/***** impl inherent ******************************************************************************/

impl<S: BuildHasher> Local<S> {
    pub(crate) fn new(index: Arc<AssocIndex<S>>, tid: usize) -> Self {
        let recl = Reclaimer::new(tid, index.config.bag_capacity());
        Self { index, hand: 0, recl, backoff: Backoff::new() }
    }

    /// Returns the thread index this handle occupies.
    #[inline]
    pub fn tid(&self) -> usize {
        self.recl.tid()
    }

    /// Announces the current epoch and leaves quiescence.
    ///
    /// Must be called before a batch of operations, and only while the
    /// thread holds no pointers previously returned by [`Local::find`].
    #[inline]
    pub fn announce(&mut self) {
        let Self { index, recl, .. } = self;
        recl.announce(&index.ebr);
    }

    /// Declares that the thread holds no references into the index.
    #[inline]
    pub fn enter_quiescent(&mut self) {
        let Self { index, recl, .. } = self;
        recl.enter_quiescent(&index.ebr);
    }

    /// Revokes a previous [`Local::enter_quiescent`] without refreshing the
    /// thread's announcement.
    #[inline]
    pub fn leave_quiescent(&self) {
        self.recl.leave_quiescent(&self.index.ebr);
    }

    /// Looks up `key` in the bucket selected by `hv` and bumps that bucket's
    /// CLOCK counter.
    ///
    /// During an expansion the incoming generation is consulted as well. The
    /// returned pointer stays valid until this thread next quiesces.
    pub fn find(&mut self, key: &[u8], hv: u32) -> Option<NonNull<Item>> {
        let (index, mut cx, _) = Self::parts(self);
        let table = &index.table;

        // masks derive from the length of the array actually indexed, so a
        // lookup stays in bounds however it interleaves with the expansion's
        // pointer swaps
        let buckets = table.buckets();
        let bucket = bucket_of(hv, buckets.lists.len());
        let clock = table.clock();
        clock.increment(bucket_of(hv, clock.counters.len()));

        let mut item = buckets.lists[bucket].get(key, &mut cx);
        if item.is_none() && table.is_expanding() {
            if let Some(new_buckets) = table.new_buckets() {
                let bucket = bucket_of(hv, new_buckets.lists.len());
                item = new_buckets.lists[bucket].get(key, &mut cx);
            }
        }

        item
    }

    /// Inserts the record into the bucket selected by `hv`.
    ///
    /// Fails if a live record with an equal key exists, returning the record
    /// to the caller. During an expansion new records flow to the incoming
    /// generation under the doubled mask, without touching CLOCK state.
    pub fn insert(&mut self, item: Box<Item>, hv: u32) -> Result<(), Box<Item>> {
        let node = NonNull::from(Box::leak(item));
        let (index, mut cx, _) = Self::parts(self);
        let table = &index.table;

        let inserted = match table.new_buckets() {
            Some(new_buckets) if table.is_expanding() => {
                let bucket = bucket_of(hv, new_buckets.lists.len());
                new_buckets.lists[bucket].insert(node, &mut cx)
            }
            _ => {
                let buckets = table.buckets();
                let bucket = bucket_of(hv, buckets.lists.len());
                let clock = table.clock();
                clock.increment(bucket_of(hv, clock.counters.len()));
                buckets.lists[bucket].insert(node, &mut cx)
            }
        };

        if inserted {
            table.add_items(cx.recl.tid(), 1);
            index.check_expand();
            Ok(())
        } else {
            Err(unsafe { Box::from_raw(node.as_ptr()) })
        }
    }

    /// Deletes the record with the given `key`.
    ///
    /// Returns whether this call logically deleted a record; the record is
    /// retired to the reclaim callback. During an expansion the incoming
    /// generation is tried as well.
    pub fn delete(&mut self, key: &[u8], hv: u32) -> bool {
        let (index, mut cx, _) = Self::parts(self);
        let table = &index.table;
        let buckets = table.buckets();
        let bucket = bucket_of(hv, buckets.lists.len());

        let mut found = false;
        buckets.lists[bucket].delete(key, true, &mut found, &mut cx);
        if !found && table.is_expanding() {
            if let Some(new_buckets) = table.new_buckets() {
                let bucket = bucket_of(hv, new_buckets.lists.len());
                new_buckets.lists[bucket].delete(key, true, &mut found, &mut cx);
            }
        }

        if found {
            table.add_items(cx.recl.tid(), -1);
        }
        found
    }

    /// Replaces the record keyed like `old` with `new`, retrying until the
    /// new record is visible.
    ///
    /// The superseded record is retired to the reclaim callback.
    pub fn replace(&mut self, old: &Item, new: Box<Item>, hv: u32) -> bool {
        let node = NonNull::from(Box::leak(new));
        let key = old.key();

        loop {
            let (index, mut cx, _) = Self::parts(self);
            let table = &index.table;

            let mut inserted = false;
            match table.new_buckets() {
                Some(new_buckets) if table.is_expanding() => {
                    let bucket = bucket_of(hv, new_buckets.lists.len());
                    new_buckets.lists[bucket].replace(key, node, true, &mut inserted, &mut cx);
                }
                _ => {
                    let buckets = table.buckets();
                    let bucket = bucket_of(hv, buckets.lists.len());
                    let clock = table.clock();
                    clock.increment(bucket_of(hv, clock.counters.len()));
                    buckets.lists[bucket].replace(key, node, true, &mut inserted, &mut cx);
                }
            }

            if inserted {
                return true;
            }
        }
    }

    /// Marks the record's bucket as recently used without touching the list.
    pub fn bump(&mut self, _item: &Item, hv: u32) {
        let clock = self.index.table.clock();
        clock.increment(bucket_of(hv, clock.counters.len()));
    }

    /// Runs the CLOCK hand for at most one full rotation, emptying the first
    /// bucket whose counter had already decayed to zero.
    ///
    /// Returns the number of records evicted. `total_bytes` and `max_age`
    /// are accepted for the slab layer's benefit and do not bound the sweep.
    pub fn try_evict(&mut self, origin_slab_id: usize, _total_bytes: u64, _max_age: u32) -> u64 {
        if origin_slab_id == 0 {
            return 0;
        }

        let (index, mut cx, hand) = Self::parts(self);
        let table = &index.table;
        let clock = table.clock();
        let buckets = table.buckets();
        let num_buckets = buckets.lists.len();
        if clock.counters.len() != num_buckets {
            // caught between the expansion's two generation swaps
            return 0;
        }

        let mut steps = 0;
        while steps < num_buckets {
            steps += 1;
            *hand = hand.wrapping_add(1) % num_buckets as u32;
            let bucket = *hand as usize;

            if clock.decrement(bucket) == 0 {
                let removed = buckets.lists[bucket].empty_all(&mut cx);
                if removed > 0 {
                    table.add_items(cx.recl.tid(), -(removed as i64));
                    return removed as u64;
                }
            }
        }

        0
    }

    /// Returns the aggregate item count.
    #[inline]
    pub fn current_item_count(&self) -> u64 {
        self.index.current_item_count()
    }

    /// Returns the number of records this thread has destroyed.
    #[inline]
    pub fn reclaimed_count(&self) -> u64 {
        self.recl.total_reclaimed()
    }

    /// Returns this thread's successful and failed CAS counts.
    #[inline]
    pub fn cas_stats(&self) -> (u64, u64) {
        self.backoff.stats()
    }

    /// Splits the handle into the index and the context threaded through
    /// list operations.
    fn parts(local: &mut Self) -> (&AssocIndex<S>, LocalCtx<'_>, &mut u32) {
        let Self { index, hand, recl, backoff } = local;
        let index: &AssocIndex<S> = index;
        debug_assert!(!recl.is_quiescent(&index.ebr), "operation on a quiescent thread");
        (index, LocalCtx { ebr: &index.ebr, recl, backoff }, hand)
    }
}

/***** impl Drop **********************************************************************************/

impl<S> Drop for Local<S> {
    /// Drains every pending retirement through the reclamation paths and
    /// leaves the thread slot quiescent.
    ///
    /// Dropping a handle is a teardown action: records retired by this
    /// thread are destroyed immediately, so no other thread may still be
    /// reading them.
    fn drop(&mut self) {
        self.recl.drain_all(&self.index.ebr);
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicUsize;
    use core::sync::atomic::Ordering::Relaxed;
    use std::sync::Arc;

    use crate::item::Item;
    use crate::{AssocIndex, Config, Local};

    fn index_with(power: u32, threads: usize) -> (Arc<AssocIndex>, Arc<AtomicUsize>) {
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&freed);
        let config = Config::builder().hashpower(power).num_threads(threads).build();
        let index = AssocIndex::new(
            config,
            Box::new(move |item| {
                counter.fetch_add(1, Relaxed);
                unsafe { drop(Box::from_raw(item.as_ptr())) };
            }),
        );
        (index, freed)
    }

    fn insert(local: &mut Local, key: &[u8], hv: u32) -> bool {
        local.insert(Item::new(key, b"value"), hv).is_ok()
    }

    #[test]
    fn single_thread_insert_find_delete() {
        let (index, _freed) = index_with(2, 1);
        let mut local = index.local(0);
        local.announce();

        for (hv, key) in [&b"a"[..], b"b", b"c", b"d"].iter().enumerate() {
            assert!(insert(&mut local, key, hv as u32));
        }
        assert_eq!(local.current_item_count(), 4);

        let found = local.find(b"c", 2).expect("inserted key must be found");
        assert_eq!(unsafe { found.as_ref().key() }, b"c");

        assert!(local.delete(b"b", 1));
        assert_eq!(local.current_item_count(), 3);
        assert!(!local.delete(b"b", 1));
        assert!(local.find(b"b", 1).is_none());

        local.enter_quiescent();
    }

    #[test]
    fn colliding_hashes_share_one_ordered_bucket() {
        let (index, _freed) = index_with(2, 1);
        let mut local = index.local(0);
        local.announce();

        // all three hashes map to bucket 0 at power 2
        assert!(insert(&mut local, b"cc", 0));
        assert!(insert(&mut local, b"a", 4));
        assert!(insert(&mut local, b"b", 8));

        let bucket = &index.table.buckets().lists[0];
        assert!(index.table.buckets().lists[1].is_empty());

        let tail = bucket.tail_ptr();
        let mut keys = Vec::new();
        let mut node = bucket.head_ptr();
        loop {
            node = unsafe { crate::item::next_of(node) }.load(Relaxed).unmarked_ptr();
            if node == tail {
                break;
            }
            keys.push(unsafe { crate::item::key_of(node) }.to_vec());
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"cc".to_vec()]);

        local.enter_quiescent();
    }

    #[test]
    fn eviction_decays_and_empties_a_bucket() {
        let (index, _freed) = index_with(2, 1);
        let mut local = index.local(0);
        local.announce();

        for (hv, key) in [&b"a"[..], b"b", b"c", b"d"].iter().enumerate() {
            assert!(insert(&mut local, key, hv as u32));
        }
        let before = local.current_item_count();

        let mut removed = 0;
        for _ in 0..256 {
            removed = local.try_evict(1, 0, 0);
            if removed > 0 {
                break;
            }
        }

        assert!(removed > 0, "a full set of sweeps must evict at least one bucket");
        assert!(local.current_item_count() < before);

        local.enter_quiescent();
    }

    #[test]
    fn duplicate_insert_returns_the_record() {
        let (index, _freed) = index_with(2, 1);
        let mut local = index.local(0);
        local.announce();

        assert!(insert(&mut local, b"key", 0));
        let rejected = local.insert(Item::new(b"key", b"other"), 0).unwrap_err();
        assert_eq!(rejected.value(), b"other");

        local.enter_quiescent();
    }

    #[test]
    fn replace_retires_the_old_record() {
        let (index, freed) = index_with(2, 1);
        {
            let mut local = index.local(0);
            local.announce();

            assert!(insert(&mut local, b"key", 0));
            let old = local.find(b"key", 0).unwrap();
            let replaced = local.replace(unsafe { old.as_ref() }, Item::new(b"key", b"new"), 0);
            assert!(replaced);

            let found = local.find(b"key", 0).unwrap();
            assert_eq!(unsafe { found.as_ref().value() }, b"new");
            assert_eq!(local.current_item_count(), 1);

            local.enter_quiescent();
        }

        // dropping the handle drains the pending retirement of the old record
        assert_eq!(freed.load(Relaxed), 1);
    }
}
