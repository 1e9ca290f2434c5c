//! A lock-free singly-linked list of item records, strictly ordered by
//! `(key length, key bytes)` and bounded by head and tail sentinels.
//!
//! Deletion is split into a logical phase (setting the [`DELETED`] bit on the
//! victim's successor word) and a physical phase (swinging the predecessor's
//! successor past the victim). Any traversal that encounters a run of
//! logically deleted nodes splices the whole run out with a single CAS and
//! retires the unlinked nodes through the epoch reclaimer. Replacement comes
//! in two build-time flavours: posterior insertion (the default) links the
//! new record directly behind the live old one and then deletes the old one
//! by reference, while the `replace-mark` protocol advertises the exchange
//! through the [`REPLACING`] bit and recovers from crashed replacers with a
//! bounded retry count.

use core::cmp::Ordering::{Equal, Less};
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{Acquire, Relaxed};
use std::sync::Arc;

use crate::ebr::LocalCtx;
use crate::item::{key_cmp, key_of, next_of, Item, Sentinel};
use crate::marked::{MarkedPtr, TAG_MASK};

/// Successor-word bit advertising that the owning node is logically deleted.
pub(crate) const DELETED: usize = 0b01;
/// Successor-word bit advertising that the owning node is mid-replacement.
pub(crate) const REPLACING: usize = 0b10;

/// Traversal retries tolerated on a replacement-marked node before the
/// replacing thread is presumed dead and its victim force-deleted.
const MAX_REPLACE_RETRIES: usize = 5000;

////////////////////////////////////////////////////////////////////////////////////////////////////
// List
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free ordered list of externally allocated item records.
///
/// Lists always live behind an [`Arc`]: sentinel addresses must stay stable
/// and, across a table expansion, the surviving low-half buckets are shared
/// between the outgoing and incoming bucket arrays.
pub(crate) struct List {
    head: Sentinel,
    tail: Sentinel,
}

/***** impl inherent ******************************************************************************/

impl List {
    /// Creates a new empty list.
    pub fn new() -> Arc<Self> {
        let list = Arc::new(Self { head: Sentinel::new(), tail: Sentinel::new() });
        list.head.next().store(MarkedPtr::new(list.tail_ptr()), Relaxed);
        list
    }

    #[inline]
    pub fn head_ptr(&self) -> *mut Item {
        &self.head as *const Sentinel as *mut Item
    }

    #[inline]
    pub fn tail_ptr(&self) -> *mut Item {
        &self.tail as *const Sentinel as *mut Item
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.next().load(Acquire) == MarkedPtr::new(self.tail_ptr())
    }

    /// Finds the first live node with a key not less than `key`.
    ///
    /// On return, `*left` is the last node before the returned one whose
    /// successor word was observed unmarked; runs of logically deleted nodes
    /// encountered on the way are spliced out and retired. With
    /// `ignore_replacement` the [`REPLACING`] bit is treated as ordinary and
    /// the crash-recovery path is disabled.
    pub fn search(
        &self,
        key: &[u8],
        left: &mut *mut Item,
        ignore_replacement: bool,
        cx: &mut LocalCtx<'_>,
    ) -> *mut Item {
        let tail = self.tail_ptr();
        let mut right: *mut Item = ptr::null_mut();
        let mut replace_retries = 0usize;

        'search_again: loop {
            if !ignore_replacement && !right.is_null() && right != tail {
                let right_next = unsafe { next_of(right) }.load(Acquire);
                if right_next.tag_set(REPLACING) {
                    replace_retries += 1;
                    if replace_retries >= MAX_REPLACE_RETRIES {
                        // the replacing thread has likely crashed; complete
                        // the deletion half of its job
                        self.delete_by_ref(right, true, cx);
                    }
                }
            }

            loop {
                let mut t = self.head_ptr();
                let mut t_next = self.head.next().load(Acquire);
                let mut left_next = t_next;
                let mut marked = 0usize;

                // phase 1: advance until the first live node with key >= `key`
                loop {
                    if !t_next.tag_set(DELETED) {
                        *left = t;
                        left_next = t_next;
                        marked = 0;
                    } else {
                        marked += 1;
                    }

                    t = t_next.unmarked_ptr();
                    if t == tail {
                        break;
                    }

                    t_next = unsafe { next_of(t) }.load(Acquire);
                    if !t_next.tag_set(DELETED) && key_cmp(unsafe { key_of(t) }, key) != Less {
                        break;
                    }
                }
                right = t;

                // phase 2: left and right adjacent, nothing to splice
                if left_next == MarkedPtr::new(right) {
                    if right != tail && self.must_retry(right, ignore_replacement) {
                        continue 'search_again;
                    }
                    return right;
                }

                // phase 3: splice out the marked run between left and right
                let left_ref = unsafe { next_of(*left) };
                if cx.backoff.cas(left_ref, left_next, MarkedPtr::new(right)) {
                    unsafe { self.retire_run(left_next, marked, cx) };

                    if right != tail && self.must_retry(right, ignore_replacement) {
                        continue 'search_again;
                    }
                    return right;
                }
            }
        }
    }

    /// Returns the node with the given `key`, if a live one exists.
    pub fn get(&self, key: &[u8], cx: &mut LocalCtx<'_>) -> Option<NonNull<Item>> {
        let mut left = ptr::null_mut();
        let right = self.search(key, &mut left, false, cx);

        if right == self.tail_ptr() || key_cmp(unsafe { key_of(right) }, key) != Equal {
            None
        } else {
            Some(unsafe { NonNull::new_unchecked(right) })
        }
    }

    /// Inserts the node at `it` at its key position.
    ///
    /// Fails if a live node with an equal key exists.
    pub fn insert(&self, it: NonNull<Item>, cx: &mut LocalCtx<'_>) -> bool {
        let tail = self.tail_ptr();
        let node = it.as_ptr();
        let key = unsafe { key_of(node) };
        let mut left = ptr::null_mut();

        loop {
            let right = self.search(key, &mut left, false, cx);
            if right != tail && key_cmp(unsafe { key_of(right) }, key) == Equal {
                return false;
            }

            unsafe { next_of(node) }.store(MarkedPtr::new(right), Relaxed);
            let left_ref = unsafe { next_of(left) };
            if cx.backoff.cas(left_ref, MarkedPtr::new(right), MarkedPtr::new(node)) {
                return true;
            }
        }
    }

    /// Deletes the node with the given `key`.
    ///
    /// `*found` is set iff this call's logical-delete CAS succeeded, which is
    /// the operation's linearization point; the unlinked node is returned
    /// only when this call also performed the physical unlink. With `reclaim`
    /// the node is retired on success, otherwise ownership of the unlinked
    /// node passes to the caller.
    pub fn delete(
        &self,
        key: &[u8],
        reclaim: bool,
        found: &mut bool,
        cx: &mut LocalCtx<'_>,
    ) -> Option<NonNull<Item>> {
        let tail = self.tail_ptr();
        let mut left = ptr::null_mut();
        let (right, right_next) = loop {
            let right = self.search(key, &mut left, false, cx);
            if right == tail || key_cmp(unsafe { key_of(right) }, key) != Equal {
                return None;
            }

            let right_next = unsafe { next_of(right) }.load(Acquire);
            if !right_next.tag_set(DELETED)
                && cx.backoff.cas(
                    unsafe { next_of(right) },
                    right_next,
                    right_next.with_tag(DELETED),
                )
            {
                break (right, right_next);
            }
        };

        *found = true;

        let left_ref = unsafe { next_of(left) };
        if !cx.backoff.cas(left_ref, MarkedPtr::new(right), right_next) {
            // let a fresh traversal splice the node out (and retire it)
            self.search(unsafe { key_of(right) }, &mut left, false, cx);
            return None;
        }

        if reclaim {
            unsafe { cx.retire_item(right) };
        }

        Some(unsafe { NonNull::new_unchecked(right) })
    }

    /// Finds the node at `target` by identity, skipping any tag bits.
    ///
    /// Returns the tail pointer if `target` is no longer linked.
    pub fn search_by_ref(&self, target: *mut Item, left: &mut *mut Item) -> *mut Item {
        let tail = self.tail_ptr();
        let target = (target as usize & !TAG_MASK) as *mut Item;

        let mut l = self.head_ptr();
        let mut right = self.head.next().load(Acquire).unmarked_ptr();
        while right != target && right != tail {
            l = right;
            right = unsafe { next_of(l) }.load(Acquire).unmarked_ptr();
        }

        *left = l;
        right
    }

    /// Deletes the node at `target` by identity.
    ///
    /// Returns the node if this call both marked and unlinked it.
    pub fn delete_by_ref(
        &self,
        target: *mut Item,
        reclaim: bool,
        cx: &mut LocalCtx<'_>,
    ) -> Option<NonNull<Item>> {
        let tail = self.tail_ptr();
        let mut left = ptr::null_mut();
        let (right, right_next) = loop {
            let right = self.search_by_ref(target, &mut left);
            if right == tail {
                return None;
            }

            let right_next = unsafe { next_of(right) }.load(Acquire);
            if right_next.tag_set(DELETED) {
                // another thread deleted it; help splice it out through a
                // keyed traversal, then re-check
                let mut l = ptr::null_mut();
                self.search(unsafe { key_of(right) }, &mut l, true, cx);
                continue;
            }

            if cx.backoff.cas(unsafe { next_of(right) }, right_next, right_next.with_tag(DELETED))
            {
                break (right, right_next);
            }
        };

        let left_ref = unsafe { next_of(left) };
        if !cx.backoff.cas(left_ref, MarkedPtr::new(right), right_next) {
            // an ordinary traversal will complete the unlink and retire the
            // node
            return None;
        }

        if reclaim {
            unsafe { cx.retire_item(right) };
        }

        Some(unsafe { NonNull::new_unchecked(right) })
    }

    /// Marks every currently live node as logically deleted.
    ///
    /// Returns the number of nodes traversed.
    fn mark_all(&self, cx: &mut LocalCtx<'_>) -> usize {
        let tail = self.tail_ptr();
        let mut marked_nodes = 0;
        let mut node = self.head.next().load(Acquire).unmarked_ptr();

        while node != tail {
            loop {
                let node_next = unsafe { next_of(node) }.load(Acquire);
                if node_next.tag_set(DELETED)
                    || cx.backoff.cas(
                        unsafe { next_of(node) },
                        node_next,
                        node_next.with_tag(DELETED),
                    )
                {
                    break;
                }
            }

            marked_nodes += 1;
            node = unsafe { next_of(node) }.load(Acquire).unmarked_ptr();
        }

        marked_nodes
    }

    /// Splices out every run of logically deleted nodes and retires them.
    ///
    /// Idempotent and safe to run concurrently with every other operation;
    /// returns the number of nodes physically removed by this call.
    pub fn cleanup(&self, cx: &mut LocalCtx<'_>) -> usize {
        let tail = self.tail_ptr();
        let mut total = 0;

        'restart: loop {
            let mut t = self.head_ptr();
            let mut t_next = self.head.next().load(Acquire);
            let mut left = t;
            let mut left_next = t_next;

            'scan: loop {
                // advance to the next marked run
                loop {
                    if !t_next.tag_set(DELETED) {
                        left = t;
                        left_next = t_next;
                    }
                    t = t_next.unmarked_ptr();
                    if t == tail {
                        return total;
                    }
                    t_next = unsafe { next_of(t) }.load(Acquire);
                    if t_next.tag_set(DELETED) {
                        break;
                    }
                }

                // measure the run
                let mut removed = 0usize;
                while t_next.tag_set(DELETED) {
                    removed += 1;
                    t = t_next.unmarked_ptr();
                    if t == tail {
                        break;
                    }
                    t_next = unsafe { next_of(t) }.load(Acquire);
                }
                let right = t;

                let left_ref = unsafe { next_of(left) };
                if cx.backoff.cas(left_ref, left_next, MarkedPtr::new(right)) {
                    unsafe { self.retire_run(left_next, removed, cx) };
                    total += removed;
                    continue 'scan;
                }

                continue 'restart;
            }
        }
    }

    /// Logically deletes every live node, then splices and retires them all.
    ///
    /// Returns the number of nodes physically removed by this call.
    pub fn empty_all(&self, cx: &mut LocalCtx<'_>) -> usize {
        self.mark_all(cx);
        self.cleanup(cx)
    }

    /// Retires the `count` nodes of the spliced-out run starting at `run`.
    ///
    /// # Safety
    ///
    /// The run must have just been unlinked by a successful CAS of this
    /// thread.
    unsafe fn retire_run(&self, run: MarkedPtr<Item>, count: usize, cx: &mut LocalCtx<'_>) {
        let mut node = run.unmarked_ptr();
        let mut remaining = count;
        while !node.is_null() && remaining > 0 {
            let node_next = next_of(node).load(Relaxed);
            debug_assert!(node_next.tag_set(DELETED));
            cx.retire_item(node);
            node = node_next.unmarked_ptr();
            remaining -= 1;
        }
    }

    /// Returns whether a traversal that found `right` must restart because
    /// the node is marked deleted or (unless ignored) mid-replacement.
    #[inline]
    fn must_retry(&self, right: *mut Item, ignore_replacement: bool) -> bool {
        let right_next = unsafe { next_of(right) }.load(Acquire);
        right_next.tag_set(DELETED) || (!ignore_replacement && right_next.tag_set(REPLACING))
    }

    /// Hands every node still linked into the list to `f` and resets the
    /// list to empty.
    ///
    /// # Safety
    ///
    /// Single-threaded teardown only; no other thread may be traversing.
    pub unsafe fn drain_nodes(&self, f: &mut dyn FnMut(NonNull<Item>)) {
        let tail = self.tail_ptr();
        let mut node = self.head.next().load(Relaxed).unmarked_ptr();
        self.head.next().store(MarkedPtr::new(tail), Relaxed);

        while node != tail {
            let next = next_of(node).load(Relaxed).unmarked_ptr();
            f(NonNull::new_unchecked(node));
            node = next;
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "replace-mark")] {
        impl List {
            /// Replaces the node keyed like `key` with the node at `new`,
            /// advertising the exchange through the [`REPLACING`] bit.
            ///
            /// `*inserted` is set iff `new` became visible to readers; the
            /// return value is the unlinked old node, if this call removed
            /// it. Callers retry while `*inserted` remains `false`.
            pub fn replace(
                &self,
                key: &[u8],
                new: NonNull<Item>,
                reclaim: bool,
                inserted: &mut bool,
                cx: &mut LocalCtx<'_>,
            ) -> Option<NonNull<Item>> {
                *inserted = false;
                let tail = self.tail_ptr();
                let new_ptr = new.as_ptr();
                let mut left = ptr::null_mut();

                let old = self.search(key, &mut left, false, cx);
                if old == tail || key_cmp(unsafe { key_of(old) }, key) != Equal {
                    *inserted = self.insert(new, cx);
                    return None;
                }

                // advertise the replacement on the old node
                let old_next = unsafe { next_of(old) }.load(Acquire);
                if old_next.tag_set(DELETED)
                    || old_next.tag_set(REPLACING)
                    || !cx.backoff.cas(
                        unsafe { next_of(old) },
                        old_next,
                        old_next.with_tag(REPLACING),
                    )
                {
                    return None;
                }

                // link the new node in front of the old one; readers resolve
                // the key to the new node from here on
                unsafe { next_of(new_ptr) }.store(MarkedPtr::new(old), Relaxed);
                if !cx.backoff.cas(
                    unsafe { next_of(left) },
                    MarkedPtr::new(old),
                    MarkedPtr::new(new_ptr),
                ) {
                    return None;
                }

                *inserted = true;

                // logically delete the old node
                let (right, right_next) = loop {
                    let right = self.search_by_ref(old, &mut left);
                    if right == tail || key_cmp(unsafe { key_of(right) }, key) != Equal {
                        return None;
                    }

                    let right_next = unsafe { next_of(right) }.load(Acquire);
                    if right_next.tag_set(DELETED)
                        || cx.backoff.cas(
                            unsafe { next_of(right) },
                            right_next,
                            right_next.with_tag(DELETED),
                        )
                    {
                        break (right, right_next);
                    }
                };

                // physically unlink it from behind the new node
                if !cx.backoff.cas(
                    unsafe { next_of(new_ptr) },
                    MarkedPtr::new(right),
                    MarkedPtr::new(right_next.unmarked_ptr()),
                ) {
                    self.cleanup(cx);
                    return None;
                }

                if reclaim {
                    unsafe { cx.retire_item(right) };
                }

                Some(unsafe { NonNull::new_unchecked(right) })
            }
        }
    } else {
        impl List {
            /// Replaces the node keyed like `key` with the node at `new` by
            /// linking the new node directly behind the live old occurrence
            /// and then deleting the old one by reference.
            ///
            /// `*inserted` is set iff `new` became visible to readers; the
            /// return value is the unlinked old node, if this call removed
            /// it. Callers retry while `*inserted` remains `false`.
            pub fn replace(
                &self,
                key: &[u8],
                new: NonNull<Item>,
                reclaim: bool,
                inserted: &mut bool,
                cx: &mut LocalCtx<'_>,
            ) -> Option<NonNull<Item>> {
                *inserted = false;
                let tail = self.tail_ptr();
                let new_ptr = new.as_ptr();
                let mut left = ptr::null_mut();

                loop {
                    let old = self.search(key, &mut left, false, cx);
                    if old == tail || key_cmp(unsafe { key_of(old) }, key) != Equal {
                        *inserted = self.insert(new, cx);
                        return None;
                    }

                    let old_next = unsafe { next_of(old) }.load(Acquire);
                    if old_next.tag_set(DELETED) {
                        continue;
                    }

                    // link the new node directly behind the old occurrence;
                    // readers keep resolving the key to the old node until
                    // it is marked below
                    unsafe { next_of(new_ptr) }
                        .store(MarkedPtr::new(old_next.unmarked_ptr()), Relaxed);
                    if cx.backoff.cas(
                        unsafe { next_of(old) },
                        old_next,
                        MarkedPtr::new(new_ptr),
                    ) {
                        *inserted = true;
                        return self.delete_by_ref(old, reclaim, cx);
                    }
                }
            }
        }
    }
}

/***** position-based access **********************************************************************/

#[allow(dead_code)]
impl List {
    /// Returns whether a live node with the given `key` exists.
    pub fn find(&self, key: &[u8], cx: &mut LocalCtx<'_>) -> bool {
        self.get(key, cx).is_some()
    }

    /// Finds the live node at position `index`, splicing marked runs like
    /// the keyed search. With `for_delete` the traversal stops at the last
    /// node regardless of `index`.
    pub fn search_index(
        &self,
        index: usize,
        left: &mut *mut Item,
        for_delete: bool,
        cx: &mut LocalCtx<'_>,
    ) -> *mut Item {
        let tail = self.tail_ptr();

        loop {
            let mut t = self.head_ptr();
            let mut t_next = self.head.next().load(Acquire);
            let mut left_next = t_next;
            let mut marked = 0usize;
            let mut visited = 0usize;

            loop {
                if !t_next.tag_set(DELETED) {
                    *left = t;
                    left_next = t_next;
                    marked = 0;
                } else {
                    marked += 1;
                }

                t = t_next.unmarked_ptr();
                if t == tail
                    || (for_delete
                        && unsafe { next_of(t) }.load(Acquire) == MarkedPtr::new(tail))
                {
                    break;
                }

                t_next = unsafe { next_of(t) }.load(Acquire);
                visited += 1;
                if visited > index && !t_next.tag_set(DELETED) {
                    break;
                }
            }
            let right = t;

            if left_next == MarkedPtr::new(right) {
                if right != tail && unsafe { next_of(right) }.load(Acquire).tag_set(DELETED) {
                    continue;
                }
                return right;
            }

            let left_ref = unsafe { next_of(*left) };
            if cx.backoff.cas(left_ref, left_next, MarkedPtr::new(right)) {
                unsafe { self.retire_run(left_next, marked, cx) };

                if right != tail && unsafe { next_of(right) }.load(Acquire).tag_set(DELETED) {
                    continue;
                }
                return right;
            }
        }
    }

    /// Returns the live node at position `index`, if the list is long enough.
    pub fn get_index(&self, index: usize, cx: &mut LocalCtx<'_>) -> Option<NonNull<Item>> {
        let mut left = ptr::null_mut();
        let right = self.search_index(index, &mut left, false, cx);
        if right == self.tail_ptr() {
            None
        } else {
            Some(unsafe { NonNull::new_unchecked(right) })
        }
    }

    /// Inserts the node at `it` at position `index`, or at the end when the
    /// list is shorter.
    pub fn insert_index(&self, it: NonNull<Item>, index: usize, cx: &mut LocalCtx<'_>) -> bool {
        let node = it.as_ptr();
        let mut left = ptr::null_mut();

        loop {
            let right = self.search_index(index, &mut left, false, cx);
            unsafe { next_of(node) }.store(MarkedPtr::new(right), Relaxed);
            let left_ref = unsafe { next_of(left) };
            if cx.backoff.cas(left_ref, MarkedPtr::new(right), MarkedPtr::new(node)) {
                return true;
            }
        }
    }

    /// Deletes the node at position `index`; the node is always retired.
    pub fn delete_index(&self, index: usize, cx: &mut LocalCtx<'_>) -> Option<NonNull<Item>> {
        let tail = self.tail_ptr();
        let mut left = ptr::null_mut();
        let (right, right_next) = loop {
            let right = self.search_index(index, &mut left, true, cx);
            if right == tail {
                return None;
            }

            let right_next = unsafe { next_of(right) }.load(Acquire);
            if !right_next.tag_set(DELETED)
                && cx.backoff.cas(
                    unsafe { next_of(right) },
                    right_next,
                    right_next.with_tag(DELETED),
                )
            {
                break (right, right_next);
            }
        };

        let left_ref = unsafe { next_of(left) };
        if !cx.backoff.cas(left_ref, MarkedPtr::new(right), right_next) {
            self.search_index(index, &mut left, true, cx);
            return None;
        }

        unsafe { cx.retire_item(right) };
        Some(unsafe { NonNull::new_unchecked(right) })
    }

    #[inline]
    pub fn insert_head(&self, it: NonNull<Item>, cx: &mut LocalCtx<'_>) -> bool {
        self.insert_index(it, 0, cx)
    }

    #[inline]
    pub fn insert_tail(&self, it: NonNull<Item>, cx: &mut LocalCtx<'_>) -> bool {
        self.insert_index(it, usize::MAX, cx)
    }

    #[inline]
    pub fn delete_head(&self, cx: &mut LocalCtx<'_>) -> Option<NonNull<Item>> {
        self.delete_index(0, cx)
    }

    #[inline]
    pub fn delete_tail(&self, cx: &mut LocalCtx<'_>) -> Option<NonNull<Item>> {
        self.delete_index(usize::MAX, cx)
    }
}
