//! A concurrent, in-memory key/value associative index for cache servers.
//!
//! The index is a closed-addressing hash table whose buckets are lock-free
//! ordered linked lists with logical-delete marking, layered over an
//! epoch-based reclamation scheme that defers the destruction of unlinked
//! records until no thread can still be reading them. A per-bucket 8-bit
//! CLOCK counter approximates recency of use and drives eviction; a single
//! background maintenance thread doubles the table incrementally while
//! readers and writers keep running.
//!
//! Records are allocated by the caller (typically a slab allocator), handed
//! over on insertion and returned through the reclaim callback supplied at
//! index creation, exactly once per retired record and only after two full
//! epochs have passed since it was unlinked.
//!
//! # Usage
//!
//! ```ignore
//! let index = AssocIndex::new(
//!     Config::with_params(13, num_threads),
//!     Box::new(|item| slab_free(item)),
//! );
//! index.start_maintenance().unwrap();
//!
//! // per worker thread, with a unique tid
//! let mut local = index.local(tid);
//! local.announce();
//! let hv = index.hash(b"key");
//! local.insert(Item::new(b"key", b"value"), hv).unwrap();
//! let found = local.find(b"key", hv);
//! local.enter_quiescent();
//! ```

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::io;
use std::sync::Arc;
use std::thread;

mod assoc;
mod backoff;
mod bag;
mod config;
mod ebr;
mod epoch;
mod item;
mod list;
mod local;
mod maintenance;
mod marked;
mod retired;

#[cfg(feature = "global")]
pub mod global;

pub use crate::config::{Config, ConfigBuilder};
pub use crate::ebr::ReclaimFn;
pub use crate::item::{Item, KEY_MAX};
pub use crate::local::Local;

use crate::assoc::Table;
use crate::ebr::Ebr;
use crate::maintenance::Maintenance;
use crate::retired::Retired;

////////////////////////////////////////////////////////////////////////////////////////////////////
// AssocIndex
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent associative index.
///
/// All process-wide state of the scheme (the epoch counter, the bucket and
/// CLOCK generations, the expansion flag and the item-count shards) lives in
/// this one value; it is shared between threads through an [`Arc`] and
/// operated on through per-thread [`Local`] handles.
pub struct AssocIndex<S = RandomState> {
    pub(crate) config: Config,
    pub(crate) ebr: Ebr,
    pub(crate) table: Table,
    pub(crate) maint: Maintenance,
    hash_builder: S,
}

/***** impl inherent ******************************************************************************/

impl AssocIndex<RandomState> {
    /// Creates a new index for `config.num_threads()` workers.
    ///
    /// `reclaim` is invoked exactly once for every retired record, no
    /// earlier than two epochs after the record was unlinked.
    #[inline]
    pub fn new(config: Config, reclaim: ReclaimFn) -> Arc<Self> {
        Self::with_hasher(config, reclaim, RandomState::new())
    }
}

impl<S: BuildHasher> AssocIndex<S> {
    /// Creates a new index which hashes keys with `hash_builder`.
    pub fn with_hasher(config: Config, reclaim: ReclaimFn, hash_builder: S) -> Arc<Self> {
        let index = Arc::new(Self {
            config,
            ebr: Ebr::new(config.num_threads(), reclaim),
            table: Table::new(config.hashpower(), config.num_threads()),
            maint: Maintenance::new(),
            hash_builder,
        });

        log::info!(
            "hash table initialized: power level {}, {} bytes",
            index.table.hashpower(),
            index.table.bucket_bytes()
        );
        index
    }

    /// Hashes `key` the way the index does internally.
    ///
    /// Operations take a caller-supplied hash so it can be computed once per
    /// request; values not produced by this function still address valid
    /// buckets but break the bucket-placement of a later expansion.
    #[inline]
    pub fn hash(&self, key: &[u8]) -> u32 {
        let mut state = self.hash_builder.build_hasher();
        state.write(key);
        state.finish() as u32
    }

    /// Creates the operation handle for the worker thread `tid`.
    ///
    /// # Panics
    ///
    /// Panics if `tid` is not below the configured number of threads.
    pub fn local(self: &Arc<Self>, tid: usize) -> Local<S> {
        assert!(
            tid < self.config.num_threads(),
            "tid {} exceeds the configured number of worker threads",
            tid
        );
        Local::new(Arc::clone(self), tid)
    }

    /// Returns the aggregate number of live records.
    #[inline]
    pub fn current_item_count(&self) -> u64 {
        self.table.current_item_count()
    }

    /// Returns the current hash power (buckets are `2^hashpower`).
    #[inline]
    pub fn hashpower(&self) -> u32 {
        self.table.hashpower()
    }

    /// Signals the maintenance thread if the table has outgrown its buckets.
    ///
    /// Invoked automatically after successful inserts; exposed for callers
    /// that drive expansion on their own schedule.
    #[inline]
    pub fn check_expand(&self) {
        maintenance::check_expand(self);
    }

    /// Returns a snapshot of the index statistics.
    pub fn stats(&self) -> Stats {
        Stats {
            hash_power_level: self.table.hashpower(),
            hash_bytes: self.table.bucket_bytes(),
            curr_items: self.table.current_item_count(),
            expanding: self.table.is_expanding(),
        }
    }
}

impl<S: BuildHasher + Send + Sync + 'static> AssocIndex<S> {
    /// Spawns the maintenance thread driving incremental expansion.
    pub fn start_maintenance(self: &Arc<Self>) -> io::Result<thread::JoinHandle<()>> {
        let index = Arc::clone(self);
        thread::Builder::new()
            .name("assoc-maintenance".into())
            .spawn(move || maintenance::run(index))
    }

    /// Asks the maintenance thread to exit once it is idle.
    #[inline]
    pub fn stop_maintenance(&self) {
        self.maint.request_stop();
    }
}

/***** impl Drop **********************************************************************************/

impl<S> Drop for AssocIndex<S> {
    /// Hands every record still linked in the table to the reclaim callback,
    /// exactly once.
    ///
    /// Runs after the maintenance thread and every [`Local`] handle are
    /// gone, since each of them keeps the index alive through its [`Arc`].
    fn drop(&mut self) {
        let ebr = &self.ebr;
        unsafe {
            self.table.drain_generations(&mut |node| ebr.dispatch(Retired::Item(node)));
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Stats
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A point-in-time snapshot of an index's statistics.
#[derive(Copy, Clone, Debug)]
pub struct Stats {
    /// The current hash power.
    pub hash_power_level: u32,
    /// The byte footprint of the canonical bucket array.
    pub hash_bytes: u64,
    /// The aggregate number of live records.
    pub curr_items: u64,
    /// Whether an expansion is in progress.
    pub expanding: bool,
}
