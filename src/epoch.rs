//! Type safe epochs and the per-thread slots observed during epoch advancement.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const BAG_COUNT: u64 = 3;

////////////////////////////////////////////////////////////////////////////////////////////////////
// AtomicEpoch
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct AtomicEpoch(AtomicU64);

impl AtomicEpoch {
    #[inline]
    pub const fn new(epoch: Epoch) -> Self {
        Self(AtomicU64::new(epoch.0))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> Epoch {
        Epoch(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, epoch: Epoch, order: Ordering) {
        self.0.store(epoch.0, order);
    }

    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: Epoch,
        new: Epoch,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Epoch, Epoch> {
        self.0.compare_exchange_weak(current.0, new.0, success, failure).map(Epoch).map_err(Epoch)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Epoch
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A monotonically increasing epoch counter.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) struct Epoch(u64);

impl Epoch {
    /// The epoch before any thread has announced; no retirement is sealed
    /// with it.
    pub const ZERO: Self = Self(0);

    /// The epoch the global counter starts out with.
    #[inline]
    pub const fn initial() -> Self {
        Self(1)
    }

    #[inline]
    pub fn increment(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the index of the limbo bag associated with this epoch.
    #[inline]
    pub fn bag_index(self) -> usize {
        (self.0 % BAG_COUNT) as usize
    }

    #[inline]
    pub fn checked_sub(self, rhs: u64) -> Option<Self> {
        self.0.checked_sub(rhs).map(Self)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadSlot
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The concurrently accessible epoch state of one thread.
///
/// The slot is written only by its owning thread but read by every thread
/// attempting to advance the global epoch; it is padded to a cache line to
/// keep those reads from interfering with neighbouring slots.
#[repr(align(64))]
pub(crate) struct ThreadSlot {
    /// The highest epoch the thread has observed.
    announcement: AtomicEpoch,
    /// Set while the thread holds no references into the data structure.
    quiescent: AtomicBool,
}

impl ThreadSlot {
    /// Creates a new slot; threads start out quiescent and unannounced.
    #[inline]
    pub fn new() -> Self {
        Self { announcement: AtomicEpoch::new(Epoch::ZERO), quiescent: AtomicBool::new(true) }
    }

    #[inline]
    pub fn announcement(&self) -> &AtomicEpoch {
        &self.announcement
    }

    #[inline]
    pub fn is_quiescent(&self, order: Ordering) -> bool {
        self.quiescent.load(order)
    }

    #[inline]
    pub fn set_quiescent(&self, quiescent: bool, order: Ordering) {
        self.quiescent.store(quiescent, order);
    }
}
