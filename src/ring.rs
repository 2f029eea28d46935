//! Single-producer single-consumer index rings over raw shared memory.
//!
//! Each ring hands `u32` slot indices from exactly one producer to exactly
//! one consumer. Head and tail are monotonically increasing 64-bit counters;
//! the slot for a counter value is `counter & (capacity - 1)`. The producer
//! publishes by writing the index and then incrementing the tail with
//! release ordering; the consumer observes the tail with acquire ordering
//! and advances the head after reading. Empty iff `head == tail`.
//!
//! Capacity is a power of two at least as large as the number of indices
//! the producer can ever hold, so the ring cannot overflow and no
//! compare-and-swap is required.

use std::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;

use crate::constants::CACHE_LINE_SIZE;

/// Head/tail counter pair for one ring, each on its own cache line to
/// prevent false sharing between the producing and consuming process.
#[repr(C, align(64))]
pub struct RingCounters {
    head: AtomicU64,
    _pad0: [u8; CACHE_LINE_SIZE - 8],
    tail: AtomicU64,
    _pad1: [u8; CACHE_LINE_SIZE - 8],
}

const_assert_eq!(std::mem::size_of::<RingCounters>(), 2 * CACHE_LINE_SIZE);

impl RingCounters {
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }
}

/// Handle over one ring's counters and index array.
///
/// Handles are constructed on demand from region offsets; they hold raw
/// pointers into the mapping and are only valid while the region is mapped.
/// The caller upholds the single-producer/single-consumer discipline.
pub struct IndexRing {
    counters: *const RingCounters,
    slots: *mut u32,
    mask: u64,
    capacity: u64,
}

// A handle may be built on one thread and used on another; the SPSC
// discipline is what makes concurrent use sound, not the handle itself.
unsafe impl Send for IndexRing {}

impl IndexRing {
    /// Build a handle from raw region pointers.
    ///
    /// # Safety
    /// `counters` and `slots` must point into a live mapping with at least
    /// `capacity` `u32` slots, and `capacity` must be a power of two.
    pub unsafe fn from_raw(counters: *const RingCounters, slots: *mut u32, capacity: u32) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            counters,
            slots,
            mask: u64::from(capacity) - 1,
            capacity: u64::from(capacity),
        }
    }

    #[inline]
    fn counters(&self) -> &RingCounters {
        unsafe { &*self.counters }
    }

    /// Publish one index. Producer side only.
    pub fn push(&self, index: u32) {
        let c = self.counters();
        let tail = c.tail.load(Ordering::Relaxed);
        debug_assert!(
            tail.wrapping_sub(c.head.load(Ordering::Acquire)) < self.capacity,
            "ring overflow: more indices in flight than slots exist"
        );
        unsafe {
            self.slots.add((tail & self.mask) as usize).write_volatile(index);
        }
        c.tail.store(tail.wrapping_add(1), Ordering::Release);
    }

    /// Consume one index, if any is published. Consumer side only.
    pub fn pop(&self) -> Option<u32> {
        let c = self.counters();
        let head = c.head.load(Ordering::Relaxed);
        if head == c.tail.load(Ordering::Acquire) {
            return None;
        }
        let index = unsafe { self.slots.add((head & self.mask) as usize).read_volatile() };
        c.head.store(head.wrapping_add(1), Ordering::Release);
        Some(index)
    }

    /// Published-but-unconsumed count. Approximate from either side.
    pub fn len(&self) -> u64 {
        let c = self.counters();
        c.tail.load(Ordering::Acquire).wrapping_sub(c.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
