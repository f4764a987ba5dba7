//! Fixed-capacity event append region and the per-thread pointer cell that
//! publishes it.
//!
//! # Design
//!
//! An [`EventBuffer`] is a bare append region: a heap array of event words,
//! a producer-maintained `count`, and a one-way `closed` flag. It is *not* a
//! ring — once full it is handed off whole and never overwritten in place.
//!
//! Storage is sized `N + B + 1` words for capacity `N` and batch period `B`:
//! the producer re-checks its state only every `B` appends, so up to `B`
//! words can land past the capacity mark before the slow path runs. The tail
//! pad absorbs them; consumers never read past `count`.
//!
//! # Ownership protocol
//!
//! A buffer's storage is exclusively owned by one party at a time:
//!
//! ```text
//! manager --allocate--> producer --flush+close--> worker --release--> manager
//! ```
//!
//! The only synchronized edge is `closed`: the producer's final
//! `flush(count)` is Release-published by `close()`, and a worker
//! Acquire-loads `closed` before touching `storage[0..count]`. Everything
//! else is single-writer by protocol.
//!
//! # The live slot
//!
//! [`LiveSlot`] is the per-thread atomic pointer cell the producer re-reads
//! on every append and the manager nulls during revocation. It is the only
//! lock-free cross-thread channel on the hot path: Relaxed loads on the
//! producer side, Relaxed null stores on the manager side. The slot value is
//! only ever *compared*, never dereferenced to discover a buffer — producers
//! obtain buffer pointers from `allocate`, under the monitor — so the
//! relaxed ordering carries no publication burden.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use std::cell::UnsafeCell;
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::config::LogConfig;

/// `thread_id` value of a buffer not currently assigned to any thread.
pub const UNASSIGNED_THREAD: u32 = u32::MAX;

/// `epoch` value of a buffer not handed out in any epoch.
pub const UNASSIGNED_EPOCH: u64 = u64::MAX;

/// Fixed-capacity append region for 64-bit event words.
///
/// # Invariants
///
/// - `count` advances monotonically between resets; `storage[i]` is valid
///   for `i < count`.
/// - `count <= next_check <= count + batch_period` whenever a producer
///   holds the buffer, so `count` never exceeds `capacity + batch_period`
///   and stays strictly inside `storage`.
/// - `closed` transitions false→true at most once per reset cycle, always
///   on the producing thread.
/// - `count` and `next_check` are authoritative only at reload boundaries;
///   while a [`LogWriter`](crate::LogWriter) is attached, its local snapshot
///   is the truth and these fields are stale until the next flush.
pub struct EventBuffer {
    /// Event words, `capacity + batch_period + 1` of them. Producer writes
    /// and worker reads are disjoint in time (see the ownership protocol in
    /// the module docs), which is what makes the `UnsafeCell` sound.
    storage: UnsafeCell<Box<[u64]>>,

    /// Events appended so far. Refreshed from the producer's register-local
    /// snapshot on flush; read by the worker after `closed`.
    count: AtomicUsize,

    /// `count` value at which the producer must take the slow path.
    next_check: AtomicUsize,

    /// Producing thread, assigned at handoff.
    thread_id: AtomicU32,

    /// Epoch in which this buffer was handed out.
    epoch: AtomicU64,

    /// Set once the producer will never write again.
    closed: AtomicBool,

    /// Capacity mark `N`; appends at or past it trigger an epoch advance.
    capacity: usize,

    /// Batch period `B`.
    batch_period: usize,
}

// SAFETY: `storage` is raced only through the ownership protocol above —
// at most one party mutates it at any time, and the producer→worker handoff
// is ordered by the Release close / Acquire closed-read pair. All other
// fields are atomics.
unsafe impl Sync for EventBuffer {}

/// Register-resident snapshot of a buffer's mutable state, carried by the
/// producer across appends.
pub(crate) struct BufRef {
    pub base: *mut u64,
    pub count: usize,
    pub next_check: usize,
}

impl EventBuffer {
    /// Allocate an empty buffer. Storage is `events_per_buffer +
    /// batch_period + 1` words; allocation failure aborts the process (the
    /// runtime has no recovery path for OOM).
    pub fn new(config: &LogConfig) -> Self {
        let words = config.storage_words();
        Self {
            storage: UnsafeCell::new(vec![0u64; words].into_boxed_slice()),
            count: AtomicUsize::new(0),
            next_check: AtomicUsize::new(config.batch_period),
            thread_id: AtomicU32::new(UNASSIGNED_THREAD),
            epoch: AtomicU64::new(UNASSIGNED_EPOCH),
            closed: AtomicBool::new(false),
            capacity: config.events_per_buffer,
            batch_period: config.batch_period,
        }
    }

    /// Reset to the freshly-created state, reusing the storage.
    ///
    /// Caller must own the buffer exclusively: either it was just created,
    /// or its previous producer closed it and the close was observed with
    /// Acquire ordering.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.next_check.store(self.batch_period, Ordering::Relaxed);
        self.thread_id.store(UNASSIGNED_THREAD, Ordering::Relaxed);
        self.epoch.store(UNASSIGNED_EPOCH, Ordering::Relaxed);
        self.closed.store(false, Ordering::Relaxed);
    }

    /// Stamp ownership at handoff. Manager-only, under the monitor.
    pub(crate) fn assign(&self, thread_id: u32, epoch: u64) {
        self.thread_id.store(thread_id, Ordering::Relaxed);
        self.epoch.store(epoch, Ordering::Relaxed);
    }

    /// Snapshot `(storage, count, next_check)` for a producer about to
    /// append. The snapshot, not the buffer, is authoritative until the next
    /// flush.
    pub(crate) fn make_ref(&self) -> BufRef {
        // SAFETY: only the owning producer takes a ref, and it takes at most
        // one at a time.
        let base = unsafe { (*self.storage.get()).as_mut_ptr() };
        BufRef {
            base,
            count: self.count.load(Ordering::Relaxed),
            next_check: self.next_check.load(Ordering::Relaxed),
        }
    }

    /// Write the producer's local snapshot back. Producer-only.
    pub(crate) fn flush(&self, count: usize, next_check: usize) {
        debug_assert!(count <= self.capacity + self.batch_period);
        self.count.store(count, Ordering::Relaxed);
        self.next_check.store(next_check, Ordering::Relaxed);
    }

    /// Mark the buffer as done: the producer will never write again.
    ///
    /// Idempotent on the producing thread (a buffer revoked and then seen
    /// again at thread exit must not re-transition the flag). The Release
    /// store publishes every prior `storage` write and the final `flush` to
    /// whichever worker Acquire-reads `closed`.
    ///
    /// Returns whether this call performed the transition.
    pub(crate) fn close(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.closed.store(true, Ordering::Release);
        true
    }

    /// Whether the producer has finished with this buffer. Acquire: a true
    /// result licenses reading `storage[0..count]`.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Events currently recorded. Meaningful to non-producers only after
    /// [`is_closed`](Self::is_closed) returned true.
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Producing thread's ID, or [`UNASSIGNED_THREAD`].
    #[inline]
    pub fn thread_id(&self) -> u32 {
        self.thread_id.load(Ordering::Relaxed)
    }

    /// Epoch this buffer was handed out in, or [`UNASSIGNED_EPOCH`].
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Capacity mark `N`.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Batch period `B`.
    #[inline]
    pub fn batch_period(&self) -> usize {
        self.batch_period
    }

    /// The recorded events, `storage[0..count]`.
    ///
    /// # Safety
    ///
    /// Caller must either be the producer between appends, or have observed
    /// `is_closed() == true`; otherwise the producer may be writing the
    /// slice concurrently.
    pub(crate) unsafe fn events(&self) -> &[u64] {
        let count = self.count.load(Ordering::Relaxed);
        let storage = &*self.storage.get();
        &storage[..count]
    }
}

/// Per-thread atomic pointer cell naming the thread's current buffer.
///
/// Padded to a cache line: the manager's revocation stores must not false-
/// share with neighboring slots when many threads register at once.
pub struct LiveSlot {
    cell: CachePadded<AtomicPtr<EventBuffer>>,
}

impl LiveSlot {
    pub fn new() -> Self {
        Self {
            cell: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Hot-path read. Relaxed: the result is compared against the producer's
    /// cached pointer, never dereferenced to discover a buffer.
    #[inline(always)]
    pub(crate) fn load(&self) -> *mut EventBuffer {
        self.cell.load(Ordering::Relaxed)
    }

    /// Publish a freshly assigned buffer. Manager-only, under the monitor.
    pub(crate) fn publish(&self, buf: *mut EventBuffer) {
        self.cell.store(buf, Ordering::Release);
    }

    /// Null the slot during revocation or thread exit. Relaxed is enough:
    /// the producer's slow path re-checks under the monitor before acting.
    pub(crate) fn revoke(&self) {
        self.cell.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

impl Default for LiveSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn small_config() -> LogConfig {
        LogConfig {
            events_per_buffer: 128,
            batch_period: 16,
            max_workers: 1,
        }
    }

    #[test]
    fn fresh_buffer_state() {
        let buf = EventBuffer::new(&small_config());
        assert_eq!(buf.count(), 0);
        assert_eq!(buf.thread_id(), UNASSIGNED_THREAD);
        assert_eq!(buf.epoch(), UNASSIGNED_EPOCH);
        assert!(!buf.is_closed());
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.batch_period(), 16);
    }

    #[test]
    fn ref_snapshots_flushed_state() {
        let buf = EventBuffer::new(&small_config());
        let mut r = buf.make_ref();
        assert_eq!(r.count, 0);
        assert_eq!(r.next_check, 16);

        unsafe { r.base.write(0xAA) };
        r.count = 1;
        buf.flush(r.count, r.next_check);

        let r2 = buf.make_ref();
        assert_eq!(r2.count, 1);
        assert_eq!(unsafe { buf.events() }, &[0xAA]);
    }

    #[test]
    fn close_transitions_once() {
        let buf = EventBuffer::new(&small_config());
        assert!(buf.close());
        assert!(!buf.close());
        assert!(buf.is_closed());
    }

    #[test]
    fn reset_clears_everything() {
        let buf = EventBuffer::new(&small_config());
        buf.assign(3, 7);
        buf.flush(42, 48);
        buf.close();

        buf.reset();
        assert_eq!(buf.count(), 0);
        assert_eq!(buf.thread_id(), UNASSIGNED_THREAD);
        assert_eq!(buf.epoch(), UNASSIGNED_EPOCH);
        assert!(!buf.is_closed());
        // Closed may transition again after a reset.
        assert!(buf.close());
    }

    #[test]
    fn slot_publish_and_revoke() {
        let buf = EventBuffer::new(&small_config());
        let slot = LiveSlot::new();
        assert!(slot.load().is_null());

        let ptr = &buf as *const EventBuffer as *mut EventBuffer;
        slot.publish(ptr);
        assert_eq!(slot.load(), ptr);

        slot.revoke();
        assert!(slot.load().is_null());
    }
}
