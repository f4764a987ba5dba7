//! Consumer side: the epoch sink trait and the worker main loop.
//!
//! A worker is handed the full set of buffers reclaimed at one epoch
//! boundary. Its contract:
//!
//! 1. Spin-read each buffer's `closed` flag until true (Acquire). This is
//!    the readiness fence — revocation nulls slots without synchronizing
//!    the producer's in-flight appends, so a just-revoked producer may
//!    still be one append away from its flush.
//! 2. Read `storage[0..count]` and nothing beyond.
//! 3. Hand the set back via [`BufferManager::release`](crate::BufferManager).
//!
//! The wait in step 1 is bounded by the producer's next slow-path entry
//! (at most one batch period away while it keeps logging, or its thread
//! exit otherwise). Waiting spins briefly, then yields.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::buffer::EventBuffer;
use crate::manager::BufferManager;

/// Read-only view of one delivered buffer.
///
/// Constructed only after the buffer's `closed` flag has been observed, so
/// the event slice is stable for the lifetime of the view.
pub struct BufferView<'a> {
    buf: &'a EventBuffer,
}

impl<'a> BufferView<'a> {
    /// Caller must have observed `buf.is_closed() == true`.
    pub(crate) fn new(buf: &'a EventBuffer) -> Self {
        debug_assert!(buf.is_closed());
        Self { buf }
    }

    /// ID of the thread that produced this buffer.
    #[inline]
    pub fn thread_id(&self) -> u32 {
        self.buf.thread_id()
    }

    /// Epoch the buffer was handed out in.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.buf.epoch()
    }

    /// Number of recorded events.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The recorded event words, in the producer's append order.
    #[inline]
    pub fn events(&self) -> &'a [u64] {
        // SAFETY: the view is only constructed after `closed` was observed
        // with Acquire ordering; the producer will never write again and the
        // buffer is not reset until the worker releases it.
        unsafe { self.buf.events() }
    }
}

/// Consumer of finished epochs.
///
/// Called once per delivered epoch with every buffer reclaimed at that
/// boundary, each already safe to read. Implementations run on a detached
/// worker thread (or on the caller's thread during quiesce) and must be
/// prepared for concurrent invocations up to the configured worker cap.
pub trait EpochSink: Send + Sync + 'static {
    fn consume(&self, epoch: u64, buffers: &[BufferView<'_>]);
}

/// Discards everything. Default sink of the process-wide runtime until the
/// host installs a real one.
pub struct NullSink;

impl EpochSink for NullSink {
    fn consume(&self, _epoch: u64, _buffers: &[BufferView<'_>]) {}
}

/// Tallies delivered events and buffers. Used by tests and benches.
#[derive(Default)]
pub struct CountingSink {
    events: AtomicU64,
    buffers: AtomicU64,
    epochs: AtomicU64,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total events across all deliveries so far.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Total buffers delivered so far.
    pub fn buffers(&self) -> u64 {
        self.buffers.load(Ordering::Relaxed)
    }

    /// Total epochs delivered so far.
    pub fn epochs(&self) -> u64 {
        self.epochs.load(Ordering::Relaxed)
    }
}

impl EpochSink for CountingSink {
    fn consume(&self, _epoch: u64, buffers: &[BufferView<'_>]) {
        let events: u64 = buffers.iter().map(|b| b.len() as u64).sum();
        self.events.fetch_add(events, Ordering::Relaxed);
        self.buffers.fetch_add(buffers.len() as u64, Ordering::Relaxed);
        self.epochs.fetch_add(1, Ordering::Relaxed);
    }
}

/// Spin until the buffer is closed. Brief spin, then yield to the producer.
pub(crate) fn wait_closed(buf: &EventBuffer) {
    let mut spins = 0u32;
    while !buf.is_closed() {
        spins += 1;
        if spins < 64 {
            std::hint::spin_loop();
        } else {
            thread::yield_now();
        }
    }
}

/// Deadline-bounded variant used by quiesce. Returns whether the buffer
/// closed in time.
pub(crate) fn wait_closed_until(buf: &EventBuffer, deadline: Instant) -> bool {
    let mut spins = 0u32;
    while !buf.is_closed() {
        if Instant::now() >= deadline {
            return false;
        }
        spins += 1;
        if spins < 64 {
            std::hint::spin_loop();
        } else {
            thread::yield_now();
        }
    }
    true
}

/// Body of a detached worker thread: readiness fence, consume, release.
pub(crate) fn worker_main(
    manager: Arc<BufferManager>,
    epoch: u64,
    buffers: Vec<Arc<EventBuffer>>,
) {
    for buf in &buffers {
        wait_closed(buf);
    }

    let views: Vec<BufferView<'_>> = buffers.iter().map(|b| BufferView::new(b)).collect();
    manager.sink().consume(epoch, &views);
    drop(views);

    manager.release(buffers);
}
