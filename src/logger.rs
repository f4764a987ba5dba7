//! The fast logging protocol: shim entry points and the slow-path split.
//!
//! # Hot path
//!
//! A [`LogWriter`] is the buffer reference of the protocol: a snapshot of
//! `(buffer, storage base, count, next_check)` held in locals so the
//! compiler can keep the whole append state in registers across a run of
//! instrumented operations. One append is:
//!
//! 1. Relaxed-load the live buffer slot — the only thing revocation can
//!    touch. The explicit atomic load on every call is what stops the
//!    compiler from hoisting it out of instrumented loops.
//! 2. Encode the event word.
//! 3. Store it at `base[count]`, increment `count`.
//! 4. One unlikely branch: slow path if `count` reached `next_check` or the
//!    slot went null.
//!
//! The slot value is compared, never dereferenced: buffers are only ever
//! discovered through `allocate`, under the monitor.
//!
//! # Slow path
//!
//! Out-of-line and cold, so its register pressure never leaks into the fast
//! path. Three cases:
//!
//! - slot null → the buffer was revoked: flush, close, re-allocate, rebind;
//! - `count` reached capacity → try to advance the epoch (win or lose),
//!   then re-allocate and rebind;
//! - otherwise → `next_check += B`, advisory write-prefetch of the next
//!   batch of slots, continue in place.
//!
//! The event word written just before a revocation is noticed stays in the
//! old buffer: consumers tolerate a one-event straddle at each buffer
//! boundary, and the new buffer starts empty.
//!
//! # Dropping
//!
//! Dropping the writer flushes `count`/`next_check` back to the buffer. If
//! the buffer was revoked while the writer was held, drop also closes it —
//! otherwise the worker holding the epoch would wait for a producer that is
//! no longer coming.

use std::sync::Arc;

use crate::buffer::EventBuffer;
use crate::context::{current_context, ThreadContext};
use crate::event::{encode_mem_access, encode_timestamp, AccessSize};

/// Register-resident append handle for the calling thread.
///
/// Deliberately `!Send`: a writer is bound to the thread whose live slot it
/// snapshots, which is also what enforces the single-producer-per-buffer
/// rule at compile time.
pub struct LogWriter {
    ctx: Arc<ThreadContext>,
    buffer: *mut EventBuffer,
    base: *mut u64,
    count: usize,
    next_check: usize,
    capacity: usize,
    batch: usize,
}

impl LogWriter {
    /// Attach to the calling thread's context (registering the thread with
    /// the process-wide runtime on first use).
    pub fn attach() -> Self {
        Self::for_context(current_context())
    }

    /// Attach to an explicit context. The context must belong to the
    /// calling thread.
    pub fn for_context(ctx: Arc<ThreadContext>) -> Self {
        let ptr = ctx.ensure_buffer();
        // SAFETY: `ensure_buffer` returns a buffer from the manager's arena,
        // which outlives the context's manager handle.
        let buf = unsafe { &*ptr };
        let snap = buf.make_ref();
        Self {
            ctx,
            buffer: ptr,
            base: snap.base,
            count: snap.count,
            next_check: snap.next_check,
            capacity: buf.capacity(),
            batch: buf.batch_period(),
        }
    }

    /// Events appended into the current buffer so far.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    // ------------------------------------------------------------------
    // Shim table: one entry per (read|write) x {1,2,4,8} bytes.
    // ------------------------------------------------------------------

    /// Log a 1-byte store.
    #[inline(always)]
    pub fn write1(&mut self, pc: u64, addr: u64, value: u64) {
        self.log_access(true, AccessSize::B1, pc, addr, value);
    }

    /// Log a 2-byte store.
    #[inline(always)]
    pub fn write2(&mut self, pc: u64, addr: u64, value: u64) {
        self.log_access(true, AccessSize::B2, pc, addr, value);
    }

    /// Log a 4-byte store.
    #[inline(always)]
    pub fn write4(&mut self, pc: u64, addr: u64, value: u64) {
        self.log_access(true, AccessSize::B4, pc, addr, value);
    }

    /// Log an 8-byte store.
    #[inline(always)]
    pub fn write8(&mut self, pc: u64, addr: u64, value: u64) {
        self.log_access(true, AccessSize::B8, pc, addr, value);
    }

    /// Log a 1-byte load.
    #[inline(always)]
    pub fn read1(&mut self, pc: u64, addr: u64, value: u64) {
        self.log_access(false, AccessSize::B1, pc, addr, value);
    }

    /// Log a 2-byte load.
    #[inline(always)]
    pub fn read2(&mut self, pc: u64, addr: u64, value: u64) {
        self.log_access(false, AccessSize::B2, pc, addr, value);
    }

    /// Log a 4-byte load.
    #[inline(always)]
    pub fn read4(&mut self, pc: u64, addr: u64, value: u64) {
        self.log_access(false, AccessSize::B4, pc, addr, value);
    }

    /// Log an 8-byte load.
    #[inline(always)]
    pub fn read8(&mut self, pc: u64, addr: u64, value: u64) {
        self.log_access(false, AccessSize::B8, pc, addr, value);
    }

    /// Log a cycle-counter sample.
    #[inline(always)]
    pub fn timestamp(&mut self, cycles: u64) {
        self.append_word(encode_timestamp(cycles));
    }

    #[inline(always)]
    fn log_access(&mut self, is_write: bool, size: AccessSize, pc: u64, addr: u64, value: u64) {
        self.append_word(encode_mem_access(is_write, size, pc, addr, value));
    }

    /// The canonical fast path.
    #[inline(always)]
    fn append_word(&mut self, word: u64) {
        let cur = self.ctx.slot_load();
        // SAFETY: `count` stays strictly below `capacity + batch + 1` (the
        // storage length): `next_check` never exceeds `count + batch` and
        // the slow path runs before `count` passes it.
        unsafe { self.base.add(self.count).write(word) };
        self.count += 1;
        if self.count >= self.next_check || cur.is_null() {
            self.reload(cur);
        }
    }

    /// Everything that happens at most once per batch period. Cold and
    /// out-of-line so the fast path's register allocation stays clean.
    #[cold]
    #[inline(never)]
    fn reload(&mut self, cur: *mut EventBuffer) {
        if cur.is_null() {
            // Revoked: the word just written stays in the old buffer (one-
            // event straddle); the fresh buffer starts empty.
            self.rotate();
            return;
        }

        if self.count >= self.capacity {
            let observed = unsafe { &*self.buffer }.epoch();
            // Win or lose, the slot is null afterwards and the old buffer
            // belongs to the closing epoch.
            let _ = self.ctx.manager().try_advance_epoch(observed);
            self.rotate();
            return;
        }

        self.next_check += self.batch;
        prefetch_batch(self.base, self.count, self.batch);
    }

    /// Flush the old buffer, pick up a fresh one, rebind the snapshot.
    fn rotate(&mut self) {
        // SAFETY: the buffer pointer came from `allocate` and the manager's
        // arena keeps it alive.
        unsafe { &*self.buffer }.flush(self.count, self.next_check);
        debug_assert!(self.ctx.slot_load().is_null());

        // `ensure_buffer` closes the flushed buffer (the slot is null) and
        // allocates the replacement.
        let ptr = self.ctx.ensure_buffer();
        let buf = unsafe { &*ptr };
        let snap = buf.make_ref();
        self.buffer = ptr;
        self.base = snap.base;
        self.count = snap.count;
        self.next_check = snap.next_check;
        debug_assert_eq!(self.count, 0);
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let buf = unsafe { &*self.buffer };
        buf.flush(self.count, self.next_check);
        if self.ctx.slot_load() != self.buffer {
            // Revoked while held: complete the handoff so the epoch's
            // worker stops waiting, and make sure the exit hook does not
            // re-close a buffer that may get recycled meanwhile.
            buf.close();
            self.ctx.forget_current();
        }
    }
}

/// Advisory write-prefetch of the next batch of event slots, all cache
/// levels, two batches ahead. Never load-bearing; a hint at most.
#[inline(always)]
fn prefetch_batch(base: *mut u64, next: usize, batch: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_ET0};
        const EVENTS_PER_LINE: usize = 64 / 8;
        let lines = batch / EVENTS_PER_LINE;
        let distance = 2 * batch;
        for i in 0..lines {
            // wrapping_add: the prefetch window may extend past the tail
            // pad near capacity; PREFETCH never faults and the pointer is
            // never dereferenced.
            let pos = base.wrapping_add(next + distance + i * EVENTS_PER_LINE);
            unsafe { _mm_prefetch(pos as *const i8, _MM_HINT_ET0) };
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (base, next, batch);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::event::{decode, Event};
    use crate::manager::{AdvanceOutcome, BufferManager};
    use crate::sink::{BufferView, EpochSink, NullSink};

    /// Sink that parks its worker until the test opens the gate, keeping
    /// delivered buffers out of the free pool while assertions run.
    struct GateSink(std::sync::Mutex<bool>, std::sync::Condvar);

    impl GateSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(std::sync::Mutex::new(false), std::sync::Condvar::new()))
        }

        fn open(&self) {
            *self.0.lock().unwrap() = true;
            self.1.notify_all();
        }
    }

    impl EpochSink for GateSink {
        fn consume(&self, _epoch: u64, _buffers: &[BufferView<'_>]) {
            let mut open = self.0.lock().unwrap();
            while !*open {
                open = self.1.wait(open).unwrap();
            }
        }
    }

    fn small_manager(max_workers: usize) -> Arc<BufferManager> {
        BufferManager::new(
            LogConfig {
                events_per_buffer: 64,
                batch_period: 8,
                max_workers,
            },
            Arc::new(NullSink),
        )
    }

    fn writer_on(mgr: &Arc<BufferManager>) -> (LogWriter, Arc<ThreadContext>) {
        let ctx = ThreadContext::register(Arc::clone(mgr));
        (LogWriter::for_context(Arc::clone(&ctx)), ctx)
    }

    #[test]
    fn appends_encode_in_order() {
        let mgr = small_manager(0);
        let (mut w, ctx) = writer_on(&mgr);

        w.write8(0x100, 0xAAAA, 1);
        w.read4(0x101, 0xBBBB, 2);
        w.timestamp(0xCCCC_DDDD);
        assert_eq!(w.count(), 3);
        drop(w);

        let buf = unsafe { &*ctx.ensure_buffer() };
        assert_eq!(buf.count(), 3, "drop flushes the local count");
        let events = unsafe { buf.events() };
        assert!(matches!(
            decode(events[0]),
            Event::MemAccess { is_write: true, size: AccessSize::B8, .. }
        ));
        assert!(matches!(
            decode(events[1]),
            Event::MemAccess { is_write: false, size: AccessSize::B4, .. }
        ));
        assert_eq!(decode(events[2]), Event::Timestamp { cycles_lo: 0xCCCC_DDDD });
    }

    #[test]
    fn next_check_ladder_stays_within_pad() {
        let mgr = small_manager(0);
        let (mut w, _ctx) = writer_on(&mgr);

        // Drive through several reload periods without reaching capacity.
        for i in 0..40u64 {
            w.write8(1, i, i);
        }
        assert_eq!(w.count(), 40);
        // next_check moved up the B-ladder past count.
        assert!(w.next_check > w.count);
        assert!(w.next_check <= w.count + 8);
    }

    #[test]
    fn capacity_triggers_epoch_advance() {
        let mgr = small_manager(0);
        let (mut w, _ctx) = writer_on(&mgr);

        for i in 0..64u64 {
            w.write8(1, i, i);
        }
        // The 64th append hit next_check == capacity, advanced the epoch,
        // and rebound the writer to a fresh buffer.
        assert_eq!(w.count(), 0);
        let stats = mgr.stats();
        assert_eq!(stats.epoch, 1);
        assert_eq!(stats.epochs_advanced, 1);
        assert_eq!(stats.allocated_buffers, 1, "only the fresh buffer");

        // In drop mode the full buffer went to the pool, was closed during
        // the rotation, and came straight back as the fresh buffer.
        assert_eq!(stats.buffers_created, 1);
        assert_eq!(stats.buffers_recycled, 1);
        assert_eq!(stats.free_buffers, 0);

        w.write8(1, 99, 99);
        assert_eq!(w.count(), 1);
    }

    #[test]
    fn full_buffer_delivers_exactly_capacity_events() {
        struct Recording(std::sync::Mutex<Vec<(u64, u32, usize)>>);
        impl crate::sink::EpochSink for Recording {
            fn consume(&self, epoch: u64, buffers: &[crate::sink::BufferView<'_>]) {
                let mut log = self.0.lock().unwrap();
                for b in buffers {
                    log.push((epoch, b.thread_id(), b.len()));
                }
            }
        }

        let sink = Arc::new(Recording(std::sync::Mutex::new(Vec::new())));
        let mgr = BufferManager::new(
            LogConfig {
                events_per_buffer: 64,
                batch_period: 8,
                max_workers: 1,
            },
            sink.clone(),
        );
        let (mut w, ctx) = writer_on(&mgr);

        for i in 0..64u64 {
            w.write8(1, i, i);
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while mgr.stats().active_workers > 0 || sink.0.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline, "epoch never delivered");
            std::thread::yield_now();
        }

        let log = sink.0.lock().unwrap();
        assert_eq!(log.as_slice(), &[(0, ctx.thread_id(), 64)]);
    }

    #[test]
    fn revocation_rotates_within_one_append() {
        // Gate the worker so the revoked buffer stays un-recycled while the
        // assertions read it.
        let gate = GateSink::new();
        let mgr = BufferManager::new(
            LogConfig {
                events_per_buffer: 64,
                batch_period: 8,
                max_workers: 1,
            },
            gate.clone(),
        );
        let (mut w, _ctx) = writer_on(&mgr);

        for i in 0..10u64 {
            w.write8(1, i, i);
        }
        let old = w.buffer;

        // Another thread wins the epoch race and revokes us.
        assert_eq!(mgr.try_advance_epoch(0), AdvanceOutcome::Won);

        // The very next append notices the null slot; the straddling word
        // stays in the old buffer.
        w.write8(1, 10, 10);
        assert_ne!(w.buffer, old);
        assert_eq!(w.count(), 0);

        {
            let old = unsafe { &*old };
            assert!(old.is_closed());
            assert_eq!(old.count(), 11, "10 appends plus the straddling event");
        }
        gate.open();
    }

    #[test]
    fn drop_after_revocation_closes_old_buffer() {
        let mgr = small_manager(0);
        let (mut w, ctx) = writer_on(&mgr);
        w.write8(1, 2, 3);
        let old = w.buffer;

        assert_eq!(mgr.try_advance_epoch(0), AdvanceOutcome::Won);
        drop(w);

        let old_buf = unsafe { &*old };
        assert!(old_buf.is_closed(), "drop completes the handoff");
        assert_eq!(old_buf.count(), 1);

        // Context exit must not re-close the recycled buffer.
        drop(ctx);
    }

    #[test]
    fn writer_reattach_resumes_count() {
        let mgr = small_manager(0);
        let ctx = ThreadContext::register(Arc::clone(&mgr));

        let mut w = LogWriter::for_context(Arc::clone(&ctx));
        w.write8(1, 2, 3);
        w.write8(1, 2, 3);
        drop(w);

        let w = LogWriter::for_context(Arc::clone(&ctx));
        assert_eq!(w.count(), 2, "reattach picks up the flushed snapshot");
    }
}
