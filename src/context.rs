//! Per-thread identity and lifecycle.
//!
//! A [`ThreadContext`] is created lazily the first time a thread touches the
//! logging runtime. It owns the thread's live buffer slot (shared with the
//! manager for revocation), remembers the last buffer the thread was
//! assigned, and runs the exit hook when the thread's TLS is torn down:
//! close the current buffer so no worker spins on it forever, then
//! deregister the slot.
//!
//! Contexts are deliberately not `Sync`: everything except the slot is
//! producer-thread-private, and writers enforce the single-producer rule by
//! holding the context `Arc` on the thread that created it.

use std::cell::{Cell, OnceCell};
use std::ptr;
use std::sync::{Arc, OnceLock};

use tracing::trace;

use crate::buffer::{EventBuffer, LiveSlot};
use crate::config::LogConfig;
use crate::manager::BufferManager;
use crate::sink::{EpochSink, NullSink};

/// Per-thread logging state.
pub struct ThreadContext {
    /// Dense process-wide thread ID.
    thread_id: u32,

    /// This thread's live buffer slot. The manager holds a clone for
    /// revocation; the address is stable for the thread's lifetime.
    slot: Arc<LiveSlot>,

    /// Shared manager. Non-owning in spirit — the manager is process-wide —
    /// but the `Arc` keeps the buffer arena alive for as long as this
    /// thread can still hold raw buffer pointers.
    manager: Arc<BufferManager>,

    /// Most recent buffer assigned to this thread. Producer-thread-private;
    /// cleared whenever the buffer may leave the producer's ownership, so
    /// the exit hook never closes a buffer that was already recycled.
    current: Cell<*mut EventBuffer>,
}

impl ThreadContext {
    /// Register the calling thread with `manager`.
    ///
    /// No buffer is assigned yet; the first
    /// [`LogWriter`](crate::LogWriter) attachment allocates one.
    pub fn register(manager: Arc<BufferManager>) -> Arc<Self> {
        let thread_id = manager.next_thread_id();
        trace!(thread_id, "thread context registered");
        Arc::new(Self {
            thread_id,
            slot: Arc::new(LiveSlot::new()),
            manager,
            current: Cell::new(ptr::null_mut()),
        })
    }

    /// This thread's dense ID.
    #[inline]
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    #[inline]
    pub(crate) fn manager(&self) -> &Arc<BufferManager> {
        &self.manager
    }

    /// Hot-path read of the live slot.
    #[inline(always)]
    pub(crate) fn slot_load(&self) -> *mut EventBuffer {
        self.slot.load()
    }

    /// Return the thread's current buffer, allocating one if the slot is
    /// null (first use, or the old buffer was revoked).
    ///
    /// On the revocation path this also closes the old buffer: its count
    /// was flushed when the writer dropped or took its slow-path turn, so
    /// closing here is what releases the waiting worker.
    pub(crate) fn ensure_buffer(&self) -> *mut EventBuffer {
        let cur = self.slot.load();
        if !cur.is_null() {
            debug_assert_eq!(cur, self.current.get());
            return cur;
        }
        self.close_current();
        let ptr = self.manager.allocate(&self.slot, self.thread_id);
        self.current.set(ptr);
        ptr
    }

    /// Close the remembered buffer, if any, and forget it.
    fn close_current(&self) {
        let old = self.current.replace(ptr::null_mut());
        if !old.is_null() {
            // SAFETY: the manager's arena (allocated set, worker batches,
            // free pool) keeps every handed-out buffer alive while this
            // context holds the manager `Arc`, and `close` is the
            // producer's own single-writer transition.
            unsafe { (*old).close() };
        }
    }

    /// Forget the remembered buffer without closing it. Used by a writer
    /// that already closed the buffer itself (revocation noticed at drop).
    pub(crate) fn forget_current(&self) {
        self.current.set(ptr::null_mut());
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        // Producer-side half of the exit protocol: close the buffer this
        // thread will never write again, then deregister the slot so the
        // next revocation sweep does not touch freed TLS.
        self.close_current();
        self.manager.thread_exit(&self.slot);
    }
}

// ============================================================================
// Process-wide runtime
// ============================================================================

static RUNTIME: OnceLock<Arc<BufferManager>> = OnceLock::new();

/// Install the process-wide runtime. Returns false if one is already
/// installed (first caller wins, matching the lazy default).
pub fn init_runtime(config: LogConfig, sink: Arc<dyn EpochSink>) -> bool {
    RUNTIME.set(BufferManager::new(config, sink)).is_ok()
}

/// The process-wide manager, creating a default (null-sink) one on first
/// touch if the host never called [`init_runtime`].
pub fn runtime() -> &'static Arc<BufferManager> {
    RUNTIME.get_or_init(|| BufferManager::new(LogConfig::default(), Arc::new(NullSink)))
}

thread_local! {
    /// Lazily-created context for this thread. Dropping it at thread exit
    /// runs the exit hook.
    static CONTEXT: OnceCell<Arc<ThreadContext>> = const { OnceCell::new() };
}

/// The calling thread's context, registering it with the process-wide
/// runtime on first use.
pub fn current_context() -> Arc<ThreadContext> {
    CONTEXT.with(|cell| {
        Arc::clone(cell.get_or_init(|| ThreadContext::register(Arc::clone(runtime()))))
    })
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::sink::NullSink;
    use std::time::{Duration, Instant};

    fn small_manager() -> Arc<BufferManager> {
        BufferManager::new(
            LogConfig {
                events_per_buffer: 64,
                batch_period: 8,
                max_workers: 1,
            },
            Arc::new(NullSink),
        )
    }

    #[test]
    fn ids_are_dense() {
        let mgr = small_manager();
        let a = ThreadContext::register(Arc::clone(&mgr));
        let b = ThreadContext::register(Arc::clone(&mgr));
        assert_eq!(a.thread_id() + 1, b.thread_id());
    }

    #[test]
    fn ensure_buffer_allocates_once() {
        let mgr = small_manager();
        let ctx = ThreadContext::register(Arc::clone(&mgr));
        let first = ctx.ensure_buffer();
        let again = ctx.ensure_buffer();
        assert_eq!(first, again);
        assert_eq!(mgr.stats().allocated_buffers, 1);
    }

    #[test]
    fn revoked_buffer_closed_on_reentry() {
        // Sink that parks the worker until the gate opens, so the revoked
        // buffer cannot be recycled while the test reads it.
        struct Gate(std::sync::Mutex<bool>, std::sync::Condvar);
        impl crate::sink::EpochSink for Gate {
            fn consume(&self, _epoch: u64, _buffers: &[crate::sink::BufferView<'_>]) {
                let mut open = self.0.lock().unwrap();
                while !*open {
                    open = self.1.wait(open).unwrap();
                }
            }
        }

        let gate = Arc::new(Gate(std::sync::Mutex::new(false), std::sync::Condvar::new()));
        let mgr = BufferManager::new(
            LogConfig {
                events_per_buffer: 64,
                batch_period: 8,
                max_workers: 1,
            },
            gate.clone(),
        );
        let ctx = ThreadContext::register(Arc::clone(&mgr));
        let first = ctx.ensure_buffer();

        assert_eq!(
            mgr.try_advance_epoch(0),
            crate::manager::AdvanceOutcome::Won
        );
        assert!(ctx.slot_load().is_null());

        let second = ctx.ensure_buffer();
        assert_ne!(first, second);
        assert!(unsafe { &*first }.is_closed(), "re-entry closes the old buffer");

        *gate.0.lock().unwrap() = true;
        gate.1.notify_all();
    }

    #[test]
    fn drop_closes_current_and_deregisters() {
        let mgr = small_manager();
        let ctx = ThreadContext::register(Arc::clone(&mgr));
        let ptr = ctx.ensure_buffer();
        drop(ctx);

        assert!(unsafe { &*ptr }.is_closed());
        let stats = mgr.stats();
        assert_eq!(stats.live_slots, 0);
        assert_eq!(stats.threads_exited, 1);
    }

    #[test]
    fn exit_on_untouched_thread_is_a_noop() {
        let mgr = small_manager();
        let ctx = ThreadContext::register(Arc::clone(&mgr));
        drop(ctx); // never allocated: nothing to close, nothing delivered
        let stats = mgr.stats();
        assert_eq!(stats.allocated_buffers, 0);
        assert_eq!(stats.threads_exited, 1);
    }

    #[test]
    fn tls_context_exit_hook_runs() {
        // The process-wide runtime path: a thread that touches the TLS
        // context and exits must deregister itself.
        let before = runtime().stats().threads_exited;
        std::thread::spawn(|| {
            let _ctx = current_context();
        })
        .join()
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while runtime().stats().threads_exited == before {
            assert!(Instant::now() < deadline, "exit hook never ran");
            std::thread::yield_now();
        }
    }
}
