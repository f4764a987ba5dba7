//! Buffer manager: allocation, epoch advancement, revocation, dispatch.
//!
//! # Design
//!
//! One manager coordinates all producers and workers. Every operation runs
//! under a single monitor lock — the hot path never enters it, only the
//! amortized slow path does, so contention is bounded by the number of
//! producers concurrently taking their slow-path turns.
//!
//! ```text
//!            allocate                    try_advance_epoch
//! producer ────────────> live buffer ──────────────────────┐
//!     ^                                                    │ revoke slots,
//!     │                                                    │ hand batch off
//!     │    free pool <── release <── worker <──────────────┘
//!     └──────────────────────────────────────── (reset + reuse)
//! ```
//!
//! # Epoch tie-breaking
//!
//! `try_advance_epoch` is serialized by the monitor and predicated on the
//! caller's observed epoch matching the manager's, so exactly one producer
//! wins each advance. Losers find their live slot already nulled by the
//! winner's revocation sweep and simply re-enter through `allocate`.
//!
//! # Backpressure
//!
//! Worker dispatch is bounded by `max_workers`. When an epoch closes while
//! the cap is reached, that epoch's buffers are recycled unprocessed:
//! producers lose no progress, the analyzer loses one epoch. The drop is
//! counted and logged, never raised as an error.
//!
//! # Recycling discipline
//!
//! A buffer re-enters circulation only after its last producer's `closed`
//! flag is visible: storage ownership passes producer → worker → free pool,
//! and a dropped (never-consumed) buffer sits in the pool un-recyclable
//! until its producer's next slow-path turn closes it. `fresh_buffer` scans
//! for a closed pool entry and falls back to heap allocation, so a
//! pathological backlog grows the pool instead of corrupting a live buffer.

use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::buffer::{EventBuffer, LiveSlot};
use crate::config::LogConfig;
use crate::sink::{self, BufferView, EpochSink};

/// Result of a producer's attempt to advance the epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// This producer performed the advance and must re-allocate.
    Won,
    /// Another producer advanced first; the caller's slot is already
    /// revoked and it must re-allocate.
    Lost,
}

/// Outcome of a [`BufferManager::quiesce`] call.
#[derive(Clone, Copy, Debug, Default)]
pub struct QuiesceReport {
    /// Buffers of the final epoch delivered to the sink.
    pub delivered: usize,
    /// Buffers whose producers had not closed them before the deadline;
    /// recycled without delivery.
    pub dropped: usize,
    /// Whether all in-flight workers finished before the deadline.
    pub workers_drained: bool,
}

/// Always-on operational counters, maintained under the monitor.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    /// Current epoch number.
    pub epoch: u64,
    /// Epoch advances performed (including the quiesce advance).
    pub epochs_advanced: u64,
    /// Epochs handed to a worker.
    pub epochs_dispatched: u64,
    /// Epochs recycled unprocessed because the worker cap was reached.
    pub epochs_dropped: u64,
    /// Buffers heap-allocated.
    pub buffers_created: u64,
    /// Buffers reused from the free pool.
    pub buffers_recycled: u64,
    /// Events handed to the sink (summed at release/quiesce).
    pub events_delivered: u64,
    /// Thread IDs handed out so far.
    pub threads_registered: u64,
    /// Threads that have run their exit hook.
    pub threads_exited: u64,
    /// Free-pool size right now.
    pub free_buffers: usize,
    /// Buffers handed out in the current epoch.
    pub allocated_buffers: usize,
    /// Live slots participating in the current epoch.
    pub live_slots: usize,
    /// Currently running workers.
    pub active_workers: usize,
}

#[derive(Default)]
struct Counters {
    epochs_advanced: u64,
    epochs_dispatched: u64,
    epochs_dropped: u64,
    buffers_created: u64,
    buffers_recycled: u64,
    events_delivered: u64,
    threads_exited: u64,
}

/// Monitor-protected state. All fields are touched only under the lock.
struct ManagerState {
    /// Definitive current epoch.
    epoch: u64,
    /// Recyclable buffers. Entries may still be unclosed shortly after a
    /// dropped epoch; `fresh_buffer` skips those.
    free: Vec<Arc<EventBuffer>>,
    /// Buffers handed out in the current epoch, in handoff order.
    allocated: Vec<Arc<EventBuffer>>,
    /// Live slots of every thread participating in the current epoch.
    live_slots: Vec<Arc<LiveSlot>>,
    /// Workers currently running; bounded by `config.max_workers`.
    active_workers: usize,
    stats: Counters,
}

/// Coordinates buffer hand-out, epoch advancement, and worker dispatch.
///
/// Shared process-wide behind an `Arc`; thread contexts borrow it without
/// owning it, and the buffer arena (free pool + allocated set + in-flight
/// worker batches) keeps every handed-out buffer alive for as long as any
/// producer can still hold a pointer to it.
pub struct BufferManager {
    config: LogConfig,
    sink: Arc<dyn EpochSink>,
    /// Back-reference handed to spawned workers so they can report in.
    me: Weak<BufferManager>,
    /// Dense thread-ID generator. Relaxed fetch-add; the only global atomic
    /// besides the epoch, which lives under the monitor.
    next_thread_id: AtomicU32,
    state: Mutex<ManagerState>,
}

impl BufferManager {
    /// Build a manager. Panics if `config` is invalid.
    pub fn new(config: LogConfig, sink: Arc<dyn EpochSink>) -> Arc<Self> {
        config.validate();
        Arc::new_cyclic(|me| Self {
            config,
            sink,
            me: me.clone(),
            next_thread_id: AtomicU32::new(0),
            state: Mutex::new(ManagerState {
                epoch: 0,
                free: Vec::new(),
                allocated: Vec::new(),
                live_slots: Vec::new(),
                active_workers: 0,
                stats: Counters::default(),
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub(crate) fn sink(&self) -> &dyn EpochSink {
        &*self.sink
    }

    /// Hand out the next dense thread ID.
    pub(crate) fn next_thread_id(&self) -> u32 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        // A poisoned monitor means a panic inside the runtime itself; the
        // state is counters and pools, all valid at every await-free point,
        // so continuing is strictly better than wedging every producer.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Assign a buffer to `slot` for the current epoch.
    ///
    /// Precondition: the slot is currently null (first use, post-revocation,
    /// or post-exit re-entry). Publishes the buffer into the slot with
    /// Release ordering and registers the slot for revocation at the next
    /// epoch boundary. Returns the raw buffer pointer; the caller uses the
    /// return value, not a slot re-read, so the monitor's unlock orders the
    /// buffer contents for it.
    pub(crate) fn allocate(&self, slot: &Arc<LiveSlot>, thread_id: u32) -> *mut EventBuffer {
        let mut st = self.lock();
        debug_assert!(slot.load().is_null(), "allocate with a live slot");
        debug_assert!(
            !st.live_slots.iter().any(|s| Arc::ptr_eq(s, slot)),
            "slot already registered in this epoch"
        );

        let buf = Self::fresh_buffer(&mut st, &self.config);
        buf.assign(thread_id, st.epoch);
        let ptr = Arc::as_ptr(&buf) as *mut EventBuffer;
        slot.publish(ptr);
        st.live_slots.push(Arc::clone(slot));
        st.allocated.push(buf);
        trace!(thread_id, epoch = st.epoch, "buffer assigned");
        ptr
    }

    /// Pop a recyclable buffer or allocate a new one. Caller holds the lock.
    fn fresh_buffer(st: &mut ManagerState, config: &LogConfig) -> Arc<EventBuffer> {
        // Scan newest-first: recently released buffers are cache-warm.
        // Unclosed entries (dropped epochs whose producers have not taken
        // their slow-path turn yet) are skipped, not waited on.
        for i in (0..st.free.len()).rev() {
            if st.free[i].is_closed() {
                let buf = st.free.swap_remove(i);
                buf.reset();
                st.stats.buffers_recycled += 1;
                return buf;
            }
        }
        st.stats.buffers_created += 1;
        Arc::new(EventBuffer::new(config))
    }

    /// Close the current epoch if it still matches `observed_epoch`.
    ///
    /// The winner revokes every live slot (relaxed null stores — producers
    /// re-check on their next append), hands the epoch's buffers to a
    /// worker (or recycles them when the worker cap is reached), and bumps
    /// the epoch. Exactly one caller wins per epoch value; the rest observe
    /// `Lost` and re-enter through `allocate`.
    pub fn try_advance_epoch(&self, observed_epoch: u64) -> AdvanceOutcome {
        let mut st = self.lock();
        if st.epoch != observed_epoch {
            return AdvanceOutcome::Lost;
        }

        for slot in st.live_slots.drain(..) {
            slot.revoke();
        }

        let batch = mem::take(&mut st.allocated);
        self.dispatch(&mut st, batch);

        st.epoch += 1;
        st.stats.epochs_advanced += 1;
        AdvanceOutcome::Won
    }

    /// Hand a reclaimed batch to a worker, or recycle it when saturated.
    /// Caller holds the lock.
    fn dispatch(&self, st: &mut ManagerState, batch: Vec<Arc<EventBuffer>>) {
        if batch.is_empty() {
            return;
        }
        let epoch = st.epoch;

        if st.active_workers >= self.config.max_workers {
            warn!(
                epoch,
                buffers = batch.len(),
                active_workers = st.active_workers,
                "worker cap reached; dropping epoch"
            );
            st.stats.epochs_dropped += 1;
            st.free.extend(batch);
            return;
        }

        // Upgrading cannot fail: every caller reaches us through a strong
        // handle.
        let manager = self.me.upgrade().expect("manager called without a strong handle");
        let spawned = thread::Builder::new()
            .name(format!("fastlog-epoch-{epoch}"))
            .spawn({
                let batch = batch.clone();
                move || sink::worker_main(manager, epoch, batch)
            });

        match spawned {
            Ok(handle) => {
                drop(handle); // detached; the worker reports back via release()
                st.active_workers += 1;
                st.stats.epochs_dispatched += 1;
                debug!(epoch, buffers = batch.len(), "epoch handed to worker");
            }
            Err(err) => {
                // Same treatment as saturation: keep producing, lose the epoch.
                warn!(epoch, %err, "worker spawn failed; dropping epoch");
                st.stats.epochs_dropped += 1;
                st.free.extend(batch);
            }
        }
    }

    /// Return a worker's finished batch to the free pool.
    pub(crate) fn release(&self, buffers: Vec<Arc<EventBuffer>>) {
        let events: u64 = buffers.iter().map(|b| b.count() as u64).sum();
        let mut st = self.lock();
        debug_assert!(st.active_workers > 0);
        st.active_workers -= 1;
        st.stats.events_delivered += events;
        st.free.extend(buffers);
    }

    /// Exit hook for a thread context: deregister its slot.
    ///
    /// The producer closes its current buffer before calling this, on its
    /// own thread; the buffer itself stays in `allocated` and is delivered
    /// at the next epoch advance or at quiesce.
    pub(crate) fn thread_exit(&self, slot: &Arc<LiveSlot>) {
        let mut st = self.lock();
        st.live_slots.retain(|s| !Arc::ptr_eq(s, slot));
        slot.revoke();
        st.stats.threads_exited += 1;
        trace!("thread deregistered");
    }

    /// Final flush: revoke every live slot, deliver the closing epoch's
    /// buffers synchronously, and wait for in-flight workers to drain.
    ///
    /// Buffers whose producers do not close them before the deadline (a
    /// thread idle mid-epoch takes no further slow-path turns) are recycled
    /// undelivered and counted in the report. Producers that keep logging
    /// simply re-enter the post-quiesce epoch.
    pub fn quiesce(&self, timeout: Duration) -> QuiesceReport {
        let deadline = Instant::now() + timeout;

        let (epoch, batch) = {
            let mut st = self.lock();
            for slot in st.live_slots.drain(..) {
                slot.revoke();
            }
            let batch = mem::take(&mut st.allocated);
            let epoch = st.epoch;
            st.epoch += 1;
            st.stats.epochs_advanced += 1;
            (epoch, batch)
        };

        let mut ready = Vec::with_capacity(batch.len());
        let mut unready = Vec::new();
        for buf in batch {
            if sink::wait_closed_until(&buf, deadline) {
                ready.push(buf);
            } else {
                unready.push(buf);
            }
        }

        let mut report = QuiesceReport {
            delivered: ready.len(),
            dropped: unready.len(),
            workers_drained: false,
        };

        let events: u64 = ready.iter().map(|b| b.count() as u64).sum();
        if !ready.is_empty() {
            let views: Vec<BufferView<'_>> = ready.iter().map(|b| BufferView::new(b)).collect();
            self.sink.consume(epoch, &views);
        }
        debug!(
            epoch,
            delivered = report.delivered,
            dropped = report.dropped,
            "quiesce delivered final epoch"
        );

        {
            let mut st = self.lock();
            st.stats.events_delivered += events;
            if report.dropped > 0 {
                st.stats.epochs_dropped += 1;
            } else if report.delivered > 0 {
                st.stats.epochs_dispatched += 1;
            }
            st.free.extend(ready);
            st.free.extend(unready);
        }

        report.workers_drained = loop {
            if self.lock().active_workers == 0 {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            thread::yield_now();
        };

        report
    }

    /// Point-in-time copy of the operational counters and pool sizes.
    pub fn stats(&self) -> StatsSnapshot {
        let st = self.lock();
        StatsSnapshot {
            epoch: st.epoch,
            epochs_advanced: st.stats.epochs_advanced,
            epochs_dispatched: st.stats.epochs_dispatched,
            epochs_dropped: st.stats.epochs_dropped,
            buffers_created: st.stats.buffers_created,
            buffers_recycled: st.stats.buffers_recycled,
            events_delivered: st.stats.events_delivered,
            threads_registered: self.next_thread_id.load(Ordering::Relaxed) as u64,
            threads_exited: st.stats.threads_exited,
            free_buffers: st.free.len(),
            allocated_buffers: st.allocated.len(),
            live_slots: st.live_slots.len(),
            active_workers: st.active_workers,
        }
    }
}
