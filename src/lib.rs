//! Hot-path event-logging runtime for dynamic race detection.
//!
//! Instrumented code appends one fixed-width 64-bit event word per memory
//! access, at a cost of a handful of cycles per event. Every application
//! thread logs into its own fixed-size buffer through a register-resident
//! reference; a shared manager recycles buffers in epochs and hands each
//! finished epoch to a detached worker for offline analysis.
//!
//! High-level flow (one producer):
//! 1) A shim ([`LogWriter::write8`] and friends) encodes the access and
//!    stores it through the thread's cached buffer reference.
//! 2) Every batch period the slow path re-reads the thread's live buffer
//!    slot and refreshes the reference.
//! 3) When a buffer fills, its producer races to advance the epoch: the
//!    winner revokes every thread's slot and hands the epoch's buffers to
//!    a worker; everyone re-allocates and keeps logging.
//! 4) Workers wait for each buffer's `closed` flag, drain the events, and
//!    return the buffers to the free pool.
//!
//! Per-thread event order is exact; across threads only epoch boundaries
//! order events. Under worker backlog whole epochs are dropped rather than
//! stalling producers.
//!
//! # Module map
//!
//! - [`event`]: 64-bit event word codec.
//! - [`buffer`]: fixed-capacity append region and the per-thread live slot.
//! - [`context`]: per-thread identity, lazy registration, exit hook.
//! - [`manager`]: allocation, epoch advancement, revocation, dispatch.
//! - [`logger`]: the shim table and the fast/slow path split.
//! - [`sink`]: consumer contract and the worker main loop.
//! - [`config`]: build-time knobs, validated once.

pub mod buffer;
pub mod config;
pub mod context;
pub mod event;
pub mod logger;
pub mod manager;
pub mod sink;

pub use buffer::{EventBuffer, LiveSlot, UNASSIGNED_EPOCH, UNASSIGNED_THREAD};
pub use config::{LogConfig, DEFAULT_BATCH_PERIOD, DEFAULT_EVENTS_PER_BUFFER};
pub use context::{current_context, init_runtime, runtime, ThreadContext};
pub use event::{decode, encode_mem_access, encode_timestamp, AccessSize, Event};
pub use logger::LogWriter;
pub use manager::{AdvanceOutcome, BufferManager, QuiesceReport, StatsSnapshot};
pub use sink::{BufferView, CountingSink, EpochSink, NullSink};
