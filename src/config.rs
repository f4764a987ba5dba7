//! Runtime configuration for the logging runtime.
//!
//! All knobs are fixed at construction time; there are no environment
//! variables, flags, or config files. A [`LogConfig`] is validated once when
//! the buffer manager is built and is immutable afterwards.

use std::thread;

/// Default number of events per buffer (8 MB of event words).
///
/// At ~1ns per logged event a producer takes on the order of a millisecond
/// to fill a buffer, which keeps epoch turnover well below human-visible
/// latency while amortizing the epoch-advance cost over a million appends.
pub const DEFAULT_EVENTS_PER_BUFFER: usize = 1 << 20;

/// Default batch period: number of fast-path appends between two slow-path
/// entries. 64 events is eight cache lines of log, small enough that a
/// revoked producer is noticed promptly and large enough that the reload
/// cost disappears into the noise.
pub const DEFAULT_BATCH_PERIOD: usize = 64;

/// Configuration for a [`BufferManager`](crate::BufferManager).
///
/// # Sizing guidelines
///
/// - `events_per_buffer`: bounds per-producer memory (`8 * (N + B + 1)`
///   bytes) and sets the epoch length. Bigger buffers mean fewer epoch
///   advances but more memory held per live thread.
/// - `batch_period`: the slow path runs once per `batch_period` appends, so
///   its cost is amortized by this factor. Keep it a small multiple of a
///   cache line's worth of events (8).
/// - `max_workers`: cap on concurrently running consumer threads. When an
///   epoch closes while `max_workers` workers are still busy, that epoch's
///   buffers are recycled unprocessed instead of queuing without bound.
#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    /// Events a buffer holds before its producer must advance the epoch.
    pub events_per_buffer: usize,

    /// Appends between two slow-path entries.
    ///
    /// Buffers carry a tail pad of `batch_period + 1` words, so appends that
    /// land between the capacity mark and the next slow-path entry never
    /// overflow the storage.
    pub batch_period: usize,

    /// Maximum number of concurrently active worker threads.
    ///
    /// `0` is legal and turns the runtime into a pure drop-mode recorder:
    /// every epoch's buffers are recycled without being consumed.
    pub max_workers: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            events_per_buffer: DEFAULT_EVENTS_PER_BUFFER,
            batch_period: DEFAULT_BATCH_PERIOD,
            max_workers: thread::available_parallelism().map_or(4, |n| n.get()),
        }
    }
}

impl LogConfig {
    /// Validate the configuration. Panics on invalid values.
    ///
    /// # Invariants checked
    ///
    /// - `events_per_buffer > 0`: a zero-capacity buffer can never trigger
    ///   an epoch advance.
    /// - `batch_period > 0`: the slow path must eventually run.
    /// - `batch_period <= events_per_buffer`: the first reload must happen
    ///   before the buffer is exhausted.
    /// - Total storage (`events_per_buffer + batch_period + 1` words) must
    ///   fit an `isize` byte count, the allocator's hard limit.
    pub fn validate(&self) {
        assert!(self.events_per_buffer > 0, "events_per_buffer must be > 0");
        assert!(self.batch_period > 0, "batch_period must be > 0");
        assert!(
            self.batch_period <= self.events_per_buffer,
            "batch_period ({}) must not exceed events_per_buffer ({})",
            self.batch_period,
            self.events_per_buffer
        );
        let words = self
            .events_per_buffer
            .checked_add(self.batch_period)
            .and_then(|w| w.checked_add(1))
            .expect("buffer word count overflows usize");
        assert!(
            words.checked_mul(8).is_some_and(|b| b <= isize::MAX as usize),
            "buffer storage ({} words) exceeds the allocatable range",
            words
        );
    }

    /// Number of 64-bit words a buffer's storage holds, including the tail
    /// pad that absorbs appends between two slow-path entries.
    #[inline]
    pub fn storage_words(&self) -> usize {
        self.events_per_buffer + self.batch_period + 1
    }

    /// Per-buffer heap footprint in bytes.
    #[inline]
    pub fn storage_bytes(&self) -> usize {
        self.storage_words() * 8
    }
}
