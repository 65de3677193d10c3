use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// An opaque cancellation handle returned by `run_at`/`run_after`/`run_every`.
///
/// Safe to hold (and to pass to `cancel`) after the timer has already
/// fired or been cancelled: the sequence number is never reused, so a
/// stale `TimerId` simply fails to find anything to cancel rather than
/// colliding with an unrelated, later timer (§9, double-cancel is
/// idempotent).
///
/// The sequence is allocated synchronously in the calling thread (even for
/// a cross-thread `run_at`), mirroring the original implementation's
/// ability to hand back a `TimerId` without waiting for the owning
/// reactor to actually perform the insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) sequence: u64,
}

impl TimerId {
    pub(crate) fn new(sequence: u64) -> TimerId {
        TimerId { sequence }
    }

    pub(crate) fn next_sequence() -> u64 {
        NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    }
}
