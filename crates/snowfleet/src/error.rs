/// A result type defaulting to the crate [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All error variants that `snowfleet` can emit.
///
/// Every variant is a local fault: the generator never retries internally and
/// leaves its state untouched when an error is returned.
#[derive(Clone, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The wall clock reports a millisecond earlier than the last one used.
    ///
    /// The generator must not be used again until the clock is corrected;
    /// waiting out the difference could hide a faulty system clock.
    #[error("clock moved backwards: last id issued at {last_timestamp}ms but clock reads {now}ms")]
    ClockRollback {
        /// Last millisecond an ID was issued for (Unix millis).
        last_timestamp: u64,
        /// The millisecond observed by the failing call (Unix millis).
        now: u64,
    },

    /// A batch request asked for a number of IDs outside `[0, max]`.
    #[error("invalid batch size {requested}: must be between 0 and {max}")]
    InvalidCount { requested: i64, max: usize },

    /// The worker ID does not fit the 5-bit worker field.
    #[error("worker id {worker_id} out of range: must be between 0 and {max}")]
    InvalidWorkerId { worker_id: u64, max: u64 },

    /// The datacenter ID does not fit the 5-bit datacenter field.
    #[error("datacenter id {datacenter_id} out of range: must be between 0 and {max}")]
    InvalidDatacenterId { datacenter_id: u64, max: u64 },

    /// The clock reports a time before the configured epoch.
    #[error("current time {now}ms is before the epoch {epoch}ms")]
    EpochInFuture { now: u64, epoch: u64 },

    /// The elapsed time since the epoch no longer fits the timestamp field.
    #[error("timestamp {elapsed}ms since epoch exceeds the 41-bit timestamp field")]
    TimestampOverflow { elapsed: u64 },

    /// The generator lock was poisoned by a panicking thread.
    ///
    /// Never produced when the `parking-lot` feature is enabled.
    #[error("generator lock poisoned")]
    LockPoisoned,
}

impl Error {
    /// How far the clock is behind the last issued timestamp, in
    /// milliseconds. Zero for every variant other than
    /// [`Error::ClockRollback`].
    pub const fn behind_ms(&self) -> u64 {
        match self {
            Self::ClockRollback {
                last_timestamp,
                now,
            } => last_timestamp.saturating_sub(*now),
            _ => 0,
        }
    }

    /// Returns `true` for faults that the caller may not retry against the
    /// same generator until an operator intervenes.
    pub const fn is_clock_fault(&self) -> bool {
        matches!(
            self,
            Self::ClockRollback { .. } | Self::EpochInFuture { .. } | Self::TimestampOverflow { .. }
        )
    }
}

#[cfg(not(feature = "parking-lot"))]
use std::sync::{MutexGuard, PoisonError};
#[cfg(not(feature = "parking-lot"))]
// Convert all poisoned lock errors to a simplified `LockPoisoned`
impl<T> From<PoisonError<MutexGuard<'_, T>>> for Error {
    fn from(_: PoisonError<MutexGuard<'_, T>>) -> Self {
        Self::LockPoisoned
    }
}
