use core::fmt;
use std::time::Duration;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    error::{Error, Result},
    generator::{Mutex, MutexGuard},
    id::{MAX_DATACENTER_ID, MAX_SEQUENCE, MAX_WORKER_ID, SnowflakeId},
    time::TimeSource,
};

/// Largest number of IDs a single [`IdGenerator::next_ids`] call may return.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct State {
    /// Last Unix millisecond an ID was issued for. `None` until the first ID.
    pub(crate) last_timestamp: Option<u64>,
    pub(crate) sequence: u64,
}

/// A lock-based Snowflake ID generator for one `(datacenter, worker)` slot.
///
/// All state lives behind a single mutex so the generator can be shared
/// across threads (typically behind an [`Arc`]). The lock is held only for a
/// clock read and, when the 4096 sequence values of a millisecond are used
/// up, a short spin until the clock advances.
///
/// Unlike a monotonic clock, the generator reads the wall clock and refuses
/// to issue IDs when it moves backwards:
///
/// ```
/// use snowfleet::{Error, IdGenerator, TimeSource, TWITTER_EPOCH};
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// struct Settable(AtomicU64);
/// impl TimeSource for Settable {
///     fn current_millis(&self) -> u64 {
///         self.0.load(Ordering::Relaxed)
///     }
/// }
///
/// let clock = Settable(AtomicU64::new(1_700_000_000_000));
/// let generator = IdGenerator::new(1, 1, TWITTER_EPOCH, &clock).unwrap();
/// generator.next_id().unwrap();
///
/// clock.0.store(1_699_999_999_990, Ordering::Relaxed);
/// assert!(matches!(generator.next_id(), Err(Error::ClockRollback { .. })));
/// ```
///
/// [`Arc`]: std::sync::Arc
pub struct IdGenerator<T>
where
    T: TimeSource,
{
    state: Mutex<State>,
    worker_id: u64,
    datacenter_id: u64,
    epoch: u64,
    time: T,
}

impl<T> IdGenerator<T>
where
    T: TimeSource,
{
    /// Creates a generator for the given worker and datacenter.
    ///
    /// `epoch` is the origin of the timestamp field, as a [`Duration`] since
    /// 1970-01-01 UTC (see [`TWITTER_EPOCH`]).
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidWorkerId`] if `worker_id` exceeds [`MAX_WORKER_ID`]
    /// - [`Error::InvalidDatacenterId`] if `datacenter_id` exceeds
    ///   [`MAX_DATACENTER_ID`]
    ///
    /// [`TWITTER_EPOCH`]: crate::TWITTER_EPOCH
    pub fn new(worker_id: u64, datacenter_id: u64, epoch: Duration, time: T) -> Result<Self> {
        if worker_id > MAX_WORKER_ID {
            return Err(Error::InvalidWorkerId {
                worker_id,
                max: MAX_WORKER_ID,
            });
        }
        if datacenter_id > MAX_DATACENTER_ID {
            return Err(Error::InvalidDatacenterId {
                datacenter_id,
                max: MAX_DATACENTER_ID,
            });
        }
        Ok(Self {
            state: Mutex::new(State::default()),
            worker_id,
            datacenter_id,
            epoch: epoch.as_millis() as u64,
            time,
        })
    }

    pub const fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub const fn datacenter_id(&self) -> u64 {
        self.datacenter_id
    }

    pub const fn epoch(&self) -> Duration {
        Duration::from_millis(self.epoch)
    }

    /// Generates the next ID.
    ///
    /// IDs from one generator are strictly increasing. If the sequence of the
    /// current millisecond is exhausted the call spins until the clock
    /// advances.
    ///
    /// # Errors
    ///
    /// - [`Error::ClockRollback`] if the clock reads earlier than the last
    ///   issued millisecond. The generator state is left untouched.
    /// - [`Error::EpochInFuture`] / [`Error::TimestampOverflow`] if the clock
    ///   cannot be encoded relative to the epoch.
    /// - [`Error::LockPoisoned`] if another thread panicked while holding the
    ///   lock.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub fn next_id(&self) -> Result<SnowflakeId> {
        let mut state = self.lock()?;
        let mut next = *state;
        let id = self.advance(&mut next)?;
        *state = next;
        Ok(id)
    }

    /// Generates `count` consecutive IDs under a single lock acquisition.
    ///
    /// The batch is all-or-nothing: if any ID fails (for example because the
    /// clock rolls back mid-batch) no state change is committed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCount`] if `count` exceeds [`MAX_BATCH_SIZE`]
    /// - any error [`Self::next_id`] can return
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub fn next_ids(&self, count: usize) -> Result<Vec<SnowflakeId>> {
        if count > MAX_BATCH_SIZE {
            return Err(Error::InvalidCount {
                requested: i64::try_from(count).unwrap_or(i64::MAX),
                max: MAX_BATCH_SIZE,
            });
        }

        let mut state = self.lock()?;
        let mut next = *state;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.advance(&mut next)?);
        }
        *state = next;
        Ok(ids)
    }

    /// Steps `state` to the next ID. Callers commit `state` only on success.
    fn advance(&self, state: &mut State) -> Result<SnowflakeId> {
        let mut now = self.time.current_millis();
        let sequence = match state.last_timestamp {
            Some(last) if now < last => return Err(Self::cold_clock_behind(last, now)),
            Some(last) if now == last => {
                let sequence = (state.sequence + 1) & MAX_SEQUENCE;
                if sequence == 0 {
                    now = self.til_next_millis(last)?;
                }
                sequence
            }
            _ => 0,
        };

        let elapsed = self.elapsed(now)?;
        state.last_timestamp = Some(now);
        state.sequence = sequence;
        Ok(SnowflakeId::from(
            elapsed,
            self.datacenter_id,
            self.worker_id,
            sequence,
        ))
    }

    /// Spins until the clock reads a millisecond after `last`.
    fn til_next_millis(&self, last: u64) -> Result<u64> {
        loop {
            core::hint::spin_loop();
            let now = self.time.current_millis();
            if now > last {
                return Ok(now);
            }
            if now < last {
                return Err(Self::cold_clock_behind(last, now));
            }
        }
    }

    fn elapsed(&self, now: u64) -> Result<u64> {
        let elapsed = now.checked_sub(self.epoch).ok_or(Error::EpochInFuture {
            now,
            epoch: self.epoch,
        })?;
        if elapsed > SnowflakeId::TIMESTAMP_MASK {
            return Err(Error::TimestampOverflow { elapsed });
        }
        Ok(elapsed)
    }

    #[cold]
    #[inline(never)]
    fn cold_clock_behind(last_timestamp: u64, now: u64) -> Error {
        #[cfg(feature = "tracing")]
        tracing::error!(
            last_timestamp,
            now,
            behind_ms = last_timestamp - now,
            "clock moved backwards, refusing to generate ids"
        );
        Error::ClockRollback {
            last_timestamp,
            now,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        #[cfg(feature = "parking-lot")]
        {
            Ok(self.state.lock())
        }
        #[cfg(not(feature = "parking-lot"))]
        {
            Ok(self.state.lock()?)
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> State {
        *self.lock().unwrap()
    }
}

impl<T> fmt::Debug for IdGenerator<T>
where
    T: TimeSource,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator")
            .field("worker_id", &self.worker_id)
            .field("datacenter_id", &self.datacenter_id)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
