use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::scope;
use std::time::Duration;

use crate::{
    Error, IdGenerator, MAX_BATCH_SIZE, MAX_SEQUENCE, SnowflakeId, TWITTER_EPOCH, TimeSource,
    WallClock, generator::lock::State,
};

const NOW: u64 = 1_700_000_000_000;

struct MockTime {
    millis: AtomicU64,
}

impl MockTime {
    fn at(millis: u64) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicU64::new(millis),
        })
    }

    fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for MockTime {
    fn current_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Replays a fixed list of readings, repeating the last one forever.
struct MockStepTime {
    values: Vec<u64>,
    index: AtomicUsize,
}

impl MockStepTime {
    fn new(values: Vec<u64>) -> Self {
        Self {
            values,
            index: AtomicUsize::new(0),
        }
    }
}

impl TimeSource for MockStepTime {
    fn current_millis(&self) -> u64 {
        let i = self.index.fetch_add(1, Ordering::SeqCst);
        self.values[i.min(self.values.len() - 1)]
    }
}

/// Holds the same millisecond for `hold` reads, then advances by one.
struct AdvancingTime {
    millis: AtomicU64,
    reads: AtomicUsize,
    hold: usize,
}

impl TimeSource for AdvancingTime {
    fn current_millis(&self) -> u64 {
        let reads = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if reads % self.hold == 0 {
            self.millis.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.millis.load(Ordering::SeqCst)
        }
    }
}

#[test]
fn sequence_increments_within_same_tick() {
    let generator = IdGenerator::new(1, 2, TWITTER_EPOCH, MockTime::at(NOW)).unwrap();
    let id1 = generator.next_id().unwrap();
    let id2 = generator.next_id().unwrap();
    let id3 = generator.next_id().unwrap();

    let elapsed = NOW - TWITTER_EPOCH.as_millis() as u64;
    assert_eq!(id1.timestamp(), elapsed);
    assert_eq!(id3.timestamp(), elapsed);
    assert_eq!(id1.sequence(), 0);
    assert_eq!(id2.sequence(), 1);
    assert_eq!(id3.sequence(), 2);
    assert!(id1 < id2 && id2 < id3);
}

#[test]
fn sequence_resets_when_clock_advances() {
    let clock = MockTime::at(NOW);
    let generator = IdGenerator::new(0, 0, TWITTER_EPOCH, Arc::clone(&clock)).unwrap();
    generator.next_id().unwrap();
    generator.next_id().unwrap();

    clock.set(NOW + 5);
    let id = generator.next_id().unwrap();
    assert_eq!(id.sequence(), 0);
    assert_eq!(generator.snapshot().last_timestamp, Some(NOW + 5));
}

#[test]
fn decodes_worker_and_datacenter() {
    let generator = IdGenerator::new(17, 9, TWITTER_EPOCH, WallClock).unwrap();
    let id = generator.next_id().unwrap();
    assert_eq!(id.worker_id(), 17);
    assert_eq!(id.datacenter_id(), 9);
    assert!(id.to_i64() > 0);
}

#[test]
fn rejects_out_of_range_ids() {
    assert_eq!(
        IdGenerator::new(32, 0, TWITTER_EPOCH, WallClock).unwrap_err(),
        Error::InvalidWorkerId {
            worker_id: 32,
            max: 31
        }
    );
    assert_eq!(
        IdGenerator::new(0, 32, TWITTER_EPOCH, WallClock).unwrap_err(),
        Error::InvalidDatacenterId {
            datacenter_id: 32,
            max: 31
        }
    );
    assert!(IdGenerator::new(31, 31, TWITTER_EPOCH, WallClock).is_ok());
}

#[test]
fn wall_clock_ids_strictly_increase() {
    let generator = IdGenerator::new(3, 1, TWITTER_EPOCH, WallClock).unwrap();
    let mut last = generator.next_id().unwrap();
    for _ in 0..4096 * 16 {
        let id = generator.next_id().unwrap();
        assert!(id > last, "{id:?} not after {last:?}");
        last = id;
    }
}

#[test]
fn threaded_ids_are_unique() {
    const THREADS: usize = 8;
    const IDS_PER_THREAD: usize = 4096 * 4;

    let generator = Arc::new(IdGenerator::new(5, 5, TWITTER_EPOCH, WallClock).unwrap());
    let seen = Arc::new(Mutex::new(HashSet::with_capacity(THREADS * IDS_PER_THREAD)));

    scope(|s| {
        for _ in 0..THREADS {
            let generator = Arc::clone(&generator);
            let seen = Arc::clone(&seen);
            s.spawn(move || {
                let mut local = Vec::with_capacity(IDS_PER_THREAD);
                let mut last = None;
                for _ in 0..IDS_PER_THREAD {
                    let id = generator.next_id().unwrap();
                    if let Some(prev) = last {
                        assert!(id > prev);
                    }
                    last = Some(id);
                    local.push(id);
                }
                let mut seen = seen.lock().unwrap();
                for id in local {
                    assert!(seen.insert(id));
                }
            });
        }
    });

    assert_eq!(seen.lock().unwrap().len(), THREADS * IDS_PER_THREAD);
}

#[test]
fn next_ids_returns_requested_count() {
    let generator = IdGenerator::new(1, 1, TWITTER_EPOCH, WallClock).unwrap();
    for count in [0, 1, 2, 50, MAX_BATCH_SIZE] {
        let ids = generator.next_ids(count).unwrap();
        assert_eq!(ids.len(), count);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn next_ids_rejects_oversized_batch_without_state_change() {
    let generator = IdGenerator::new(1, 1, TWITTER_EPOCH, MockTime::at(NOW)).unwrap();
    generator.next_id().unwrap();
    let before = generator.snapshot();

    let err = generator.next_ids(MAX_BATCH_SIZE + 1).unwrap_err();
    assert_eq!(
        err,
        Error::InvalidCount {
            requested: 101,
            max: 100
        }
    );
    assert_eq!(generator.snapshot(), before);
}

#[test]
fn rollback_is_rejected_and_state_unchanged() {
    let clock = MockTime::at(NOW);
    let generator = IdGenerator::new(2, 3, TWITTER_EPOCH, Arc::clone(&clock)).unwrap();
    generator.next_id().unwrap();
    let before = generator.snapshot();

    clock.set(NOW - 7);
    let err = generator.next_id().unwrap_err();
    assert_eq!(
        err,
        Error::ClockRollback {
            last_timestamp: NOW,
            now: NOW - 7
        }
    );
    assert_eq!(err.behind_ms(), 7);
    assert!(err.is_clock_fault());
    assert_eq!(generator.snapshot(), before);

    // Once the clock is back, the sequence continues where it left off.
    clock.set(NOW);
    assert_eq!(generator.next_id().unwrap().sequence(), 1);
}

#[test]
fn rollback_mid_batch_commits_nothing() {
    let clock = MockStepTime::new(vec![NOW, NOW + 1, NOW + 2, NOW, NOW + 3]);
    let generator = IdGenerator::new(0, 0, TWITTER_EPOCH, clock).unwrap();
    generator.next_id().unwrap();
    let before = generator.snapshot();

    let err = generator.next_ids(5).unwrap_err();
    assert!(matches!(err, Error::ClockRollback { .. }));
    assert_eq!(generator.snapshot(), before);
}

#[test]
fn sequence_exhaustion_spins_to_next_millisecond() {
    let clock = AdvancingTime {
        millis: AtomicU64::new(NOW),
        reads: AtomicUsize::new(0),
        // Enough reads to exhaust one millisecond before the clock moves.
        hold: (MAX_SEQUENCE as usize + 1) + 16,
    };
    let generator = IdGenerator::new(4, 4, TWITTER_EPOCH, clock).unwrap();

    let first = generator.next_id().unwrap();
    let mut last = first;
    for _ in 0..MAX_SEQUENCE {
        last = generator.next_id().unwrap();
    }
    assert_eq!(last.timestamp(), first.timestamp());
    assert_eq!(last.sequence(), MAX_SEQUENCE);

    let wrapped = generator.next_id().unwrap();
    assert_eq!(wrapped.timestamp(), first.timestamp() + 1);
    assert_eq!(wrapped.sequence(), 0);
    assert!(wrapped > last);
}

#[test]
fn rollback_during_spin_is_reported() {
    let clock = MockTime::at(NOW);
    let generator = IdGenerator::new(0, 0, TWITTER_EPOCH, Arc::clone(&clock)).unwrap();
    for _ in 0..=MAX_SEQUENCE {
        generator.next_id().unwrap();
    }
    clock.set(NOW - 1);
    // The clock already reads behind, so the first check rejects the call.
    assert!(matches!(
        generator.next_id(),
        Err(Error::ClockRollback { .. })
    ));
    assert_eq!(
        generator.snapshot(),
        State {
            last_timestamp: Some(NOW),
            sequence: MAX_SEQUENCE
        }
    );
}

#[test]
fn distinct_slots_never_collide() {
    let mut seen = HashSet::new();
    for datacenter_id in [0, 1, 31] {
        for worker_id in [0, 1, 31] {
            let generator =
                IdGenerator::new(worker_id, datacenter_id, TWITTER_EPOCH, MockTime::at(NOW))
                    .unwrap();
            for id in generator.next_ids(10).unwrap() {
                assert!(seen.insert(id));
            }
        }
    }
    assert_eq!(seen.len(), 90);
}

#[test]
fn clock_before_epoch_is_rejected() {
    let epoch = Duration::from_millis(NOW + 1_000);
    let generator = IdGenerator::new(0, 0, epoch, MockTime::at(NOW)).unwrap();
    assert_eq!(
        generator.next_id().unwrap_err(),
        Error::EpochInFuture {
            now: NOW,
            epoch: NOW + 1_000
        }
    );
    assert_eq!(generator.snapshot(), State::default());
}

#[test]
fn timestamp_overflow_is_rejected() {
    let far_future = SnowflakeId::TIMESTAMP_MASK + 1;
    let generator =
        IdGenerator::new(0, 0, Duration::ZERO, MockTime::at(far_future)).unwrap();
    assert_eq!(
        generator.next_id().unwrap_err(),
        Error::TimestampOverflow {
            elapsed: far_future
        }
    );
}

#[test]
fn accessors_report_configuration() {
    let generator = IdGenerator::new(7, 8, TWITTER_EPOCH, WallClock).unwrap();
    assert_eq!(generator.worker_id(), 7);
    assert_eq!(generator.datacenter_id(), 8);
    assert_eq!(generator.epoch(), TWITTER_EPOCH);
}
