//! Depth-2 latest-value slot shared between one producer and any number of
//! readers.
//!
//! ## Layout
//!
//! ```text
//!            latest ──┐
//!                     ▼
//!   ┌──────────────┬──────────────┐
//!   │ slot 0       │ slot 1       │
//!   │ version: 6   │ version: 5   │   odd version = write in progress
//!   │ snapshot #3  │ (writing #4) │
//!   └──────────────┴──────────────┘
//! ```
//!
//! The writer always fills the slot that `latest` does *not* point at and then
//! publishes it with a single atomic store of the index, so a reader that
//! loads `latest` sees a completely written snapshot. A reader that stalls
//! long enough for the writer to come back round to its slot notices the
//! version change and retries with the new index. The writer never waits.
//!
//! ## Progress
//!
//! Publishing is wait-free. Reading is lock-free: a read retries only when
//! the writer reuses the slot being copied, which takes two publishes. With
//! one publish per poll interval, a reader has to stall for a whole interval
//! per retry, so a read of a few hundred bytes finishes on its first or
//! second attempt.
//!
//! ## Memory ordering
//! - `latest`: Release on publish, Acquire on read.
//! - slot `version`: seqlock protocol (odd while writing, fenced both sides).

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const EMPTY: usize = usize::MAX;
const SLOTS: usize = 2;

/// Immutable, sequence-numbered value published by one producer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot<T> {
    /// Starts at 1 and increases by one per publish on a channel.
    pub sequence: u64,
    pub timestamp: Instant,
    pub payload: T,
    /// False when the producer flags the payload as not meaningful, e.g. a
    /// thermal frame with no tyre in view.
    pub valid: bool,
}

impl<T> Snapshot<T> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Snapshot<U> {
        Snapshot {
            sequence: self.sequence,
            timestamp: self.timestamp,
            payload: f(self.payload),
            valid: self.valid,
        }
    }
}

struct Slot<T> {
    version: AtomicU64,
    value: UnsafeCell<MaybeUninit<Snapshot<T>>>,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

struct Shared<T> {
    slots: [Slot<T>; SLOTS],
    latest: AtomicUsize,
}

// Safety: slot contents are only written by the single `SnapshotWriter` and
// only read through the version check, and `T: Copy` means no drop glue runs
// on a torn copy.
unsafe impl<T: Copy + Send> Sync for Shared<T> {}
unsafe impl<T: Copy + Send> Send for Shared<T> {}

/// Create a connected writer/reader pair over a fresh, empty slot.
pub fn snapshot_channel<T: Copy + Send>() -> (SnapshotWriter<T>, SnapshotReader<T>) {
    let shared = Arc::new(Shared {
        slots: [Slot::new(), Slot::new()],
        latest: AtomicUsize::new(EMPTY),
    });

    let writer = SnapshotWriter {
        shared: Arc::clone(&shared),
        next_sequence: 1,
    };
    (writer, SnapshotReader { shared })
}

/// Producer half. Deliberately not `Clone`: one channel, one writer.
pub struct SnapshotWriter<T> {
    shared: Arc<Shared<T>>,
    next_sequence: u64,
}

impl<T: Copy + Send> SnapshotWriter<T> {
    pub fn publish(&mut self, payload: T, valid: bool) -> Snapshot<T> {
        self.publish_at(payload, valid, Instant::now())
    }

    pub fn publish_at(&mut self, payload: T, valid: bool, timestamp: Instant) -> Snapshot<T> {
        let snapshot = Snapshot {
            sequence: self.next_sequence,
            timestamp,
            payload,
            valid,
        };
        self.next_sequence += 1;

        let shared = &*self.shared;
        // Only this writer stores `latest`, so a relaxed load is current.
        let current = shared.latest.load(Ordering::Relaxed);
        let target = if current == EMPTY { 0 } else { (current + 1) % SLOTS };
        let slot = &shared.slots[target];

        let version = slot.version.load(Ordering::Relaxed);
        slot.version.store(version.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        // Safety: `target` is never the published index, and this is the only
        // writer; readers that still hold `target` detect the odd version.
        unsafe {
            ptr::write_volatile(slot.value.get(), MaybeUninit::new(snapshot));
        }

        slot.version.store(version.wrapping_add(2), Ordering::Release);
        shared.latest.store(target, Ordering::Release);

        snapshot
    }

    /// Sequence number the next publish will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn reader(&self) -> SnapshotReader<T> {
        SnapshotReader {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Consumer half. Cheap to clone; reads never block the writer.
pub struct SnapshotReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SnapshotReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Copy + Send> SnapshotReader<T> {
    /// Most recently published snapshot, or `None` before the first publish.
    pub fn latest(&self) -> Option<Snapshot<T>> {
        let shared = &*self.shared;
        loop {
            let index = shared.latest.load(Ordering::Acquire);
            if index == EMPTY {
                return None;
            }
            let slot = &shared.slots[index];

            let before = slot.version.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            // Safety: the read may race a writer reusing this slot; the copy
            // stays inside `MaybeUninit` until the version check proves it whole.
            let value = unsafe { ptr::read_volatile(slot.value.get()) };
            fence(Ordering::Acquire);
            let after = slot.version.load(Ordering::Relaxed);

            if before == after {
                // Safety: `latest` only ever points at a slot that has been
                // written, and the unchanged even version rules out tearing.
                return Some(unsafe { value.assume_init() });
            }
            std::hint::spin_loop();
        }
    }

    pub fn has_published(&self) -> bool {
        self.shared.latest.load(Ordering::Acquire) != EMPTY
    }
}

impl<T> core::fmt::Debug for SnapshotReader<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SnapshotReader")
            .field("latest", &self.shared.latest.load(Ordering::Relaxed))
            .finish()
    }
}
