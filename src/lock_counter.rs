//! Per-zone reference counting over recovery journal blocks.
//!
//! For each on-disk journal block there is one lock. Each logical and
//! physical zone keeps its own count for each lock; a single atomic
//! aggregator per lock records how many zones currently hold it, so the
//! journal's reap check never walks the per-zone counters. Whenever the
//! aggregator for any lock drops to zero and notifications are enabled,
//! the owner (the journal) is told to attempt a reap on its own thread and
//! must acknowledge before the next notification fires.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::types::{SequenceNumber, ZoneId, ZoneType};

const STATE_IDLE: u8 = 0;
const STATE_NOTIFYING: u8 = 1;
const STATE_SUSPENDED: u8 = 2;

struct Lock {
    /// Modified only from the journal zone.
    journal_count: u16,
    logical_counts: Vec<u16>,
    physical_counts: Vec<u16>,
    logical_zones_locked: u16,
    physical_zones_locked: u16,
    /// Number of zones (of either type) with a nonzero count.
    zone_count: AtomicU32,
}

impl Lock {
    fn new(logical_zones: usize, physical_zones: usize) -> Self {
        Self {
            journal_count: 0,
            logical_counts: vec![0; logical_zones],
            physical_counts: vec![0; physical_zones],
            logical_zones_locked: 0,
            physical_zones_locked: 0,
            zone_count: AtomicU32::new(0),
        }
    }
}

pub struct LockCounter {
    locks: Vec<Lock>,
    state: AtomicU8,
}

impl LockCounter {
    pub fn new(locks: usize, logical_zones: usize, physical_zones: usize) -> Self {
        Self {
            locks: (0..locks)
                .map(|_| Lock::new(logical_zones, physical_zones))
                .collect(),
            state: AtomicU8::new(STATE_IDLE),
        }
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn lock_index(&self, sequence: SequenceNumber) -> usize {
        (sequence % self.locks.len() as u64) as usize
    }

    /// Whether a lock is held for a zone type. A journal reference counts
    /// as both types.
    pub fn is_locked(&self, sequence: SequenceNumber, zone_type: ZoneType) -> bool {
        let lock = &self.locks[self.lock_index(sequence)];
        if lock.journal_count > 0 {
            return true;
        }
        match zone_type {
            ZoneType::Logical => lock.logical_zones_locked > 0,
            ZoneType::Physical => lock.physical_zones_locked > 0,
        }
    }

    /// Set the journal zone's count for a lock. Journal thread only.
    pub fn initialize_journal_count(&mut self, sequence: SequenceNumber, value: u16) {
        let index = self.lock_index(sequence);
        self.locks[index].journal_count = value;
    }

    /// Release one journal reference. Journal thread only.
    pub fn release_journal_reference(&mut self, sequence: SequenceNumber) {
        let index = self.lock_index(sequence);
        let lock = &mut self.locks[index];
        debug_assert!(lock.journal_count > 0, "journal count underflow");
        lock.journal_count = lock.journal_count.saturating_sub(1);
    }

    pub fn journal_count(&self, sequence: SequenceNumber) -> u16 {
        self.locks[self.lock_index(sequence)].journal_count
    }

    /// Acquire a reference from a non-journal zone. A 0 -> 1 transition for
    /// the zone bumps the aggregator.
    pub fn acquire(&mut self, sequence: SequenceNumber, zone_type: ZoneType, zone: ZoneId) {
        let index = self.lock_index(sequence);
        let lock = &mut self.locks[index];
        let (counts, locked) = match zone_type {
            ZoneType::Logical => (&mut lock.logical_counts, &mut lock.logical_zones_locked),
            ZoneType::Physical => (&mut lock.physical_counts, &mut lock.physical_zones_locked),
        };
        let count = &mut counts[zone as usize];
        *count += 1;
        if *count == 1 {
            *locked += 1;
            lock.zone_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Release a reference from a non-journal zone. Returns true when the
    /// caller must notify the owner: the lock's aggregator reached zero and
    /// notifications are enabled.
    #[must_use]
    pub fn release(&mut self, sequence: SequenceNumber, zone_type: ZoneType, zone: ZoneId) -> bool {
        let index = self.lock_index(sequence);
        let lock = &mut self.locks[index];
        let (counts, locked) = match zone_type {
            ZoneType::Logical => (&mut lock.logical_counts, &mut lock.logical_zones_locked),
            ZoneType::Physical => (&mut lock.physical_counts, &mut lock.physical_zones_locked),
        };
        let count = &mut counts[zone as usize];
        debug_assert!(*count > 0, "zone lock count underflow");
        *count -= 1;
        if *count != 0 {
            return false;
        }
        *locked -= 1;
        if lock.zone_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        self.state
            .compare_exchange(
                STATE_IDLE,
                STATE_NOTIFYING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// The owner has processed a notification; re-arm.
    pub fn acknowledge_unlock(&self) {
        let _ = self.state.compare_exchange(
            STATE_NOTIFYING,
            STATE_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Disable notifications across an admin flow. Returns true if the
    /// counter was not mid-notification (the suspend took effect cleanly).
    pub fn suspend(&self) -> bool {
        self.state.swap(STATE_SUSPENDED, Ordering::AcqRel) != STATE_NOTIFYING
    }

    /// Re-enable notifications. Returns true if the counter was suspended.
    pub fn resume(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_SUSPENDED,
                STATE_IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// The number of zones currently holding the given lock. Used by the
    /// quiescence checks in tests and drains.
    pub fn zones_holding(&self, sequence: SequenceNumber) -> u32 {
        self.locks[self.lock_index(sequence)]
            .zone_count
            .load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregator_tracks_zones_not_references() {
        let mut counter = LockCounter::new(4, 2, 1);
        counter.acquire(7, ZoneType::Logical, 0);
        counter.acquire(7, ZoneType::Logical, 0);
        counter.acquire(7, ZoneType::Logical, 1);
        assert_eq!(counter.zones_holding(7), 2);

        assert!(!counter.release(7, ZoneType::Logical, 0));
        assert_eq!(counter.zones_holding(7), 2);
        assert!(!counter.release(7, ZoneType::Logical, 0));
        assert_eq!(counter.zones_holding(7), 1);
        assert!(counter.release(7, ZoneType::Logical, 1));
        assert_eq!(counter.zones_holding(7), 0);
    }

    #[test]
    fn notification_gated_by_acknowledge() {
        let mut counter = LockCounter::new(2, 1, 1);
        counter.acquire(0, ZoneType::Physical, 0);
        counter.acquire(1, ZoneType::Physical, 0);

        assert!(counter.release(0, ZoneType::Physical, 0));
        // A second zero-crossing before the acknowledge is coalesced.
        assert!(!counter.release(1, ZoneType::Physical, 0));

        counter.acknowledge_unlock();
        counter.acquire(0, ZoneType::Logical, 0);
        assert!(counter.release(0, ZoneType::Logical, 0));
    }

    #[test]
    fn journal_reference_locks_both_types() {
        let mut counter = LockCounter::new(2, 1, 1);
        counter.initialize_journal_count(1, 2);
        assert!(counter.is_locked(1, ZoneType::Logical));
        assert!(counter.is_locked(1, ZoneType::Physical));
        counter.release_journal_reference(1);
        assert!(counter.is_locked(1, ZoneType::Logical));
        counter.release_journal_reference(1);
        assert!(!counter.is_locked(1, ZoneType::Logical));
        assert!(!counter.is_locked(1, ZoneType::Physical));
    }

    #[test]
    fn suspend_blocks_notifications() {
        let mut counter = LockCounter::new(1, 1, 1);
        counter.acquire(0, ZoneType::Logical, 0);
        assert!(counter.suspend());
        assert!(!counter.release(0, ZoneType::Logical, 0));
        assert!(counter.resume());
        counter.acquire(0, ZoneType::Logical, 0);
        assert!(counter.release(0, ZoneType::Logical, 0));
    }
}
