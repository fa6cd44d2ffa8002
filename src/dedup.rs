//! The deduplication side of the write path: content fingerprints, the
//! advisory index client, and per-zone hash locks.
//!
//! The index is an external oracle: it suggests a physical block that may
//! hold identical data, and its advice is never trusted without comparing
//! the actual block contents. Hash locks let concurrent writes of the same
//! data share one verification: the first vio becomes the agent, later
//! ones park on the lock and dedupe against the agent's result.

use std::collections::HashMap;

use serde::Serialize;

use crate::data_vio::{ChunkName, DataVioId};
use crate::types::{DataLocation, ZoneId};
use crate::wait_queue::WaitQueue;

/// Fingerprint a block: four interleaved 64-bit FNV-1a lanes. This is a
/// content hash for dedupe candidate lookup only; every candidate is
/// verified byte-for-byte before it is shared.
pub fn chunk_name(data: &[u8]) -> ChunkName {
    const OFFSETS: [u64; 4] = [
        0xcbf29ce484222325,
        0x9ae16a3b2f90404f,
        0xc949d5ca7aa4feeb,
        0x8f14e45fceea1685,
    ];
    const PRIME: u64 = 0x100000001b3;
    let mut lanes = OFFSETS;
    for (index, chunk) in data.chunks(8).enumerate() {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        let value = u64::from_le_bytes(word);
        let lane = &mut lanes[index & 3];
        *lane ^= value;
        *lane = lane.wrapping_mul(PRIME);
    }
    // Final avalanche so short blocks still spread across lanes.
    for i in 0..4 {
        let mut x = lanes[i] ^ lanes[(i + 1) & 3].rotate_left(17);
        x ^= x >> 33;
        x = x.wrapping_mul(0xff51afd7ed558ccd);
        x ^= x >> 29;
        lanes[i] = x;
    }
    let mut name = [0u8; 32];
    for (i, lane) in lanes.iter().enumerate() {
        name[i * 8..(i + 1) * 8].copy_from_slice(&lane.to_le_bytes());
    }
    ChunkName(name)
}

/// The contract with the external dedup index.
pub trait AdvisoryIndex: Send {
    /// Suggest a location that may hold data with this name.
    fn query(&mut self, name: &ChunkName) -> Option<DataLocation>;

    /// Record where data with this name now lives.
    fn update(&mut self, name: &ChunkName, location: DataLocation);

    /// Drop any advice for this name.
    fn forget(&mut self, name: &ChunkName);
}

/// In-memory index used by tests and as a default standalone oracle.
#[derive(Default)]
pub struct MemoryIndex {
    entries: HashMap<ChunkName, DataLocation>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AdvisoryIndex for MemoryIndex {
    fn query(&mut self, name: &ChunkName) -> Option<DataLocation> {
        self.entries.get(name).copied()
    }

    fn update(&mut self, name: &ChunkName, location: DataLocation) {
        self.entries.insert(*name, location);
    }

    fn forget(&mut self, name: &ChunkName) {
        self.entries.remove(name);
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DedupStatistics {
    pub queries: u64,
    pub advice_valid: u64,
    pub advice_stale: u64,
    pub updates: u64,
    pub concurrent_shares: u64,
}

struct HashLock {
    agent: DataVioId,
    waiters: WaitQueue<DataVioId>,
    /// Vios currently attached: the agent, parked waiters, and resolved
    /// sharers that have not released yet.
    holders: usize,
    /// Verified location, once the agent resolves it.
    result: Option<DataLocation>,
}

/// What acquiring a hash lock got the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum HashLockOutcome {
    /// First arrival: this vio verifies advice or writes the data.
    Agent,
    /// Parked behind the agent; resumed with its verified result.
    Waiting,
}

/// One hash zone's locks; zones shard the chunk-name space.
#[derive(Default)]
struct HashZone {
    locks: HashMap<ChunkName, HashLock>,
}

pub struct HashZones {
    zones: Vec<HashZone>,
    pub stats: DedupStatistics,
}

impl HashZones {
    pub fn new(zone_count: u8) -> Self {
        Self {
            zones: (0..zone_count.max(1)).map(|_| HashZone::default()).collect(),
            stats: DedupStatistics::default(),
        }
    }

    pub fn zone_for_name(&self, name: &ChunkName) -> ZoneId {
        (name.0[0] as usize % self.zones.len()) as ZoneId
    }

    pub fn acquire(&mut self, name: ChunkName, vio: DataVioId) -> HashLockOutcome {
        let zone = self.zone_for_name(&name) as usize;
        match self.zones[zone].locks.get_mut(&name) {
            Some(lock) => {
                lock.waiters.enqueue(vio);
                lock.holders += 1;
                self.stats.concurrent_shares += 1;
                HashLockOutcome::Waiting
            }
            None => {
                self.zones[zone].locks.insert(
                    name,
                    HashLock {
                        agent: vio,
                        waiters: WaitQueue::new(),
                        holders: 1,
                        result: None,
                    },
                );
                HashLockOutcome::Agent
            }
        }
    }

    /// The agent resolved where the data lives; wake every waiter with the
    /// result so they dedupe against it.
    pub fn resolve(&mut self, name: &ChunkName, location: DataLocation) -> Vec<DataVioId> {
        let zone = self.zone_for_name(name) as usize;
        match self.zones[zone].locks.get_mut(name) {
            Some(lock) => {
                lock.result = Some(location);
                lock.waiters.notify_all()
            }
            None => Vec::new(),
        }
    }

    /// Whether `vio` is the agent for this name's lock.
    pub fn is_agent(&self, name: &ChunkName, vio: DataVioId) -> bool {
        let zone = self.zone_for_name(name) as usize;
        self.zones[zone]
            .locks
            .get(name)
            .map(|lock| lock.agent == vio)
            .unwrap_or(false)
    }

    pub fn resolved_location(&self, name: &ChunkName) -> Option<DataLocation> {
        let zone = self.zone_for_name(name) as usize;
        self.zones[zone]
            .locks
            .get(name)
            .and_then(|lock| lock.result)
    }

    /// Drop one holder. If the agent bails before resolving, still-queued
    /// waiters are orphaned and returned so the caller can restart them as
    /// independent writes. The lock is removed with its last holder.
    pub fn release(&mut self, name: &ChunkName, vio: DataVioId) -> Vec<DataVioId> {
        let zone = self.zone_for_name(name) as usize;
        let Some(lock) = self.zones[zone].locks.get_mut(name) else {
            return Vec::new();
        };
        lock.holders = lock.holders.saturating_sub(1);
        let mut orphans = Vec::new();
        if lock.agent == vio && lock.result.is_none() {
            orphans = lock.waiters.notify_all();
            lock.holders = lock.holders.saturating_sub(orphans.len());
        }
        if lock.holders == 0 {
            self.zones[zone].locks.remove(name);
        }
        orphans
    }

    pub fn active_locks(&self) -> usize {
        self.zones.iter().map(|z| z.locks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_differ_for_different_data() {
        let a = chunk_name(&[0u8; 4096]);
        let b = chunk_name(&[1u8; 4096]);
        let mut c_data = [0u8; 4096];
        c_data[4095] = 1;
        let c = chunk_name(&c_data);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, chunk_name(&[0u8; 4096]));
    }

    #[test]
    fn memory_index_round_trip() {
        let mut index = MemoryIndex::new();
        let name = chunk_name(b"some data");
        assert_eq!(index.query(&name), None);
        index.update(&name, DataLocation::uncompressed(42));
        assert_eq!(index.query(&name), Some(DataLocation::uncompressed(42)));
        index.forget(&name);
        assert_eq!(index.query(&name), None);
    }

    #[test]
    fn hash_lock_shares_agent_result() {
        let mut zones = HashZones::new(2);
        let name = chunk_name(b"dup");
        assert_eq!(zones.acquire(name, 1), HashLockOutcome::Agent);
        assert_eq!(zones.acquire(name, 2), HashLockOutcome::Waiting);
        assert_eq!(zones.acquire(name, 3), HashLockOutcome::Waiting);

        let woken = zones.resolve(&name, DataLocation::uncompressed(99));
        assert_eq!(woken, vec![2, 3]);
        assert_eq!(
            zones.resolved_location(&name),
            Some(DataLocation::uncompressed(99))
        );

        assert!(zones.release(&name, 2).is_empty());
        assert!(zones.release(&name, 3).is_empty());
        assert!(zones.release(&name, 1).is_empty());
        assert_eq!(zones.active_locks(), 0);
    }

    #[test]
    fn failed_agent_orphans_waiters() {
        let mut zones = HashZones::new(1);
        let name = chunk_name(b"dup");
        zones.acquire(name, 1);
        zones.acquire(name, 2);
        // Agent bails without resolving; the waiter restarts alone.
        let orphans = zones.release(&name, 1);
        assert_eq!(orphans, vec![2]);
        assert_eq!(zones.active_locks(), 0);
    }
}
