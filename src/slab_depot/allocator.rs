//! The per-zone block allocator.
//!
//! Each physical zone owns a disjoint set of slabs and keeps a priority
//! table keyed by free-block count. Allocation opens the best slab and
//! linear-scans its ref counts from the cursor, handing out provisional
//! references the caller must confirm or vacate.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::trace;

use crate::error::{Result, VdoError};
use crate::types::{PhysicalBlockNumber, SequenceNumber, SlabNumber, ZoneId};

use super::slab::Slab;

#[derive(Debug, Default, Clone, Serialize)]
pub struct AllocatorStatistics {
    pub allocations: u64,
    pub failed_allocations: u64,
    pub slabs_opened: u64,
    pub slabs_reopened: u64,
}

pub struct BlockAllocator {
    pub zone: ZoneId,
    /// Slabs owned by this zone, by slab number.
    pub slabs: Vec<SlabNumber>,
    /// (free block count, slab number); highest free count wins, ties go
    /// to the lower slab number for stable allocation order.
    priority_table: BTreeSet<(u32, SlabNumber)>,
    open_slab: Option<SlabNumber>,
    pub stats: AllocatorStatistics,
}

impl BlockAllocator {
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            slabs: Vec::new(),
            priority_table: BTreeSet::new(),
            open_slab: None,
            stats: AllocatorStatistics::default(),
        }
    }

    pub fn adopt_slab(&mut self, slabs: &[Slab], number: SlabNumber) {
        self.slabs.push(number);
        let free = slabs[number as usize].free_blocks();
        self.priority_table.insert((free, number));
    }

    /// Pop the best slab: highest free count, then lowest slab number.
    fn pop_best(&mut self) -> Option<SlabNumber> {
        let &(best_free, _) = self.priority_table.iter().next_back()?;
        let &(free, slab) = self
            .priority_table
            .range((best_free, 0)..)
            .next()
            .unwrap_or_else(|| unreachable!("nonempty range"));
        self.priority_table.remove(&(free, slab));
        Some(slab)
    }

    /// Rebuild the table from current counts; priorities go stale as
    /// references are released back into closed slabs.
    fn reprioritize(&mut self, slabs: &[Slab]) {
        self.priority_table.clear();
        for &number in &self.slabs {
            if self.open_slab == Some(number) {
                continue;
            }
            self.priority_table
                .insert((slabs[number as usize].free_blocks(), number));
        }
        self.stats.slabs_reopened += 1;
    }

    /// Allocate one block, leaving a provisional reference on it. If the
    /// first pass over the table fails, priorities are rebuilt from the
    /// current counts once before giving up, since closed slabs may have
    /// gained free blocks since they were filed.
    pub fn allocate(
        &mut self,
        slabs: &mut [Slab],
        era: SequenceNumber,
    ) -> Result<PhysicalBlockNumber> {
        for pass in 0..2 {
            if pass == 1 {
                self.reprioritize(slabs);
            }
            if let Some(pbn) = self.allocate_pass(slabs, era) {
                self.stats.allocations += 1;
                return Ok(pbn);
            }
        }
        self.stats.failed_allocations += 1;
        Err(VdoError::OutOfSpace)
    }

    fn allocate_pass(
        &mut self,
        slabs: &mut [Slab],
        era: SequenceNumber,
    ) -> Option<PhysicalBlockNumber> {
        let mut emptied = Vec::new();
        let found = loop {
            let number = match self.open_slab {
                Some(number) => number,
                None => match self.pop_best() {
                    Some(number) => {
                        self.open_slab = Some(number);
                        self.stats.slabs_opened += 1;
                        trace!(slab = number, zone = self.zone, "slab opened");
                        number
                    }
                    None => break None,
                },
            };
            if let Some(pbn) = slabs[number as usize].allocate(era) {
                break Some(pbn);
            }
            // Exhausted; close it and move on.
            self.open_slab = None;
            emptied.push(number);
        };
        for number in emptied {
            self.priority_table
                .insert((slabs[number as usize].free_blocks(), number));
        }
        found
    }

    /// Total free blocks across this zone's slabs.
    pub fn free_blocks(&self, slabs: &[Slab]) -> u64 {
        self.slabs
            .iter()
            .map(|&n| slabs[n as usize].free_blocks() as u64)
            .sum()
    }

    /// The owned slab with the oldest recovery journal lock still held, if
    /// any: the next commit target under journal pressure.
    pub fn oldest_locked_slab(&self, slabs: &[Slab]) -> Option<SlabNumber> {
        self.slabs
            .iter()
            .filter_map(|&n| {
                let lock = slabs[n as usize].oldest_recovery_lock();
                (lock > 0).then_some((lock, n))
            })
            .min()
            .map(|(_, n)| n)
    }
}
