//! Per-slab reference counts: one byte per data block.
//!
//! Counts are `{ empty = 0, 1..=253, shared = 254, provisional = 255 }`.
//! Shared is sticky: once a block reaches 254 references it stays there
//! until an administrative reset frees the whole block. Each on-disk
//! ref-count block records the slab-journal point of the last entry
//! applied to it, which makes replay idempotent.

use serde::Serialize;

use crate::error::{Result, VdoError};
use crate::packing::{FieldReader, FieldWriter};
use crate::storage::BlockStore;
use crate::types::{
    JournalOperation, JournalPoint, PhysicalBlockNumber, SequenceNumber, SlabBlockNumber,
    BLOCK_SIZE,
};

pub const EMPTY_REFERENCE: u8 = 0;
pub const MAXIMUM_REFERENCE: u8 = 254;
pub const PROVISIONAL_REFERENCE: u8 = 255;

/// Header on each ref-count block: the journal point of the last applied
/// entry (sequence + entry index), padded to 16 bytes.
const REF_BLOCK_HEADER_SIZE: usize = 16;
pub const COUNTS_PER_BLOCK: u32 = (BLOCK_SIZE - REF_BLOCK_HEADER_SIZE) as u32;

#[derive(Debug, Default, Clone, Serialize)]
pub struct RefCountsStatistics {
    pub increments: u64,
    pub decrements: u64,
    pub provisional_confirms: u64,
    pub provisional_vacates: u64,
    pub blocks_written: u64,
}

struct RefBlock {
    commit_point: JournalPoint,
    dirty: bool,
    /// Era (recovery journal sequence) in which the block was last
    /// dirtied; zero when clean.
    dirty_era: SequenceNumber,
}

pub struct RefCounts {
    counts: Vec<u8>,
    free_count: u32,
    search_cursor: u32,
    blocks: Vec<RefBlock>,
    pub stats: RefCountsStatistics,
}

impl RefCounts {
    pub fn new(data_blocks: u32) -> Self {
        let block_count = data_blocks.div_ceil(COUNTS_PER_BLOCK).max(1);
        Self {
            counts: vec![EMPTY_REFERENCE; data_blocks as usize],
            free_count: data_blocks,
            search_cursor: 0,
            blocks: (0..block_count)
                .map(|_| RefBlock {
                    commit_point: JournalPoint::default(),
                    dirty: false,
                    dirty_era: 0,
                })
                .collect(),
            stats: RefCountsStatistics::default(),
        }
    }

    pub fn data_blocks(&self) -> u32 {
        self.counts.len() as u32
    }

    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    pub fn allocated_count(&self) -> u32 {
        self.data_blocks() - self.free_count
    }

    pub fn count(&self, sbn: SlabBlockNumber) -> u8 {
        self.counts[sbn as usize]
    }

    fn block_of(&self, sbn: SlabBlockNumber) -> usize {
        (sbn / COUNTS_PER_BLOCK) as usize
    }

    /// Find an empty block from the search cursor, marking it provisional.
    /// The caller must confirm the reference with a journalled increment or
    /// vacate it with a decrement.
    pub fn allocate_provisional(&mut self, era: SequenceNumber) -> Option<SlabBlockNumber> {
        if self.free_count == 0 {
            return None;
        }
        let total = self.counts.len() as u32;
        for offset in 0..total {
            let sbn = (self.search_cursor + offset) % total;
            if self.counts[sbn as usize] == EMPTY_REFERENCE {
                self.counts[sbn as usize] = PROVISIONAL_REFERENCE;
                self.free_count -= 1;
                self.search_cursor = (sbn + 1) % total;
                self.mark_dirty(sbn, era);
                return Some(sbn);
            }
        }
        None
    }

    fn mark_dirty(&mut self, sbn: SlabBlockNumber, era: SequenceNumber) {
        let block = self.block_of(sbn);
        self.blocks[block].dirty = true;
        if self.blocks[block].dirty_era == 0 {
            self.blocks[block].dirty_era = era;
        }
    }

    /// Apply a journalled operation to one count, recording the slab
    /// journal point on the affected block. Returns false (without
    /// applying) when the block's recorded point already covers `point`,
    /// which is what makes replay idempotent.
    pub fn apply(
        &mut self,
        sbn: SlabBlockNumber,
        operation: JournalOperation,
        point: JournalPoint,
        era: SequenceNumber,
    ) -> Result<bool> {
        if sbn as usize >= self.counts.len() {
            return Err(VdoError::CorruptJournal(format!(
                "slab block {sbn} outside slab of {} data blocks",
                self.counts.len()
            )));
        }
        let block = self.block_of(sbn);
        if point.is_valid() && !self.blocks[block].commit_point.before(&point) {
            return Ok(false);
        }
        let current = self.counts[sbn as usize];
        let updated = match operation {
            JournalOperation::DataIncrement | JournalOperation::BlockMapIncrement => {
                self.stats.increments += 1;
                match current {
                    EMPTY_REFERENCE => {
                        self.free_count -= 1;
                        1
                    }
                    PROVISIONAL_REFERENCE => {
                        // Confirm: provisional already counted as allocated.
                        self.stats.provisional_confirms += 1;
                        1
                    }
                    MAXIMUM_REFERENCE => MAXIMUM_REFERENCE,
                    n => n + 1,
                }
            }
            JournalOperation::DataDecrement | JournalOperation::BlockMapDecrement => {
                self.stats.decrements += 1;
                match current {
                    EMPTY_REFERENCE => {
                        return Err(VdoError::CorruptJournal(format!(
                            "decrement of empty slab block {sbn}"
                        )));
                    }
                    PROVISIONAL_REFERENCE => {
                        self.stats.provisional_vacates += 1;
                        self.free_count += 1;
                        EMPTY_REFERENCE
                    }
                    // Shared is sticky: never decremented back to a count.
                    MAXIMUM_REFERENCE => MAXIMUM_REFERENCE,
                    1 => {
                        self.free_count += 1;
                        EMPTY_REFERENCE
                    }
                    n => n - 1,
                }
            }
        };
        self.counts[sbn as usize] = updated;
        if point.is_valid() {
            self.blocks[block].commit_point = point;
        }
        self.mark_dirty(sbn, era);
        Ok(true)
    }

    /// Administrative reset of one block to empty, used by rebuild.
    pub fn reset_to_empty(&mut self, sbn: SlabBlockNumber) {
        if self.counts[sbn as usize] != EMPTY_REFERENCE {
            self.counts[sbn as usize] = EMPTY_REFERENCE;
            self.free_count += 1;
        }
    }

    /// Overwrite a count directly during rebuild bookkeeping.
    pub fn set_count_for_rebuild(&mut self, sbn: SlabBlockNumber, count: u8) {
        let current = self.counts[sbn as usize];
        if current == EMPTY_REFERENCE && count != EMPTY_REFERENCE {
            self.free_count -= 1;
        } else if current != EMPTY_REFERENCE && count == EMPTY_REFERENCE {
            self.free_count += 1;
        }
        self.counts[sbn as usize] = count;
        self.mark_dirty(sbn, 0);
    }

    /// Forget everything: all counts empty, journal points cleared. The
    /// base state for a read-only rebuild.
    pub fn reset_all(&mut self) {
        self.counts.fill(EMPTY_REFERENCE);
        self.free_count = self.counts.len() as u32;
        self.search_cursor = 0;
        for block in self.blocks.iter_mut() {
            block.commit_point = JournalPoint::default();
            block.dirty = false;
            block.dirty_era = 0;
        }
    }

    /// The oldest era any dirty block carries; zero when fully clean.
    pub fn oldest_dirty_era(&self) -> SequenceNumber {
        self.blocks
            .iter()
            .filter(|b| b.dirty)
            .map(|b| b.dirty_era)
            .min()
            .unwrap_or(0)
    }

    pub fn is_dirty(&self) -> bool {
        self.blocks.iter().any(|b| b.dirty)
    }

    /// The lowest journal point not yet durable: the slab journal may only
    /// reclaim blocks strictly before the saved points.
    pub fn saved_point_floor(&self) -> JournalPoint {
        self.blocks
            .iter()
            .map(|b| b.commit_point)
            .min_by(|a, b| {
                if a.before(b) {
                    std::cmp::Ordering::Less
                } else if a == b {
                    std::cmp::Ordering::Equal
                } else {
                    std::cmp::Ordering::Greater
                }
            })
            .unwrap_or_default()
    }

    fn block_pbn(origin: PhysicalBlockNumber, index: usize) -> PhysicalBlockNumber {
        origin + index as u64
    }

    /// Write every dirty ref-count block.
    pub fn save_dirty(
        &mut self,
        store: &mut dyn BlockStore,
        origin: PhysicalBlockNumber,
    ) -> Result<u32> {
        let mut written = 0;
        for index in 0..self.blocks.len() {
            if !self.blocks[index].dirty {
                continue;
            }
            let data = self.encode_block(index);
            store.write_block(Self::block_pbn(origin, index), &data)?;
            self.blocks[index].dirty = false;
            self.blocks[index].dirty_era = 0;
            self.stats.blocks_written += 1;
            written += 1;
        }
        Ok(written)
    }

    /// Write dirty blocks whose era is at or below `era_floor`, for aging.
    pub fn save_ancient(
        &mut self,
        store: &mut dyn BlockStore,
        origin: PhysicalBlockNumber,
        era_floor: SequenceNumber,
    ) -> Result<u32> {
        let mut written = 0;
        for index in 0..self.blocks.len() {
            if !self.blocks[index].dirty || self.blocks[index].dirty_era > era_floor {
                continue;
            }
            let data = self.encode_block(index);
            store.write_block(Self::block_pbn(origin, index), &data)?;
            self.blocks[index].dirty = false;
            self.blocks[index].dirty_era = 0;
            self.stats.blocks_written += 1;
            written += 1;
        }
        Ok(written)
    }

    fn encode_block(&self, index: usize) -> [u8; BLOCK_SIZE] {
        let mut data = [0u8; BLOCK_SIZE];
        let mut writer = FieldWriter::new(&mut data);
        let point = self.blocks[index].commit_point;
        writer.put_u64(point.sequence_number);
        writer.put_u16(point.entry_count);
        writer.skip(REF_BLOCK_HEADER_SIZE - 10);
        let start = index * COUNTS_PER_BLOCK as usize;
        let end = (start + COUNTS_PER_BLOCK as usize).min(self.counts.len());
        writer.put_bytes(&self.counts[start..end]);
        data
    }

    /// Load the counts from disk, recomputing the free count. Provisional
    /// references found on disk were never confirmed and revert to empty.
    pub fn load(&mut self, store: &mut dyn BlockStore, origin: PhysicalBlockNumber) -> Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        for index in 0..self.blocks.len() {
            store.read_block(Self::block_pbn(origin, index), &mut buf)?;
            let mut reader = FieldReader::new(&buf);
            let sequence = reader.get_u64()?;
            let entry = reader.get_u16()?;
            reader.skip(REF_BLOCK_HEADER_SIZE - 10)?;
            self.blocks[index].commit_point = JournalPoint::new(sequence, entry);
            self.blocks[index].dirty = false;
            self.blocks[index].dirty_era = 0;
            let start = index * COUNTS_PER_BLOCK as usize;
            let end = (start + COUNTS_PER_BLOCK as usize).min(self.counts.len());
            let bytes = reader.get_bytes(end - start)?;
            self.counts[start..end].copy_from_slice(bytes);
        }
        let mut free = 0;
        for count in self.counts.iter_mut() {
            if *count == PROVISIONAL_REFERENCE {
                *count = EMPTY_REFERENCE;
            }
            if *count == EMPTY_REFERENCE {
                free += 1;
            }
        }
        self.free_count = free;
        self.search_cursor = 0;
        Ok(())
    }
}
