//! The slab summary: a small per-slab record of the journal tail position
//! and cleanliness, consulted at load to decide which slabs need
//! scrubbing and whether their ref counts are trustworthy.

use crate::error::Result;
use crate::storage::BlockStore;
use crate::types::{PhysicalBlockNumber, SlabNumber, BLOCK_SIZE};

/// Two bytes per slab: the tail offset and a flag byte.
const ENTRY_SIZE: usize = 2;
const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / ENTRY_SIZE;

const FLAG_CLEAN: u8 = 0x01;
const FLAG_LOAD_REF_COUNTS: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabSummaryEntry {
    pub tail_block_offset: u8,
    pub cleanly_saved: bool,
    pub load_ref_counts: bool,
}

impl Default for SlabSummaryEntry {
    fn default() -> Self {
        Self {
            tail_block_offset: 0,
            cleanly_saved: false,
            load_ref_counts: false,
        }
    }
}

impl SlabSummaryEntry {
    fn pack(&self) -> [u8; ENTRY_SIZE] {
        let mut flags = 0;
        if self.cleanly_saved {
            flags |= FLAG_CLEAN;
        }
        if self.load_ref_counts {
            flags |= FLAG_LOAD_REF_COUNTS;
        }
        [self.tail_block_offset, flags]
    }

    fn unpack(bytes: &[u8]) -> Self {
        Self {
            tail_block_offset: bytes[0],
            cleanly_saved: bytes[1] & FLAG_CLEAN != 0,
            load_ref_counts: bytes[1] & FLAG_LOAD_REF_COUNTS != 0,
        }
    }
}

pub struct SlabSummary {
    origin: PhysicalBlockNumber,
    blocks: u64,
    entries: Vec<SlabSummaryEntry>,
    dirty_blocks: Vec<bool>,
}

impl SlabSummary {
    pub fn new(origin: PhysicalBlockNumber, blocks: u64, slab_count: SlabNumber) -> Self {
        Self {
            origin,
            blocks,
            entries: vec![SlabSummaryEntry::default(); slab_count as usize],
            dirty_blocks: vec![false; blocks as usize],
        }
    }

    pub fn capacity(&self) -> usize {
        (self.blocks as usize * ENTRIES_PER_BLOCK).min(u32::MAX as usize)
    }

    pub fn entry(&self, slab: SlabNumber) -> SlabSummaryEntry {
        self.entries
            .get(slab as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn update(&mut self, slab: SlabNumber, entry: SlabSummaryEntry) {
        let index = slab as usize;
        if index >= self.entries.len() {
            self.entries.resize(index + 1, SlabSummaryEntry::default());
        }
        self.entries[index] = entry;
        let block = index / ENTRIES_PER_BLOCK;
        if block < self.dirty_blocks.len() {
            self.dirty_blocks[block] = true;
        }
    }

    /// Extend the summary for grown capacity; new slabs start not-clean so
    /// a crash between prepare and perform scrubs nothing stale.
    pub fn grow(&mut self, slab_count: SlabNumber) {
        if slab_count as usize > self.entries.len() {
            self.entries
                .resize(slab_count as usize, SlabSummaryEntry::default());
        }
    }

    /// Write every dirty summary block. Whole blocks are rewritten; a torn
    /// write leaves stale entries that read as "needs scrubbing", which
    /// recovery treats conservatively.
    pub fn save(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        for block in 0..self.dirty_blocks.len() {
            if !self.dirty_blocks[block] {
                continue;
            }
            let mut data = [0u8; BLOCK_SIZE];
            let start = block * ENTRIES_PER_BLOCK;
            for slot in 0..ENTRIES_PER_BLOCK {
                let index = start + slot;
                if index >= self.entries.len() {
                    break;
                }
                data[slot * ENTRY_SIZE..(slot + 1) * ENTRY_SIZE]
                    .copy_from_slice(&self.entries[index].pack());
            }
            store.write_block(self.origin + block as u64, &data)?;
            self.dirty_blocks[block] = false;
        }
        Ok(())
    }

    pub fn load(&mut self, store: &mut dyn BlockStore, slab_count: SlabNumber) -> Result<()> {
        self.entries.clear();
        let mut buf = [0u8; BLOCK_SIZE];
        let mut remaining = slab_count as usize;
        for block in 0..self.blocks {
            if remaining == 0 {
                break;
            }
            store.read_block(self.origin + block, &mut buf)?;
            let in_block = remaining.min(ENTRIES_PER_BLOCK);
            for slot in 0..in_block {
                self.entries
                    .push(SlabSummaryEntry::unpack(&buf[slot * ENTRY_SIZE..]));
            }
            remaining -= in_block;
        }
        self.dirty_blocks.iter_mut().for_each(|d| *d = false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;

    #[test]
    fn update_save_load_round_trip() {
        let mut store = MemStore::new(64);
        let mut summary = SlabSummary::new(10, 8, 20);
        summary.update(
            3,
            SlabSummaryEntry {
                tail_block_offset: 5,
                cleanly_saved: true,
                load_ref_counts: true,
            },
        );
        summary.update(
            17,
            SlabSummaryEntry {
                tail_block_offset: 2,
                cleanly_saved: false,
                load_ref_counts: true,
            },
        );
        summary.save(&mut store).unwrap();

        let mut loaded = SlabSummary::new(10, 8, 20);
        loaded.load(&mut store, 20).unwrap();
        assert_eq!(loaded.entry(3).tail_block_offset, 5);
        assert!(loaded.entry(3).cleanly_saved);
        assert!(!loaded.entry(17).cleanly_saved);
        assert!(loaded.entry(17).load_ref_counts);
        // Untouched slabs read as never cleanly saved.
        assert!(!loaded.entry(0).cleanly_saved);
    }

    #[test]
    fn grow_adds_unclean_entries() {
        let mut summary = SlabSummary::new(10, 8, 4);
        summary.grow(6);
        assert!(!summary.entry(5).cleanly_saved);
    }
}
