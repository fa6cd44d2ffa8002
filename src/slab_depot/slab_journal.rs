//! The per-slab circular journal of reference count changes.
//!
//! Entries are packed four-byte `(operation, slab_block_number)` pairs.
//! Block-map increments are "full" entries that also carry the recovery
//! journal sequence number whose per-entry lock they hold; every in-memory
//! entry tracks that lock so committing a tail block can release them.

use serde::Serialize;
use tracing::trace;

use crate::config::SlabConfig;
use crate::error::{Result, VdoError};
use crate::packing::{FieldReader, FieldWriter};
use crate::storage::BlockStore;
use crate::types::{
    JournalOperation, JournalPoint, MetadataType, PhysicalBlockNumber, SequenceNumber,
    SlabBlockNumber, BLOCK_SIZE,
};

pub const SLAB_JOURNAL_HEADER_SIZE: usize = 40;
pub const SLAB_JOURNAL_ENTRIES_PER_BLOCK: u16 =
    ((BLOCK_SIZE - SLAB_JOURNAL_HEADER_SIZE) / 4) as u16;
pub const SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK: u16 =
    ((BLOCK_SIZE - SLAB_JOURNAL_HEADER_SIZE) / 12) as u16;

const SBN_MASK: u32 = (1 << 30) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub sbn: SlabBlockNumber,
    pub operation: JournalOperation,
    /// The recovery journal point whose per-entry lock this entry holds;
    /// an invalid point for entries created by replay.
    pub recovery_point: JournalPoint,
}

impl SlabJournalEntry {
    fn pack(&self) -> u32 {
        ((self.operation.to_byte() as u32) << 30) | (self.sbn & SBN_MASK)
    }

    fn unpack(packed: u32, recovery_sequence: SequenceNumber) -> Result<Self> {
        Ok(Self {
            sbn: packed & SBN_MASK,
            operation: JournalOperation::from_byte((packed >> 30) as u8)?,
            recovery_point: JournalPoint::new(recovery_sequence, 0),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalBlockHeader {
    pub head: SequenceNumber,
    pub sequence_number: SequenceNumber,
    pub nonce: u64,
    pub entry_count: u16,
    pub has_block_map_increments: bool,
    /// The highest recovery journal point among every entry committed up
    /// to and including this block. Recovery replay skips recovery
    /// entries at or below this point for this slab.
    pub recovery_ceiling: JournalPoint,
}

pub fn pack_slab_journal_block(
    header: &SlabJournalBlockHeader,
    entries: &[SlabJournalEntry],
) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    let mut writer = FieldWriter::new(&mut block);
    writer.put_u64(header.head);
    writer.put_u64(header.sequence_number);
    writer.put_u64(header.nonce);
    writer.put_u8(MetadataType::SlabJournal.to_byte());
    writer.put_u8(header.has_block_map_increments as u8);
    writer.put_u16(header.entry_count);
    writer.put_u64(header.recovery_ceiling.sequence_number);
    writer.put_u16(header.recovery_ceiling.entry_count);
    writer.skip(SLAB_JOURNAL_HEADER_SIZE - writer.offset());
    for entry in entries {
        writer.put_u32(entry.pack());
        if header.has_block_map_increments {
            writer.put_u64(entry.recovery_point.sequence_number);
        }
    }
    block
}

pub fn unpack_slab_journal_block(
    block: &[u8],
    nonce: u64,
) -> Result<(SlabJournalBlockHeader, Vec<SlabJournalEntry>)> {
    let mut reader = FieldReader::new(block);
    let head = reader.get_u64()?;
    let sequence_number = reader.get_u64()?;
    let block_nonce = reader.get_u64()?;
    let metadata_type = MetadataType::from_byte(reader.get_u8()?)?;
    if metadata_type != MetadataType::SlabJournal {
        return Err(VdoError::CorruptJournal(format!(
            "expected slab journal block, found {metadata_type:?}"
        )));
    }
    if block_nonce != nonce {
        return Err(VdoError::NonceMismatch {
            expected: nonce,
            found: block_nonce,
        });
    }
    let has_block_map_increments = reader.get_u8()? != 0;
    let entry_count = reader.get_u16()?;
    let recovery_ceiling = JournalPoint::new(reader.get_u64()?, reader.get_u16()?);
    let capacity = if has_block_map_increments {
        SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK
    } else {
        SLAB_JOURNAL_ENTRIES_PER_BLOCK
    };
    if entry_count > capacity {
        return Err(VdoError::CorruptJournal(format!(
            "slab journal entry count {entry_count} exceeds capacity {capacity}"
        )));
    }
    if head > sequence_number {
        return Err(VdoError::CorruptJournal(format!(
            "slab journal head {head} beyond sequence {sequence_number}"
        )));
    }
    reader.skip(SLAB_JOURNAL_HEADER_SIZE - reader.offset())?;
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let packed = reader.get_u32()?;
        let recovery = if has_block_map_increments {
            reader.get_u64()?
        } else {
            0
        };
        entries.push(SlabJournalEntry::unpack(packed, recovery)?);
    }
    let header = SlabJournalBlockHeader {
        head,
        sequence_number,
        nonce: block_nonce,
        entry_count,
        has_block_map_increments,
        recovery_ceiling,
    };
    Ok((header, entries))
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SlabJournalStatistics {
    pub entries_added: u64,
    pub blocks_committed: u64,
    pub flushes_triggered: u64,
    pub blocked_additions: u64,
}

pub struct SlabJournal {
    origin: PhysicalBlockNumber,
    size: u64,
    nonce: u64,
    head: SequenceNumber,
    tail: SequenceNumber,
    entries: Vec<SlabJournalEntry>,
    recovery_ceiling: JournalPoint,
    flushing_threshold: u64,
    blocking_threshold: u64,
    pub stats: SlabJournalStatistics,
}

impl SlabJournal {
    pub fn new(origin: PhysicalBlockNumber, config: &SlabConfig, nonce: u64) -> Self {
        Self {
            origin,
            size: config.slab_journal_blocks as u64,
            nonce,
            head: 1,
            tail: 1,
            entries: Vec::new(),
            recovery_ceiling: JournalPoint::default(),
            flushing_threshold: config.flushing_threshold,
            blocking_threshold: config.blocking_threshold,
            stats: SlabJournalStatistics::default(),
        }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    pub fn tail_block_offset(&self) -> u8 {
        (self.tail % self.size) as u8
    }

    pub fn block_pbn(&self, sequence: SequenceNumber) -> PhysicalBlockNumber {
        self.origin + (sequence % self.size)
    }

    fn blocks_in_use(&self) -> u64 {
        self.tail - self.head
    }

    /// Whether the journal is over its flushing threshold and the owning
    /// allocator should push ref counts out to reclaim space.
    pub fn needs_flushing(&self) -> bool {
        self.blocks_in_use() >= self.flushing_threshold
    }

    /// Whether new entries must be refused until space is reclaimed.
    pub fn is_blocked(&self) -> bool {
        self.blocks_in_use() >= self.blocking_threshold
    }

    pub fn has_uncommitted_entries(&self) -> bool {
        !self.entries.is_empty()
    }

    /// The current append position: the point the next entry will get.
    pub fn append_point(&self) -> JournalPoint {
        JournalPoint::new(self.tail, self.entries.len() as u16)
    }

    /// The oldest recovery journal lock held by any uncommitted entry;
    /// zero when none. Orders the dirty-journal commit queue under
    /// recovery journal pressure.
    pub fn oldest_recovery_lock(&self) -> SequenceNumber {
        self.entries
            .iter()
            .map(|e| e.recovery_point.sequence_number)
            .filter(|&s| s > 0)
            .min()
            .unwrap_or(0)
    }

    /// The highest recovery point this journal has absorbed.
    pub fn recovery_ceiling(&self) -> JournalPoint {
        self.recovery_ceiling
    }

    pub fn set_recovery_ceiling(&mut self, point: JournalPoint) {
        if self.recovery_ceiling.before(&point) {
            self.recovery_ceiling = point;
        }
    }

    fn capacity_with(&self, entry: &SlabJournalEntry) -> u16 {
        let has_full = entry.operation == JournalOperation::BlockMapIncrement
            || self
                .entries
                .iter()
                .any(|e| e.operation == JournalOperation::BlockMapIncrement);
        if has_full {
            SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK
        } else {
            SLAB_JOURNAL_ENTRIES_PER_BLOCK
        }
    }

    /// Append one entry, committing the tail block first when it cannot
    /// hold the entry. Returns the journal point assigned to the entry and
    /// any recovery locks released by a triggered commit.
    pub fn add_entry(
        &mut self,
        entry: SlabJournalEntry,
        store: &mut dyn BlockStore,
    ) -> Result<(JournalPoint, Vec<SequenceNumber>)> {
        let mut released = Vec::new();
        if (self.entries.len() as u16) >= self.capacity_with(&entry) {
            released = self.commit_tail(store)?;
        }
        let point = JournalPoint::new(self.tail, self.entries.len() as u16);
        self.set_recovery_ceiling(entry.recovery_point);
        self.entries.push(entry);
        self.stats.entries_added += 1;
        Ok((point, released))
    }

    /// Write the tail block out and advance the sequence. Releases every
    /// recovery lock held by the committed entries, returning them for the
    /// caller to drop on the lock counter.
    pub fn commit_tail(&mut self, store: &mut dyn BlockStore) -> Result<Vec<SequenceNumber>> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        let has_bm = self
            .entries
            .iter()
            .any(|e| e.operation == JournalOperation::BlockMapIncrement);
        let header = SlabJournalBlockHeader {
            head: self.head,
            sequence_number: self.tail,
            nonce: self.nonce,
            entry_count: self.entries.len() as u16,
            has_block_map_increments: has_bm,
            recovery_ceiling: self.recovery_ceiling,
        };
        let block = pack_slab_journal_block(&header, &self.entries);
        store.write_block(self.block_pbn(self.tail), &block)?;
        self.stats.blocks_committed += 1;
        trace!(
            sequence = self.tail,
            entries = header.entry_count,
            "slab journal block committed"
        );
        let released = self
            .entries
            .drain(..)
            .map(|e| e.recovery_point.sequence_number)
            .filter(|&s| s > 0)
            .collect();
        self.tail += 1;
        Ok(released)
    }

    /// Reclaim journal space covered by durable reference counts: every
    /// block strictly before `saved_floor`'s sequence is reclaimable.
    pub fn reclaim(&mut self, saved_floor: JournalPoint) {
        let limit = saved_floor.sequence_number.min(self.tail);
        if limit > self.head {
            self.head = limit;
        }
    }

    /// Reset after a scrub rebuilt and saved the ref counts: everything on
    /// disk has been applied.
    pub fn reset_after_rebuild(&mut self, tail: SequenceNumber) {
        self.head = tail;
        self.tail = tail;
        self.entries.clear();
    }

    /// Scan the on-disk journal for the highest valid block, returning its
    /// header. Invalid or blank blocks are skipped.
    pub fn find_newest_block(
        &self,
        store: &mut dyn BlockStore,
    ) -> Result<Option<SlabJournalBlockHeader>> {
        let mut newest: Option<SlabJournalBlockHeader> = None;
        let mut buf = [0u8; BLOCK_SIZE];
        for slot in 0..self.size {
            store.read_block(self.origin + slot, &mut buf)?;
            match unpack_slab_journal_block(&buf, self.nonce) {
                Ok((header, _)) => {
                    if header.sequence_number % self.size != slot {
                        continue;
                    }
                    if newest
                        .map(|n| header.sequence_number > n.sequence_number)
                        .unwrap_or(true)
                    {
                        newest = Some(header);
                    }
                }
                Err(_) => continue,
            }
        }
        Ok(newest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;

    fn config() -> SlabConfig {
        SlabConfig::compute(256, 8).unwrap()
    }

    fn data_entry(sbn: u32, recovery: u64) -> SlabJournalEntry {
        SlabJournalEntry {
            sbn,
            operation: JournalOperation::DataIncrement,
            recovery_point: JournalPoint::new(recovery, 0),
        }
    }

    #[test]
    fn block_format_round_trip() {
        let entries = vec![
            data_entry(0, 10),
            SlabJournalEntry {
                sbn: 99,
                operation: JournalOperation::BlockMapIncrement,
                recovery_point: JournalPoint::new(11, 0),
            },
            SlabJournalEntry {
                sbn: 7,
                operation: JournalOperation::DataDecrement,
                recovery_point: JournalPoint::new(12, 0),
            },
        ];
        let header = SlabJournalBlockHeader {
            head: 3,
            sequence_number: 9,
            nonce: 0x77,
            entry_count: entries.len() as u16,
            has_block_map_increments: true,
            recovery_ceiling: JournalPoint::new(12, 0),
        };
        let block = pack_slab_journal_block(&header, &entries);
        let (decoded_header, decoded) = unpack_slab_journal_block(&block, 0x77).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded, entries);
    }

    #[test]
    fn short_entries_drop_recovery_sequence() {
        let entries = vec![data_entry(5, 10)];
        let header = SlabJournalBlockHeader {
            head: 1,
            sequence_number: 1,
            nonce: 1,
            entry_count: 1,
            has_block_map_increments: false,
            recovery_ceiling: JournalPoint::new(10, 0),
        };
        let block = pack_slab_journal_block(&header, &entries);
        let (_, decoded) = unpack_slab_journal_block(&block, 1).unwrap();
        assert_eq!(decoded[0].sbn, 5);
        assert!(!decoded[0].recovery_point.is_valid());
    }

    #[test]
    fn commit_releases_recovery_locks() {
        let mut store = MemStore::new(512);
        let mut journal = SlabJournal::new(100, &config(), 0xBEEF);
        journal.add_entry(data_entry(0, 21), &mut store).unwrap();
        journal.add_entry(data_entry(1, 22), &mut store).unwrap();
        assert_eq!(journal.oldest_recovery_lock(), 21);

        let released = journal.commit_tail(&mut store).unwrap();
        assert_eq!(released, vec![21, 22]);
        assert_eq!(journal.tail(), 2);
        assert_eq!(journal.oldest_recovery_lock(), 0);
    }

    #[test]
    fn full_block_commits_automatically() {
        let mut store = MemStore::new(512);
        let mut journal = SlabJournal::new(100, &config(), 1);
        for i in 0..SLAB_JOURNAL_ENTRIES_PER_BLOCK as u32 {
            journal.add_entry(data_entry(i % 200, 5), &mut store).unwrap();
        }
        // Next entry forces the commit of the full tail block.
        let (point, released) = journal.add_entry(data_entry(0, 6), &mut store).unwrap();
        assert_eq!(point.sequence_number, 2);
        assert!(!released.is_empty());
        assert_eq!(journal.stats.blocks_committed, 1);
    }

    #[test]
    fn block_map_entry_shrinks_capacity() {
        let mut store = MemStore::new(512);
        let mut journal = SlabJournal::new(100, &config(), 1);
        for i in 0..SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK as u32 {
            journal
                .add_entry(
                    SlabJournalEntry {
                        sbn: i,
                        operation: JournalOperation::BlockMapIncrement,
                        recovery_point: JournalPoint::new(9, 0),
                    },
                    &mut store,
                )
                .unwrap();
        }
        let (point, _) = journal
            .add_entry(
                SlabJournalEntry {
                    sbn: 0,
                    operation: JournalOperation::BlockMapIncrement,
                    recovery_point: JournalPoint::new(9, 0),
                },
                &mut store,
            )
            .unwrap();
        assert_eq!(point.sequence_number, 2);
    }

    #[test]
    fn thresholds_and_reclaim() {
        let mut store = MemStore::new(512);
        let mut journal = SlabJournal::new(100, &config(), 1);
        // Commit six blocks' worth to cross the flushing threshold (6 of 8).
        for _ in 0..6 {
            journal.add_entry(data_entry(1, 3), &mut store).unwrap();
            journal.commit_tail(&mut store).unwrap();
        }
        assert!(journal.needs_flushing());
        assert!(!journal.is_blocked());
        journal.add_entry(data_entry(1, 3), &mut store).unwrap();
        journal.commit_tail(&mut store).unwrap();
        assert!(journal.is_blocked());

        // Ref counts durable through sequence 8 reclaim everything.
        journal.reclaim(JournalPoint::new(8, 0));
        assert!(!journal.is_blocked());
        assert!(!journal.needs_flushing());
        assert_eq!(journal.head(), 8);
    }

    #[test]
    fn newest_block_scan() {
        let mut store = MemStore::new(512);
        let mut journal = SlabJournal::new(100, &config(), 5);
        for i in 0..3 {
            journal.add_entry(data_entry(i, 1), &mut store).unwrap();
            journal.commit_tail(&mut store).unwrap();
        }
        let newest = journal.find_newest_block(&mut store).unwrap().unwrap();
        assert_eq!(newest.sequence_number, 3);
        assert_eq!(newest.head, 1);
    }
}
