//! The recovery journal: a circular write-ahead log of every logical
//! mapping change, with per-entry locks that keep a journal block alive
//! until the block map and slab journals have durably applied its entries.

pub mod format;

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::Layout;
use crate::data_vio::DataVioId;
use crate::error::{Result, VdoError};
use crate::lock_counter::LockCounter;
use crate::storage::BlockStore;
use crate::super_block::JournalComponentState;
use crate::types::{JournalPoint, SequenceNumber, ZoneId, ZoneType};
use crate::wait_queue::WaitQueue;

use format::{
    pack_journal_block, RecoveryBlockHeader, RecoveryJournalEntry, RECOVERY_ENTRIES_PER_BLOCK,
};

/// In-memory tail block states. At most one commit per block is in flight;
/// requests arriving mid-commit coalesce through `WaitingToCommit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailBlockState {
    Empty,
    Filling,
    WaitingToCommit,
    Committing,
    Committed,
}

struct TailBlock {
    state: TailBlockState,
    sequence: SequenceNumber,
    entries: Vec<RecoveryJournalEntry>,
    committed_entries: u16,
    commit_waiters: WaitQueue<DataVioId>,
}

impl TailBlock {
    fn new() -> Self {
        Self {
            state: TailBlockState::Empty,
            sequence: 0,
            entries: Vec::new(),
            committed_entries: 0,
            commit_waiters: WaitQueue::new(),
        }
    }

    fn reset(&mut self) {
        self.state = TailBlockState::Empty;
        self.sequence = 0;
        self.entries.clear();
        self.committed_entries = 0;
        debug_assert!(self.commit_waiters.is_empty());
    }

}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryJournalStatistics {
    pub entries_added: u64,
    pub blocks_committed: u64,
    pub commits: u64,
    pub blocks_reaped: u64,
    pub entries_queued: u64,
    pub write_errors: u64,
}

/// What the caller must do after an `add_entry`.
#[derive(Debug, PartialEq, Eq)]
pub enum AddEntryOutcome {
    /// The entry was packed into the block named by the journal point; the
    /// vio is parked on that block's commit waiters and a commit should be
    /// scheduled.
    Added { point: JournalPoint },
    /// No tail block or disk space; the vio is parked on the space queue.
    Queued,
}

/// Effects of a commit pass, applied by the caller on the owning zones.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// Vios whose entries are now durable, in journal order.
    pub woken: Vec<DataVioId>,
    /// Vios readmitted from the space queue; their journal stage reruns.
    pub readmitted: Vec<DataVioId>,
    /// The era all logical zones should advance to.
    pub new_era: Option<SequenceNumber>,
}

#[derive(Debug, Default)]
pub struct ReapOutcome {
    pub blocks_reaped: u64,
    /// Vios readmitted because reaping freed on-disk space.
    pub readmitted: Vec<DataVioId>,
}

pub struct RecoveryJournal {
    origin: u64,
    size: u64,
    nonce: u64,
    entries_per_block: u16,
    pub recovery_count: u8,

    tail: SequenceNumber,
    block_map_head: SequenceNumber,
    slab_journal_head: SequenceNumber,
    last_write_acknowledged: SequenceNumber,
    append_point: JournalPoint,
    commit_point: JournalPoint,

    blocks: Vec<TailBlock>,
    free_blocks: Vec<usize>,
    active: Option<usize>,

    entry_waiters: WaitQueue<DataVioId>,

    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,

    pub lock_counter: LockCounter,
    pub stats: RecoveryJournalStatistics,
}

impl RecoveryJournal {
    pub fn new(
        layout: &Layout,
        nonce: u64,
        tail_buffer_blocks: usize,
        entries_per_block: u16,
        logical_zones: usize,
        physical_zones: usize,
    ) -> Self {
        debug_assert!(entries_per_block <= RECOVERY_ENTRIES_PER_BLOCK);
        let mut free_blocks: Vec<usize> = (0..tail_buffer_blocks).collect();
        free_blocks.reverse();
        Self {
            origin: layout.journal_origin,
            size: layout.journal_blocks,
            nonce,
            entries_per_block,
            recovery_count: 0,
            tail: 1,
            block_map_head: 1,
            slab_journal_head: 1,
            last_write_acknowledged: 0,
            append_point: JournalPoint::default(),
            commit_point: JournalPoint::default(),
            blocks: (0..tail_buffer_blocks).map(|_| TailBlock::new()).collect(),
            free_blocks,
            active: None,
            entry_waiters: WaitQueue::new(),
            logical_blocks_used: 0,
            block_map_data_blocks: 0,
            lock_counter: LockCounter::new(
                layout.journal_blocks as usize,
                logical_zones,
                physical_zones,
            ),
            stats: RecoveryJournalStatistics::default(),
        }
    }

    pub fn load(&mut self, state: &JournalComponentState, recovery_count: u8) {
        self.recovery_count = recovery_count;
        self.tail = state.journal_start.max(1);
        self.block_map_head = self.tail;
        self.slab_journal_head = self.tail;
        self.last_write_acknowledged = self.tail.saturating_sub(1);
        self.logical_blocks_used = state.logical_blocks_used;
        self.block_map_data_blocks = state.block_map_data_blocks;
    }

    pub fn record(&self) -> JournalComponentState {
        JournalComponentState {
            journal_start: self.tail,
            block_map_head: self.block_map_head,
            slab_journal_head: self.slab_journal_head,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        }
    }

    pub fn head(&self) -> SequenceNumber {
        self.block_map_head.min(self.slab_journal_head)
    }

    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    pub fn active_sequence(&self) -> Option<SequenceNumber> {
        self.active.map(|index| self.blocks[index].sequence)
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn entries_per_block(&self) -> u16 {
        self.entries_per_block
    }

    /// Whether every tail block is free and no entries are waiting: the
    /// quiescent condition for drains.
    pub fn is_quiescent_now(&self) -> bool {
        self.active.is_none()
            && self.free_blocks.len() == self.blocks.len()
            && self.entry_waiters.is_empty()
    }

    fn on_disk_full(&self) -> bool {
        (self.tail - self.head()) >= self.size
    }

    /// The physical block a sequence number lives in. Journal size is a
    /// power of two, so this is a mask of the low bits.
    fn block_pbn(&self, sequence: SequenceNumber) -> u64 {
        self.origin + (sequence & (self.size - 1))
    }

    fn advance_tail(&mut self) -> Option<usize> {
        if self.on_disk_full() {
            return None;
        }
        let index = self.free_blocks.pop()?;
        let sequence = self.tail;
        self.tail += 1;
        let block = &mut self.blocks[index];
        block.state = TailBlockState::Filling;
        block.sequence = sequence;
        // The journal's own reference: held until the block is committed
        // for the last time, so a filling block can never be reaped.
        self.lock_counter.initialize_journal_count(sequence, 1);
        self.active = Some(index);
        trace!(sequence, "journal tail block activated");
        Some(index)
    }

    /// Add an entry for a data-vio. The caller supplies the zones that
    /// will later apply the entry downstream; a per-entry lock is taken
    /// for each so the block cannot be reaped before they finish. With
    /// `wait_for_commit` the vio parks on the block's commit waiters
    /// (data writes); block-map updates do not wait.
    pub fn add_entry(
        &mut self,
        vio: DataVioId,
        wait_for_commit: bool,
        entry: RecoveryJournalEntry,
        logical_zone: ZoneId,
        physical_zones: &[ZoneId],
    ) -> AddEntryOutcome {
        let index = match self.active {
            Some(index) if (self.blocks[index].entries.len() as u16) < self.entries_per_block => {
                index
            }
            _ => match self.advance_tail() {
                Some(index) => index,
                None => {
                    self.entry_waiters.enqueue(vio);
                    self.stats.entries_queued += 1;
                    return AddEntryOutcome::Queued;
                }
            },
        };

        let sequence = self.blocks[index].sequence;
        let entry_index = self.blocks[index].entries.len() as u16;
        self.blocks[index].entries.push(entry);
        if wait_for_commit {
            self.blocks[index].commit_waiters.enqueue(vio);
        }
        // Any new entry is an implicit commit request.
        self.blocks[index].state = TailBlockState::WaitingToCommit;
        self.stats.entries_added += 1;

        self.lock_counter.acquire(sequence, ZoneType::Logical, logical_zone);
        for &zone in physical_zones {
            self.lock_counter.acquire(sequence, ZoneType::Physical, zone);
        }

        if entry.operation.is_block_map() {
            if entry.operation.is_increment() {
                self.block_map_data_blocks += 1;
            } else {
                self.block_map_data_blocks = self.block_map_data_blocks.saturating_sub(1);
            }
        } else if entry.operation.is_increment() {
            if !entry.old_location.is_mapped() {
                self.logical_blocks_used += 1;
            }
        } else if entry.old_location.is_mapped() && !entry.new_location.is_mapped() {
            self.logical_blocks_used = self.logical_blocks_used.saturating_sub(1);
        }

        let point = JournalPoint::new(sequence, entry_index);
        self.append_point = JournalPoint::new(sequence, entry_index + 1);

        if (self.blocks[index].entries.len() as u16) == self.entries_per_block {
            // Full; further entries need a new block.
            self.active = None;
        }
        AddEntryOutcome::Added { point }
    }

    fn header_for(&self, block: &TailBlock) -> RecoveryBlockHeader {
        RecoveryBlockHeader {
            sequence_number: block.sequence,
            nonce: self.nonce,
            entry_count: block.entries.len() as u16,
            check_byte: format::compute_check_byte(block.sequence, self.size),
            recovery_count: self.recovery_count,
            block_map_head: self.block_map_head,
            slab_journal_head: self.slab_journal_head,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        }
    }

    /// Commit every tail block holding uncommitted entries, oldest first.
    /// The flush ahead of each journal write is the crash-consistency
    /// boundary: all data and metadata the entries describe become durable
    /// before the entries themselves do.
    pub fn commit(&mut self, store: &mut dyn BlockStore) -> Result<CommitOutcome> {
        let mut outcome = CommitOutcome::default();
        let mut pending: Vec<usize> = (0..self.blocks.len())
            .filter(|&i| self.blocks[i].state == TailBlockState::WaitingToCommit)
            .collect();
        pending.sort_by_key(|&i| self.blocks[i].sequence);
        if pending.is_empty() {
            return Ok(outcome);
        }
        self.stats.commits += 1;

        for index in pending {
            let sequence = self.blocks[index].sequence;
            self.blocks[index].state = TailBlockState::Committing;
            let header = self.header_for(&self.blocks[index]);
            let data = pack_journal_block(&header, &self.blocks[index].entries);
            store.flush()?;
            if let Err(error) = store.write_block_fua(self.block_pbn(sequence), &data) {
                self.stats.write_errors += 1;
                self.blocks[index].state = TailBlockState::WaitingToCommit;
                return Err(error);
            }

            let committed = self.blocks[index].entries.len() as u16;
            self.blocks[index].committed_entries = committed;
            self.last_write_acknowledged = self.last_write_acknowledged.max(sequence);
            self.commit_point = JournalPoint::new(sequence, committed.saturating_sub(1));
            self.stats.blocks_committed += 1;
            outcome
                .woken
                .extend(self.blocks[index].commit_waiters.notify_all());
            debug!(sequence, entries = committed, "journal block committed");

            let full = committed == self.entries_per_block;
            let is_active = self.active == Some(index);
            if full || !is_active {
                // Committed for the last time; drop the journal's own
                // reference and recycle the buffer.
                self.blocks[index].state = TailBlockState::Committed;
                self.blocks[index].reset();
                self.free_blocks.push(index);
                if is_active {
                    self.active = None;
                }
                self.lock_counter.release_journal_reference(sequence);
            } else {
                self.blocks[index].state = TailBlockState::Filling;
            }
        }

        outcome.new_era = Some(self.tail);
        self.readmit_waiters(&mut outcome.readmitted);
        Ok(outcome)
    }

    fn readmit_waiters(&mut self, readmitted: &mut Vec<DataVioId>) {
        while self.entry_waiters.has_waiters()
            && !self.free_blocks.is_empty()
            && !self.on_disk_full()
        {
            if let Some(vio) = self.entry_waiters.notify_next() {
                readmitted.push(vio);
            }
        }
    }

    /// Acquire a block reference on behalf of a dirty metadata page.
    pub fn acquire_block_reference(
        &mut self,
        sequence: SequenceNumber,
        zone_type: ZoneType,
        zone: ZoneId,
    ) {
        if sequence > 0 {
            self.lock_counter.acquire(sequence, zone_type, zone);
        }
    }

    /// Release a block reference. Returns true when the journal thread
    /// must be notified to attempt a reap.
    #[must_use]
    pub fn release_block_reference(
        &mut self,
        sequence: SequenceNumber,
        zone_type: ZoneType,
        zone: ZoneId,
    ) -> bool {
        if sequence == 0 {
            return false;
        }
        self.lock_counter.release(sequence, zone_type, zone)
    }

    /// Advance the heads over every block with no remaining references.
    /// Runs on the journal thread in response to lock-counter
    /// notifications; acknowledges and re-checks until no more progress.
    pub fn reap(&mut self) -> ReapOutcome {
        let mut outcome = ReapOutcome::default();
        loop {
            let before = self.head();
            while self.block_map_head < self.tail
                && !self.lock_counter.is_locked(self.block_map_head, ZoneType::Logical)
            {
                self.block_map_head += 1;
            }
            while self.slab_journal_head < self.tail
                && !self
                    .lock_counter
                    .is_locked(self.slab_journal_head, ZoneType::Physical)
            {
                self.slab_journal_head += 1;
            }
            let reaped = self.head() - before;
            outcome.blocks_reaped += reaped;
            self.stats.blocks_reaped += reaped;
            self.lock_counter.acknowledge_unlock();
            if reaped == 0 {
                break;
            }
        }
        if outcome.blocks_reaped > 0 {
            trace!(
                head = self.head(),
                tail = self.tail,
                reaped = outcome.blocks_reaped,
                "journal reaped"
            );
            self.readmit_waiters(&mut outcome.readmitted);
        }
        outcome
    }

    /// Drain: commit and retire the active tail block even if partially
    /// filled, reaching quiescence.
    pub fn drain(&mut self, store: &mut dyn BlockStore) -> Result<CommitOutcome> {
        if let Some(index) = self.active.take() {
            let sequence = self.blocks[index].sequence;
            if self.blocks[index].entries.is_empty() {
                // Never written; return the unused sequence number.
                self.lock_counter.release_journal_reference(sequence);
                self.blocks[index].reset();
                self.free_blocks.push(index);
                self.tail = sequence;
            } else {
                self.blocks[index].state = TailBlockState::WaitingToCommit;
            }
        }
        // With no active block, the commit retires every pending block.
        self.commit(store)
    }

    /// Fail every queued waiter; used when entering read-only mode.
    pub fn fail_all_waiters(&mut self) -> Vec<DataVioId> {
        let mut failed = self.entry_waiters.notify_all();
        for block in self.blocks.iter_mut() {
            failed.extend(block.commit_waiters.notify_all());
        }
        failed
    }

    /// Number of entry waiters currently queued for space.
    pub fn waiter_count(&self) -> usize {
        self.entry_waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Layout, VdoConfig};
    use crate::storage::MemStore;
    use crate::types::{DataLocation, JournalOperation};

    fn entry(lbn: u64, new_pbn: u64) -> RecoveryJournalEntry {
        RecoveryJournalEntry {
            operation: JournalOperation::DataIncrement,
            lbn,
            old_location: DataLocation::UNMAPPED,
            new_location: DataLocation::uncompressed(new_pbn),
        }
    }

    fn make_journal(entries_per_block: u16) -> (RecoveryJournal, MemStore) {
        let config = VdoConfig::default();
        let layout = Layout::compute(&config).unwrap();
        let store = MemStore::new(config.physical_blocks);
        let journal = RecoveryJournal::new(&layout, 0x1234, 4, entries_per_block, 1, 1);
        (journal, store)
    }

    #[test]
    fn entry_then_commit_wakes_waiter() {
        let (mut journal, mut store) = make_journal(4);
        let outcome = journal.add_entry(7, true, entry(0, 100), 0, &[0]);
        let point = match outcome {
            AddEntryOutcome::Added { point } => point,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(point, JournalPoint::new(1, 0));

        let commit = journal.commit(&mut store).unwrap();
        assert_eq!(commit.woken, vec![7]);
        assert_eq!(commit.new_era, Some(2));
        assert_eq!(journal.stats.blocks_committed, 1);
    }

    #[test]
    fn full_block_recycles_and_sequences_advance() {
        let (mut journal, mut store) = make_journal(2);
        for vio in 0..2 {
            journal.add_entry(vio, true, entry(vio as u64, 100), 0, &[0]);
        }
        // Block 1 is full; next entry opens sequence 2.
        match journal.add_entry(9, true, entry(9, 101), 0, &[0]) {
            AddEntryOutcome::Added { point } => assert_eq!(point.sequence_number, 2),
            other => panic!("unexpected {other:?}"),
        }
        let commit = journal.commit(&mut store).unwrap();
        assert_eq!(commit.woken, vec![0, 1, 9]);
    }

    #[test]
    fn journal_space_exhaustion_queues_and_reap_readmits() {
        let (mut journal, mut store) = make_journal(1);
        // One entry per block; fill the entire on-disk journal.
        let size = journal.size;
        for vio in 0..size {
            match journal.add_entry(vio as usize, true, entry(vio, 100 + vio), 0, &[]) {
                AddEntryOutcome::Added { .. } => {}
                other => panic!("filled early at {vio}: {other:?}"),
            }
            journal.commit(&mut store).unwrap();
        }
        // Logical-zone locks are still held for every entry, so the
        // journal is full and the next vio queues.
        assert_eq!(
            journal.add_entry(999, true, entry(999, 7), 0, &[]),
            AddEntryOutcome::Queued
        );

        // Release the per-entry locks; the reap frees space.
        for sequence in 1..=size {
            let _ = journal.release_block_reference(sequence, ZoneType::Logical, 0);
        }
        let reaped = journal.reap();
        assert!(reaped.blocks_reaped > 0);
        assert_eq!(reaped.readmitted, vec![999]);
        assert_eq!(journal.head(), journal.tail());
    }

    #[test]
    fn partial_block_stays_active_after_commit() {
        let (mut journal, mut store) = make_journal(4);
        journal.add_entry(1, true, entry(0, 50), 0, &[]);
        journal.commit(&mut store).unwrap();
        // The same block keeps accepting entries after a partial commit.
        match journal.add_entry(2, true, entry(1, 51), 0, &[]) {
            AddEntryOutcome::Added { point } => {
                assert_eq!(point, JournalPoint::new(1, 1));
            }
            other => panic!("unexpected {other:?}"),
        }
        let commit = journal.commit(&mut store).unwrap();
        assert_eq!(commit.woken, vec![2]);
    }

    #[test]
    fn logical_blocks_used_accounting() {
        let (mut journal, _store) = make_journal(8);
        journal.add_entry(1, true, entry(0, 50), 0, &[]);
        assert_eq!(journal.logical_blocks_used, 1);
        // Overwrite: old mapped, new mapped.
        journal.add_entry(
            2,
            true,
            RecoveryJournalEntry {
                operation: JournalOperation::DataIncrement,
                lbn: 0,
                old_location: DataLocation::uncompressed(50),
                new_location: DataLocation::uncompressed(51),
            },
            0,
            &[],
        );
        assert_eq!(journal.logical_blocks_used, 1);
        // Discard: old mapped, new unmapped.
        journal.add_entry(
            3,
            true,
            RecoveryJournalEntry {
                operation: JournalOperation::DataDecrement,
                lbn: 0,
                old_location: DataLocation::uncompressed(51),
                new_location: DataLocation::UNMAPPED,
            },
            0,
            &[],
        );
        assert_eq!(journal.logical_blocks_used, 0);
    }

    #[test]
    fn drain_retires_partial_block() {
        let (mut journal, mut store) = make_journal(8);
        journal.add_entry(1, true, entry(3, 60), 0, &[]);
        let outcome = journal.drain(&mut store).unwrap();
        assert_eq!(outcome.woken, vec![1]);
        assert!(journal.is_quiescent_now());
        // Tail advanced past the committed block.
        assert_eq!(journal.tail(), 2);
    }

    #[test]
    fn write_error_is_surfaced() {
        let (mut journal, mut store) = make_journal(4);
        journal.add_entry(1, true, entry(0, 10), 0, &[]);
        store.fail_writes_after(0);
        assert!(journal.commit(&mut store).is_err());
        assert_eq!(journal.stats.write_errors, 1);
        let failed = journal.fail_all_waiters();
        assert_eq!(failed, vec![1]);
    }
}
