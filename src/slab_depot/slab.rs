//! One slab: a contiguous span of physical blocks with its own journal,
//! reference counts, and data area, owned by exactly one physical zone.

use crate::config::SlabConfig;
use crate::error::{Result, VdoError};
use crate::storage::BlockStore;
use crate::types::{
    JournalOperation, JournalPoint, PhysicalBlockNumber, SequenceNumber, SlabBlockNumber,
    SlabNumber, ZoneId,
};

use super::ref_counts::RefCounts;
use super::slab_journal::{SlabJournal, SlabJournalEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabStatus {
    Rebuilt,
    Replaying,
    RequiresScrubbing,
    RequiresHighPriorityScrubbing,
    Rebuilding,
}

pub struct Slab {
    pub number: SlabNumber,
    pub zone: ZoneId,
    /// First block of the slab: the journal prefix starts here.
    pub origin: PhysicalBlockNumber,
    pub ref_counts_origin: PhysicalBlockNumber,
    pub data_origin: PhysicalBlockNumber,
    pub status: SlabStatus,
    /// Whether the on-disk ref-count blocks have ever been written and are
    /// worth loading as a replay base.
    pub ref_counts_saved: bool,
    pub ref_counts: RefCounts,
    pub journal: SlabJournal,
}

impl Slab {
    pub fn new(
        number: SlabNumber,
        zone: ZoneId,
        origin: PhysicalBlockNumber,
        config: &SlabConfig,
        nonce: u64,
    ) -> Self {
        let ref_counts_origin = origin + config.slab_journal_blocks as u64;
        let data_origin = ref_counts_origin + config.reference_count_blocks as u64;
        Self {
            number,
            zone,
            origin,
            ref_counts_origin,
            data_origin,
            status: SlabStatus::Rebuilt,
            ref_counts_saved: false,
            ref_counts: RefCounts::new(config.data_blocks),
            journal: SlabJournal::new(origin, config, nonce),
        }
    }

    pub fn journal_nonce(&self) -> u64 {
        self.journal.nonce()
    }

    pub fn free_blocks(&self) -> u32 {
        self.ref_counts.free_count()
    }

    pub fn allocated_blocks(&self) -> u32 {
        self.ref_counts.allocated_count()
    }

    /// Translate an absolute PBN to the slab-relative data block number.
    pub fn sbn_for_pbn(&self, pbn: PhysicalBlockNumber) -> Result<SlabBlockNumber> {
        if pbn < self.data_origin {
            return Err(VdoError::InvalidMapping(format!(
                "physical block {pbn} is slab {} metadata",
                self.number
            )));
        }
        let sbn = pbn - self.data_origin;
        if sbn >= self.ref_counts.data_blocks() as u64 {
            return Err(VdoError::InvalidMapping(format!(
                "physical block {pbn} beyond slab {} data area",
                self.number
            )));
        }
        Ok(sbn as SlabBlockNumber)
    }

    pub fn pbn_for_sbn(&self, sbn: SlabBlockNumber) -> PhysicalBlockNumber {
        self.data_origin + sbn as u64
    }

    /// Allocate one data block, leaving a provisional reference on it.
    pub fn allocate(&mut self, era: SequenceNumber) -> Option<PhysicalBlockNumber> {
        self.ref_counts
            .allocate_provisional(era)
            .map(|sbn| self.pbn_for_sbn(sbn))
    }

    /// Journal a reference change and apply it to the in-memory counts.
    /// Returns any recovery-journal locks released by a tail-block commit
    /// the addition triggered.
    pub fn adjust_reference(
        &mut self,
        pbn: PhysicalBlockNumber,
        operation: JournalOperation,
        recovery_point: JournalPoint,
        era: SequenceNumber,
        store: &mut dyn BlockStore,
    ) -> Result<Vec<SequenceNumber>> {
        let sbn = self.sbn_for_pbn(pbn)?;
        let mut released = Vec::new();
        if self.journal.is_blocked() {
            // Reclaim journal space by making the covered counts durable.
            self.journal.stats.blocked_additions += 1;
            self.save_ref_counts(store)?;
        } else if self.journal.needs_flushing() {
            self.journal.stats.flushes_triggered += 1;
            released.extend(self.journal.commit_tail(store)?);
            self.save_ref_counts(store)?;
        }
        let entry = SlabJournalEntry {
            sbn,
            operation,
            recovery_point,
        };
        let (point, more) = self.journal.add_entry(entry, store)?;
        released.extend(more);
        self.ref_counts.apply(sbn, operation, point, era)?;
        Ok(released)
    }

    /// Apply a replayed entry directly, bypassing lock bookkeeping. The
    /// journal point keeps the application idempotent.
    pub fn replay_entry(
        &mut self,
        sbn: SlabBlockNumber,
        operation: JournalOperation,
        point: JournalPoint,
    ) -> Result<bool> {
        self.ref_counts.apply(sbn, operation, point, point.sequence_number)
    }

    /// Commit the journal tail and write every dirty ref-count block; the
    /// slab is clean afterwards.
    pub fn save(&mut self, store: &mut dyn BlockStore) -> Result<Vec<SequenceNumber>> {
        let released = self.journal.commit_tail(store)?;
        self.save_ref_counts(store)?;
        Ok(released)
    }

    fn save_ref_counts(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        self.ref_counts.save_dirty(store, self.ref_counts_origin)?;
        self.ref_counts_saved = true;
        // Every applied entry is now durable in the counts; committed
        // blocks before the tail are reclaimable.
        self.journal.reclaim(JournalPoint::new(self.journal.tail(), 0));
        Ok(())
    }

    /// Write ref-count blocks that have been dirty since `era_floor` or
    /// earlier, then reclaim what became durable.
    pub fn save_ancient_ref_counts(
        &mut self,
        store: &mut dyn BlockStore,
        era_floor: SequenceNumber,
    ) -> Result<u32> {
        let written = self
            .ref_counts
            .save_ancient(store, self.ref_counts_origin, era_floor)?;
        Ok(written)
    }

    pub fn is_clean(&self) -> bool {
        !self.ref_counts.is_dirty() && !self.journal.has_uncommitted_entries()
    }

    /// The oldest recovery journal lock this slab still holds, or zero.
    pub fn oldest_recovery_lock(&self) -> SequenceNumber {
        self.journal.oldest_recovery_lock()
    }

    /// The highest recovery point already absorbed by this slab's journal.
    pub fn recovery_ceiling(&self) -> JournalPoint {
        self.journal.recovery_ceiling()
    }
}
