//! The slab depot: every slab, the per-zone allocators that own them, the
//! slab summary, and the scrubber.

pub mod allocator;
pub mod ref_counts;
pub mod scrubber;
pub mod slab;
pub mod slab_journal;
pub mod summary;

use serde::Serialize;
use tracing::{debug, info};

use crate::admin_state::{AdminState, DrainOperation};
use crate::config::{Layout, SlabConfig, SLAB_SUMMARY_BLOCKS};
use crate::error::{Result, VdoError};
use crate::storage::BlockStore;
use crate::types::{
    JournalOperation, JournalPoint, PhysicalBlockNumber, SequenceNumber, SlabNumber, ZoneId,
};

use allocator::BlockAllocator;
use scrubber::SlabScrubber;
use slab::{Slab, SlabStatus};
use summary::{SlabSummary, SlabSummaryEntry};

#[derive(Debug, Default, Clone, Serialize)]
pub struct DepotStatistics {
    pub slab_count: u64,
    pub data_blocks: u64,
    pub allocated_blocks: u64,
    pub free_blocks: u64,
    pub slabs_scrubbed: u64,
}

/// Reference releases produced by slab journal commits: the physical zone
/// that held each recovery-journal per-entry lock, with the sequence it
/// locked.
pub type ReleasedLocks = Vec<(ZoneId, SequenceNumber)>;

pub struct SlabDepot {
    slab_config: SlabConfig,
    layout: Layout,
    nonce: u64,
    zones: u8,
    pub slabs: Vec<Slab>,
    pub allocators: Vec<BlockAllocator>,
    pub summary: SlabSummary,
    pub scrubber: SlabScrubber,
    pub state: AdminState,
    /// Slabs built by a prepared grow, not yet serving allocations.
    pending_slabs: Vec<Slab>,
    pending_layout: Option<Layout>,
}

impl SlabDepot {
    pub fn new(layout: &Layout, slab_config: SlabConfig, nonce: u64, zones: u8) -> Self {
        let mut depot = Self {
            slab_config,
            layout: layout.clone(),
            nonce,
            zones,
            slabs: Vec::new(),
            allocators: (0..zones).map(BlockAllocator::new).collect(),
            summary: SlabSummary::new(layout.summary_origin, SLAB_SUMMARY_BLOCKS, layout.slab_count),
            scrubber: SlabScrubber::new(),
            state: AdminState::new(),
            pending_slabs: Vec::new(),
            pending_layout: None,
        };
        for number in 0..layout.slab_count {
            let slab = depot.build_slab(number);
            depot.slabs.push(slab);
        }
        for number in 0..layout.slab_count {
            let zone = depot.slabs[number as usize].zone;
            depot.allocators[zone as usize].adopt_slab(&depot.slabs, number);
        }
        depot
    }

    fn build_slab(&self, number: SlabNumber) -> Slab {
        let zone = (number % self.zones as u32) as ZoneId;
        Slab::new(
            number,
            zone,
            self.layout.slab_origin(number),
            &self.slab_config,
            self.nonce,
        )
    }

    pub fn slab_count(&self) -> SlabNumber {
        self.slabs.len() as SlabNumber
    }

    pub fn zone_of_pbn(&self, pbn: PhysicalBlockNumber) -> Option<ZoneId> {
        self.layout
            .slab_for_pbn(pbn)
            .map(|number| self.slabs[number as usize].zone)
    }

    pub fn slab_containing(&self, pbn: PhysicalBlockNumber) -> Option<SlabNumber> {
        self.layout.slab_for_pbn(pbn)
    }

    /// Whether a PBN addresses a data block (not slab metadata) in some
    /// slab.
    pub fn is_data_block(&self, pbn: PhysicalBlockNumber) -> bool {
        self.layout
            .slab_for_pbn(pbn)
            .map(|number| self.slabs[number as usize].sbn_for_pbn(pbn).is_ok())
            .unwrap_or(false)
    }

    /// Write the initial summary for a freshly formatted device: all slabs
    /// clean with zeroed counts.
    pub fn format(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        for number in 0..self.slab_count() {
            self.summary.update(
                number,
                SlabSummaryEntry {
                    tail_block_offset: 0,
                    cleanly_saved: true,
                    load_ref_counts: false,
                },
            );
        }
        self.summary.save(store)
    }

    /// Load every slab per the summary. Slabs not cleanly saved are queued
    /// for scrubbing (high priority when their counts cannot be loaded at
    /// all); the caller runs the scrubber before serving allocations.
    pub fn load(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        let slab_count = self.slab_count();
        self.summary.load(store, slab_count)?;
        for number in 0..slab_count {
            let entry = self.summary.entry(number);
            let slab = &mut self.slabs[number as usize];
            slab.ref_counts_saved = entry.load_ref_counts;
            if entry.load_ref_counts {
                let origin = slab.ref_counts_origin;
                slab.ref_counts.load(store, origin)?;
            }
            // Continue the journal sequence past whatever is on disk, and
            // restore the highest recovery point it had absorbed.
            if let Some(header) = slab.journal.find_newest_block(store)? {
                slab.journal
                    .reset_after_rebuild(header.sequence_number + 1);
                slab.journal.set_recovery_ceiling(header.recovery_ceiling);
            }
            if !entry.cleanly_saved {
                slab.status = if entry.load_ref_counts {
                    SlabStatus::RequiresScrubbing
                } else {
                    SlabStatus::RequiresHighPriorityScrubbing
                };
                self.scrubber.register(
                    number,
                    slab.status == SlabStatus::RequiresHighPriorityScrubbing,
                );
            }
        }
        info!(
            slabs = slab_count,
            to_scrub = self.scrubber.pending_count(),
            "slab depot loaded"
        );
        Ok(())
    }

    /// Scrub every queued slab, then mark them clean in the summary.
    pub fn scrub_all(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        self.scrubber.scrub_all(&mut self.slabs, store)?;
        for number in 0..self.slab_count() {
            if self.slabs[number as usize].status == SlabStatus::Rebuilt {
                let offset = self.slabs[number as usize].journal.tail_block_offset();
                self.summary.update(
                    number,
                    SlabSummaryEntry {
                        tail_block_offset: offset,
                        cleanly_saved: true,
                        load_ref_counts: true,
                    },
                );
            }
        }
        self.summary.save(store)
    }

    /// Allocate one data block in the given physical zone, returning a
    /// provisionally referenced PBN.
    pub fn allocate_block(
        &mut self,
        zone: ZoneId,
        era: SequenceNumber,
    ) -> Result<PhysicalBlockNumber> {
        let allocator = self
            .allocators
            .get_mut(zone as usize)
            .ok_or_else(|| VdoError::Internal(format!("no physical zone {zone}")))?;
        allocator.allocate(&mut self.slabs, era)
    }

    /// Journal and apply a reference change for a data or block-map block.
    pub fn adjust_reference(
        &mut self,
        pbn: PhysicalBlockNumber,
        operation: JournalOperation,
        recovery_point: JournalPoint,
        era: SequenceNumber,
        store: &mut dyn BlockStore,
    ) -> Result<ReleasedLocks> {
        let number = self.layout.slab_for_pbn(pbn).ok_or_else(|| {
            VdoError::InvalidMapping(format!("physical block {pbn} is outside the depot"))
        })?;
        let slab = &mut self.slabs[number as usize];
        let zone = slab.zone;
        let released = slab.adjust_reference(pbn, operation, recovery_point, era, store)?;
        self.note_slab_dirty(number, store)?;
        Ok(released.into_iter().map(|seq| (zone, seq)).collect())
    }

    /// Record in the summary that a slab has un-saved state. A crash from
    /// here on will scrub the slab at the next load.
    fn note_slab_dirty(
        &mut self,
        number: SlabNumber,
        store: &mut dyn BlockStore,
    ) -> Result<()> {
        let slab = &self.slabs[number as usize];
        let entry = SlabSummaryEntry {
            tail_block_offset: slab.journal.tail_block_offset(),
            cleanly_saved: false,
            load_ref_counts: slab.ref_counts_saved,
        };
        if self.summary.entry(number) != entry {
            self.summary.update(number, entry);
            self.summary.save(store)?;
        }
        Ok(())
    }

    /// Return an unconfirmed provisional reference to the free pool. Used
    /// by error paths; a crash achieves the same thing at load time.
    pub fn vacate_provisional(&mut self, pbn: PhysicalBlockNumber) {
        let Some(number) = self.layout.slab_for_pbn(pbn) else {
            return;
        };
        let slab = &mut self.slabs[number as usize];
        if let Ok(sbn) = slab.sbn_for_pbn(pbn) {
            if slab.ref_counts.count(sbn) == ref_counts::PROVISIONAL_REFERENCE {
                slab.ref_counts.reset_to_empty(sbn);
            }
        }
    }

    pub fn reference_count(&self, pbn: PhysicalBlockNumber) -> Option<u8> {
        let number = self.layout.slab_for_pbn(pbn)?;
        let slab = &self.slabs[number as usize];
        let sbn = slab.sbn_for_pbn(pbn).ok()?;
        Some(slab.ref_counts.count(sbn))
    }

    /// Commit the slab journals holding recovery locks older than
    /// `threshold`, oldest lock first, releasing their per-entry locks.
    pub fn release_recovery_locks_before(
        &mut self,
        threshold: SequenceNumber,
        store: &mut dyn BlockStore,
    ) -> Result<ReleasedLocks> {
        let mut released = Vec::new();
        let mut committed = Vec::new();
        for zone in 0..self.allocators.len() {
            loop {
                let Some(number) = self.allocators[zone].oldest_locked_slab(&self.slabs) else {
                    break;
                };
                let slab = &mut self.slabs[number as usize];
                if slab.oldest_recovery_lock() >= threshold {
                    break;
                }
                let owner = slab.zone;
                for seq in slab.journal.commit_tail(store)? {
                    released.push((owner, seq));
                }
                committed.push(number);
            }
        }
        for number in committed {
            self.note_slab_dirty(number, store)?;
        }
        Ok(released)
    }

    /// Write ref-count blocks dirtied at or before `era_floor` in every
    /// slab, as the dirty-era aging pass for the depot.
    pub fn save_ancient_ref_counts(
        &mut self,
        era_floor: SequenceNumber,
        store: &mut dyn BlockStore,
    ) -> Result<()> {
        for slab in self.slabs.iter_mut() {
            slab.save_ancient_ref_counts(store, era_floor)?;
        }
        Ok(())
    }

    /// The five-phase depot drain: stop the scrubber, save every slab,
    /// save the summary, finish. Errors are recorded and surfaced at the
    /// end without aborting the remaining phases.
    pub fn drain(
        &mut self,
        operation: DrainOperation,
        store: &mut dyn BlockStore,
    ) -> Result<ReleasedLocks> {
        let started = self.state.start_draining(operation)?;
        if !started {
            return Ok(Vec::new());
        }
        let mut first_error: Option<VdoError> = None;
        let mut released = Vec::new();

        // Phase: scrubber. Pending scrubs stay queued across a suspend.
        debug!(pending = self.scrubber.pending_count(), "depot drain: scrubber");

        // Phase: slabs.
        for number in 0..self.slab_count() {
            let slab = &mut self.slabs[number as usize];
            let zone = slab.zone;
            match slab.save(store) {
                Ok(locks) => {
                    released.extend(locks.into_iter().map(|seq| (zone, seq)));
                    let offset = slab.journal.tail_block_offset();
                    self.summary.update(
                        number,
                        SlabSummaryEntry {
                            tail_block_offset: offset,
                            cleanly_saved: true,
                            load_ref_counts: true,
                        },
                    );
                }
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        // Phase: summary.
        if let Err(error) = self.summary.save(store) {
            if first_error.is_none() {
                first_error = Some(error);
            }
        }

        // Phase: finished.
        self.state.finish_draining()?;
        match first_error {
            Some(error) => Err(error),
            None => Ok(released),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state.is_quiescent() {
            self.state.start_resuming()?;
            self.state.finish_resuming()?;
        }
        Ok(())
    }

    /// Prepare to grow: build the slab structures for the new capacity.
    /// Nothing is published until `perform_grow`.
    pub fn prepare_grow(&mut self, new_physical_blocks: u64) -> Result<SlabNumber> {
        let new_layout = self.layout.grown_to(new_physical_blocks)?;
        if new_layout.slab_count <= self.slab_count() {
            self.pending_slabs.clear();
            self.pending_layout = None;
            return Err(VdoError::Internal(format!(
                "growth to {new_physical_blocks} blocks adds no slabs"
            )));
        }
        self.pending_slabs = (self.slab_count()..new_layout.slab_count)
            .map(|number| {
                let zone = (number % self.zones as u32) as ZoneId;
                Slab::new(
                    number,
                    zone,
                    new_layout.slab_origin(number),
                    &self.slab_config,
                    self.nonce,
                )
            })
            .collect();
        let added = self.pending_slabs.len() as SlabNumber;
        self.pending_layout = Some(new_layout);
        Ok(added)
    }

    /// Publish a prepared grow: adopt the new slabs and extend the summary.
    pub fn perform_grow(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        let layout = self.pending_layout.take().ok_or_else(|| {
            VdoError::Internal("perform_grow without prepare_grow".to_string())
        })?;
        self.layout = layout;
        for slab in self.pending_slabs.drain(..) {
            let number = slab.number;
            let zone = slab.zone;
            self.slabs.push(slab);
            self.allocators[zone as usize].adopt_slab(&self.slabs, number);
            self.summary.grow(number + 1);
            self.summary.update(
                number,
                SlabSummaryEntry {
                    tail_block_offset: 0,
                    cleanly_saved: true,
                    load_ref_counts: false,
                },
            );
        }
        self.summary.save(store)?;
        info!(slabs = self.slab_count(), "physical growth published");
        Ok(())
    }

    pub fn abandon_grow(&mut self) {
        self.pending_slabs.clear();
        self.pending_layout = None;
    }

    pub fn allocated_blocks(&self) -> u64 {
        self.slabs.iter().map(|s| s.allocated_blocks() as u64).sum()
    }

    pub fn free_blocks(&self) -> u64 {
        self.slabs.iter().map(|s| s.free_blocks() as u64).sum()
    }

    pub fn statistics(&self) -> DepotStatistics {
        DepotStatistics {
            slab_count: self.slabs.len() as u64,
            data_blocks: self
                .slabs
                .iter()
                .map(|s| s.ref_counts.data_blocks() as u64)
                .sum(),
            allocated_blocks: self.allocated_blocks(),
            free_blocks: self.free_blocks(),
            slabs_scrubbed: self.scrubber.stats.slabs_scrubbed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VdoConfig;
    use crate::storage::MemStore;

    fn make_depot() -> (SlabDepot, MemStore) {
        let config = VdoConfig {
            physical_blocks: 2048,
            ..VdoConfig::default()
        };
        let layout = Layout::compute(&config).unwrap();
        let store = MemStore::new(config.physical_blocks);
        let depot = SlabDepot::new(&layout, config.slab_config(), 0xD07, 1);
        (depot, store)
    }

    #[test]
    fn first_allocation_comes_from_slab_zero() {
        let (mut depot, _store) = make_depot();
        let pbn = depot.allocate_block(0, 1).unwrap();
        assert_eq!(depot.layout.slab_for_pbn(pbn), Some(0));
        assert_eq!(depot.slabs[0].sbn_for_pbn(pbn).unwrap(), 0);
        assert_eq!(depot.allocated_blocks(), 1);
    }

    #[test]
    fn adjust_reference_routes_to_owner() {
        let (mut depot, mut store) = make_depot();
        let pbn = depot.allocate_block(0, 1).unwrap();
        depot
            .adjust_reference(pbn, JournalOperation::DataIncrement, JournalPoint::new(5, 0), 1, &mut store)
            .unwrap();
        assert_eq!(depot.reference_count(pbn), Some(1));
        // A PBN in the metadata region is rejected.
        assert!(depot
            .adjust_reference(0, JournalOperation::DataIncrement, JournalPoint::new(5, 0), 1, &mut store)
            .is_err());
    }

    #[test]
    fn drain_saves_slabs_and_summary() {
        let (mut depot, mut store) = make_depot();
        let pbn = depot.allocate_block(0, 1).unwrap();
        depot
            .adjust_reference(pbn, JournalOperation::DataIncrement, JournalPoint::new(3, 0), 1, &mut store)
            .unwrap();
        let released = depot.drain(DrainOperation::Save, &mut store).unwrap();
        assert_eq!(released, vec![(0, 3)]);
        assert!(depot.slabs[0].is_clean());
        depot.resume().unwrap();

        // A reload sees clean slabs and the saved counts.
        let config = VdoConfig {
            physical_blocks: 2048,
            ..VdoConfig::default()
        };
        let layout = Layout::compute(&config).unwrap();
        let mut reloaded = SlabDepot::new(&layout, config.slab_config(), 0xD07, 1);
        reloaded.load(&mut store).unwrap();
        assert!(!reloaded.scrubber.has_slabs_to_scrub());
        assert_eq!(reloaded.reference_count(pbn), Some(1));
        assert_eq!(reloaded.allocated_blocks(), 1);
    }

    #[test]
    fn unclean_slab_is_scrubbed_on_load() {
        let (mut depot, mut store) = make_depot();
        depot.format(&mut store).unwrap();
        let pbn = depot.allocate_block(0, 1).unwrap();
        depot
            .adjust_reference(pbn, JournalOperation::DataIncrement, JournalPoint::new(3, 0), 1, &mut store)
            .unwrap();
        // Commit the journal but crash before saving counts or summary.
        depot.slabs[0].journal.commit_tail(&mut store).unwrap();
        store.flush().unwrap();

        let config = VdoConfig {
            physical_blocks: 2048,
            ..VdoConfig::default()
        };
        let layout = Layout::compute(&config).unwrap();
        let mut recovered = SlabDepot::new(&layout, config.slab_config(), 0xD07, 1);
        recovered.load(&mut store).unwrap();
        assert!(recovered.scrubber.has_slabs_to_scrub());
        recovered.scrub_all(&mut store).unwrap();
        assert_eq!(recovered.reference_count(pbn), Some(1));
        assert_eq!(recovered.scrubber.stats.slabs_scrubbed, 1);
    }

    #[test]
    fn grow_is_two_phase() {
        let (mut depot, mut store) = make_depot();
        let before = depot.slab_count();
        let added = depot.prepare_grow(3072).unwrap();
        assert!(added > 0);
        // Not visible until performed.
        assert_eq!(depot.slab_count(), before);
        store.grow(3072).unwrap();
        depot.perform_grow(&mut store).unwrap();
        assert_eq!(depot.slab_count(), before + added);
        assert!(depot.free_blocks() > 0);
    }

    #[test]
    fn abandoned_grow_changes_nothing() {
        let (mut depot, _store) = make_depot();
        let before = depot.slab_count();
        depot.prepare_grow(3072).unwrap();
        depot.abandon_grow();
        assert_eq!(depot.slab_count(), before);
    }
}
