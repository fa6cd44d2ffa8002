//! The block map: an arboreal forest of mapping pages striped over
//! logical zones, backed by the per-zone page cache.
//!
//! The forest has `root_count` trees of fixed height. The `i`-th leaf page
//! of the logical space lives in tree `i % root_count`, and each tree's
//! pages are served by the logical zone `root_index % zone_count`. Root
//! pages live in a fixed partition; interior pages are allocated from the
//! slab depot on first reference and journalled as block-map increments.

pub mod dirty_lists;
pub mod page;
pub mod page_cache;

use serde::Serialize;
use tracing::trace;

use crate::data_vio::DataVioId;
use crate::error::{Result, VdoError};
use crate::recovery_journal::format::RecoveryJournalEntry;
use crate::recovery_journal::{AddEntryOutcome, RecoveryJournal};
use crate::slab_depot::SlabDepot;
use crate::storage::BlockStore;
use crate::types::{
    BlockMappingState, DataLocation, JournalOperation, LogicalBlockNumber, PhysicalBlockNumber,
    SequenceNumber, ZoneId, ZoneType,
};

use page::ENTRIES_PER_PAGE;
use page_cache::{GetPage, VdoPageCache};

/// Levels of pages from root to leaf, inclusive.
pub const TREE_HEIGHT: u8 = 5;

#[derive(Debug, Default, Clone, Serialize)]
pub struct BlockMapStatistics {
    pub leaf_lookups: u64,
    pub interior_pages_allocated: u64,
    pub walks_queued: u64,
}

pub struct BlockMapZone {
    pub zone: ZoneId,
    pub cache: VdoPageCache,
}

/// Where a resolved walk landed: the zone whose cache holds the busy leaf
/// page, the slot of that page, and the entry slot for the LBN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafRef {
    pub zone_index: usize,
    pub page_slot: usize,
    pub entry_slot: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WalkResult {
    Leaf(LeafRef),
    /// Read path only: an interior page is absent, so the LBN is unmapped.
    Unmapped,
    /// Parked on cache pressure or journal space; retried by readmission.
    Queued,
}

pub struct WalkOutcome {
    pub result: WalkResult,
    /// Whether a released journal lock warrants a reap attempt.
    pub notify_reap: bool,
    /// Requesters woken by page releases; the caller reschedules them.
    pub woken: Vec<DataVioId>,
}

pub struct BlockMap {
    nonce: u64,
    root_origin: PhysicalBlockNumber,
    root_count: u32,
    logical_blocks: u64,
    physical_zones: u8,
    pub zones: Vec<BlockMapZone>,
    pub stats: BlockMapStatistics,
}

impl BlockMap {
    pub fn new(
        nonce: u64,
        root_origin: PhysicalBlockNumber,
        root_count: u32,
        logical_blocks: u64,
        logical_zones: u8,
        physical_zones: u8,
        cache_capacity: usize,
        maximum_age: u64,
    ) -> Self {
        Self {
            nonce,
            root_origin,
            root_count,
            logical_blocks,
            physical_zones,
            zones: (0..logical_zones)
                .map(|zone| BlockMapZone {
                    zone,
                    cache: VdoPageCache::new(zone, nonce, cache_capacity, maximum_age),
                })
                .collect(),
            stats: BlockMapStatistics::default(),
        }
    }

    pub fn logical_blocks(&self) -> u64 {
        self.logical_blocks
    }

    pub fn root_count(&self) -> u32 {
        self.root_count
    }

    pub fn root_pbn(&self, root_index: u32) -> PhysicalBlockNumber {
        self.root_origin + root_index as u64
    }

    fn page_index(lbn: LogicalBlockNumber) -> u64 {
        lbn / ENTRIES_PER_PAGE as u64
    }

    pub fn root_index_for_lbn(&self, lbn: LogicalBlockNumber) -> u32 {
        (Self::page_index(lbn) % self.root_count as u64) as u32
    }

    /// The logical zone serving an LBN's tree.
    pub fn zone_for_lbn(&self, lbn: LogicalBlockNumber) -> usize {
        (self.root_index_for_lbn(lbn) as usize) % self.zones.len()
    }

    /// The physical zone partnered with a logical zone for interior page
    /// allocations.
    fn physical_partner(&self, zone_index: usize) -> ZoneId {
        (zone_index % self.physical_zones as usize) as ZoneId
    }

    /// Write the (empty, initialised) root pages of a fresh device.
    pub fn format(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        let mut buf = vec![0u8; crate::types::BLOCK_SIZE];
        for root in 0..self.root_count {
            let pbn = self.root_pbn(root);
            page::format_page(&mut buf, self.nonce, pbn, true);
            store.write_block(pbn, &buf)?;
        }
        Ok(())
    }

    /// Walk from the root to the leaf page covering `lbn`. With `allocate`
    /// set, absent interior pages are created (journalled block-map
    /// increments against the zone's physical partner); otherwise an
    /// absent page resolves to `Unmapped`. On success the leaf page is
    /// busy in its zone's cache and the caller must release it.
    #[allow(clippy::too_many_arguments)]
    pub fn walk(
        &mut self,
        lbn: LogicalBlockNumber,
        vio: DataVioId,
        allocate: bool,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
        depot: &mut SlabDepot,
    ) -> Result<WalkOutcome> {
        let page_index = Self::page_index(lbn);
        let root_index = self.root_index_for_lbn(lbn);
        let zone_index = self.zone_for_lbn(lbn);
        let tree_position = page_index / self.root_count as u64;
        let entry_slot = (lbn % ENTRIES_PER_PAGE as u64) as usize;
        let branching = ENTRIES_PER_PAGE as u64;
        let mut notify_reap = false;
        let mut woken = Vec::new();

        let mut current_pbn = self.root_pbn(root_index);
        // Descend the interior levels; level 1 pages point at leaves.
        for level in (1..TREE_HEIGHT).rev() {
            let child_slot =
                ((tree_position / branching.pow(level as u32 - 1)) % branching) as usize;
            let page_slot = {
                let cache = &mut self.zones[zone_index].cache;
                match cache.get_page(current_pbn, vio, store, journal)? {
                    GetPage::Slot(slot) => slot,
                    GetPage::Queued => {
                        self.stats.walks_queued += 1;
                        return Ok(WalkOutcome {
                            result: WalkResult::Queued,
                            notify_reap,
                            woken,
                        });
                    }
                }
            };
            let entry = page::get_entry(self.zones[zone_index].cache.buffer(page_slot), child_slot)?;
            let child_pbn = match entry.state {
                BlockMappingState::Uncompressed => {
                    woken.extend(self.zones[zone_index].cache.release_page(page_slot));
                    entry.pbn
                }
                BlockMappingState::Unmapped => {
                    if !allocate {
                        woken.extend(self.zones[zone_index].cache.release_page(page_slot));
                        return Ok(WalkOutcome {
                            result: WalkResult::Unmapped,
                            notify_reap,
                            woken,
                        });
                    }
                    match self.allocate_interior_page(
                        page_index,
                        zone_index,
                        page_slot,
                        child_slot,
                        vio,
                        store,
                        journal,
                        depot,
                        &mut notify_reap,
                        &mut woken,
                    )? {
                        Some(pbn) => pbn,
                        None => {
                            return Ok(WalkOutcome {
                                result: WalkResult::Queued,
                                notify_reap,
                                woken,
                            })
                        }
                    }
                }
                BlockMappingState::Compressed(_) => {
                    woken.extend(self.zones[zone_index].cache.release_page(page_slot));
                    return Err(VdoError::CorruptPage(format!(
                        "interior entry for logical block {lbn} is compressed"
                    )));
                }
            };
            current_pbn = child_pbn;
        }

        // The leaf page itself.
        let cache = &mut self.zones[zone_index].cache;
        match cache.get_page(current_pbn, vio, store, journal)? {
            GetPage::Slot(page_slot) => {
                self.stats.leaf_lookups += 1;
                Ok(WalkOutcome {
                    result: WalkResult::Leaf(LeafRef {
                        zone_index,
                        page_slot,
                        entry_slot,
                    }),
                    notify_reap,
                    woken,
                })
            }
            GetPage::Queued => {
                self.stats.walks_queued += 1;
                Ok(WalkOutcome {
                    result: WalkResult::Queued,
                    notify_reap,
                    woken,
                })
            }
        }
    }

    /// Allocate, journal, and install one interior page, updating the
    /// parent entry. Returns None when journal space queued the vio; the
    /// parent page is released either way.
    #[allow(clippy::too_many_arguments)]
    fn allocate_interior_page(
        &mut self,
        page_index: u64,
        zone_index: usize,
        parent_slot: usize,
        child_slot: usize,
        vio: DataVioId,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
        depot: &mut SlabDepot,
        notify_reap: &mut bool,
        woken: &mut Vec<DataVioId>,
    ) -> Result<Option<PhysicalBlockNumber>> {
        let physical_zone = self.physical_partner(zone_index);
        let pbn = match depot.allocate_block(physical_zone, journal.tail()) {
            Ok(pbn) => pbn,
            Err(error) => {
                woken.extend(self.zones[zone_index].cache.release_page(parent_slot));
                return Err(error);
            }
        };
        let entry = RecoveryJournalEntry {
            operation: JournalOperation::BlockMapIncrement,
            lbn: page_index,
            old_location: DataLocation::UNMAPPED,
            new_location: DataLocation::uncompressed(pbn),
        };
        let zone = self.zones[zone_index].zone;
        let point = match journal.add_entry(vio, false, entry, zone, &[physical_zone]) {
            AddEntryOutcome::Added { point } => point,
            AddEntryOutcome::Queued => {
                // Vacate the provisional reference; the retry re-allocates.
                depot.vacate_provisional(pbn);
                woken.extend(self.zones[zone_index].cache.release_page(parent_slot));
                return Ok(None);
            }
        };
        // Confirm the provisional reference through the slab journal.
        let released = depot.adjust_reference(
            pbn,
            JournalOperation::BlockMapIncrement,
            point.increment_half(),
            point.sequence_number,
            store,
        )?;
        *notify_reap |= release_physical_locks(journal, released);

        // Install the fresh page and point the parent at it.
        let cache = &mut self.zones[zone_index].cache;
        let child = match cache.install_new_page(pbn, vio, store, journal)? {
            GetPage::Slot(slot) => slot,
            GetPage::Queued => {
                woken.extend(cache.release_page(parent_slot));
                return Ok(None);
            }
        };
        cache.mark_dirty(child, point.sequence_number, journal);
        woken.extend(cache.release_page(child));

        page::set_entry(
            cache.buffer_mut(parent_slot),
            child_slot,
            DataLocation::uncompressed(pbn),
        );
        cache.mark_dirty(parent_slot, point.sequence_number, journal);
        woken.extend(cache.release_page(parent_slot));

        // The in-memory block map update for this entry is complete.
        *notify_reap |= journal.release_block_reference(
            point.sequence_number,
            ZoneType::Logical,
            zone,
        );
        self.stats.interior_pages_allocated += 1;
        trace!(pbn, page_index, "interior block map page allocated");
        Ok(Some(pbn))
    }

    /// Advance one zone's era, expiring ancient dirty pages.
    pub fn advance_zone_era(
        &mut self,
        zone_index: usize,
        era: SequenceNumber,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
    ) -> Result<bool> {
        self.zones[zone_index].cache.advance_era(era, store, journal)
    }

    /// Flush every zone's dirty pages (drain paths).
    pub fn flush_all(
        &mut self,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
    ) -> Result<bool> {
        let mut notify = false;
        for zone in self.zones.iter_mut() {
            notify |= zone.cache.flush_all(store, journal)?;
        }
        Ok(notify)
    }
}

/// Drop physical-zone per-entry locks released by slab journal commits.
pub fn release_physical_locks(
    journal: &mut RecoveryJournal,
    released: crate::slab_depot::ReleasedLocks,
) -> bool {
    let mut notify = false;
    for (zone, sequence) in released {
        notify |= journal.release_block_reference(sequence, ZoneType::Physical, zone);
    }
    notify
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Layout, VdoConfig};
    use crate::storage::MemStore;

    struct Fixture {
        map: BlockMap,
        journal: RecoveryJournal,
        depot: SlabDepot,
        store: MemStore,
    }

    fn fixture() -> Fixture {
        let config = VdoConfig {
            physical_blocks: 4096,
            root_count: 2,
            ..VdoConfig::default()
        };
        let layout = Layout::compute(&config).unwrap();
        let store = MemStore::new(config.physical_blocks);
        let journal = RecoveryJournal::new(&layout, 0xF00, 4, 64, 1, 1);
        let depot = SlabDepot::new(&layout, config.slab_config(), 0xF00, 1);
        let map = BlockMap::new(
            0xF00,
            layout.block_map_root_origin,
            config.root_count,
            config.logical_blocks,
            1,
            1,
            32,
            4,
        );
        Fixture {
            map,
            journal,
            depot,
            store,
        }
    }

    #[test]
    fn write_walk_builds_interior_pages() {
        let mut fx = fixture();
        fx.map.format(&mut fx.store).unwrap();
        let outcome = fx
            .map
            .walk(0, 1, true, &mut fx.store, &mut fx.journal, &mut fx.depot)
            .unwrap();
        let leaf = match outcome.result {
            WalkResult::Leaf(leaf) => leaf,
            other => panic!("unexpected {other:?}"),
        };
        fx.map.zones[leaf.zone_index].cache.release_page(leaf.page_slot);
        // Root is fixed; three interior levels plus the leaf were built.
        assert_eq!(fx.map.stats.interior_pages_allocated, 4);
        assert_eq!(fx.journal.block_map_data_blocks, 4);
        assert_eq!(fx.depot.allocated_blocks(), 4);

        // A second walk to the same leaf allocates nothing new.
        let outcome = fx
            .map
            .walk(1, 2, true, &mut fx.store, &mut fx.journal, &mut fx.depot)
            .unwrap();
        match outcome.result {
            WalkResult::Leaf(leaf) => {
                fx.map.zones[leaf.zone_index].cache.release_page(leaf.page_slot);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.map.stats.interior_pages_allocated, 4);
    }

    #[test]
    fn read_walk_reports_unmapped_without_allocating() {
        let mut fx = fixture();
        fx.map.format(&mut fx.store).unwrap();
        let outcome = fx
            .map
            .walk(42, 1, false, &mut fx.store, &mut fx.journal, &mut fx.depot)
            .unwrap();
        assert_eq!(outcome.result, WalkResult::Unmapped);
        assert_eq!(fx.depot.allocated_blocks(), 0);
    }

    #[test]
    fn trees_stripe_by_page_index() {
        let fx = fixture();
        let per_page = ENTRIES_PER_PAGE as u64;
        assert_eq!(fx.map.root_index_for_lbn(0), 0);
        assert_eq!(fx.map.root_index_for_lbn(per_page - 1), 0);
        assert_eq!(fx.map.root_index_for_lbn(per_page), 1);
        assert_eq!(fx.map.root_index_for_lbn(2 * per_page), 0);
    }
}
