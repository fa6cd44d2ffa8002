//! The block-map page cache: a fixed set of page slots with an LRU over
//! resident and dirty pages, per-page busy counts, and a read hook that
//! validates page format on every load.
//!
//! Dirty pages hold a reference on the recovery journal block of the era
//! in which they were first dirtied; the reference is released only after
//! the page write durably completes, so a journal block is never reaped
//! while an in-memory page still depends on it.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{trace, warn};

use crate::data_vio::DataVioId;
use crate::error::{Result, VdoError};
use crate::recovery_journal::RecoveryJournal;
use crate::storage::BlockStore;
use crate::types::{
    PhysicalBlockNumber, SequenceNumber, ZoneId, ZoneType, BLOCK_SIZE, INVALID_PBN,
};
use crate::wait_queue::WaitQueue;

use super::dirty_lists::DirtyLists;
use super::page::{self, PageValidity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Free,
    Incoming,
    Outgoing,
    Resident,
    Dirty,
    Failed,
}

struct PageInfo {
    state: PageState,
    pbn: PhysicalBlockNumber,
    busy: u32,
    last_used: u64,
    /// Era of first dirtying; the recovery lock the page holds.
    dirty_era: SequenceNumber,
    buffer: Box<[u8]>,
}

impl PageInfo {
    fn new() -> Self {
        Self {
            state: PageState::Free,
            pbn: INVALID_PBN,
            busy: 0,
            last_used: 0,
            dirty_era: 0,
            buffer: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
        }
    }

    fn is_evictable(&self) -> bool {
        matches!(self.state, PageState::Resident | PageState::Dirty) && self.busy == 0
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PageCacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub reads: u64,
    pub writes: u64,
    pub evictions: u64,
    pub bad_pages_reformatted: u64,
    pub rebuild_zero_fills: u64,
    pub cache_pressure_waits: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum GetPage {
    Slot(usize),
    /// No evictable slot; the requester is parked on the free queue.
    Queued,
}

pub struct VdoPageCache {
    zone: ZoneId,
    nonce: u64,
    slots: Vec<PageInfo>,
    index: HashMap<PhysicalBlockNumber, usize>,
    clock: u64,
    dirty_lists: DirtyLists<PhysicalBlockNumber>,
    free_waiters: WaitQueue<DataVioId>,
    rebuild_mode: bool,
    pub stats: PageCacheStatistics,
}

impl VdoPageCache {
    pub fn new(zone: ZoneId, nonce: u64, capacity: usize, maximum_age: u64) -> Self {
        Self {
            zone,
            nonce,
            slots: (0..capacity).map(|_| PageInfo::new()).collect(),
            index: HashMap::new(),
            clock: 0,
            dirty_lists: DirtyLists::new(maximum_age),
            free_waiters: WaitQueue::new(),
            rebuild_mode: false,
            stats: PageCacheStatistics::default(),
        }
    }

    pub fn set_rebuild_mode(&mut self, rebuild: bool) {
        self.rebuild_mode = rebuild;
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    fn touch(&mut self, slot: usize) {
        self.clock += 1;
        self.slots[slot].last_used = self.clock;
    }

    pub fn contains(&self, pbn: PhysicalBlockNumber) -> Option<usize> {
        self.index.get(&pbn).copied()
    }

    pub fn buffer(&self, slot: usize) -> &[u8] {
        &self.slots[slot].buffer
    }

    pub fn buffer_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.slots[slot].buffer
    }

    pub fn pbn_of(&self, slot: usize) -> PhysicalBlockNumber {
        self.slots[slot].pbn
    }

    pub fn state_of(&self, slot: usize) -> PageState {
        self.slots[slot].state
    }

    pub fn busy_count(&self, slot: usize) -> u32 {
        self.slots[slot].busy
    }

    /// The least-recently-used non-busy, non-in-flight page, if any.
    fn select_victim(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, info)| info.is_evictable())
            .min_by_key(|(_, info)| info.last_used)
            .map(|(slot, _)| slot)
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|info| info.state == PageState::Free)
    }

    /// Get a page for reading or writing, loading it on a miss. The caller
    /// owns one busy reference on success and must release it. On cache
    /// pressure the requester is queued and retried when a page is
    /// released.
    pub fn get_page(
        &mut self,
        pbn: PhysicalBlockNumber,
        requester: DataVioId,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
    ) -> Result<GetPage> {
        if let Some(slot) = self.contains(pbn) {
            if self.slots[slot].state == PageState::Failed {
                return Err(VdoError::CorruptPage(format!(
                    "page {pbn} previously failed"
                )));
            }
            self.stats.hits += 1;
            self.slots[slot].busy += 1;
            self.touch(slot);
            return Ok(GetPage::Slot(slot));
        }
        self.stats.misses += 1;

        let slot = match self.find_free_slot() {
            Some(slot) => slot,
            None => match self.select_victim() {
                Some(victim) => {
                    self.evict(victim, store, journal)?;
                    victim
                }
                None => {
                    // Every page is busy: report pressure and park.
                    self.stats.cache_pressure_waits += 1;
                    self.free_waiters.enqueue(requester);
                    return Ok(GetPage::Queued);
                }
            },
        };

        self.load_into(slot, pbn, store)?;
        self.slots[slot].busy = 1;
        self.touch(slot);
        Ok(GetPage::Slot(slot))
    }

    fn evict(
        &mut self,
        slot: usize,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
    ) -> Result<()> {
        if self.slots[slot].state == PageState::Dirty {
            let _ = self.write_page(slot, store, journal)?;
        }
        let pbn = self.slots[slot].pbn;
        self.index.remove(&pbn);
        self.slots[slot].state = PageState::Free;
        self.slots[slot].pbn = INVALID_PBN;
        self.stats.evictions += 1;
        trace!(pbn, zone = self.zone, "page evicted");
        Ok(())
    }

    fn load_into(
        &mut self,
        slot: usize,
        pbn: PhysicalBlockNumber,
        store: &mut dyn BlockStore,
    ) -> Result<()> {
        self.slots[slot].state = PageState::Incoming;
        self.slots[slot].pbn = pbn;
        if let Err(error) = store.read_block(pbn, &mut self.slots[slot].buffer) {
            self.slots[slot].state = PageState::Failed;
            self.index.insert(pbn, slot);
            return Err(error);
        }
        self.stats.reads += 1;
        // Read hook: validate the page format.
        match page::validate_page(&self.slots[slot].buffer, self.nonce, pbn) {
            PageValidity::Valid { .. } => {}
            PageValidity::Blank => {
                // First touch of this page; start it empty.
                page::format_page(&mut self.slots[slot].buffer, self.nonce, pbn, false);
            }
            PageValidity::Bad(reason) => {
                if self.rebuild_mode {
                    self.stats.rebuild_zero_fills += 1;
                } else {
                    warn!(pbn, reason, "bad block map page reformatted");
                    self.stats.bad_pages_reformatted += 1;
                }
                page::format_page(&mut self.slots[slot].buffer, self.nonce, pbn, false);
            }
        }
        self.slots[slot].state = PageState::Resident;
        self.slots[slot].dirty_era = 0;
        self.index.insert(pbn, slot);
        Ok(())
    }

    /// Create a page in the cache without reading it from disk, for pages
    /// the caller just allocated. The slot comes back busy.
    pub fn install_new_page(
        &mut self,
        pbn: PhysicalBlockNumber,
        requester: DataVioId,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
    ) -> Result<GetPage> {
        let slot = match self.find_free_slot() {
            Some(slot) => slot,
            None => match self.select_victim() {
                Some(victim) => {
                    self.evict(victim, store, journal)?;
                    victim
                }
                None => {
                    self.stats.cache_pressure_waits += 1;
                    self.free_waiters.enqueue(requester);
                    return Ok(GetPage::Queued);
                }
            },
        };
        page::format_page(&mut self.slots[slot].buffer, self.nonce, pbn, true);
        self.slots[slot].state = PageState::Resident;
        self.slots[slot].pbn = pbn;
        self.slots[slot].busy = 1;
        self.slots[slot].dirty_era = 0;
        self.index.insert(pbn, slot);
        self.touch(slot);
        Ok(GetPage::Slot(slot))
    }

    /// Drop one busy reference. Returns a parked requester to retry, if
    /// the release made progress possible.
    pub fn release_page(&mut self, slot: usize) -> Option<DataVioId> {
        debug_assert!(self.slots[slot].busy > 0, "release of non-busy page");
        self.slots[slot].busy = self.slots[slot].busy.saturating_sub(1);
        if self.slots[slot].busy == 0 && self.free_waiters.has_waiters() {
            return self.free_waiters.notify_next();
        }
        None
    }

    /// Mark a page dirty in `era`. On first dirtying the page acquires a
    /// reference on that era's journal block; re-dirtying keeps the oldest
    /// lock, since that is the earliest block with uncommitted updates to
    /// this page.
    pub fn mark_dirty(
        &mut self,
        slot: usize,
        era: SequenceNumber,
        journal: &mut RecoveryJournal,
    ) {
        let info = &mut self.slots[slot];
        let pbn = info.pbn;
        if info.state == PageState::Dirty {
            return;
        }
        debug_assert_eq!(info.state, PageState::Resident);
        info.state = PageState::Dirty;
        info.dirty_era = era;
        journal.acquire_block_reference(era, ZoneType::Logical, self.zone);
        if self.dirty_lists.add(pbn, era).is_some() {
            // Already ancient: the caller's next era advance writes it,
            // but it must still be filed for the flush paths.
            self.dirty_lists.set_period(era);
            self.dirty_lists.add(pbn, era);
        }
    }

    /// Write one page out. Returns true when releasing the page's recovery
    /// lock dropped the last reference and the journal should reap.
    pub fn write_page(
        &mut self,
        slot: usize,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
    ) -> Result<bool> {
        let pbn = self.slots[slot].pbn;
        let was_dirty = self.slots[slot].state == PageState::Dirty;
        self.slots[slot].state = PageState::Outgoing;
        page::advance_generation(&mut self.slots[slot].buffer);
        if let Err(error) = store.write_block(pbn, &self.slots[slot].buffer) {
            self.slots[slot].state = PageState::Failed;
            return Err(error);
        }
        store.flush()?;
        self.stats.writes += 1;
        self.slots[slot].state = PageState::Resident;
        let era = std::mem::take(&mut self.slots[slot].dirty_era);
        if was_dirty && era > 0 {
            // The write is durable; the journal block no longer protects
            // anything for this page.
            return Ok(journal.release_block_reference(era, ZoneType::Logical, self.zone));
        }
        Ok(false)
    }

    /// Ask for a page to be saved as soon as it is idle.
    pub fn request_write(
        &mut self,
        pbn: PhysicalBlockNumber,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
    ) -> Result<bool> {
        let Some(slot) = self.contains(pbn) else {
            return Ok(false);
        };
        if self.slots[slot].state != PageState::Dirty {
            return Ok(false);
        }
        if self.slots[slot].busy > 0 {
            // Still in use; re-file to retry on the next advance.
            let era = self.slots[slot].dirty_era;
            self.dirty_lists.add(pbn, era);
            return Ok(false);
        }
        self.write_page(slot, store, journal)
    }

    /// Advance the zone's era, writing out every page that aged past the
    /// maximum. Returns true when a released lock calls for a reap.
    pub fn advance_era(
        &mut self,
        period: SequenceNumber,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
    ) -> Result<bool> {
        let expired = self.dirty_lists.advance(period);
        let mut notify = false;
        for pbn in expired {
            notify |= self.request_write(pbn, store, journal)?;
        }
        Ok(notify)
    }

    /// Write every dirty page regardless of age (save/suspend drains).
    pub fn flush_all(
        &mut self,
        store: &mut dyn BlockStore,
        journal: &mut RecoveryJournal,
    ) -> Result<bool> {
        let mut notify = false;
        for pbn in self.dirty_lists.flush_all() {
            notify |= self.request_write(pbn, store, journal)?;
        }
        // Anything re-filed because it was busy is an error at drain time.
        debug_assert!(self.dirty_lists.is_empty());
        Ok(notify)
    }

    pub fn has_dirty_pages(&self) -> bool {
        self.slots.iter().any(|info| info.state == PageState::Dirty)
    }

    pub fn has_waiters(&self) -> bool {
        self.free_waiters.has_waiters()
    }

    /// Fail every parked requester, for read-only entry.
    pub fn fail_all_waiters(&mut self) -> Vec<DataVioId> {
        self.free_waiters.notify_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Layout, VdoConfig};
    use crate::storage::MemStore;

    fn fixture(capacity: usize) -> (VdoPageCache, MemStore, RecoveryJournal) {
        let config = VdoConfig::default();
        let layout = Layout::compute(&config).unwrap();
        let store = MemStore::new(config.physical_blocks);
        let journal = RecoveryJournal::new(&layout, 0xCAFE, 4, 32, 1, 1);
        (VdoPageCache::new(0, 0xCAFE, capacity, 4), store, journal)
    }

    #[test]
    fn miss_loads_and_hit_reuses() {
        let (mut cache, mut store, mut journal) = fixture(4);
        let slot = match cache.get_page(500, 1, &mut store, &mut journal).unwrap() {
            GetPage::Slot(slot) => slot,
            GetPage::Queued => panic!("queued"),
        };
        assert_eq!(cache.stats.misses, 1);
        cache.release_page(slot);

        match cache.get_page(500, 2, &mut store, &mut journal).unwrap() {
            GetPage::Slot(hit) => assert_eq!(hit, slot),
            GetPage::Queued => panic!("queued"),
        }
        assert_eq!(cache.stats.hits, 1);
    }

    #[test]
    fn lru_victim_is_least_recently_used_non_busy() {
        let (mut cache, mut store, mut journal) = fixture(2);
        let a = match cache.get_page(100, 1, &mut store, &mut journal).unwrap() {
            GetPage::Slot(slot) => slot,
            _ => panic!(),
        };
        let b = match cache.get_page(101, 1, &mut store, &mut journal).unwrap() {
            GetPage::Slot(slot) => slot,
            _ => panic!(),
        };
        cache.release_page(a);
        cache.release_page(b);
        // Touch page 100 so 101 becomes the LRU.
        match cache.get_page(100, 1, &mut store, &mut journal).unwrap() {
            GetPage::Slot(slot) => {
                cache.release_page(slot);
            }
            _ => panic!(),
        }
        cache.get_page(102, 1, &mut store, &mut journal).unwrap();
        assert!(cache.contains(100).is_some());
        assert!(cache.contains(101).is_none());
        assert!(cache.contains(102).is_some());
    }

    #[test]
    fn all_busy_reports_pressure_and_queues() {
        let (mut cache, mut store, mut journal) = fixture(1);
        let slot = match cache.get_page(100, 1, &mut store, &mut journal).unwrap() {
            GetPage::Slot(slot) => slot,
            _ => panic!(),
        };
        assert_eq!(
            cache.get_page(101, 7, &mut store, &mut journal).unwrap(),
            GetPage::Queued
        );
        assert_eq!(cache.stats.cache_pressure_waits, 1);
        // Releasing hands the retry to the parked requester.
        assert_eq!(cache.release_page(slot), Some(7));
    }

    #[test]
    fn dirty_page_holds_and_releases_recovery_lock() {
        let (mut cache, mut store, mut journal) = fixture(2);
        let slot = match cache.get_page(200, 1, &mut store, &mut journal).unwrap() {
            GetPage::Slot(slot) => slot,
            _ => panic!(),
        };
        cache.mark_dirty(slot, 3, &mut journal);
        assert!(journal.lock_counter.is_locked(3, ZoneType::Logical));
        cache.release_page(slot);

        cache.write_page(slot, &mut store, &mut journal).unwrap();
        assert!(!journal.lock_counter.is_locked(3, ZoneType::Logical));
        assert_eq!(cache.state_of(slot), PageState::Resident);
    }

    #[test]
    fn era_aging_writes_ancient_pages() {
        let (mut cache, mut store, mut journal) = fixture(4);
        let slot = match cache.get_page(300, 1, &mut store, &mut journal).unwrap() {
            GetPage::Slot(slot) => slot,
            _ => panic!(),
        };
        cache.dirty_lists.set_period(10);
        cache.mark_dirty(slot, 10, &mut journal);
        cache.release_page(slot);

        // Ages 11..13: nothing ancient yet.
        for period in 11..14 {
            cache.advance_era(period, &mut store, &mut journal).unwrap();
            assert_eq!(cache.state_of(slot), PageState::Dirty);
        }
        // Era 10 with maximum age 4 expires at period 14.
        cache.advance_era(14, &mut store, &mut journal).unwrap();
        assert_eq!(cache.state_of(slot), PageState::Resident);
        assert_eq!(cache.stats.writes, 1);
        cache.advance_era(15, &mut store, &mut journal).unwrap();
        assert_eq!(cache.state_of(slot), PageState::Resident);
    }

    #[test]
    fn torn_page_reformatted_by_read_hook() {
        let (mut cache, mut store, mut journal) = fixture(2);
        // Write a valid page, then corrupt its footer on disk.
        let slot = match cache.get_page(400, 1, &mut store, &mut journal).unwrap() {
            GetPage::Slot(slot) => slot,
            _ => panic!(),
        };
        crate::block_map::page::set_entry(
            cache.buffer_mut(slot),
            0,
            crate::types::DataLocation::uncompressed(999),
        );
        cache.mark_dirty(slot, 1, &mut journal);
        cache.release_page(slot);
        cache.write_page(slot, &mut store, &mut journal).unwrap();

        let mut raw = [0u8; BLOCK_SIZE];
        store.read_block(400, &mut raw).unwrap();
        raw[BLOCK_SIZE - 1] ^= 0xFF;
        store.write_block(400, &raw).unwrap();

        // Evict, then reload: the hook reformats the torn page.
        cache.evict(slot, &mut store, &mut journal).unwrap();
        let slot = match cache.get_page(400, 1, &mut store, &mut journal).unwrap() {
            GetPage::Slot(slot) => slot,
            _ => panic!(),
        };
        assert_eq!(cache.stats.bad_pages_reformatted, 1);
        assert_eq!(
            crate::block_map::page::get_entry(cache.buffer(slot), 0).unwrap(),
            crate::types::DataLocation::UNMAPPED
        );
    }
}
