//! Device configuration: zone/thread topology, slab geometry, and the
//! physical partition layout derived from them.

use crate::error::{Result, VdoError};
use crate::types::{PhysicalBlockNumber, SlabNumber, ThreadId, ZoneId};

/// How work is sharded. Each zone owns its state exclusively and runs on
/// its own cooperative thread; fixed threads exist for admin, journal, and
/// packer work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadConfig {
    pub logical_zones: u8,
    pub physical_zones: u8,
    pub hash_zones: u8,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            logical_zones: 1,
            physical_zones: 1,
            hash_zones: 1,
        }
    }
}

impl ThreadConfig {
    pub const ADMIN_THREAD: ThreadId = 0;
    pub const JOURNAL_THREAD: ThreadId = 1;
    pub const PACKER_THREAD: ThreadId = 2;
    const BASE_THREADS: usize = 3;

    pub fn thread_count(&self) -> usize {
        Self::BASE_THREADS
            + self.logical_zones as usize
            + self.physical_zones as usize
            + self.hash_zones as usize
    }

    pub fn logical_thread(&self, zone: ZoneId) -> ThreadId {
        Self::BASE_THREADS + zone as usize
    }

    pub fn physical_thread(&self, zone: ZoneId) -> ThreadId {
        Self::BASE_THREADS + self.logical_zones as usize + zone as usize
    }

    pub fn hash_thread(&self, zone: ZoneId) -> ThreadId {
        Self::BASE_THREADS
            + self.logical_zones as usize
            + self.physical_zones as usize
            + zone as usize
    }
}

/// The geometry of a single slab. The journal blocks lead, then the
/// ref-count blocks, then the data blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabConfig {
    pub slab_blocks: u32,
    pub slab_journal_blocks: u32,
    pub reference_count_blocks: u32,
    pub data_blocks: u32,
    /// Free-tail-space threshold at which tail blocks start committing.
    pub flushing_threshold: u64,
    /// Free-tail-space threshold at which new entries are refused.
    pub blocking_threshold: u64,
    /// Journal length at load beyond which a slab must be scrubbed.
    pub scrubbing_threshold: u64,
}

/// Reference count bytes that fit in one metadata block.
pub const COUNTS_PER_REF_BLOCK: u32 = crate::types::BLOCK_SIZE as u32;

impl SlabConfig {
    pub fn compute(slab_blocks: u32, slab_journal_blocks: u32) -> Result<Self> {
        if slab_journal_blocks + 2 > slab_blocks {
            return Err(VdoError::Internal(format!(
                "slab of {slab_blocks} blocks cannot hold a {slab_journal_blocks}-block journal"
            )));
        }
        let remaining = slab_blocks - slab_journal_blocks;
        // One byte of reference counts per data block; the ref-count blocks
        // themselves come out of the same span.
        let mut reference_count_blocks = remaining.div_ceil(COUNTS_PER_REF_BLOCK + 1);
        while (remaining - reference_count_blocks).div_ceil(COUNTS_PER_REF_BLOCK)
            > reference_count_blocks
        {
            reference_count_blocks += 1;
        }
        let data_blocks = remaining - reference_count_blocks;
        let journal = slab_journal_blocks as u64;
        Ok(Self {
            slab_blocks,
            slab_journal_blocks,
            reference_count_blocks,
            data_blocks,
            flushing_threshold: ((journal * 3) / 4).max(1),
            blocking_threshold: (journal - 1).max(1),
            scrubbing_threshold: journal,
        })
    }
}

/// Top-level device configuration.
#[derive(Debug, Clone)]
pub struct VdoConfig {
    /// Size of the thin-provisioned logical address space, in blocks.
    pub logical_blocks: u64,
    /// Size of the backing store, in blocks.
    pub physical_blocks: u64,
    /// On-disk recovery journal size in blocks; must be a power of two so
    /// the check byte changes each trip around the journal.
    pub journal_blocks: u64,
    /// In-memory journal tail buffer count.
    pub tail_buffer_blocks: usize,
    pub slab_blocks: u32,
    pub slab_journal_blocks: u32,
    /// Number of block-map tree roots.
    pub root_count: u32,
    /// Page-cache slots per logical zone.
    pub page_cache_size: usize,
    /// Eras a metadata page may stay dirty before it is forced out.
    pub maximum_age: u64,
    pub threads: ThreadConfig,
    pub compression: bool,
}

impl Default for VdoConfig {
    fn default() -> Self {
        Self {
            logical_blocks: 1 << 20,
            physical_blocks: 8192,
            journal_blocks: 64,
            tail_buffer_blocks: 4,
            slab_blocks: 256,
            slab_journal_blocks: 8,
            root_count: 4,
            page_cache_size: 128,
            maximum_age: 4,
            threads: ThreadConfig::default(),
            compression: true,
        }
    }
}

impl VdoConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.journal_blocks.is_power_of_two() {
            return Err(VdoError::Internal(format!(
                "journal size {} is not a power of two",
                self.journal_blocks
            )));
        }
        if self.root_count == 0 {
            return Err(VdoError::Internal("root count must be nonzero".to_string()));
        }
        if self.tail_buffer_blocks == 0 {
            return Err(VdoError::Internal(
                "tail buffer must hold at least one block".to_string(),
            ));
        }
        SlabConfig::compute(self.slab_blocks, self.slab_journal_blocks)?;
        Layout::compute(self)?;
        Ok(())
    }

    pub fn slab_config(&self) -> SlabConfig {
        // Validated at construction.
        SlabConfig::compute(self.slab_blocks, self.slab_journal_blocks)
            .unwrap_or_else(|_| unreachable!("slab config validated"))
    }
}

/// Fixed blocks reserved ahead of the journal partition: the geometry
/// block and the super block.
pub const GEOMETRY_BLOCK: PhysicalBlockNumber = 0;
pub const SUPER_BLOCK: PhysicalBlockNumber = 1;
const FIXED_BLOCKS: u64 = 2;

/// Blocks reserved for the slab summary partition.
pub const SLAB_SUMMARY_BLOCKS: u64 = 8;

/// The physical partition layout, derived from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub journal_origin: PhysicalBlockNumber,
    pub journal_blocks: u64,
    pub summary_origin: PhysicalBlockNumber,
    pub block_map_root_origin: PhysicalBlockNumber,
    pub root_count: u32,
    pub depot_origin: PhysicalBlockNumber,
    pub slab_count: SlabNumber,
    pub slab_blocks: u32,
    pub physical_blocks: u64,
}

impl Layout {
    pub fn compute(config: &VdoConfig) -> Result<Self> {
        let journal_origin = FIXED_BLOCKS;
        let summary_origin = journal_origin + config.journal_blocks;
        let block_map_root_origin = summary_origin + SLAB_SUMMARY_BLOCKS;
        let depot_origin = block_map_root_origin + config.root_count as u64;
        if depot_origin + config.slab_blocks as u64 > config.physical_blocks {
            return Err(VdoError::Internal(format!(
                "{} physical blocks cannot hold metadata plus one slab",
                config.physical_blocks
            )));
        }
        let slab_count = ((config.physical_blocks - depot_origin) / config.slab_blocks as u64)
            as SlabNumber;
        Ok(Self {
            journal_origin,
            journal_blocks: config.journal_blocks,
            summary_origin,
            block_map_root_origin,
            root_count: config.root_count,
            depot_origin,
            slab_count,
            slab_blocks: config.slab_blocks,
            physical_blocks: config.physical_blocks,
        })
    }

    /// Recompute the layout for a grown physical size. Only the depot
    /// gains blocks; every other partition is fixed at format time.
    pub fn grown_to(&self, physical_blocks: u64) -> Result<Self> {
        if physical_blocks < self.physical_blocks {
            return Err(VdoError::Internal(
                "physical size cannot shrink".to_string(),
            ));
        }
        let slab_count =
            ((physical_blocks - self.depot_origin) / self.slab_blocks as u64) as SlabNumber;
        Ok(Self {
            slab_count,
            physical_blocks,
            ..self.clone()
        })
    }

    pub fn journal_pbn(&self, index: u64) -> PhysicalBlockNumber {
        self.journal_origin + (index % self.journal_blocks)
    }

    pub fn slab_origin(&self, slab: SlabNumber) -> PhysicalBlockNumber {
        self.depot_origin + slab as u64 * self.slab_blocks as u64
    }

    /// The slab owning a physical block, if any.
    pub fn slab_for_pbn(&self, pbn: PhysicalBlockNumber) -> Option<SlabNumber> {
        if pbn < self.depot_origin {
            return None;
        }
        let slab = (pbn - self.depot_origin) / self.slab_blocks as u64;
        if slab < self.slab_count as u64 {
            Some(slab as SlabNumber)
        } else {
            None
        }
    }

    pub fn root_pbn(&self, root_index: u32) -> PhysicalBlockNumber {
        self.block_map_root_origin + root_index as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_config_accounts_for_every_block() {
        let config = SlabConfig::compute(256, 8).unwrap();
        assert_eq!(
            config.slab_journal_blocks + config.reference_count_blocks + config.data_blocks,
            config.slab_blocks
        );
        assert!(config.reference_count_blocks * COUNTS_PER_REF_BLOCK >= config.data_blocks);
    }

    #[test]
    fn large_slab_needs_more_ref_blocks() {
        let config = SlabConfig::compute(16384, 16).unwrap();
        assert!(config.reference_count_blocks >= 4);
        assert_eq!(
            config.slab_journal_blocks + config.reference_count_blocks + config.data_blocks,
            config.slab_blocks
        );
    }

    #[test]
    fn layout_partitions_are_disjoint() {
        let config = VdoConfig::default();
        let layout = Layout::compute(&config).unwrap();
        assert!(layout.journal_origin > SUPER_BLOCK);
        assert!(layout.summary_origin == layout.journal_origin + config.journal_blocks);
        assert!(layout.depot_origin > layout.block_map_root_origin);
        assert!(layout.slab_count > 0);
        let last_slab_end =
            layout.slab_origin(layout.slab_count - 1) + config.slab_blocks as u64;
        assert!(last_slab_end <= config.physical_blocks);
    }

    #[test]
    fn slab_lookup() {
        let config = VdoConfig::default();
        let layout = Layout::compute(&config).unwrap();
        assert_eq!(layout.slab_for_pbn(0), None);
        assert_eq!(layout.slab_for_pbn(layout.depot_origin), Some(0));
        assert_eq!(
            layout.slab_for_pbn(layout.depot_origin + config.slab_blocks as u64),
            Some(1)
        );
    }

    #[test]
    fn grow_only_adds_slabs() {
        let config = VdoConfig::default();
        let layout = Layout::compute(&config).unwrap();
        let grown = layout.grown_to(config.physical_blocks + 1024).unwrap();
        assert_eq!(grown.depot_origin, layout.depot_origin);
        assert_eq!(grown.slab_count, layout.slab_count + 4);
        assert!(grown.grown_to(0).is_err());
    }

    #[test]
    fn thread_ids_are_disjoint() {
        let threads = ThreadConfig {
            logical_zones: 2,
            physical_zones: 2,
            hash_zones: 1,
        };
        let mut ids = vec![
            ThreadConfig::ADMIN_THREAD,
            ThreadConfig::JOURNAL_THREAD,
            ThreadConfig::PACKER_THREAD,
            threads.logical_thread(0),
            threads.logical_thread(1),
            threads.physical_thread(0),
            threads.physical_thread(1),
            threads.hash_thread(0),
        ];
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), threads.thread_count());
    }
}
