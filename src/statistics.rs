//! Aggregated statistics and the textual dump surface.

use serde::Serialize;

use crate::block_map::page_cache::PageCacheStatistics;
use crate::block_map::BlockMapStatistics;
use crate::dedup::DedupStatistics;
use crate::error::{Result, VdoError};
use crate::packer::PackerStatistics;
use crate::recovery_journal::RecoveryJournalStatistics;
use crate::slab_depot::allocator::AllocatorStatistics;
use crate::slab_depot::ref_counts::RefCountsStatistics;
use crate::slab_depot::scrubber::ScrubberStatistics;
use crate::slab_depot::slab_journal::SlabJournalStatistics;
use crate::slab_depot::DepotStatistics;
use crate::vdo::Vdo;

#[derive(Debug, Clone, Serialize)]
pub struct ActiveVio {
    pub id: usize,
    pub lbn: u64,
    pub stage: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct VdoStatistics {
    pub device_state: String,
    pub read_only: bool,
    pub logical_blocks: u64,
    pub physical_blocks: u64,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
    pub allocated_blocks: u64,
    pub data_vios_in_flight: usize,
    pub journal: RecoveryJournalStatistics,
    pub depot: DepotStatistics,
    pub allocators: Vec<AllocatorStatistics>,
    pub slab_journal: SlabJournalStatistics,
    pub ref_counts: RefCountsStatistics,
    pub scrubber: ScrubberStatistics,
    pub block_map: BlockMapStatistics,
    pub page_cache: PageCacheStatistics,
    pub packer: PackerStatistics,
    pub dedup: DedupStatistics,
}

fn sum_slab_journal(vdo: &Vdo) -> SlabJournalStatistics {
    let mut total = SlabJournalStatistics::default();
    for slab in &vdo.depot.slabs {
        let stats = &slab.journal.stats;
        total.entries_added += stats.entries_added;
        total.blocks_committed += stats.blocks_committed;
        total.flushes_triggered += stats.flushes_triggered;
        total.blocked_additions += stats.blocked_additions;
    }
    total
}

fn sum_ref_counts(vdo: &Vdo) -> RefCountsStatistics {
    let mut total = RefCountsStatistics::default();
    for slab in &vdo.depot.slabs {
        let stats = &slab.ref_counts.stats;
        total.increments += stats.increments;
        total.decrements += stats.decrements;
        total.provisional_confirms += stats.provisional_confirms;
        total.provisional_vacates += stats.provisional_vacates;
        total.blocks_written += stats.blocks_written;
    }
    total
}

fn sum_page_cache(vdo: &Vdo) -> PageCacheStatistics {
    let mut total = PageCacheStatistics::default();
    for zone in &vdo.block_map.zones {
        let stats = &zone.cache.stats;
        total.hits += stats.hits;
        total.misses += stats.misses;
        total.reads += stats.reads;
        total.writes += stats.writes;
        total.evictions += stats.evictions;
        total.bad_pages_reformatted += stats.bad_pages_reformatted;
        total.rebuild_zero_fills += stats.rebuild_zero_fills;
        total.cache_pressure_waits += stats.cache_pressure_waits;
    }
    total
}

pub fn gather(vdo: &Vdo) -> VdoStatistics {
    VdoStatistics {
        device_state: format!("{:?}", vdo.super_block.state),
        read_only: vdo.notifier.is_read_only(),
        logical_blocks: vdo.config.logical_blocks,
        physical_blocks: vdo.config.physical_blocks,
        logical_blocks_used: vdo.journal.logical_blocks_used,
        block_map_data_blocks: vdo.journal.block_map_data_blocks,
        allocated_blocks: vdo.depot.allocated_blocks(),
        data_vios_in_flight: vdo.vios.in_flight,
        journal: vdo.journal.stats.clone(),
        depot: vdo.depot.statistics(),
        allocators: vdo
            .depot
            .allocators
            .iter()
            .map(|a| a.stats.clone())
            .collect(),
        slab_journal: sum_slab_journal(vdo),
        ref_counts: sum_ref_counts(vdo),
        scrubber: vdo.depot.scrubber.stats.clone(),
        block_map: vdo.block_map.stats.clone(),
        page_cache: sum_page_cache(vdo),
        packer: vdo.packer.stats.clone(),
        dedup: vdo.hash_zones.stats.clone(),
    }
}

/// Render a diagnostics section as JSON text. `what` selects a section;
/// "all" includes everything plus the in-flight request table.
pub fn dump(vdo: &Vdo, what: &str) -> Result<String> {
    let stats = gather(vdo);
    let rendered = match what {
        "all" => {
            #[derive(Serialize)]
            struct FullDump {
                statistics: VdoStatistics,
                active_vios: Vec<ActiveVio>,
            }
            let active_vios = vdo
                .vios
                .dump_active()
                .into_iter()
                .map(|(id, lbn, stage)| ActiveVio { id, lbn, stage })
                .collect();
            serde_json::to_string_pretty(&FullDump {
                statistics: stats,
                active_vios,
            })
        }
        "journal" => serde_json::to_string_pretty(&stats.journal),
        "depot" => serde_json::to_string_pretty(&stats.depot),
        "block_map" => serde_json::to_string_pretty(&stats.block_map),
        "page_cache" => serde_json::to_string_pretty(&stats.page_cache),
        "packer" => serde_json::to_string_pretty(&stats.packer),
        "dedup" => serde_json::to_string_pretty(&stats.dedup),
        "vios" => {
            let active: Vec<ActiveVio> = vdo
                .vios
                .dump_active()
                .into_iter()
                .map(|(id, lbn, stage)| ActiveVio { id, lbn, stage })
                .collect();
            serde_json::to_string_pretty(&active)
        }
        other => {
            return Err(VdoError::Internal(format!("unknown dump section {other}")));
        }
    };
    rendered.map_err(|err| VdoError::Internal(format!("dump serialization: {err}")))
}
