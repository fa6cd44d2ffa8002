//! Recovery: normal crash recovery (journal replay plus slab scrubbing)
//! and the read-only rebuild that reconstructs reference counts from the
//! block map forest.

pub mod boundaries;

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::admin_state::DrainOperation;
use crate::block_map::page::{self, PageValidity, ENTRIES_PER_PAGE};
use crate::block_map::{release_physical_locks, WalkResult, TREE_HEIGHT};
use crate::data_vio::DataVioId;
use crate::error::{Result, VdoError};
use crate::recovery_journal::format::{unpack_journal_block_any, RecoveryJournalEntry};
use crate::super_block::JournalComponentState;
use crate::types::{
    DataLocation, JournalOperation, JournalPoint, PhysicalBlockNumber, ZoneType, BLOCK_SIZE,
};
use crate::vdo::Vdo;

/// A vio id that never resolves to a pooled request; replay traversals
/// cannot park, so it is never dereferenced.
const REPLAY_VIO: DataVioId = usize::MAX;

#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryStatistics {
    pub blocks_replayed: u64,
    pub entries_replayed: u64,
    pub entries_skipped: u64,
    pub pages_rebuilt: u64,
    pub interior_pages_zeroed: u64,
}

/// Replay the recovery journal after a crash. The slab scrubber runs
/// first so every slab journal's effect is in memory; journal entries the
/// slab journals had already absorbed are skipped via each slab's
/// recovery ceiling.
pub fn replay(vdo: &mut Vdo) -> Result<RecoveryStatistics> {
    let mut stats = RecoveryStatistics::default();
    vdo.depot.scrub_all(vdo.store.as_mut())?;

    for zone in vdo.block_map.zones.iter_mut() {
        zone.cache.set_rebuild_mode(true);
    }
    let result = replay_journal(vdo, &mut stats);
    for zone in vdo.block_map.zones.iter_mut() {
        zone.cache.set_rebuild_mode(false);
    }
    let replayed = result?;

    // Commit any journal entries the replay itself appended (interior
    // page allocations), then push everything out and release the
    // transient locks the replay took.
    let _ = vdo.journal.commit(vdo.store.as_mut())?;
    vdo.block_map
        .flush_all(vdo.store.as_mut(), &mut vdo.journal)?;
    let released = vdo.depot.drain(DrainOperation::Flush, vdo.store.as_mut())?;
    release_physical_locks(&mut vdo.journal, released);
    let _ = vdo.journal.reap();
    vdo.store.flush()?;

    info!(
        blocks = stats.blocks_replayed,
        entries = stats.entries_replayed,
        skipped = stats.entries_skipped,
        replayed,
        "recovery replay complete"
    );
    Ok(stats)
}

fn replay_journal(vdo: &mut Vdo, stats: &mut RecoveryStatistics) -> Result<bool> {
    let nonce = vdo.journal.nonce();
    let journal_size = vdo.config.journal_blocks;

    // Scan every slot for self-consistent blocks. The newest one is the
    // tail; its header names the on-disk heads, and every sequence from
    // the head to the tail must be present (writes are ordered by the
    // flush-before-write discipline, and unreaped blocks are never
    // overwritten).
    let mut found = std::collections::HashMap::new();
    let mut buf = [0u8; BLOCK_SIZE];
    for slot in 0..journal_size {
        vdo.store
            .read_block(vdo.layout.journal_pbn(slot), &mut buf)?;
        if let Ok((header, entries)) = unpack_journal_block_any(&buf, nonce, journal_size) {
            if header.sequence_number % journal_size == slot {
                found.insert(header.sequence_number, (header, entries));
            }
        }
    }

    let Some(&tail_sequence) = found.keys().max() else {
        // Nothing was ever journalled.
        vdo.journal.load(
            &vdo.super_block.journal,
            vdo.super_block.recovery_count.wrapping_add(1),
        );
        return Ok(false);
    };
    let tail_header = found[&tail_sequence].0;
    let head = tail_header
        .block_map_head
        .min(tail_header.slab_journal_head)
        .max(1);

    let mut blocks = Vec::new();
    for sequence in head..=tail_sequence {
        match found.remove(&sequence) {
            Some(block) => blocks.push(block),
            None => {
                warn!(sequence, "journal gap; replaying the prefix only");
                break;
            }
        }
    }

    let Some((last_header, _)) = blocks.last() else {
        vdo.journal.load(
            &vdo.super_block.journal,
            vdo.super_block.recovery_count.wrapping_add(1),
        );
        return Ok(false);
    };

    // Counters come from the newest block's header, which snapshots them
    // after its own entries.
    let resumed = JournalComponentState {
        journal_start: last_header.sequence_number + 1,
        block_map_head: last_header.sequence_number + 1,
        slab_journal_head: last_header.sequence_number + 1,
        logical_blocks_used: last_header.logical_blocks_used,
        block_map_data_blocks: last_header.block_map_data_blocks,
    };
    vdo.journal
        .load(&resumed, vdo.super_block.recovery_count.wrapping_add(1));

    // First pass: block-map increments, reconstructing the interior tree
    // links exactly as they were allocated, in journal order.
    for (header, entries) in &blocks {
        for (index, entry) in entries.iter().enumerate() {
            if !entry.operation.is_block_map() {
                continue;
            }
            let point = JournalPoint::new(header.sequence_number, index as u16);
            replay_ref_change(
                vdo,
                entry.new_location,
                entry.operation,
                point.increment_half(),
                stats,
            )?;
            install_tree_link(vdo, entry.lbn, entry.new_location.pbn)?;
        }
    }

    // Second pass: data entries.
    for (header, entries) in &blocks {
        for (index, entry) in entries.iter().enumerate() {
            if entry.operation.is_block_map() {
                continue;
            }
            let point = JournalPoint::new(header.sequence_number, index as u16);
            replay_entry(vdo, entry, point, stats)?;
        }
        stats.blocks_replayed += 1;
    }
    Ok(true)
}

/// Re-install one journalled interior page link. The entry records the
/// leaf page index it was building toward; the link belongs at the first
/// unmapped slot along that path. A link that is already present (its
/// effect outlived the crash) is left alone.
fn install_tree_link(
    vdo: &mut Vdo,
    page_index: u64,
    pbn: PhysicalBlockNumber,
) -> Result<()> {
    let branching = ENTRIES_PER_PAGE as u64;
    // Any LBN covered by the leaf page reproduces the walk's path.
    let lbn = page_index * branching;
    let root_index = vdo.block_map.root_index_for_lbn(lbn);
    let zone_index = vdo.block_map.zone_for_lbn(lbn);
    let tree_position = page_index / vdo.block_map.root_count() as u64;
    let era = vdo.journal.tail();

    let mut current = vdo.block_map.root_pbn(root_index);
    for level in (1..TREE_HEIGHT).rev() {
        let child_slot = ((tree_position / branching.pow(level as u32 - 1)) % branching) as usize;
        let slot = {
            let Vdo {
                block_map,
                store,
                journal,
                ..
            } = vdo;
            let cache = &mut block_map.zones[zone_index].cache;
            match cache.get_page(current, REPLAY_VIO, store.as_mut(), journal)? {
                crate::block_map::page_cache::GetPage::Slot(slot) => slot,
                crate::block_map::page_cache::GetPage::Queued => {
                    return Err(VdoError::Internal(
                        "replay traversal cannot park".to_string(),
                    ))
                }
            }
        };
        let cache = &mut vdo.block_map.zones[zone_index].cache;
        let entry = page::get_entry(cache.buffer(slot), child_slot)
            .unwrap_or(DataLocation::UNMAPPED);
        if !entry.is_mapped() {
            // This is where the lost link belongs.
            page::set_entry(
                cache.buffer_mut(slot),
                child_slot,
                DataLocation::uncompressed(pbn),
            );
            cache.mark_dirty(slot, era, &mut vdo.journal);
            cache.release_page(slot);
            let child = {
                let Vdo {
                    block_map,
                    store,
                    journal,
                    ..
                } = vdo;
                block_map.zones[zone_index].cache.install_new_page(
                    pbn,
                    REPLAY_VIO,
                    store.as_mut(),
                    journal,
                )?
            };
            if let crate::block_map::page_cache::GetPage::Slot(child_slot) = child {
                let cache = &mut vdo.block_map.zones[zone_index].cache;
                cache.mark_dirty(child_slot, era, &mut vdo.journal);
                cache.release_page(child_slot);
            }
            return Ok(());
        }
        cache.release_page(slot);
        if entry.pbn == pbn {
            // Already linked; nothing was lost.
            return Ok(());
        }
        current = entry.pbn;
    }
    // Every level along the path is mapped to other pages: the link was
    // superseded before the crash.
    Ok(())
}

fn replay_entry(
    vdo: &mut Vdo,
    entry: &RecoveryJournalEntry,
    point: JournalPoint,
    stats: &mut RecoveryStatistics,
) -> Result<()> {
    // Reference count changes, skipping what the slab journals absorbed.
    match entry.operation {
        JournalOperation::DataIncrement => {
            replay_ref_change(
                vdo,
                entry.new_location,
                entry.operation,
                point.increment_half(),
                stats,
            )?;
            if entry.old_location.references_storage() {
                replay_ref_change(
                    vdo,
                    entry.old_location,
                    JournalOperation::DataDecrement,
                    point.decrement_half(),
                    stats,
                )?;
            }
        }
        JournalOperation::DataDecrement => {
            replay_ref_change(
                vdo,
                entry.old_location,
                entry.operation,
                point.decrement_half(),
                stats,
            )?;
        }
        // Handled by the first pass.
        JournalOperation::BlockMapIncrement | JournalOperation::BlockMapDecrement => {}
    }

    replay_mapping(vdo, entry)?;
    Ok(())
}

fn replay_ref_change(
    vdo: &mut Vdo,
    location: DataLocation,
    operation: JournalOperation,
    point: JournalPoint,
    stats: &mut RecoveryStatistics,
) -> Result<()> {
    if !location.references_storage() {
        return Ok(());
    }
    let Some(zone) = vdo.depot.zone_of_pbn(location.pbn) else {
        return Err(VdoError::CorruptJournal(format!(
            "journal references physical block {} outside the depot",
            location.pbn
        )));
    };
    let Some(slab) = vdo.depot.slab_containing(location.pbn) else {
        return Ok(());
    };
    if !vdo.depot.slabs[slab as usize]
        .recovery_ceiling()
        .before(&point)
    {
        // Already absorbed by the slab journal before the crash.
        stats.entries_skipped += 1;
        return Ok(());
    }
    // Hold the (re-initialised) lock slot for the entry until the slab
    // journal commits during the post-replay flush.
    vdo.journal
        .acquire_block_reference(point.sequence_number, ZoneType::Physical, zone);
    let released = vdo.depot.adjust_reference(
        location.pbn,
        operation,
        point,
        point.sequence_number,
        vdo.store.as_mut(),
    )?;
    release_physical_locks(&mut vdo.journal, released);
    stats.entries_replayed += 1;
    Ok(())
}

fn replay_mapping(vdo: &mut Vdo, entry: &RecoveryJournalEntry) -> Result<()> {
    let outcome = {
        let Vdo {
            block_map,
            store,
            journal,
            depot,
            ..
        } = vdo;
        block_map.walk(
            entry.lbn,
            REPLAY_VIO,
            true,
            store.as_mut(),
            journal,
            depot,
        )?
    };
    if outcome.notify_reap {
        let _ = vdo.journal.reap();
    }
    match outcome.result {
        WalkResult::Leaf(leaf) => {
            let era = vdo.journal.tail();
            let cache = &mut vdo.block_map.zones[leaf.zone_index].cache;
            page::set_entry(
                cache.buffer_mut(leaf.page_slot),
                leaf.entry_slot,
                entry.new_location,
            );
            cache.mark_dirty(leaf.page_slot, era, &mut vdo.journal);
            cache.release_page(leaf.page_slot);
            Ok(())
        }
        other => Err(VdoError::Internal(format!(
            "replay traversal cannot park: {other:?}"
        ))),
    }
}

/// Read-only rebuild: reconstruct every slab's reference counts from the
/// on-disk block map, zero-filling invalid interior pages, then truncate
/// and re-initialise the recovery journal.
pub fn rebuild(vdo: &mut Vdo) -> Result<RecoveryStatistics> {
    let mut stats = RecoveryStatistics::default();
    info!("read-only rebuild started");

    for slab in vdo.depot.slabs.iter_mut() {
        slab.ref_counts.reset_all();
        slab.status = crate::slab_depot::slab::SlabStatus::Rebuilding;
    }

    let nonce = vdo.geometry.nonce;
    let mut logical_blocks_used = 0u64;
    let mut block_map_pages = 0u64;
    let mut visited: HashSet<PhysicalBlockNumber> = HashSet::new();
    let mut buf = vec![0u8; BLOCK_SIZE];

    for root in 0..vdo.block_map.root_count() {
        let root_pbn = vdo.block_map.root_pbn(root);
        let mut stack: Vec<(PhysicalBlockNumber, u8)> = vec![(root_pbn, TREE_HEIGHT - 1)];
        while let Some((pbn, level)) = stack.pop() {
            if !visited.insert(pbn) {
                continue;
            }
            vdo.store.read_block(pbn, &mut buf)?;
            match page::validate_page(&buf, nonce, pbn) {
                PageValidity::Valid { .. } => {}
                _ => {
                    // Zero-fill; the subtree is re-allocated on next use.
                    page::format_page(&mut buf, nonce, pbn, level == TREE_HEIGHT - 1);
                    vdo.store.write_block(pbn, &buf)?;
                    stats.interior_pages_zeroed += 1;
                    continue;
                }
            }
            stats.pages_rebuilt += 1;
            let mut rewrite = false;
            for slot in 0..ENTRIES_PER_PAGE {
                let entry = match page::get_entry(&buf, slot) {
                    Ok(entry) => entry,
                    Err(_) => {
                        page::set_entry(&mut buf, slot, DataLocation::UNMAPPED);
                        rewrite = true;
                        continue;
                    }
                };
                if !entry.is_mapped() {
                    continue;
                }
                if level > 0 {
                    // Interior pointer: exactly one reference per page.
                    if entry.state != crate::types::BlockMappingState::Uncompressed
                        || !vdo.depot.is_data_block(entry.pbn)
                    {
                        page::set_entry(&mut buf, slot, DataLocation::UNMAPPED);
                        rewrite = true;
                        continue;
                    }
                    add_rebuilt_reference(vdo, entry.pbn, 1);
                    block_map_pages += 1;
                    stack.push((entry.pbn, level - 1));
                } else {
                    logical_blocks_used += 1;
                    if entry.references_storage() {
                        if !vdo.depot.is_data_block(entry.pbn) {
                            page::set_entry(&mut buf, slot, DataLocation::UNMAPPED);
                            logical_blocks_used -= 1;
                            rewrite = true;
                            continue;
                        }
                        // Each compressed slot counts independently.
                        add_rebuilt_reference(vdo, entry.pbn, 1);
                    }
                }
            }
            if rewrite {
                page::advance_generation(&mut buf);
                vdo.store.write_block(pbn, &buf)?;
            }
        }
    }

    // Truncate and re-initialise the journal; sequence numbers continue
    // monotonically so stale blocks can never replay.
    let journal_state = JournalComponentState {
        journal_start: vdo.super_block.journal.journal_start.max(vdo.journal.tail()),
        block_map_head: 0,
        slab_journal_head: 0,
        logical_blocks_used,
        block_map_data_blocks: block_map_pages,
    };
    vdo.journal.load(
        &journal_state,
        vdo.super_block.recovery_count.wrapping_add(1),
    );

    // Save the rebuilt counts and mark every slab clean.
    for slab in vdo.depot.slabs.iter_mut() {
        slab.status = crate::slab_depot::slab::SlabStatus::Rebuilt;
    }
    let released = vdo.depot.drain(DrainOperation::Flush, vdo.store.as_mut())?;
    release_physical_locks(&mut vdo.journal, released);
    vdo.notifier.exit_read_only();
    vdo.super_block.journal = vdo.journal.record();
    vdo.write_super_block(crate::super_block::VdoState::Dirty)?;
    vdo.store.flush()?;

    info!(
        pages = stats.pages_rebuilt,
        zeroed = stats.interior_pages_zeroed,
        logical_blocks_used,
        "read-only rebuild complete"
    );
    Ok(stats)
}

fn add_rebuilt_reference(vdo: &mut Vdo, pbn: PhysicalBlockNumber, delta: u8) {
    let Some(number) = vdo.depot.slab_containing(pbn) else {
        return;
    };
    let slab = &mut vdo.depot.slabs[number as usize];
    let Ok(sbn) = slab.sbn_for_pbn(pbn) else {
        return;
    };
    let current = slab.ref_counts.count(sbn);
    let updated = current.saturating_add(delta).min(crate::slab_depot::ref_counts::MAXIMUM_REFERENCE);
    slab.ref_counts.set_count_for_rebuild(sbn, updated);
}
