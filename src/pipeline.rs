//! The data-vio pipeline: the staged lifecycle of every read and write.
//!
//! Each stage runs as a task on the zone that owns the state it touches.
//! A stage either completes and schedules the next one, or parks the vio
//! on a wait queue (LBN lock, hash lock, journal space, cache pressure,
//! packer batch); the resumer reschedules the vio at its recorded stage.

use bytes::Bytes;
use tracing::{error, trace, warn};

use crate::block_map::page;
use crate::block_map::{release_physical_locks, WalkResult};
use crate::compressed_block::get_fragment;
use crate::data_vio::{DataVioId, VioKind, VioStep};
use crate::dedup::{self, HashLockOutcome};
use crate::error::{Result, VdoError};
use crate::packer::{compress_block, decompress_fragment, ClosedBatch};
use crate::recovery_journal::format::RecoveryJournalEntry;
use crate::recovery_journal::AddEntryOutcome;
use crate::types::{
    BlockMappingState, DataLocation, JournalOperation, ZoneId, ZoneType, BLOCK_SIZE, ZERO_BLOCK,
};
use crate::vdo::Vdo;

/// Run one pipeline stage for a vio, converting any error into a failed
/// completion (and read-only mode where the taxonomy calls for it).
pub fn step(vdo: &mut Vdo, id: DataVioId, step: VioStep) {
    if vdo.vios.get(id).done {
        return;
    }
    if vdo.notifier.is_or_will_be_read_only() && vdo.vios.get(id).kind != VioKind::Read {
        abort_vio(vdo, id, VdoError::ReadOnly);
        return;
    }
    trace!(vio = id, stage = step.name(), "pipeline step");
    let result = match step {
        VioStep::Launch => launch(vdo, id),
        VioStep::LogicalLock => logical_lock(vdo, id),
        VioStep::HashLock => hash_lock(vdo, id),
        VioStep::Allocate => allocate(vdo, id),
        VioStep::TreeWalk => tree_walk(vdo, id),
        VioStep::JournalEntry => journal_entry(vdo, id),
        VioStep::ApplyUpdates => apply_updates(vdo, id),
        VioStep::Cleanup => {
            finish(vdo, id);
            Ok(())
        }
        VioStep::ReadLookup => read_lookup(vdo, id),
    };
    if let Err(err) = result {
        handle_error(vdo, id, err);
    }
}

fn launch(vdo: &mut Vdo, id: DataVioId) -> Result<()> {
    let vio = vdo.vios.get_mut(id);
    match vio.kind {
        VioKind::Write => {
            if vio.data.iter().all(|&b| b == 0) {
                // Zero blocks map to the zero block and consume nothing.
                vio.is_zero_block = true;
                vio.new_mapping = Some(DataLocation::uncompressed(ZERO_BLOCK));
            } else {
                let name = dedup::chunk_name(&vio.data);
                vio.chunk_name = Some(name);
                vio.hash_zone = vdo.hash_zones.zone_for_name(&name);
            }
        }
        VioKind::Trim => {
            vio.new_mapping = Some(DataLocation::UNMAPPED);
        }
        VioKind::Read => {}
    }
    vdo.schedule_vio(id, VioStep::LogicalLock);
    Ok(())
}

fn logical_lock(vdo: &mut Vdo, id: DataVioId) -> Result<()> {
    let (lbn, zone) = {
        let vio = vdo.vios.get(id);
        (vio.lbn, vio.logical_zone)
    };
    if !vdo.logical_zones[zone as usize].lock(lbn, id) {
        // Parked behind the current holder.
        return Ok(());
    }
    vdo.vios.get_mut(id).holds_logical_lock = true;
    let next = {
        let vio = vdo.vios.get(id);
        match vio.kind {
            VioKind::Read => VioStep::ReadLookup,
            VioKind::Trim => VioStep::TreeWalk,
            VioKind::Write if vio.is_zero_block => VioStep::TreeWalk,
            VioKind::Write => VioStep::HashLock,
        }
    };
    vdo.schedule_vio(id, next);
    Ok(())
}

fn hash_lock(vdo: &mut Vdo, id: DataVioId) -> Result<()> {
    let name = vdo
        .vios
        .get(id)
        .chunk_name
        .ok_or_else(|| VdoError::Internal("hash lock without chunk name".to_string()))?;
    match vdo.hash_zones.acquire(name, id) {
        HashLockOutcome::Waiting => {
            vdo.vios.get_mut(id).holds_hash_lock = true;
            Ok(())
        }
        HashLockOutcome::Agent => {
            vdo.vios.get_mut(id).holds_hash_lock = true;
            vdo.hash_zones.stats.queries += 1;
            let advice = vdo.index.query(&name);
            if let Some(location) = advice {
                if verify_advice(vdo, id, location)? {
                    vdo.hash_zones.stats.advice_valid += 1;
                    let vio = vdo.vios.get_mut(id);
                    vio.new_mapping = Some(location);
                    vio.is_duplicate = true;
                    vdo.schedule_vio(id, VioStep::TreeWalk);
                    return Ok(());
                }
                // Dedup advice is never trusted without verification;
                // stale advice is dropped from the index.
                vdo.hash_zones.stats.advice_stale += 1;
                vdo.index.forget(&name);
            }
            vdo.schedule_vio(id, VioStep::Allocate);
            Ok(())
        }
    }
}

/// Compare the actual contents at the advised location with this write's
/// data. Stale advice (freed block, rewritten data, invalid fragment)
/// reads as a mismatch, not an error.
fn verify_advice(vdo: &mut Vdo, id: DataVioId, advice: DataLocation) -> Result<bool> {
    if !advice.references_storage() {
        return Ok(false);
    }
    match vdo.depot.reference_count(advice.pbn) {
        Some(count) if count >= 1 && count != crate::slab_depot::ref_counts::PROVISIONAL_REFERENCE => {}
        _ => return Ok(false),
    }
    let mut block = vec![0u8; BLOCK_SIZE];
    vdo.store.read_block(advice.pbn, &mut block)?;
    let vio = vdo.vios.get(id);
    match advice.state {
        BlockMappingState::Uncompressed => Ok(block[..] == vio.data[..]),
        BlockMappingState::Compressed(_) => {
            let Ok(fragment) = get_fragment(advice.state, &block) else {
                return Ok(false);
            };
            match decompress_fragment(fragment) {
                Ok(restored) => Ok(restored[..] == vio.data[..]),
                Err(_) => Ok(false),
            }
        }
        BlockMappingState::Unmapped => Ok(false),
    }
}

fn allocate(vdo: &mut Vdo, id: DataVioId) -> Result<()> {
    // Try the compression path once per write.
    let should_compress = {
        let vio = vdo.vios.get(id);
        vdo.packer.is_enabled() && !vio.is_duplicate && !vio.compression.tried
    };
    if should_compress {
        vdo.vios.get_mut(id).compression.tried = true;
        let compressed = compress_block(&vdo.vios.get(id).data);
        if let Some(fragment) = compressed {
            vdo.vios.get_mut(id).compression.compressed = Some(fragment.clone());
            if let Some(batch) = vdo.packer.add(id, fragment) {
                process_batch(vdo, batch);
            }
            // Either packed (scheduled by the batch) or parked in the
            // packer until its batch closes.
            return Ok(());
        }
    }

    let (zone, era) = {
        let vio = vdo.vios.get(id);
        let zone = vio.logical_zone % vdo.config.threads.physical_zones.max(1);
        (zone as ZoneId, vdo.journal.tail())
    };
    let pbn = vdo.depot.allocate_block(zone, era)?;
    vdo.vios.get_mut(id).allocation = Some(pbn);
    let data = vdo.vios.get(id).data.clone();
    vdo.store.write_block(pbn, &data)?;
    vdo.vios.get_mut(id).new_mapping = Some(DataLocation::uncompressed(pbn));
    vdo.schedule_vio(id, VioStep::TreeWalk);
    Ok(())
}

/// Land a closed packer batch: the agent takes one allocation, every
/// client shares it with a compressed-slot mapping. An aborted batch
/// (size one) sends its vio back through the uncompressed path.
pub fn process_batch(vdo: &mut Vdo, batch: ClosedBatch) {
    if batch.aborted {
        for (member, _) in batch.placements {
            vdo.vios.get_mut(member).compression.compressed = None;
            vdo.schedule_vio(member, VioStep::Allocate);
        }
        return;
    }
    let agent = batch.placements[0].0;
    let zone =
        (vdo.vios.get(agent).logical_zone % vdo.config.threads.physical_zones.max(1)) as ZoneId;
    let era = vdo.journal.tail();
    let pbn = match vdo.depot.allocate_block(zone, era) {
        Ok(pbn) => pbn,
        Err(err) => {
            warn!(%err, "compressed batch allocation failed");
            for (member, _) in batch.placements {
                abort_vio(vdo, member, VdoError::OutOfSpace);
            }
            return;
        }
    };
    let block = batch
        .block
        .as_ref()
        .unwrap_or_else(|| unreachable!("non-aborted batch carries a block"));
    if let Err(err) = vdo.store.write_block(pbn, block) {
        let reason = format!("compressed block write: {err}");
        for (member, _) in batch.placements {
            abort_vio(vdo, member, VdoError::Io(std::io::Error::other(reason.clone())));
        }
        vdo.enter_read_only(reason);
        return;
    }
    vdo.vios.get_mut(agent).allocation = Some(pbn);
    for (member, slot) in batch.placements {
        let vio = vdo.vios.get_mut(member);
        vio.compression.slot = Some(slot);
        vio.compression.batch_pbn = Some(pbn);
        vio.new_mapping = Some(DataLocation::new(pbn, BlockMappingState::for_slot(slot)));
        vdo.schedule_vio(member, VioStep::TreeWalk);
    }
}

pub fn flush_packer(vdo: &mut Vdo) {
    if let Some(batch) = vdo.packer.flush() {
        process_batch(vdo, batch);
    }
}

fn tree_walk(vdo: &mut Vdo, id: DataVioId) -> Result<()> {
    let lbn = vdo.vios.get(id).lbn;
    let outcome = {
        let Vdo {
            block_map,
            store,
            journal,
            depot,
            ..
        } = vdo;
        block_map.walk(lbn, id, true, store.as_mut(), journal, depot)?
    };
    for woken in outcome.woken {
        vdo.reschedule_vio(woken);
    }
    if outcome.notify_reap {
        vdo.request_reap();
    }
    match outcome.result {
        WalkResult::Queued => Ok(()),
        WalkResult::Unmapped => Err(VdoError::Internal(
            "allocating walk reported unmapped".to_string(),
        )),
        WalkResult::Leaf(leaf) => {
            let cache = &mut vdo.block_map.zones[leaf.zone_index].cache;
            let old = match page::get_entry(cache.buffer(leaf.page_slot), leaf.entry_slot) {
                Ok(entry) => entry,
                Err(err) => {
                    // An unreadable mapping is treated as unmapped on the
                    // write path; the write will repair it.
                    warn!(lbn, %err, "invalid mapping overwritten");
                    DataLocation::UNMAPPED
                }
            };
            let leaf_pbn = cache.pbn_of(leaf.page_slot);
            let woken = cache.release_page(leaf.page_slot);
            if let Some(w) = woken {
                vdo.reschedule_vio(w);
            }
            let vio = vdo.vios.get_mut(id);
            vio.old_mapping = Some(old);
            vio.tree_lock.leaf_pbn = Some(leaf_pbn);
            vdo.schedule_vio(id, VioStep::JournalEntry);
            Ok(())
        }
    }
}

fn journal_entry(vdo: &mut Vdo, id: DataVioId) -> Result<()> {
    let (entry, logical_zone) = {
        let vio = vdo.vios.get(id);
        let old = vio.old_mapping.unwrap_or(DataLocation::UNMAPPED);
        let new = vio.target_mapping();
        let operation = match vio.kind {
            VioKind::Trim => JournalOperation::DataDecrement,
            _ => JournalOperation::DataIncrement,
        };
        (
            RecoveryJournalEntry {
                operation,
                lbn: vio.lbn,
                old_location: old,
                new_location: new,
            },
            vio.logical_zone,
        )
    };
    let mut physical_zones = Vec::with_capacity(2);
    if entry.new_location.references_storage() {
        if let Some(zone) = vdo.depot.zone_of_pbn(entry.new_location.pbn) {
            physical_zones.push(zone);
        }
    }
    if entry.old_location.references_storage() {
        if let Some(zone) = vdo.depot.zone_of_pbn(entry.old_location.pbn) {
            physical_zones.push(zone);
        }
    }
    match vdo.journal.add_entry(id, true, entry, logical_zone, &physical_zones) {
        AddEntryOutcome::Added { point } => {
            let vio = vdo.vios.get_mut(id);
            vio.recovery_point = point;
            vio.recovery_sequence = point.sequence_number;
            vdo.request_commit();
            Ok(())
        }
        AddEntryOutcome::Queued => {
            // Journal space exhausted: push downstream state out so the
            // reap can advance the head and readmit us.
            vdo.relieve_journal_pressure();
            Ok(())
        }
    }
}

fn apply_updates(vdo: &mut Vdo, id: DataVioId) -> Result<()> {
    let (point, old, new, lbn, logical_zone) = {
        let vio = vdo.vios.get(id);
        (
            vio.recovery_point,
            vio.old_mapping.unwrap_or(DataLocation::UNMAPPED),
            vio.target_mapping(),
            vio.lbn,
            vio.logical_zone,
        )
    };
    let sequence = point.sequence_number;
    let mut notify = false;

    if !vdo.vios.get(id).refs_applied {
        vdo.vios.get_mut(id).refs_applied = true;
        if new.references_storage() {
            let released = vdo.depot.adjust_reference(
                new.pbn,
                JournalOperation::DataIncrement,
                point.increment_half(),
                sequence,
                vdo.store.as_mut(),
            )?;
            notify |= release_physical_locks(&mut vdo.journal, released);
        }
        if old.references_storage() {
            let released = vdo.depot.adjust_reference(
                old.pbn,
                JournalOperation::DataDecrement,
                point.decrement_half(),
                sequence,
                vdo.store.as_mut(),
            )?;
            notify |= release_physical_locks(&mut vdo.journal, released);
        }
    }

    // Install the new mapping in the leaf page.
    let outcome = {
        let Vdo {
            block_map,
            store,
            journal,
            depot,
            ..
        } = vdo;
        block_map.walk(lbn, id, true, store.as_mut(), journal, depot)?
    };
    for woken in outcome.woken {
        vdo.reschedule_vio(woken);
    }
    notify |= outcome.notify_reap;
    match outcome.result {
        WalkResult::Queued => {
            if notify {
                vdo.request_reap();
            }
            return Ok(());
        }
        WalkResult::Unmapped => {
            return Err(VdoError::Internal(
                "allocating walk reported unmapped".to_string(),
            ))
        }
        WalkResult::Leaf(leaf) => {
            let cache = &mut vdo.block_map.zones[leaf.zone_index].cache;
            page::set_entry(cache.buffer_mut(leaf.page_slot), leaf.entry_slot, new);
            cache.mark_dirty(leaf.page_slot, sequence, &mut vdo.journal);
            if let Some(w) = cache.release_page(leaf.page_slot) {
                vdo.reschedule_vio(w);
            }
        }
    }

    // The in-memory block map now reflects the entry; drop its per-entry
    // logical lock (the dirty page holds its own era reference).
    notify |= vdo
        .journal
        .release_block_reference(sequence, ZoneType::Logical, logical_zone);
    if notify {
        vdo.request_reap();
    }
    vdo.schedule_vio(id, VioStep::Cleanup);
    Ok(())
}

fn read_lookup(vdo: &mut Vdo, id: DataVioId) -> Result<()> {
    let lbn = vdo.vios.get(id).lbn;
    let outcome = {
        let Vdo {
            block_map,
            store,
            journal,
            depot,
            ..
        } = vdo;
        block_map.walk(lbn, id, false, store.as_mut(), journal, depot)?
    };
    for woken in outcome.woken {
        vdo.reschedule_vio(woken);
    }
    if outcome.notify_reap {
        vdo.request_reap();
    }
    let mapping = match outcome.result {
        WalkResult::Queued => return Ok(()),
        WalkResult::Unmapped => DataLocation::UNMAPPED,
        WalkResult::Leaf(leaf) => {
            let cache = &mut vdo.block_map.zones[leaf.zone_index].cache;
            let entry = page::get_entry(cache.buffer(leaf.page_slot), leaf.entry_slot);
            if let Some(w) = cache.release_page(leaf.page_slot) {
                vdo.reschedule_vio(w);
            }
            // Unlike the write path, an invalid mapping fails a read.
            entry?
        }
    };

    let data = if !mapping.references_storage() {
        Bytes::from(vec![0u8; BLOCK_SIZE])
    } else {
        let mut block = vec![0u8; BLOCK_SIZE];
        vdo.store.read_block(mapping.pbn, &mut block)?;
        match mapping.state {
            BlockMappingState::Uncompressed => Bytes::from(block),
            BlockMappingState::Compressed(_) => {
                let fragment = get_fragment(mapping.state, &block)?;
                decompress_fragment(fragment)?
            }
            BlockMappingState::Unmapped => Bytes::from(vec![0u8; BLOCK_SIZE]),
        }
    };
    vdo.vios.get_mut(id).read_data = Some(data);
    finish(vdo, id);
    Ok(())
}

/// Common completion: resolve/release the hash lock, release the LBN
/// lock, mark the vio done. Runs for successes and failures alike.
fn finish(vdo: &mut Vdo, id: DataVioId) {
    let (holds_hash, holds_logical, name, lbn, zone) = {
        let vio = vdo.vios.get(id);
        (
            vio.holds_hash_lock,
            vio.holds_logical_lock,
            vio.chunk_name,
            vio.lbn,
            vio.logical_zone,
        )
    };

    if holds_hash {
        if let Some(name) = name {
            let succeeded = vdo.vios.get(id).result.is_none();
            if succeeded && vdo.hash_zones.is_agent(&name, id) {
                let mapping = vdo.vios.get(id).target_mapping();
                if mapping.references_storage() {
                    let waiters = vdo.hash_zones.resolve(&name, mapping);
                    for waiter in waiters {
                        let shared = vdo.vios.get_mut(waiter);
                        shared.new_mapping = Some(mapping);
                        shared.is_duplicate = true;
                        vdo.schedule_vio(waiter, VioStep::TreeWalk);
                        vdo.hash_zones.stats.concurrent_shares += 1;
                    }
                    vdo.index.update(&name, mapping);
                    vdo.hash_zones.stats.updates += 1;
                }
            }
            let orphans = vdo.hash_zones.release(&name, id);
            for orphan in orphans {
                // The agent bailed; each waiter restarts on its own.
                vdo.schedule_vio(orphan, VioStep::HashLock);
            }
        }
        vdo.vios.get_mut(id).holds_hash_lock = false;
    }

    if holds_logical {
        if let Some(next) = vdo.logical_zones[zone as usize].unlock(lbn, id) {
            vdo.schedule_vio(next, VioStep::LogicalLock);
        }
        vdo.vios.get_mut(id).holds_logical_lock = false;
    }

    vdo.vios.get_mut(id).done = true;
}

/// Fail a vio, unwinding whatever it holds.
pub fn abort_vio(vdo: &mut Vdo, id: DataVioId, err: VdoError) {
    if vdo.vios.get(id).done {
        return;
    }
    {
        let vio = vdo.vios.get_mut(id);
        if vio.result.is_none() {
            vio.result = Some(err);
        }
    }
    let (allocation, refs_applied) = {
        let vio = vdo.vios.get(id);
        (vio.allocation, vio.refs_applied)
    };
    if let Some(pbn) = allocation {
        if !refs_applied {
            vdo.depot.vacate_provisional(pbn);
        }
    }
    vdo.packer.remove(id);
    finish(vdo, id);
}

fn handle_error(vdo: &mut Vdo, id: DataVioId, err: VdoError) {
    error!(vio = id, %err, "pipeline stage failed");
    if err.is_read_only_trigger() {
        vdo.enter_read_only(format!("data path: {err}"));
    }
    abort_vio(vdo, id, err);
}
