//! The assembled device: every metadata engine, the zone router, and the
//! task dispatch that stitches them together.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{error, info};

use crate::action_manager::{ActionManager, ActionSpec};
use crate::admin_state::{AdminState, DrainOperation};
use crate::block_map::{release_physical_locks, BlockMap};
use crate::config::{Layout, ThreadConfig, VdoConfig, GEOMETRY_BLOCK, SUPER_BLOCK};
use crate::data_vio::{DataVio, DataVioId, DataVioPool, VioKind, VioStep};
use crate::dedup::{AdvisoryIndex, HashZones};
use crate::error::{Result, VdoError};
use crate::geometry::Geometry;
use crate::packer::Packer;
use crate::pipeline;
use crate::read_only_notifier::{ReadOnlyListener, ReadOnlyNotifier};
use crate::recovery_journal::format::RECOVERY_ENTRIES_PER_BLOCK;
use crate::recovery_journal::RecoveryJournal;
use crate::slab_depot::SlabDepot;
use crate::storage::BlockStore;
use crate::super_block::{SuperBlock, VdoState};
use crate::types::{
    LogicalBlockNumber, SequenceNumber, ThreadId, ZoneId, BLOCK_SIZE,
};
use crate::zone::{Task, ZoneRouter};

/// Data-vios available per device.
const DATA_VIO_POOL_SIZE: usize = 64;

struct LbnLock {
    holder: DataVioId,
    waiters: crate::wait_queue::WaitQueue<DataVioId>,
}

/// A logical zone: the LBN lock table for its shard of the address space.
pub struct LogicalZone {
    pub zone: ZoneId,
    locks: HashMap<LogicalBlockNumber, LbnLock>,
}

impl LogicalZone {
    fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            locks: HashMap::new(),
        }
    }

    /// Try to take the LBN lock. Re-entry by the current holder succeeds;
    /// others park on the lock's FIFO waiters.
    pub fn lock(&mut self, lbn: LogicalBlockNumber, vio: DataVioId) -> bool {
        match self.locks.get_mut(&lbn) {
            Some(lock) if lock.holder == vio => true,
            Some(lock) => {
                lock.waiters.enqueue(vio);
                false
            }
            None => {
                self.locks.insert(
                    lbn,
                    LbnLock {
                        holder: vio,
                        waiters: crate::wait_queue::WaitQueue::new(),
                    },
                );
                true
            }
        }
    }

    /// Release the lock, handing it to the next waiter if any.
    pub fn unlock(&mut self, lbn: LogicalBlockNumber, vio: DataVioId) -> Option<DataVioId> {
        let lock = self.locks.get_mut(&lbn)?;
        if lock.holder != vio {
            return None;
        }
        match lock.waiters.notify_next() {
            Some(next) => {
                lock.holder = next;
                Some(next)
            }
            None => {
                self.locks.remove(&lbn);
                None
            }
        }
    }

    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }
}

pub struct Vdo {
    pub config: VdoConfig,
    pub layout: Layout,
    pub geometry: Geometry,
    pub super_block: SuperBlock,
    pub store: Box<dyn BlockStore>,
    pub journal: RecoveryJournal,
    pub depot: SlabDepot,
    pub block_map: BlockMap,
    pub packer: Packer,
    pub hash_zones: HashZones,
    pub index: Box<dyn AdvisoryIndex>,
    pub vios: DataVioPool,
    pub router: ZoneRouter,
    pub notifier: ReadOnlyNotifier,
    pub logical_zones: Vec<LogicalZone>,
    pub actions: ActionManager,
    pub state: AdminState,
    commit_tick_pending: bool,
}

impl Vdo {
    fn assemble(
        store: Box<dyn BlockStore>,
        config: VdoConfig,
        geometry: Geometry,
        super_block: SuperBlock,
        index: Box<dyn AdvisoryIndex>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = Layout::compute(&config)?;
        let threads = config.threads;
        let journal = RecoveryJournal::new(
            &layout,
            geometry.nonce,
            config.tail_buffer_blocks,
            RECOVERY_ENTRIES_PER_BLOCK,
            threads.logical_zones as usize,
            threads.physical_zones as usize,
        );
        let depot = SlabDepot::new(
            &layout,
            config.slab_config(),
            geometry.nonce,
            threads.physical_zones,
        );
        let block_map = BlockMap::new(
            geometry.nonce,
            layout.block_map_root_origin,
            config.root_count,
            config.logical_blocks,
            threads.logical_zones,
            threads.physical_zones,
            config.page_cache_size,
            config.maximum_age,
        );
        let mut notifier = ReadOnlyNotifier::new();
        notifier.register(ThreadConfig::JOURNAL_THREAD, ReadOnlyListener::Journal);
        for zone in 0..threads.physical_zones {
            notifier.register(threads.physical_thread(zone), ReadOnlyListener::Allocator(zone));
        }
        for zone in 0..threads.logical_zones {
            notifier.register(threads.logical_thread(zone), ReadOnlyListener::LogicalZone(zone));
        }
        notifier.register(ThreadConfig::PACKER_THREAD, ReadOnlyListener::Packer);

        let mut vdo = Self {
            layout,
            geometry,
            super_block,
            store,
            journal,
            depot,
            block_map,
            packer: Packer::new(),
            hash_zones: HashZones::new(threads.hash_zones),
            index,
            vios: DataVioPool::new(DATA_VIO_POOL_SIZE),
            router: ZoneRouter::new(threads.thread_count()),
            notifier,
            logical_zones: (0..threads.logical_zones).map(LogicalZone::new).collect(),
            actions: ActionManager::new(),
            state: AdminState::new(),
            config,
            commit_tick_pending: false,
        };
        vdo.packer.set_enabled(vdo.config.compression);
        Ok(vdo)
    }

    /// Format a fresh device on the store and return it running.
    pub fn format(
        mut store: Box<dyn BlockStore>,
        config: VdoConfig,
        index: Box<dyn AdvisoryIndex>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = Layout::compute(&config)?;
        let geometry = Geometry::generate(0, config.physical_blocks);
        store.write_block(GEOMETRY_BLOCK, &geometry.encode())?;
        let super_block = SuperBlock::new(geometry.nonce, &config, layout.block_map_root_origin);
        store.write_block(SUPER_BLOCK, &super_block.encode())?;
        store.flush()?;

        let mut vdo = Self::assemble(store, config, geometry, super_block, index)?;
        vdo.block_map.format(vdo.store.as_mut())?;
        vdo.depot.format(vdo.store.as_mut())?;
        vdo.store.flush()?;
        // The device comes back running, so it is immediately dirty: a
        // crash from here on replays the (empty) journal.
        vdo.write_super_block(VdoState::Dirty)?;
        info!(
            physical = vdo.config.physical_blocks,
            logical = vdo.config.logical_blocks,
            slabs = vdo.depot.slab_count(),
            "device formatted"
        );
        Ok(vdo)
    }

    /// Open an existing device, running whatever recovery its saved state
    /// calls for. Runtime tunables come from `base_config`; geometry comes
    /// from disk.
    pub fn open(
        mut store: Box<dyn BlockStore>,
        base_config: &VdoConfig,
        index: Box<dyn AdvisoryIndex>,
    ) -> Result<Self> {
        let mut block = [0u8; BLOCK_SIZE];
        store.read_block(GEOMETRY_BLOCK, &mut block)?;
        let geometry = Geometry::decode(&block)?;
        store.read_block(SUPER_BLOCK, &mut block)?;
        let super_block = SuperBlock::decode(&block)?;
        if super_block.nonce != geometry.nonce {
            return Err(VdoError::NonceMismatch {
                expected: geometry.nonce,
                found: super_block.nonce,
            });
        }
        let config = super_block.to_config(base_config);
        let state = super_block.state;
        let mut vdo = Self::assemble(store, config, geometry, super_block, index)?;

        vdo.journal
            .load(&vdo.super_block.journal.clone(), vdo.super_block.recovery_count);
        vdo.depot.load(vdo.store.as_mut())?;

        match state {
            VdoState::ReadOnly => {
                vdo.notifier.begin_entering("loaded read-only".to_string());
                vdo.notifier.finish_entering();
                return Ok(vdo);
            }
            state if state.requires_rebuild() => {
                return Err(VdoError::RebuildRequired(format!(
                    "device state {state:?}"
                )));
            }
            state if state.requires_recovery() => {
                vdo.state.set_recovering();
                match crate::recovery::replay(&mut vdo) {
                    Ok(_) => vdo.state.finish_recovering(),
                    Err(err) if matches!(err, VdoError::CorruptJournal(_)) => {
                        // Bounded tolerance exceeded: the device loads but
                        // refuses writes until an operator rebuild.
                        vdo.enter_read_only(format!("recovery: {err}"));
                        return Ok(vdo);
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => {
                vdo.depot.scrub_all(vdo.store.as_mut())?;
            }
        }

        // Mark the mount: a crash from here on requires recovery.
        vdo.super_block.journal = vdo.journal.record();
        vdo.write_super_block(VdoState::Dirty)?;
        info!(state = ?state, "device opened");
        Ok(vdo)
    }

    pub fn write_super_block(&mut self, state: VdoState) -> Result<()> {
        self.super_block.state = state;
        self.super_block.recovery_count = self.journal.recovery_count;
        self.super_block.physical_blocks = self.config.physical_blocks;
        self.store
            .write_block_fua(SUPER_BLOCK, &self.super_block.encode())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Task routing
    // ------------------------------------------------------------------

    pub fn thread_for_step(&self, id: DataVioId, step: VioStep) -> ThreadId {
        let vio = self.vios.get(id);
        let threads = &self.config.threads;
        match step {
            VioStep::HashLock => threads.hash_thread(vio.hash_zone),
            VioStep::Allocate => {
                let zone = vio.logical_zone % self.config.threads.physical_zones.max(1);
                threads.physical_thread(zone)
            }
            VioStep::JournalEntry => ThreadConfig::JOURNAL_THREAD,
            _ => threads.logical_thread(vio.logical_zone),
        }
    }

    pub fn schedule_vio(&mut self, id: DataVioId, step: VioStep) {
        self.vios.get_mut(id).step = step;
        let thread = self.thread_for_step(id, step);
        self.router.enqueue(thread, Task::VioStep { vio: id, step });
    }

    /// Reschedule a vio at the step it recorded when it parked.
    pub fn reschedule_vio(&mut self, id: DataVioId) {
        let step = self.vios.get(id).step;
        self.schedule_vio(id, step);
    }

    pub fn request_commit(&mut self) {
        if !self.commit_tick_pending {
            self.commit_tick_pending = true;
            self.router
                .enqueue(ThreadConfig::JOURNAL_THREAD, Task::JournalCommitTick);
        }
    }

    pub fn request_reap(&mut self) {
        self.router
            .enqueue(ThreadConfig::JOURNAL_THREAD, Task::JournalReapNotify);
    }

    /// Drain the router until no task remains.
    pub fn run_until_idle(&mut self) {
        while let Some((_thread, task)) = self.router.next_task() {
            self.dispatch(task);
        }
    }

    fn dispatch(&mut self, task: Task) {
        match task {
            Task::VioStep { vio, step } => pipeline::step(self, vio, step),
            Task::JournalCommitTick => self.handle_commit_tick(),
            Task::JournalReapNotify => self.handle_reap(),
            Task::ActionZone { index } => self.handle_action_zone(index),
            Task::ActionConclude => self.handle_action_conclude(),
            Task::FlushPacker => pipeline::flush_packer(self),
        }
    }

    // ------------------------------------------------------------------
    // Journal-side handlers
    // ------------------------------------------------------------------

    fn handle_commit_tick(&mut self) {
        self.commit_tick_pending = false;
        match self.journal.commit(self.store.as_mut()) {
            Ok(outcome) => {
                for vio in outcome.woken {
                    self.schedule_vio(vio, VioStep::ApplyUpdates);
                }
                for vio in outcome.readmitted {
                    self.reschedule_vio(vio);
                }
                if let Some(era) = outcome.new_era {
                    self.request_era_advance(era);
                }
                // Journal pressure: push slab journals out early, ordered
                // by recovery lock age, once half the space is in use.
                if (self.journal.tail() - self.journal.head()) * 2 >= self.config.journal_blocks {
                    self.relieve_journal_pressure();
                }
            }
            Err(err) => {
                error!(%err, "journal commit failed");
                self.enter_read_only(format!("journal commit: {err}"));
            }
        }
    }

    fn handle_reap(&mut self) {
        let outcome = self.journal.reap();
        for vio in outcome.readmitted {
            self.reschedule_vio(vio);
        }
    }

    pub fn relieve_journal_pressure(&mut self) {
        let threshold = self.journal.tail();
        let released = match self
            .depot
            .release_recovery_locks_before(threshold, self.store.as_mut())
        {
            Ok(released) => released,
            Err(err) => {
                self.enter_read_only(format!("slab journal commit: {err}"));
                return;
            }
        };
        let mut notify = release_physical_locks(&mut self.journal, released);
        match self
            .block_map
            .flush_all(self.store.as_mut(), &mut self.journal)
        {
            Ok(flushed) => notify |= flushed,
            Err(err) => {
                self.enter_read_only(format!("block map flush: {err}"));
                return;
            }
        }
        if notify {
            self.request_reap();
        } else {
            // Space may still be reclaimable from already-released locks.
            self.handle_reap();
        }
    }

    // ------------------------------------------------------------------
    // Era advancement through the action manager
    // ------------------------------------------------------------------

    fn era_zone_action(vdo: &mut Vdo, zone_index: usize, era: SequenceNumber) -> Result<()> {
        let notify = vdo.block_map.advance_zone_era(
            zone_index,
            era,
            vdo.store.as_mut(),
            &mut vdo.journal,
        )?;
        if notify {
            vdo.request_reap();
        }
        Ok(())
    }

    fn era_conclusion(vdo: &mut Vdo, era: SequenceNumber) -> Result<()> {
        let floor = era.saturating_sub(vdo.config.maximum_age);
        if floor > 0 {
            vdo.depot
                .save_ancient_ref_counts(floor, vdo.store.as_mut())?;
        }
        Ok(())
    }

    const ERA_ADVANCE: ActionSpec = ActionSpec {
        preamble: None,
        zone_action: Self::era_zone_action,
        conclusion: Self::era_conclusion,
    };

    pub fn request_era_advance(&mut self, era: SequenceNumber) {
        let zones = self.logical_zones.len();
        if self.actions.schedule(Self::ERA_ADVANCE, era, zones) {
            let thread = self.config.threads.logical_thread(0);
            self.router.enqueue(thread, Task::ActionZone { index: 0 });
        }
    }

    fn handle_action_zone(&mut self, index: usize) {
        let Some((spec, operand, zone_count)) = self.actions.current() else {
            return;
        };
        if index == 0 {
            if let Some(preamble) = spec.preamble {
                if let Err(err) = preamble(self, operand) {
                    self.enter_read_only(format!("action preamble: {err}"));
                }
            }
        }
        if let Err(err) = (spec.zone_action)(self, index, operand) {
            error!(%err, zone = index, "zone action failed");
            if err.is_read_only_trigger() {
                self.enter_read_only(format!("zone action: {err}"));
            }
        }
        if index + 1 < zone_count {
            let thread = self.config.threads.logical_thread((index + 1) as ZoneId);
            self.router
                .enqueue(thread, Task::ActionZone { index: index + 1 });
        } else {
            self.router
                .enqueue(ThreadConfig::ADMIN_THREAD, Task::ActionConclude);
        }
    }

    fn handle_action_conclude(&mut self) {
        if let Some((spec, operand, _)) = self.actions.current() {
            if let Err(err) = (spec.conclusion)(self, operand) {
                error!(%err, "action conclusion failed");
                if err.is_read_only_trigger() {
                    self.enter_read_only(format!("action conclusion: {err}"));
                }
            }
        }
        let zones = self.logical_zones.len();
        if self.actions.conclude(zones).is_some() {
            let thread = self.config.threads.logical_thread(0);
            self.router.enqueue(thread, Task::ActionZone { index: 0 });
        }
    }

    // ------------------------------------------------------------------
    // Read-only broadcast
    // ------------------------------------------------------------------

    pub fn enter_read_only(&mut self, reason: String) {
        let Some(listeners) = self.notifier.begin_entering(reason) else {
            return;
        };
        let mut failed: Vec<DataVioId> = Vec::new();
        for (_thread, listener) in listeners {
            match listener {
                ReadOnlyListener::Journal => {
                    failed.extend(self.journal.fail_all_waiters());
                }
                ReadOnlyListener::Allocator(_zone) => {}
                ReadOnlyListener::LogicalZone(zone) => {
                    failed.extend(
                        self.block_map.zones[zone as usize].cache.fail_all_waiters(),
                    );
                }
                ReadOnlyListener::Packer => {
                    failed.extend(self.packer.take_pending());
                }
            }
        }
        self.notifier.finish_entering();
        for vio in failed {
            pipeline::abort_vio(self, vio, VdoError::ReadOnly);
        }
        let _ = self.write_super_block(VdoState::ReadOnly);
    }

    // ------------------------------------------------------------------
    // Submission and admin
    // ------------------------------------------------------------------

    /// Launch a request. None means the data-vio pool is exhausted; the
    /// caller pumps and retries.
    pub fn submit(
        &mut self,
        kind: VioKind,
        lbn: LogicalBlockNumber,
        data: Bytes,
    ) -> Result<Option<DataVioId>> {
        if lbn >= self.config.logical_blocks {
            return Err(VdoError::OutOfRange(lbn, self.config.logical_blocks));
        }
        if kind != VioKind::Read && self.notifier.is_or_will_be_read_only() {
            return Err(VdoError::ReadOnly);
        }
        if self.state.is_quiescent() {
            return Err(VdoError::ShuttingDown);
        }
        let Some(id) = self.vios.acquire(kind, lbn, data) else {
            return Ok(None);
        };
        let zone = self.block_map.zone_for_lbn(lbn) as ZoneId;
        self.vios.get_mut(id).logical_zone = zone;
        self.schedule_vio(id, VioStep::Launch);
        Ok(Some(id))
    }

    pub fn vio(&self, id: DataVioId) -> &DataVio {
        self.vios.get(id)
    }

    /// Take a finished vio's outcome and return it to the pool.
    pub fn complete_vio(&mut self, id: DataVioId) -> Result<Option<Bytes>> {
        debug_assert!(self.vios.get(id).done);
        let vio = self.vios.get_mut(id);
        let result = vio.result.take();
        let data = vio.read_data.take();
        self.vios.release(id);
        match result {
            Some(error) => Err(error),
            None => Ok(data),
        }
    }

    /// Drain every engine: packer, journal, block map, depot. The drain is
    /// not cancellable; the first error is recorded and surfaced at the
    /// end.
    pub fn drain(&mut self, operation: DrainOperation) -> Result<()> {
        let mut first_error: Option<VdoError> = None;

        pipeline::flush_packer(self);
        self.run_until_idle();

        let suspended = self.journal.lock_counter.suspend();
        match self.journal.drain(self.store.as_mut()) {
            Ok(outcome) => {
                for vio in outcome.woken {
                    self.schedule_vio(vio, VioStep::ApplyUpdates);
                }
                for vio in outcome.readmitted {
                    self.reschedule_vio(vio);
                }
                self.run_until_idle();
            }
            Err(err) => first_error = Some(err),
        }

        if let Err(err) = self
            .block_map
            .flush_all(self.store.as_mut(), &mut self.journal)
        {
            first_error.get_or_insert(err);
        }

        match self.depot.drain(operation, self.store.as_mut()) {
            Ok(released) => {
                let _ = release_physical_locks(&mut self.journal, released);
            }
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }

        if suspended {
            self.journal.lock_counter.resume();
        }
        self.handle_reap();
        if let Err(err) = self.store.flush() {
            first_error.get_or_insert(err);
        }

        if self.state.is_normal() {
            self.state.start_draining(operation)?;
            self.state.finish_draining()?;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn resume_all(&mut self) -> Result<()> {
        if self.state.is_quiescent() {
            self.state.start_resuming()?;
            self.state.finish_resuming()?;
        }
        self.depot.resume()?;
        Ok(())
    }

    /// Quiesce and record a clean shutdown.
    pub fn close(&mut self) -> Result<()> {
        self.drain(DrainOperation::Save)?;
        self.super_block.journal = self.journal.record();
        self.write_super_block(VdoState::Clean)?;
        Ok(())
    }

    /// Two-phase physical growth: prepare allocates the new slab
    /// structures without publishing anything; perform grows the store,
    /// publishes the slabs, and records the new size.
    pub fn grow_physical(&mut self, new_physical_blocks: u64) -> Result<()> {
        if self.notifier.is_or_will_be_read_only() {
            return Err(VdoError::ReadOnly);
        }
        let added = self.depot.prepare_grow(new_physical_blocks)?;
        if let Err(err) = self.store.grow(new_physical_blocks) {
            self.depot.abandon_grow();
            return Err(err);
        }
        self.layout = self.layout.grown_to(new_physical_blocks)?;
        self.config.physical_blocks = new_physical_blocks;
        self.depot.perform_grow(self.store.as_mut())?;
        self.write_super_block(self.super_block.state)?;
        info!(added, new_physical_blocks, "physical growth complete");
        Ok(())
    }

    /// Operator-requested read-only rebuild: reconstruct the reference
    /// counts from the block map and re-initialise the journal, then
    /// return the device writable.
    pub fn rebuild(
        mut store: Box<dyn BlockStore>,
        base_config: &VdoConfig,
        index: Box<dyn AdvisoryIndex>,
    ) -> Result<Self> {
        let mut block = [0u8; BLOCK_SIZE];
        store.read_block(GEOMETRY_BLOCK, &mut block)?;
        let geometry = Geometry::decode(&block)?;
        store.read_block(SUPER_BLOCK, &mut block)?;
        let super_block = SuperBlock::decode(&block)?;
        let config = super_block.to_config(base_config);
        let mut vdo = Self::assemble(store, config, geometry, super_block, index)?;
        vdo.journal
            .load(&vdo.super_block.journal.clone(), vdo.super_block.recovery_count);
        // Slab journal sequences must continue past whatever is on disk so
        // stale blocks can never be mistaken for live ones.
        for index in 0..vdo.depot.slabs.len() {
            let header = vdo.depot.slabs[index]
                .journal
                .find_newest_block(vdo.store.as_mut())?;
            if let Some(header) = header {
                vdo.depot.slabs[index]
                    .journal
                    .reset_after_rebuild(header.sequence_number + 1);
                vdo.depot.slabs[index]
                    .journal
                    .set_recovery_ceiling(header.recovery_ceiling);
            }
        }
        crate::recovery::rebuild(&mut vdo)?;
        Ok(vdo)
    }

    pub fn allocated_blocks(&self) -> u64 {
        self.depot.allocated_blocks()
    }
}
