//! The device facade: named devices over a backing store, the synchronous
//! read/write surface, and the runtime control operations.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{bounded, tick, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::admin_state::DrainOperation;
use crate::config::{ThreadConfig, VdoConfig};
use crate::data_vio::{DataVioId, VioKind};
use crate::dedup::AdvisoryIndex;
use crate::error::{Result, VdoError};
use crate::registry;
use crate::statistics::{self, VdoStatistics};
use crate::storage::BlockStore;
use crate::super_block::VdoState;
use crate::types::{LogicalBlockNumber, BLOCK_SIZE};
use crate::vdo::Vdo;
use crate::zone::Task;

struct Flusher {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Device {
    name: String,
    vdo: Arc<Mutex<Vdo>>,
    flusher: Option<Flusher>,
}

impl Device {
    pub fn format(
        name: &str,
        store: Box<dyn BlockStore>,
        config: VdoConfig,
        index: Box<dyn AdvisoryIndex>,
    ) -> Result<Self> {
        let vdo = Vdo::format(store, config, index)?;
        Self::from_vdo(name, vdo)
    }

    pub fn open(
        name: &str,
        store: Box<dyn BlockStore>,
        base_config: &VdoConfig,
        index: Box<dyn AdvisoryIndex>,
    ) -> Result<Self> {
        let vdo = Vdo::open(store, base_config, index)?;
        Self::from_vdo(name, vdo)
    }

    /// Operator-requested rebuild of a device that refuses to load.
    pub fn rebuild(
        name: &str,
        store: Box<dyn BlockStore>,
        base_config: &VdoConfig,
        index: Box<dyn AdvisoryIndex>,
    ) -> Result<Self> {
        let vdo = Vdo::rebuild(store, base_config, index)?;
        Self::from_vdo(name, vdo)
    }

    fn from_vdo(name: &str, vdo: Vdo) -> Result<Self> {
        let handle = Arc::new(Mutex::new(vdo));
        registry::register(name, &handle)?;
        Ok(Self {
            name: name.to_string(),
            vdo: handle,
            flusher: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pad_block(data: &[u8]) -> Result<Bytes> {
        if data.len() > BLOCK_SIZE {
            return Err(VdoError::Internal(format!(
                "write of {} bytes exceeds the {BLOCK_SIZE}-byte block size",
                data.len()
            )));
        }
        if data.len() == BLOCK_SIZE {
            return Ok(Bytes::copy_from_slice(data));
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..data.len()].copy_from_slice(data);
        Ok(Bytes::from(block))
    }

    fn submit_and_wait(
        vdo: &mut Vdo,
        kind: VioKind,
        lbn: LogicalBlockNumber,
        data: Bytes,
    ) -> Result<DataVioId> {
        let id = loop {
            match vdo.submit(kind, lbn, data.clone())? {
                Some(id) => break id,
                None if vdo.router.is_idle() => {
                    return Err(VdoError::Internal(
                        "data-vio pool exhausted while idle".to_string(),
                    ));
                }
                None => vdo.run_until_idle(),
            }
        };
        vdo.run_until_idle();
        if !vdo.vio(id).done {
            // Parked in the packer; force its batch closed.
            vdo.router
                .enqueue(ThreadConfig::PACKER_THREAD, Task::FlushPacker);
            vdo.run_until_idle();
        }
        if !vdo.vio(id).done {
            warn!(lbn, "request stalled; failing");
            crate::pipeline::abort_vio(vdo, id, VdoError::Internal("request stalled".to_string()));
        }
        Ok(id)
    }

    pub fn write(&self, lbn: LogicalBlockNumber, data: &[u8]) -> Result<()> {
        let block = Self::pad_block(data)?;
        let mut vdo = self.vdo.lock();
        let id = Self::submit_and_wait(&mut vdo, VioKind::Write, lbn, block)?;
        vdo.complete_vio(id).map(|_| ())
    }

    /// Complete and recycle every finished vio in `pending`, recording the
    /// first error. Returns how many finished.
    fn reap_finished(
        vdo: &mut Vdo,
        pending: &mut Vec<DataVioId>,
        first_error: &mut Option<VdoError>,
    ) -> usize {
        let mut finished = 0;
        let mut index = 0;
        while index < pending.len() {
            let id = pending[index];
            if vdo.vio(id).done {
                if let Err(err) = vdo.complete_vio(id) {
                    first_error.get_or_insert(err);
                }
                pending.swap_remove(index);
                finished += 1;
            } else {
                index += 1;
            }
        }
        finished
    }

    /// Submit a batch of writes together, completing them all. Concurrent
    /// submission is what lets compressible writes share packer batches
    /// and identical data share hash locks.
    pub fn write_many(&self, writes: &[(LogicalBlockNumber, &[u8])]) -> Result<()> {
        let mut vdo = self.vdo.lock();
        let mut first_error: Option<VdoError> = None;
        let mut pending: Vec<DataVioId> = Vec::new();
        for (lbn, data) in writes {
            let block = Self::pad_block(data)?;
            let submitted = loop {
                match vdo.submit(VioKind::Write, *lbn, block.clone()) {
                    Ok(Some(id)) => break Some(id),
                    Ok(None) => {
                        // Pool exhausted: run the fleet down, recycle what
                        // finished, and force packer batches out if that
                        // was not enough.
                        vdo.run_until_idle();
                        if Self::reap_finished(&mut vdo, &mut pending, &mut first_error) == 0 {
                            vdo.router
                                .enqueue(ThreadConfig::PACKER_THREAD, Task::FlushPacker);
                            vdo.run_until_idle();
                            if Self::reap_finished(&mut vdo, &mut pending, &mut first_error) == 0
                            {
                                first_error.get_or_insert(VdoError::Internal(
                                    "data-vio pool exhausted".to_string(),
                                ));
                                break None;
                            }
                        }
                    }
                    Err(err) => {
                        first_error.get_or_insert(err);
                        break None;
                    }
                }
            };
            if let Some(id) = submitted {
                pending.push(id);
            }
        }
        vdo.run_until_idle();
        vdo.router
            .enqueue(ThreadConfig::PACKER_THREAD, Task::FlushPacker);
        vdo.run_until_idle();
        for id in pending {
            if !vdo.vio(id).done {
                crate::pipeline::abort_vio(
                    &mut vdo,
                    id,
                    VdoError::Internal("request stalled".to_string()),
                );
            }
            if let Err(err) = vdo.complete_vio(id) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn read(&self, lbn: LogicalBlockNumber) -> Result<Bytes> {
        let mut vdo = self.vdo.lock();
        let id = Self::submit_and_wait(&mut vdo, VioKind::Read, lbn, Bytes::new())?;
        let data = vdo.complete_vio(id)?;
        data.ok_or_else(|| VdoError::Internal("read completed without data".to_string()))
    }

    /// Discard a logical block: subsequent reads return zeros and any
    /// physical reference is dropped.
    pub fn trim(&self, lbn: LogicalBlockNumber) -> Result<()> {
        let mut vdo = self.vdo.lock();
        let id = Self::submit_and_wait(&mut vdo, VioKind::Trim, lbn, Bytes::new())?;
        vdo.complete_vio(id).map(|_| ())
    }

    /// Commit outstanding state: packer batches, journal blocks, and the
    /// backing store's volatile writes.
    pub fn flush(&self) -> Result<()> {
        let mut vdo = self.vdo.lock();
        vdo.router
            .enqueue(ThreadConfig::PACKER_THREAD, Task::FlushPacker);
        vdo.request_commit();
        vdo.run_until_idle();
        vdo.store.flush()?;
        Ok(())
    }

    pub fn suspend(&self) -> Result<()> {
        let mut vdo = self.vdo.lock();
        vdo.drain(DrainOperation::Suspend)
    }

    pub fn resume(&self) -> Result<()> {
        let mut vdo = self.vdo.lock();
        vdo.resume_all()
    }

    /// Two-phase physical growth: prepare builds the new slab structures,
    /// perform publishes them and the new capacity.
    pub fn grow_physical(&self, new_physical_blocks: u64) -> Result<()> {
        let mut vdo = self.vdo.lock();
        vdo.grow_physical(new_physical_blocks)
    }

    pub fn set_compression(&self, enabled: bool) -> Result<()> {
        let mut vdo = self.vdo.lock();
        vdo.packer.set_enabled(enabled);
        if !enabled {
            vdo.router
                .enqueue(ThreadConfig::PACKER_THREAD, Task::FlushPacker);
            vdo.run_until_idle();
        }
        Ok(())
    }

    pub fn dump(&self, what: &str) -> Result<String> {
        let vdo = self.vdo.lock();
        statistics::dump(&vdo, what)
    }

    pub fn statistics(&self) -> VdoStatistics {
        let vdo = self.vdo.lock();
        statistics::gather(&vdo)
    }

    pub fn allocated_blocks(&self) -> u64 {
        self.vdo.lock().allocated_blocks()
    }

    pub fn is_read_only(&self) -> bool {
        self.vdo.lock().notifier.is_read_only()
    }

    /// Start a background thread that periodically commits the journal
    /// and flushes packer batches, bounding the latency of amortised
    /// writes when the caller never flushes explicitly.
    pub fn start_background_flusher(&mut self, interval: Duration) {
        if self.flusher.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let weak = Arc::downgrade(&self.vdo);
        let handle = std::thread::spawn(move || loop {
            crossbeam::channel::select! {
                recv(shutdown_rx) -> _ => break,
                recv(ticker) -> _ => {
                    let Some(vdo) = weak.upgrade() else { break };
                    let mut vdo = vdo.lock();
                    vdo.router
                        .enqueue(ThreadConfig::PACKER_THREAD, Task::FlushPacker);
                    vdo.request_commit();
                    vdo.run_until_idle();
                }
            }
        });
        self.flusher = Some(Flusher {
            shutdown: shutdown_tx,
            handle,
        });
    }

    fn stop_flusher(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.shutdown.send(());
            let _ = flusher.handle.join();
        }
    }

    /// Clean shutdown: drain everything and mark the super block clean.
    pub fn close(mut self) -> Result<()> {
        self.stop_flusher();
        let result = {
            let mut vdo = self.vdo.lock();
            vdo.close()
        };
        info!(name = %self.name, "device closed");
        result
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop_flusher();
        registry::deregister(&self.name);
    }
}

/// Reopen helper used by tests: a clean close leaves state `Clean`, and
/// reopening must see it.
pub fn state_of(store: &mut dyn BlockStore) -> Result<VdoState> {
    let mut block = [0u8; BLOCK_SIZE];
    store.read_block(crate::config::SUPER_BLOCK, &mut block)?;
    Ok(crate::super_block::SuperBlock::decode(&block)?.state)
}
