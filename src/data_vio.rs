//! Data-vios: the per-request objects threading through the write and
//! read pipelines, and the fixed pool they live in.

use bytes::Bytes;

use crate::error::VdoError;
use crate::types::{
    DataLocation, JournalPoint, LogicalBlockNumber, PhysicalBlockNumber, SequenceNumber, ZoneId,
};
use crate::wait_queue::WaitQueue;

pub type DataVioId = usize;

/// 256-bit content fingerprint of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkName(pub [u8; 32]);

/// The pipeline stage a data-vio runs next. Doubles as the async
/// operation tag reported in dumps, so a stuck vio names the stage it is
/// parked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioStep {
    /// Entry point: zero detection and hashing.
    Launch,
    /// Acquire (or wait on) the LBN lock in the logical zone.
    LogicalLock,
    /// Acquire the hash lock in the hash zone and consult dedup advice.
    HashLock,
    /// Obtain a physical block (or a packer slot) for the data.
    Allocate,
    /// Walk the block-map tree to the leaf page.
    TreeWalk,
    /// Add the recovery journal entry.
    JournalEntry,
    /// Journal entry durable: apply ref-count and block-map updates.
    ApplyUpdates,
    /// Release locks, update the dedup index, finish.
    Cleanup,
    /// Read path: traverse the block map and fetch data.
    ReadLookup,
}

impl VioStep {
    pub fn name(self) -> &'static str {
        match self {
            VioStep::Launch => "launch",
            VioStep::LogicalLock => "acquire_logical_lock",
            VioStep::HashLock => "acquire_hash_lock",
            VioStep::Allocate => "allocate",
            VioStep::TreeWalk => "tree_walk",
            VioStep::JournalEntry => "journal_entry",
            VioStep::ApplyUpdates => "apply_updates",
            VioStep::Cleanup => "cleanup",
            VioStep::ReadLookup => "read_lookup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioKind {
    Read,
    Write,
    /// A write of all zeros; stored as an unmapped entry.
    Trim,
}

/// Compression progress for one write.
#[derive(Debug, Clone, Default)]
pub struct CompressionState {
    /// Whether compression has been attempted for this write.
    pub tried: bool,
    /// Deflated payload, if it beat the threshold.
    pub compressed: Option<Bytes>,
    /// Assigned fragment slot once the packer placed it.
    pub slot: Option<u8>,
    /// PBN of the shared compressed block.
    pub batch_pbn: Option<PhysicalBlockNumber>,
}

/// Traversal state through the block-map forest.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeLock {
    pub root_index: u32,
    pub page_index: u64,
    pub height: u8,
    /// Leaf page PBN once the walk resolves.
    pub leaf_pbn: Option<PhysicalBlockNumber>,
}

pub struct DataVio {
    pub id: DataVioId,
    pub kind: VioKind,
    pub lbn: LogicalBlockNumber,
    pub logical_zone: ZoneId,
    pub hash_zone: ZoneId,
    pub data: Bytes,
    pub chunk_name: Option<ChunkName>,
    pub is_zero_block: bool,
    pub old_mapping: Option<DataLocation>,
    pub new_mapping: Option<DataLocation>,
    /// Provisional allocation to confirm or vacate.
    pub allocation: Option<PhysicalBlockNumber>,
    pub compression: CompressionState,
    /// Whether this vio went through dedupe against an existing block.
    pub is_duplicate: bool,
    pub recovery_sequence: SequenceNumber,
    pub recovery_point: JournalPoint,
    /// Guards the ref-count half of the post-commit updates so a parked
    /// and re-run update step never applies them twice.
    pub refs_applied: bool,
    pub tree_lock: TreeLock,
    pub step: VioStep,
    pub holds_logical_lock: bool,
    pub holds_hash_lock: bool,
    pub result: Option<VdoError>,
    /// Read result, filled by the read path.
    pub read_data: Option<Bytes>,
    pub done: bool,
}

impl DataVio {
    fn new(id: DataVioId) -> Self {
        Self {
            id,
            kind: VioKind::Read,
            lbn: 0,
            logical_zone: 0,
            hash_zone: 0,
            data: Bytes::new(),
            chunk_name: None,
            is_zero_block: false,
            old_mapping: None,
            new_mapping: None,
            allocation: None,
            compression: CompressionState::default(),
            is_duplicate: false,
            recovery_sequence: 0,
            recovery_point: JournalPoint::default(),
            refs_applied: false,
            tree_lock: TreeLock::default(),
            step: VioStep::Launch,
            holds_logical_lock: false,
            holds_hash_lock: false,
            result: None,
            read_data: None,
            done: false,
        }
    }

    fn reset(&mut self, kind: VioKind, lbn: LogicalBlockNumber, data: Bytes) {
        let id = self.id;
        *self = Self::new(id);
        self.kind = kind;
        self.lbn = lbn;
        self.data = data;
    }

    pub fn fail(&mut self, error: VdoError) {
        if self.result.is_none() {
            self.result = Some(error);
        }
        self.done = true;
    }

    /// The mapping this write will install.
    pub fn target_mapping(&self) -> DataLocation {
        self.new_mapping.unwrap_or(DataLocation::UNMAPPED)
    }
}

/// Fixed pool of data-vios. Requests beyond the pool size park on a FIFO
/// queue and are admitted as vios are returned.
pub struct DataVioPool {
    vios: Vec<DataVio>,
    free: Vec<DataVioId>,
    waiters: WaitQueue<()>,
    pub in_flight: usize,
}

impl DataVioPool {
    pub fn new(size: usize) -> Self {
        Self {
            vios: (0..size).map(DataVio::new).collect(),
            free: (0..size).rev().collect(),
            waiters: WaitQueue::new(),
            in_flight: 0,
        }
    }

    pub fn acquire(
        &mut self,
        kind: VioKind,
        lbn: LogicalBlockNumber,
        data: Bytes,
    ) -> Option<DataVioId> {
        match self.free.pop() {
            Some(id) => {
                self.vios[id].reset(kind, lbn, data);
                self.in_flight += 1;
                Some(id)
            }
            None => {
                self.waiters.enqueue(());
                None
            }
        }
    }

    pub fn release(&mut self, id: DataVioId) {
        debug_assert!(self.vios[id].done, "release of unfinished vio");
        self.free.push(id);
        self.in_flight -= 1;
        self.waiters.notify_next();
    }

    pub fn get(&self, id: DataVioId) -> &DataVio {
        &self.vios[id]
    }

    pub fn get_mut(&mut self, id: DataVioId) -> &mut DataVio {
        &mut self.vios[id]
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight == 0
    }

    /// Diagnostic snapshot: (id, lbn, stage) of every in-flight vio.
    pub fn dump_active(&self) -> Vec<(DataVioId, LogicalBlockNumber, &'static str)> {
        self.vios
            .iter()
            .filter(|vio| !self.free.contains(&vio.id) && !vio.done)
            .map(|vio| (vio.id, vio.lbn, vio.step.name()))
            .collect()
    }
}
