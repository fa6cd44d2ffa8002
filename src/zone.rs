//! Cooperative zone scheduling.
//!
//! Every mutable structure is owned by exactly one zone thread; cross-zone
//! interaction is an explicit [`Task`] enqueued on the destination thread's
//! queue. The router drains queues deterministically: the lowest-numbered
//! thread with pending work runs first, and each task runs to completion
//! with exclusive access to the device, which is what a real one-thread-
//! per-zone deployment guarantees for the state that thread owns.

use std::collections::VecDeque;

use crate::data_vio::{DataVioId, VioStep};
use crate::types::ThreadId;

/// The closed set of completion kinds. Exhaustive matching keeps the
/// dispatch and diagnostics paths total.
#[derive(Debug)]
pub enum Task {
    /// Advance a data-vio to the given pipeline step.
    VioStep { vio: DataVioId, step: VioStep },
    /// The lock counter reported a journal block may now be reapable.
    JournalReapNotify,
    /// Periodic kick: commit a partially filled journal tail block.
    JournalCommitTick,
    /// Run the current admin action on one zone (era advancement).
    ActionZone { index: usize },
    /// Conclude the current admin action.
    ActionConclude,
    /// Force the packer to flush its pending batch.
    FlushPacker,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::VioStep { .. } => "vio_step",
            Task::JournalReapNotify => "journal_reap_notify",
            Task::JournalCommitTick => "journal_commit_tick",
            Task::ActionZone { .. } => "action_zone",
            Task::ActionConclude => "action_conclude",
            Task::FlushPacker => "flush_packer",
        }
    }
}

pub struct ZoneRouter {
    queues: Vec<VecDeque<Task>>,
    pending: usize,
}

impl ZoneRouter {
    pub fn new(thread_count: usize) -> Self {
        Self {
            queues: (0..thread_count).map(|_| VecDeque::new()).collect(),
            pending: 0,
        }
    }

    pub fn enqueue(&mut self, thread: ThreadId, task: Task) {
        tracing::trace!(thread, task = task.name(), "enqueue");
        self.queues[thread].push_back(task);
        self.pending += 1;
    }

    pub fn is_idle(&self) -> bool {
        self.pending == 0
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Pop the next task: lowest-numbered thread with work first.
    pub fn next_task(&mut self) -> Option<(ThreadId, Task)> {
        for (thread, queue) in self.queues.iter_mut().enumerate() {
            if let Some(task) = queue.pop_front() {
                self.pending -= 1;
                return Some((thread, task));
            }
        }
        None
    }
}
