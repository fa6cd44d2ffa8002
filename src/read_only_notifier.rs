//! Read-only mode broadcast.
//!
//! Entering read-only mode is a broadcast: every registered listener is
//! told on its own zone thread, quiesces (failing its queued waiters with
//! a read-only error), and acknowledges. From the moment the entry begins
//! the device "is or will be" read-only and refuses new operations; the
//! super block records the state once the broadcast completes.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::{ThreadId, ZoneId};

/// The subsystems that react to a read-only transition, dispatched
/// exhaustively by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOnlyListener {
    Journal,
    Allocator(ZoneId),
    LogicalZone(ZoneId),
    Packer,
}

pub struct ReadOnlyNotifier {
    read_only: AtomicBool,
    entering: bool,
    reason: Option<String>,
    listeners: Vec<(ThreadId, ReadOnlyListener)>,
}

impl ReadOnlyNotifier {
    pub fn new() -> Self {
        Self {
            read_only: AtomicBool::new(false),
            entering: false,
            reason: None,
            listeners: Vec::new(),
        }
    }

    pub fn register(&mut self, thread: ThreadId, listener: ReadOnlyListener) {
        self.listeners.push((thread, listener));
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// True during the broadcast as well as after it: new work must be
    /// refused as soon as the transition starts.
    pub fn is_or_will_be_read_only(&self) -> bool {
        self.entering || self.is_read_only()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Begin the transition. Returns the listeners to notify, in
    /// registration order, or None if a transition already happened.
    pub fn begin_entering(&mut self, reason: String) -> Option<Vec<(ThreadId, ReadOnlyListener)>> {
        if self.is_or_will_be_read_only() {
            return None;
        }
        tracing::error!(%reason, "entering read-only mode");
        self.entering = true;
        self.reason = Some(reason);
        Some(self.listeners.clone())
    }

    /// All listeners have acknowledged; the device is now read-only.
    pub fn finish_entering(&mut self) {
        self.entering = false;
        self.read_only.store(true, Ordering::Release);
    }

    /// Restore writability after a successful rebuild.
    pub fn exit_read_only(&mut self) {
        self.entering = false;
        self.reason = None;
        self.read_only.store(false, Ordering::Release);
    }
}

impl Default for ReadOnlyNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_runs_once() {
        let mut notifier = ReadOnlyNotifier::new();
        notifier.register(1, ReadOnlyListener::Journal);
        notifier.register(3, ReadOnlyListener::Allocator(0));

        let listeners = notifier.begin_entering("boom".to_string()).unwrap();
        assert_eq!(listeners.len(), 2);
        assert!(notifier.is_or_will_be_read_only());
        assert!(!notifier.is_read_only());

        // A second trigger during the broadcast is absorbed.
        assert!(notifier.begin_entering("again".to_string()).is_none());

        notifier.finish_entering();
        assert!(notifier.is_read_only());
        assert_eq!(notifier.reason(), Some("boom"));
    }

    #[test]
    fn rebuild_exits_read_only() {
        let mut notifier = ReadOnlyNotifier::new();
        notifier.begin_entering("corrupt".to_string()).unwrap();
        notifier.finish_entering();
        notifier.exit_read_only();
        assert!(!notifier.is_or_will_be_read_only());
    }
}
