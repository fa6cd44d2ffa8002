//! The action manager: applies one administrative action at a time across
//! a set of zones, with an optional preamble and a conclusion.
//!
//! An action is a vtable of plain function pointers bound at schedule
//! time; per-action data rides in the `era` operand. Requests arriving
//! while an action is in flight are coalesced: only the newest pending
//! era survives, which is exactly right for era advancement, the hot
//! caller.

use crate::error::Result;
use crate::types::SequenceNumber;
use crate::vdo::Vdo;

#[derive(Clone, Copy)]
pub struct ActionSpec {
    /// Runs once on the initiating thread before any zone action.
    pub preamble: Option<fn(&mut Vdo, SequenceNumber) -> Result<()>>,
    /// Runs once per zone, on that zone's thread.
    pub zone_action: fn(&mut Vdo, usize, SequenceNumber) -> Result<()>,
    /// Runs once after every zone has acted.
    pub conclusion: fn(&mut Vdo, SequenceNumber) -> Result<()>,
}

pub struct CurrentAction {
    pub spec: ActionSpec,
    pub operand: SequenceNumber,
    pub zone_count: usize,
}

pub struct ActionManager {
    current: Option<CurrentAction>,
    /// Coalesced operand for the next action of the same spec.
    pending: Option<(ActionSpec, SequenceNumber)>,
}

impl ActionManager {
    pub fn new() -> Self {
        Self {
            current: None,
            pending: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Try to start an action. Returns true if it became current (the
    /// caller schedules the first zone task); false if it was queued
    /// behind the in-flight action, replacing any previously queued one.
    pub fn schedule(
        &mut self,
        spec: ActionSpec,
        operand: SequenceNumber,
        zone_count: usize,
    ) -> bool {
        if self.current.is_some() {
            let newest = match self.pending.take() {
                Some((_, pending_operand)) => pending_operand.max(operand),
                None => operand,
            };
            self.pending = Some((spec, newest));
            return false;
        }
        self.current = Some(CurrentAction {
            spec,
            operand,
            zone_count,
        });
        true
    }

    pub fn current(&self) -> Option<(ActionSpec, SequenceNumber, usize)> {
        self.current
            .as_ref()
            .map(|action| (action.spec, action.operand, action.zone_count))
    }

    /// Finish the current action. Returns the next queued action, already
    /// made current, if one was waiting.
    pub fn conclude(&mut self, zone_count: usize) -> Option<(ActionSpec, SequenceNumber)> {
        self.current = None;
        let (spec, operand) = self.pending.take()?;
        self.current = Some(CurrentAction {
            spec,
            operand,
            zone_count,
        });
        Some((spec, operand))
    }
}

impl Default for ActionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_zone(_: &mut Vdo, _: usize, _: SequenceNumber) -> Result<()> {
        Ok(())
    }

    fn noop_conclusion(_: &mut Vdo, _: SequenceNumber) -> Result<()> {
        Ok(())
    }

    fn spec() -> ActionSpec {
        ActionSpec {
            preamble: None,
            zone_action: noop_zone,
            conclusion: noop_conclusion,
        }
    }

    #[test]
    fn one_action_at_a_time_with_coalescing() {
        let mut manager = ActionManager::new();
        assert!(manager.schedule(spec(), 5, 2));
        assert!(manager.is_busy());

        // Later requests coalesce to the newest operand.
        assert!(!manager.schedule(spec(), 6, 2));
        assert!(!manager.schedule(spec(), 7, 2));

        let next = manager.conclude(2);
        assert_eq!(next.map(|(_, operand)| operand), Some(7));
        assert!(manager.is_busy());
        assert!(manager.conclude(2).is_none());
        assert!(!manager.is_busy());
    }
}
