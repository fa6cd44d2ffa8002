//! Administrative state tracking for each drainable component.
//!
//! Drains are two-phase: `start_draining` moves a component into the
//! in-flight code for the requested operation, the component reaches its
//! quiescent barrier, then `finish_draining` lands on the corresponding
//! quiescent code. Resume mirrors this. Drains are not cancellable; an
//! invalid transition is an error surfaced to the admin parent.

use crate::error::{Result, VdoError};

/// The operation a drain is performing. Suspend leaves dirty metadata in
/// memory; save flushes everything out first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOperation {
    Suspend,
    Save,
    Flush,
    Scrub,
    Rebuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminStateCode {
    New,
    NormalOperation,
    Suspending,
    Suspended,
    Saving,
    Saved,
    Flushing,
    Scrubbing,
    Recovering,
    Rebuilding,
    Resuming,
    ReadOnlyOperation,
}

impl AdminStateCode {
    pub fn is_quiescent(self) -> bool {
        matches!(
            self,
            AdminStateCode::Suspended | AdminStateCode::Saved | AdminStateCode::New
        )
    }

    pub fn is_quiescing(self) -> bool {
        matches!(
            self,
            AdminStateCode::Suspending | AdminStateCode::Saving | AdminStateCode::Flushing
        )
    }

    pub fn is_normal(self) -> bool {
        matches!(self, AdminStateCode::NormalOperation)
    }

    fn draining_code(operation: DrainOperation) -> AdminStateCode {
        match operation {
            DrainOperation::Suspend => AdminStateCode::Suspending,
            DrainOperation::Save => AdminStateCode::Saving,
            DrainOperation::Flush => AdminStateCode::Flushing,
            DrainOperation::Scrub => AdminStateCode::Scrubbing,
            DrainOperation::Rebuild => AdminStateCode::Rebuilding,
        }
    }

    fn quiescent_code(operation: DrainOperation) -> AdminStateCode {
        match operation {
            DrainOperation::Suspend => AdminStateCode::Suspended,
            DrainOperation::Save => AdminStateCode::Saved,
            // Flush, scrub, and rebuild return to normal operation.
            _ => AdminStateCode::NormalOperation,
        }
    }
}

#[derive(Debug)]
pub struct AdminState {
    current: AdminStateCode,
    draining: Option<DrainOperation>,
}

impl Default for AdminState {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminState {
    pub fn new() -> Self {
        Self {
            current: AdminStateCode::NormalOperation,
            draining: None,
        }
    }

    pub fn code(&self) -> AdminStateCode {
        self.current
    }

    pub fn is_quiescent(&self) -> bool {
        self.current.is_quiescent()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.is_some()
    }

    pub fn is_normal(&self) -> bool {
        self.current.is_normal()
    }

    pub fn drain_operation(&self) -> Option<DrainOperation> {
        self.draining
    }

    /// Begin a drain. Returns false (a no-op) if the component is already
    /// quiescent for an equal-or-stronger operation.
    pub fn start_draining(&mut self, operation: DrainOperation) -> Result<bool> {
        if self.current.is_quiescent() {
            return Ok(false);
        }
        if self.draining.is_some() {
            return Err(VdoError::InvalidAdminState(format!(
                "drain requested while {:?} in progress",
                self.current
            )));
        }
        if !self.current.is_normal() {
            return Err(VdoError::InvalidAdminState(format!(
                "cannot drain from {:?}",
                self.current
            )));
        }
        self.draining = Some(operation);
        self.current = AdminStateCode::draining_code(operation);
        Ok(true)
    }

    /// Complete the in-flight drain at the quiescent barrier.
    pub fn finish_draining(&mut self) -> Result<()> {
        let operation = self.draining.take().ok_or_else(|| {
            VdoError::InvalidAdminState("finish_draining without a drain".to_string())
        })?;
        self.current = AdminStateCode::quiescent_code(operation);
        Ok(())
    }

    pub fn start_resuming(&mut self) -> Result<()> {
        if !self.current.is_quiescent() {
            return Err(VdoError::InvalidAdminState(format!(
                "cannot resume from {:?}",
                self.current
            )));
        }
        self.current = AdminStateCode::Resuming;
        Ok(())
    }

    pub fn finish_resuming(&mut self) -> Result<()> {
        if self.current != AdminStateCode::Resuming {
            return Err(VdoError::InvalidAdminState(format!(
                "finish_resuming from {:?}",
                self.current
            )));
        }
        self.current = AdminStateCode::NormalOperation;
        Ok(())
    }

    pub fn enter_read_only(&mut self) {
        self.draining = None;
        self.current = AdminStateCode::ReadOnlyOperation;
    }

    pub fn set_recovering(&mut self) {
        self.current = AdminStateCode::Recovering;
    }

    pub fn finish_recovering(&mut self) {
        self.current = AdminStateCode::NormalOperation;
    }
}
