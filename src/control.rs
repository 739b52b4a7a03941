//! Breakpoint operations of the engine's control object.
//!
//! [`BreakpointControl`] is the raw surface: it hands out bare handles.
//! [`BreakpointManager`] is the only way those handles reach callers; it
//! routes each through the [`IdentityCache`] and invalidates wrappers before
//! asking the engine to destroy them.
use std::sync::Arc;

use crate::breakpoint::{BreakpointBackend, BreakpointGuid, BreakpointType, DebugBreakpoint, NativeBreakpointHandle, ANY_ID};
use crate::cache::IdentityCache;
use crate::error::{NativeResult, Result};

pub trait BreakpointControl {
    /// Creates a breakpoint and returns its raw handle.
    fn add_breakpoint(&self, ty: BreakpointType, desired_id: u32) -> NativeResult<usize>;
    fn breakpoint_by_index(&self, index: u32) -> NativeResult<usize>;
    fn breakpoint_by_id(&self, id: u32) -> NativeResult<usize>;
    fn breakpoint_by_guid(&self, guid: &BreakpointGuid) -> NativeResult<usize>;
    fn number_breakpoints(&self) -> NativeResult<u32>;
    /// Destroys the native breakpoint; `bp` is dangling afterwards.
    fn remove_breakpoint(&self, bp: NativeBreakpointHandle) -> NativeResult<()>;
    /// Backend used to drive the breakpoints this control object hands out.
    fn backend(&self) -> Arc<dyn BreakpointBackend>;
}

#[derive(Clone)]
pub struct BreakpointManager<C> {
    control: C,
    backend: Arc<dyn BreakpointBackend>,
}

impl<C: BreakpointControl> BreakpointManager<C> {
    pub fn new(control: C) -> Self {
        let backend = control.backend();
        Self { control, backend }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    fn wrap(&self, raw: usize) -> Result<DebugBreakpoint> {
        IdentityCache::global().get_or_create(raw, &self.backend)
    }

    /// Adds a breakpoint. `desired_id` of `None` lets the engine choose.
    pub fn add_breakpoint(
        &self,
        ty: BreakpointType,
        desired_id: Option<u32>,
    ) -> Result<DebugBreakpoint> {
        let raw = self
            .control
            .add_breakpoint(ty, desired_id.unwrap_or(ANY_ID))?;
        self.wrap(raw)
    }

    pub fn breakpoint_by_index(&self, index: u32) -> Result<DebugBreakpoint> {
        let raw = self.control.breakpoint_by_index(index)?;
        self.wrap(raw)
    }

    pub fn breakpoint_by_id(&self, id: u32) -> Result<DebugBreakpoint> {
        let raw = self.control.breakpoint_by_id(id)?;
        self.wrap(raw)
    }

    pub fn breakpoint_by_guid(&self, guid: &BreakpointGuid) -> Result<DebugBreakpoint> {
        let raw = self.control.breakpoint_by_guid(guid)?;
        self.wrap(raw)
    }

    /// Wraps a handle the engine delivered some other way, such as in an
    /// event callback.
    pub fn resolve(&self, raw: usize) -> Result<DebugBreakpoint> {
        self.wrap(raw)
    }

    pub fn number_breakpoints(&self) -> Result<u32> {
        Ok(self.control.number_breakpoints()?)
    }

    /// Every breakpoint known to the engine, in index order.
    pub fn breakpoints(&self) -> Result<Vec<DebugBreakpoint>> {
        (0..self.number_breakpoints()?)
            .map(|index| self.breakpoint_by_index(index))
            .collect()
    }

    /// Removes the breakpoint from the engine.
    ///
    /// The wrapper (and every clone of it) is abandoned before the engine
    /// sees the call, even if the engine then reports a failure.
    pub fn remove_breakpoint(&self, bp: DebugBreakpoint) -> Result<()> {
        let handle = IdentityCache::global().invalidate(&bp)?;
        self.control.remove_breakpoint(handle)?;
        Ok(())
    }
}
