//! Breakpoint wrappers.
//!
//! The engine's breakpoint objects do not honor COM reference counting:
//! `AddRef`/`Release` are stubs and the object dies when the control object
//! removes it. A [`DebugBreakpoint`] therefore never owns the native object.
//! It holds the raw handle until [`crate::cache::IdentityCache::invalidate`]
//! swaps it for a sentinel, after which every accessor fails with
//! [`BreakpointError::Abandoned`] without touching the engine.
use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::error::{BreakpointError, NativeResult, Result};

/// Value of the wrapper's handle slot once the native object is gone.
const ABANDONED: usize = 0;

/// `DEBUG_ANY_ID`: let the engine pick the breakpoint id.
pub const ANY_ID: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BreakpointType {
    Code,
    Data,
    Time,
    Inline,
}

impl BreakpointType {
    pub fn as_raw(self) -> u32 {
        match self {
            Self::Code => 0,
            Self::Data => 1,
            Self::Time => 2,
            Self::Inline => 3,
        }
    }
}

impl TryFrom<u32> for BreakpointType {
    type Error = BreakpointError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Code),
            1 => Ok(Self::Data),
            2 => Ok(Self::Time),
            3 => Ok(Self::Inline),
            _ => Err(BreakpointError::Usage("unknown breakpoint type")),
        }
    }
}

bitflags! {
    /// `DEBUG_BREAKPOINT_*` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BreakpointFlags: u32 {
        const GO_ONLY = 0x0000_0001;
        const DEFERRED = 0x0000_0002;
        const ENABLED = 0x0000_0004;
        const ADDER_ONLY = 0x0000_0008;
        const ONE_SHOT = 0x0000_0010;
    }
}

bitflags! {
    /// `DEBUG_BREAK_*` access kinds for data breakpoints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct DataAccess: u32 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
        const EXECUTE = 0x0000_0004;
        const IO = 0x0000_0008;
    }
}

/// A breakpoint GUID, laid out like the Win32 `GUID` structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BreakpointGuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl BreakpointGuid {
    pub const fn from_u128(v: u128) -> Self {
        Self {
            data1: (v >> 96) as u32,
            data2: ((v >> 80) & 0xffff) as u16,
            data3: ((v >> 64) & 0xffff) as u16,
            data4: (v as u64).to_be_bytes(),
        }
    }

    pub const fn to_u128(self) -> u128 {
        ((self.data1 as u128) << 96)
            | ((self.data2 as u128) << 80)
            | ((self.data3 as u128) << 64)
            | u64::from_be_bytes(self.data4) as u128
    }
}

impl fmt::Display for BreakpointGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

#[cfg(windows)]
impl From<windows::core::GUID> for BreakpointGuid {
    fn from(g: windows::core::GUID) -> Self {
        Self {
            data1: g.data1,
            data2: g.data2,
            data3: g.data3,
            data4: g.data4,
        }
    }
}

#[cfg(windows)]
impl From<BreakpointGuid> for windows::core::GUID {
    fn from(g: BreakpointGuid) -> Self {
        windows::core::GUID::from_values(g.data1, g.data2, g.data3, g.data4)
    }
}

/// Snapshot of `DEBUG_BREAKPOINT_PARAMETERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BreakpointParameters {
    pub offset: u64,
    pub id: u32,
    pub break_type: BreakpointType,
    pub proc_type: u32,
    pub flags: BreakpointFlags,
    pub data_size: u32,
    pub data_access_type: DataAccess,
    pub pass_count: u32,
    pub current_pass_count: u32,
    pub match_thread: u32,
    pub command_size: u32,
    pub offset_expression_size: u32,
}

/// Opaque address-sized identifier of a native breakpoint object.
///
/// Valid only until the owning control object removes the breakpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeBreakpointHandle(NonZeroUsize);

impl NativeBreakpointHandle {
    pub fn new(raw: usize) -> Result<Self> {
        NonZeroUsize::new(raw)
            .map(Self)
            .ok_or(BreakpointError::Usage("null breakpoint handle"))
    }

    pub fn as_raw(self) -> usize {
        self.0.get()
    }

    pub fn as_ptr(self) -> *mut std::ffi::c_void {
        self.0.get() as *mut _
    }
}

impl fmt::Debug for NativeBreakpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeBreakpointHandle({:#x})", self.0)
    }
}

/// Native operations on a single breakpoint object, addressed by handle.
///
/// Implementations may assume the handle is live: wrappers check for
/// abandonment before every call.
pub trait BreakpointBackend: Send + Sync {
    fn id(&self, bp: NativeBreakpointHandle) -> NativeResult<u32>;
    /// Returns the breakpoint type and the processor type it applies to.
    fn breakpoint_type(&self, bp: NativeBreakpointHandle) -> NativeResult<(u32, u32)>;
    fn flags(&self, bp: NativeBreakpointHandle) -> NativeResult<u32>;
    fn add_flags(&self, bp: NativeBreakpointHandle, flags: u32) -> NativeResult<()>;
    fn remove_flags(&self, bp: NativeBreakpointHandle, flags: u32) -> NativeResult<()>;
    fn set_flags(&self, bp: NativeBreakpointHandle, flags: u32) -> NativeResult<()>;
    fn offset(&self, bp: NativeBreakpointHandle) -> NativeResult<u64>;
    fn set_offset(&self, bp: NativeBreakpointHandle, offset: u64) -> NativeResult<()>;
    fn offset_expression(&self, bp: NativeBreakpointHandle) -> NativeResult<String>;
    fn set_offset_expression(&self, bp: NativeBreakpointHandle, expr: &str) -> NativeResult<()>;
    /// Returns the watched size and the `DEBUG_BREAK_*` access type.
    fn data_parameters(&self, bp: NativeBreakpointHandle) -> NativeResult<(u32, u32)>;
    fn set_data_parameters(
        &self,
        bp: NativeBreakpointHandle,
        size: u32,
        access: u32,
    ) -> NativeResult<()>;
    fn pass_count(&self, bp: NativeBreakpointHandle) -> NativeResult<u32>;
    fn set_pass_count(&self, bp: NativeBreakpointHandle, count: u32) -> NativeResult<()>;
    fn current_pass_count(&self, bp: NativeBreakpointHandle) -> NativeResult<u32>;
    fn match_thread_id(&self, bp: NativeBreakpointHandle) -> NativeResult<u32>;
    fn set_match_thread_id(&self, bp: NativeBreakpointHandle, thread: u32) -> NativeResult<()>;
    fn command(&self, bp: NativeBreakpointHandle) -> NativeResult<String>;
    fn set_command(&self, bp: NativeBreakpointHandle, command: &str) -> NativeResult<()>;
    fn parameters(&self, bp: NativeBreakpointHandle) -> NativeResult<BreakpointParameters>;
    fn guid(&self, bp: NativeBreakpointHandle) -> NativeResult<BreakpointGuid>;
}

pub(crate) struct BreakpointCell {
    handle: AtomicUsize,
    backend: Arc<dyn BreakpointBackend>,
}

/// A breakpoint owned by the engine.
///
/// Clones share identity: two `DebugBreakpoint`s compare equal if and only
/// if they are the same wrapper, which the identity cache guarantees is the
/// case exactly when they refer to the same live native breakpoint.
#[derive(Clone)]
pub struct DebugBreakpoint(Arc<BreakpointCell>);

impl DebugBreakpoint {
    pub(crate) fn new(handle: NativeBreakpointHandle, backend: Arc<dyn BreakpointBackend>) -> Self {
        Self(Arc::new(BreakpointCell {
            handle: AtomicUsize::new(handle.as_raw()),
            backend,
        }))
    }

    pub(crate) fn from_cell(cell: Arc<BreakpointCell>) -> Self {
        Self(cell)
    }

    pub(crate) fn downgrade(&self) -> Weak<BreakpointCell> {
        Arc::downgrade(&self.0)
    }

    /// Swaps the handle for the sentinel, returning what was there.
    pub(crate) fn abandon(&self) -> Option<NativeBreakpointHandle> {
        NonZeroUsize::new(self.0.handle.swap(ABANDONED, Ordering::AcqRel))
            .map(NativeBreakpointHandle)
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.handle.load(Ordering::Acquire) == ABANDONED
    }

    pub fn handle(&self) -> Result<NativeBreakpointHandle> {
        NonZeroUsize::new(self.0.handle.load(Ordering::Acquire))
            .map(NativeBreakpointHandle)
            .ok_or(BreakpointError::Abandoned)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn call<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&dyn BreakpointBackend, NativeBreakpointHandle) -> NativeResult<T>,
    ) -> Result<T> {
        let Ok(handle) = self.handle() else {
            tracing::warn!(op, "breakpoint used after it was removed");
            return Err(BreakpointError::Abandoned);
        };

        f(self.0.backend.as_ref(), handle).map_err(BreakpointError::Native)
    }

    pub fn id(&self) -> Result<u32> {
        self.call("id", |b, h| b.id(h))
    }

    pub fn breakpoint_type(&self) -> Result<(BreakpointType, u32)> {
        let (ty, proc_type) = self.call("breakpoint_type", |b, h| b.breakpoint_type(h))?;
        Ok((BreakpointType::try_from(ty)?, proc_type))
    }

    pub fn flags(&self) -> Result<BreakpointFlags> {
        self.call("flags", |b, h| b.flags(h))
            .map(BreakpointFlags::from_bits_retain)
    }

    pub fn add_flags(&self, flags: BreakpointFlags) -> Result<()> {
        self.call("add_flags", |b, h| b.add_flags(h, flags.bits()))
    }

    pub fn remove_flags(&self, flags: BreakpointFlags) -> Result<()> {
        self.call("remove_flags", |b, h| b.remove_flags(h, flags.bits()))
    }

    pub fn set_flags(&self, flags: BreakpointFlags) -> Result<()> {
        self.call("set_flags", |b, h| b.set_flags(h, flags.bits()))
    }

    pub fn is_enabled(&self) -> Result<bool> {
        Ok(self.flags()?.contains(BreakpointFlags::ENABLED))
    }

    pub fn enable(&self) -> Result<()> {
        self.add_flags(BreakpointFlags::ENABLED)
    }

    pub fn disable(&self) -> Result<()> {
        self.remove_flags(BreakpointFlags::ENABLED)
    }

    pub fn offset(&self) -> Result<u64> {
        self.call("offset", |b, h| b.offset(h))
    }

    pub fn set_offset(&self, offset: u64) -> Result<()> {
        self.call("set_offset", |b, h| b.set_offset(h, offset))
    }

    pub fn offset_expression(&self) -> Result<String> {
        self.call("offset_expression", |b, h| b.offset_expression(h))
    }

    pub fn set_offset_expression(&self, expr: impl AsRef<str>) -> Result<()> {
        self.call("set_offset_expression", |b, h| {
            b.set_offset_expression(h, expr.as_ref())
        })
    }

    pub fn data_parameters(&self) -> Result<(u32, DataAccess)> {
        self.call("data_parameters", |b, h| b.data_parameters(h))
            .map(|(size, access)| (size, DataAccess::from_bits_retain(access)))
    }

    pub fn set_data_parameters(&self, size: u32, access: DataAccess) -> Result<()> {
        self.call("set_data_parameters", |b, h| {
            b.set_data_parameters(h, size, access.bits())
        })
    }

    pub fn pass_count(&self) -> Result<u32> {
        self.call("pass_count", |b, h| b.pass_count(h))
    }

    pub fn set_pass_count(&self, count: u32) -> Result<()> {
        self.call("set_pass_count", |b, h| b.set_pass_count(h, count))
    }

    pub fn current_pass_count(&self) -> Result<u32> {
        self.call("current_pass_count", |b, h| b.current_pass_count(h))
    }

    pub fn match_thread_id(&self) -> Result<u32> {
        self.call("match_thread_id", |b, h| b.match_thread_id(h))
    }

    pub fn set_match_thread_id(&self, thread: u32) -> Result<()> {
        self.call("set_match_thread_id", |b, h| b.set_match_thread_id(h, thread))
    }

    pub fn command(&self) -> Result<String> {
        self.call("command", |b, h| b.command(h))
    }

    pub fn set_command(&self, command: impl AsRef<str>) -> Result<()> {
        self.call("set_command", |b, h| b.set_command(h, command.as_ref()))
    }

    pub fn parameters(&self) -> Result<BreakpointParameters> {
        self.call("parameters", |b, h| b.parameters(h))
    }

    pub fn guid(&self) -> Result<BreakpointGuid> {
        self.call("guid", |b, h| b.guid(h))
    }
}

impl PartialEq for DebugBreakpoint {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for DebugBreakpoint {}

impl Hash for DebugBreakpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}

impl fmt::Debug for DebugBreakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle() {
            Ok(h) => f.debug_tuple("DebugBreakpoint").field(&h).finish(),
            Err(_) => f.write_str("DebugBreakpoint(<abandoned>)"),
        }
    }
}
