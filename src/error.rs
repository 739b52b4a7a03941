//! Error vocabulary for breakpoint wrappers.
use std::fmt;

/// A raw status code handed back by the engine, carried unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NativeStatus(pub i32);

impl NativeStatus {
    pub const S_OK: Self = Self(0);
    pub const S_FALSE: Self = Self(1);
    pub const E_FAIL: Self = Self(0x8000_4005_u32 as i32);
    pub const E_INVALIDARG: Self = Self(0x8007_0057_u32 as i32);
    pub const E_NOINTERFACE: Self = Self(0x8000_4002_u32 as i32);
    pub const E_UNEXPECTED: Self = Self(0x8000_ffff_u32 as i32);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0 as u32)
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for NativeStatus {
    fn from(e: windows::core::Error) -> Self {
        Self(e.code().0)
    }
}

#[cfg(windows)]
impl From<windows::core::HRESULT> for NativeStatus {
    fn from(hr: windows::core::HRESULT) -> Self {
        Self(hr.0)
    }
}

/// Errors surfaced by [`crate::breakpoint::DebugBreakpoint`] and the
/// [`crate::cache::IdentityCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BreakpointError {
    /// The caller passed something the engine never hands out, such as a
    /// null handle.
    #[error("invalid usage: {0}")]
    Usage(&'static str),
    /// The native breakpoint behind this wrapper was removed.
    #[error("breakpoint wrapper already destroyed")]
    Abandoned,
    #[error("engine call failed with {0}")]
    Native(NativeStatus),
}

impl From<NativeStatus> for BreakpointError {
    fn from(status: NativeStatus) -> Self {
        Self::Native(status)
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for BreakpointError {
    fn from(e: windows::core::Error) -> Self {
        Self::Native(e.into())
    }
}

pub type Result<T> = std::result::Result<T, BreakpointError>;

/// Result of a call that crossed into the engine.
pub type NativeResult<T> = std::result::Result<T, NativeStatus>;
