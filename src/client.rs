//! A debugger client on top of the engine's COM interfaces.
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use windows::core::{Interface, HRESULT, PCSTR, PCWSTR};
use windows::Win32::Foundation::{E_FAIL, E_POINTER, S_OK};
use windows::Win32::System::Diagnostics::Debug::Extensions::{
    DebugCreate, IDebugBreakpoint, IDebugBreakpoint2, IDebugBreakpoint3, IDebugClient,
    IDebugClient5, IDebugControl7, IDebugDataSpaces4, IDebugEventCallbacks, IDebugRegisters2,
    IDebugSymbols3, IDebugSystemObjects4, DEBUG_EXECUTE_DEFAULT, DEBUG_OUTCTL_ALL_CLIENTS,
    DEBUG_OUTPUT_NORMAL, DEBUG_STACK_FRAME, DEBUG_VALUE, DEBUG_VALUE_0, DEBUG_VALUE_0_0,
    DEBUG_VALUE_INT64,
};
use windows::Win32::System::SystemInformation::IMAGE_FILE_MACHINE;
use zerocopy::{AsBytes, FromBytes};

use crate::breakpoint::{
    BreakpointBackend, BreakpointFlags, BreakpointGuid, BreakpointParameters, BreakpointType,
    DataAccess, DebugBreakpoint, NativeBreakpointHandle,
};
use crate::control::{BreakpointControl, BreakpointManager};
use crate::error::{NativeResult, NativeStatus};
use crate::events::{EventCallbacks, EventCallbacksBridge};

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(iter::once(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

/// Reads a string through the engine's size-query-then-fill convention.
fn read_wide(
    mut get: impl FnMut(Option<&mut [u16]>, Option<*mut u32>) -> windows::core::Result<()>,
) -> windows::core::Result<String> {
    let mut size = 0u32;
    get(None, Some(&mut size))?;
    if size == 0 {
        return Ok(String::new());
    }

    let mut buf = vec![0u16; size as usize];
    get(Some(buf.as_mut_slice()), None)?;
    Ok(from_wide(&buf))
}

/// Drives breakpoints through their raw `IDebugBreakpoint2` pointers.
///
/// Handles are the pointers themselves; the engine keeps the object alive
/// until `RemoveBreakpoint2`, and `AddRef`/`Release` on it do nothing.
struct RawBreakpoints;

fn with_bp<T>(
    bp: NativeBreakpointHandle,
    f: impl FnOnce(&IDebugBreakpoint2) -> windows::core::Result<T>,
) -> NativeResult<T> {
    let raw = bp.as_ptr();
    // SAFETY: callers only hand over handles of non-abandoned wrappers, and
    // a wrapper is abandoned before its breakpoint is removed.
    let bp = unsafe { IDebugBreakpoint2::from_raw_borrowed(&raw) }
        .ok_or(NativeStatus::from(E_POINTER))?;
    f(bp).map_err(NativeStatus::from)
}

impl BreakpointBackend for RawBreakpoints {
    fn id(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
        with_bp(bp, |bp| unsafe { bp.GetId() })
    }

    fn breakpoint_type(&self, bp: NativeBreakpointHandle) -> NativeResult<(u32, u32)> {
        with_bp(bp, |bp| {
            let (mut ty, mut proc_type) = (0, 0);
            unsafe { bp.GetType(&mut ty, &mut proc_type) }?;
            Ok((ty, proc_type))
        })
    }

    fn flags(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
        with_bp(bp, |bp| unsafe { bp.GetFlags() })
    }

    fn add_flags(&self, bp: NativeBreakpointHandle, flags: u32) -> NativeResult<()> {
        with_bp(bp, |bp| unsafe { bp.AddFlags(flags) })
    }

    fn remove_flags(&self, bp: NativeBreakpointHandle, flags: u32) -> NativeResult<()> {
        with_bp(bp, |bp| unsafe { bp.RemoveFlags(flags) })
    }

    fn set_flags(&self, bp: NativeBreakpointHandle, flags: u32) -> NativeResult<()> {
        with_bp(bp, |bp| unsafe { bp.SetFlags(flags) })
    }

    fn offset(&self, bp: NativeBreakpointHandle) -> NativeResult<u64> {
        with_bp(bp, |bp| unsafe { bp.GetOffset() })
    }

    fn set_offset(&self, bp: NativeBreakpointHandle, offset: u64) -> NativeResult<()> {
        with_bp(bp, |bp| unsafe { bp.SetOffset(offset) })
    }

    fn offset_expression(&self, bp: NativeBreakpointHandle) -> NativeResult<String> {
        with_bp(bp, |bp| {
            read_wide(|buf, size| unsafe { bp.GetOffsetExpressionWide(buf, size) })
        })
    }

    fn set_offset_expression(&self, bp: NativeBreakpointHandle, expr: &str) -> NativeResult<()> {
        let expr = to_wide(expr);
        with_bp(bp, |bp| unsafe { bp.SetOffsetExpressionWide(PCWSTR(expr.as_ptr())) })
    }

    fn data_parameters(&self, bp: NativeBreakpointHandle) -> NativeResult<(u32, u32)> {
        with_bp(bp, |bp| {
            let (mut size, mut access) = (0, 0);
            unsafe { bp.GetDataParameters(&mut size, &mut access) }?;
            Ok((size, access))
        })
    }

    fn set_data_parameters(
        &self,
        bp: NativeBreakpointHandle,
        size: u32,
        access: u32,
    ) -> NativeResult<()> {
        with_bp(bp, |bp| unsafe { bp.SetDataParameters(size, access) })
    }

    fn pass_count(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
        with_bp(bp, |bp| unsafe { bp.GetPassCount() })
    }

    fn set_pass_count(&self, bp: NativeBreakpointHandle, count: u32) -> NativeResult<()> {
        with_bp(bp, |bp| unsafe { bp.SetPassCount(count) })
    }

    fn current_pass_count(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
        with_bp(bp, |bp| unsafe { bp.GetCurrentPassCount() })
    }

    fn match_thread_id(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
        with_bp(bp, |bp| unsafe { bp.GetMatchThreadId() })
    }

    fn set_match_thread_id(&self, bp: NativeBreakpointHandle, thread: u32) -> NativeResult<()> {
        with_bp(bp, |bp| unsafe { bp.SetMatchThreadId(thread) })
    }

    fn command(&self, bp: NativeBreakpointHandle) -> NativeResult<String> {
        with_bp(bp, |bp| read_wide(|buf, size| unsafe { bp.GetCommandWide(buf, size) }))
    }

    fn set_command(&self, bp: NativeBreakpointHandle, command: &str) -> NativeResult<()> {
        let command = to_wide(command);
        with_bp(bp, |bp| unsafe { bp.SetCommandWide(PCWSTR(command.as_ptr())) })
    }

    fn parameters(&self, bp: NativeBreakpointHandle) -> NativeResult<BreakpointParameters> {
        let p = with_bp(bp, |bp| unsafe { bp.GetParameters() })?;
        Ok(BreakpointParameters {
            offset: p.Offset,
            id: p.Id,
            break_type: BreakpointType::try_from(p.BreakType)
                .map_err(|_| NativeStatus::E_UNEXPECTED)?,
            proc_type: p.ProcType,
            flags: BreakpointFlags::from_bits_retain(p.Flags),
            data_size: p.DataSize,
            data_access_type: DataAccess::from_bits_retain(p.DataAccessType),
            pass_count: p.PassCount,
            current_pass_count: p.CurrentPassCount,
            match_thread: p.MatchThread,
            command_size: p.CommandSize,
            offset_expression_size: p.OffsetExpressionSize,
        })
    }

    fn guid(&self, bp: NativeBreakpointHandle) -> NativeResult<BreakpointGuid> {
        with_bp(bp, |bp| {
            let bp: IDebugBreakpoint3 = bp.cast()?;
            unsafe { bp.GetGuid() }
        })
        .map(BreakpointGuid::from)
    }
}

/// The control object's breakpoint table.
#[derive(Clone)]
pub struct EngineControl {
    control: IDebugControl7,
}

impl BreakpointControl for EngineControl {
    fn add_breakpoint(&self, ty: BreakpointType, desired_id: u32) -> NativeResult<usize> {
        let bp = unsafe { self.control.AddBreakpoint2(ty.as_raw(), desired_id) }?;
        Ok(bp.into_raw() as usize)
    }

    fn breakpoint_by_index(&self, index: u32) -> NativeResult<usize> {
        let bp = unsafe { self.control.GetBreakpointByIndex2(index) }?;
        Ok(bp.into_raw() as usize)
    }

    fn breakpoint_by_id(&self, id: u32) -> NativeResult<usize> {
        let bp = unsafe { self.control.GetBreakpointById2(id) }?;
        Ok(bp.into_raw() as usize)
    }

    fn breakpoint_by_guid(&self, guid: &BreakpointGuid) -> NativeResult<usize> {
        let guid = windows::core::GUID::from(*guid);
        let bp = unsafe { self.control.GetBreakpointByGuid(&guid) }?;
        let bp: IDebugBreakpoint2 = bp.cast()?;
        Ok(bp.into_raw() as usize)
    }

    fn number_breakpoints(&self) -> NativeResult<u32> {
        Ok(unsafe { self.control.GetNumberBreakpoints() }?)
    }

    fn remove_breakpoint(&self, bp: NativeBreakpointHandle) -> NativeResult<()> {
        with_bp(bp, |bp| unsafe { self.control.RemoveBreakpoint2(bp) })
    }

    fn backend(&self) -> Arc<dyn BreakpointBackend> {
        Arc::new(RawBreakpoints)
    }
}

#[derive(Clone)]
pub struct DebugClient {
    client: IDebugClient5,
    control: IDebugControl7,
    registers: IDebugRegisters2,
    dataspaces: IDebugDataSpaces4,
    symbols: IDebugSymbols3,
    system: IDebugSystemObjects4,
    breakpoints: BreakpointManager<EngineControl>,
}

impl DebugClient {
    pub fn new(client: &IDebugClient) -> Result<Self> {
        let control: IDebugControl7 = client.cast().context("IDebugControl7")?;
        Ok(Self {
            client: client.cast().context("IDebugClient5")?,
            registers: client.cast().context("IDebugRegisters2")?,
            dataspaces: client.cast().context("IDebugDataSpaces4")?,
            symbols: client.cast().context("IDebugSymbols3")?,
            system: client.cast().context("IDebugSystemObjects4")?,
            breakpoints: BreakpointManager::new(EngineControl {
                control: control.clone(),
            }),
            control,
        })
    }

    /// Creates a fresh engine client, as a standalone host would.
    pub fn create() -> Result<Self> {
        let client: IDebugClient = unsafe { DebugCreate() }.context("DebugCreate")?;
        Self::new(&client)
    }

    /// Prints to the debugger's output window. `%` is escaped since the
    /// engine treats the text as a format string.
    pub fn logln(&self, text: impl AsRef<str>) -> Result<()> {
        let text = to_wide(&format!("{}\n", text.as_ref().replace('%', "%%")));
        unsafe { self.control.OutputWide(DEBUG_OUTPUT_NORMAL, PCWSTR(text.as_ptr())) }
            .context("OutputWide")?;
        Ok(())
    }

    pub fn exec(&self, command: impl AsRef<str>) -> Result<()> {
        let command = to_wide(command.as_ref());
        unsafe {
            self.control.ExecuteWide(
                DEBUG_OUTCTL_ALL_CLIENTS,
                PCWSTR(command.as_ptr()),
                DEBUG_EXECUTE_DEFAULT,
            )
        }
        .with_context(|| format!("ExecuteWide failed for {}", from_wide(&command)))
    }

    /// Returns the debuggee class and qualifier.
    pub fn debuggee_type(&self) -> Result<(u32, u32)> {
        let (mut class, mut qualifier) = (0, 0);
        unsafe { self.control.GetDebuggeeType(&mut class, &mut qualifier) }
            .context("GetDebuggeeType")?;
        Ok((class, qualifier))
    }

    pub fn processor_type(&self) -> Result<IMAGE_FILE_MACHINE> {
        let machine = unsafe { self.control.GetActualProcessorType() }
            .context("GetActualProcessorType")?;
        Ok(IMAGE_FILE_MACHINE(machine as u16))
    }

    pub fn get_current_process_id(&self) -> Result<u32> {
        unsafe { self.system.GetCurrentProcessSystemId() }.context("GetCurrentProcessSystemId")
    }

    fn reg_index(&self, name: &str) -> Result<u32> {
        let wide = to_wide(name);
        unsafe { self.registers.GetIndexByNameWide(PCWSTR(wide.as_ptr())) }
            .with_context(|| format!("unknown register {name}"))
    }

    pub fn reg64(&self, name: &str) -> Result<u64> {
        let value = unsafe { self.registers.GetValue(self.reg_index(name)?) }
            .with_context(|| format!("GetValue failed for {name}"))?;
        if value.Type != DEBUG_VALUE_INT64 {
            bail!("register {name} is not 64-bit (type {})", value.Type);
        }

        // SAFETY: the type tag says the union holds an I64.
        Ok(unsafe { value.Anonymous.Anonymous.I64 })
    }

    pub fn regs64(&self, names: &[&str]) -> Result<Vec<u64>> {
        names.iter().map(|name| self.reg64(name)).collect()
    }

    pub fn regs64_dict<'a>(&self, names: &[&'a str]) -> Result<BTreeMap<&'a str, u64>> {
        names
            .iter()
            .map(|&name| Ok((name, self.reg64(name)?)))
            .collect()
    }

    pub fn set_reg64(&self, name: &str, v: u64) -> Result<()> {
        let value = DEBUG_VALUE {
            Anonymous: DEBUG_VALUE_0 {
                Anonymous: DEBUG_VALUE_0_0 {
                    I64: v,
                    ..Default::default()
                },
            },
            TailOfRawBytes: 0,
            Type: DEBUG_VALUE_INT64,
        };
        unsafe { self.registers.SetValue(self.reg_index(name)?, &value) }
            .with_context(|| format!("SetValue failed for {name}"))
    }

    /// Reads as much of `buffer` as is mapped; returns the count read.
    pub fn read_virtual(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        let mut read = 0u32;
        unsafe {
            self.dataspaces.ReadVirtual(
                address,
                buffer.as_mut_ptr().cast::<c_void>(),
                buffer.len().try_into()?,
                Some(&mut read),
            )
        }
        .with_context(|| format!("ReadVirtual failed at {address:#x}"))?;
        Ok(read as usize)
    }

    pub fn read_virtual_exact(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let read = self.read_virtual(address, buffer)?;
        if read != buffer.len() {
            bail!("short read at {address:#x}: {read} of {} bytes", buffer.len());
        }

        Ok(())
    }

    pub fn read_virtual_struct<T: FromBytes + AsBytes>(&self, address: u64) -> Result<T> {
        let mut t = T::new_zeroed();
        self.read_virtual_exact(address, t.as_bytes_mut())?;
        Ok(t)
    }

    /// Address of `symbol`, e.g. `kernelbase!VirtualAlloc`.
    pub fn symbol_offset(&self, symbol: &str) -> Result<u64> {
        let wide = to_wide(symbol);
        unsafe { self.symbols.GetOffsetByNameWide(PCWSTR(wide.as_ptr())) }
            .with_context(|| format!("cannot resolve {symbol}"))
    }

    pub fn context_stack_frames(&self, count: usize) -> Result<Vec<DEBUG_STACK_FRAME>> {
        let mut frames = vec![DEBUG_STACK_FRAME::default(); count];
        let mut filled = 0u32;
        unsafe {
            self.control
                .GetStackTrace(0, 0, 0, &mut frames, Some(&mut filled))
        }
        .context("GetStackTrace")?;
        frames.truncate(filled as usize);
        Ok(frames)
    }

    pub fn set_event_callbacks(&self, callbacks: impl EventCallbacks + 'static) -> Result<()> {
        let bridge: IDebugEventCallbacks =
            EventCallbacksBridge::new(self.clone(), Box::new(callbacks)).into();
        unsafe { self.client.SetEventCallbacks(&bridge) }.context("SetEventCallbacks")
    }

    pub fn add_breakpoint(
        &self,
        ty: BreakpointType,
        desired_id: Option<u32>,
    ) -> Result<DebugBreakpoint> {
        Ok(self.breakpoints.add_breakpoint(ty, desired_id)?)
    }

    pub fn breakpoint_by_index(&self, index: u32) -> Result<DebugBreakpoint> {
        Ok(self.breakpoints.breakpoint_by_index(index)?)
    }

    pub fn breakpoint_by_id(&self, id: u32) -> Result<DebugBreakpoint> {
        Ok(self.breakpoints.breakpoint_by_id(id)?)
    }

    pub fn breakpoint_by_guid(&self, guid: &BreakpointGuid) -> Result<DebugBreakpoint> {
        Ok(self.breakpoints.breakpoint_by_guid(guid)?)
    }

    pub fn breakpoints(&self) -> Result<Vec<DebugBreakpoint>> {
        Ok(self.breakpoints.breakpoints()?)
    }

    pub fn remove_breakpoint(&self, bp: DebugBreakpoint) -> Result<()> {
        Ok(self.breakpoints.remove_breakpoint(bp)?)
    }

    /// Maps a breakpoint delivered by an event onto its cached wrapper.
    pub(crate) fn resolve_breakpoint(&self, bp: &IDebugBreakpoint) -> Result<DebugBreakpoint> {
        let bp: IDebugBreakpoint2 = bp.cast().context("IDebugBreakpoint2")?;
        Ok(self.breakpoints.resolve(bp.into_raw() as usize)?)
    }
}

/// Body of every [`crate::export_cmd!`] export.
#[doc(hidden)]
pub fn run_command<F>(raw_client: *mut c_void, args: PCSTR, cmd: F) -> HRESULT
where
    F: FnOnce(&DebugClient, String) -> Result<()>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        // SAFETY: the host passes a live IDebugClient for the command's duration.
        let client = unsafe { IDebugClient::from_raw_borrowed(&raw_client) }
            .context("null IDebugClient")?;
        let client = DebugClient::new(client)?;
        let args = if args.is_null() {
            String::new()
        } else {
            unsafe { args.to_string() }?
        };

        if let Err(e) = cmd(&client, args) {
            let _ = crate::dlogln!(client, "Error: {e:#}");
            return Err(e);
        }
        Ok(())
    }));

    match outcome {
        Ok(Ok(())) => S_OK,
        _ => E_FAIL,
    }
}
