//! Engine event callbacks.

/// What the engine should do once an event callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugInstruction {
    #[default]
    NoChange,
    Go,
    GoHandled,
    GoNotHandled,
    StepOver,
    StepInto,
    Break,
    StepBranch,
    IgnoreEvent,
}

impl DebugInstruction {
    /// The matching `DEBUG_STATUS_*` value.
    pub fn as_status(self) -> u32 {
        match self {
            Self::NoChange => 0,
            Self::Go => 1,
            Self::GoHandled => 2,
            Self::GoNotHandled => 3,
            Self::StepOver => 4,
            Self::StepInto => 5,
            Self::Break => 6,
            Self::StepBranch => 8,
            Self::IgnoreEvent => 9,
        }
    }
}

#[cfg(windows)]
pub use self::bridge::EventCallbacks;
#[cfg(windows)]
pub(crate) use self::bridge::EventCallbacksBridge;

#[cfg(windows)]
mod bridge {
    #![allow(non_snake_case)]

    use windows::core::{implement, Error, Result, HRESULT, PCSTR};
    use windows::Win32::System::Diagnostics::Debug::Extensions::{
        IDebugBreakpoint, IDebugEventCallbacks, IDebugEventCallbacks_Impl,
        DEBUG_EVENT_BREAKPOINT, DEBUG_EVENT_CHANGE_ENGINE_STATE, DEBUG_EVENT_EXCEPTION,
    };
    use windows::Win32::System::Diagnostics::Debug::EXCEPTION_RECORD64;

    use super::DebugInstruction;
    use crate::breakpoint::DebugBreakpoint;
    use crate::client::DebugClient;
    use crate::exception::{ExceptionInfo, ExceptionRecord};

    /// Handlers for the events an extension usually cares about.
    ///
    /// The breakpoint handed to [`EventCallbacks::breakpoint`] comes from
    /// the identity cache, so it is the very wrapper returned by
    /// `add_breakpoint` if the caller still holds that.
    pub trait EventCallbacks {
        fn breakpoint(&self, _client: &DebugClient, _bp: &DebugBreakpoint) -> DebugInstruction {
            DebugInstruction::NoChange
        }

        fn exception(&self, _client: &DebugClient, _ei: &ExceptionInfo) -> DebugInstruction {
            DebugInstruction::NoChange
        }

        fn change_engine_state(&self, _client: &DebugClient, _flags: u32, _argument: u64) {}
    }

    #[implement(IDebugEventCallbacks)]
    pub(crate) struct EventCallbacksBridge {
        client: DebugClient,
        callbacks: Box<dyn EventCallbacks>,
    }

    impl EventCallbacksBridge {
        pub(crate) fn new(client: DebugClient, callbacks: Box<dyn EventCallbacks>) -> Self {
            Self { client, callbacks }
        }
    }

    /// Non-zero statuses travel back to the engine through the error path.
    fn status(instruction: DebugInstruction) -> Result<()> {
        match instruction.as_status() {
            0 => Ok(()),
            s => Err(Error::from(HRESULT(s as i32))),
        }
    }

    impl IDebugEventCallbacks_Impl for EventCallbacksBridge {
        fn GetInterestMask(&self) -> Result<u32> {
            Ok(DEBUG_EVENT_BREAKPOINT | DEBUG_EVENT_EXCEPTION | DEBUG_EVENT_CHANGE_ENGINE_STATE)
        }

        fn Breakpoint(&self, bp: Option<&IDebugBreakpoint>) -> Result<()> {
            let Some(bp) = bp else {
                return status(DebugInstruction::NoChange);
            };

            match self.client.resolve_breakpoint(bp) {
                Ok(bp) => status(self.callbacks.breakpoint(&self.client, &bp)),
                Err(e) => {
                    let _ = crate::dlogln!(self.client, "Failed to resolve breakpoint: {e:#}");
                    status(DebugInstruction::NoChange)
                }
            }
        }

        fn Exception(&self, exception: *const EXCEPTION_RECORD64, firstchance: u32) -> Result<()> {
            // SAFETY: the engine passes a record that lives for the call.
            let Some(record) = (unsafe { exception.as_ref() }) else {
                return status(DebugInstruction::NoChange);
            };

            let ei = ExceptionInfo {
                record: ExceptionRecord::from(record),
                first_chance: firstchance != 0,
            };
            status(self.callbacks.exception(&self.client, &ei))
        }

        fn CreateThread(&self, _handle: u64, _dataoffset: u64, _startoffset: u64) -> Result<()> {
            Ok(())
        }

        fn ExitThread(&self, _exitcode: u32) -> Result<()> {
            Ok(())
        }

        fn CreateProcessA(
            &self,
            _imagefilehandle: u64,
            _handle: u64,
            _baseoffset: u64,
            _modulesize: u32,
            _modulename: &PCSTR,
            _imagename: &PCSTR,
            _checksum: u32,
            _timedatestamp: u32,
            _initialthreadhandle: u64,
            _threaddataoffset: u64,
            _startoffset: u64,
        ) -> Result<()> {
            Ok(())
        }

        fn ExitProcess(&self, _exitcode: u32) -> Result<()> {
            Ok(())
        }

        fn LoadModule(
            &self,
            _imagefilehandle: u64,
            _baseoffset: u64,
            _modulesize: u32,
            _modulename: &PCSTR,
            _imagename: &PCSTR,
            _checksum: u32,
            _timedatestamp: u32,
        ) -> Result<()> {
            Ok(())
        }

        fn UnloadModule(&self, _imagebasename: &PCSTR, _baseoffset: u64) -> Result<()> {
            Ok(())
        }

        fn SystemError(&self, _error: u32, _level: u32) -> Result<()> {
            Ok(())
        }

        fn SessionStatus(&self, _status: u32) -> Result<()> {
            Ok(())
        }

        fn ChangeDebuggeeState(&self, _flags: u32, _argument: u64) -> Result<()> {
            Ok(())
        }

        fn ChangeEngineState(&self, flags: u32, argument: u64) -> Result<()> {
            self.callbacks
                .change_engine_state(&self.client, flags, argument);
            Ok(())
        }

        fn ChangeSymbolState(&self, _flags: u32, _argument: u64) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DebugInstruction;

    #[test]
    fn instructions_map_to_engine_statuses() {
        assert_eq!(DebugInstruction::default().as_status(), 0);
        assert_eq!(DebugInstruction::Go.as_status(), 1);
        assert_eq!(DebugInstruction::GoNotHandled.as_status(), 3);
        assert_eq!(DebugInstruction::Break.as_status(), 6);
        assert_eq!(DebugInstruction::IgnoreEvent.as_status(), 9);
    }
}
