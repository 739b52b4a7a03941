//! Bindings for the dbgeng COM interfaces.
//!
//! Breakpoints get special treatment: the engine frees a breakpoint object
//! when it is removed, regardless of outstanding references, so every
//! breakpoint handed out by this crate goes through the process-wide
//! [`cache::IdentityCache`]. See [`breakpoint`] for the details.
pub mod breakpoint;
pub mod cache;
pub mod control;
pub mod error;
pub mod events;
pub mod exception;

#[cfg(windows)]
pub mod client;

#[cfg(windows)]
#[doc(hidden)]
pub mod __private {
    pub use paste;
    pub use windows;
}

/// Prints a line to the debugger's output, `format!` style.
#[macro_export]
macro_rules! dlogln {
    ($client:expr, $($arg:tt)*) => {
        $client.logln(format!($($arg)*))
    };
}

/// Exports `$func` as the extension command `$name`.
///
/// `$func` has the signature `fn(&DebugClient, String) -> anyhow::Result<()>`
/// and receives the raw argument string. Errors are printed to the debugger
/// and reported as `E_FAIL`; panics do not unwind into the host.
#[cfg(windows)]
#[macro_export]
macro_rules! export_cmd {
    ($name:ident, $func:path) => {
        $crate::__private::paste::paste! {
            #[no_mangle]
            pub extern "C" fn [<$name:lower>](
                client: *mut ::std::ffi::c_void,
                args: $crate::__private::windows::core::PCSTR,
            ) -> $crate::__private::windows::core::HRESULT {
                $crate::client::run_command(client, args, $func)
            }
        }
    };
}
