//! Debugger extension that tracks breakpoints by wrapper identity.
//!
//! `!bpadd <expr>` sets and tracks a breakpoint, `!bplist` lists every
//! engine breakpoint with hit counts, `!bprm <id>` removes one.
#![cfg(windows)]

mod cmd;
mod events;
mod tracker;

use std::sync::Once;

use dbgeng_wrapper::client::DebugClient;
use dbgeng_wrapper::{dlogln, export_cmd};
use windows::core::HRESULT;
use windows::Win32::Foundation::{E_FAIL, S_OK};
use windows::Win32::System::Diagnostics::Debug::Extensions::{
    DEBUG_CLASS_KERNEL, DEBUG_CLASS_USER_WINDOWS,
};

use events::CLIENT;
use tracker::TRACKED;

fn init() -> anyhow::Result<()> {
    let client = DebugClient::create()?;

    // Breakpoints need something to break into.
    let is_live = matches!(
        client.debuggee_type()?,
        (DEBUG_CLASS_KERNEL | DEBUG_CLASS_USER_WINDOWS, _)
    );
    if !is_live {
        dlogln!(client, "bp_tracker expects a live debugging session")?;
    }

    events::init_accessible(client)
}

#[export_name = "DebugExtensionInitialize"]
extern "C" fn initialize(version: *mut u32, flags: *mut u32) -> HRESULT {
    unsafe {
        *version = 0x0001_0000;
        *flags = 0x00000000;
    }

    static INIT_ONCE: Once = Once::new();
    let mut hr = S_OK;
    INIT_ONCE.call_once(|| {
        if init().is_err() {
            hr = E_FAIL;
        }
    });
    hr
}

#[export_name = "DebugExtensionUninitialize"]
extern "C" fn uninitialize() {
    CLIENT.with(|c| {
        if let Some(client) = c.get() {
            TRACKED.with(|tracked| tracked.clear(client));
        }
    });
}

export_cmd!(bpadd, cmd::add);
export_cmd!(bplist, cmd::list);
export_cmd!(bprm, cmd::remove);
