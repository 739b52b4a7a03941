use std::cell::OnceCell;

use anyhow::anyhow;
use dbgeng_wrapper::breakpoint::DebugBreakpoint;
use dbgeng_wrapper::client::DebugClient;
use dbgeng_wrapper::dlogln;
use dbgeng_wrapper::events::{DebugInstruction, EventCallbacks};

use crate::tracker::TRACKED;

thread_local! {
    pub static CLIENT: OnceCell<DebugClient> = OnceCell::new();
}

struct TrackerEvents;

impl EventCallbacks for TrackerEvents {
    fn breakpoint(&self, client: &DebugClient, bp: &DebugBreakpoint) -> DebugInstruction {
        TRACKED.with(|tracked| tracked.hit(client, bp))
    }
}

pub fn init_accessible(client: DebugClient) -> anyhow::Result<()> {
    client.set_event_callbacks(TrackerEvents)?;
    dlogln!(client, "bp_tracker extension initialized")?;
    CLIENT.with(|c| {
        c.set(client)
            .map_err(|_e| anyhow!("Failed to set the client"))
    })
}
