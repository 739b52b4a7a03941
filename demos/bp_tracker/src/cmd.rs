use anyhow::{Context, Result};
use dbgeng_wrapper::breakpoint::{BreakpointFlags, BreakpointType};
use dbgeng_wrapper::client::DebugClient;
use dbgeng_wrapper::dlogln;

use crate::tracker::TRACKED;

pub fn add(client: &DebugClient, args: String) -> Result<()> {
    let expression = args
        .split_whitespace()
        .next()
        .context("usage: !bpadd <expression>")?
        .to_string();

    let bp = client.add_breakpoint(BreakpointType::Code, None)?;
    bp.set_offset_expression(&expression)?;
    bp.set_flags(BreakpointFlags::ENABLED)?;

    dlogln!(client, "Tracking {expression} as breakpoint {}", bp.id()?)?;
    TRACKED.with(|tracked| tracked.track(bp, expression));
    Ok(())
}

pub fn list(client: &DebugClient, _args: String) -> Result<()> {
    for bp in client.breakpoints()? {
        let id = bp.id()?;
        let offset = bp.offset().unwrap_or_default();
        match TRACKED.with(|tracked| tracked.describe(&bp)) {
            Some((expression, hits)) => {
                dlogln!(client, "{id:>4} {offset:#018x} {expression} hits={hits}")?
            }
            None => dlogln!(client, "{id:>4} {offset:#018x} (untracked)")?,
        }
    }
    Ok(())
}

pub fn remove(client: &DebugClient, args: String) -> Result<()> {
    let id: u32 = args.trim().parse().context("usage: !bprm <id>")?;
    let bp = client.breakpoint_by_id(id)?;
    TRACKED.with(|tracked| tracked.untrack(&bp));
    client.remove_breakpoint(bp)?;
    dlogln!(client, "Removed breakpoint {id}")
}
