use std::cell::RefCell;
use std::collections::HashMap;

use dbgeng_wrapper::breakpoint::DebugBreakpoint;
use dbgeng_wrapper::client::DebugClient;
use dbgeng_wrapper::dlogln;
use dbgeng_wrapper::events::DebugInstruction;

thread_local! {
    pub static TRACKED: Tracked = Tracked::default();
}

struct Watch {
    expression: String,
    hits: u64,
}

/// Tracked breakpoints, keyed by the wrapper itself.
///
/// A breakpoint delivered to an event callback is the same wrapper that
/// was stored here, so no id or GUID round trip is needed to find it.
#[derive(Default)]
pub struct Tracked {
    inner: RefCell<HashMap<DebugBreakpoint, Watch>>,
}

impl Tracked {
    pub fn track(&self, bp: DebugBreakpoint, expression: String) {
        self.inner
            .borrow_mut()
            .insert(bp, Watch { expression, hits: 0 });
    }

    pub fn untrack(&self, bp: &DebugBreakpoint) -> bool {
        self.inner.borrow_mut().remove(bp).is_some()
    }

    /// Expression and hit count, if `bp` is tracked.
    pub fn describe(&self, bp: &DebugBreakpoint) -> Option<(String, u64)> {
        self.inner
            .borrow()
            .get(bp)
            .map(|w| (w.expression.clone(), w.hits))
    }

    pub fn hit(&self, client: &DebugClient, bp: &DebugBreakpoint) -> DebugInstruction {
        let mut inner = self.inner.borrow_mut();
        let Some(watch) = inner.get_mut(bp) else {
            return DebugInstruction::NoChange;
        };

        watch.hits += 1;
        let _ = dlogln!(client, "*** {} hit ({} so far)", watch.expression, watch.hits);
        DebugInstruction::Go
    }

    pub fn clear(&self, client: &DebugClient) {
        for (bp, _) in self.inner.borrow_mut().drain() {
            let _ = client.remove_breakpoint(bp);
        }
    }
}
