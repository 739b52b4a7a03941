//! Process-wide identity map from native breakpoint handles to wrappers.
//!
//! The map holds weak references only; a wrapper lives exactly as long as
//! callers hold it. Lookups, inserts, evictions and invalidation all run
//! under one lock so that two threads (say, a command thread and an engine
//! callback) can never mint two live wrappers for one handle.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::breakpoint::{BreakpointBackend, BreakpointCell, DebugBreakpoint, NativeBreakpointHandle};
use crate::error::{BreakpointError, Result};

pub struct IdentityCache {
    entries: Mutex<HashMap<NativeBreakpointHandle, Weak<BreakpointCell>>>,
}

impl IdentityCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The cache every wrapper in the process goes through.
    pub fn global() -> &'static IdentityCache {
        static CACHE: OnceLock<IdentityCache> = OnceLock::new();
        CACHE.get_or_init(IdentityCache::new)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NativeBreakpointHandle, Weak<BreakpointCell>>> {
        // Only weak references live in here, so a panic mid-update cannot
        // leave an entry that outlives its wrapper.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the live wrapper for `raw`, or wraps it with `backend`.
    pub fn get_or_create(
        &self,
        raw: usize,
        backend: &Arc<dyn BreakpointBackend>,
    ) -> Result<DebugBreakpoint> {
        let handle = NativeBreakpointHandle::new(raw)?;
        let mut entries = self.lock();

        if let Some(weak) = entries.get(&handle) {
            match weak.upgrade().map(DebugBreakpoint::from_cell) {
                Some(bp) if !bp.is_abandoned() => return Ok(bp),
                _ => {
                    tracing::trace!(?handle, "evicting stale breakpoint wrapper");
                    entries.remove(&handle);
                }
            }
        }

        entries.retain(|_, weak| weak.strong_count() > 0);

        let bp = DebugBreakpoint::new(handle, Arc::clone(backend));
        entries.insert(handle, bp.downgrade());
        tracing::trace!(?handle, live = entries.len(), "wrapped breakpoint");
        Ok(bp)
    }

    /// Detaches `bp` from its native object and returns the handle the
    /// caller must now pass to the engine's removal call.
    ///
    /// Must run before the removal reaches the engine: afterwards the
    /// handle is dangling.
    pub fn invalidate(&self, bp: &DebugBreakpoint) -> Result<NativeBreakpointHandle> {
        let mut entries = self.lock();
        let Some(handle) = bp.abandon() else {
            tracing::warn!("breakpoint removed twice");
            return Err(BreakpointError::Abandoned);
        };

        let owned = entries
            .get(&handle)
            .is_some_and(|weak| Weak::ptr_eq(weak, &bp.downgrade()));
        if owned {
            entries.remove(&handle);
        }

        tracing::trace!(?handle, "invalidated breakpoint wrapper");
        Ok(handle)
    }

    /// Number of entries whose wrapper is still alive.
    pub fn live_len(&self) -> usize {
        self.lock().values().filter(|w| w.strong_count() > 0).count()
    }

    /// Whether a live wrapper is currently registered for `raw`.
    pub fn contains(&self, raw: usize) -> bool {
        let Ok(handle) = NativeBreakpointHandle::new(raw) else {
            return false;
        };

        self.lock()
            .get(&handle)
            .is_some_and(|w| w.strong_count() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::{BreakpointGuid, BreakpointParameters};
    use crate::error::{NativeResult, NativeStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and answers every query with the handle value.
    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    impl Echo {
        fn hit(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(bp.as_raw() as u32)
        }
    }

    impl BreakpointBackend for Echo {
        fn id(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
            self.hit(bp)
        }
        fn breakpoint_type(&self, bp: NativeBreakpointHandle) -> NativeResult<(u32, u32)> {
            self.hit(bp).map(|_| (0, 0x8664))
        }
        fn flags(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
            self.hit(bp)
        }
        fn add_flags(&self, bp: NativeBreakpointHandle, _: u32) -> NativeResult<()> {
            self.hit(bp).map(drop)
        }
        fn remove_flags(&self, bp: NativeBreakpointHandle, _: u32) -> NativeResult<()> {
            self.hit(bp).map(drop)
        }
        fn set_flags(&self, bp: NativeBreakpointHandle, _: u32) -> NativeResult<()> {
            self.hit(bp).map(drop)
        }
        fn offset(&self, bp: NativeBreakpointHandle) -> NativeResult<u64> {
            self.hit(bp).map(u64::from)
        }
        fn set_offset(&self, bp: NativeBreakpointHandle, _: u64) -> NativeResult<()> {
            self.hit(bp).map(drop)
        }
        fn offset_expression(&self, bp: NativeBreakpointHandle) -> NativeResult<String> {
            self.hit(bp).map(|v| v.to_string())
        }
        fn set_offset_expression(&self, bp: NativeBreakpointHandle, _: &str) -> NativeResult<()> {
            self.hit(bp).map(drop)
        }
        fn data_parameters(&self, bp: NativeBreakpointHandle) -> NativeResult<(u32, u32)> {
            self.hit(bp).map(|_| (0, 0))
        }
        fn set_data_parameters(&self, bp: NativeBreakpointHandle, _: u32, _: u32) -> NativeResult<()> {
            self.hit(bp).map(drop)
        }
        fn pass_count(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
            self.hit(bp)
        }
        fn set_pass_count(&self, bp: NativeBreakpointHandle, _: u32) -> NativeResult<()> {
            self.hit(bp).map(drop)
        }
        fn current_pass_count(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
            self.hit(bp)
        }
        fn match_thread_id(&self, bp: NativeBreakpointHandle) -> NativeResult<u32> {
            self.hit(bp)
        }
        fn set_match_thread_id(&self, bp: NativeBreakpointHandle, _: u32) -> NativeResult<()> {
            self.hit(bp).map(drop)
        }
        fn command(&self, bp: NativeBreakpointHandle) -> NativeResult<String> {
            self.hit(bp).map(|v| v.to_string())
        }
        fn set_command(&self, bp: NativeBreakpointHandle, _: &str) -> NativeResult<()> {
            self.hit(bp).map(drop)
        }
        fn parameters(&self, _: NativeBreakpointHandle) -> NativeResult<BreakpointParameters> {
            Err(NativeStatus::E_FAIL)
        }
        fn guid(&self, bp: NativeBreakpointHandle) -> NativeResult<BreakpointGuid> {
            self.hit(bp).map(|v| BreakpointGuid::from_u128(v.into()))
        }
    }

    fn backend() -> (Arc<Echo>, Arc<dyn BreakpointBackend>) {
        let echo = Arc::new(Echo::default());
        let dynamic: Arc<dyn BreakpointBackend> = echo.clone();
        (echo, dynamic)
    }

    #[test]
    fn same_handle_yields_same_wrapper() {
        let cache = IdentityCache::new();
        let (_, backend) = backend();

        let a = cache.get_or_create(0x1000, &backend).unwrap();
        let b = cache.get_or_create(0x1000, &backend).unwrap();
        let c = cache.get_or_create(0x2000, &backend).unwrap();

        assert!(a.ptr_eq(&b));
        assert_ne!(a, c);
        assert_eq!(cache.live_len(), 2);
    }

    #[test]
    fn null_handle_is_rejected_without_insert() {
        let cache = IdentityCache::new();
        let (_, backend) = backend();

        assert_eq!(
            cache.get_or_create(0, &backend).unwrap_err(),
            BreakpointError::Usage("null breakpoint handle")
        );
        assert_eq!(cache.lock().len(), 0);
        assert!(!cache.contains(0));
    }

    #[test]
    fn invalidated_wrapper_is_never_resurrected() {
        let cache = IdentityCache::new();
        let (_, backend) = backend();

        let old = cache.get_or_create(0x1000, &backend).unwrap();
        let handle = cache.invalidate(&old).unwrap();
        assert_eq!(handle.as_raw(), 0x1000);
        assert!(old.is_abandoned());
        assert!(!cache.contains(0x1000));

        let new = cache.get_or_create(0x1000, &backend).unwrap();
        assert!(!new.ptr_eq(&old));
        assert!(!new.is_abandoned());
    }

    #[test]
    fn abandoned_wrapper_never_reaches_backend() {
        let cache = IdentityCache::new();
        let (echo, backend) = backend();

        let bp = cache.get_or_create(0x1000, &backend).unwrap();
        assert_eq!(bp.id().unwrap(), 0x1000);
        let before = echo.calls.load(Ordering::SeqCst);

        cache.invalidate(&bp).unwrap();
        assert_eq!(bp.id(), Err(BreakpointError::Abandoned));
        assert_eq!(bp.offset(), Err(BreakpointError::Abandoned));
        assert_eq!(bp.set_pass_count(3), Err(BreakpointError::Abandoned));
        assert_eq!(bp.guid(), Err(BreakpointError::Abandoned));
        assert_eq!(bp.enable(), Err(BreakpointError::Abandoned));
        assert_eq!(echo.calls.load(Ordering::SeqCst), before);
    }

    #[test]
    fn second_invalidate_fails() {
        let cache = IdentityCache::new();
        let (_, backend) = backend();

        let bp = cache.get_or_create(0x1000, &backend).unwrap();
        cache.invalidate(&bp).unwrap();
        assert_eq!(cache.invalidate(&bp), Err(BreakpointError::Abandoned));
    }

    #[test]
    fn dropped_wrapper_is_replaced() {
        let cache = IdentityCache::new();
        let (_, backend) = backend();

        let first = cache.get_or_create(0x1000, &backend).unwrap();
        let weak = first.downgrade();
        drop(first);
        assert!(weak.upgrade().is_none());
        assert!(!cache.contains(0x1000));

        let second = cache.get_or_create(0x1000, &backend).unwrap();
        assert!(!second.is_abandoned());
        assert_eq!(cache.live_len(), 1);
    }

    #[test]
    fn invalidating_a_stale_clone_keeps_the_fresh_entry() {
        let cache = IdentityCache::new();
        let (_, backend) = backend();

        let old = cache.get_or_create(0x1000, &backend).unwrap();
        let clone = old.clone();
        cache.invalidate(&old).unwrap();
        let fresh = cache.get_or_create(0x1000, &backend).unwrap();

        assert_eq!(cache.invalidate(&clone), Err(BreakpointError::Abandoned));
        assert!(cache.contains(0x1000));
        assert!(cache.get_or_create(0x1000, &backend).unwrap().ptr_eq(&fresh));
    }

    #[test]
    fn dead_entries_are_swept_on_insert() {
        let cache = IdentityCache::new();
        let (_, backend) = backend();

        for raw in 1..=16 {
            drop(cache.get_or_create(raw * 0x10, &backend).unwrap());
        }
        let keep = cache.get_or_create(0x1000, &backend).unwrap();

        assert_eq!(cache.lock().len(), 1);
        assert!(cache.contains(0x1000));
        drop(keep);
    }

    #[test]
    fn concurrent_lookups_agree_on_one_wrapper() {
        let cache = Arc::new(IdentityCache::new());
        let (_, backend) = backend();

        let wrappers: Vec<DebugBreakpoint> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = &cache;
                    let backend = &backend;
                    s.spawn(move || cache.get_or_create(0x4000, backend).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(wrappers.windows(2).all(|w| w[0].ptr_eq(&w[1])));
    }
}
