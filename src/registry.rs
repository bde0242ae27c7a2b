//! Handle → completion registry.
//!
//! The registry is what lets a callback arriving on a native thread find the
//! completion it belongs to. Entries are non-owning (`Weak`): the
//! [`Completion`](crate::Completion) owns its state and removes its entry when
//! released, so a callback racing a release either finds a fully constructed
//! completion or finds nothing.
//!
//! # Handle allocation
//!
//! Handles come from a counter starting at 1. When it passes
//! [`Handle::MAX`] it wraps back to 1, never issuing the sentinel 0, and
//! skips any value that is still live. Counter advancement and insertion
//! happen under the same lock as lookup and removal.
//!
//! # Process-wide instance
//!
//! The trampolines cannot capture state, so they resolve handles through the
//! registry installed with [`install`]. It is created on first use and lives
//! until [`teardown`]. After teardown, callbacks are dropped; completions
//! created earlier still unregister from the instance they registered in.
//!
//! A registry installed after a teardown continues the retired counter and
//! never issues a handle that is still live in a retired registry, so a late
//! callback for an old completion cannot resolve to a new one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex as StaticMutex, RwLock};

use crate::completion::CompletionState;
use crate::error::{RadosError, Result};
use crate::handle::Handle;
use crate::sync::Mutex;

/// Concurrent map from live handles to their completions.
pub struct CompletionRegistry {
    table: Mutex<Table>,
    /// Torn-down predecessors that still had live completions.
    retired: Vec<Arc<CompletionRegistry>>,
}

struct Table {
    /// Next raw value to try. Always in `1..=Handle::MAX`.
    next: u32,
    entries: HashMap<Handle, Weak<CompletionState>>,
}

impl CompletionRegistry {
    /// Create an isolated registry. Completions bound to trampolines must use
    /// the [installed](install) one instead.
    pub fn new() -> Self {
        Self::starting_at(Handle::FIRST.get())
    }

    pub(crate) fn starting_at(next: u32) -> Self {
        Self {
            table: Mutex::new(Table {
                next: next.max(1),
                entries: HashMap::new(),
            }),
            retired: Vec::new(),
        }
    }

    /// Create the registry that replaces `retired` (oldest first).
    ///
    /// The counter resumes where the most recent one stopped, and handles
    /// still live in any of them are skipped until they are unregistered.
    pub(crate) fn succeeding(retired: Vec<Arc<CompletionRegistry>>) -> Self {
        let next = retired
            .last()
            .map(|r| r.table.lock().next)
            .unwrap_or(Handle::FIRST.get());
        let mut registry = Self::starting_at(next);
        registry.retired = retired.into_iter().filter(|r| !r.is_empty()).collect();
        registry
    }

    fn live_elsewhere(&self, handle: Handle) -> bool {
        self.retired.iter().any(|r| r.contains(handle))
    }

    /// Allocate a handle for `state`, bind it, and insert the entry.
    ///
    /// The handle is stored in `state` before the entry becomes visible, so a
    /// concurrent lookup never observes a half-registered completion.
    pub(crate) fn register(&self, state: &Arc<CompletionState>) -> Result<Handle> {
        let mut table = self.table.lock();
        let retired_live: usize = self.retired.iter().map(|r| r.len()).sum();
        if table.entries.len() + retired_live >= Handle::MAX as usize {
            return Err(RadosError::RegistryExhausted);
        }

        loop {
            let raw = table.next;
            table.next = if raw >= Handle::MAX { 1 } else { raw + 1 };

            let Some(handle) = Handle::new(raw) else {
                continue;
            };
            if table.entries.contains_key(&handle) || self.live_elsewhere(handle) {
                continue;
            }

            state.bind(handle);
            table.entries.insert(handle, Arc::downgrade(state));
            return Ok(handle);
        }
    }

    /// Resolve a handle. `None` if it was never issued, has been removed, or
    /// its completion is already gone.
    pub(crate) fn lookup(&self, handle: Handle) -> Option<Arc<CompletionState>> {
        let table = self.table.lock();
        table.entries.get(&handle).and_then(Weak::upgrade)
    }

    /// Remove a handle. Unknown or already removed handles are a no-op.
    /// Returns whether an entry was removed.
    pub fn unregister(&self, handle: Handle) -> bool {
        self.table.lock().entries.remove(&handle).is_some()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.table.lock().entries.contains_key(&handle)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CompletionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static INSTALLED: RwLock<Option<Arc<CompletionRegistry>>> = parking_lot::const_rwlock(None);

/// Registries removed by [`teardown`] and not yet succeeded.
static RETIRED: StaticMutex<Vec<Arc<CompletionRegistry>>> = parking_lot::const_mutex(Vec::new());

/// Return the process-wide registry, creating it on first call.
pub fn install() -> Arc<CompletionRegistry> {
    if let Some(registry) = INSTALLED.read().as_ref() {
        return registry.clone();
    }

    let mut slot = INSTALLED.write();
    slot.get_or_insert_with(|| {
        let retired = std::mem::take(&mut *RETIRED.lock());
        tracing::debug!(retired = retired.len(), "installing completion registry");
        Arc::new(CompletionRegistry::succeeding(retired))
    })
    .clone()
}

/// The process-wide registry, if installed.
pub fn installed() -> Option<Arc<CompletionRegistry>> {
    INSTALLED.read().clone()
}

/// Uninstall the process-wide registry and return it.
///
/// Callbacks arriving afterwards are dropped. Intended for process exit.
pub fn teardown() -> Option<Arc<CompletionRegistry>> {
    let mut slot = INSTALLED.write();
    let registry = slot.take()?;
    tracing::debug!(live = registry.len(), "completion registry torn down");

    let mut retired = RETIRED.lock();
    retired.extend(registry.retired.iter().cloned());
    retired.push(registry.clone());
    Some(registry)
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use std::sync::Arc;

    use loom::thread;

    use super::*;
    use crate::completion::{CompletionOptions, CompletionState};
    use crate::handler::NoopHandler;

    fn state() -> Arc<CompletionState> {
        Arc::new(CompletionState::new(
            CompletionOptions::both(),
            Box::new(NoopHandler),
        ))
    }

    #[test]
    fn concurrent_register_never_duplicates() {
        loom::model(|| {
            let registry = Arc::new(CompletionRegistry::starting_at(Handle::MAX));
            let r1 = registry.clone();
            let r2 = registry.clone();

            let t1 = thread::spawn(move || {
                let s = state();
                (r1.register(&s).unwrap(), s)
            });
            let t2 = thread::spawn(move || {
                let s = state();
                (r2.register(&s).unwrap(), s)
            });

            let (h1, _s1) = t1.join().unwrap();
            let (h2, _s2) = t2.join().unwrap();
            assert_ne!(h1, h2);
            assert!(h1.get() == Handle::MAX || h1.get() == 1);
            assert!(h2.get() == Handle::MAX || h2.get() == 1);
        });
    }

    #[test]
    fn lookup_racing_unregister_sees_bound_state_or_nothing() {
        loom::model(|| {
            let registry = Arc::new(CompletionRegistry::new());
            let s = state();
            let handle = registry.register(&s).unwrap();

            let reader = {
                let registry = registry.clone();
                thread::spawn(move || {
                    if let Some(found) = registry.lookup(handle) {
                        assert_eq!(found.handle(), Some(handle));
                    }
                })
            };

            registry.unregister(handle);
            reader.join().unwrap();
            assert!(registry.lookup(handle).is_none());
        });
    }
}
