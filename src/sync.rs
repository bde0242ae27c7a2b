//! Synchronization primitives with optional loom support.
//!
//! The registry lock and the per-completion notification flags go through
//! this module so the loom tests can model-check them. `Arc`/`Weak` stay on
//! std: loom does not provide `Weak`, and the registry's non-owning entries
//! depend on it.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(not(feature = "loom"))]
pub use parking_lot::Mutex;

#[cfg(feature = "loom")]
pub use self::loom_mutex::Mutex;

#[cfg(feature = "loom")]
mod loom_mutex {
    /// parking_lot-shaped wrapper over loom's mutex (no poisoning in the API).
    pub struct Mutex<T>(loom::sync::Mutex<T>);

    pub type MutexGuard<'a, T> = loom::sync::MutexGuard<'a, T>;

    impl<T> Mutex<T> {
        pub fn new(value: T) -> Self {
            Self(loom::sync::Mutex::new(value))
        }

        pub fn lock(&self) -> MutexGuard<'_, T> {
            // Poisoning only happens if a modelled thread panicked, which
            // already fails the loom test.
            match self.0.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        }
    }
}
