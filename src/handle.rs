//! Completion handles and the callback context that carries them.
//!
//! A [`Handle`] names a live completion in the registry. It reaches the
//! native library as a [`CallbackContext`]: a plain word-sized integer that
//! occupies the `void *` callback argument slot. The context is produced
//! with a provenance-free cast and is never dereferenced on either side.

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroU32;

// Handles must round-trip through the word-sized context.
const _: () = assert!(usize::BITS >= u32::BITS);

/// Process-unique token for a live, registered completion. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU32);

impl Handle {
    /// Raw value reserved for "no callback requested".
    pub const SENTINEL: u32 = 0;

    /// Largest handle value before the counter wraps back to 1.
    pub const MAX: u32 = u32::MAX;

    /// The first handle a fresh registry issues.
    pub const FIRST: Handle = Handle(NonZeroU32::MIN);

    /// Returns `None` for the sentinel.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// The context value handed to the native layer for this handle.
    pub fn context(self) -> CallbackContext {
        CallbackContext(self.get() as usize)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque callback argument as seen by the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackContext(usize);

impl CallbackContext {
    /// Context for completions that requested no callbacks.
    pub const NONE: CallbackContext = CallbackContext(0);

    pub fn from_raw_value(raw: usize) -> Self {
        Self(raw)
    }

    pub fn raw_value(self) -> usize {
        self.0
    }

    /// Decode the handle. `None` for the sentinel or for values that never
    /// came from a handle.
    pub fn handle(self) -> Option<Handle> {
        u32::try_from(self.0).ok().and_then(Handle::new)
    }

    /// Encode for the `void *` argument slot.
    pub fn into_ptr(self) -> *mut c_void {
        std::ptr::without_provenance_mut(self.0)
    }

    /// Decode from the `void *` argument the native library passed back.
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr.addr())
    }
}
