//! The native library boundary.
//!
//! [`NativeAio`] is everything the binding needs from librados, one instance
//! per cluster session. Statuses come back raw (negative errno on failure);
//! callers translate them with [`check`](crate::error::check).
//!
//! Two implementations exist: [`librados`] (feature `librados`) calls the
//! real C library, and [`sim`] is an in-process stand-in with its own worker
//! threads that drives the same trampolines.

use std::ffi::{CStr, c_void};
use std::path::Path;
use std::ptr::NonNull;

use crate::handle::CallbackContext;

#[cfg(feature = "librados")]
pub mod librados;
pub mod sim;

/// C signature of a completion callback: `(rados_completion_t, void *arg)`.
pub type Trampoline = unsafe extern "C" fn(completion: *mut c_void, arg: *mut c_void);

/// Opaque native completion (`rados_completion_t`).
///
/// Valid from creation until it is passed to
/// [`NativeAio::release_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCompletion(NonNull<c_void>);

impl NativeCompletion {
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

// SAFETY: the pointer is an opaque token owned by the native library, which
// synchronizes access to the object it names internally.
unsafe impl Send for NativeCompletion {}
unsafe impl Sync for NativeCompletion {}

/// Opaque native pool context (`rados_ioctx_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeIoCtx(NonNull<c_void>);

impl NativeIoCtx {
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

// SAFETY: librados io contexts may be used from multiple threads.
unsafe impl Send for NativeIoCtx {}
unsafe impl Sync for NativeIoCtx {}

/// Size and modification time of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: i64,
}

/// Operations consumed from the native storage library.
pub trait NativeAio: Send + Sync {
    fn conf_set(&self, option: &CStr, value: &CStr) -> i32;

    fn conf_read_file(&self, path: &Path) -> i32;

    fn connect(&self) -> i32;

    /// Tear the session down. Idempotent; implementations also shut down
    /// when dropped.
    fn shutdown(&self);

    fn ioctx_create(&self, pool: &CStr) -> Result<NativeIoCtx, i32>;

    fn ioctx_destroy(&self, ioctx: NativeIoCtx);

    /// Allocate a native completion that passes `context` to whichever
    /// trampolines are provided.
    fn create_completion(
        &self,
        context: CallbackContext,
        on_complete: Option<Trampoline>,
        on_safe: Option<Trampoline>,
    ) -> Result<NativeCompletion, i32>;

    /// Block until the operation is acknowledged.
    fn wait_for_complete(&self, completion: NativeCompletion) -> i32;

    /// Block until the operation is durable.
    fn wait_for_safe(&self, completion: NativeCompletion) -> i32;

    fn is_complete(&self, completion: NativeCompletion) -> bool;

    fn is_safe(&self, completion: NativeCompletion) -> bool;

    /// The operation's own result. Only meaningful once complete.
    fn get_return_value(&self, completion: NativeCompletion) -> i32;

    /// Release the completion. The native object may outlive this call until
    /// its operation is acknowledged and durable.
    fn release_completion(&self, completion: NativeCompletion);

    fn aio_write(
        &self,
        ioctx: NativeIoCtx,
        oid: &CStr,
        completion: NativeCompletion,
        data: &[u8],
        offset: u64,
    ) -> i32;

    fn aio_write_full(
        &self,
        ioctx: NativeIoCtx,
        oid: &CStr,
        completion: NativeCompletion,
        data: &[u8],
    ) -> i32;

    fn aio_append(
        &self,
        ioctx: NativeIoCtx,
        oid: &CStr,
        completion: NativeCompletion,
        data: &[u8],
    ) -> i32;

    fn aio_remove(&self, ioctx: NativeIoCtx, oid: &CStr, completion: NativeCompletion) -> i32;

    /// Synchronous read into `buf`. Returns bytes read or a negative status.
    fn read(&self, ioctx: NativeIoCtx, oid: &CStr, buf: &mut [u8], offset: u64) -> i32;

    fn stat(&self, ioctx: NativeIoCtx, oid: &CStr) -> Result<ObjectStat, i32>;
}
