//! Bindings to the system `librados`.

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::cluster::to_cstring;
use crate::error::{RadosError, Result, check};
use crate::handle::CallbackContext;
use crate::native::{NativeAio, NativeCompletion, NativeIoCtx, ObjectStat, Trampoline};

type RadosT = *mut c_void;
type RadosIoCtxT = *mut c_void;
type RadosCompletionT = *mut c_void;

#[link(name = "rados")]
unsafe extern "C" {
    fn rados_version(major: *mut c_int, minor: *mut c_int, extra: *mut c_int);
    fn rados_create2(
        cluster: *mut RadosT,
        cluster_name: *const c_char,
        name: *const c_char,
        flags: u64,
    ) -> c_int;
    fn rados_conf_set(cluster: RadosT, option: *const c_char, value: *const c_char) -> c_int;
    fn rados_conf_read_file(cluster: RadosT, path: *const c_char) -> c_int;
    fn rados_connect(cluster: RadosT) -> c_int;
    fn rados_shutdown(cluster: RadosT);

    fn rados_ioctx_create(cluster: RadosT, pool: *const c_char, ioctx: *mut RadosIoCtxT) -> c_int;
    fn rados_ioctx_destroy(ioctx: RadosIoCtxT);

    fn rados_aio_create_completion(
        cb_arg: *mut c_void,
        cb_complete: Option<Trampoline>,
        cb_safe: Option<Trampoline>,
        pc: *mut RadosCompletionT,
    ) -> c_int;
    fn rados_aio_wait_for_complete(c: RadosCompletionT) -> c_int;
    fn rados_aio_wait_for_safe(c: RadosCompletionT) -> c_int;
    fn rados_aio_is_complete(c: RadosCompletionT) -> c_int;
    fn rados_aio_is_safe(c: RadosCompletionT) -> c_int;
    fn rados_aio_get_return_value(c: RadosCompletionT) -> c_int;
    fn rados_aio_release(c: RadosCompletionT);

    fn rados_aio_write(
        io: RadosIoCtxT,
        oid: *const c_char,
        completion: RadosCompletionT,
        buf: *const c_char,
        len: usize,
        off: u64,
    ) -> c_int;
    fn rados_aio_write_full(
        io: RadosIoCtxT,
        oid: *const c_char,
        completion: RadosCompletionT,
        buf: *const c_char,
        len: usize,
    ) -> c_int;
    fn rados_aio_append(
        io: RadosIoCtxT,
        oid: *const c_char,
        completion: RadosCompletionT,
        buf: *const c_char,
        len: usize,
    ) -> c_int;
    fn rados_aio_remove(io: RadosIoCtxT, oid: *const c_char, completion: RadosCompletionT)
    -> c_int;

    fn rados_read(
        io: RadosIoCtxT,
        oid: *const c_char,
        buf: *mut c_char,
        len: usize,
        off: u64,
    ) -> c_int;
    fn rados_stat(
        io: RadosIoCtxT,
        oid: *const c_char,
        psize: *mut u64,
        pmtime: *mut libc::time_t,
    ) -> c_int;
}

/// `(major, minor, extra)` of the linked library.
pub fn version() -> (i32, i32, i32) {
    let (mut major, mut minor, mut extra) = (0, 0, 0);
    // SAFETY: the out-pointers are valid for the duration of the call.
    unsafe { rados_version(&mut major, &mut minor, &mut extra) };
    (major, minor, extra)
}

/// A `rados_t` cluster handle.
pub struct Librados {
    cluster: NonNull<c_void>,
    shut_down: AtomicBool,
}

// SAFETY: librados cluster handles are thread-safe.
unsafe impl Send for Librados {}
unsafe impl Sync for Librados {}

impl Librados {
    /// `rados_create2` for `user` (e.g. `client.admin`) on `cluster_name`.
    pub fn create(cluster_name: &str, user: &str, flags: u64) -> Result<Self> {
        let cluster_name = to_cstring(cluster_name, "Invalid cluster name")?;
        let user = to_cstring(user, "Invalid user name")?;

        let mut cluster: RadosT = ptr::null_mut();
        // SAFETY: both strings are NUL-terminated and outlive the call.
        let rc = unsafe { rados_create2(&mut cluster, cluster_name.as_ptr(), user.as_ptr(), flags) };
        check(rc, "Failed to create cluster handle")?;

        let cluster = NonNull::new(cluster).ok_or_else(|| {
            RadosError::Internal("rados_create2 returned a null handle".into())
        })?;
        let (major, minor, extra) = version();
        debug!(major, minor, extra, "librados cluster handle created");
        Ok(Self {
            cluster,
            shut_down: AtomicBool::new(false),
        })
    }

    fn raw(&self) -> RadosT {
        self.cluster.as_ptr()
    }
}

impl NativeAio for Librados {
    fn conf_set(&self, option: &CStr, value: &CStr) -> i32 {
        unsafe { rados_conf_set(self.raw(), option.as_ptr(), value.as_ptr()) }
    }

    fn conf_read_file(&self, path: &Path) -> i32 {
        let Ok(path) = CString::new(path.as_os_str().as_bytes()) else {
            return -libc::EINVAL;
        };
        unsafe { rados_conf_read_file(self.raw(), path.as_ptr()) }
    }

    fn connect(&self) -> i32 {
        unsafe { rados_connect(self.raw()) }
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            unsafe { rados_shutdown(self.raw()) }
        }
    }

    fn ioctx_create(&self, pool: &CStr) -> std::result::Result<NativeIoCtx, i32> {
        let mut ioctx: RadosIoCtxT = ptr::null_mut();
        let rc = unsafe { rados_ioctx_create(self.raw(), pool.as_ptr(), &mut ioctx) };
        if rc < 0 {
            return Err(rc);
        }
        NativeIoCtx::from_ptr(ioctx).ok_or(-libc::ENOMEM)
    }

    fn ioctx_destroy(&self, ioctx: NativeIoCtx) {
        unsafe { rados_ioctx_destroy(ioctx.as_ptr()) }
    }

    fn create_completion(
        &self,
        context: CallbackContext,
        on_complete: Option<Trampoline>,
        on_safe: Option<Trampoline>,
    ) -> std::result::Result<NativeCompletion, i32> {
        let mut completion: RadosCompletionT = ptr::null_mut();
        let rc = unsafe {
            rados_aio_create_completion(context.into_ptr(), on_complete, on_safe, &mut completion)
        };
        if rc < 0 {
            return Err(rc);
        }
        NativeCompletion::from_ptr(completion).ok_or(-libc::ENOMEM)
    }

    fn wait_for_complete(&self, completion: NativeCompletion) -> i32 {
        unsafe { rados_aio_wait_for_complete(completion.as_ptr()) }
    }

    fn wait_for_safe(&self, completion: NativeCompletion) -> i32 {
        unsafe { rados_aio_wait_for_safe(completion.as_ptr()) }
    }

    fn is_complete(&self, completion: NativeCompletion) -> bool {
        unsafe { rados_aio_is_complete(completion.as_ptr()) != 0 }
    }

    fn is_safe(&self, completion: NativeCompletion) -> bool {
        unsafe { rados_aio_is_safe(completion.as_ptr()) != 0 }
    }

    fn get_return_value(&self, completion: NativeCompletion) -> i32 {
        unsafe { rados_aio_get_return_value(completion.as_ptr()) }
    }

    fn release_completion(&self, completion: NativeCompletion) {
        unsafe { rados_aio_release(completion.as_ptr()) }
    }

    fn aio_write(
        &self,
        ioctx: NativeIoCtx,
        oid: &CStr,
        completion: NativeCompletion,
        data: &[u8],
        offset: u64,
    ) -> i32 {
        unsafe {
            rados_aio_write(
                ioctx.as_ptr(),
                oid.as_ptr(),
                completion.as_ptr(),
                data.as_ptr().cast(),
                data.len(),
                offset,
            )
        }
    }

    fn aio_write_full(
        &self,
        ioctx: NativeIoCtx,
        oid: &CStr,
        completion: NativeCompletion,
        data: &[u8],
    ) -> i32 {
        unsafe {
            rados_aio_write_full(
                ioctx.as_ptr(),
                oid.as_ptr(),
                completion.as_ptr(),
                data.as_ptr().cast(),
                data.len(),
            )
        }
    }

    fn aio_append(
        &self,
        ioctx: NativeIoCtx,
        oid: &CStr,
        completion: NativeCompletion,
        data: &[u8],
    ) -> i32 {
        unsafe {
            rados_aio_append(
                ioctx.as_ptr(),
                oid.as_ptr(),
                completion.as_ptr(),
                data.as_ptr().cast(),
                data.len(),
            )
        }
    }

    fn aio_remove(&self, ioctx: NativeIoCtx, oid: &CStr, completion: NativeCompletion) -> i32 {
        unsafe { rados_aio_remove(ioctx.as_ptr(), oid.as_ptr(), completion.as_ptr()) }
    }

    fn read(&self, ioctx: NativeIoCtx, oid: &CStr, buf: &mut [u8], offset: u64) -> i32 {
        unsafe {
            rados_read(
                ioctx.as_ptr(),
                oid.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                offset,
            )
        }
    }

    fn stat(&self, ioctx: NativeIoCtx, oid: &CStr) -> std::result::Result<ObjectStat, i32> {
        let mut size = 0u64;
        let mut mtime: libc::time_t = 0;
        let rc = unsafe { rados_stat(ioctx.as_ptr(), oid.as_ptr(), &mut size, &mut mtime) };
        if rc < 0 {
            return Err(rc);
        }
        Ok(ObjectStat {
            size,
            mtime: mtime as i64,
        })
    }
}

impl Drop for Librados {
    fn drop(&mut self) {
        self.shutdown();
    }
}
