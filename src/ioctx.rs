//! Pool I/O contexts.
//!
//! Asynchronous submissions take a [`Completion`] from the same session and
//! return as soon as the operation is queued; its outcome arrives through the
//! completion. `read` and `stat` are synchronous.

use std::ffi::CStr;

use tracing::trace;

use crate::cluster::{Rados, to_cstring};
use crate::completion::Completion;
use crate::error::{RadosError, Result, check};
use crate::native::{NativeAio, NativeCompletion, NativeIoCtx, ObjectStat};

/// An open pool. Destroyed on drop.
pub struct IoCtx<'r> {
    rados: &'r Rados,
    pool: String,
    native: NativeIoCtx,
}

impl<'r> IoCtx<'r> {
    pub(crate) fn new(rados: &'r Rados, pool: &str, native: NativeIoCtx) -> Self {
        Self {
            rados,
            pool: pool.to_string(),
            native,
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool
    }

    /// Write `data` at `offset` in `oid`.
    pub fn aio_write(
        &self,
        oid: &str,
        completion: &Completion,
        data: &[u8],
        offset: u64,
    ) -> Result<()> {
        self.submit(oid, completion, "Failed AIO write", |backend, ioctx, oid, c| {
            backend.aio_write(ioctx, oid, c, data, offset)
        })
    }

    /// Replace the contents of `oid` with `data`.
    pub fn aio_write_full(&self, oid: &str, completion: &Completion, data: &[u8]) -> Result<()> {
        self.submit(oid, completion, "Failed AIO write full", |backend, ioctx, oid, c| {
            backend.aio_write_full(ioctx, oid, c, data)
        })
    }

    pub fn aio_append(&self, oid: &str, completion: &Completion, data: &[u8]) -> Result<()> {
        self.submit(oid, completion, "Failed AIO append", |backend, ioctx, oid, c| {
            backend.aio_append(ioctx, oid, c, data)
        })
    }

    /// Delete `oid`. A missing object is reported by the completion's
    /// return value, not here.
    pub fn aio_remove(&self, oid: &str, completion: &Completion) -> Result<()> {
        self.submit(oid, completion, "Failed AIO remove", |backend, ioctx, oid, c| {
            backend.aio_remove(ioctx, oid, c)
        })
    }

    /// Read up to `len` bytes of `oid` starting at `offset`.
    pub fn read(&self, oid: &str, len: usize, offset: u64) -> Result<Vec<u8>> {
        let context = format!("Failed to read object {oid}");
        let name = to_cstring(oid, &context)?;
        let mut buf = vec![0u8; len];
        let n = check(
            self.backend().read(self.native, &name, &mut buf, offset),
            &context,
        )?;
        buf.truncate(n as usize);
        Ok(buf)
    }

    pub fn stat(&self, oid: &str) -> Result<ObjectStat> {
        let context = format!("Failed performing stat on object {oid}");
        let name = to_cstring(oid, &context)?;
        self.backend()
            .stat(self.native, &name)
            .map_err(|code| RadosError::from_code(code, &context))
    }

    fn backend(&self) -> &dyn NativeAio {
        self.rados.backend().as_ref()
    }

    fn submit(
        &self,
        oid: &str,
        completion: &Completion,
        what: &str,
        op: impl FnOnce(&dyn NativeAio, NativeIoCtx, &CStr, NativeCompletion) -> i32,
    ) -> Result<()> {
        let context = format!("{what} of object {oid}");
        let name = to_cstring(oid, &context)?;
        if !completion.same_backend(self.rados.backend()) {
            return Err(RadosError::from_code(
                -libc::EINVAL,
                &format!("{context}: completion belongs to another session"),
            ));
        }

        let rc = completion.with_native(|backend, native| op(backend, self.native, &name, native))?;
        check(rc, &context)?;
        trace!(pool = %self.pool, oid, handle = ?completion.handle(), "{what} submitted");
        Ok(())
    }
}

impl Drop for IoCtx<'_> {
    fn drop(&mut self) {
        self.backend().ioctx_destroy(self.native);
    }
}
