//! Cluster sessions.

use std::ffi::CString;
use std::sync::Arc;

use tracing::{debug, info};

use crate::completion::{Completion, CompletionOptions};
use crate::config::ClusterConfig;
use crate::error::{RadosError, Result, check};
use crate::handler::CompletionHandler;
use crate::ioctx::IoCtx;
use crate::native::NativeAio;

/// A configured cluster handle. Shut down on drop.
pub struct Rados {
    backend: Arc<dyn NativeAio>,
}

impl Rados {
    /// Wrap `backend` and apply `config`: the config file first, then the
    /// individual options. On failure the backend is shut down.
    pub fn create(backend: Arc<dyn NativeAio>, config: &ClusterConfig) -> Result<Self> {
        let rados = Self { backend };
        rados.configure(config)?;

        debug!(
            cluster = %config.name,
            user = %config.user,
            options = config.options.len(),
            "cluster handle configured"
        );
        Ok(rados)
    }

    fn configure(&self, config: &ClusterConfig) -> Result<()> {
        if let Some(path) = &config.config_file {
            check(
                self.backend.conf_read_file(path),
                format!("Failed reading configuration file {}", path.display()),
            )?;
        }

        for (option, value) in &config.options {
            let context = format!("Could not set configuration option {option}");
            let key = to_cstring(option, &context)?;
            let value = to_cstring(value, &context)?;
            check(self.backend.conf_set(&key, &value), &context)?;
        }
        Ok(())
    }

    /// Create a session backed by the system librados.
    #[cfg(feature = "librados")]
    pub fn with_librados(config: &ClusterConfig) -> Result<Self> {
        let backend = crate::native::librados::Librados::create(
            &config.name,
            &config.user,
            config.flags,
        )?;
        Self::create(Arc::new(backend), config)
    }

    pub fn connect(&self) -> Result<()> {
        check(self.backend.connect(), "Failed to connect to cluster")?;
        info!("connected to cluster");
        Ok(())
    }

    /// Open an I/O context on `pool`.
    pub fn ioctx(&self, pool: &str) -> Result<IoCtx<'_>> {
        let context = format!("Failed to create the IoCtx for pool {pool}");
        let name = to_cstring(pool, &context)?;
        let native = self
            .backend
            .ioctx_create(&name)
            .map_err(|code| RadosError::from_code(code, &context))?;
        Ok(IoCtx::new(self, pool, native))
    }

    /// A completion on this session with a no-op handler.
    pub fn completion(&self, options: CompletionOptions) -> Result<Completion> {
        Completion::new(self.backend.clone(), options)
    }

    pub fn completion_with_handler(
        &self,
        options: CompletionOptions,
        handler: impl CompletionHandler,
    ) -> Result<Completion> {
        Completion::with_handler(self.backend.clone(), options, handler)
    }

    pub fn backend(&self) -> &Arc<dyn NativeAio> {
        &self.backend
    }
}

impl Drop for Rados {
    fn drop(&mut self) {
        self.backend.shutdown();
        debug!("cluster handle shut down");
    }
}

pub(crate) fn to_cstring(s: &str, context: &str) -> Result<CString> {
    CString::new(s).map_err(|_| RadosError::from_code(-libc::EINVAL, context))
}
