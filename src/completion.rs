//! Completions for asynchronous operations.
//!
//! A [`Completion`] owns one native completion and, when notifications are
//! requested, one registry handle. Registration happens *before* the native
//! completion exists so a callback can never arrive for a handle that is not
//! yet resolvable; if native allocation then fails, the registration is
//! undone before the error is returned.
//!
//! The acknowledged and durable notifications are independent and unordered.
//! Each one sets its flag at most once and then invokes the handler.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::dispatch;
use crate::error::{RadosError, Result, check};
use crate::handle::{CallbackContext, Handle};
use crate::handler::{Channel, CompletionHandler, NoopHandler};
use crate::metrics;
use crate::native::{NativeAio, NativeCompletion, Trampoline};
use crate::registry::{self, CompletionRegistry};
use crate::sync::{AtomicBool, AtomicU32, Ordering};

/// Which notifications a completion subscribes to. Fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionOptions {
    /// Call `on_acknowledged` once the operation is in memory on all replicas.
    pub notify_on_acknowledged: bool,
    /// Call `on_durable` once the operation is on stable storage on all replicas.
    pub notify_on_durable: bool,
}

impl CompletionOptions {
    /// No notifications; the completion is only waited on.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn both() -> Self {
        Self {
            notify_on_acknowledged: true,
            notify_on_durable: true,
        }
    }

    pub fn acknowledged() -> Self {
        Self {
            notify_on_acknowledged: true,
            notify_on_durable: false,
        }
    }

    pub fn durable() -> Self {
        Self {
            notify_on_acknowledged: false,
            notify_on_durable: true,
        }
    }

    pub fn subscribes(&self, channel: Channel) -> bool {
        match channel {
            Channel::Acknowledged => self.notify_on_acknowledged,
            Channel::Durable => self.notify_on_durable,
        }
    }

    fn wants_callbacks(&self) -> bool {
        self.notify_on_acknowledged || self.notify_on_durable
    }
}

/// State shared between a completion and the registry.
pub(crate) struct CompletionState {
    /// Live handle, or the sentinel once released (or never registered).
    handle: AtomicU32,
    acknowledged: AtomicBool,
    durable: AtomicBool,
    options: CompletionOptions,
    handler: Box<dyn CompletionHandler>,
}

impl CompletionState {
    pub(crate) fn new(options: CompletionOptions, handler: Box<dyn CompletionHandler>) -> Self {
        Self {
            handle: AtomicU32::new(Handle::SENTINEL),
            acknowledged: AtomicBool::new(false),
            durable: AtomicBool::new(false),
            options,
            handler,
        }
    }

    pub(crate) fn bind(&self, handle: Handle) {
        self.handle.store(handle.get(), Ordering::Release);
    }

    pub(crate) fn handle(&self) -> Option<Handle> {
        Handle::new(self.handle.load(Ordering::Acquire))
    }

    /// Clear the live handle, returning it if one was set.
    fn take_handle(&self) -> Option<Handle> {
        Handle::new(self.handle.swap(Handle::SENTINEL, Ordering::AcqRel))
    }

    fn flag(&self, channel: Channel) -> &AtomicBool {
        match channel {
            Channel::Acknowledged => &self.acknowledged,
            Channel::Durable => &self.durable,
        }
    }

    /// Set the flag for `channel`. Returns `true` only for the first call.
    pub(crate) fn mark(&self, channel: Channel) -> bool {
        !self.flag(channel).swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_set(&self, channel: Channel) -> bool {
        self.flag(channel).load(Ordering::Acquire)
    }

    pub(crate) fn subscribes(&self, channel: Channel) -> bool {
        self.options.subscribes(channel)
    }

    pub(crate) fn notify(&self, channel: Channel, handle: Handle) {
        match channel {
            Channel::Acknowledged => self.handler.on_acknowledged(handle),
            Channel::Durable => self.handler.on_durable(handle),
        }
    }
}

/// One in-flight asynchronous operation.
///
/// Two completions are equal when they were assigned the same handle.
/// Equality is only meaningful among live completions: handles are reused
/// after release, so a released completion may compare equal to a later one
/// holding the same handle. Completions without notifications have no handle
/// and are equal only to themselves.
///
/// Releasing is idempotent and also happens on drop. Release waits for
/// in-progress waits to return, so do not release a completion from inside
/// its own handler while another thread waits on it. A handler may query its
/// own completion even while a release from another thread is pending.
pub struct Completion {
    state: Arc<CompletionState>,
    /// Handle assigned at construction. Identity for `Eq`/`Hash`.
    id: Option<Handle>,
    native: RwLock<Option<NativeCompletion>>,
    backend: Arc<dyn NativeAio>,
    registry: Option<Arc<CompletionRegistry>>,
}

impl Completion {
    /// Create a completion on `backend` with a no-op handler.
    pub fn new(backend: Arc<dyn NativeAio>, options: CompletionOptions) -> Result<Self> {
        Self::with_handler(backend, options, NoopHandler)
    }

    /// Create a completion whose notifications go to `handler`.
    ///
    /// When any notification is requested the completion registers in the
    /// process-wide registry, installing it if needed.
    pub fn with_handler(
        backend: Arc<dyn NativeAio>,
        options: CompletionOptions,
        handler: impl CompletionHandler,
    ) -> Result<Self> {
        let state = Arc::new(CompletionState::new(options, Box::new(handler)));

        let (registry, context) = if options.wants_callbacks() {
            let registry = registry::install();
            let handle = registry.register(&state)?;
            (Some(registry), handle.context())
        } else {
            (None, CallbackContext::NONE)
        };

        let on_complete = options
            .notify_on_acknowledged
            .then_some(dispatch::acknowledged_trampoline as Trampoline);
        let on_safe = options
            .notify_on_durable
            .then_some(dispatch::durable_trampoline as Trampoline);

        let native = match backend.create_completion(context, on_complete, on_safe) {
            Ok(native) => native,
            Err(code) => {
                if let (Some(registry), Some(handle)) = (&registry, state.take_handle()) {
                    registry.unregister(handle);
                }
                metrics::COMPLETION_CREATE_FAILURES.increment();
                return Err(RadosError::from_code(code, "Failed to create completion"));
            }
        };

        let id = state.handle();
        metrics::COMPLETIONS_CREATED.increment();
        metrics::COMPLETIONS_ACTIVE.increment();
        debug!(
            handle = id.map(Handle::get).unwrap_or(Handle::SENTINEL),
            acknowledged = options.notify_on_acknowledged,
            durable = options.notify_on_durable,
            "completion created"
        );

        Ok(Self {
            state,
            id,
            native: RwLock::new(Some(native)),
            backend,
            registry,
        })
    }

    /// The live registry handle. `None` without notifications or once released.
    pub fn handle(&self) -> Option<Handle> {
        self.state.handle()
    }

    pub fn options(&self) -> CompletionOptions {
        self.state.options
    }

    /// Whether the acknowledged notification has been delivered.
    pub fn is_acknowledged(&self) -> bool {
        self.state.is_set(Channel::Acknowledged)
    }

    /// Whether the durable notification has been delivered.
    pub fn is_durable(&self) -> bool {
        self.state.is_set(Channel::Durable)
    }

    /// Block until the operation is in memory on all replicas.
    ///
    /// Fails only if the wait itself fails; the operation's own outcome is
    /// reported by [`return_value`](Self::return_value).
    pub fn wait_for_acknowledged(&self) -> Result<()> {
        self.with_native(|backend, native| {
            check(
                backend.wait_for_complete(native),
                "Failed to wait for AIO completion",
            )
        })??;
        Ok(())
    }

    /// Block until the operation is on stable storage on all replicas.
    pub fn wait_for_durable(&self) -> Result<()> {
        self.with_native(|backend, native| {
            check(
                backend.wait_for_safe(native),
                "Failed to wait for AIO safe",
            )
        })??;
        Ok(())
    }

    /// Poll the native layer for acknowledgement.
    pub fn is_complete(&self) -> Result<bool> {
        self.with_native(|backend, native| backend.is_complete(native))
    }

    /// Poll the native layer for durability.
    pub fn is_safe(&self) -> Result<bool> {
        self.with_native(|backend, native| backend.is_safe(native))
    }

    /// The operation's result once it has completed.
    pub fn return_value(&self) -> Result<i32> {
        self.with_native(|backend, native| {
            check(backend.get_return_value(native), "AIO operation failed")
        })?
    }

    pub fn is_released(&self) -> bool {
        self.native.read_recursive().is_none()
    }

    /// Release the native completion and unregister the handle.
    ///
    /// Safe from any thread; only the first call has an effect. Callbacks
    /// that arrive afterwards are dropped.
    pub fn release(&self) {
        let Some(native) = self.native.write().take() else {
            return;
        };

        if let Some(handle) = self.state.take_handle()
            && let Some(registry) = &self.registry
        {
            registry.unregister(handle);
        }

        self.backend.release_completion(native);

        metrics::COMPLETIONS_RELEASED.increment();
        metrics::COMPLETIONS_ACTIVE.decrement();
        debug!(
            handle = self.id.map(Handle::get).unwrap_or(Handle::SENTINEL),
            "completion released"
        );
    }

    /// Run `f` with the native completion, holding it against release.
    ///
    /// Recursive reads do not queue behind a pending release, so a handler
    /// running under a blocked wait can still get in.
    pub(crate) fn with_native<R>(
        &self,
        f: impl FnOnce(&dyn NativeAio, NativeCompletion) -> R,
    ) -> Result<R> {
        let guard = self.native.read_recursive();
        let native = (*guard).ok_or(RadosError::Released)?;
        Ok(f(self.backend.as_ref(), native))
    }

    pub(crate) fn same_backend(&self, backend: &Arc<dyn NativeAio>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.backend), Arc::as_ptr(backend))
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.release();
    }
}

impl PartialEq for Completion {
    fn eq(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => Arc::ptr_eq(&self.state, &other.state),
            _ => false,
        }
    }
}

impl Eq for Completion {}

impl Hash for Completion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.id {
            Some(handle) => handle.hash(state),
            None => Arc::as_ptr(&self.state).addr().hash(state),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("options", &self.state.options)
            .field("acknowledged", &self.is_acknowledged())
            .field("durable", &self.is_durable())
            .field("released", &self.is_released())
            .finish()
    }
}
