//! Trampolines invoked by the native library.
//!
//! The native library calls [`acknowledged_trampoline`] and
//! [`durable_trampoline`] on its own threads with the callback context it was
//! given at completion creation. Each trampoline decodes the handle, looks it
//! up in the installed registry, sets the completion's flag and runs its
//! handler. Anything that goes wrong is contained here: a handle that is no
//! longer registered is the normal outcome of a callback racing a release,
//! and a panicking handler is logged. Nothing unwinds into native code.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, trace, warn};

use crate::error::RadosError;
use crate::handle::CallbackContext;
use crate::handler::Channel;
use crate::metrics;
use crate::registry::{self, CompletionRegistry};

/// What a single callback invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Flag set and handler returned normally.
    Delivered,
    /// Flag set but the handler panicked; the panic was contained.
    HandlerPanicked,
    /// The channel had already fired for this completion.
    Duplicate,
    /// The completion did not subscribe to this channel.
    NotSubscribed,
    /// No live completion for the handle (released, or never registered).
    Unregistered,
    /// The context does not carry a handle.
    InvalidContext,
    /// No registry is installed.
    NoRegistry,
}

/// Native entry point for the acknowledged ("complete") channel.
///
/// # Safety
///
/// Neither argument is dereferenced; `arg` must be the context given to
/// `create_completion`. Callable from any thread.
pub unsafe extern "C" fn acknowledged_trampoline(_completion: *mut c_void, arg: *mut c_void) {
    trampoline(Channel::Acknowledged, arg);
}

/// Native entry point for the durable ("safe") channel.
///
/// # Safety
///
/// Same contract as [`acknowledged_trampoline`].
pub unsafe extern "C" fn durable_trampoline(_completion: *mut c_void, arg: *mut c_void) {
    trampoline(Channel::Durable, arg);
}

fn trampoline(channel: Channel, arg: *mut c_void) {
    let context = CallbackContext::from_ptr(arg);
    if panic::catch_unwind(|| dispatch(channel, context)).is_err() {
        error!(%channel, context = context.raw_value(), "panic escaped completion dispatch");
    }
}

/// Deliver `channel` for `context` through the installed registry.
pub fn dispatch(channel: Channel, context: CallbackContext) -> DispatchOutcome {
    match registry::installed() {
        Some(registry) => dispatch_in(&registry, channel, context),
        None => {
            metrics::CALLBACKS_UNREGISTERED.increment();
            warn!(%channel, context = context.raw_value(), "callback with no registry installed");
            DispatchOutcome::NoRegistry
        }
    }
}

/// Deliver `channel` for `context` through a specific registry.
pub fn dispatch_in(
    registry: &CompletionRegistry,
    channel: Channel,
    context: CallbackContext,
) -> DispatchOutcome {
    let Some(handle) = context.handle() else {
        warn!(%channel, context = context.raw_value(), "callback without a handle");
        return DispatchOutcome::InvalidContext;
    };

    let Some(state) = registry.lookup(handle) else {
        metrics::CALLBACKS_UNREGISTERED.increment();
        trace!(%handle, %channel, "callback for released completion");
        return DispatchOutcome::Unregistered;
    };

    if !state.subscribes(channel) {
        warn!(%handle, %channel, "callback on unsubscribed channel");
        return DispatchOutcome::NotSubscribed;
    }

    if !state.mark(channel) {
        metrics::CALLBACKS_DUPLICATE.increment();
        warn!(%handle, %channel, "duplicate callback");
        return DispatchOutcome::Duplicate;
    }

    metrics::CALLBACKS_DELIVERED.increment();
    match panic::catch_unwind(AssertUnwindSafe(|| state.notify(channel, handle))) {
        Ok(()) => DispatchOutcome::Delivered,
        Err(payload) => {
            metrics::HANDLER_PANICS.increment();
            let err = RadosError::from_panic(payload);
            error!(%handle, %channel, error = %err, "completion handler panicked");
            DispatchOutcome::HandlerPanicked
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::completion::{CompletionOptions, CompletionState};
    use crate::handle::Handle;
    use crate::handler::CompletionHandler;

    #[derive(Default)]
    struct Counting {
        acknowledged: AtomicUsize,
        durable: AtomicUsize,
    }

    impl CompletionHandler for Arc<Counting> {
        fn on_acknowledged(&self, _handle: Handle) {
            self.acknowledged.fetch_add(1, Ordering::SeqCst);
        }

        fn on_durable(&self, _handle: Handle) {
            self.durable.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl CompletionHandler for Panicking {
        fn on_acknowledged(&self, _handle: Handle) {
            panic!("handler failure");
        }
    }

    fn registered(
        registry: &CompletionRegistry,
        options: CompletionOptions,
        handler: impl CompletionHandler,
    ) -> (Arc<CompletionState>, CallbackContext) {
        let state = Arc::new(CompletionState::new(options, Box::new(handler)));
        let handle = registry.register(&state).unwrap();
        (state, handle.context())
    }

    #[test]
    fn delivers_once_per_channel() {
        let registry = CompletionRegistry::new();
        let counts = Arc::new(Counting::default());
        let (state, ctx) = registered(&registry, CompletionOptions::both(), counts.clone());

        assert_eq!(
            dispatch_in(&registry, Channel::Durable, ctx),
            DispatchOutcome::Delivered
        );
        assert!(state.is_set(Channel::Durable));
        assert!(!state.is_set(Channel::Acknowledged));

        assert_eq!(
            dispatch_in(&registry, Channel::Durable, ctx),
            DispatchOutcome::Duplicate
        );
        assert_eq!(
            dispatch_in(&registry, Channel::Acknowledged, ctx),
            DispatchOutcome::Delivered
        );

        assert_eq!(counts.durable.load(Ordering::SeqCst), 1);
        assert_eq!(counts.acknowledged.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn released_handle_is_a_no_op() {
        let registry = CompletionRegistry::new();
        let counts = Arc::new(Counting::default());
        let (state, ctx) = registered(&registry, CompletionOptions::both(), counts.clone());
        registry.unregister(ctx.handle().unwrap());

        assert_eq!(
            dispatch_in(&registry, Channel::Acknowledged, ctx),
            DispatchOutcome::Unregistered
        );
        assert!(!state.is_set(Channel::Acknowledged));
        assert_eq!(counts.acknowledged.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sentinel_context_is_rejected() {
        let registry = CompletionRegistry::new();
        assert_eq!(
            dispatch_in(&registry, Channel::Acknowledged, CallbackContext::NONE),
            DispatchOutcome::InvalidContext
        );
    }

    #[test]
    fn unsubscribed_channel_is_ignored() {
        let registry = CompletionRegistry::new();
        let counts = Arc::new(Counting::default());
        let (state, ctx) =
            registered(&registry, CompletionOptions::acknowledged(), counts.clone());

        assert_eq!(
            dispatch_in(&registry, Channel::Durable, ctx),
            DispatchOutcome::NotSubscribed
        );
        assert!(!state.is_set(Channel::Durable));
    }

    #[test]
    fn handler_panic_is_contained() {
        let registry = CompletionRegistry::new();
        let (state, ctx) = registered(&registry, CompletionOptions::both(), Panicking);

        assert_eq!(
            dispatch_in(&registry, Channel::Acknowledged, ctx),
            DispatchOutcome::HandlerPanicked
        );
        // The flag is set before the handler runs.
        assert!(state.is_set(Channel::Acknowledged));
    }

    #[test]
    fn trampolines_tolerate_unknown_contexts() {
        let bogus = CallbackContext::from_raw_value(u32::MAX as usize).into_ptr();
        unsafe {
            acknowledged_trampoline(std::ptr::null_mut(), bogus);
            durable_trampoline(std::ptr::null_mut(), std::ptr::null_mut());
        }
    }
}
