//! Notification extension points.
//!
//! Handlers run on a thread owned by the native library. Keep them short;
//! [`ForwardingHandler`] moves the notification onto a caller-owned thread
//! through a channel.

use std::fmt;

use crate::handle::Handle;

/// The two independent notification channels of a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// In memory on all replicas ("complete" in librados terms).
    Acknowledged,
    /// On stable storage on all replicas ("safe" in librados terms).
    Durable,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Acknowledged => write!(f, "acknowledged"),
            Channel::Durable => write!(f, "durable"),
        }
    }
}

/// Callbacks invoked at most once per channel for a completion.
///
/// There is no ordering between the two channels: durable may arrive before
/// acknowledged. The completion's flag is already set when the method runs.
/// A panic inside a handler is caught and logged; it never reaches the
/// native library.
pub trait CompletionHandler: Send + Sync + 'static {
    fn on_acknowledged(&self, handle: Handle) {
        let _ = handle;
    }

    fn on_durable(&self, handle: Handle) {
        let _ = handle;
    }
}

/// Handler that ignores both notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl CompletionHandler for NoopHandler {}

/// A notification forwarded off the native thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub handle: Handle,
    pub channel: Channel,
}

/// Sends every notification over a channel and returns immediately.
pub struct ForwardingHandler {
    tx: crossbeam_channel::Sender<CompletionEvent>,
}

impl ForwardingHandler {
    pub fn new(tx: crossbeam_channel::Sender<CompletionEvent>) -> Self {
        Self { tx }
    }

    /// Creates a handler together with an unbounded receiver.
    pub fn unbounded() -> (Self, crossbeam_channel::Receiver<CompletionEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    fn forward(&self, handle: Handle, channel: Channel) {
        // A dropped receiver means nobody is listening any more.
        if self.tx.send(CompletionEvent { handle, channel }).is_err() {
            tracing::debug!(%handle, %channel, "completion event receiver dropped");
        }
    }
}

impl CompletionHandler for ForwardingHandler {
    fn on_acknowledged(&self, handle: Handle) {
        self.forward(handle, Channel::Acknowledged);
    }

    fn on_durable(&self, handle: Handle) {
        self.forward(handle, Channel::Durable);
    }
}
