//! rados-aio - asynchronous completions for librados.
//!
//! librados reports the progress of an asynchronous operation by calling
//! plain C callbacks on its own threads. This crate bridges those callbacks
//! to Rust handlers: every [`Completion`] that wants notifications gets a
//! small integer [`Handle`] in a process-wide [`CompletionRegistry`], the
//! handle travels through the native library as the opaque callback
//! argument, and the [`dispatch`] trampolines resolve it back to the live
//! completion. A callback that arrives after its completion was released
//! finds nothing and is dropped.
//!
//! ```ignore
//! use std::sync::Arc;
//! use rados_aio::{CompletionOptions, ForwardingHandler, Rados};
//! use rados_aio::config::Config;
//! use rados_aio::native::sim::SimRados;
//!
//! let config = Config::default();
//! let rados = Rados::create(Arc::new(SimRados::new(config.sim.clone())), &config.cluster)?;
//! rados.connect()?;
//! let ioctx = rados.ioctx("data")?;
//!
//! let (handler, events) = ForwardingHandler::unbounded();
//! let completion = rados.completion_with_handler(CompletionOptions::both(), handler)?;
//! ioctx.aio_write_full("greeting", &completion, b"hello")?;
//! completion.wait_for_durable()?;
//! completion.return_value()?;
//! ```

pub mod cluster;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod handler;
pub mod ioctx;
pub mod metrics;
pub mod native;
pub mod registry;

pub mod logging;

mod sync;

pub use cluster::Rados;
pub use completion::{Completion, CompletionOptions};
pub use config::Config;
pub use error::{RadosError, Result};
pub use handle::Handle;
pub use handler::{Channel, CompletionEvent, CompletionHandler, ForwardingHandler, NoopHandler};
pub use ioctx::IoCtx;
pub use registry::CompletionRegistry;
