//! Completion lifecycle and dispatch metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "completions_created",
    description = "Total number of completions created"
)]
pub static COMPLETIONS_CREATED: Counter = Counter::new();

#[metric(
    name = "completions_released",
    description = "Total number of completions released"
)]
pub static COMPLETIONS_RELEASED: Counter = Counter::new();

#[metric(
    name = "completions_active",
    description = "Number of completions created but not yet released"
)]
pub static COMPLETIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "completion_create_failures",
    description = "Native completion allocations that failed"
)]
pub static COMPLETION_CREATE_FAILURES: Counter = Counter::new();

#[metric(
    name = "callbacks_delivered",
    description = "Notifications delivered to a live completion"
)]
pub static CALLBACKS_DELIVERED: Counter = Counter::new();

#[metric(
    name = "callbacks_unregistered",
    description = "Notifications dropped because the handle was no longer registered"
)]
pub static CALLBACKS_UNREGISTERED: Counter = Counter::new();

#[metric(
    name = "callbacks_duplicate",
    description = "Notifications dropped because the channel had already fired"
)]
pub static CALLBACKS_DUPLICATE: Counter = Counter::new();

#[metric(
    name = "handler_panics",
    description = "Completion handlers that panicked on a native thread"
)]
pub static HANDLER_PANICS: Counter = Counter::new();
