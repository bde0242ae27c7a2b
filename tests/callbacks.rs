#![cfg(not(feature = "loom"))]

use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use rados_aio::config::ClusterConfig;
use rados_aio::dispatch::{self, DispatchOutcome};
use rados_aio::native::sim::{Delivery, SimConfig, SimRados};
use rados_aio::{
    Channel, Completion, CompletionEvent, CompletionHandler, CompletionOptions, ForwardingHandler,
    Handle, Rados, registry,
};

fn session(delivery: Delivery) -> (Arc<SimRados>, Rados) {
    let sim = Arc::new(SimRados::new(SimConfig {
        delivery,
        ..Default::default()
    }));
    let rados = Rados::create(sim.clone(), &ClusterConfig::default()).unwrap();
    rados.connect().unwrap();
    (sim, rados)
}

#[derive(Clone, Default)]
struct Counting {
    acknowledged: Arc<AtomicUsize>,
    durable: Arc<AtomicUsize>,
}

impl CompletionHandler for Counting {
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
        panic!("acknowledged handler failed");
    }

    fn on_durable(&self, _handle: Handle) {
        panic!("durable handler failed");
    }
}

#[test]
fn acknowledged_trampoline_sets_only_acknowledged() {
    let (_sim, rados) = session(Delivery::Manual);
    let counts = Counting::default();
    let completion = rados
        .completion_with_handler(CompletionOptions::both(), counts.clone())
        .unwrap();
    let handle = completion.handle().unwrap();

    unsafe { dispatch::acknowledged_trampoline(ptr::null_mut(), handle.context().into_ptr()) };

    assert!(completion.is_acknowledged());
    assert!(!completion.is_durable());
    assert_eq!(counts.acknowledged.load(Ordering::SeqCst), 1);
    assert_eq!(counts.durable.load(Ordering::SeqCst), 0);
}

#[test]
fn callback_after_release_is_dropped() {
    let (_sim, rados) = session(Delivery::Manual);
    let counts = Counting::default();
    let completion = rados
        .completion_with_handler(CompletionOptions::both(), counts.clone())
        .unwrap();
    let context = completion.handle().unwrap().context();
    completion.release();

    unsafe {
        dispatch::acknowledged_trampoline(ptr::null_mut(), context.into_ptr());
        dispatch::durable_trampoline(ptr::null_mut(), context.into_ptr());
    }
    assert_eq!(
        dispatch::dispatch(Channel::Durable, context),
        DispatchOutcome::Unregistered
    );

    assert!(!completion.is_acknowledged());
    assert!(!completion.is_durable());
    assert_eq!(counts.acknowledged.load(Ordering::SeqCst), 0);
    assert_eq!(counts.durable.load(Ordering::SeqCst), 0);
}

#[test]
fn durable_may_arrive_first() {
    let (sim, rados) = session(Delivery::Manual);
    let ioctx = rados.ioctx("data").unwrap();
    let (handler, events) = ForwardingHandler::unbounded();
    let completion = rados
        .completion_with_handler(CompletionOptions::both(), handler)
        .unwrap();
    let handle = completion.handle().unwrap();

    ioctx.aio_write_full("obj", &completion, b"payload").unwrap();
    assert!(!completion.is_acknowledged());

    assert_eq!(sim.deliver(Channel::Durable), 1);
    assert!(completion.is_durable());
    assert!(!completion.is_acknowledged());

    assert_eq!(sim.deliver(Channel::Acknowledged), 1);
    assert!(completion.is_acknowledged());

    let received: Vec<CompletionEvent> = events.try_iter().collect();
    assert_eq!(
        received,
        vec![
            CompletionEvent {
                handle,
                channel: Channel::Durable
            },
            CompletionEvent {
                handle,
                channel: Channel::Acknowledged
            },
        ]
    );
}

#[test]
fn unsubscribed_channel_still_completes() {
    let (sim, rados) = session(Delivery::Manual);
    let ioctx = rados.ioctx("data").unwrap();
    let counts = Counting::default();
    let completion = rados
        .completion_with_handler(CompletionOptions::acknowledged(), counts.clone())
        .unwrap();

    ioctx.aio_append("obj", &completion, b"x").unwrap();
    sim.deliver(Channel::Acknowledged);
    sim.deliver(Channel::Durable);
    completion.wait_for_durable().unwrap();

    assert!(completion.is_acknowledged());
    assert!(!completion.is_durable());
    assert!(completion.is_safe().unwrap());
    assert_eq!(counts.acknowledged.load(Ordering::SeqCst), 1);
    assert_eq!(counts.durable.load(Ordering::SeqCst), 0);
}

#[test]
fn wait_without_notifications() {
    let (_sim, rados) = session(Delivery::AckThenDurable);
    let ioctx = rados.ioctx("data").unwrap();
    let completion = rados.completion(CompletionOptions::none()).unwrap();
    assert_eq!(completion.handle(), None);

    ioctx.aio_write_full("plain", &completion, b"data").unwrap();
    completion.wait_for_acknowledged().unwrap();
    completion.wait_for_durable().unwrap();

    assert!(completion.is_complete().unwrap());
    assert!(completion.is_safe().unwrap());
    assert_eq!(completion.return_value().unwrap(), 0);
    assert!(!completion.is_acknowledged());
    assert_eq!(ioctx.read("plain", 16, 0).unwrap(), b"data");
}

#[test]
fn waits_return_after_handlers_ran() {
    let (_sim, rados) = session(Delivery::Random);
    let ioctx = rados.ioctx("data").unwrap();

    for i in 0..50 {
        let counts = Counting::default();
        let completion = rados
            .completion_with_handler(CompletionOptions::both(), counts.clone())
            .unwrap();
        ioctx
            .aio_write_full(&format!("obj-{i}"), &completion, b"v")
            .unwrap();

        completion.wait_for_acknowledged().unwrap();
        assert!(completion.is_acknowledged());
        assert_eq!(counts.acknowledged.load(Ordering::SeqCst), 1);

        completion.wait_for_durable().unwrap();
        assert!(completion.is_durable());
        assert_eq!(counts.durable.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn notifications_from_worker_threads() {
    let (_sim, rados) = session(Delivery::Random);
    let ioctx = rados.ioctx("data").unwrap();
    let (handler_tx, events) = crossbeam_channel::unbounded();

    let completions: Vec<_> = (0..64)
        .map(|i| {
            let completion = rados
                .completion_with_handler(
                    CompletionOptions::both(),
                    ForwardingHandler::new(handler_tx.clone()),
                )
                .unwrap();
            ioctx
                .aio_append(&format!("shared-{}", i % 4), &completion, b"ab")
                .unwrap();
            completion
        })
        .collect();
    drop(handler_tx);

    for completion in &completions {
        completion.wait_for_durable().unwrap();
        completion.wait_for_acknowledged().unwrap();
        assert_eq!(completion.return_value().unwrap(), 0);
    }

    let received: Vec<CompletionEvent> = events.try_iter().collect();
    assert_eq!(received.len(), 128);
    for completion in &completions {
        let handle = completion.handle().unwrap();
        for channel in [Channel::Acknowledged, Channel::Durable] {
            let n = received
                .iter()
                .filter(|e| e.handle == handle && e.channel == channel)
                .count();
            assert_eq!(n, 1);
        }
    }

    let total: usize = (0..4)
        .map(|i| ioctx.stat(&format!("shared-{i}")).unwrap().size as usize)
        .sum();
    assert_eq!(total, 128);
}

#[test]
fn handler_panic_does_not_reach_native_thread() {
    let (_sim, rados) = session(Delivery::AckThenDurable);
    let ioctx = rados.ioctx("data").unwrap();

    let failing = rados
        .completion_with_handler(CompletionOptions::both(), Panicking)
        .unwrap();
    ioctx.aio_write_full("a", &failing, b"1").unwrap();
    failing.wait_for_durable().unwrap();
    assert!(failing.is_acknowledged());
    assert!(failing.is_durable());

    // Workers are still alive.
    let counts = Counting::default();
    let next = rados
        .completion_with_handler(CompletionOptions::both(), counts.clone())
        .unwrap();
    ioctx.aio_write_full("b", &next, b"2").unwrap();
    next.wait_for_durable().unwrap();
    assert_eq!(counts.durable.load(Ordering::SeqCst), 1);
}

#[test]
fn release_races_callbacks() {
    let (_sim, rados) = session(Delivery::Random);
    let ioctx = rados.ioctx("data").unwrap();

    // (handle, counts, whether both notifications were waited for)
    let outcomes: Vec<(Handle, Counting, bool)> = thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let rados = &rados;
                let ioctx = &ioctx;
                s.spawn(move || {
                    (0..100)
                        .map(|i| {
                            let counts = Counting::default();
                            let completion = rados
                                .completion_with_handler(CompletionOptions::both(), counts.clone())
                                .unwrap();
                            let handle = completion.handle().unwrap();
                            ioctx
                                .aio_write_full(&format!("race-{t}-{i}"), &completion, b"z")
                                .unwrap();
                            let waited = i % 2 == 1;
                            if waited {
                                completion.wait_for_acknowledged().unwrap();
                                completion.wait_for_durable().unwrap();
                            }
                            // Otherwise released while the operation may
                            // still be in flight.
                            drop(completion);
                            (handle, counts, waited)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    assert_eq!(outcomes.len(), 400);
    let distinct: HashSet<Handle> = outcomes.iter().map(|(h, _, _)| *h).collect();
    assert_eq!(distinct.len(), 400);

    let registry = registry::install();
    for (handle, counts, waited) in &outcomes {
        assert!(!registry.contains(*handle));

        let acknowledged = counts.acknowledged.load(Ordering::SeqCst);
        let durable = counts.durable.load(Ordering::SeqCst);
        if *waited {
            assert_eq!(acknowledged, 1);
            assert_eq!(durable, 1);
        } else {
            assert!(acknowledged <= 1);
            assert!(durable <= 1);
        }
    }
}

/// Reports what its own completion looked like from inside the handler.
struct SelfQuerying {
    completion: Arc<OnceLock<Weak<Completion>>>,
    seen: crossbeam_channel::Sender<(bool, Option<i32>)>,
}

impl CompletionHandler for SelfQuerying {
    fn on_acknowledged(&self, _handle: Handle) {
        if let Some(completion) = self.completion.get().and_then(Weak::upgrade) {
            let _ = self
                .seen
                .send((completion.is_released(), completion.return_value().ok()));
        }
    }
}

#[test]
fn handler_queries_completion_while_release_is_pending() {
    let (sim, rados) = session(Delivery::Manual);
    let ioctx = rados.ioctx("data").unwrap();
    let slot = Arc::new(OnceLock::new());
    let (seen_tx, seen) = crossbeam_channel::unbounded();
    let completion = Arc::new(
        rados
            .completion_with_handler(
                CompletionOptions::acknowledged(),
                SelfQuerying {
                    completion: slot.clone(),
                    seen: seen_tx,
                },
            )
            .unwrap(),
    );
    assert!(slot.set(Arc::downgrade(&completion)).is_ok());
    ioctx.aio_write_full("self", &completion, b"q").unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| completion.wait_for_acknowledged());
        thread::sleep(Duration::from_millis(50));
        // Blocks behind the waiter until the notification lands.
        let releaser = s.spawn(|| completion.release());
        thread::sleep(Duration::from_millis(50));

        assert_eq!(sim.deliver(Channel::Acknowledged), 1);
        waiter.join().unwrap().unwrap();
        releaser.join().unwrap();
    });

    assert_eq!(seen.try_recv().unwrap(), (false, Some(0)));
    assert!(completion.is_acknowledged());
    assert!(completion.is_released());
}
