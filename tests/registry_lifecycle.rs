#![cfg(not(feature = "loom"))]

//! Registry-wide assertions. Kept to a single test so nothing else in this
//! process registers concurrently.

use std::collections::HashSet;
use std::ptr;
use std::sync::Arc;
use std::thread;

use rados_aio::config::ClusterConfig;
use rados_aio::dispatch::{self, DispatchOutcome};
use rados_aio::native::sim::{Delivery, SimConfig, SimRados};
use rados_aio::{Channel, CompletionOptions, Rados, RadosError, registry};

#[test]
fn registry_lifecycle() {
    let sim = Arc::new(SimRados::new(SimConfig {
        delivery: Delivery::Manual,
        ..Default::default()
    }));
    let rados = Rados::create(sim.clone(), &ClusterConfig::default()).unwrap();
    let registry = registry::install();

    // 1000 completions from 8 threads, each released right away.
    let handles: Vec<u32> = thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let rados = &rados;
                s.spawn(move || {
                    (0..125)
                        .map(|_| {
                            let completion =
                                rados.completion(CompletionOptions::both()).unwrap();
                            let handle = completion.handle().unwrap();
                            completion.release();
                            handle.get()
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
    assert_eq!(handles.len(), 1000);
    assert!(handles.iter().all(|h| *h != 0));
    assert_eq!(handles.iter().collect::<HashSet<_>>().len(), 1000);
    assert!(registry.is_empty());

    let next = rados.completion(CompletionOptions::durable()).unwrap();
    let next_handle = next.handle().unwrap();
    assert_ne!(next_handle.get(), 0);
    assert!(!handles.contains(&next_handle.get()));
    assert_eq!(registry.len(), 1);
    drop(next);
    assert!(registry.is_empty());

    // A failed native allocation leaves nothing behind.
    sim.fail_next_completion(-libc::EINVAL);
    let err = rados.completion(CompletionOptions::both()).unwrap_err();
    assert!(matches!(err, RadosError::InvalidArgument { .. }));
    assert!(registry.is_empty());

    // Teardown: callbacks are dropped, live completions still unregister
    // from the registry they joined.
    let live = rados.completion(CompletionOptions::both()).unwrap();
    let context = live.handle().unwrap().context();
    let removed = registry::teardown().unwrap();
    assert!(Arc::ptr_eq(&removed, &registry));
    assert!(registry::installed().is_none());

    assert_eq!(
        dispatch::dispatch(Channel::Acknowledged, context),
        DispatchOutcome::NoRegistry
    );
    assert!(!live.is_acknowledged());

    // A reinstalled registry never hands out a handle that is still live in
    // the retired one, so the old completion's late callback cannot reach a
    // new completion.
    let fresh = registry::install();
    assert!(!Arc::ptr_eq(&fresh, &registry));
    let newer: Vec<_> = (0..16)
        .map(|_| rados.completion(CompletionOptions::both()).unwrap())
        .collect();
    for completion in &newer {
        let handle = completion.handle().unwrap();
        assert_ne!(Some(handle), live.handle());
        assert!(fresh.contains(handle));
    }

    unsafe { dispatch::acknowledged_trampoline(ptr::null_mut(), context.into_ptr()) };
    assert!(!live.is_acknowledged());
    assert!(newer.iter().all(|c| !c.is_acknowledged()));

    live.release();
    assert!(registry.is_empty());
    drop(newer);
    assert!(fresh.is_empty());

    // A second teardown/install cycle keeps counting forward.
    let last = rados.completion(CompletionOptions::both()).unwrap();
    let before = last.handle().unwrap();
    registry::teardown();
    let third = registry::install();
    let after = rados.completion(CompletionOptions::both()).unwrap();
    assert!(third.contains(after.handle().unwrap()));
    assert_ne!(after.handle(), Some(before));
}
