//! Concurrent reference counting: exactly one teardown no matter how many
//! threads race on the final release.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use refob::{ObjectFlags, ObjectTypeBuilder, Registry, RegistryConfig};

fn manual() -> Registry {
    Registry::with_config(RegistryConfig::default().with_worker(false))
}

fn race_final_release(releasers: usize, deferred: bool) {
    let registry = manual();
    let torn_down = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&torn_down);
    let ty = registry
        .register_type(ObjectTypeBuilder::new("Contended").teardown(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    let extra = i32::try_from(releasers - 1).unwrap();
    let obj = registry.create(ty, 64, ObjectFlags::NONE, extra).unwrap();
    let barrier = Barrier::new(releasers);
    let last = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..releasers {
            s.spawn(|| {
                barrier.wait();
                let freed = if deferred {
                    registry.dereference_deferred(obj)
                } else {
                    registry.dereference(obj)
                };
                if freed {
                    last.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    registry.drain_deferred();
    assert_eq!(last.load(Ordering::SeqCst), 1, "exactly one release saw zero");
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    assert!(registry.ref_count(obj).is_none());
}

#[test]
fn test_two_releasers() {
    race_final_release(2, false);
}

#[test]
fn test_eight_releasers() {
    race_final_release(8, false);
}

#[test]
fn test_sixty_four_releasers() {
    race_final_release(64, false);
}

#[test]
fn test_sixty_four_deferred_releasers() {
    race_final_release(64, true);
}

#[test]
fn test_reference_safe_races_final_release() {
    for _ in 0..50 {
        let registry = manual();
        let ty = registry.register_type(ObjectTypeBuilder::new("Racy")).unwrap();
        let obj = registry.create(ty, 0, ObjectFlags::NONE, 0).unwrap();

        let acquired = thread::scope(|s| {
            let taker = s.spawn(|| registry.reference_safe(obj));
            let releaser = s.spawn(|| registry.dereference_deferred(obj));
            let acquired = taker.join().unwrap();
            let _ = releaser.join().unwrap();
            acquired
        });

        if acquired {
            // The safe reference won; the object is alive until it is given back.
            assert_eq!(registry.ref_count(obj), Some(1));
            assert!(registry.dereference_deferred(obj));
        }
        assert_eq!(registry.drain_deferred(), 1);
        assert!(registry.ref_count(obj).is_none());
    }
}

#[test]
fn test_parallel_create_and_release() {
    let registry = manual();
    let torn_down = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&torn_down);
    let ty = registry
        .register_type(ObjectTypeBuilder::new("Churn").teardown(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    thread::scope(|s| {
        for worker in 0..8 {
            let registry = &registry;
            s.spawn(move || {
                for i in 0..500 {
                    let flags = if (worker + i) % 2 == 0 {
                        ObjectFlags::USE_SECONDARY_POOL
                    } else {
                        ObjectFlags::NONE
                    };
                    let obj = registry.create(ty, 48, flags, 1).unwrap();
                    registry.reference(obj);
                    registry.dereference(obj);
                    registry.dereference(obj);
                    if i % 3 == 0 {
                        registry.dereference_deferred(obj);
                    } else {
                        registry.dereference(obj);
                    }
                }
            });
        }
    });

    registry.drain_deferred();
    assert_eq!(torn_down.load(Ordering::SeqCst), 8 * 500);
    let metrics = registry.metrics();
    assert_eq!(metrics.live_objects, 2, "only the bootstrap and Churn types remain");
    assert_eq!(metrics.secondary_bytes, 0);
    assert_eq!(registry.object_type(ty).unwrap().live_count(), 0);
}
