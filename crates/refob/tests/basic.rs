//! Basic lifecycle tests: creation, counting, immediate teardown.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use refob::{
    DoubleFree, ObjectFlags, ObjectId, ObjectRef, ObjectState, ObjectTypeBuilder, Registry,
    RegistryConfig,
};

fn registry() -> Registry {
    Registry::with_config(RegistryConfig::default().with_worker(false))
}

fn counting_type(registry: &Registry, name: &str) -> (refob::TypeHandle, Arc<AtomicUsize>) {
    let torn_down = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&torn_down);
    let ty = registry
        .register_type(ObjectTypeBuilder::new(name).teardown(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    (ty, torn_down)
}

/// Runs `f`, which must panic with a `DoubleFree` payload.
fn double_free_of(f: impl FnOnce()) -> DoubleFree {
    let payload = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_err();
    *payload.downcast::<DoubleFree>().unwrap()
}

#[test]
fn test_create_reference_dereference_scenario() {
    let registry = registry();
    let (ty, torn_down) = counting_type(&registry, "Scenario");

    let obj = registry.create(ty, 32, ObjectFlags::NONE, 0).unwrap();
    assert_eq!(registry.ref_count(obj), Some(1));
    assert_eq!(registry.get_type(obj), ty);

    registry.reference(obj);
    assert_eq!(registry.ref_count(obj), Some(2));

    assert!(!registry.dereference(obj));
    assert_eq!(registry.ref_count(obj), Some(1));
    assert_eq!(torn_down.load(Ordering::SeqCst), 0);

    assert!(registry.dereference(obj));
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    assert_eq!(registry.ref_count(obj), None);
    assert!(!registry.is_alive(obj));

    let err = double_free_of(|| {
        registry.dereference(obj);
    });
    assert_eq!(err.id(), obj);
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
}

#[test]
fn test_double_free_is_fatal() {
    let registry = registry();
    let ty = registry.register_type(ObjectTypeBuilder::new("Once")).unwrap();
    let obj = registry.create(ty, 8, ObjectFlags::NONE, 0).unwrap();
    assert!(registry.dereference(obj));

    let err = double_free_of(|| {
        registry.dereference(obj);
    });
    assert_eq!(err.operation(), "dereference");
    assert!(err.to_string().contains("already freed"));
}

#[test]
fn test_release_past_zero_is_fatal() {
    let registry = registry();
    let ty = registry.register_type(ObjectTypeBuilder::new("Twice")).unwrap();
    let obj = registry.create(ty, 8, ObjectFlags::NONE, 1).unwrap();

    let err = double_free_of(|| {
        let _ = registry.dereference_ex(obj, 3, false);
    });
    assert_eq!(err.id(), obj);
    assert!(err.to_string().contains("double free"));
    assert_eq!(registry.ref_count(obj), Some(2), "the refused release changed nothing");
}

#[test]
fn test_reference_after_free_is_fatal() {
    let registry = registry();
    let ty = registry.register_type(ObjectTypeBuilder::new("Gone")).unwrap();
    let obj = registry.create(ty, 8, ObjectFlags::NONE, 0).unwrap();
    registry.dereference(obj);

    let err = double_free_of(|| registry.reference(obj));
    assert_eq!(err.operation(), "reference");
}

#[test]
fn test_balanced_sequence_tears_down_once() {
    let registry = registry();
    let (ty, torn_down) = counting_type(&registry, "Balanced");

    let obj = registry.create(ty, 0, ObjectFlags::NONE, 2).unwrap();
    assert_eq!(registry.ref_count(obj), Some(3));
    for _ in 0..5 {
        registry.reference(obj);
    }
    assert_eq!(registry.ref_count(obj), Some(8));
    for _ in 0..7 {
        assert!(!registry.dereference(obj));
    }
    assert_eq!(torn_down.load(Ordering::SeqCst), 0);
    assert!(registry.dereference(obj));
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dereference_ex_returns_new_count() {
    let registry = registry();
    let (ty, torn_down) = counting_type(&registry, "Batch");
    let obj = registry.create(ty, 0, ObjectFlags::NONE, 4).unwrap();

    assert_eq!(registry.dereference_ex(obj, 2, false), Ok(3));
    assert_eq!(registry.dereference_ex(obj, 3, false), Ok(0));
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reference_safe_at_zero_does_not_mutate() {
    let registry = registry();
    let ty = registry.register_type(ObjectTypeBuilder::new("Lazy")).unwrap();
    let obj = registry.create(ty, 0, ObjectFlags::NONE, 0).unwrap();

    assert!(registry.reference_safe(obj));
    assert_eq!(registry.ref_count(obj), Some(2));
    registry.dereference(obj);

    // Park the object at zero on the deferred stack.
    assert!(registry.dereference_deferred(obj));
    assert_eq!(registry.ref_count(obj), Some(0));
    assert_eq!(registry.object_state(obj), Some(ObjectState::Queued));
    assert!(!registry.reference_safe(obj));
    assert_eq!(registry.ref_count(obj), Some(0));

    assert_eq!(registry.drain_deferred(), 1);
    assert!(!registry.reference_safe(obj), "freed handles are refused too");
}

#[test]
fn test_raw_body_is_zeroed_and_visible_to_teardown() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let registry = registry();
    let ty = registry
        .register_type(ObjectTypeBuilder::new("Raw").teardown(move |body, _| {
            let size = body.size();
            let bytes = body.bytes_mut().unwrap();
            bytes[0] = 0xFF;
            let zeros = bytes.iter().filter(|&&b| b == 0).count();
            sink.lock().unwrap().push((size, zeros));
        }))
        .unwrap();

    let obj = registry.create(ty, 100, ObjectFlags::NONE, 0).unwrap();
    {
        let bytes = registry.acquire_bytes(obj).unwrap();
        assert_eq!(bytes.len(), 100);
        assert!(bytes.iter().all(|&b| b == 0));
        assert!(registry.acquire::<u32>(obj).is_none());
    }
    assert_eq!(registry.ref_count(obj), Some(1));
    registry.dereference(obj);
    assert_eq!(*seen.lock().unwrap(), vec![(100, 99)]);
}

#[test]
fn test_typed_body_is_dropped_after_teardown() {
    struct Tracked(Arc<Mutex<Vec<&'static str>>>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.lock().unwrap().push("drop");
        }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = registry();
    let ty = registry
        .register_type(ObjectTypeBuilder::new("Tracked").teardown(|body, _| {
            let tracked = body.downcast_ref::<Tracked>().unwrap();
            tracked.0.lock().unwrap().push("teardown");
        }))
        .unwrap();

    let obj = registry
        .create_with(ty, Tracked(Arc::clone(&log)), ObjectFlags::NONE, 0)
        .unwrap();
    registry.dereference(obj);
    assert_eq!(*log.lock().unwrap(), vec!["teardown", "drop"]);
}

#[test]
fn test_teardown_receives_creation_flags() {
    let flags_seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&flags_seen);
    let registry = registry();
    let ty = registry
        .register_type(ObjectTypeBuilder::new("Flagged").teardown(move |_, flags| {
            *sink.lock().unwrap() = Some(flags);
        }))
        .unwrap();
    let obj = registry
        .create(ty, 16, ObjectFlags::USE_SECONDARY_POOL, 0)
        .unwrap();
    registry.dereference(obj);
    assert_eq!(*flags_seen.lock().unwrap(), Some(ObjectFlags::USE_SECONDARY_POOL));
}

#[test]
fn test_object_ref_counts_like_a_reference() {
    let registry = registry();
    let ty = registry.register_type(ObjectTypeBuilder::new("Shared")).unwrap();
    let obj = registry
        .create_with(ty, String::from("payload"), ObjectFlags::NONE, 0)
        .unwrap();

    let first = registry.acquire::<String>(obj).unwrap();
    let second = ObjectRef::clone(&first);
    assert_eq!(registry.ref_count(obj), Some(3));
    assert_eq!(&*second, "payload");
    assert_eq!(ObjectRef::id(&second), obj);
    drop(first);
    drop(second);
    assert_eq!(registry.ref_count(obj), Some(1));

    let leaked: ObjectId = ObjectRef::into_id(registry.acquire::<String>(obj).unwrap());
    assert_eq!(registry.ref_count(leaked), Some(2));
    registry.dereference(leaked);
    assert!(registry.dereference(obj));
    assert!(registry.acquire::<String>(obj).is_none());
}

#[test]
fn test_type_live_counts() {
    let registry = registry();
    let ty = registry.register_type(ObjectTypeBuilder::new("Counted")).unwrap();
    let objects: Vec<_> = (0..4)
        .map(|_| registry.create(ty, 8, ObjectFlags::NONE, 0).unwrap())
        .collect();
    let descriptor = registry.object_type(ty).unwrap();
    assert_eq!(descriptor.live_count(), 4);
    for obj in objects {
        registry.dereference(obj);
    }
    assert_eq!(descriptor.live_count(), 0);
}

#[test]
fn test_slots_are_recycled_with_new_generation() {
    let registry = Registry::with_config(
        RegistryConfig::default()
            .with_worker(false)
            .with_max_objects(3),
    );
    let ty = registry.register_type(ObjectTypeBuilder::new("Tight")).unwrap();
    let first = registry.create(ty, 0, ObjectFlags::NONE, 0).unwrap();
    assert!(registry.create(ty, 0, ObjectFlags::NONE, 0).is_err());

    registry.dereference(first);
    let second = registry.create(ty, 0, ObjectFlags::NONE, 0).unwrap();
    assert_eq!(second.index(), first.index());
    assert_ne!(second.generation(), first.generation());
    assert_eq!(registry.ref_count(first), None);
    assert_eq!(registry.ref_count(second), Some(1));
}

#[test]
fn test_teardown_can_release_children() {
    let registry = registry();
    let (leaf, leaves_freed) = counting_type(&registry, "Leaf");
    let parent = registry
        .register_type(ObjectTypeBuilder::new("Parent").teardown(|body, _| {
            let children = body.downcast_ref::<Vec<ObjectId>>().unwrap().clone();
            for child in children {
                body.release(child);
            }
        }))
        .unwrap();

    let children: Vec<_> = (0..3)
        .map(|_| registry.create(leaf, 4, ObjectFlags::NONE, 0).unwrap())
        .collect();
    let root = registry
        .create_with(parent, children.clone(), ObjectFlags::NONE, 0)
        .unwrap();

    assert!(registry.dereference(root));
    assert_eq!(leaves_freed.load(Ordering::SeqCst), 3);
    assert!(children.iter().all(|&c| !registry.is_alive(c)));
}

#[test]
fn test_create_hook_sees_every_object() {
    let created = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&created);
    let registry = Registry::with_config(
        RegistryConfig::default()
            .with_worker(false)
            .with_create_hook(move |id, ty| sink.lock().unwrap().push((id, ty.name().to_string()))),
    );
    let ty = registry.register_type(ObjectTypeBuilder::new("Hooked")).unwrap();
    let obj = registry.create(ty, 1, ObjectFlags::NONE, 0).unwrap();

    let created = created.lock().unwrap();
    let names: Vec<&str> = created.iter().map(|(_, name)| name.as_str()).collect();
    // Bootstrap type, the registered type object, then the instance.
    assert_eq!(names, vec!["Type", "Type", "Hooked"]);
    assert_eq!(created[1].0, ty.id());
    assert_eq!(created[2].0, obj);
}
