//! Object type descriptors.
//!
//! Every object belongs to exactly one [`ObjectType`]. The type carries the
//! default pool, behavior flags, the teardown callback run when an instance
//! is freed, and a live-instance counter. Types are registered once with
//! `Registry::register_type` and are objects in their own right.

use std::any::TypeId;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::flags::{ObjectFlags, PoolPolicy};
use crate::object::ObjectId;
use crate::registry::RegistryInner;

/// Teardown callback: receives the body and the object's creation flags.
pub type TeardownFn = dyn Fn(&mut ObjectBody<'_>, ObjectFlags) + Send + Sync;

/// Descriptor shared by all objects of one kind.
pub struct ObjectType {
    name: String,
    pool: Option<PoolPolicy>,
    flags: ObjectFlags,
    teardown: Option<Box<TeardownFn>>,
    live: AtomicUsize,
}

impl ObjectType {
    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default pool, if the type pins one.
    #[must_use]
    pub const fn pool_policy(&self) -> Option<PoolPolicy> {
        self.pool
    }

    /// Type behavior flags.
    #[must_use]
    pub const fn flags(&self) -> ObjectFlags {
        self.flags
    }

    /// Returns `true` if instances are always torn down by the deferred
    /// worker.
    #[must_use]
    pub const fn requires_low_context_teardown(&self) -> bool {
        self.flags.contains(ObjectFlags::REQUIRES_LOW_CONTEXT_TEARDOWN)
    }

    /// Returns `true` if a teardown callback is installed.
    #[must_use]
    pub const fn has_teardown(&self) -> bool {
        self.teardown.is_some()
    }

    /// Number of instances created and not yet freed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn inc_live(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_live(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn run_teardown(&self, body: &mut ObjectBody<'_>, flags: ObjectFlags) {
        if let Some(teardown) = &self.teardown {
            teardown(body, flags);
        }
    }
}

impl fmt::Debug for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectType")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("flags", &self.flags)
            .field("has_teardown", &self.has_teardown())
            .field("live", &self.live_count())
            .finish()
    }
}

/// Builder for [`ObjectType`], consumed by `Registry::register_type`.
///
/// ```
/// use refob::{ObjectFlags, ObjectTypeBuilder, PoolPolicy, Registry};
///
/// let registry = Registry::new();
/// let ty = registry
///     .register_type(
///         ObjectTypeBuilder::new("Connection")
///             .pool_policy(PoolPolicy::Secondary)
///             .flags(ObjectFlags::REQUIRES_LOW_CONTEXT_TEARDOWN)
///             .teardown(|body, _flags| {
///                 if let Some(port) = body.downcast_mut::<u16>() {
///                     *port = 0;
///                 }
///             }),
///     )
///     .unwrap();
/// assert_eq!(registry.object_type(ty).unwrap().name(), "Connection");
/// ```
pub struct ObjectTypeBuilder {
    name: String,
    pool: Option<PoolPolicy>,
    flags: ObjectFlags,
    teardown: Option<Box<TeardownFn>>,
}

impl ObjectTypeBuilder {
    /// Starts a type description with no pool preference, no flags and no
    /// teardown callback.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: None,
            flags: ObjectFlags::NONE,
            teardown: None,
        }
    }

    /// Default pool for instances that do not override it.
    #[must_use]
    pub const fn pool_policy(mut self, pool: PoolPolicy) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Type behavior flags.
    #[must_use]
    pub const fn flags(mut self, flags: ObjectFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Callback run exactly once per instance, after its count reaches zero
    /// and before its body is released.
    #[must_use]
    pub fn teardown<F>(mut self, teardown: F) -> Self
    where
        F: Fn(&mut ObjectBody<'_>, ObjectFlags) + Send + Sync + 'static,
    {
        self.teardown = Some(Box::new(teardown));
        self
    }

    pub(crate) const fn raw_flags(&self) -> ObjectFlags {
        self.flags
    }

    pub(crate) fn build(self) -> ObjectType {
        ObjectType {
            name: self.name,
            pool: self.pool,
            flags: self.flags,
            teardown: self.teardown,
            live: AtomicUsize::new(0),
        }
    }
}

impl fmt::Debug for ObjectTypeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTypeBuilder")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("flags", &self.flags)
            .field("has_teardown", &self.teardown.is_some())
            .finish_non_exhaustive()
    }
}

/// Exclusive view of an object body during teardown.
///
/// Bodies created with `Registry::create` are zeroed byte blocks and are
/// reachable through [`bytes_mut`](Self::bytes_mut). Bodies created with
/// `Registry::create_with` hold a typed value reachable through
/// [`downcast_mut`](Self::downcast_mut); the value itself is dropped right
/// after the teardown callback returns.
///
/// References the body held on other objects are given back with
/// [`release`](Self::release) or [`release_deferred`](Self::release_deferred).
pub struct ObjectBody<'a> {
    id: ObjectId,
    ptr: NonNull<u8>,
    size: usize,
    value_type: Option<TypeId>,
    registry: Option<&'a RegistryInner>,
    _marker: std::marker::PhantomData<&'a mut [u8]>,
}

impl<'a> ObjectBody<'a> {
    /// # Safety
    ///
    /// `ptr` must address `size` initialized bytes (or a value of type
    /// `value_type`) that nothing else accesses for the lifetime `'a`.
    pub(crate) const unsafe fn new(
        id: ObjectId,
        ptr: NonNull<u8>,
        size: usize,
        value_type: Option<TypeId>,
        registry: Option<&'a RegistryInner>,
    ) -> Self {
        Self {
            id,
            ptr,
            size,
            value_type,
            registry,
            _marker: std::marker::PhantomData,
        }
    }

    /// Releases one reference on `other`, like `Registry::dereference`.
    ///
    /// Returns `true` if the count reached zero.
    pub fn release(&self, other: ObjectId) -> bool {
        self.registry
            .is_some_and(|registry| registry.release(other, 1, false) == Some(0))
    }

    /// Releases one reference on `other`, like
    /// `Registry::dereference_deferred`.
    pub fn release_deferred(&self, other: ObjectId) -> bool {
        self.registry
            .is_some_and(|registry| registry.release(other, 1, true) == Some(0))
    }

    /// Handle of the object being torn down.
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Body size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns `true` if the body holds a typed value.
    #[must_use]
    pub const fn is_typed(&self) -> bool {
        self.value_type.is_some()
    }

    /// The raw bytes of an untyped body; `None` for typed bodies.
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        if self.value_type.is_some() {
            return None;
        }
        // SAFETY: untyped bodies are `size` zero-initialized bytes owned by
        // this view.
        Some(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) })
    }

    /// Mutable raw bytes of an untyped body; `None` for typed bodies.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.value_type.is_some() {
            return None;
        }
        // SAFETY: as in `bytes`, and `&mut self` makes the access exclusive.
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) })
    }

    /// The typed value, if the body holds a `T`.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        if self.value_type != Some(TypeId::of::<T>()) {
            return None;
        }
        // SAFETY: the type id matches the value written at creation.
        Some(unsafe { self.ptr.cast::<T>().as_ref() })
    }

    /// Mutable access to the typed value, if the body holds a `T`.
    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        if self.value_type != Some(TypeId::of::<T>()) {
            return None;
        }
        // SAFETY: the type id matches and the view is exclusive.
        Some(unsafe { self.ptr.cast::<T>().as_mut() })
    }
}

impl fmt::Debug for ObjectBody<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("typed", &self.is_typed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let ty = ObjectTypeBuilder::new("Plain").build();
        assert_eq!(ty.name(), "Plain");
        assert_eq!(ty.pool_policy(), None);
        assert!(ty.flags().is_empty());
        assert!(!ty.has_teardown());
        assert!(!ty.requires_low_context_teardown());
        assert_eq!(ty.live_count(), 0);
    }

    #[test]
    fn test_live_count() {
        let ty = ObjectTypeBuilder::new("Counted").build();
        ty.inc_live();
        ty.inc_live();
        ty.dec_live();
        assert_eq!(ty.live_count(), 1);
    }

    #[test]
    fn test_body_views() {
        let id = ObjectId::new(0, 0, 0);
        let mut raw = [0u8; 8];
        let ptr = NonNull::new(raw.as_mut_ptr()).unwrap();
        let mut body = unsafe { ObjectBody::new(id, ptr, raw.len(), None, None) };
        assert!(!body.is_typed());
        body.bytes_mut().unwrap()[3] = 7;
        assert_eq!(body.bytes().unwrap()[3], 7);
        assert!(body.downcast_ref::<u64>().is_none());

        let mut value = 5u32;
        let ptr = NonNull::from(&mut value).cast::<u8>();
        let mut body = unsafe { ObjectBody::new(id, ptr, 4, Some(TypeId::of::<u32>()), None) };
        assert!(!body.release(id), "detached bodies release nothing");
        assert!(body.bytes().is_none());
        assert!(body.downcast_ref::<i32>().is_none());
        *body.downcast_mut::<u32>().unwrap() += 1;
        assert_eq!(value, 6);
    }
}
