//! Object handles.
//!
//! An [`ObjectId`] is a plain `Copy` handle: it names a slot in the
//! registry's header table plus the generation the slot had when the object
//! was created. Holding an `ObjectId` does not keep the object alive; the
//! reference count does. [`ObjectRef`] is the RAII flavour that owns one
//! counted reference.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::flags::ObjectFlags;
use crate::header::ObjectState;
use crate::registry::Registry;

/// Handle to an object managed by a [`Registry`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    registry: u32,
    index: u32,
    generation: u32,
}

impl ObjectId {
    pub(crate) const fn new(registry: u32, index: u32, generation: u32) -> Self {
        Self {
            registry,
            index,
            generation,
        }
    }

    pub(crate) const fn registry(self) -> u32 {
        self.registry
    }

    /// Header slot index. Slots are recycled after an object is freed.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this object was created.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}:{}.{})", self.registry, self.index, self.generation)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Handle to a registered object type.
///
/// Types are objects themselves (instances of the registry's bootstrap
/// type), so a `TypeHandle` is an [`ObjectId`] with a stronger promise about
/// what lives in the slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeHandle(pub(crate) ObjectId);

impl TypeHandle {
    /// The type's own object handle, usable with `reference`/`dereference`.
    #[must_use]
    pub const fn id(self) -> ObjectId {
        self.0
    }
}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHandle({:?})", self.0)
    }
}

/// Snapshot of one directory entry, handed to `Registry::enumerate_all`.
#[derive(Debug, Clone, Copy)]
pub struct ObjectEntry<'a> {
    pub(crate) id: ObjectId,
    pub(crate) ty: TypeHandle,
    pub(crate) type_name: &'a str,
    pub(crate) ref_count: i32,
    pub(crate) size: usize,
    pub(crate) flags: ObjectFlags,
    pub(crate) state: ObjectState,
}

impl<'a> ObjectEntry<'a> {
    /// Object handle.
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Owning type.
    #[must_use]
    pub const fn object_type(&self) -> TypeHandle {
        self.ty
    }

    /// Name of the owning type.
    #[must_use]
    pub const fn type_name(&self) -> &'a str {
        self.type_name
    }

    /// Reference count observed while the directory lock was held.
    #[must_use]
    pub const fn ref_count(&self) -> i32 {
        self.ref_count
    }

    /// Body size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Flags the object was created with.
    #[must_use]
    pub const fn flags(&self) -> ObjectFlags {
        self.flags
    }

    /// Lifecycle state observed while the directory lock was held.
    #[must_use]
    pub const fn state(&self) -> ObjectState {
        self.state
    }
}

/// One counted reference to a typed object body.
///
/// Obtained from `Registry::acquire` (typed bodies) or
/// `Registry::acquire_bytes` (raw bodies). Cloning takes another reference;
/// dropping releases one with `Registry::dereference`.
pub struct ObjectRef<'r, T: ?Sized + Send + Sync + 'static> {
    registry: &'r Registry,
    id: ObjectId,
    value: NonNull<T>,
    _marker: PhantomData<&'r T>,
}

impl<'r, T: ?Sized + Send + Sync + 'static> ObjectRef<'r, T> {
    /// # Safety
    ///
    /// The caller must own one reference on `id`, and `value` must point to
    /// the initialized `T` body of that object.
    pub(crate) const unsafe fn from_raw(
        registry: &'r Registry,
        id: ObjectId,
        value: NonNull<T>,
    ) -> Self {
        Self {
            registry,
            id,
            value,
            _marker: PhantomData,
        }
    }

    /// Handle of the referenced object.
    #[must_use]
    pub const fn id(this: &Self) -> ObjectId {
        this.id
    }

    /// Gives up the RAII wrapper without releasing the reference.
    ///
    /// The caller becomes responsible for one `dereference` call.
    #[must_use]
    pub fn into_id(this: Self) -> ObjectId {
        let id = this.id;
        std::mem::forget(this);
        id
    }
}

impl<T: ?Sized + Send + Sync + 'static> Deref for ObjectRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we own a reference, so the body stays allocated and
        // initialized until `drop` releases it.
        unsafe { self.value.as_ref() }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Clone for ObjectRef<'_, T> {
    fn clone(&self) -> Self {
        self.registry.reference(self.id);
        Self {
            registry: self.registry,
            id: self.id,
            value: self.value,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Drop for ObjectRef<'_, T> {
    fn drop(&mut self) {
        self.registry.dereference(self.id);
    }
}

impl<T: ?Sized + Send + Sync + fmt::Debug + 'static> fmt::Debug for ObjectRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.id)
            .field("value", &&**self)
            .finish()
    }
}

// SAFETY: the body is shared between reference holders on any thread; `T`
// is `Send + Sync` and the registry itself is `Sync`.
unsafe impl<T: ?Sized + Send + Sync + 'static> Send for ObjectRef<'_, T> {}
// SAFETY: see above.
unsafe impl<T: ?Sized + Send + Sync + 'static> Sync for ObjectRef<'_, T> {}
