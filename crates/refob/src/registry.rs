//! The object registry.
//!
//! A [`Registry`] owns every piece of object-manager state: the header
//! table, both body pools, the global directory, the deferred-free stack and
//! its worker thread. Handles ([`ObjectId`]) are plain indices into it.

use std::alloc::Layout;
use std::any::TypeId;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::config::RegistryConfig;
use crate::context::ExecutionContext;
use crate::deferred::{Chain, DeferredStack, DeferredWorker};
use crate::directory::Directory;
use crate::error::{DoubleFree, ObjectError, ObjectResult};
use crate::flags::{ObjectFlags, PoolPolicy};
use crate::header::{CountError, ObjectState, Slot, SlotData, SlotTable, ValueMeta, NIL};
use crate::metrics::{MetricsSnapshot, RegistryMetrics};
use crate::object::{ObjectEntry, ObjectId, ObjectRef, TypeHandle};
use crate::pool::Pools;
use crate::types::{ObjectBody, ObjectType, ObjectTypeBuilder};

/// Alignment of raw bodies created with [`Registry::create`].
pub const RAW_BODY_ALIGN: usize = 16;

const BOOTSTRAP_TYPE_NAME: &str = "Type";

static NEXT_REGISTRY_ID: AtomicU32 = AtomicU32::new(1);

/// How `free` was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreeMode {
    /// By the caller that released the last reference.
    Inline,
    /// From the deferred-free stack.
    Deferred,
    /// By `shutdown_all`, regardless of the reference count.
    Forced,
}

impl FreeMode {
    #[cfg(feature = "tracing")]
    const fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Deferred => "deferred",
            Self::Forced => "forced",
        }
    }
}

/// Everything `create` needs once arguments are validated.
struct Allocation {
    ty: Arc<ObjectType>,
    /// `None` for the bootstrap type, which owns itself.
    owning_type: Option<ObjectId>,
    layout: Layout,
    value: Option<ValueMeta>,
    flags: ObjectFlags,
    pool: PoolPolicy,
    refs: i32,
}

/// A typed, reference-counted object manager.
///
/// ```
/// use refob::{ObjectFlags, ObjectTypeBuilder, Registry};
///
/// let registry = Registry::new();
/// let ty = registry.register_type(ObjectTypeBuilder::new("Buffer")).unwrap();
///
/// let buf = registry
///     .create_with(ty, vec![1u8, 2, 3], ObjectFlags::NONE, 0)
///     .unwrap();
/// registry.reference(buf);
/// assert_eq!(registry.ref_count(buf), Some(2));
///
/// assert_eq!(registry.acquire::<Vec<u8>>(buf).unwrap().len(), 3);
///
/// assert!(!registry.dereference(buf));
/// assert!(registry.dereference(buf));
/// assert!(!registry.is_alive(buf));
/// ```
pub struct Registry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    id: u32,
    config: RegistryConfig,
    slots: SlotTable,
    directory: Directory,
    deferred: DeferredStack,
    pools: Pools,
    metrics: RegistryMetrics,
    bootstrap: ObjectId,
    worker: Option<DeferredWorker>,
    deinitializing: AtomicBool,
    shut_down: AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the bootstrap type cannot be allocated.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Registry with `config`.
    ///
    /// # Panics
    ///
    /// Panics if the bootstrap type cannot be allocated, e.g. because
    /// `max_objects` is zero. Use [`try_with_config`](Self::try_with_config)
    /// to get an error instead.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        match Self::try_with_config(config) {
            Ok(registry) => registry,
            Err(err) => panic!("failed to create the bootstrap type: {err}"),
        }
    }

    /// Registry with `config`.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the bootstrap type cannot be allocated.
    pub fn try_with_config(config: RegistryConfig) -> ObjectResult<Self> {
        let mut bootstrap_result = Ok(());
        let inner = Arc::new_cyclic(|weak| {
            let mut inner = RegistryInner::new(config);
            match inner.create_bootstrap() {
                Ok(bootstrap) => {
                    inner.bootstrap = bootstrap;
                    inner.worker = spawn_worker(&inner.config, weak);
                }
                Err(err) => {
                    // Nothing is reachable; skip the forced teardown pass.
                    inner.shut_down.store(true, Ordering::Release);
                    bootstrap_result = Err(err);
                }
            }
            inner
        });
        bootstrap_result.map(|()| Self { inner })
    }

    /// Registers a new object type.
    ///
    /// The type becomes an object of the bootstrap type with one reference
    /// owned by the registry.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the type flags contain unrecognized or
    /// creation-only bits, or if the registry was shut down.
    pub fn register_type(&self, builder: ObjectTypeBuilder) -> ObjectResult<TypeHandle> {
        builder.raw_flags().validate_type()?;
        let ty = Arc::new(builder.build());
        let bootstrap = TypeHandle(self.inner.bootstrap);
        let id = self.inner.create_typed(bootstrap, Arc::clone(&ty), ObjectFlags::NONE, 0)?;
        RegistryMetrics::bump(&self.inner.metrics.types_registered);
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_type_registered(id, ty.name());
        Ok(TypeHandle(id))
    }

    /// Creates an object with a zero-filled body of `size` bytes.
    ///
    /// The new object starts with `1 + extra_refs` references.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: unrecognized or conflicting flags, negative
    ///   `extra_refs`, a stale or foreign type handle, the bootstrap type, a
    ///   call from inside [`enumerate_all`](Self::enumerate_all), or a
    ///   registry that was shut down.
    /// - `OutOfMemory`: the header table or the selected pool is exhausted.
    ///
    /// # Panics
    ///
    /// Panics instead of returning `OutOfMemory` when `flags` contains
    /// `RAISE_ON_ALLOCATION_FAILURE`.
    pub fn create(
        &self,
        ty: TypeHandle,
        size: usize,
        flags: ObjectFlags,
        extra_refs: i32,
    ) -> ObjectResult<ObjectId> {
        let result = Layout::from_size_align(size, RAW_BODY_ALIGN)
            .map_err(|_| ObjectError::InvalidArgument("object body size is too large"))
            .and_then(|layout| {
                self.inner
                    .create_object(ty, layout, None, flags, extra_refs, |_| {})
            });
        raise_on_failure(result, flags)
    }

    /// Creates an object whose body is `value`.
    ///
    /// `value` is dropped after the type's teardown callback returns.
    ///
    /// # Errors
    ///
    /// As for [`create`](Self::create).
    ///
    /// # Panics
    ///
    /// As for [`create`](Self::create).
    pub fn create_with<T: Send + Sync + 'static>(
        &self,
        ty: TypeHandle,
        value: T,
        flags: ObjectFlags,
        extra_refs: i32,
    ) -> ObjectResult<ObjectId> {
        raise_on_failure(self.inner.create_typed(ty, value, flags, extra_refs), flags)
    }

    /// Adds one reference.
    ///
    /// # Panics
    ///
    /// Panics with a [`DoubleFree`] payload if `id` is stale (the object was
    /// already freed) or its count already reached zero.
    pub fn reference(&self, id: ObjectId) {
        self.inner.reference(id);
    }

    /// Adds one reference only if the object still has one.
    ///
    /// Returns `false`, changing nothing, if the count is zero or `id` is
    /// stale.
    pub fn reference_safe(&self, id: ObjectId) -> bool {
        self.inner.reference_safe(id)
    }

    /// Releases one reference. Returns `true` if it was the last one; the
    /// object is then freed or queued for deferred deletion.
    ///
    /// # Panics
    ///
    /// Panics with a [`DoubleFree`] payload on a double free.
    pub fn dereference(&self, id: ObjectId) -> bool {
        self.inner.release(id, 1, false) == Some(0)
    }

    /// Like [`dereference`](Self::dereference), but the object is always
    /// torn down by the deferred worker.
    ///
    /// # Panics
    ///
    /// Panics with a [`DoubleFree`] payload on a double free.
    pub fn dereference_deferred(&self, id: ObjectId) -> bool {
        self.inner.release(id, 1, true) == Some(0)
    }

    /// Releases `count` references and returns the new count.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `count` is less than one.
    ///
    /// # Panics
    ///
    /// Panics with a [`DoubleFree`] payload on a double free.
    pub fn dereference_ex(&self, id: ObjectId, count: i32, defer: bool) -> ObjectResult<i32> {
        if count < 1 {
            return Err(ObjectError::InvalidArgument(
                "release count must be at least one",
            ));
        }
        Ok(self.inner.release(id, count, defer).unwrap_or(0))
    }

    /// Type of a referenced object.
    ///
    /// # Panics
    ///
    /// Panics if `id` is stale.
    #[must_use]
    pub fn get_type(&self, id: ObjectId) -> TypeHandle {
        TypeHandle(self.inner.slot_data(id, "get_type").owning_type)
    }

    /// Descriptor of a registered type, or `None` if the handle is stale.
    #[must_use]
    pub fn object_type(&self, ty: TypeHandle) -> Option<Arc<ObjectType>> {
        self.inner.resolve_type(ty).ok()
    }

    /// The bootstrap type: the type of every type object.
    #[must_use]
    pub fn bootstrap_type(&self) -> TypeHandle {
        TypeHandle(self.inner.bootstrap)
    }

    /// Current reference count, or `None` if `id` is stale.
    #[must_use]
    pub fn ref_count(&self, id: ObjectId) -> Option<i32> {
        self.inner.slot(id)?.count(id.generation())
    }

    /// Returns `true` if the object exists and its count is positive.
    #[must_use]
    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.ref_count(id).is_some_and(|count| count > 0)
    }

    /// Lifecycle state, or `None` if `id` is stale.
    #[must_use]
    pub fn object_state(&self, id: ObjectId) -> Option<ObjectState> {
        let slot = self.inner.slot(id)?;
        let state = slot.state();
        slot.count(id.generation()).map(|_| state)
    }

    /// Takes a reference and borrows the typed body.
    ///
    /// Returns `None` if the object is gone or its body is not a `T`.
    pub fn acquire<T: Send + Sync + 'static>(&self, id: ObjectId) -> Option<ObjectRef<'_, T>> {
        let data = self.inner.acquire_data(id)?;
        if data.value.map(|meta| meta.type_id) != Some(TypeId::of::<T>()) {
            self.dereference(id);
            return None;
        }
        let value = data.block.ptr().cast::<T>();
        // SAFETY: we took a reference above and the body holds a `T`.
        Some(unsafe { ObjectRef::from_raw(self, id, value) })
    }

    /// Takes a reference and borrows a raw body created with
    /// [`create`](Self::create).
    pub fn acquire_bytes(&self, id: ObjectId) -> Option<ObjectRef<'_, [u8]>> {
        let data = self.inner.acquire_data(id)?;
        if data.value.is_some() {
            self.dereference(id);
            return None;
        }
        let bytes = NonNull::slice_from_raw_parts(data.block.ptr(), data.block.size());
        // SAFETY: we took a reference; raw bodies are only written during
        // teardown.
        Some(unsafe { ObjectRef::from_raw(self, id, bytes) })
    }

    /// Calls `f` for every live object in creation order, under the
    /// directory lock.
    ///
    /// Releasing the last reference from inside `f` is allowed: the object
    /// is handed to the deferred worker instead of being freed inline.
    /// Creating objects from inside `f` fails with `InvalidArgument`.
    pub fn enumerate_all<F>(&self, f: F)
    where
        F: FnMut(&ObjectEntry<'_>),
    {
        self.inner.enumerate(f);
    }

    /// Number of objects in the directory, type objects included.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.inner.directory.len()
    }

    /// Frees everything on the deferred stack on the calling thread and
    /// returns how many objects were freed.
    ///
    /// Returns 0 when called from inside [`enumerate_all`](Self::enumerate_all).
    ///
    /// # Panics
    ///
    /// Propagates a [`DoubleFree`] raised by a teardown callback. Other
    /// teardown panics are counted in the metrics and the drain continues.
    pub fn drain_deferred(&self) -> usize {
        self.inner.drain("explicit")
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            live_objects: self.inner.directory.len(),
            primary_bytes: self.inner.pools.in_use(PoolPolicy::Primary),
            secondary_bytes: self.inner.pools.in_use(PoolPolicy::Secondary),
            ..self.inner.metrics.snapshot()
        }
    }

    /// The configuration this registry was built with.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Returns `true` once [`shutdown_all`](Self::shutdown_all) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Stops the worker and frees every object in the directory regardless
    /// of its reference count.
    ///
    /// Afterwards `create` fails with `InvalidArgument`, and releasing
    /// handles freed here is a silent no-op. Runs at most once; dropping the
    /// registry calls it too.
    pub fn shutdown_all(&mut self) {
        self.inner.shutdown();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("id", &self.inner.id)
            .field("objects", &self.object_count())
            .field("worker", &self.inner.worker.is_some())
            .field("deferred_pending", &!self.inner.deferred.is_empty())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

fn raise_on_failure<T>(result: ObjectResult<T>, flags: ObjectFlags) -> ObjectResult<T> {
    match result {
        Err(err @ ObjectError::OutOfMemory { .. })
            if flags.contains(ObjectFlags::RAISE_ON_ALLOCATION_FAILURE) =>
        {
            panic!("object allocation failed: {err}")
        }
        other => other,
    }
}

fn spawn_worker(config: &RegistryConfig, weak: &Weak<RegistryInner>) -> Option<DeferredWorker> {
    if !config.spawn_worker {
        return None;
    }
    let weak = weak.clone();
    let drain = move || {
        weak.upgrade().is_some_and(|inner| {
            RegistryMetrics::bump(&inner.metrics.worker_activations);
            inner.drain("worker");
            true
        })
    };
    match DeferredWorker::spawn(&config.worker_name, drain) {
        Ok(worker) => Some(worker),
        Err(_err) => {
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_worker_spawn_failed(&_err);
            None
        }
    }
}

impl RegistryInner {
    fn new(config: RegistryConfig) -> Self {
        let id = NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed);
        let pools = Pools::new(
            config.limit(PoolPolicy::Primary),
            config.limit(PoolPolicy::Secondary),
        );
        Self {
            id,
            slots: SlotTable::new(config.max_objects),
            directory: Directory::new(id),
            deferred: DeferredStack::new(),
            pools,
            metrics: RegistryMetrics::default(),
            bootstrap: ObjectId::new(id, NIL, 0),
            worker: None,
            deinitializing: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            config,
        }
    }

    fn create_bootstrap(&self) -> ObjectResult<ObjectId> {
        let ty = Arc::new(ObjectTypeBuilder::new(BOOTSTRAP_TYPE_NAME).build());
        let body = Arc::clone(&ty);
        self.allocate(
            Allocation {
                pool: ty.pool_policy().unwrap_or(self.config.default_pool),
                ty,
                owning_type: None,
                layout: Layout::new::<Arc<ObjectType>>(),
                value: Some(ValueMeta::of::<Arc<ObjectType>>()),
                flags: ObjectFlags::NONE,
                refs: 1,
            },
            // SAFETY: `allocate` hands over a block laid out for the value.
            move |ptr| unsafe { ptr.cast::<Arc<ObjectType>>().as_ptr().write(body) },
        )
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    fn create_typed<T: Send + Sync + 'static>(
        &self,
        ty: TypeHandle,
        value: T,
        flags: ObjectFlags,
        extra_refs: i32,
    ) -> ObjectResult<ObjectId> {
        self.create_object(
            ty,
            Layout::new::<T>(),
            Some(ValueMeta::of::<T>()),
            flags,
            extra_refs,
            // SAFETY: `allocate` hands over a block laid out for `T`.
            move |ptr| unsafe { ptr.cast::<T>().as_ptr().write(value) },
        )
    }

    fn create_object(
        &self,
        ty: TypeHandle,
        layout: Layout,
        value: Option<ValueMeta>,
        flags: ObjectFlags,
        extra_refs: i32,
        init: impl FnOnce(NonNull<u8>),
    ) -> ObjectResult<ObjectId> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ObjectError::InvalidArgument("registry has been shut down"));
        }
        if self.directory.held_by_current_thread() {
            return Err(ObjectError::InvalidArgument(
                "objects cannot be created while enumerating the directory",
            ));
        }
        let pool_override = flags.validate_create()?;
        if extra_refs < 0 {
            return Err(ObjectError::InvalidArgument("negative extra reference count"));
        }
        let refs = extra_refs
            .checked_add(1)
            .ok_or(ObjectError::InvalidArgument("extra reference count overflows"))?;
        // Only `register_type` creates instances of the bootstrap type, and it
        // does so with a typed `Arc<ObjectType>` body.
        if ty.0 == self.bootstrap
            && value.map(|meta| meta.type_id) != Some(TypeId::of::<Arc<ObjectType>>())
        {
            return Err(ObjectError::InvalidArgument(
                "types are created with register_type",
            ));
        }
        let object_type = self.resolve_type(ty)?;
        let pool = pool_override
            .or_else(|| object_type.pool_policy())
            .unwrap_or(self.config.default_pool);

        self.allocate(
            Allocation {
                ty: object_type,
                owning_type: Some(ty.0),
                layout,
                value,
                flags,
                pool,
                refs,
            },
            init,
        )
    }

    /// Validates a type handle and returns its descriptor.
    fn resolve_type(&self, ty: TypeHandle) -> ObjectResult<Arc<ObjectType>> {
        let id = ty.0;
        if !self.reference_safe(id) {
            return Err(ObjectError::InvalidArgument("stale or foreign type handle"));
        }
        let descriptor = self.slot(id).and_then(|slot| {
            // SAFETY: we hold the reference taken above.
            let data = unsafe { slot.data() }?;
            if data.owning_type != self.bootstrap
                || data.value.map(|meta| meta.type_id) != Some(TypeId::of::<Arc<ObjectType>>())
            {
                return None;
            }
            // SAFETY: type objects hold an `Arc<ObjectType>` body.
            let body = unsafe { data.block.ptr().cast::<Arc<ObjectType>>().as_ref() };
            Some(Arc::clone(body))
        });
        self.release(id, 1, false);
        descriptor.ok_or(ObjectError::InvalidArgument("handle does not name a type"))
    }

    fn allocate(
        &self,
        request: Allocation,
        init: impl FnOnce(NonNull<u8>),
    ) -> ObjectResult<ObjectId> {
        let Allocation {
            ty,
            owning_type,
            layout,
            value,
            flags,
            pool,
            refs,
        } = request;
        let out_of_memory = || {
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_allocation_failed(layout.size(), pool);
            ObjectError::OutOfMemory {
                requested: layout.size(),
                pool,
            }
        };

        let Some(index) = self.slots.claim() else {
            return Err(out_of_memory());
        };
        let Some(slot) = self.slots.get(index) else {
            return Err(out_of_memory());
        };
        let Ok(block) = self.pools.allocate(pool, layout) else {
            self.slots.recycle(index);
            return Err(out_of_memory());
        };
        init(block.ptr());

        let id = ObjectId::new(self.id, index, slot.generation());
        let data = SlotData {
            flags,
            ty: Arc::clone(&ty),
            owning_type: owning_type.unwrap_or(id),
            block,
            value,
        };
        // SAFETY: `claim` handed us the vacant slot.
        unsafe { slot.install(data, refs) };
        self.directory.insert(index);
        ty.inc_live();
        RegistryMetrics::bump(&self.metrics.objects_created);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_object_created(id, ty.name(), layout.size(), pool);
        if let Some(hook) = &self.config.create_hook {
            hook(id, &ty);
        }
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    pub(crate) fn slot(&self, id: ObjectId) -> Option<&Slot> {
        if id.registry() != self.id {
            return None;
        }
        self.slots.get(id.index())
    }

    /// Payload of an object the caller holds a reference on.
    fn slot_data(&self, id: ObjectId, operation: &'static str) -> &SlotData {
        let data = self
            .slot(id)
            .filter(|slot| slot.count(id.generation()).is_some())
            // SAFETY: the caller holds a reference, so the payload stays put.
            .and_then(|slot| unsafe { slot.data() });
        match data {
            Some(data) => data,
            None => self.stale_handle(id, operation),
        }
    }

    fn acquire_data(&self, id: ObjectId) -> Option<&SlotData> {
        if !self.reference_safe(id) {
            return None;
        }
        // SAFETY: we hold the reference taken above.
        let data = self.slot(id).and_then(|slot| unsafe { slot.data() });
        if data.is_none() {
            self.release(id, 1, false);
        }
        data
    }

    pub(crate) fn reference(&self, id: ObjectId) {
        let Some(slot) = self.slot(id) else {
            self.stale_handle(id, "reference");
        };
        match slot.increment(id.generation()) {
            Ok(_) => {}
            Err(CountError::Stale) => {
                if !self.deinitializing.load(Ordering::Acquire) {
                    self.stale_handle(id, "reference");
                }
            }
            Err(CountError::Dead) => panic::panic_any(DoubleFree::new(
                id,
                "reference",
                "the count already reached zero (use after free)".to_string(),
            )),
            Err(CountError::Overflow | CountError::Underflow(_)) => {
                panic!("reference count overflow on object {id}")
            }
        }
    }

    pub(crate) fn reference_safe(&self, id: ObjectId) -> bool {
        self.slot(id)
            .is_some_and(|slot| slot.increment(id.generation()).is_ok())
    }

    /// Releases `n` references. Returns the new count, or `None` when a
    /// stale handle was ignored during shutdown.
    pub(crate) fn release(&self, id: ObjectId, n: i32, defer: bool) -> Option<i32> {
        let deinitializing = self.deinitializing.load(Ordering::Acquire);
        let Some(slot) = self.slot(id) else {
            if deinitializing {
                return None;
            }
            self.stale_handle(id, "dereference");
        };
        match slot.decrement(id.generation(), n) {
            Ok(0) => {
                self.last_reference_released(id, slot, defer);
                Some(0)
            }
            Ok(count) => Some(count),
            Err(CountError::Stale) if deinitializing => None,
            Err(CountError::Underflow(count)) => {
                #[cfg(feature = "tracing")]
                crate::tracing::internal::log_underflow(id, count, n);
                panic::panic_any(DoubleFree::new(
                    id,
                    "dereference",
                    format!("double free: releasing {n} with {count} outstanding"),
                ))
            }
            Err(_) => self.stale_handle(id, "dereference"),
        }
    }

    fn last_reference_released(&self, id: ObjectId, slot: &Slot, defer: bool) {
        slot.transition(ObjectState::Referenced, ObjectState::ZeroRefs);
        // SAFETY: the count reached zero on our decrement, so nobody else can
        // reach the payload until we free or queue it.
        let Some(data) = (unsafe { slot.data() }) else {
            return;
        };
        let must_defer = defer
            || data.ty.requires_low_context_teardown()
            || self.directory.held_by_current_thread()
            || self
                .config
                .policy
                .must_defer(&data.ty, ExecutionContext::current());

        if must_defer && !self.deinitializing.load(Ordering::Acquire) {
            #[cfg(feature = "tracing")]
            let type_name = data.ty.name().to_string();
            slot.set_state(ObjectState::Queued);
            let was_empty = self.deferred.push(id.index(), slot);
            let woke = was_empty && self.worker.is_some();
            if woke {
                if let Some(worker) = &self.worker {
                    worker.wake();
                }
            }
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_deferred(id, &type_name, woke);
        } else {
            self.free(id.index(), FreeMode::Inline);
        }
    }

    #[cold]
    #[track_caller]
    fn stale_handle(&self, id: ObjectId, operation: &'static str) -> ! {
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_stale_handle(id, operation);
        panic::panic_any(DoubleFree::new(
            id,
            operation,
            "the object was already freed (double free or use after free)".to_string(),
        ))
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tears down the object in slot `index`. Returns `false` if another
    /// caller already did.
    fn free(&self, index: u32, mode: FreeMode) -> bool {
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        if !slot.claim_free() {
            return false;
        }
        let id = ObjectId::new(self.id, index, slot.generation());
        if !self.deinitializing.load(Ordering::Acquire) {
            self.directory.remove(index);
        }
        // SAFETY: we won `claim_free`, and the directory no longer lists the
        // slot, so enumeration cannot be reading the payload.
        let Some(data) = (unsafe { slot.take_data() }) else {
            slot.retire();
            self.slots.recycle(index);
            return false;
        };
        let SlotData {
            flags,
            ty,
            block,
            value,
            ..
        } = data;
        ty.dec_live();

        let torn_down = panic::catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: the body is initialized and exclusively ours until the
            // block is deallocated below.
            let mut body = unsafe {
                ObjectBody::new(
                    id,
                    block.ptr(),
                    block.size(),
                    value.map(|meta| meta.type_id),
                    Some(self),
                )
            };
            ty.run_teardown(&mut body, flags);
        }));
        let dropped = value.map_or(Ok(()), |meta| {
            panic::catch_unwind(AssertUnwindSafe(|| {
                // SAFETY: the value was written at creation and is dropped
                // exactly once, here.
                unsafe { (meta.drop_fn)(block.ptr().as_ptr()) };
            }))
        });

        self.pools.deallocate(block);
        slot.retire();
        self.slots.recycle(index);

        let counter = match mode {
            FreeMode::Inline => &self.metrics.freed_inline,
            FreeMode::Deferred => &self.metrics.freed_deferred,
            FreeMode::Forced => &self.metrics.forced_frees,
        };
        RegistryMetrics::bump(counter);
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_object_freed(id, ty.name(), mode.as_str());

        if let Err(payload) = torn_down.and(dropped) {
            // Ownership violations are fatal wherever the teardown ran.
            if mode == FreeMode::Inline || payload.is::<DoubleFree>() {
                panic::resume_unwind(payload);
            }
            RegistryMetrics::bump(&self.metrics.teardown_panics);
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_teardown_panic(id, ty.name());
        }
        true
    }

    /// Frees everything on the deferred stack; returns the number freed.
    fn drain(&self, origin: &'static str) -> usize {
        if self.directory.held_by_current_thread() {
            return 0;
        }
        #[cfg(not(feature = "tracing"))]
        let _ = origin;
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_drain(
            crate::tracing::internal::next_drain_id(),
            origin,
        );

        let mut freed = 0;
        loop {
            let first = self.deferred.take_all();
            if first == NIL {
                break;
            }
            RegistryMetrics::bump(&self.metrics.drain_batches);
            let mut batch = 0;
            for (index, slot) in Chain::new(&self.slots, first) {
                if slot.transition(ObjectState::Queued, ObjectState::Draining)
                    && self.free(index, FreeMode::Deferred)
                {
                    batch += 1;
                }
            }
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_drain_batch(batch);
            freed += batch;
        }
        freed
    }

    // ------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------

    fn enumerate<F>(&self, mut f: F)
    where
        F: FnMut(&ObjectEntry<'_>),
    {
        let guard = self.directory.lock();
        for index in guard.iter() {
            let Some(slot) = self.slots.get(index) else {
                continue;
            };
            let state = slot.state();
            if matches!(state, ObjectState::Vacant | ObjectState::Freeing) {
                continue;
            }
            let generation = slot.generation();
            let Some(ref_count) = slot.count(generation) else {
                continue;
            };
            // SAFETY: the slot is linked and we hold the directory lock;
            // `free` unlinks a slot before taking its payload.
            let Some(data) = (unsafe { slot.data() }) else {
                continue;
            };
            let entry = ObjectEntry {
                id: ObjectId::new(self.id, index, generation),
                ty: TypeHandle(data.owning_type),
                type_name: data.ty.name(),
                ref_count,
                size: data.block.size(),
                flags: data.flags,
                state,
            };
            f(&entry);
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_shutdown(self.id);

        if let Some(worker) = &self.worker {
            worker.stop();
        }
        self.deinitializing.store(true, Ordering::Release);

        // Queued objects are still linked in the directory; unhook them from
        // the stack and let the forced pass free them.
        let _unhooked = Chain::new(&self.slots, self.deferred.take_all()).count();

        let mut forced = 0;
        {
            let mut guard = self.directory.lock();
            while let Some(index) = guard.pop_front() {
                if self.free(index, FreeMode::Forced) {
                    forced += 1;
                }
            }
        }
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_shutdown_complete(forced, _unhooked);
        #[cfg(not(feature = "tracing"))]
        let _ = forced;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> Registry {
        Registry::with_config(RegistryConfig::default().with_worker(false))
    }

    #[test]
    fn test_bootstrap_type_owns_itself() {
        let registry = quiet();
        let boot = registry.bootstrap_type();
        assert_eq!(registry.get_type(boot.id()), boot);
        let ty = registry.object_type(boot).unwrap();
        assert_eq!(ty.name(), "Type");
        assert_eq!(ty.live_count(), 1);
        assert_eq!(registry.object_count(), 1);
    }

    #[test]
    fn test_registered_type_is_an_object() {
        let registry = quiet();
        let ty = registry.register_type(ObjectTypeBuilder::new("Port")).unwrap();
        assert_eq!(registry.get_type(ty.id()), registry.bootstrap_type());
        assert_eq!(registry.ref_count(ty.id()), Some(1));
        let boot = registry.object_type(registry.bootstrap_type()).unwrap();
        assert_eq!(boot.live_count(), 2);
        assert_eq!(registry.metrics().types_registered, 1);
    }

    #[test]
    fn test_bootstrap_instances_only_through_register_type() {
        let registry = quiet();
        let boot = registry.bootstrap_type();
        assert!(matches!(
            registry.create(boot, 8, ObjectFlags::NONE, 0),
            Err(ObjectError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_instance_handle_is_not_a_type() {
        let registry = quiet();
        let ty = registry.register_type(ObjectTypeBuilder::new("Leaf")).unwrap();
        let leaf = registry.create(ty, 4, ObjectFlags::NONE, 0).unwrap();
        assert!(matches!(
            registry.create(TypeHandle(leaf), 4, ObjectFlags::NONE, 0),
            Err(ObjectError::InvalidArgument(_))
        ));
        // The reference taken while validating was given back.
        assert_eq!(registry.ref_count(leaf), Some(1));
    }

    #[test]
    fn test_foreign_handles_are_rejected() {
        let a = quiet();
        let b = quiet();
        let ty = a.register_type(ObjectTypeBuilder::new("Mine")).unwrap();
        assert!(b.object_type(ty).is_none());
        assert!(b.create(ty, 1, ObjectFlags::NONE, 0).is_err());
        assert!(!b.reference_safe(ty.id()));
    }

    #[test]
    fn test_free_mode_accounting() {
        let registry = quiet();
        let ty = registry.register_type(ObjectTypeBuilder::new("Tick")).unwrap();
        let a = registry.create(ty, 0, ObjectFlags::NONE, 0).unwrap();
        let b = registry.create(ty, 0, ObjectFlags::NONE, 0).unwrap();
        assert!(registry.dereference(a));
        assert!(registry.dereference_deferred(b));
        assert_eq!(registry.drain_deferred(), 1);
        let snap = registry.metrics();
        assert_eq!(snap.freed_inline, 1);
        assert_eq!(snap.freed_deferred, 1);
        assert_eq!(snap.drain_batches, 1);
    }

    #[test]
    fn test_failed_bootstrap_reports_error() {
        let config = RegistryConfig::default()
            .with_worker(false)
            .with_max_objects(0);
        assert!(matches!(
            Registry::try_with_config(config),
            Err(ObjectError::OutOfMemory { .. })
        ));
    }
}
