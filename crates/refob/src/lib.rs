//! A typed, reference-counted object manager with deferred deletion.
//!
//! `refob` is a small kernel-style object system. Callers register object
//! types, create objects of those types, and share them by reference count.
//! When the last reference goes away the type's teardown callback runs,
//! either in the releasing thread or, when that thread may not run teardown
//! code, on a background worker fed by a lock-free deferred-free stack. Every
//! live object is listed in a global directory that supports enumeration
//! and a forced teardown of everything at shutdown.
//!
//! # Features
//!
//! - **Generational handles**: an [`ObjectId`] names a header slot and the
//!   generation it was created in, so a double free is detected instead of
//!   touching released memory
//! - **Two pools**: bodies come from the global allocator or from a
//!   page-backed arena, each with an optional byte limit
//! - **Deferred deletion**: per-type, per-call or per-context deferral to a
//!   named worker thread
//! - **Types are objects**: every registered type is an instance of a
//!   bootstrap type that owns itself
//!
//! # Quick Start
//!
//! ```
//! use refob::{ObjectFlags, ObjectTypeBuilder, Registry};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let closed = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&closed);
//!
//! let registry = Registry::new();
//! let file = registry
//!     .register_type(ObjectTypeBuilder::new("File").teardown(move |body, _flags| {
//!         if let Some(path) = body.downcast_ref::<String>() {
//!             assert_eq!(path, "/tmp/log");
//!             counter.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }))
//!     .unwrap();
//!
//! let handle = registry
//!     .create_with(file, String::from("/tmp/log"), ObjectFlags::NONE, 0)
//!     .unwrap();
//! assert_eq!(registry.get_type(handle), file);
//!
//! assert!(registry.dereference(handle));
//! assert_eq!(closed.load(Ordering::SeqCst), 1);
//! ```
//!
//! # Deferred teardown
//!
//! ```
//! use refob::{ExecutionContext, ObjectFlags, ObjectTypeBuilder, Registry, RegistryConfig};
//!
//! let registry = Registry::with_config(RegistryConfig::default().with_worker(false));
//! let ty = registry.register_type(ObjectTypeBuilder::new("Timer")).unwrap();
//! let timer = registry.create(ty, 64, ObjectFlags::NONE, 0).unwrap();
//!
//! {
//!     let _irq = ExecutionContext::Interrupt.enter();
//!     // Teardown may not run here; the object is queued instead.
//!     assert!(registry.dereference(timer));
//! }
//! assert_eq!(registry.drain_deferred(), 1);
//! ```
//!
//! # Thread Safety
//!
//! [`Registry`] is `Send + Sync`; reference counting is lock-free and the
//! directory lock is held only for insertion, removal and enumeration.
//! Teardown callbacks run without any registry lock held, except during
//! [`Registry::shutdown_all`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod context;
mod deferred;
mod directory;
mod error;
mod flags;
mod header;
mod metrics;
mod object;
mod pool;
mod registry;
mod tracing;
mod types;

// Re-export public API
pub use config::{CreateHook, RegistryConfig};
pub use context::{ContextGuard, ContextPolicy, ExecutionContext, TeardownPolicy};
pub use error::{DoubleFree, ObjectError, ObjectResult};
pub use flags::{ObjectFlags, PoolPolicy};
pub use header::ObjectState;
pub use metrics::MetricsSnapshot;
pub use object::{ObjectEntry, ObjectId, ObjectRef, TypeHandle};
pub use pool::{MAX_SMALL_BODY_SIZE, SIZE_CLASSES};
pub use registry::{Registry, RAW_BODY_ALIGN};
pub use types::{ObjectBody, ObjectType, ObjectTypeBuilder, TeardownFn};
