//! Error types returned by registry operations.
//!
//! Usage errors and allocation failures are ordinary `Err` values. A double
//! free is not an error value: it means ownership has already been violated,
//! so the registry panics with a [`DoubleFree`] payload instead of returning.

use thiserror::Error;

use crate::flags::PoolPolicy;
use crate::object::ObjectId;

/// Errors returned by the fallible registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    /// The caller passed an argument the registry cannot accept: unknown
    /// flag bits, conflicting pool flags, a negative reference count, or a
    /// stale or foreign type handle.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The selected pool could not satisfy the request.
    #[error("out of memory: {requested} bytes requested from the {pool} pool")]
    OutOfMemory {
        /// Body size in bytes.
        requested: usize,
        /// Pool the body was to be carved from.
        pool: PoolPolicy,
    },
}

/// Result alias used throughout the crate.
pub type ObjectResult<T> = Result<T, ObjectError>;

/// Panic payload for an ownership violation: a release past zero, or any
/// count operation through a handle whose object was already freed.
///
/// Panics from teardown callbacks are contained when the object is freed by
/// the deferred worker or by `shutdown_all`. A `DoubleFree` raised inside a
/// teardown is never contained; it keeps unwinding out of the drain or
/// shutdown that ran the callback.
///
/// ```
/// use refob::{DoubleFree, ObjectFlags, ObjectTypeBuilder, Registry, RegistryConfig};
/// use std::panic::{self, AssertUnwindSafe};
///
/// let registry = Registry::with_config(RegistryConfig::default().with_worker(false));
/// let ty = registry.register_type(ObjectTypeBuilder::new("Once")).unwrap();
/// let obj = registry.create(ty, 0, ObjectFlags::NONE, 0).unwrap();
/// registry.dereference(obj);
///
/// let payload = panic::catch_unwind(AssertUnwindSafe(|| registry.dereference(obj)))
///     .unwrap_err();
/// assert_eq!(payload.downcast_ref::<DoubleFree>().unwrap().id(), obj);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} on object {id:?}: {detail}")]
pub struct DoubleFree {
    id: ObjectId,
    operation: &'static str,
    detail: String,
}

impl DoubleFree {
    pub(crate) const fn new(id: ObjectId, operation: &'static str, detail: String) -> Self {
        Self {
            id,
            operation,
            detail,
        }
    }

    /// Handle the violating operation was issued on.
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Name of the violating operation.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ObjectError::OutOfMemory {
            requested: 64,
            pool: PoolPolicy::Secondary,
        };
        assert_eq!(
            err.to_string(),
            "out of memory: 64 bytes requested from the secondary pool"
        );
        assert_eq!(
            ObjectError::InvalidArgument("negative extra references").to_string(),
            "invalid argument: negative extra references"
        );
    }

    #[test]
    fn test_double_free_display() {
        let err = DoubleFree::new(
            ObjectId::new(1, 4, 2),
            "dereference",
            "the object was already freed".to_string(),
        );
        assert_eq!(err.operation(), "dereference");
        assert_eq!(
            err.to_string(),
            "dereference on object ObjectId(1:4.2): the object was already freed"
        );
    }
}
