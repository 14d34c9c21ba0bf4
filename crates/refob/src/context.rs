//! Execution contexts and the teardown deferral policy.
//!
//! A kernel embedding decides whether a teardown may run inline by looking
//! at the caller's interrupt level. Portable code has no such thing, so the
//! level is modelled as a per-thread [`ExecutionContext`] that embedders set
//! with [`ExecutionContext::enter`], and the decision itself is delegated to
//! a [`TeardownPolicy`].

use std::cell::Cell;
use std::marker::PhantomData;

use crate::types::ObjectType;

thread_local!(static CURRENT_CONTEXT: Cell<ExecutionContext> = const {
    Cell::new(ExecutionContext::Passive)
});

/// Scheduling context of the calling thread.
///
/// Ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionContext {
    /// Ordinary thread context; arbitrary teardown code may run.
    #[default]
    Passive,
    /// Raised context (e.g. a dispatch-level callback); no blocking allowed.
    Elevated,
    /// Interrupt context; only refcount operations are legal.
    Interrupt,
}

impl ExecutionContext {
    /// Context of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT_CONTEXT.with(Cell::get)
    }

    /// Switches the calling thread into `self` until the guard is dropped.
    ///
    /// Guards nest; dropping one restores the context that was current when
    /// it was created.
    #[must_use = "the context is restored as soon as the guard is dropped"]
    pub fn enter(self) -> ContextGuard {
        let previous = CURRENT_CONTEXT.with(|c| c.replace(self));
        ContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }
}

/// Restores the previous [`ExecutionContext`] on drop.
#[derive(Debug)]
pub struct ContextGuard {
    previous: ExecutionContext,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT_CONTEXT.with(|c| c.set(self.previous));
    }
}

/// Decides whether an object whose count just reached zero must be handed to
/// the deferred-deletion worker instead of being torn down inline.
///
/// Consulted only when the caller did not already request deferral and the
/// type does not carry `REQUIRES_LOW_CONTEXT_TEARDOWN`.
pub trait TeardownPolicy: Send + Sync {
    /// Returns `true` to defer teardown of an object of type `ty`.
    fn must_defer(&self, ty: &ObjectType, context: ExecutionContext) -> bool;
}

/// Default policy: inline teardown is legal only in `Passive` context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextPolicy;

impl TeardownPolicy for ContextPolicy {
    fn must_defer(&self, _ty: &ObjectType, context: ExecutionContext) -> bool {
        context > ExecutionContext::Passive
    }
}

impl<F> TeardownPolicy for F
where
    F: Fn(&ObjectType, ExecutionContext) -> bool + Send + Sync,
{
    fn must_defer(&self, ty: &ObjectType, context: ExecutionContext) -> bool {
        self(ty, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectTypeBuilder;

    #[test]
    fn test_default_context_is_passive() {
        assert_eq!(ExecutionContext::current(), ExecutionContext::Passive);
    }

    #[test]
    fn test_guards_nest_and_restore() {
        {
            let _outer = ExecutionContext::Elevated.enter();
            assert_eq!(ExecutionContext::current(), ExecutionContext::Elevated);
            {
                let _inner = ExecutionContext::Interrupt.enter();
                assert_eq!(ExecutionContext::current(), ExecutionContext::Interrupt);
            }
            assert_eq!(ExecutionContext::current(), ExecutionContext::Elevated);
        }
        assert_eq!(ExecutionContext::current(), ExecutionContext::Passive);
    }

    #[test]
    fn test_context_is_per_thread() {
        let _guard = ExecutionContext::Interrupt.enter();
        let other = std::thread::spawn(ExecutionContext::current)
            .join()
            .unwrap();
        assert_eq!(other, ExecutionContext::Passive);
    }

    #[test]
    fn test_context_policy() {
        let ty = ObjectTypeBuilder::new("Probe").build();
        let policy = ContextPolicy;
        assert!(!policy.must_defer(&ty, ExecutionContext::Passive));
        assert!(policy.must_defer(&ty, ExecutionContext::Elevated));
        assert!(policy.must_defer(&ty, ExecutionContext::Interrupt));
    }

    #[test]
    fn test_closure_policy() {
        let ty = ObjectTypeBuilder::new("Probe").build();
        let always = |_: &ObjectType, _: ExecutionContext| true;
        assert!(always.must_defer(&ty, ExecutionContext::Passive));
    }
}
