//! Structured tracing for object lifecycle events.
//!
//! Compiled only with the `tracing` feature; call sites are gated the same
//! way, so a build without the feature carries no logging code at all.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};

    use ::tracing::{span, Level};

    use crate::flags::PoolPolicy;
    use crate::object::ObjectId;

    /// Identifier correlating the events of one drain of the deferred stack.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DrainId(pub u64);

    static NEXT_DRAIN_ID: AtomicU64 = AtomicU64::new(1);

    pub fn next_drain_id() -> DrainId {
        DrainId(NEXT_DRAIN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering one drain of the deferred stack.
    pub fn trace_drain(drain_id: DrainId, origin: &'static str) -> span::EnteredSpan {
        span!(Level::DEBUG, "deferred_drain", drain_id = drain_id.0, origin).entered()
    }

    /// Span covering `Registry::shutdown_all`.
    pub fn trace_shutdown(registry: u32) -> span::EnteredSpan {
        span!(Level::DEBUG, "shutdown_all", registry).entered()
    }

    pub fn log_type_registered(ty: ObjectId, name: &str) {
        ::tracing::debug!(ty = %ty, name, "type_registered");
    }

    pub fn log_object_created(id: ObjectId, type_name: &str, size: usize, pool: PoolPolicy) {
        ::tracing::trace!(id = %id, type_name, size, pool = %pool, "object_created");
    }

    pub fn log_object_freed(id: ObjectId, type_name: &str, mode: &str) {
        ::tracing::trace!(id = %id, type_name, mode, "object_freed");
    }

    pub fn log_deferred(id: ObjectId, type_name: &str, woke_worker: bool) {
        ::tracing::trace!(id = %id, type_name, woke_worker, "teardown_deferred");
    }

    pub fn log_drain_batch(objects: usize) {
        ::tracing::debug!(objects, "drain_batch");
    }

    pub fn log_worker_started(name: &str) {
        ::tracing::debug!(name, "worker_started");
    }

    pub fn log_worker_spawn_failed(error: &std::io::Error) {
        ::tracing::error!(%error, "worker_spawn_failed; deferred frees run on drain only");
    }

    pub fn log_worker_stopped(activations: u64) {
        ::tracing::debug!(activations, "worker_stopped");
    }

    pub fn log_teardown_panic(id: ObjectId, type_name: &str) {
        ::tracing::error!(id = %id, type_name, "teardown_panicked");
    }

    pub fn log_stale_handle(id: ObjectId, operation: &'static str) {
        ::tracing::error!(id = ?id, operation, "stale_object_handle");
    }

    pub fn log_underflow(id: ObjectId, count: i32, release: i32) {
        ::tracing::error!(id = %id, count, release, "reference_count_underflow");
    }

    pub fn log_allocation_failed(requested: usize, pool: PoolPolicy) {
        ::tracing::warn!(requested, pool = %pool, "allocation_failed");
    }

    pub fn log_shutdown_complete(forced: usize, drained: usize) {
        ::tracing::debug!(forced, drained, "shutdown_complete");
    }
}
