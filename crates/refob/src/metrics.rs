//! Registry counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a registry's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Objects created, including type objects.
    pub objects_created: u64,
    /// Types registered, excluding the bootstrap type.
    pub types_registered: u64,
    /// Objects torn down by the releasing caller.
    pub freed_inline: u64,
    /// Objects torn down from the deferred stack.
    pub freed_deferred: u64,
    /// Objects torn down by `shutdown_all` regardless of their count.
    pub forced_frees: u64,
    /// Times the worker woke up to drain.
    pub worker_activations: u64,
    /// Non-empty batches taken off the deferred stack.
    pub drain_batches: u64,
    /// Teardown callbacks that panicked outside the releasing caller.
    pub teardown_panics: u64,
    /// Objects currently linked in the directory.
    pub live_objects: usize,
    /// Body bytes handed out by the primary pool.
    pub primary_bytes: usize,
    /// Body bytes handed out by the secondary pool.
    pub secondary_bytes: usize,
}

impl MetricsSnapshot {
    /// Total frees of every kind.
    #[must_use]
    pub const fn objects_freed(&self) -> u64 {
        self.freed_inline + self.freed_deferred + self.forced_frees
    }
}

#[derive(Debug, Default)]
pub struct RegistryMetrics {
    pub objects_created: AtomicU64,
    pub types_registered: AtomicU64,
    pub freed_inline: AtomicU64,
    pub freed_deferred: AtomicU64,
    pub forced_frees: AtomicU64,
    pub worker_activations: AtomicU64,
    pub drain_batches: AtomicU64,
    pub teardown_panics: AtomicU64,
}

impl RegistryMetrics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters; gauges are filled in by the registry.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            objects_created: load(&self.objects_created),
            types_registered: load(&self.types_registered),
            freed_inline: load(&self.freed_inline),
            freed_deferred: load(&self.freed_deferred),
            forced_frees: load(&self.forced_frees),
            worker_activations: load(&self.worker_activations),
            drain_batches: load(&self.drain_batches),
            teardown_panics: load(&self.teardown_panics),
            ..MetricsSnapshot::default()
        }
    }
}
