//! Registry configuration.

use std::fmt;
use std::sync::Arc;

use crate::context::{ContextPolicy, TeardownPolicy};
use crate::flags::PoolPolicy;
use crate::object::ObjectId;
use crate::types::ObjectType;

/// Callback observing every successful creation, type objects included.
pub type CreateHook = dyn Fn(ObjectId, &ObjectType) + Send + Sync;

/// Configuration for a [`Registry`](crate::Registry).
///
/// ```
/// use refob::{PoolPolicy, Registry, RegistryConfig};
///
/// let config = RegistryConfig::default()
///     .with_default_pool(PoolPolicy::Secondary)
///     .with_secondary_limit(1 << 20)
///     .with_worker(false);
/// let registry = Registry::with_config(config);
/// assert_eq!(registry.object_count(), 1);
/// ```
#[derive(Clone)]
pub struct RegistryConfig {
    /// Pool for objects whose type and flags do not choose one.
    pub default_pool: PoolPolicy,
    /// Byte limit of the primary pool; `None` is unlimited.
    pub primary_limit: Option<usize>,
    /// Byte limit of the secondary pool; `None` is unlimited.
    pub secondary_limit: Option<usize>,
    /// Maximum number of simultaneously live objects.
    pub max_objects: u32,
    /// Spawn the deferred-deletion worker thread.
    ///
    /// Without a worker, deferred objects are freed only by
    /// `Registry::drain_deferred` and `Registry::shutdown_all`.
    pub spawn_worker: bool,
    /// Thread name of the worker.
    pub worker_name: String,
    /// Decides whether a zero-count object is torn down inline.
    pub policy: Arc<dyn TeardownPolicy>,
    /// Called after each object is created.
    pub create_hook: Option<Arc<CreateHook>>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_pool: PoolPolicy::Primary,
            primary_limit: None,
            secondary_limit: None,
            max_objects: 1 << 22,
            spawn_worker: true,
            worker_name: "refob-deferred".to_string(),
            policy: Arc::new(ContextPolicy),
            create_hook: None,
        }
    }
}

impl RegistryConfig {
    /// Sets [`default_pool`](Self::default_pool).
    #[must_use]
    pub const fn with_default_pool(mut self, pool: PoolPolicy) -> Self {
        self.default_pool = pool;
        self
    }

    /// Caps the primary pool at `bytes`.
    #[must_use]
    pub const fn with_primary_limit(mut self, bytes: usize) -> Self {
        self.primary_limit = Some(bytes);
        self
    }

    /// Caps the secondary pool at `bytes`.
    #[must_use]
    pub const fn with_secondary_limit(mut self, bytes: usize) -> Self {
        self.secondary_limit = Some(bytes);
        self
    }

    /// Sets [`max_objects`](Self::max_objects).
    #[must_use]
    pub const fn with_max_objects(mut self, max_objects: u32) -> Self {
        self.max_objects = max_objects;
        self
    }

    /// Enables or disables the deferred-deletion worker thread.
    #[must_use]
    pub const fn with_worker(mut self, spawn: bool) -> Self {
        self.spawn_worker = spawn;
        self
    }

    /// Sets the worker thread name.
    #[must_use]
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Replaces the teardown deferral policy.
    #[must_use]
    pub fn with_policy(mut self, policy: impl TeardownPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Installs a hook called after every successful creation.
    #[must_use]
    pub fn with_create_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(ObjectId, &ObjectType) + Send + Sync + 'static,
    {
        self.create_hook = Some(Arc::new(hook));
        self
    }

    pub(crate) const fn limit(&self, pool: PoolPolicy) -> Option<usize> {
        match pool {
            PoolPolicy::Primary => self.primary_limit,
            PoolPolicy::Secondary => self.secondary_limit,
        }
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("default_pool", &self.default_pool)
            .field("primary_limit", &self.primary_limit)
            .field("secondary_limit", &self.secondary_limit)
            .field("max_objects", &self.max_objects)
            .field("spawn_worker", &self.spawn_worker)
            .field("worker_name", &self.worker_name)
            .field("create_hook", &self.create_hook.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.default_pool, PoolPolicy::Primary);
        assert_eq!(config.limit(PoolPolicy::Primary), None);
        assert!(config.spawn_worker);
        assert!(config.create_hook.is_none());
    }

    #[test]
    fn test_builders() {
        let config = RegistryConfig::default()
            .with_secondary_limit(4096)
            .with_max_objects(16)
            .with_worker_name("reaper")
            .with_create_hook(|_, _| {});
        assert_eq!(config.limit(PoolPolicy::Secondary), Some(4096));
        assert_eq!(config.max_objects, 16);
        assert_eq!(config.worker_name, "reaper");
        assert!(format!("{config:?}").contains("create_hook: true"));
    }
}
