//! # Entrypoints
//!
//! Module-level hooks that run once at load time, separate from bits.

use axum::Router;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Module-wide startup hook.
pub trait Entrypoint: Send + Sync {
    fn name(&self) -> &str;

    /// Contribute shared services for other modules and the host.
    fn register_services(&self, _services: &mut ServiceCollection) {}

    /// Mount extra routes. Paths outside the module's own routes are
    /// allowed but must not shadow host endpoints.
    fn mount_routes(&self, router: Router) -> Router {
        router
    }
}

struct ServiceEntry {
    type_name: &'static str,
    provider: String,
    service: Arc<dyn Any + Send + Sync>,
}

/// Type-keyed registry of shared services. One instance per type; the first
/// registration wins.
#[derive(Default)]
pub struct ServiceCollection {
    services: HashMap<TypeId, ServiceEntry>,
}

impl ServiceCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service. Returns `false` if one of the same type is already
    /// registered.
    pub fn insert<T: Send + Sync + 'static>(&mut self, provider: &str, service: Arc<T>) -> bool {
        let id = TypeId::of::<T>();
        if self.services.contains_key(&id) {
            return false;
        }
        self.services.insert(
            id,
            ServiceEntry {
                type_name: std::any::type_name::<T>(),
                provider: provider.to_string(),
                service,
            },
        );
        true
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let entry = self.services.get(&TypeId::of::<T>())?;
        Arc::clone(&entry.service).downcast::<T>().ok()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// `(type name, provider)` pairs for diagnostics, sorted by type name.
    pub fn describe(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .services
            .values()
            .map(|e| (e.type_name.to_string(), e.provider.clone()))
            .collect();
        out.sort();
        out
    }
}

impl std::fmt::Debug for ServiceCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.describe()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock(u64);

    #[test]
    fn test_first_service_of_a_type_wins() {
        let mut services = ServiceCollection::new();
        assert!(services.insert("alpha", Arc::new(Clock(1))));
        assert!(!services.insert("beta", Arc::new(Clock(2))));

        assert_eq!(services.get::<Clock>().map(|c| c.0), Some(1));
        assert!(services.get::<String>().is_none());
        assert_eq!(services.len(), 1);
        assert_eq!(services.describe()[0].1, "alpha");
    }
}
