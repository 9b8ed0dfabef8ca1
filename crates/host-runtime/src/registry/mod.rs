//! # Module Registry
//!
//! Loaded modules and the bits they export, keyed by route.
//!
//! ## Two phases
//!
//! ```text
//!   RegistryBuilder ──register()──► ... ──freeze()──► ModuleRegistry
//!     (mutable, startup only)                 (immutable, shared via Arc)
//! ```
//!
//! Route uniqueness is case-insensitive. The first bit registered for a route
//! keeps it; later claimants are logged, ignored and recorded as
//! [`RouteCollision`]s. The frozen registry is plain data, so request
//! handlers read it without locks.

use crate::loader::{ModuleDescriptor, UnitHandle};
use bit_contracts::{Bit, BitInfo, Configurable, Entrypoint};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Paths served by the host itself. Bits cannot claim them.
pub const RESERVED_ROUTES: &[&str] = &["/diagnostics", "/metrics"];

/// Why a bit's route was not registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Invalid route {route:?}: {reason}")]
    InvalidRoute { route: String, reason: &'static str },

    #[error("Route {route} is already owned by {owner}")]
    Collision { route: String, owner: String },
}

/// A bit together with the module that exported it.
#[derive(Clone)]
pub struct RegisteredBit {
    pub module_id: String,
    pub package_dir: PathBuf,
    /// Normalized route as registered (trailing slash removed).
    pub route: String,
    pub bit: Arc<dyn Bit>,
}

impl RegisteredBit {
    pub fn info(&self) -> BitInfo {
        BitInfo::of(self.bit.as_ref())
    }

    /// Directory holding the bit's static UI files.
    pub fn ui_dir(&self) -> PathBuf {
        self.package_dir.join("ui")
    }
}

/// Second claimant of an already registered route.
#[derive(Debug, Clone, Serialize)]
pub struct RouteCollision {
    pub route: String,
    pub kept_module: String,
    pub kept_bit: String,
    pub rejected_module: String,
    pub rejected_bit: String,
    pub occurred_at: DateTime<Utc>,
}

/// A bit whose route failed validation.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRoute {
    pub module: String,
    pub bit: String,
    pub route: String,
    pub reason: String,
}

/// Module-level view kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSummary {
    pub id: String,
    pub package_dir: PathBuf,
    pub description: Option<String>,
    pub unit: UnitHandle,
    pub routes: Vec<String>,
    pub entrypoints: Vec<String>,
}

/// Mutable registration phase.
#[derive(Default)]
pub struct RegistryBuilder {
    modules: Vec<ModuleSummary>,
    bits: Vec<RegisteredBit>,
    by_route: HashMap<String, usize>,
    entrypoints: Vec<(String, Arc<dyn Entrypoint>)>,
    collisions: Vec<RouteCollision>,
    rejected: Vec<RejectedRoute>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module and all of its bits and entrypoints. Bits whose
    /// route is invalid or taken are skipped; the rest still register.
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Vec<RegistryError> {
        let mut errors = Vec::new();
        let mut routes = Vec::new();

        for bit in descriptor.components {
            match self.register_bit(&descriptor.id, &descriptor.package_dir, bit) {
                Ok(route) => routes.push(route),
                Err(e) => errors.push(e),
            }
        }

        let mut entrypoint_names = Vec::new();
        for entrypoint in descriptor.entrypoints {
            entrypoint_names.push(entrypoint.name().to_string());
            self.entrypoints.push((descriptor.id.clone(), entrypoint));
        }

        self.modules.push(ModuleSummary {
            id: descriptor.id,
            package_dir: descriptor.package_dir,
            description: descriptor.description,
            unit: descriptor.unit,
            routes,
            entrypoints: entrypoint_names,
        });

        errors
    }

    /// Register a single bit. Returns the normalized route it now owns.
    pub fn register_bit(
        &mut self,
        module_id: &str,
        package_dir: &std::path::Path,
        bit: Arc<dyn Bit>,
    ) -> Result<String, RegistryError> {
        let route = match normalize_route(bit.route()) {
            Ok(route) => route,
            Err(e) => {
                error!(module = %module_id, bit = %bit.name(), error = %e, "Rejecting bit with invalid route");
                self.rejected.push(RejectedRoute {
                    module: module_id.to_string(),
                    bit: bit.name().to_string(),
                    route: bit.route().to_string(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let key = route.to_lowercase();
        if let Some(&index) = self.by_route.get(&key) {
            let kept = &self.bits[index];
            warn!(
                route = %route,
                kept_module = %kept.module_id,
                rejected_module = %module_id,
                "Duplicate route, keeping first registration"
            );
            self.collisions.push(RouteCollision {
                route: route.clone(),
                kept_module: kept.module_id.clone(),
                kept_bit: kept.bit.name().to_string(),
                rejected_module: module_id.to_string(),
                rejected_bit: bit.name().to_string(),
                occurred_at: Utc::now(),
            });
            return Err(RegistryError::Collision {
                route,
                owner: kept.module_id.clone(),
            });
        }

        info!(module = %module_id, route = %route, bit = %bit.name(), "Bit registered");
        self.by_route.insert(key, self.bits.len());
        self.bits.push(RegisteredBit {
            module_id: module_id.to_string(),
            package_dir: package_dir.to_path_buf(),
            route: route.clone(),
            bit,
        });
        Ok(route)
    }

    /// End the registration phase.
    pub fn freeze(self) -> ModuleRegistry {
        info!(
            modules = self.modules.len(),
            bits = self.bits.len(),
            collisions = self.collisions.len(),
            "Module registry frozen"
        );
        ModuleRegistry {
            modules: self.modules,
            bits: self.bits,
            by_route: self.by_route,
            entrypoints: self.entrypoints,
            collisions: self.collisions,
            rejected: self.rejected,
        }
    }
}

/// Immutable registry used while serving.
pub struct ModuleRegistry {
    modules: Vec<ModuleSummary>,
    bits: Vec<RegisteredBit>,
    by_route: HashMap<String, usize>,
    entrypoints: Vec<(String, Arc<dyn Entrypoint>)>,
    collisions: Vec<RouteCollision>,
    rejected: Vec<RejectedRoute>,
}

impl ModuleRegistry {
    /// Every registered bit, in registration order.
    pub fn get_all(&self) -> &[RegisteredBit] {
        &self.bits
    }

    /// Exact (case-insensitive) route lookup.
    pub fn get_by_route(&self, route: &str) -> Option<&RegisteredBit> {
        let key = route.trim_end_matches('/').to_lowercase();
        self.by_route.get(&key).map(|&i| &self.bits[i])
    }

    /// First bit whose concrete type is `T`. The key is the bit's own type,
    /// not a trait it implements; contract capabilities go through
    /// [`find`](Self::find) or [`get_configurable`](Self::get_configurable).
    pub fn get_by_capability<T: 'static>(&self) -> Option<&T> {
        self.bits
            .iter()
            .find_map(|entry| entry.bit.as_any().downcast_ref::<T>())
    }

    /// First bit, in registration order, for which `capability` holds.
    pub fn find(&self, capability: impl Fn(&dyn Bit) -> bool) -> Option<&RegisteredBit> {
        self.bits.iter().find(|entry| capability(entry.bit.as_ref()))
    }

    /// First bit exposing runtime configuration, with that configuration.
    pub fn get_configurable(&self) -> Option<(&RegisteredBit, &dyn Configurable)> {
        self.bits
            .iter()
            .find_map(|entry| entry.bit.configuration().map(|config| (entry, config)))
    }

    /// Owner of a request path: the bit with the longest route that is the
    /// path itself or a `/`-separated prefix of it. Also returns the
    /// remainder of the path after the route, in its original case.
    pub fn resolve_path<'p>(&self, path: &'p str) -> Option<(&RegisteredBit, &'p str)> {
        let lower = path.to_lowercase();
        // Lowercasing can change byte offsets for some non-ASCII input.
        if lower.len() != path.len() {
            return None;
        }

        let mut end = lower.len();
        loop {
            let candidate = lower[..end].trim_end_matches('/');
            if candidate.is_empty() {
                return None;
            }
            if let Some(&index) = self.by_route.get(candidate) {
                return Some((&self.bits[index], &path[candidate.len()..]));
            }
            end = candidate.rfind('/')?;
        }
    }

    pub fn modules(&self) -> &[ModuleSummary] {
        &self.modules
    }

    pub fn entrypoints(&self) -> &[(String, Arc<dyn Entrypoint>)] {
        &self.entrypoints
    }

    pub fn collisions(&self) -> &[RouteCollision] {
        &self.collisions
    }

    pub fn rejected(&self) -> &[RejectedRoute] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// Validate a bit route and strip any trailing slash.
pub fn normalize_route(route: &str) -> Result<String, RegistryError> {
    let invalid = |reason| RegistryError::InvalidRoute {
        route: route.to_string(),
        reason,
    };

    if !route.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    let trimmed = route.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(invalid("must not be the root path"));
    }
    if trimmed.contains("//") {
        return Err(invalid("must not contain empty segments"));
    }
    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || c == '?' || c == '#')
    {
        return Err(invalid("must not contain whitespace, '?' or '#'"));
    }
    let lower = trimmed.to_lowercase();
    if RESERVED_ROUTES
        .iter()
        .any(|reserved| lower == *reserved || lower.starts_with(&format!("{reserved}/")))
    {
        return Err(invalid("is reserved by the host"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bit_contracts::{async_trait, BitError, BitRequest, BitResponse};
    use std::any::Any;
    use std::path::Path;

    struct Named {
        route: &'static str,
        name: &'static str,
    }

    #[async_trait]
    impl Bit for Named {
        fn route(&self) -> &str {
            self.route
        }

        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _request: BitRequest) -> Result<BitResponse, BitError> {
            Ok(BitResponse::text(self.name))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Other;

    impl Configurable for Other {
        fn schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }

        fn get_config(&self) -> serde_json::Value {
            serde_json::json!({ "level": 3 })
        }

        fn set_config(&self, _value: serde_json::Value) -> Result<(), BitError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Bit for Other {
        fn route(&self) -> &str {
            "/other"
        }

        fn name(&self) -> &str {
            "other"
        }

        async fn handle(&self, _request: BitRequest) -> Result<BitResponse, BitError> {
            Ok(BitResponse::text("other"))
        }

        fn configuration(&self) -> Option<&dyn Configurable> {
            Some(self)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn named(route: &'static str, name: &'static str) -> Arc<dyn Bit> {
        Arc::new(Named { route, name })
    }

    #[test]
    fn test_first_registrant_wins_case_insensitively() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_bit("m1", Path::new("/m1"), named("/Alpha", "first"))
            .unwrap();
        let err = builder
            .register_bit("m2", Path::new("/m2"), named("/alpha/", "second"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Collision { .. }));

        let registry = builder.freeze();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_by_route("/ALPHA").unwrap().bit.name(), "first");

        let collision = &registry.collisions()[0];
        assert_eq!(collision.kept_module, "m1");
        assert_eq!(collision.rejected_bit, "second");
    }

    #[test]
    fn test_invalid_routes_are_rejected() {
        let mut builder = RegistryBuilder::new();
        for route in ["alpha", "/", "/a//b", "/a b", "/diagnostics", "/Metrics/x"] {
            assert!(builder
                .register_bit("m", Path::new("/m"), named(route, "bad"))
                .is_err());
        }
        let registry = builder.freeze();
        assert!(registry.is_empty());
        assert_eq!(registry.rejected().len(), 6);
    }

    #[test]
    fn test_resolve_path_prefers_longest_route() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_bit("m", Path::new("/m"), named("/shop", "shop"))
            .unwrap();
        builder
            .register_bit("m", Path::new("/m"), named("/shop/admin", "admin"))
            .unwrap();
        let registry = builder.freeze();

        let (bit, rest) = registry.resolve_path("/Shop/State").unwrap();
        assert_eq!(bit.bit.name(), "shop");
        assert_eq!(rest, "/State");

        let (bit, rest) = registry.resolve_path("/shop/admin/config").unwrap();
        assert_eq!(bit.bit.name(), "admin");
        assert_eq!(rest, "/config");

        let (_, rest) = registry.resolve_path("/shop").unwrap();
        assert_eq!(rest, "");

        assert!(registry.resolve_path("/shopping").is_none());
        assert!(registry.resolve_path("/").is_none());
    }

    #[test]
    fn test_get_by_capability() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_bit("m", Path::new("/m"), named("/a", "a"))
            .unwrap();
        builder.register_bit("m", Path::new("/m"), Arc::new(Other)).unwrap();
        let registry = builder.freeze();

        assert_eq!(registry.get_by_capability::<Named>().map(|n| n.name), Some("a"));
        assert!(registry.get_by_capability::<Other>().is_some());
        assert!(registry.get_by_capability::<String>().is_none());

        let (entry, config) = registry.get_configurable().unwrap();
        assert_eq!(entry.route, "/other");
        assert_eq!(config.get_value("level"), Some(serde_json::json!(3)));

        assert_eq!(registry.find(|bit| bit.name() == "a").unwrap().route, "/a");
        assert!(registry.find(|bit| bit.has_ui()).is_none());
    }

    #[test]
    fn test_no_configurable_bit() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_bit("m", Path::new("/m"), named("/a", "a"))
            .unwrap();
        assert!(builder.freeze().get_configurable().is_none());
    }
}
