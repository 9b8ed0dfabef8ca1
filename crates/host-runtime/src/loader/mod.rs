//! # Module Loader
//!
//! Discovers module packages under a root directory and turns each one into
//! a [`ModuleDescriptor`].
//!
//! ## Per-package pipeline
//!
//! 1. Read `module.json`, or fall back to `<dir>/<dir>.unit`.
//! 2. Parse the entry unit header.
//! 3. Resolve its dependency closure in a fresh [`LoadContext`].
//! 4. Bind the unit name to the [`UnitCatalog`] and run every factory.
//!
//! Any failure skips only that package: it is logged, recorded as a
//! [`LoadFailure`], and discovery moves on.

pub mod catalog;
pub mod context;
pub mod manifest;

pub use catalog::UnitCatalog;
pub use context::{LoadContext, Resolution};
pub use manifest::{ModuleManifest, PackageLayout, UnitHeader};

use crate::container::config::ModulesConfig;
use crate::scheduler::{ModuleTasks, TaskScheduler};
use bit_bus::MessageBus;
use bit_contracts::{Bit, BitContext, BitError, Entrypoint, LinkedUnit};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Why a package could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Entry unit not found: {0}")]
    MissingEntry(PathBuf),

    #[error("Entry path escapes the package directory: {0}")]
    OutsidePackage(String),

    #[error("Invalid unit file {path}: {source}")]
    UnitParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid dependency name: {0:?}")]
    InvalidName(String),

    #[error("Module {module} requires {name}, which is neither shared nor bundled")]
    Unresolved { module: String, name: String },

    #[error("Unit {0} is not linked into this host")]
    UnknownUnit(String),

    #[error("Module id {0} is already loaded")]
    DuplicateModule(String),

    #[error("{kind} factory #{index} of unit {unit} failed: {message}")]
    Factory {
        unit: String,
        kind: &'static str,
        index: usize,
        message: String,
    },
}

/// Record of a package that was skipped because it failed to load.
#[derive(Debug, Clone, Serialize)]
pub struct LoadFailure {
    pub module: String,
    pub package_dir: PathBuf,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// The loaded unit behind a module.
#[derive(Debug, Clone, Serialize)]
pub struct UnitHandle {
    pub name: String,
    pub version: String,
    pub entry_path: PathBuf,
    pub resolutions: BTreeMap<String, Resolution>,
}

/// A successfully loaded module.
pub struct ModuleDescriptor {
    pub id: String,
    pub package_dir: PathBuf,
    pub description: Option<String>,
    pub unit: UnitHandle,
    pub components: Vec<Arc<dyn Bit>>,
    pub entrypoints: Vec<Arc<dyn Entrypoint>>,
    /// Periodic tasks the module's factories registered.
    pub tasks: ModuleTasks,
}

impl std::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("id", &self.id)
            .field("package_dir", &self.package_dir)
            .field("unit", &self.unit.name)
            .field(
                "components",
                &self.components.iter().map(|b| b.route().to_string()).collect::<Vec<_>>(),
            )
            .field("entrypoints", &self.entrypoints.len())
            .field("tasks", &self.tasks.names())
            .finish()
    }
}

/// Result of one discovery pass.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    /// Loaded modules, in directory-name order.
    pub modules: Vec<ModuleDescriptor>,
    pub failures: Vec<LoadFailure>,
    /// Modules disabled by manifest or configuration.
    pub disabled: Vec<String>,
}

/// Discovers and instantiates module packages.
pub struct ModuleLoader<'a> {
    catalog: &'a UnitCatalog,
    config: &'a ModulesConfig,
    bus: MessageBus,
    scheduler: TaskScheduler,
}

impl<'a> ModuleLoader<'a> {
    pub fn new(
        catalog: &'a UnitCatalog,
        config: &'a ModulesConfig,
        bus: MessageBus,
        scheduler: TaskScheduler,
    ) -> Self {
        Self {
            catalog,
            config,
            bus,
            scheduler,
        }
    }

    /// Load every package directly under `root`.
    ///
    /// A missing root is not an error; the host simply starts with no modules.
    pub fn discover(&self, root: &Path) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();

        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Module directory not readable, no modules loaded");
                return outcome;
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        info!(root = %root.display(), candidates = dirs.len(), "Discovering modules");

        let mut seen_ids = HashSet::new();
        for dir in dirs {
            let fallback_id = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let layout = match manifest::read_layout(&dir) {
                Ok(Some(layout)) => layout,
                Ok(None) => {
                    debug!(dir = %dir.display(), "Not a module package, skipping");
                    continue;
                }
                Err(e) => {
                    outcome.failures.push(record_failure(&fallback_id, &dir, &e));
                    continue;
                }
            };

            if !layout.enabled || self.config.is_disabled(&layout.module_id) {
                info!(module = %layout.module_id, "Module disabled, skipping");
                outcome.disabled.push(layout.module_id);
                continue;
            }

            if !seen_ids.insert(layout.module_id.to_lowercase()) {
                let err = LoadError::DuplicateModule(layout.module_id.clone());
                outcome
                    .failures
                    .push(record_failure(&layout.module_id, &dir, &err));
                continue;
            }

            match self.load_package(&layout) {
                Ok(descriptor) => {
                    info!(
                        module = %descriptor.id,
                        unit = %descriptor.unit.name,
                        components = descriptor.components.len(),
                        entrypoints = descriptor.entrypoints.len(),
                        "Module loaded"
                    );
                    outcome.modules.push(descriptor);
                }
                Err(e) => {
                    outcome
                        .failures
                        .push(record_failure(&layout.module_id, &dir, &e));
                }
            }
        }

        info!(
            loaded = outcome.modules.len(),
            failed = outcome.failures.len(),
            disabled = outcome.disabled.len(),
            "Module discovery complete"
        );
        outcome
    }

    /// Load one package whose layout is already known.
    pub fn load_package(&self, layout: &PackageLayout) -> Result<ModuleDescriptor, LoadError> {
        let _span = bit_telemetry::module_span!("load_module", module = %layout.module_id).entered();

        let header = manifest::read_unit(&layout.entry_path)?;

        let mut context = LoadContext::new(
            layout.module_id.clone(),
            layout.package_dir.clone(),
            &self.config.shared_allow_list,
        );
        context.resolve_closure(&header.requires)?;

        let linked = self
            .catalog
            .get(&header.unit)
            .ok_or_else(|| LoadError::UnknownUnit(header.unit.clone()))?;
        if linked.version() != header.version {
            warn!(
                module = %layout.module_id,
                unit = %header.unit,
                packaged = %header.version,
                linked = %linked.version(),
                "Packaged unit version differs from the linked one"
            );
        }

        let tasks = self.scheduler.module_tasks();
        let bit_context = BitContext::new(
            self.bus.clone(),
            layout.module_id.clone(),
            layout.package_dir.clone(),
            Arc::new(tasks.clone()),
        );

        let (components, entrypoints) = match instantiate(&header.unit, linked, &bit_context) {
            Ok(built) => built,
            Err(e) => {
                let withdrawn = tasks.cancel_all();
                if withdrawn > 0 {
                    warn!(module = %layout.module_id, tasks = withdrawn, "Withdrew periodic tasks of failed module");
                }
                return Err(e);
            }
        };

        Ok(ModuleDescriptor {
            id: layout.module_id.clone(),
            package_dir: layout.package_dir.clone(),
            description: layout.description.clone(),
            unit: UnitHandle {
                name: header.unit,
                version: header.version,
                entry_path: layout.entry_path.clone(),
                resolutions: context.into_resolutions(),
            },
            components,
            entrypoints,
            tasks,
        })
    }
}

/// Run every component and entrypoint factory of `linked`.
fn instantiate(
    unit: &str,
    linked: &LinkedUnit,
    ctx: &BitContext,
) -> Result<(Vec<Arc<dyn Bit>>, Vec<Arc<dyn Entrypoint>>), LoadError> {
    let components = linked
        .components()
        .iter()
        .enumerate()
        .map(|(index, factory)| run_factory(unit, "component", index, || factory(ctx)))
        .collect::<Result<Vec<_>, _>>()?;

    let entrypoints = linked
        .entrypoints()
        .iter()
        .enumerate()
        .map(|(index, factory)| run_factory(unit, "entrypoint", index, || factory(ctx)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((components, entrypoints))
}

/// Run a factory, turning both errors and panics into [`LoadError::Factory`].
fn run_factory<T>(
    unit: &str,
    kind: &'static str,
    index: usize,
    factory: impl FnOnce() -> Result<T, BitError>,
) -> Result<T, LoadError> {
    let failed = |message: String| LoadError::Factory {
        unit: unit.to_string(),
        kind,
        index,
        message,
    };

    match catch_unwind(AssertUnwindSafe(factory)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(failed(e.to_string())),
        Err(panic) => Err(failed(format!("panicked: {}", panic_message(&*panic)))),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn record_failure(module: &str, dir: &Path, err: &LoadError) -> LoadFailure {
    error!(module = %module, dir = %dir.display(), error = %err, "Module failed to load, skipping");
    LoadFailure {
        module: module.to_string(),
        package_dir: dir.to_path_buf(),
        error: err.to_string(),
        occurred_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bit_contracts::{async_trait, BitRequest, BitResponse};
    use std::any::Any;
    use tempfile::TempDir;

    struct Fixed(&'static str);

    #[async_trait]
    impl Bit for Fixed {
        fn route(&self) -> &str {
            self.0
        }

        fn name(&self) -> &str {
            "fixed"
        }

        async fn handle(&self, _request: BitRequest) -> Result<BitResponse, BitError> {
            Ok(BitResponse::text(self.0))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn catalog() -> UnitCatalog {
        UnitCatalog::new()
            .with(LinkedUnit::new("good", "1.0.0").component(|_| Ok(Arc::new(Fixed("/good")))))
            .with(
                LinkedUnit::new("failing", "1.0.0")
                    .component(|_| Ok(Arc::new(Fixed("/failing"))))
                    .component(|_| Err(BitError::Internal("no database".into()))),
            )
            .with(LinkedUnit::new("panicking", "1.0.0").component(|_| panic!("factory exploded")))
    }

    fn write_module(root: &Path, dir: &str, unit: &str, requires: &[&str]) {
        let pkg = root.join(dir);
        fs::create_dir_all(&pkg).unwrap();
        let header = serde_json::json!({ "unit": unit, "version": "1.0.0", "requires": requires });
        fs::write(pkg.join(format!("{dir}.unit")), header.to_string()).unwrap();
    }

    fn discover(root: &Path, config: &ModulesConfig) -> LoadOutcome {
        let catalog = catalog();
        ModuleLoader::new(&catalog, config, MessageBus::new(), TaskScheduler::new()).discover(root)
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let root = TempDir::new().unwrap();
        write_module(root.path(), "a-good", "good", &["bit-bus", "serde"]);
        write_module(root.path(), "b-failing", "failing", &[]);
        write_module(root.path(), "c-panicking", "panicking", &[]);
        write_module(root.path(), "d-unknown", "nope", &[]);
        write_module(root.path(), "e-unresolved", "good", &["left-pad"]);
        fs::create_dir(root.path().join("f-corrupt")).unwrap();
        fs::write(root.path().join("f-corrupt/f-corrupt.unit"), "{{{").unwrap();
        fs::create_dir(root.path().join("g-empty")).unwrap();

        let outcome = discover(root.path(), &ModulesConfig::default());

        let loaded: Vec<&str> = outcome.modules.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(loaded, vec!["a-good"]);

        let failed: Vec<&str> = outcome.failures.iter().map(|f| f.module.as_str()).collect();
        assert_eq!(
            failed,
            vec!["b-failing", "c-panicking", "d-unknown", "e-unresolved", "f-corrupt"]
        );
        assert!(outcome.failures[1].error.contains("factory exploded"));
        assert!(outcome.failures[2].error.contains("not linked"));
    }

    #[tokio::test]
    async fn test_descriptor_records_resolutions() {
        let root = TempDir::new().unwrap();
        write_module(root.path(), "alpha", "good", &["bit-bus", "helpers"]);
        fs::write(
            root.path().join("alpha/helpers.unit"),
            r#"{ "unit": "helpers", "version": "0.1.0", "requires": ["serde"] }"#,
        )
        .unwrap();

        let outcome = discover(root.path(), &ModulesConfig::default());
        let module = &outcome.modules[0];

        assert_eq!(module.unit.name, "good");
        assert_eq!(module.components[0].route(), "/good");
        assert_eq!(module.unit.resolutions["bit-bus"], Resolution::Host);
        assert_eq!(module.unit.resolutions["serde"], Resolution::Host);
        assert_eq!(
            module.unit.resolutions["helpers"],
            Resolution::Local(root.path().join("alpha/helpers.unit"))
        );
    }

    #[tokio::test]
    async fn test_disabled_and_duplicate_modules() {
        let root = TempDir::new().unwrap();
        write_module(root.path(), "alpha", "good", &[]);
        write_module(root.path(), "beta", "good", &[]);
        let pkg = root.path().join("gamma");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("module.json"), r#"{ "id": "ALPHA", "entry": "x.unit" }"#).unwrap();
        fs::write(pkg.join("x.unit"), r#"{ "unit": "good", "version": "1.0.0" }"#).unwrap();

        let mut config = ModulesConfig::default();
        config.disabled.insert("beta".to_string());

        let outcome = discover(root.path(), &config);
        assert_eq!(outcome.modules.len(), 1);
        assert_eq!(outcome.disabled, vec!["beta".to_string()]);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].error.contains("already loaded"));
    }

    #[tokio::test]
    async fn test_failed_module_withdraws_its_tasks() {
        let root = TempDir::new().unwrap();
        write_module(root.path(), "a-steady", "steady", &[]);
        write_module(root.path(), "b-half", "half", &[]);

        let ticking = |route: &'static str| {
            move |ctx: &BitContext| -> Result<Arc<dyn Bit>, BitError> {
                ctx.schedule("tick", std::time::Duration::from_secs(60), || async {})
                    .map_err(BitError::internal)?;
                Ok(Arc::new(Fixed(route)))
            }
        };
        let catalog = UnitCatalog::new()
            .with(LinkedUnit::new("steady", "1.0.0").component(ticking("/steady")))
            .with(
                LinkedUnit::new("half", "1.0.0")
                    .component(ticking("/half"))
                    .component(|_| Err(BitError::Internal("second bit failed".into()))),
            );
        let scheduler = TaskScheduler::new();

        let outcome = ModuleLoader::new(
            &catalog,
            &ModulesConfig::default(),
            MessageBus::new(),
            scheduler.clone(),
        )
        .discover(root.path());

        assert_eq!(outcome.modules.len(), 1);
        assert_eq!(outcome.failures[0].module, "b-half");
        assert_eq!(outcome.modules[0].tasks.names(), vec!["a-steady.tick".to_string()]);
        let names: Vec<String> = scheduler.tasks().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a-steady.tick".to_string()]);
        assert_eq!(scheduler.active_count(), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_root_loads_nothing() {
        let root = TempDir::new().unwrap();
        let outcome = discover(&root.path().join("absent"), &ModulesConfig::default());
        assert!(outcome.modules.is_empty());
        assert!(outcome.failures.is_empty());
    }
}
