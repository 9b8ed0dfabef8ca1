//! # Load Context
//!
//! One per module. Decides where each name in a unit's dependency closure
//! comes from:
//!
//! ```text
//!   requires: ["bit-bus", "pricing", "left-pad"]
//!                  │           │          │
//!        shared allow-list?   local?    neither
//!                  │           │          │
//!                  ▼           ▼          ▼
//!          Resolution::Host  Local(path)  LoadError::Unresolved
//! ```
//!
//! A module can never pick up another module's private files, and every
//! module shares exactly one copy of the contract units.

use super::manifest::{read_unit, UNIT_EXTENSION};
use super::LoadError;
use crate::container::config::is_valid_unit_name;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a dependency name was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum Resolution {
    /// The single host-wide instance.
    Host,
    /// A file or directory inside the module's own package.
    Local(PathBuf),
}

/// Per-module dependency resolver.
#[derive(Debug)]
pub struct LoadContext<'a> {
    module_id: String,
    package_dir: PathBuf,
    shared: &'a BTreeSet<String>,
    resolved: BTreeMap<String, Resolution>,
}

impl<'a> LoadContext<'a> {
    pub fn new(
        module_id: impl Into<String>,
        package_dir: impl Into<PathBuf>,
        shared: &'a BTreeSet<String>,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            package_dir: package_dir.into(),
            shared,
            resolved: BTreeMap::new(),
        }
    }

    /// Resolve a single name without following it.
    pub fn resolve(&self, name: &str) -> Result<Resolution, LoadError> {
        if !is_valid_unit_name(name) {
            return Err(LoadError::InvalidName(name.to_string()));
        }
        if self.shared.contains(name) {
            return Ok(Resolution::Host);
        }

        let unit_file = self.package_dir.join(format!("{name}.{UNIT_EXTENSION}"));
        if unit_file.is_file() {
            return Ok(Resolution::Local(unit_file));
        }
        let plain = self.package_dir.join(name);
        if plain.exists() {
            return Ok(Resolution::Local(plain));
        }

        Err(LoadError::Unresolved {
            module: self.module_id.clone(),
            name: name.to_string(),
        })
    }

    /// Resolve `requires` and, transitively, the requirements of every local
    /// unit file reached. Names already resolved are not revisited, so
    /// cycles terminate.
    pub fn resolve_closure(&mut self, requires: &[String]) -> Result<(), LoadError> {
        let mut pending: Vec<String> = requires.iter().rev().cloned().collect();

        while let Some(name) = pending.pop() {
            if self.resolved.contains_key(&name) {
                continue;
            }
            let resolution = self.resolve(&name)?;

            if let Resolution::Local(path) = &resolution {
                if is_unit_file(path) {
                    let header = read_unit(path)?;
                    pending.extend(header.requires.into_iter().rev());
                }
            }

            debug!(module = %self.module_id, dependency = %name, resolution = ?resolution, "Dependency resolved");
            self.resolved.insert(name, resolution);
        }

        Ok(())
    }

    /// Every name resolved so far.
    pub fn resolutions(&self) -> &BTreeMap<String, Resolution> {
        &self.resolved
    }

    pub fn into_resolutions(self) -> BTreeMap<String, Resolution> {
        self.resolved
    }
}

fn is_unit_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == UNIT_EXTENSION)
}
