//! On-disk package formats: the optional `module.json` manifest and the
//! JSON unit headers.

use super::LoadError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// File name of the optional per-module manifest.
pub const MANIFEST_FILE: &str = "module.json";

/// Extension of unit header files.
pub const UNIT_EXTENSION: &str = "unit";

/// Contents of `module.json`. Missing fields fall back to the directory
/// name convention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleManifest {
    pub id: Option<String>,
    /// Entry unit file, relative to the package directory.
    pub entry: Option<String>,
    pub description: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// A unit file: the name of a linked unit plus what it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitHeader {
    pub unit: String,
    pub version: String,
    #[serde(default)]
    pub requires: Vec<String>,
}

/// Everything the loader needs to know about one package before binding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLayout {
    pub module_id: String,
    pub package_dir: PathBuf,
    pub entry_path: PathBuf,
    pub description: Option<String>,
    pub enabled: bool,
}

/// Default entry unit file name for a package directory.
pub fn default_entry(dir_name: &str) -> String {
    format!("{dir_name}.{UNIT_EXTENSION}")
}

/// Inspect a directory. `Ok(None)` means it is not a module package.
pub fn read_layout(package_dir: &Path) -> Result<Option<PackageLayout>, LoadError> {
    let dir_name = package_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let manifest_path = package_dir.join(MANIFEST_FILE);
    let default_entry_path = package_dir.join(default_entry(&dir_name));

    let manifest = if manifest_path.is_file() {
        let raw = fs::read_to_string(&manifest_path).map_err(|source| LoadError::Io {
            path: manifest_path.clone(),
            source,
        })?;
        serde_json::from_str::<ModuleManifest>(&raw).map_err(|source| LoadError::Manifest {
            path: manifest_path.clone(),
            source,
        })?
    } else if default_entry_path.is_file() {
        ModuleManifest {
            enabled: true,
            ..ModuleManifest::default()
        }
    } else {
        return Ok(None);
    };

    let module_id = manifest
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| dir_name.clone());
    let entry = manifest.entry.unwrap_or_else(|| default_entry(&dir_name));
    let relative = Path::new(&entry);
    if relative.is_absolute() || relative.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(LoadError::OutsidePackage(entry));
    }

    Ok(Some(PackageLayout {
        module_id,
        package_dir: package_dir.to_path_buf(),
        entry_path: package_dir.join(entry),
        description: manifest.description,
        enabled: manifest.enabled,
    }))
}

/// Parse a unit header file.
pub fn read_unit(path: &Path) -> Result<UnitHeader, LoadError> {
    if !path.is_file() {
        return Err(LoadError::MissingEntry(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| LoadError::UnitParse {
        path: path.to_path_buf(),
        source,
    })
}
