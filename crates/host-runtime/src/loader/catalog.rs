//! Units linked into the host binary, keyed by unit name.

use bit_contracts::LinkedUnit;
use std::collections::BTreeMap;
use tracing::warn;

/// The set of modules this host can instantiate.
#[derive(Debug, Default)]
pub struct UnitCatalog {
    units: BTreeMap<String, LinkedUnit>,
}

impl UnitCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, unit: LinkedUnit) -> Self {
        self.insert(unit);
        self
    }

    /// Add a unit. A second unit with the same name is ignored.
    pub fn insert(&mut self, unit: LinkedUnit) -> bool {
        if self.units.contains_key(unit.name()) {
            warn!(unit = %unit.name(), "Unit already linked, ignoring duplicate");
            return false;
        }
        self.units.insert(unit.name().to_string(), unit);
        true
    }

    pub fn get(&self, name: &str) -> Option<&LinkedUnit> {
        self.units.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl FromIterator<LinkedUnit> for UnitCatalog {
    fn from_iter<I: IntoIterator<Item = LinkedUnit>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for unit in iter {
            catalog.insert(unit);
        }
        catalog
    }
}
