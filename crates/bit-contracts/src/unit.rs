//! # Linked Units
//!
//! Every module crate exposes `pub fn unit() -> LinkedUnit`, its explicit
//! registration manifest. The host binds the unit name found on disk to one
//! of these and calls its factories.

use crate::bit::Bit;
use crate::context::BitContext;
use crate::entrypoint::Entrypoint;
use crate::errors::BitError;
use std::fmt;
use std::sync::Arc;

/// Builds one bit.
pub type ComponentFactory = Box<dyn Fn(&BitContext) -> Result<Arc<dyn Bit>, BitError> + Send + Sync>;

/// Builds one entrypoint.
pub type EntrypointFactory =
    Box<dyn Fn(&BitContext) -> Result<Arc<dyn Entrypoint>, BitError> + Send + Sync>;

/// A module linked into the host binary.
pub struct LinkedUnit {
    name: String,
    version: String,
    components: Vec<ComponentFactory>,
    entrypoints: Vec<EntrypointFactory>,
}

impl LinkedUnit {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            components: Vec::new(),
            entrypoints: Vec::new(),
        }
    }

    #[must_use]
    pub fn component<F>(mut self, factory: F) -> Self
    where
        F: Fn(&BitContext) -> Result<Arc<dyn Bit>, BitError> + Send + Sync + 'static,
    {
        self.components.push(Box::new(factory));
        self
    }

    #[must_use]
    pub fn entrypoint<F>(mut self, factory: F) -> Self
    where
        F: Fn(&BitContext) -> Result<Arc<dyn Entrypoint>, BitError> + Send + Sync + 'static,
    {
        self.entrypoints.push(Box::new(factory));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn components(&self) -> &[ComponentFactory] {
        &self.components
    }

    pub fn entrypoints(&self) -> &[EntrypointFactory] {
        &self.entrypoints
    }
}

impl fmt::Debug for LinkedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedUnit")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("components", &self.components.len())
            .field("entrypoints", &self.entrypoints.len())
            .finish()
    }
}
