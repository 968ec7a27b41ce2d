//! Discovered module manifest.
//!
//! # Responsibility
//! - Hold discovered modules with their on-disk location and config
//!   fragments.
//! - Define the module order used for config merging and activation.
//!
//! # Invariants
//! - Module names are unique (case-insensitive); re-adding replaces in place.
//! - After `sort()`, project modules come last.

use super::{Manifest, ManifestDomain};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// One discovered module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub path: PathBuf,
    /// Project modules are applied after every library module.
    #[serde(default)]
    pub project: bool,
    /// Config fragment: class name -> property -> value.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl Module {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            project: false,
            config: Map::new(),
        }
    }

    pub fn project(mut self) -> Self {
        self.project = true;
        self
    }

    /// Adds one `class.property = value` entry to the config fragment.
    pub fn with_config(mut self, class: &str, property: &str, value: Value) -> Self {
        let entry = self
            .config
            .entry(class.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(properties) = entry {
            properties.insert(property.to_string(), value);
        }
        self
    }
}

/// Ordered snapshot of discovered modules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    modules: Vec<Module>,
}

impl Manifest for ModuleManifest {
    const DOMAIN: ManifestDomain = ManifestDomain::Modules;
}

impl ModuleManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_modules(modules: impl IntoIterator<Item = Module>) -> Self {
        let mut manifest = Self::new();
        for module in modules {
            manifest.add_module(module);
        }
        manifest
    }

    pub fn add_module(&mut self, module: Module) {
        match self
            .modules
            .iter_mut()
            .find(|existing| existing.name.eq_ignore_ascii_case(&module.name))
        {
            Some(existing) => *existing = module,
            None => self.modules.push(module),
        }
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules
            .iter()
            .find(|module| module.name.eq_ignore_ascii_case(name))
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Orders library modules by name and moves project modules last.
    pub fn sort(&mut self) {
        self.modules.sort_by(|left, right| {
            left.project
                .cmp(&right.project)
                .then_with(|| left.name.to_ascii_lowercase().cmp(&right.name.to_ascii_lowercase()))
        });
    }
}
