//! Discovered class manifest.
//!
//! # Responsibility
//! - Record every discovered class with its parent, interfaces and module.
//! - Answer descendant/implementor queries from the raw records.
//!
//! # Invariants
//! - Class names are case-insensitive; lookups keep the declared spelling.
//! - Ancestry walks are cycle-safe even for malformed declarations.

use super::{Manifest, ManifestDomain};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One discovered class declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Module that declared the class; filled in by discovery.
    #[serde(default)]
    pub module: Option<String>,
}

impl ClassRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            interfaces: Vec::new(),
            module: None,
        }
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }
}

/// Snapshot of all discovered classes keyed by lowercase name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassManifest {
    classes: BTreeMap<String, ClassRecord>,
}

impl Manifest for ClassManifest {
    const DOMAIN: ManifestDomain = ManifestDomain::Classes;
}

impl ClassManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ClassRecord>) -> Self {
        let mut manifest = Self::new();
        for record in records {
            manifest.add_class(record);
        }
        manifest
    }

    /// Adds or replaces one class record; returns the replaced record.
    pub fn add_class(&mut self, record: ClassRecord) -> Option<ClassRecord> {
        self.classes.insert(record.name.to_ascii_lowercase(), record)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ClassRecord> {
        self.classes.get(name.to_ascii_lowercase().as_str())
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Declared class names in lowercase-key order.
    pub fn class_names(&self) -> Vec<&str> {
        self.classes.values().map(|record| record.name.as_str()).collect()
    }

    /// Canonical spelling of `name`.
    pub fn item_name(&self, name: &str) -> Option<&str> {
        self.get(name).map(|record| record.name.as_str())
    }

    pub fn parent_of(&self, name: &str) -> Option<&str> {
        self.get(name)?.parent.as_deref()
    }

    /// Direct children of `name`.
    pub fn children_of(&self, name: &str) -> Vec<&str> {
        let key = name.to_ascii_lowercase();
        self.classes
            .values()
            .filter(|record| {
                record
                    .parent
                    .as_deref()
                    .is_some_and(|parent| parent.to_ascii_lowercase() == key)
            })
            .map(|record| record.name.as_str())
            .collect()
    }

    /// All transitive subclasses of `name`, excluding `name` itself.
    pub fn descendants_of(&self, name: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut seen = BTreeSet::new();
        seen.insert(name.to_ascii_lowercase());
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            for child in self.children_of(&current) {
                if seen.insert(child.to_ascii_lowercase()) {
                    found.push(child.to_string());
                    pending.push(child.to_string());
                }
            }
        }
        found.sort_by_key(|value| value.to_ascii_lowercase());
        found
    }

    /// Classes declaring `interface` directly or through an ancestor.
    pub fn implementors_of(&self, interface: &str) -> Vec<String> {
        self.classes
            .values()
            .filter(|record| {
                self.lineage(&record.name).iter().any(|ancestor| {
                    self.get(ancestor).is_some_and(|declared| {
                        declared
                            .interfaces
                            .iter()
                            .any(|value| value.eq_ignore_ascii_case(interface))
                    })
                })
            })
            .map(|record| record.name.clone())
            .collect()
    }

    /// Declared ancestry of `name`, most-derived first, stopping at the first
    /// undeclared parent or repeated name.
    pub fn lineage(&self, name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = self.get(name);
        while let Some(record) = current {
            if !seen.insert(record.name.to_ascii_lowercase()) {
                break;
            }
            chain.push(record.name.clone());
            current = record.parent.as_deref().and_then(|parent| self.get(parent));
        }
        chain
    }
}
