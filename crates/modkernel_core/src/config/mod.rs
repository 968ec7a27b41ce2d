//! Merged configuration tree and layered reads.
//!
//! # Responsibility
//! - Hold per-class configuration merged from module fragments.
//! - Resolve reads through ancestry and extension-provided sources.
//! - Expose the mutation surface of the active config layer.
//!
//! # Invariants
//! - Snapshots are never edited in place while shared; mutation goes through
//!   the loader's copy-on-write top frame.
//! - More specific sources win: class over extension sources over parents.
//! - Lists merge by appending the more specific values.

use crate::class_info::ClassInfo;
use crate::extension::spec::ExtensionEntries;
use crate::manifest::module::ModuleManifest;
use crate::manifest::{self, LoaderHandle, Manifest, ManifestDomain};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::BitOr;
use std::rc::Rc;

/// Property that lists a class's extensions.
pub const EXTENSIONS_PROPERTY: &str = "extensions";

/// Read flags for [`ConfigReader::get`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigFlags(u8);

impl ConfigFlags {
    pub const NONE: Self = Self(0);
    /// Only the class's own value; no parent classes.
    pub const UNINHERITED: Self = Self(1);
    /// Skip config contributed by the class's extensions.
    pub const EXCLUDE_EXTRA_SOURCES: Self = Self(1 << 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ConfigFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ClassConfig {
    name: String,
    properties: Map<String, Value>,
}

/// Config snapshot: class -> property -> value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigCollection {
    classes: BTreeMap<String, ClassConfig>,
}

impl Manifest for ConfigCollection {
    const DOMAIN: ManifestDomain = ManifestDomain::Config;
}

impl ConfigCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges every module's fragment in module order.
    pub fn from_modules(modules: &ModuleManifest) -> Self {
        let mut collection = Self::new();
        for module in modules.modules() {
            collection.merge_fragment(&module.config);
        }
        collection
    }

    /// Merges a `class -> {property: value}` fragment over this collection.
    pub fn merge_fragment(&mut self, fragment: &Map<String, Value>) {
        for (class, properties) in fragment {
            if let Value::Object(properties) = properties {
                for (property, value) in properties {
                    self.merge(class, property, value.clone());
                }
            }
        }
    }

    pub fn get(&self, class: &str, property: &str) -> Option<&Value> {
        self.classes
            .get(class.to_ascii_lowercase().as_str())?
            .properties
            .get(property)
    }

    pub fn properties(&self, class: &str) -> Option<&Map<String, Value>> {
        self.classes
            .get(class.to_ascii_lowercase().as_str())
            .map(|config| &config.properties)
    }

    /// Replaces the value of `class.property`.
    pub fn set(&mut self, class: &str, property: &str, value: Value) {
        self.class_entry(class)
            .properties
            .insert(property.to_string(), value);
    }

    /// Merges `value` over the current value of `class.property`.
    pub fn merge(&mut self, class: &str, property: &str, value: Value) {
        let properties = &mut self.class_entry(class).properties;
        match properties.get_mut(property) {
            Some(existing) => {
                let previous = existing.take();
                *existing = merge_values(value, previous);
            }
            None => {
                properties.insert(property.to_string(), value);
            }
        }
    }

    pub fn remove(&mut self, class: &str, property: &str) -> Option<Value> {
        self.classes
            .get_mut(class.to_ascii_lowercase().as_str())?
            .properties
            .remove(property)
    }

    pub fn class_names(&self) -> Vec<&str> {
        self.classes.values().map(|config| config.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    fn class_entry(&mut self, class: &str) -> &mut ClassConfig {
        self.classes
            .entry(class.to_ascii_lowercase())
            .or_insert_with(|| ClassConfig {
                name: class.to_string(),
                properties: Map::new(),
            })
    }
}

/// Merges `high` over `low`.
///
/// Maps merge per key (a `null` in `high` is kept and masks `low`), lists
/// append `high` after `low`, anything else is replaced by `high`.
pub fn merge_values(high: Value, low: Value) -> Value {
    match (high, low) {
        (Value::Object(high), Value::Object(mut low)) => {
            for (key, value) in high {
                match low.get_mut(&key) {
                    Some(existing) if !value.is_null() => {
                        let previous = existing.take();
                        *existing = merge_values(value, previous);
                    }
                    Some(existing) => *existing = Value::Null,
                    None => {
                        low.insert(key, value);
                    }
                }
            }
            Value::Object(low)
        }
        (Value::Array(high), Value::Array(mut low)) => {
            low.extend(high);
            Value::Array(low)
        }
        (high, _) => high,
    }
}

fn merge_optional(high: Option<Value>, low: Option<Value>) -> Option<Value> {
    match (high, low) {
        (Some(high), Some(low)) => Some(merge_values(high, low)),
        (high, low) => high.or(low),
    }
}

/// Reads config with inheritance and extension sources applied.
pub struct ConfigReader<'a> {
    collection: &'a ConfigCollection,
    classes: &'a ClassInfo,
}

impl<'a> ConfigReader<'a> {
    pub fn new(collection: &'a ConfigCollection, classes: &'a ClassInfo) -> Self {
        Self {
            collection,
            classes,
        }
    }

    /// Resolves `class.property` according to `flags`.
    pub fn get(&self, class: &str, property: &str, flags: ConfigFlags) -> Option<Value> {
        if flags.contains(ConfigFlags::UNINHERITED) {
            return self.layer(class, property, flags);
        }
        let chain = match self.classes.ancestry(class) {
            Some(chain) => chain.to_vec(),
            None => vec![class.to_string()],
        };
        chain.iter().fold(None, |inherited, ancestor| {
            merge_optional(self.layer(ancestor, property, flags), inherited)
        })
    }

    /// Names of extensions declared directly on `class`.
    pub fn extra_sources(&self, class: &str) -> Vec<String> {
        let Some(value) = self.collection.get(class, EXTENSIONS_PROPERTY) else {
            return Vec::new();
        };
        let mut entries = ExtensionEntries::new();
        entries.merge_value(class, value);
        entries.specs().into_iter().map(|spec| spec.name).collect()
    }

    fn layer(&self, class: &str, property: &str, flags: ConfigFlags) -> Option<Value> {
        let own = self.collection.get(class, property).cloned();
        if flags.contains(ConfigFlags::EXCLUDE_EXTRA_SOURCES) || property == EXTENSIONS_PROPERTY {
            return own;
        }
        let extras = self
            .extra_sources(class)
            .iter()
            .fold(None, |acc, extension| {
                merge_optional(self.collection.get(extension, property).cloned(), acc)
            });
        merge_optional(own, extras)
    }
}

/// Active config loader on this thread.
pub fn active_loader() -> Option<LoaderHandle<ConfigCollection>> {
    manifest::active::<ConfigCollection>()
}

/// Current frame of the active config loader.
pub fn snapshot() -> Option<Rc<ConfigCollection>> {
    manifest::active_manifest::<ConfigCollection>()
}

/// Runs `edit` against the active config layer.
///
/// `edit` must not read config through the ambient helpers; the active
/// loader is mutably borrowed for the duration of the call.
pub fn modify<R>(edit: impl FnOnce(&mut ConfigCollection) -> R) -> Option<R> {
    let handle = active_loader()?;
    let mut loader = handle.borrow_mut();
    Some(edit(loader.manifest_mut()))
}
