//! Per-class dynamic method tables.
//!
//! # Invariants
//! - Table keys are lowercase method names.
//! - A cached table is dropped whenever the class or one of its ancestors
//!   changes its extension set.

use super::host::HostObject;
use super::CallResult;
use crate::class_info::ClassInfo;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

/// Callback registered directly on a host class.
pub type MethodCallback = Rc<dyn Fn(&Rc<HostObject>, &[Value]) -> CallResult>;

/// How a method name is dispatched.
#[derive(Clone)]
pub enum DispatchKind {
    /// Method defined on the host class itself.
    NativeCall,
    /// Method served by an object held in the host's `property[index]`.
    PropertyDelegate {
        property: String,
        index: String,
        needs_owner_context: bool,
    },
    /// Alias of another method on the same host.
    Wrapper { target: String },
    FreeFunction(MethodCallback),
}

impl Debug for DispatchKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NativeCall => f.write_str("NativeCall"),
            Self::PropertyDelegate {
                property,
                index,
                needs_owner_context,
            } => f
                .debug_struct("PropertyDelegate")
                .field("property", property)
                .field("index", index)
                .field("needs_owner_context", needs_owner_context)
                .finish(),
            Self::Wrapper { target } => f.debug_struct("Wrapper").field("target", target).finish(),
            Self::FreeFunction(_) => f.write_str("FreeFunction(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub kind: DispatchKind,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, kind: DispatchKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Method name -> dispatch descriptor for one class.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: BTreeMap<String, MethodDescriptor>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `descriptor`, replacing any entry of the same name.
    pub fn insert(&mut self, descriptor: MethodDescriptor) {
        self.methods
            .insert(descriptor.name.to_ascii_lowercase(), descriptor);
    }

    pub fn get(&self, method: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method.to_ascii_lowercase().as_str())
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method.to_ascii_lowercase().as_str())
    }

    pub fn names(&self) -> Vec<&str> {
        self.methods
            .values()
            .map(|descriptor| descriptor.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Memoized method tables keyed by most-derived class.
#[derive(Debug, Default)]
pub struct MethodTableCache {
    tables: RefCell<HashMap<String, Rc<MethodTable>>>,
    builds: Cell<usize>,
}

impl MethodTableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached table for `class`, building it with `build` on a
    /// miss.
    pub fn get_or_build(&self, class: &str, build: impl FnOnce() -> MethodTable) -> Rc<MethodTable> {
        let key = class.to_ascii_lowercase();
        if let Some(hit) = self.tables.borrow().get(&key) {
            return Rc::clone(hit);
        }
        let table = Rc::new(build());
        self.builds.set(self.builds.get() + 1);
        self.tables.borrow_mut().insert(key, Rc::clone(&table));
        table
    }

    pub fn is_cached(&self, class: &str) -> bool {
        self.tables
            .borrow()
            .contains_key(class.to_ascii_lowercase().as_str())
    }

    /// Drops the tables of `class` and all of its subclasses; returns how
    /// many were cached.
    pub fn invalidate(&self, class: &str, classes: &ClassInfo) -> usize {
        let mut tables = self.tables.borrow_mut();
        classes
            .subclasses_for(class)
            .iter()
            .filter(|name| tables.remove(name.to_ascii_lowercase().as_str()).is_some())
            .count()
    }

    pub fn clear(&self) {
        self.tables.borrow_mut().clear();
    }

    /// Number of tables built since creation.
    pub fn builds(&self) -> usize {
        self.builds.get()
    }
}

#[cfg(test)]
mod tests {
    use super::{DispatchKind, MethodDescriptor, MethodTable, MethodTableCache};
    use crate::class_info::ClassInfo;
    use crate::manifest::class::{ClassManifest, ClassRecord};
    use std::rc::Rc;

    fn classes() -> ClassInfo {
        ClassInfo::new(Rc::new(ClassManifest::from_records([
            ClassRecord::new("Widget"),
            ClassRecord::new("Button").extends("Widget"),
            ClassRecord::new("Label"),
        ])))
    }

    #[test]
    fn tables_are_built_once_per_class() {
        let cache = MethodTableCache::new();
        cache.get_or_build("Widget", MethodTable::new);
        cache.get_or_build("widget", || panic!("cached table must be reused"));
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn invalidate_drops_class_and_subclasses_only() {
        let classes = classes();
        let cache = MethodTableCache::new();
        for class in ["Widget", "Button", "Label"] {
            cache.get_or_build(class, MethodTable::new);
        }

        assert_eq!(cache.invalidate("Widget", &classes), 2);
        assert!(!cache.is_cached("Widget"));
        assert!(!cache.is_cached("Button"));
        assert!(cache.is_cached("Label"));
    }

    #[test]
    fn later_insert_replaces_same_name() {
        let mut table = MethodTable::new();
        table.insert(MethodDescriptor::new(
            "paint",
            DispatchKind::Wrapper {
                target: "draw".to_string(),
            },
        ));
        table.insert(MethodDescriptor::new("Paint", DispatchKind::NativeCall));
        assert_eq!(table.len(), 1);
        assert!(matches!(
            table.get("PAINT").map(|descriptor| &descriptor.kind),
            Some(DispatchKind::NativeCall)
        ));
    }
}
