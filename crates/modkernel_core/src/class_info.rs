//! Memoized class hierarchy queries over a class manifest snapshot.
//!
//! # Responsibility
//! - Answer ancestry, descendant and implementor queries.
//! - Memoize answers until the manifest changes.
//!
//! # Invariants
//! - `ancestry` is ordered root-first and ends with the queried class.
//! - Every answer uses canonical class spelling.

use crate::manifest::class::ClassManifest;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Hierarchy cache over one class manifest.
#[derive(Debug)]
pub struct ClassInfo {
    manifest: RefCell<Rc<ClassManifest>>,
    ancestry: RefCell<HashMap<String, Rc<[String]>>>,
    descendants: RefCell<HashMap<String, Rc<[String]>>>,
}

impl ClassInfo {
    pub fn new(manifest: Rc<ClassManifest>) -> Self {
        Self {
            manifest: RefCell::new(manifest),
            ancestry: RefCell::new(HashMap::new()),
            descendants: RefCell::new(HashMap::new()),
        }
    }

    pub fn manifest(&self) -> Rc<ClassManifest> {
        Rc::clone(&self.manifest.borrow())
    }

    /// Swaps in a rebuilt manifest and drops every memoized answer.
    pub fn replace_manifest(&self, manifest: Rc<ClassManifest>) {
        *self.manifest.borrow_mut() = manifest;
        self.reset();
    }

    pub fn reset(&self) {
        self.ancestry.borrow_mut().clear();
        self.descendants.borrow_mut().clear();
    }

    pub fn exists(&self, class: &str) -> bool {
        self.manifest.borrow().has_class(class)
    }

    /// Canonical spelling of `class`.
    pub fn class_name(&self, class: &str) -> Option<String> {
        self.manifest.borrow().item_name(class).map(str::to_string)
    }

    pub fn parent_of(&self, class: &str) -> Option<String> {
        self.manifest.borrow().parent_of(class).map(str::to_string)
    }

    /// Root-first ancestry including `class`; `None` for unknown classes.
    pub fn ancestry(&self, class: &str) -> Option<Rc<[String]>> {
        let key = class.to_ascii_lowercase();
        if let Some(hit) = self.ancestry.borrow().get(&key) {
            return Some(Rc::clone(hit));
        }
        let mut lineage = self.manifest.borrow().lineage(class);
        if lineage.is_empty() {
            return None;
        }
        lineage.reverse();
        let chain: Rc<[String]> = lineage.into();
        self.ancestry.borrow_mut().insert(key, Rc::clone(&chain));
        Some(chain)
    }

    /// All subclasses of `class`, excluding `class`.
    pub fn descendants_of(&self, class: &str) -> Rc<[String]> {
        let key = class.to_ascii_lowercase();
        if let Some(hit) = self.descendants.borrow().get(&key) {
            return Rc::clone(hit);
        }
        let found: Rc<[String]> = self.manifest.borrow().descendants_of(class).into();
        self.descendants.borrow_mut().insert(key, Rc::clone(&found));
        found
    }

    /// `class` (canonical, when known) followed by all of its subclasses.
    pub fn subclasses_for(&self, class: &str) -> Vec<String> {
        let mut classes = vec![self.class_name(class).unwrap_or_else(|| class.to_string())];
        classes.extend(self.descendants_of(class).iter().cloned());
        classes
    }

    pub fn implementors_of(&self, interface: &str) -> Vec<String> {
        self.manifest.borrow().implementors_of(interface)
    }

    /// Whether `class` strictly descends from `ancestor`.
    pub fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        self.ancestry(class).is_some_and(|chain| {
            chain
                .iter()
                .rev()
                .skip(1)
                .any(|name| name.eq_ignore_ascii_case(ancestor))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ClassInfo;
    use crate::manifest::class::{ClassManifest, ClassRecord};
    use std::rc::Rc;

    fn info() -> ClassInfo {
        ClassInfo::new(Rc::new(ClassManifest::from_records([
            ClassRecord::new("Base"),
            ClassRecord::new("Widget").extends("Base"),
            ClassRecord::new("FancyWidget").extends("Widget"),
        ])))
    }

    #[test]
    fn ancestry_is_root_first() {
        let info = info();
        let chain = info.ancestry("fancywidget").expect("known class");
        assert_eq!(&*chain, ["Base", "Widget", "FancyWidget"]);
        assert!(info.ancestry("Unknown").is_none());
    }

    #[test]
    fn subclasses_for_includes_the_class_first() {
        let info = info();
        assert_eq!(
            info.subclasses_for("widget"),
            vec!["Widget".to_string(), "FancyWidget".to_string()]
        );
    }

    #[test]
    fn replace_manifest_drops_memoized_answers() {
        let info = info();
        assert_eq!(info.descendants_of("Base").len(), 2);
        info.replace_manifest(Rc::new(ClassManifest::from_records([ClassRecord::new(
            "Base",
        )])));
        assert!(info.descendants_of("Base").is_empty());
    }

    #[test]
    fn subclass_check_is_strict() {
        let info = info();
        assert!(info.is_subclass_of("FancyWidget", "base"));
        assert!(!info.is_subclass_of("Widget", "Widget"));
    }
}
