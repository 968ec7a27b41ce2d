//! Service-registration manifest.
//!
//! # Responsibility
//! - Map service names to shared instances for ambient lookup.
//! - Support removal by name or by registered class.
//!
//! # Invariants
//! - Names are case-insensitive.
//! - Cloning the registry copies registrations, not the instances.

use crate::manifest::{self, LoaderHandle, Manifest, ManifestDomain};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

#[derive(Clone)]
struct ServiceEntry {
    name: String,
    class: String,
    instance: Rc<dyn Any>,
}

/// Named service instances.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    entries: BTreeMap<String, ServiceEntry>,
}

impl Manifest for ServiceRegistry {
    const DOMAIN: ManifestDomain = ManifestDomain::Services;
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `instance` as the implementation of `name`.
    pub fn register_service(&mut self, instance: Rc<dyn Any>, name: &str) {
        self.register_object(instance, name, name);
    }

    /// Registers `instance` under `name`, recording the concrete `class` for
    /// [`Self::unregister_objects`].
    pub fn register_object(&mut self, instance: Rc<dyn Any>, name: &str, class: &str) {
        self.entries.insert(
            name.to_ascii_lowercase(),
            ServiceEntry {
                name: name.to_string(),
                class: class.to_string(),
                instance,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.entries
            .get(name.to_ascii_lowercase().as_str())
            .map(|entry| Rc::clone(&entry.instance))
    }

    /// Typed lookup; `None` when missing or of another type.
    pub fn get_as<T: Any>(&self, name: &str) -> Option<Rc<T>> {
        self.get(name)?.downcast::<T>().ok()
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name.to_ascii_lowercase().as_str())
    }

    /// Removes the service registered under `name`.
    pub fn unregister_named_object(&mut self, name: &str) -> bool {
        self.entries
            .remove(name.to_ascii_lowercase().as_str())
            .is_some()
    }

    /// Removes every service whose recorded class is `class`; returns the
    /// number removed.
    pub fn unregister_objects(&mut self, class: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.class.eq_ignore_ascii_case(class));
        before - self.entries.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.values().map(|entry| entry.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Debug for ServiceRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Active service loader on this thread.
pub fn active_loader() -> Option<LoaderHandle<ServiceRegistry>> {
    manifest::active::<ServiceRegistry>()
}

/// Looks up `name` in the active service layer.
pub fn get_as<T: Any>(name: &str) -> Option<Rc<T>> {
    manifest::active_manifest::<ServiceRegistry>()?.get_as::<T>(name)
}

/// Runs `edit` against the active service layer.
pub fn modify<R>(edit: impl FnOnce(&mut ServiceRegistry) -> R) -> Option<R> {
    let handle = active_loader()?;
    let mut loader = handle.borrow_mut();
    Some(edit(loader.manifest_mut()))
}

#[cfg(test)]
mod tests {
    use super::ServiceRegistry;
    use std::rc::Rc;

    #[derive(Debug, PartialEq)]
    struct Mailer(&'static str);

    #[test]
    fn typed_lookup_downcasts() {
        let mut registry = ServiceRegistry::new();
        registry.register_service(Rc::new(Mailer("smtp")), "Mailer");
        assert_eq!(
            registry.get_as::<Mailer>("mailer").as_deref(),
            Some(&Mailer("smtp"))
        );
        assert!(registry.get_as::<String>("Mailer").is_none());
    }

    #[test]
    fn unregister_by_name_and_class() {
        let mut registry = ServiceRegistry::new();
        registry.register_object(Rc::new(Mailer("a")), "PrimaryMailer", "Mailer");
        registry.register_object(Rc::new(Mailer("b")), "BackupMailer", "Mailer");
        registry.register_service(Rc::new(1_u8), "Counter");

        assert_eq!(registry.unregister_objects("mailer"), 2);
        assert!(registry.unregister_named_object("COUNTER"));
        assert!(!registry.unregister_named_object("Counter"));
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_instances_but_not_registrations() {
        let mut parent = ServiceRegistry::new();
        let shared = Rc::new(Mailer("shared"));
        parent.register_service(shared.clone(), "Mailer");

        let mut child = parent.clone();
        child.register_service(Rc::new(Mailer("child")), "Other");
        assert!(!parent.has("Other"));
        let from_child = child.get_as::<Mailer>("Mailer").expect("mailer");
        assert!(Rc::ptr_eq(&from_child, &shared));
    }
}
