//! Extension registry: factories, class-level configuration and method
//! tables.
//!
//! # Responsibility
//! - Register extension factories and native host classes.
//! - Add/remove extensions on a class through the active config layer.
//! - Build and invalidate per-class method tables.
//!
//! # Invariants
//! - A rejected `add_extension` leaves configuration untouched.
//! - Any change to a class's extensions or direct methods invalidates the
//!   tables and cached singletons of that class and its subclasses.
//! - Table precedence: extension methods (later wins), then direct
//!   registrations, then native methods.

use super::host::{HostClass, HostObject, NativeMethod};
use super::instance::ExtensionInstance;
use super::method_table::{DispatchKind, MethodCallback, MethodDescriptor, MethodTable, MethodTableCache};
use super::spec::{ExtensionEntries, ExtensionSpec};
use super::{CallResult, Extension, ExtensionError};
use crate::class_info::ClassInfo;
use crate::config::{self, ConfigFlags, ConfigReader, EXTENSIONS_PROPERTY};
use crate::manifest::ManifestDomain;
use crate::services;
use log::{debug, info, warn};
use serde_json::Value;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

/// Host property holding attached extension instances, keyed by extension.
pub const EXTENSION_INSTANCES_PROPERTY: &str = "extension_instances";

/// Constructs an extension from its specification arguments.
#[derive(Clone)]
pub struct ExtensionFactory {
    name: String,
    methods: Rc<[String]>,
    build: Rc<dyn Fn(&[String]) -> Box<dyn Extension>>,
}

impl ExtensionFactory {
    /// `methods` are the public methods the extension surfaces on hosts.
    pub fn new<E: Extension + 'static>(
        name: impl Into<String>,
        methods: &[&str],
        build: impl Fn(&[String]) -> E + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            methods: methods.iter().map(|method| method.to_string()).collect(),
            build: Rc::new(move |args: &[String]| Box::new(build(args)) as Box<dyn Extension>),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    fn validate(&self) -> Result<(), ExtensionError> {
        if !is_valid_class_name(self.name.trim()) {
            return Err(ExtensionError::InvalidExtension(self.name.clone()));
        }
        let mut dedup = BTreeSet::new();
        for method in self.methods.iter() {
            if !is_valid_class_name(method) || !dedup.insert(method.to_ascii_lowercase()) {
                return Err(ExtensionError::InvalidExtension(format!(
                    "{}::{}",
                    self.name, method
                )));
            }
        }
        Ok(())
    }
}

impl Debug for ExtensionFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionFactory")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .finish()
    }
}

/// Registry composed into every host of a class manifest.
pub struct ExtensionRegistry {
    classes: Rc<ClassInfo>,
    tables: MethodTableCache,
    factories: RefCell<BTreeMap<String, ExtensionFactory>>,
    host_classes: RefCell<BTreeMap<String, HostClass>>,
    direct_methods: RefCell<BTreeMap<String, Vec<MethodDescriptor>>>,
}

impl ExtensionRegistry {
    pub fn new(classes: Rc<ClassInfo>) -> Self {
        Self {
            classes,
            tables: MethodTableCache::new(),
            factories: RefCell::new(BTreeMap::new()),
            host_classes: RefCell::new(BTreeMap::new()),
            direct_methods: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn class_info(&self) -> &Rc<ClassInfo> {
        &self.classes
    }

    pub fn method_tables(&self) -> &MethodTableCache {
        &self.tables
    }

    /// Registers one extension factory after declaration validation.
    pub fn register_extension(&self, factory: ExtensionFactory) -> Result<(), ExtensionError> {
        factory.validate()?;
        let key = factory.name.trim().to_ascii_lowercase();
        let mut factories = self.factories.borrow_mut();
        if factories.contains_key(&key) {
            return Err(ExtensionError::DuplicateRegistration(factory.name.clone()));
        }
        info!(
            "event=extension_register module=extension status=ok extension={} methods={}",
            factory.name,
            factory.methods.len()
        );
        factories.insert(key, factory);
        drop(factories);
        self.tables.clear();
        Ok(())
    }

    pub fn is_extension(&self, name: &str) -> bool {
        self.factories
            .borrow()
            .contains_key(name.trim().to_ascii_lowercase().as_str())
    }

    /// Registers (or replaces) the native methods of a host class.
    pub fn register_host_class(&self, host_class: HostClass) {
        let name = host_class.name().to_string();
        self.host_classes
            .borrow_mut()
            .insert(name.to_ascii_lowercase(), host_class);
        self.tables.invalidate(&name, &self.classes);
    }

    /// Most-derived native implementation of `method` for `class`.
    pub fn native_method(&self, class: &str, method: &str) -> Option<NativeMethod> {
        let chain = self.chain(class);
        let hosts = self.host_classes.borrow();
        let found = chain
            .iter()
            .rev()
            .find_map(|ancestor| hosts.get(ancestor.to_ascii_lowercase().as_str())?.method(method));
        found
    }

    /// Registers `callback` as method `name` on `class` and its subclasses.
    pub fn add_callback_method(
        &self,
        class: &str,
        name: &str,
        callback: impl Fn(&Rc<HostObject>, &[Value]) -> CallResult + 'static,
    ) -> Result<(), ExtensionError> {
        let callback: MethodCallback = Rc::new(callback);
        self.add_direct_method(class, MethodDescriptor::new(name, DispatchKind::FreeFunction(callback)))
    }

    /// Registers `name` as an alias of `target` on `class` and its
    /// subclasses.
    pub fn add_wrapper_method(&self, class: &str, name: &str, target: &str) -> Result<(), ExtensionError> {
        self.add_direct_method(
            class,
            MethodDescriptor::new(
                name,
                DispatchKind::Wrapper {
                    target: target.to_string(),
                },
            ),
        )
    }

    /// Removes a direct registration; returns whether one existed.
    pub fn remove_method(&self, class: &str, name: &str) -> Result<bool, ExtensionError> {
        let canonical = self.canonical(class)?;
        let removed = self
            .direct_methods
            .borrow_mut()
            .get_mut(canonical.to_ascii_lowercase().as_str())
            .map(|methods| {
                let before = methods.len();
                methods.retain(|method| !method.name.eq_ignore_ascii_case(name));
                before != methods.len()
            })
            .unwrap_or(false);
        if removed {
            self.tables.invalidate(&canonical, &self.classes);
        }
        Ok(removed)
    }

    /// Appends `spec` to the extensions configured on `class`.
    ///
    /// # Errors
    /// - [`ExtensionError::UnknownClass`] when `class` is not discovered.
    /// - [`ExtensionError::InvalidExtension`] when `spec` is malformed or
    ///   names a class that is not a registered extension.
    /// - [`ExtensionError::UnknownExtension`] when `spec` names nothing known.
    /// - [`ExtensionError::NoActiveManifest`] without an active config layer.
    pub fn add_extension(&self, class: &str, spec: &str) -> Result<(), ExtensionError> {
        let canonical = self.canonical(class)?;
        let parsed = ExtensionSpec::parse(spec)
            .ok_or_else(|| ExtensionError::InvalidExtension(spec.trim().to_string()))?;
        if !self.is_extension(&parsed.name) {
            let err = if self.classes.exists(&parsed.name) {
                ExtensionError::InvalidExtension(parsed.name)
            } else {
                ExtensionError::UnknownExtension(parsed.name)
            };
            warn!(
                "event=extension_add module=extension status=error class={} error_code={} error={}",
                canonical,
                err.code(),
                err
            );
            return Err(err);
        }

        let raw = Value::String(spec.trim().to_string());
        config::modify(|collection| {
            let updated = match collection.get(&canonical, EXTENSIONS_PROPERTY).cloned() {
                Some(Value::Array(mut items)) => {
                    items.push(raw);
                    Value::Array(items)
                }
                Some(Value::Object(mut map)) => {
                    map.insert(parsed.name.clone(), raw);
                    Value::Object(map)
                }
                Some(Value::String(existing)) => Value::Array(vec![Value::String(existing), raw]),
                _ => Value::Array(vec![raw]),
            };
            collection.set(&canonical, EXTENSIONS_PROPERTY, updated);
        })
        .ok_or(ExtensionError::NoActiveManifest(ManifestDomain::Config))?;

        self.invalidate(&canonical);
        info!(
            "event=extension_add module=extension status=ok class={} extension={}",
            canonical, parsed
        );
        Ok(())
    }

    /// Removes `name` (exact or `name(...)`) from the extensions configured
    /// directly on `class`; returns whether anything was removed.
    pub fn remove_extension(&self, class: &str, name: &str) -> Result<bool, ExtensionError> {
        let canonical = self.canonical(class)?;
        let removed = config::modify(|collection| {
            let Some(current) = collection.get(&canonical, EXTENSIONS_PROPERTY).cloned() else {
                return false;
            };
            let (filtered, removed) = filter_extension_value(current, name);
            if removed {
                collection.set(&canonical, EXTENSIONS_PROPERTY, filtered);
            }
            removed
        })
        .ok_or(ExtensionError::NoActiveManifest(ManifestDomain::Config))?;

        if removed {
            self.invalidate(&canonical);
            info!(
                "event=extension_remove module=extension status=ok class={} extension={}",
                canonical, name
            );
        }
        Ok(removed)
    }

    /// Whether `class` is configured with extension `name`.
    ///
    /// `strict` only consults the class's own configuration and exact names;
    /// otherwise ancestors' configuration and subclasses of `name` count.
    pub fn has_extension(&self, class: &str, name: &str, strict: bool) -> bool {
        let key = name.trim().to_ascii_lowercase();
        self.extension_entries(class, !strict)
            .active()
            .any(|(entry, spec)| {
                entry.key == key
                    || spec.key() == key
                    || (!strict && self.classes.is_subclass_of(&spec.name, name))
            })
    }

    /// Extension specifications configured for `class`.
    pub fn get_extensions(&self, class: &str, include_base_classes: bool) -> Vec<ExtensionSpec> {
        self.extension_entries(class, include_base_classes).specs()
    }

    /// Method table of `class`, built on first use.
    pub fn method_table(&self, class: &str) -> Rc<MethodTable> {
        let key = self
            .classes
            .class_name(class)
            .unwrap_or_else(|| class.to_string());
        self.tables.get_or_build(&key, || self.build_table(&key))
    }

    pub fn has_method(&self, class: &str, method: &str) -> bool {
        self.method_table(class).contains(method)
    }

    /// Creates the extension instances a new host of `class` carries.
    ///
    /// Entries are merged root-first along the ancestry; a keyed `null`
    /// from a more specific class removes an inherited entry.
    pub fn instantiate_extensions(
        &self,
        class: &str,
    ) -> Result<Vec<(String, Rc<ExtensionInstance>)>, ExtensionError> {
        let entries = self.extension_entries(class, true);
        let factories = self.factories.borrow();
        let instances = entries
            .active()
            .map(|(entry, spec)| {
                let factory = factories
                    .get(spec.key().as_str())
                    .ok_or_else(|| ExtensionError::UnknownExtension(spec.name.clone()))?;
                let instance = ExtensionInstance::new(
                    factory.name.clone(),
                    spec.args.clone(),
                    entry.declared_by.clone(),
                    Rc::clone(&factory.methods),
                    (factory.build)(&spec.args),
                );
                Ok((entry.key.clone(), Rc::new(instance)))
            })
            .collect();
        instances
    }

    /// Shared instance of `class`, cached in the active service layer.
    pub fn singleton(self: &Rc<Self>, class: &str) -> Result<Rc<HostObject>, ExtensionError> {
        let canonical = self.canonical(class)?;
        if let Some(existing) = services::get_as::<HostObject>(&canonical) {
            return Ok(existing);
        }
        let object = HostObject::new(self, &canonical)?;
        let erased: Rc<dyn Any> = object.clone();
        services::modify(|registry| registry.register_object(erased, &canonical, &canonical))
            .ok_or(ExtensionError::NoActiveManifest(ManifestDomain::Services))?;
        Ok(object)
    }

    /// Drops method tables and cached singletons of `class` and its
    /// subclasses.
    pub fn invalidate(&self, class: &str) {
        let tables = self.tables.invalidate(class, &self.classes);
        let subtree = self.classes.subclasses_for(class);
        let singletons = services::modify(|registry| {
            subtree
                .iter()
                .map(|name| registry.unregister_objects(name))
                .sum::<usize>()
        })
        .unwrap_or(0);
        debug!(
            "event=extension_invalidate module=extension status=ok class={} tables={} singletons={}",
            class, tables, singletons
        );
    }

    fn canonical(&self, class: &str) -> Result<String, ExtensionError> {
        self.classes
            .class_name(class)
            .ok_or_else(|| ExtensionError::UnknownClass(class.to_string()))
    }

    fn chain(&self, class: &str) -> Vec<String> {
        match self.classes.ancestry(class) {
            Some(chain) => chain.to_vec(),
            None => vec![class.to_string()],
        }
    }

    fn add_direct_method(&self, class: &str, descriptor: MethodDescriptor) -> Result<(), ExtensionError> {
        let canonical = self.canonical(class)?;
        {
            let mut direct = self.direct_methods.borrow_mut();
            let methods = direct.entry(canonical.to_ascii_lowercase()).or_default();
            methods.retain(|existing| !existing.name.eq_ignore_ascii_case(&descriptor.name));
            methods.push(descriptor);
        }
        self.tables.invalidate(&canonical, &self.classes);
        Ok(())
    }

    fn extension_entries(&self, class: &str, include_base_classes: bool) -> ExtensionEntries {
        let config = config::snapshot().unwrap_or_default();
        let reader = ConfigReader::new(&config, &self.classes);
        let flags = ConfigFlags::UNINHERITED | ConfigFlags::EXCLUDE_EXTRA_SOURCES;
        let chain = if include_base_classes {
            self.chain(class)
        } else {
            vec![self.classes.class_name(class).unwrap_or_else(|| class.to_string())]
        };
        let mut entries = ExtensionEntries::new();
        for ancestor in &chain {
            if let Some(value) = reader.get(ancestor, EXTENSIONS_PROPERTY, flags) {
                entries.merge_value(ancestor, &value);
            }
        }
        entries
    }

    fn build_table(&self, class: &str) -> MethodTable {
        let chain = self.chain(class);
        let mut table = MethodTable::new();

        let factories = self.factories.borrow();
        for (entry, spec) in self.extension_entries(class, true).active() {
            let Some(factory) = factories.get(spec.key().as_str()) else {
                warn!(
                    "event=method_table_build module=extension status=error class={} error_code=unknown_extension extension={}",
                    class, spec.name
                );
                continue;
            };
            for method in factory.methods.iter() {
                table.insert(MethodDescriptor::new(
                    method.clone(),
                    DispatchKind::PropertyDelegate {
                        property: EXTENSION_INSTANCES_PROPERTY.to_string(),
                        index: entry.key.clone(),
                        needs_owner_context: true,
                    },
                ));
            }
        }

        let direct = self.direct_methods.borrow();
        let hosts = self.host_classes.borrow();
        for ancestor in &chain {
            let key = ancestor.to_ascii_lowercase();
            for descriptor in direct.get(&key).into_iter().flatten() {
                table.insert(descriptor.clone());
            }
        }
        for ancestor in &chain {
            if let Some(host) = hosts.get(ancestor.to_ascii_lowercase().as_str()) {
                for name in host.method_names() {
                    table.insert(MethodDescriptor::new(name, DispatchKind::NativeCall));
                }
            }
        }

        debug!(
            "event=method_table_build module=extension status=ok class={} methods={}",
            class,
            table.len()
        );
        table
    }
}

impl Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("extensions", &self.factories.borrow().keys().collect::<Vec<_>>())
            .field("host_classes", &self.host_classes.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Drops entries naming `name` from an `extensions` config value.
fn filter_extension_value(current: Value, name: &str) -> (Value, bool) {
    let matches = |item: &Value| {
        item.as_str()
            .is_some_and(|raw| ExtensionSpec::raw_matches(raw, name))
    };
    match current {
        Value::Array(items) => {
            let before = items.len();
            let kept: Vec<Value> = items.into_iter().filter(|item| !matches(item)).collect();
            let removed = kept.len() != before;
            (Value::Array(kept), removed)
        }
        Value::Object(map) => {
            let before = map.len();
            let kept: serde_json::Map<String, Value> = map
                .into_iter()
                .filter(|(key, item)| !key.eq_ignore_ascii_case(name) && !matches(item))
                .collect();
            let removed = kept.len() != before;
            (Value::Object(kept), removed)
        }
        Value::String(raw) if ExtensionSpec::raw_matches(&raw, name) => (Value::Array(Vec::new()), true),
        other => (other, false),
    }
}

/// `Name` or `Namespace\Name`: ASCII letters, digits, `_` and `\`
/// separators, not starting with a digit or separator.
fn is_valid_class_name(value: &str) -> bool {
    let mut chars = value.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return false;
    }

    let mut prev_separator = false;
    for c in chars {
        if c.is_ascii_alphanumeric() || c == '_' {
            prev_separator = false;
            continue;
        }
        if c == '\\' {
            if prev_separator {
                return false;
            }
            prev_separator = true;
            continue;
        }
        return false;
    }
    !prev_separator
}

#[cfg(test)]
mod tests {
    use super::{filter_extension_value, is_valid_class_name, ExtensionFactory, ExtensionRegistry};
    use crate::class_info::ClassInfo;
    use crate::extension::{CallResult, Extension, ExtensionError, ExtensionInstance};
    use crate::manifest::class::ClassManifest;
    use serde_json::{json, Value};
    use std::rc::Rc;

    struct Echo;

    impl Extension for Echo {
        fn invoke(&self, _method: &str, _this: &ExtensionInstance, args: &[Value]) -> CallResult {
            Ok(args.first().cloned().unwrap_or(Value::Null))
        }
    }

    fn registry() -> ExtensionRegistry {
        ExtensionRegistry::new(Rc::new(ClassInfo::new(Rc::new(ClassManifest::new()))))
    }

    #[test]
    fn rejects_duplicate_extension_name() {
        let registry = registry();
        registry
            .register_extension(ExtensionFactory::new("Echo", &["echo"], |_| Echo))
            .expect("first registration should succeed");
        let err = registry
            .register_extension(ExtensionFactory::new("echo", &["echo"], |_| Echo))
            .expect_err("duplicate registration must fail");
        assert!(matches!(err, ExtensionError::DuplicateRegistration(_)));
        assert!(registry.is_extension("ECHO"));
    }

    #[test]
    fn rejects_invalid_declarations() {
        let registry = registry();
        let err = registry
            .register_extension(ExtensionFactory::new("9lives", &[], |_| Echo))
            .expect_err("leading digit must fail");
        assert_eq!(err, ExtensionError::InvalidExtension("9lives".to_string()));

        let err = registry
            .register_extension(ExtensionFactory::new("Echo", &["echo", "ECHO"], |_| Echo))
            .expect_err("duplicate method must fail");
        assert_eq!(err, ExtensionError::InvalidExtension("Echo::ECHO".to_string()));
    }

    #[test]
    fn class_name_validation() {
        assert!(is_valid_class_name("Painter"));
        assert!(is_valid_class_name("App\\Ext\\Painter"));
        assert!(!is_valid_class_name("App\\\\Painter"));
        assert!(!is_valid_class_name("Painter\\"));
        assert!(!is_valid_class_name("paint-er"));
    }

    #[test]
    fn filtering_matches_name_or_constructor_form() {
        let (kept, removed) = filter_extension_value(json!(["Painter('red')", "Logger"]), "painter");
        assert!(removed);
        assert_eq!(kept, json!(["Logger"]));

        let (kept, removed) =
            filter_extension_value(json!({"paint": "Painter", "log": "Logger"}), "Painter");
        assert!(removed);
        assert_eq!(kept, json!({"log": "Logger"}));

        let (_, removed) = filter_extension_value(json!(["PainterPlus"]), "Painter");
        assert!(!removed);

        let (kept, removed) =
            filter_extension_value(json!(["Painter (\"red\")", "Logger"]), "painter");
        assert!(removed);
        assert_eq!(kept, json!(["Logger"]));
    }
}
