//! Host objects that gain methods from extensions.
//!
//! # Responsibility
//! - Resolve a host's extension instances once, at construction.
//! - Dispatch every method through one `match` over [`DispatchKind`].
//! - Fan calls out to all extensions with `extend`.
//!
//! # Invariants
//! - `has_method` reflects the class's current method table; the extension
//!   instances reflect the configuration at construction time until
//!   [`HostObject::refresh_extensions`] runs.
//! - Before/after hooks fire at most once.

use super::instance::ExtensionInstance;
use super::method_table::{DispatchKind, MethodDescriptor};
use super::registry::{ExtensionRegistry, EXTENSION_INSTANCES_PROPERTY};
use super::{CallResult, ExtensionError};
use log::debug;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

/// Native method implementation on a [`HostClass`].
pub type NativeMethod = Rc<dyn Fn(&Rc<HostObject>, &[Value]) -> CallResult>;

/// One-shot hook fired around [`HostObject::extend`].
pub type ExtendHook = Box<dyn FnOnce(&Rc<HostObject>, &[Value]) -> Value>;

/// Natively defined methods of one class.
#[derive(Clone)]
pub struct HostClass {
    name: String,
    methods: BTreeMap<String, (String, NativeMethod)>,
}

impl HostClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn with_method(
        mut self,
        name: &str,
        method: impl Fn(&Rc<HostObject>, &[Value]) -> CallResult + 'static,
    ) -> Self {
        self.methods.insert(
            name.to_ascii_lowercase(),
            (name.to_string(), Rc::new(method)),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<NativeMethod> {
        self.methods
            .get(name.to_ascii_lowercase().as_str())
            .map(|(_, method)| Rc::clone(method))
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.values().map(|(name, _)| name.as_str())
    }
}

impl Debug for HostClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClass")
            .field("name", &self.name)
            .field("methods", &self.method_names().collect::<Vec<_>>())
            .finish()
    }
}

/// An object of a configured class with its extension instances attached.
pub struct HostObject {
    class: String,
    registry: Rc<ExtensionRegistry>,
    fields: RefCell<Map<String, Value>>,
    extension_instances: RefCell<Vec<(String, Rc<ExtensionInstance>)>>,
    before_hooks: RefCell<BTreeMap<String, Vec<ExtendHook>>>,
    after_hooks: RefCell<BTreeMap<String, Vec<ExtendHook>>>,
}

impl HostObject {
    /// Creates an instance of `class`.
    ///
    /// # Errors
    /// - [`ExtensionError::UnknownClass`] when `class` is not in the class
    ///   manifest.
    /// - Instantiation errors of configured extensions.
    pub fn new(registry: &Rc<ExtensionRegistry>, class: &str) -> Result<Rc<Self>, ExtensionError> {
        let canonical = registry
            .class_info()
            .class_name(class)
            .ok_or_else(|| ExtensionError::UnknownClass(class.to_string()))?;
        let instances = registry.instantiate_extensions(&canonical)?;
        Ok(Rc::new(Self {
            class: canonical,
            registry: Rc::clone(registry),
            fields: RefCell::new(Map::new()),
            extension_instances: RefCell::new(instances),
            before_hooks: RefCell::new(BTreeMap::new()),
            after_hooks: RefCell::new(BTreeMap::new()),
        }))
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn registry(&self) -> &Rc<ExtensionRegistry> {
        &self.registry
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.borrow().get(name).cloned()
    }

    pub fn set_field(&self, name: &str, value: Value) {
        self.fields.borrow_mut().insert(name.to_string(), value);
    }

    /// Re-resolves extension instances from the current configuration.
    pub fn refresh_extensions(&self) -> Result<(), ExtensionError> {
        let instances = self.registry.instantiate_extensions(&self.class)?;
        *self.extension_instances.borrow_mut() = instances;
        Ok(())
    }

    /// Whether an attached extension is `name` or a subclass of it.
    pub fn has_extension(&self, name: &str) -> bool {
        self.extension_instance(name).is_some()
    }

    pub fn extension_instance(&self, name: &str) -> Option<Rc<ExtensionInstance>> {
        let classes = self.registry.class_info();
        self.extension_instances
            .borrow()
            .iter()
            .find(|(key, instance)| {
                key.eq_ignore_ascii_case(name)
                    || instance.class().eq_ignore_ascii_case(name)
                    || classes.is_subclass_of(instance.class(), name)
            })
            .map(|(_, instance)| Rc::clone(instance))
    }

    /// Attached instances in configured order.
    pub fn extension_instances(&self) -> Vec<Rc<ExtensionInstance>> {
        self.extension_instances
            .borrow()
            .iter()
            .map(|(_, instance)| Rc::clone(instance))
            .collect()
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.registry.method_table(&self.class).contains(method)
    }

    pub fn method_descriptor(&self, method: &str) -> Option<MethodDescriptor> {
        self.registry
            .method_table(&self.class)
            .get(method)
            .cloned()
    }

    /// Calls `method` through the class method table.
    ///
    /// Wrapper aliases are followed to their final target; an alias chain
    /// that revisits a name fails with [`ExtensionError::UndefinedMethod`].
    pub fn call(self: &Rc<Self>, method: &str, args: &[Value]) -> CallResult {
        let descriptor = self.resolve_wrappers(method)?;
        match &descriptor.kind {
            DispatchKind::NativeCall => {
                let native = self
                    .registry
                    .native_method(&self.class, &descriptor.name)
                    .ok_or_else(|| self.undefined(method))?;
                native(self, args)
            }
            DispatchKind::PropertyDelegate {
                property,
                index,
                needs_owner_context,
            } => {
                let delegate = self.delegate(property, index).ok_or_else(|| {
                    ExtensionError::MissingDelegate {
                        class: self.class.clone(),
                        method: descriptor.name.clone(),
                        property: property.clone(),
                        index: index.clone(),
                    }
                })?;
                if *needs_owner_context {
                    delegate.invoke_as(self, &descriptor.name, args)
                } else {
                    delegate.invoke(&descriptor.name, args)
                }
            }
            DispatchKind::Wrapper { target } => Err(self.undefined(target)),
            DispatchKind::FreeFunction(callback) => callback(self, args),
        }
    }

    /// Calls `method` on every attached extension that defines it.
    ///
    /// Before hooks for `method` fire first and after hooks last, each in
    /// reverse registration order. `null` results are dropped.
    pub fn extend(self: &Rc<Self>, method: &str, args: &[Value]) -> Result<Vec<Value>, ExtensionError> {
        let mut results = Vec::new();
        for hook in take_hooks(&self.before_hooks, method).into_iter().rev() {
            push_result(&mut results, hook(self, args));
        }

        let instances = self.extension_instances();
        for instance in instances.iter().filter(|instance| instance.has_method(method)) {
            push_result(&mut results, instance.invoke_as(self, method, args)?);
        }

        for hook in take_hooks(&self.after_hooks, method).into_iter().rev() {
            push_result(&mut results, hook(self, args));
        }
        debug!(
            "event=host_extend module=extension status=ok class={} method={} results={}",
            self.class,
            method,
            results.len()
        );
        Ok(results)
    }

    /// Native result of `method` (when defined natively) followed by the
    /// results of [`Self::extend`].
    pub fn invoke_with_extensions(
        self: &Rc<Self>,
        method: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, ExtensionError> {
        let mut results = Vec::new();
        if let Some(native) = self.registry.native_method(&self.class, method) {
            push_result(&mut results, native(self, args)?);
        }
        results.extend(self.extend(method, args)?);
        Ok(results)
    }

    /// Registers a hook fired once before the next `extend(method)`.
    pub fn before_extending(
        &self,
        method: &str,
        hook: impl FnOnce(&Rc<HostObject>, &[Value]) -> Value + 'static,
    ) {
        add_hook(&self.before_hooks, method, Box::new(hook));
    }

    /// Registers a hook fired once after the next `extend(method)`.
    pub fn after_extending(
        &self,
        method: &str,
        hook: impl FnOnce(&Rc<HostObject>, &[Value]) -> Value + 'static,
    ) {
        add_hook(&self.after_hooks, method, Box::new(hook));
    }

    fn resolve_wrappers(&self, method: &str) -> Result<MethodDescriptor, ExtensionError> {
        let mut visited: Vec<String> = Vec::new();
        let mut name = method.to_string();
        loop {
            let descriptor = self
                .method_descriptor(&name)
                .ok_or_else(|| self.undefined(&name))?;
            let DispatchKind::Wrapper { target } = &descriptor.kind else {
                return Ok(descriptor);
            };
            visited.push(descriptor.name.to_ascii_lowercase());
            if visited.iter().any(|seen| target.eq_ignore_ascii_case(seen)) {
                return Err(self.undefined(target));
            }
            name = target.clone();
        }
    }

    fn delegate(&self, property: &str, index: &str) -> Option<Rc<ExtensionInstance>> {
        if property != EXTENSION_INSTANCES_PROPERTY {
            return None;
        }
        self.extension_instances
            .borrow()
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(index))
            .map(|(_, instance)| Rc::clone(instance))
    }

    fn undefined(&self, method: &str) -> ExtensionError {
        ExtensionError::UndefinedMethod {
            class: self.class.clone(),
            method: method.to_string(),
        }
    }
}

impl Debug for HostObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let extensions: Vec<String> = self
            .extension_instances
            .borrow()
            .iter()
            .map(|(key, _)| key.clone())
            .collect();
        f.debug_struct("HostObject")
            .field("class", &self.class)
            .field("extensions", &extensions)
            .finish()
    }
}

fn add_hook(hooks: &RefCell<BTreeMap<String, Vec<ExtendHook>>>, method: &str, hook: ExtendHook) {
    hooks
        .borrow_mut()
        .entry(method.to_ascii_lowercase())
        .or_default()
        .push(hook);
}

fn take_hooks(hooks: &RefCell<BTreeMap<String, Vec<ExtendHook>>>, method: &str) -> Vec<ExtendHook> {
    hooks
        .borrow_mut()
        .remove(method.to_ascii_lowercase().as_str())
        .unwrap_or_default()
}

fn push_result(results: &mut Vec<Value>, value: Value) {
    if !value.is_null() {
        results.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::HostClass;
    use serde_json::json;

    #[test]
    fn host_class_methods_are_case_insensitive() {
        let class = HostClass::new("Widget").with_method("Render", |_, _| Ok(json!("html")));
        assert!(class.method("render").is_some());
        assert!(class.method("paint").is_none());
        assert_eq!(class.method_names().collect::<Vec<_>>(), vec!["Render"]);
    }
}
