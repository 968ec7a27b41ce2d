//! Extension instances and their owner stacks.
//!
//! An instance is bound to one host class. Hosts push themselves as owner
//! while a call is delegated into the instance, so that reentrant calls
//! (host -> extension -> host -> same extension) always see the innermost
//! host as the current owner.

use super::host::HostObject;
use super::{CallResult, Extension, ExtensionError};
use log::error;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};

pub struct ExtensionInstance {
    class: String,
    args: Vec<String>,
    owner_base_class: String,
    methods: Rc<[String]>,
    owners: RefCell<Vec<Weak<HostObject>>>,
    behavior: Box<dyn Extension>,
}

impl ExtensionInstance {
    pub fn new(
        class: impl Into<String>,
        args: Vec<String>,
        owner_base_class: impl Into<String>,
        methods: Rc<[String]>,
        behavior: Box<dyn Extension>,
    ) -> Self {
        Self {
            class: class.into(),
            args,
            owner_base_class: owner_base_class.into(),
            methods,
            owners: RefCell::new(Vec::new()),
            behavior,
        }
    }

    /// Extension class name.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Constructor arguments from the extension specification.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Class whose configuration declared this instance.
    pub fn owner_base_class(&self) -> &str {
        &self.owner_base_class
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods
            .iter()
            .any(|name| name.eq_ignore_ascii_case(method))
    }

    /// Innermost host currently delegating into this instance.
    pub fn owner(&self) -> Option<Rc<HostObject>> {
        self.owners.borrow().last().and_then(Weak::upgrade)
    }

    pub fn owner_depth(&self) -> usize {
        self.owners.borrow().len()
    }

    pub fn set_owner(&self, owner: &Rc<HostObject>) {
        self.owners.borrow_mut().push(Rc::downgrade(owner));
    }

    /// Pops the current owner, restoring the previous one.
    ///
    /// # Errors
    /// - [`ExtensionError::OwnerStackUnderflow`] when no owner is set.
    pub fn clear_owner(&self) -> Result<(), ExtensionError> {
        self.owners
            .borrow_mut()
            .pop()
            .map(|_| ())
            .ok_or_else(|| ExtensionError::OwnerStackUnderflow(self.class.clone()))
    }

    /// Pushes `owner` until the returned guard is dropped.
    pub fn scoped_owner(&self, owner: &Rc<HostObject>) -> OwnerGuard<'_> {
        self.set_owner(owner);
        OwnerGuard {
            instance: self,
            depth: self.owner_depth(),
        }
    }

    /// Invokes `method` with `owner` pushed for the duration of the call.
    pub fn invoke_as(&self, owner: &Rc<HostObject>, method: &str, args: &[Value]) -> CallResult {
        let _guard = self.scoped_owner(owner);
        self.behavior.invoke(method, self, args)
    }

    /// Invokes `method` without touching the owner stack.
    pub fn invoke(&self, method: &str, args: &[Value]) -> CallResult {
        self.behavior.invoke(method, self, args)
    }
}

impl Debug for ExtensionInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionInstance")
            .field("class", &self.class)
            .field("args", &self.args)
            .field("owner_base_class", &self.owner_base_class)
            .field("owner_depth", &self.owner_depth())
            .finish()
    }
}

/// Pops the owner pushed by [`ExtensionInstance::scoped_owner`] on drop.
pub struct OwnerGuard<'a> {
    instance: &'a ExtensionInstance,
    depth: usize,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        let current = self.instance.owner_depth();
        if current != self.depth {
            error!(
                "event=owner_stack module=extension status=error class={} expected_depth={} actual_depth={}",
                self.instance.class, self.depth, current
            );
        }
        if let Err(err) = self.instance.clear_owner() {
            error!(
                "event=owner_stack module=extension status=error error_code={} error={}",
                err.code(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ExtensionInstance;
    use crate::extension::{CallResult, Extension, ExtensionError};
    use serde_json::Value;

    struct Silent;

    impl Extension for Silent {
        fn invoke(&self, _method: &str, _this: &ExtensionInstance, _args: &[Value]) -> CallResult {
            Ok(Value::Null)
        }
    }

    fn instance() -> ExtensionInstance {
        ExtensionInstance::new(
            "Silent",
            vec!["a".to_string()],
            "Widget",
            vec!["hush".to_string()].into(),
            Box::new(Silent),
        )
    }

    #[test]
    fn clear_owner_on_empty_stack_is_an_error() {
        let instance = instance();
        assert_eq!(
            instance.clear_owner(),
            Err(ExtensionError::OwnerStackUnderflow("Silent".to_string()))
        );
    }

    #[test]
    fn method_lookup_is_case_insensitive() {
        let instance = instance();
        assert!(instance.has_method("HUSH"));
        assert!(!instance.has_method("shout"));
        assert_eq!(instance.owner_base_class(), "Widget");
        assert_eq!(instance.args(), ["a"]);
    }
}
