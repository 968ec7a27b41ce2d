//! Runtime extension of host objects.
//!
//! # Responsibility
//! - Attach extension instances to host objects from class configuration.
//! - Dispatch dynamic methods through explicit per-class method tables.
//! - Track the host currently delegating into each extension instance.
//!
//! # Invariants
//! - Method tables are invalidated for a class and every subclass whenever
//!   the extensions configured on that class change.
//! - Owner pushes and pops are balanced on every exit path.
//! - Native host methods win over dynamic ones of the same name.
//!
//! # See also
//! - `crate::config` for the `extensions` property these read.

pub mod host;
pub mod instance;
pub mod method_table;
pub mod registry;
pub mod spec;

pub use host::{ExtendHook, HostClass, HostObject, NativeMethod};
pub use instance::{ExtensionInstance, OwnerGuard};
pub use method_table::{DispatchKind, MethodCallback, MethodDescriptor, MethodTable, MethodTableCache};
pub use registry::{ExtensionFactory, ExtensionRegistry, EXTENSION_INSTANCES_PROPERTY};
pub use spec::{ExtensionEntries, ExtensionEntry, ExtensionSpec};

use crate::manifest::ManifestDomain;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Result of a dynamic call; `Value::Null` is a null result.
pub type CallResult = Result<Value, ExtensionError>;

/// Behavior contributed to hosts by an extension.
///
/// `this` gives access to the host currently delegating into the instance
/// through [`ExtensionInstance::owner`].
pub trait Extension {
    fn invoke(&self, method: &str, this: &ExtensionInstance, args: &[Value]) -> CallResult;
}

/// Extension registration and dispatch errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    UnknownClass(String),
    UnknownExtension(String),
    InvalidExtension(String),
    DuplicateRegistration(String),
    NoActiveManifest(ManifestDomain),
    UndefinedMethod {
        class: String,
        method: String,
    },
    MissingDelegate {
        class: String,
        method: String,
        property: String,
        index: String,
    },
    OwnerStackUnderflow(String),
    CallFailed {
        method: String,
        message: String,
    },
}

impl ExtensionError {
    /// Stable code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownClass(_) => "unknown_class",
            Self::UnknownExtension(_) => "unknown_extension",
            Self::InvalidExtension(_) => "invalid_extension",
            Self::DuplicateRegistration(_) => "duplicate_registration",
            Self::NoActiveManifest(_) => "no_active_manifest",
            Self::UndefinedMethod { .. } => "undefined_method",
            Self::MissingDelegate { .. } => "missing_delegate",
            Self::OwnerStackUnderflow(_) => "owner_stack_underflow",
            Self::CallFailed { .. } => "call_failed",
        }
    }
}

impl Display for ExtensionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownClass(class) => write!(f, "unknown class `{class}`"),
            Self::UnknownExtension(name) => write!(f, "unknown extension `{name}`"),
            Self::InvalidExtension(name) => write!(f, "`{name}` is not a valid extension"),
            Self::DuplicateRegistration(name) => {
                write!(f, "extension `{name}` is already registered")
            }
            Self::NoActiveManifest(domain) => write!(f, "no active {domain} manifest"),
            Self::UndefinedMethod { class, method } => {
                write!(f, "method `{method}` does not exist on `{class}`")
            }
            Self::MissingDelegate {
                class,
                method,
                property,
                index,
            } => write!(
                f,
                "method `{method}` on `{class}` delegates to `{property}[{index}]`, which is not set"
            ),
            Self::OwnerStackUnderflow(class) => {
                write!(f, "clear_owner called on `{class}` with no owner set")
            }
            Self::CallFailed { method, message } => write!(f, "call to `{method}` failed: {message}"),
        }
    }
}

impl Error for ExtensionError {}

#[cfg(test)]
mod tests {
    use super::ExtensionError;
    use crate::manifest::ManifestDomain;

    #[test]
    fn display_names_the_missing_delegate() {
        let err = ExtensionError::MissingDelegate {
            class: "Widget".to_string(),
            method: "paint".to_string(),
            property: "extension_instances".to_string(),
            index: "painter".to_string(),
        };
        assert_eq!(err.code(), "missing_delegate");
        assert!(err.to_string().contains("extension_instances[painter]"));
        assert_eq!(
            ExtensionError::NoActiveManifest(ManifestDomain::Config).to_string(),
            "no active config manifest"
        );
    }
}
