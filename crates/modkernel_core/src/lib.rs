//! Bootstrap and extensibility core of a modular application runtime.
//!
//! Discovers modules and classes, assembles layered nestable runtime state
//! through a [`Kernel`], and lets extensions contribute methods to host
//! objects at runtime.

pub mod class_info;
pub mod config;
pub mod database;
pub mod environment;
pub mod extension;
pub mod kernel;
pub mod logging;
pub mod manifest;
pub mod services;

pub use class_info::ClassInfo;
pub use config::{ConfigCollection, ConfigFlags, ConfigReader};
pub use database::{DatabaseConfig, DatabaseConnector, DatabaseError, SqliteConnector};
pub use environment::{EnvironmentError, EnvironmentType, MapEnv, ProcessEnv, SessionBag, VarSource};
pub use extension::{
    CallResult, Extension, ExtensionError, ExtensionFactory, ExtensionInstance, ExtensionRegistry,
    HostClass, HostObject,
};
pub use kernel::{BootError, BootStage, Kernel, KernelBuilder};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use manifest::{LoaderHandle, Manifest, ManifestDomain, ManifestLoader};
pub use serde_json::Value;
pub use services::ServiceRegistry;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
