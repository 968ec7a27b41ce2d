//! Kernel: composed runtime state with nesting and activation.
//!
//! # Responsibility
//! - Hold one manifest loader per domain plus environment state.
//! - Drive the boot sequence (see [`boot`]).
//! - Create nested kernels with independent config and service layers.
//!
//! # Invariants
//! - `activate` makes the kernel's config and service loaders active, then
//!   registers the kernel itself under [`KERNEL_SERVICE`].
//! - Nested kernels share class/module loaders and caches with their parent.
//! - Nothing re-activates a parent automatically; callers that end a nested
//!   scope call `activate` on the kernel returned by `nested_from`.

pub mod boot;

pub use boot::{BootError, BootStage};

use crate::class_info::ClassInfo;
use crate::config::ConfigCollection;
use crate::database::{DatabaseConfig, DatabaseConnector, SqliteConnector};
use crate::environment::{
    EnvironmentError, EnvironmentResolver, EnvironmentType, ProcessEnv, SessionBag, VarSource,
};
use crate::extension::ExtensionRegistry;
use crate::manifest::class::ClassManifest;
use crate::manifest::discovery::{Discovery, FsDiscovery, ManifestCache, MemoryManifestCache};
use crate::manifest::module::{Module, ModuleManifest};
use crate::manifest::{self, LoaderHandle, ManifestLoader};
use crate::services::{self, ServiceRegistry};
use log::{info, warn};
use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use uuid::Uuid;

/// Service name the active kernel is registered under.
pub const KERNEL_SERVICE: &str = "Kernel";
/// Environment file loaded from the base path during boot.
pub const ENV_FILE: &str = ".env";
/// Pre-migration environment file; its presence makes missing configuration
/// fatal with a pointer to it.
pub const LEGACY_ENVIRONMENT_FILE: &str = "_environment.legacy";
/// Installer entry point; its presence turns missing configuration into a
/// redirect.
pub const INSTALLER_ENTRY_FILE: &str = "install.html";

/// Config hook run for one module while config is activated.
pub type ModuleActivator = Rc<dyn Fn(&Module, &mut ConfigCollection) -> Result<(), String>>;

/// Service entry pointing at the kernel of the active scope.
#[derive(Debug)]
pub struct CurrentKernel(Weak<Kernel>);

impl CurrentKernel {
    pub fn get(&self) -> Option<Rc<Kernel>> {
        self.0.upgrade()
    }
}

pub struct Kernel {
    id: Uuid,
    base_path: PathBuf,
    vars: Rc<dyn VarSource>,
    session: Rc<RefCell<SessionBag>>,
    environment: RefCell<EnvironmentResolver>,
    discovery: Rc<dyn Discovery>,
    cache: Rc<dyn ManifestCache>,
    connector: Rc<dyn DatabaseConnector>,
    activators: Rc<RefCell<Vec<(String, ModuleActivator)>>>,
    class_loader: LoaderHandle<ClassManifest>,
    module_loader: LoaderHandle<ModuleManifest>,
    config_loader: LoaderHandle<ConfigCollection>,
    service_loader: LoaderHandle<ServiceRegistry>,
    class_info: Rc<ClassInfo>,
    extensions: Rc<ExtensionRegistry>,
    stage: Cell<BootStage>,
    flush: Cell<Option<bool>>,
    database: RefCell<Option<DatabaseConfig>>,
    nested_from: Option<Rc<Kernel>>,
}

impl Kernel {
    /// Kernel over `base_path` with process variables and filesystem
    /// discovery.
    pub fn new(base_path: impl Into<PathBuf>) -> Rc<Self> {
        Self::builder(base_path).build()
    }

    pub fn builder(base_path: impl Into<PathBuf>) -> KernelBuilder {
        KernelBuilder::new(base_path)
    }

    /// Kernel registered in the active service layer.
    pub fn current() -> Option<Rc<Kernel>> {
        services::get_as::<CurrentKernel>(KERNEL_SERVICE)?.get()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn vars(&self) -> &Rc<dyn VarSource> {
        &self.vars
    }

    pub fn session(&self) -> &Rc<RefCell<SessionBag>> {
        &self.session
    }

    /// Resolved environment: explicit > session > variable > `live`.
    pub fn environment(&self) -> EnvironmentType {
        let session = self.session.borrow();
        let resolved = self
            .environment
            .borrow()
            .resolve(self.vars.as_ref(), Some(&*session));
        resolved
    }

    /// Sets or clears the explicit environment.
    ///
    /// # Errors
    /// - [`EnvironmentError::InvalidEnvironmentValue`] for anything other
    ///   than `dev`, `test`, `live` or `None`; state is left unchanged.
    pub fn set_environment(&self, value: Option<&str>) -> Result<(), EnvironmentError> {
        if let Err(err) = self.environment.borrow_mut().set(value) {
            warn!(
                "event=environment_set module=kernel status=error kernel_id={} error={}",
                self.id, err
            );
            return Err(err);
        }
        info!(
            "event=environment_set module=kernel status=ok kernel_id={} value={}",
            self.id,
            value.unwrap_or("none")
        );
        Ok(())
    }

    pub fn is_dev(&self) -> bool {
        self.environment() == EnvironmentType::Dev
    }

    pub fn is_test(&self) -> bool {
        self.environment() == EnvironmentType::Test
    }

    pub fn is_live(&self) -> bool {
        self.environment() == EnvironmentType::Live
    }

    /// Flush flag captured by `boot`; `None` before boot.
    pub fn is_flushed(&self) -> Option<bool> {
        self.flush.get()
    }

    pub fn stage(&self) -> BootStage {
        self.stage.get()
    }

    pub fn is_booted(&self) -> bool {
        self.stage.get() == BootStage::Booted
    }

    pub fn class_info(&self) -> &Rc<ClassInfo> {
        &self.class_info
    }

    pub fn extensions(&self) -> &Rc<ExtensionRegistry> {
        &self.extensions
    }

    pub fn class_loader(&self) -> &LoaderHandle<ClassManifest> {
        &self.class_loader
    }

    pub fn module_loader(&self) -> &LoaderHandle<ModuleManifest> {
        &self.module_loader
    }

    pub fn config_loader(&self) -> &LoaderHandle<ConfigCollection> {
        &self.config_loader
    }

    pub fn service_loader(&self) -> &LoaderHandle<ServiceRegistry> {
        &self.service_loader
    }

    /// Database identity read during boot.
    pub fn database_config(&self) -> Option<DatabaseConfig> {
        self.database.borrow().clone()
    }

    /// Kernel this one was nested from.
    pub fn nested_from(&self) -> Option<&Rc<Kernel>> {
        self.nested_from.as_ref()
    }

    /// Registers `activator` to run against config when `module` activates.
    pub fn register_module_activator(
        &self,
        module: &str,
        activator: impl Fn(&Module, &mut ConfigCollection) -> Result<(), String> + 'static,
    ) {
        self.activators
            .borrow_mut()
            .push((module.to_string(), Rc::new(activator)));
    }

    /// Child kernel whose config and service layers start as copies of this
    /// kernel's current tops.
    ///
    /// The child is not active until [`Self::activate`] is called on it.
    pub fn nest(self: &Rc<Self>) -> Rc<Self> {
        let child = Self {
            id: Uuid::new_v4(),
            base_path: self.base_path.clone(),
            vars: Rc::clone(&self.vars),
            session: Rc::clone(&self.session),
            environment: RefCell::new(self.environment.borrow().clone()),
            discovery: Rc::clone(&self.discovery),
            cache: Rc::clone(&self.cache),
            connector: Rc::clone(&self.connector),
            activators: Rc::clone(&self.activators),
            class_loader: Rc::clone(&self.class_loader),
            module_loader: Rc::clone(&self.module_loader),
            config_loader: self.config_loader.borrow().nest().into_handle(),
            service_loader: self.service_loader.borrow().nest().into_handle(),
            class_info: Rc::clone(&self.class_info),
            extensions: Rc::clone(&self.extensions),
            stage: Cell::new(self.stage.get()),
            flush: Cell::new(self.flush.get()),
            database: RefCell::new(self.database.borrow().clone()),
            nested_from: Some(Rc::clone(self)),
        };
        info!(
            "event=kernel_nest module=kernel status=ok parent_id={} kernel_id={}",
            self.id, child.id
        );
        Rc::new(child)
    }

    /// Makes this kernel's state the one ambient lookups see.
    ///
    /// Order: config loader, service loader, then the kernel itself as the
    /// [`KERNEL_SERVICE`] service. Class and module loaders follow, and
    /// cached method tables are dropped since they depend on config.
    pub fn activate(self: &Rc<Self>) -> Rc<Self> {
        manifest::activate(&self.config_loader);
        manifest::activate(&self.service_loader);
        self.service_loader.borrow_mut().manifest_mut().register_service(
            Rc::new(CurrentKernel(Rc::downgrade(self))),
            KERNEL_SERVICE,
        );
        manifest::activate(&self.class_loader);
        manifest::activate(&self.module_loader);
        self.extensions.method_tables().clear();
        info!(
            "event=kernel_activate module=kernel status=ok kernel_id={} nested={}",
            self.id,
            self.nested_from.is_some()
        );
        Rc::clone(self)
    }

    /// Unregisters the kernel service and clears activation slots that still
    /// point at this kernel's loaders.
    ///
    /// Class and module loaders are shared with nested kernels and only
    /// released by the root kernel.
    pub fn shutdown(&self) {
        self.service_loader
            .borrow_mut()
            .manifest_mut()
            .unregister_named_object(KERNEL_SERVICE);
        manifest::deactivate(&self.config_loader);
        manifest::deactivate(&self.service_loader);
        if self.nested_from.is_none() {
            manifest::deactivate(&self.class_loader);
            manifest::deactivate(&self.module_loader);
        }
        info!(
            "event=kernel_shutdown module=kernel status=ok kernel_id={}",
            self.id
        );
    }
}

impl Debug for Kernel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.id)
            .field("base_path", &self.base_path)
            .field("stage", &self.stage.get())
            .field("flush", &self.flush.get())
            .field("nested", &self.nested_from.is_some())
            .finish()
    }
}

/// Assembles a [`Kernel`] with replaceable collaborators.
pub struct KernelBuilder {
    base_path: PathBuf,
    vars: Rc<dyn VarSource>,
    session: SessionBag,
    discovery: Rc<dyn Discovery>,
    cache: Rc<dyn ManifestCache>,
    connector: Rc<dyn DatabaseConnector>,
}

impl KernelBuilder {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            vars: Rc::new(ProcessEnv),
            session: SessionBag::new(),
            discovery: Rc::new(FsDiscovery),
            cache: Rc::new(MemoryManifestCache::new()),
            connector: Rc::new(SqliteConnector),
        }
    }

    pub fn vars(mut self, vars: Rc<dyn VarSource>) -> Self {
        self.vars = vars;
        self
    }

    pub fn session(mut self, session: SessionBag) -> Self {
        self.session = session;
        self
    }

    pub fn discovery(mut self, discovery: Rc<dyn Discovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn cache(mut self, cache: Rc<dyn ManifestCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn connector(mut self, connector: Rc<dyn DatabaseConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn build(self) -> Rc<Kernel> {
        let class_info = Rc::new(ClassInfo::new(Rc::new(ClassManifest::new())));
        let kernel = Kernel {
            id: Uuid::new_v4(),
            base_path: self.base_path,
            vars: self.vars,
            session: Rc::new(RefCell::new(self.session)),
            environment: RefCell::new(EnvironmentResolver::new()),
            discovery: self.discovery,
            cache: self.cache,
            connector: self.connector,
            activators: Rc::new(RefCell::new(Vec::new())),
            class_loader: ManifestLoader::new().into_handle(),
            module_loader: ManifestLoader::new().into_handle(),
            config_loader: ManifestLoader::new().into_handle(),
            service_loader: ManifestLoader::new().into_handle(),
            extensions: Rc::new(ExtensionRegistry::new(Rc::clone(&class_info))),
            class_info,
            stage: Cell::new(BootStage::Uninitialized),
            flush: Cell::new(None),
            database: RefCell::new(None),
            nested_from: None,
        };
        Rc::new(kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::{Kernel, KERNEL_SERVICE};
    use crate::environment::{EnvironmentType, MapEnv, SessionBag, ENVIRONMENT_TYPE_VAR, SESSION_DEV_KEY};
    use crate::manifest;
    use std::rc::Rc;

    #[test]
    fn explicit_environment_beats_variable() {
        let vars = Rc::new(MapEnv::from_pairs([(ENVIRONMENT_TYPE_VAR, "live")]));
        let kernel = Kernel::builder("/tmp").vars(vars).build();
        assert!(kernel.is_live());
        kernel.set_environment(Some("dev")).expect("dev is valid");
        assert_eq!(kernel.environment(), EnvironmentType::Dev);
        assert!(kernel.set_environment(Some("staging")).is_err());
        assert!(kernel.is_dev());
    }

    #[test]
    fn session_override_is_shared_with_nested_kernels() {
        let mut session = SessionBag::new();
        session.set(SESSION_DEV_KEY, "1");
        let kernel = Kernel::builder("/tmp")
            .vars(Rc::new(MapEnv::new()))
            .session(session)
            .build();
        let child = kernel.nest();
        assert!(child.is_dev());
        kernel.session().borrow_mut().clear(SESSION_DEV_KEY);
        assert!(child.is_live());
    }

    #[test]
    fn activate_registers_kernel_and_shutdown_releases_it() {
        manifest::reset_active();
        let kernel = Kernel::builder("/tmp").vars(Rc::new(MapEnv::new())).build();
        kernel.activate();
        let current = Kernel::current().expect("kernel registered");
        assert!(Rc::ptr_eq(&current, &kernel));
        assert!(kernel.service_loader().borrow_mut().manifest().has(KERNEL_SERVICE));

        kernel.shutdown();
        assert!(Kernel::current().is_none());
        assert!(!manifest::is_active(kernel.config_loader()));
    }
}
