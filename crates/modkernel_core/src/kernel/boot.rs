//! Kernel boot stages.
//!
//! # Invariants
//! - Stages advance one step at a time, in declaration order.
//! - `boot` runs at most once per kernel; the flush flag is captured on
//!   entry.
//! - A failing stage stops the sequence; the stage stays at the last one
//!   that completed.

use super::{Kernel, ENV_FILE, INSTALLER_ENTRY_FILE, LEGACY_ENVIRONMENT_FILE};
use crate::config::ConfigCollection;
use crate::database::{DatabaseConfig, DatabaseError};
use crate::environment::load_env_file;
use crate::logging;
use crate::manifest::discovery::{discover_cached, DiscoveredManifests, DiscoveryError};
use crate::manifest;
use log::{debug, error, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

/// Kernel boot progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootStage {
    Uninitialized,
    RuntimeConfigured,
    ManifestsLoaded,
    ErrorHandlingArmed,
    DatabaseConfigured,
    ConfigActivated,
    Validated,
    Booted,
}

impl BootStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::RuntimeConfigured => "runtime_configured",
            Self::ManifestsLoaded => "manifests_loaded",
            Self::ErrorHandlingArmed => "error_handling_armed",
            Self::DatabaseConfigured => "database_configured",
            Self::ConfigActivated => "config_activated",
            Self::Validated => "validated",
            Self::Booted => "booted",
        }
    }

    /// The stage that follows `self`; `None` once booted.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Uninitialized => Some(Self::RuntimeConfigured),
            Self::RuntimeConfigured => Some(Self::ManifestsLoaded),
            Self::ManifestsLoaded => Some(Self::ErrorHandlingArmed),
            Self::ErrorHandlingArmed => Some(Self::DatabaseConfigured),
            Self::DatabaseConfigured => Some(Self::ConfigActivated),
            Self::ConfigActivated => Some(Self::Validated),
            Self::Validated => Some(Self::Booted),
            Self::Booted => None,
        }
    }
}

impl Display for BootStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boot failures.
#[derive(Debug)]
pub enum BootError {
    /// Required configuration is missing and nothing can remedy it.
    ConfigurationFatal {
        diagnostic: String,
        artifact: Option<PathBuf>,
    },
    /// Required configuration is missing; the installer at `target` should
    /// take over.
    ConfigurationRedirect { target: PathBuf },
    AlreadyBooted(BootStage),
    Discovery(DiscoveryError),
    Database(DatabaseError),
    ModuleActivation { module: String, message: String },
}

impl BootError {
    /// Stable code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigurationFatal { .. } => "configuration_fatal",
            Self::ConfigurationRedirect { .. } => "configuration_redirect",
            Self::AlreadyBooted(_) => "already_booted",
            Self::Discovery(_) => "discovery_failed",
            Self::Database(_) => "database_unavailable",
            Self::ModuleActivation { .. } => "module_activation_failed",
        }
    }

    fn fatal(diagnostic: impl Into<String>, artifact: Option<PathBuf>) -> Self {
        Self::ConfigurationFatal {
            diagnostic: diagnostic.into(),
            artifact,
        }
    }
}

impl Display for BootError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigurationFatal {
                diagnostic,
                artifact: Some(artifact),
            } => write!(f, "{diagnostic} ({})", artifact.display()),
            Self::ConfigurationFatal { diagnostic, .. } => f.write_str(diagnostic),
            Self::ConfigurationRedirect { target } => {
                write!(f, "configuration missing; redirect to `{}`", target.display())
            }
            Self::AlreadyBooted(stage) => {
                write!(f, "kernel boot already ran (stage `{stage}`)")
            }
            Self::Discovery(err) => write!(f, "manifest discovery failed: {err}"),
            Self::Database(err) => write!(f, "database validation failed: {err}"),
            Self::ModuleActivation { module, message } => {
                write!(f, "module `{module}` failed to activate: {message}")
            }
        }
    }
}

impl Error for BootError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Discovery(err) => Some(err),
            Self::Database(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DiscoveryError> for BootError {
    fn from(value: DiscoveryError) -> Self {
        Self::Discovery(value)
    }
}

impl From<DatabaseError> for BootError {
    fn from(value: DatabaseError) -> Self {
        Self::Database(value)
    }
}

impl Kernel {
    /// Runs every boot stage in order.
    ///
    /// `flush` discards cached manifests and rediscovers them.
    ///
    /// # Errors
    /// - [`BootError::AlreadyBooted`] when boot already ran on this kernel.
    /// - [`BootError::ConfigurationFatal`] / [`BootError::ConfigurationRedirect`]
    ///   when no database identity can be resolved.
    /// - Discovery, module activation and database probe failures.
    pub fn boot(self: &Rc<Self>, flush: bool) -> Result<(), BootError> {
        if self.flush.get().is_some() {
            return Err(BootError::AlreadyBooted(self.stage.get()));
        }
        self.flush.set(Some(flush));

        let started_at = Instant::now();
        info!(
            "event=kernel_boot module=kernel status=start kernel_id={} base_path={} flush={}",
            self.id,
            self.base_path.display(),
            flush
        );
        match self.run_stages(flush) {
            Ok(()) => {
                info!(
                    "event=kernel_boot module=kernel status=ok kernel_id={} environment={} duration_ms={}",
                    self.id,
                    self.environment(),
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=kernel_boot module=kernel status=error kernel_id={} stage={} error_code={} error={}",
                    self.id,
                    self.stage.get(),
                    err.code(),
                    err
                );
                Err(err)
            }
        }
    }

    fn run_stages(self: &Rc<Self>, flush: bool) -> Result<(), BootError> {
        self.configure_runtime()?;
        self.advance(BootStage::RuntimeConfigured);

        self.load_manifests(flush)?;
        self.advance(BootStage::ManifestsLoaded);

        logging::install_panic_hook();
        self.advance(BootStage::ErrorHandlingArmed);

        self.configure_database();
        self.advance(BootStage::DatabaseConfigured);

        self.activate_config()?;
        self.advance(BootStage::ConfigActivated);

        self.validate_database()?;
        self.advance(BootStage::Validated);

        self.advance(BootStage::Booted);
        Ok(())
    }

    fn advance(&self, next: BootStage) {
        debug_assert_eq!(self.stage.get().next(), Some(next));
        self.stage.set(next);
        debug!(
            "event=kernel_stage module=kernel status=ok kernel_id={} stage={}",
            self.id, next
        );
    }

    fn configure_runtime(&self) -> Result<(), BootError> {
        if !self.base_path.is_dir() {
            return Err(BootError::fatal(
                "base path is not a directory",
                Some(self.base_path.clone()),
            ));
        }
        let env_file = self.base_path.join(ENV_FILE);
        if env_file.is_file() {
            let applied = load_env_file(&env_file, self.vars.as_ref()).map_err(|err| {
                BootError::fatal(format!("failed to read environment file: {err}"), Some(env_file.clone()))
            })?;
            debug!(
                "event=env_file module=kernel status=ok path={} applied={}",
                env_file.display(),
                applied
            );
        }
        info!(
            "event=kernel_environment module=kernel status=ok kernel_id={} environment={}",
            self.id,
            self.environment()
        );
        Ok(())
    }

    fn load_manifests(&self, flush: bool) -> Result<(), BootError> {
        let DiscoveredManifests {
            classes,
            mut modules,
        } = discover_cached(
            self.discovery.as_ref(),
            self.cache.as_ref(),
            &self.base_path,
            flush,
        )?;
        modules.sort();
        let config = ConfigCollection::from_modules(&modules);
        info!(
            "event=manifests_load module=kernel status=ok kernel_id={} classes={} modules={}",
            self.id,
            classes.len(),
            modules.len()
        );

        self.class_loader.borrow_mut().push_manifest(classes);
        self.module_loader.borrow_mut().push_manifest(modules);
        self.config_loader.borrow_mut().push_manifest(config);
        manifest::activate(&self.class_loader);
        manifest::activate(&self.module_loader);

        let classes = self.class_loader.borrow_mut().manifest();
        self.class_info.replace_manifest(classes);
        self.extensions.method_tables().clear();
        Ok(())
    }

    fn configure_database(&self) {
        let database = DatabaseConfig::from_vars(self.vars.as_ref(), &self.base_path);
        info!(
            "event=db_config module=kernel status=ok kernel_id={} driver={} has_identity={}",
            self.id,
            database.driver,
            database.has_identity()
        );
        *self.database.borrow_mut() = Some(database);
    }

    fn activate_config(self: &Rc<Self>) -> Result<(), BootError> {
        let modules = self.module_loader.borrow_mut().manifest();
        let mut config = ConfigCollection::clone(&self.config_loader.borrow_mut().manifest());
        let activators = self.activators.borrow().clone();
        for module in modules.modules() {
            for (_, activator) in activators
                .iter()
                .filter(|(name, _)| name.eq_ignore_ascii_case(&module.name))
            {
                activator(module, &mut config).map_err(|message| BootError::ModuleActivation {
                    module: module.name.clone(),
                    message,
                })?;
            }
        }
        self.config_loader.borrow_mut().push_manifest(config);
        self.activate();
        Ok(())
    }

    fn validate_database(&self) -> Result<(), BootError> {
        let database = self.database.borrow().clone().unwrap_or_default();
        if !database.has_identity() {
            return Err(self.missing_configuration());
        }
        self.connector.validate(&database)?;
        Ok(())
    }

    fn missing_configuration(&self) -> BootError {
        let legacy = std::iter::once(self.base_path.as_path())
            .chain(self.base_path.parent())
            .map(|dir| dir.join(LEGACY_ENVIRONMENT_FILE))
            .find(|path| path.is_file());
        if let Some(artifact) = legacy {
            return BootError::fatal(
                "legacy environment file is no longer read; move its values into .env or APP_DATABASE_* variables",
                Some(artifact),
            );
        }
        let installer = self.base_path.join(INSTALLER_ENTRY_FILE);
        if installer.is_file() {
            return BootError::ConfigurationRedirect { target: installer };
        }
        BootError::fatal(
            "missing required configuration: set APP_DATABASE_NAME or APP_DATABASE_CHOOSE_NAME",
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{BootError, BootStage};
    use std::path::PathBuf;

    #[test]
    fn stages_advance_in_declared_order() {
        let mut stage = BootStage::Uninitialized;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen.len(), 8);
        assert_eq!(stage, BootStage::Booted);
    }

    #[test]
    fn fatal_display_names_the_artifact() {
        let err = BootError::ConfigurationFatal {
            diagnostic: "legacy file".to_string(),
            artifact: Some(PathBuf::from("/srv/_environment.legacy")),
        };
        assert_eq!(err.code(), "configuration_fatal");
        assert!(err.to_string().contains("/srv/_environment.legacy"));
    }
}
