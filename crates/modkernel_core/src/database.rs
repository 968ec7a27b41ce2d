//! Database identity wiring and connectivity validation.
//!
//! # Responsibility
//! - Build a database identity from `APP_DATABASE_*` variables.
//! - Probe that the identity is usable before a kernel reports booted.
//!
//! # Invariants
//! - A config without a database name has no identity and is never probed.
//! - Passwords never appear in `Debug` output or log lines.

use crate::environment::{is_truthy, VarSource};
use log::{error, info};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, OpenFlags};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const DATABASE_CLASS_VAR: &str = "APP_DATABASE_CLASS";
pub const DATABASE_SERVER_VAR: &str = "APP_DATABASE_SERVER";
pub const DATABASE_USERNAME_VAR: &str = "APP_DATABASE_USERNAME";
pub const DATABASE_PASSWORD_VAR: &str = "APP_DATABASE_PASSWORD";
pub const DATABASE_NAME_VAR: &str = "APP_DATABASE_NAME";
pub const DATABASE_PREFIX_VAR: &str = "APP_DATABASE_PREFIX";
pub const DATABASE_SUFFIX_VAR: &str = "APP_DATABASE_SUFFIX";
pub const DATABASE_CHOOSE_NAME_VAR: &str = "APP_DATABASE_CHOOSE_NAME";

/// Driver used when `APP_DATABASE_CLASS` is unset.
pub const DEFAULT_DRIVER: &str = "sqlite";
/// Name used for in-memory SQLite databases.
pub const MEMORY_DATABASE: &str = ":memory:";

static NAME_SANITIZER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]+").expect("name sanitizer pattern is valid"));

/// Resolved database identity.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub driver: String,
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database name, with prefix and suffix applied.
    pub database: Option<String>,
    /// Directory relative file names resolve against.
    pub base_path: PathBuf,
}

impl DatabaseConfig {
    /// Reads the identity from variables.
    ///
    /// When no name is set and `APP_DATABASE_CHOOSE_NAME` is truthy (or a
    /// level count), the name is derived from `base_path` or one of its
    /// parents.
    pub fn from_vars(vars: &dyn VarSource, base_path: &Path) -> Self {
        let non_empty = |name: &str| vars.var(name).filter(|value| !value.trim().is_empty());
        let name = non_empty(DATABASE_NAME_VAR).or_else(|| {
            non_empty(DATABASE_CHOOSE_NAME_VAR).and_then(|raw| choose_database_name(base_path, &raw))
        });
        let database = name.map(|name| {
            format!(
                "{}{}{}",
                non_empty(DATABASE_PREFIX_VAR).unwrap_or_default(),
                name,
                non_empty(DATABASE_SUFFIX_VAR).unwrap_or_default()
            )
        });

        Self {
            driver: non_empty(DATABASE_CLASS_VAR)
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_else(|| DEFAULT_DRIVER.to_string()),
            server: non_empty(DATABASE_SERVER_VAR),
            username: non_empty(DATABASE_USERNAME_VAR),
            password: non_empty(DATABASE_PASSWORD_VAR),
            database,
            base_path: base_path.to_path_buf(),
        }
    }

    pub fn has_identity(&self) -> bool {
        self.database
            .as_deref()
            .is_some_and(|name| !name.trim().is_empty())
    }

    /// File the database lives in; relative names resolve against
    /// `base_path`. `None` for in-memory or unnamed databases.
    pub fn file_path(&self) -> Option<PathBuf> {
        let name = self.database.as_deref()?.trim();
        if name.is_empty() || name == MEMORY_DATABASE {
            return None;
        }
        let path = Path::new(name);
        if path.is_absolute() {
            Some(path.to_path_buf())
        } else {
            Some(self.base_path.join(path))
        }
    }
}

impl Debug for DatabaseConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("driver", &self.driver)
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("base_path", &self.base_path)
            .finish()
    }
}

/// Derives `app_<dirname>` from `base_path`, climbing `levels - 1` parents.
fn choose_database_name(base_path: &Path, raw: &str) -> Option<String> {
    let levels = match raw.trim().parse::<usize>() {
        Ok(levels) => levels.max(1),
        Err(_) if is_truthy(raw) => 1,
        Err(_) => return None,
    };
    let mut dir = base_path;
    for _ in 1..levels {
        dir = dir.parent()?;
    }
    let dirname = dir.file_name()?.to_string_lossy();
    let cleaned = NAME_SANITIZER.replace_all(&dirname, "");
    if cleaned.is_empty() {
        return None;
    }
    Some(format!("app_{cleaned}"))
}

/// Database validation errors.
#[derive(Debug)]
pub enum DatabaseError {
    MissingIdentity,
    UnsupportedDriver(String),
    Sqlite(rusqlite::Error),
}

impl Display for DatabaseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingIdentity => write!(f, "database name is not configured"),
            Self::UnsupportedDriver(driver) => {
                write!(f, "database driver `{driver}` is not supported")
            }
            Self::Sqlite(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DatabaseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::MissingIdentity | Self::UnsupportedDriver(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// Connectivity probe used by the kernel's validation stage.
pub trait DatabaseConnector {
    fn validate(&self, config: &DatabaseConfig) -> Result<(), DatabaseError>;
}

/// SQLite probe: opens (creating if needed) the named file and runs a query.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

impl DatabaseConnector for SqliteConnector {
    fn validate(&self, config: &DatabaseConfig) -> Result<(), DatabaseError> {
        if config.driver != DEFAULT_DRIVER {
            return Err(DatabaseError::UnsupportedDriver(config.driver.clone()));
        }
        if !config.has_identity() {
            return Err(DatabaseError::MissingIdentity);
        }

        let started_at = Instant::now();
        let conn = match config.file_path() {
            Some(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            ),
            None => Connection::open_in_memory(),
        };
        let probe = conn.and_then(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)));
        match probe {
            Ok(_) => {
                info!(
                    "event=db_validate module=database status=ok driver=sqlite duration_ms={}",
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=db_validate module=database status=error driver=sqlite duration_ms={} error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DatabaseConfig, DatabaseConnector, DatabaseError, SqliteConnector, DATABASE_CHOOSE_NAME_VAR,
        DATABASE_CLASS_VAR, DATABASE_NAME_VAR, DATABASE_PASSWORD_VAR, DATABASE_PREFIX_VAR,
        DATABASE_SUFFIX_VAR,
    };
    use crate::environment::MapEnv;
    use std::path::Path;

    #[test]
    fn reads_identity_with_prefix_and_suffix() {
        let vars = MapEnv::from_pairs([
            (DATABASE_NAME_VAR, "site"),
            (DATABASE_PREFIX_VAR, "pre_"),
            (DATABASE_SUFFIX_VAR, "_test"),
            (DATABASE_PASSWORD_VAR, "hunter2"),
        ]);
        let config = DatabaseConfig::from_vars(&vars, Path::new("/srv/site"));
        assert_eq!(config.driver, "sqlite");
        assert_eq!(config.database.as_deref(), Some("pre_site_test"));
        assert!(config.has_identity());
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn chooses_name_from_directory_levels() {
        let vars = MapEnv::from_pairs([(DATABASE_CHOOSE_NAME_VAR, "2")]);
        let config = DatabaseConfig::from_vars(&vars, Path::new("/srv/my-site/public"));
        assert_eq!(config.database.as_deref(), Some("app_mysite"));

        let vars = MapEnv::from_pairs([(DATABASE_CHOOSE_NAME_VAR, "true")]);
        let config = DatabaseConfig::from_vars(&vars, Path::new("/srv/my-site/public"));
        assert_eq!(config.database.as_deref(), Some("app_public"));
    }

    #[test]
    fn empty_name_has_no_identity() {
        let vars = MapEnv::from_pairs([(DATABASE_NAME_VAR, "  ")]);
        let config = DatabaseConfig::from_vars(&vars, Path::new("/srv/site"));
        assert!(!config.has_identity());
    }

    #[test]
    fn sqlite_connector_probes_file_and_memory_databases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("site.sqlite3");
        let vars = MapEnv::from_pairs([(DATABASE_NAME_VAR, path.to_str().expect("utf-8 path"))]);
        let config = DatabaseConfig::from_vars(&vars, dir.path());
        SqliteConnector.validate(&config).expect("file database");
        assert!(path.exists());

        let vars = MapEnv::from_pairs([(DATABASE_NAME_VAR, ":memory:")]);
        SqliteConnector
            .validate(&DatabaseConfig::from_vars(&vars, dir.path()))
            .expect("memory database");
    }

    #[test]
    fn relative_names_resolve_against_base_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vars = MapEnv::from_pairs([(DATABASE_NAME_VAR, "data/site.sqlite3")]);
        let config = DatabaseConfig::from_vars(&vars, dir.path());
        let expected = dir.path().join("data").join("site.sqlite3");
        assert_eq!(config.file_path(), Some(expected.clone()));

        std::fs::create_dir(dir.path().join("data")).expect("data dir");
        SqliteConnector.validate(&config).expect("relative file database");
        assert!(expected.exists());

        let memory = DatabaseConfig::from_vars(
            &MapEnv::from_pairs([(DATABASE_NAME_VAR, ":memory:")]),
            dir.path(),
        );
        assert_eq!(memory.file_path(), None);
    }

    #[test]
    fn sqlite_connector_rejects_other_drivers() {
        let vars = MapEnv::from_pairs([(DATABASE_NAME_VAR, "site"), (DATABASE_CLASS_VAR, "MySQL")]);
        let err = SqliteConnector
            .validate(&DatabaseConfig::from_vars(&vars, Path::new("/srv")))
            .expect_err("mysql is unsupported");
        assert!(matches!(err, DatabaseError::UnsupportedDriver(driver) if driver == "mysql"));
    }
}
