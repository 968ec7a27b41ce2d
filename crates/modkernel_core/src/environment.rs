//! Environment type resolution and environment variable access.
//!
//! # Responsibility
//! - Resolve dev/test/live from explicit, session, variable and default
//!   sources in that priority.
//! - Abstract variable access so kernels can run against an isolated map.
//! - Load `.env` files without overriding variables that are already set.
//!
//! # Invariants
//! - An explicit value outside `{dev, test, live}` is rejected and never
//!   stored.
//! - Unknown variable values are ignored, not propagated.

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

/// Variable holding the environment type.
pub const ENVIRONMENT_TYPE_VAR: &str = "APP_ENVIRONMENT_TYPE";
/// Session key forcing `dev`.
pub const SESSION_DEV_KEY: &str = "isDev";
/// Session key forcing `test`.
pub const SESSION_TEST_KEY: &str = "isTest";

static ENV_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*?)\s*$")
        .expect("env line pattern is valid")
});

/// Runtime environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvironmentType {
    Dev,
    Test,
    Live,
}

impl EnvironmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Live => "live",
        }
    }

    /// Parses one of `dev|test|live` (exact, lowercase).
    pub fn parse(value: &str) -> Result<Self, EnvironmentError> {
        match value {
            "dev" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "live" => Ok(Self::Live),
            other => Err(EnvironmentError::InvalidEnvironmentValue(other.to_string())),
        }
    }
}

impl Display for EnvironmentType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment resolution errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    InvalidEnvironmentValue(String),
}

impl Display for EnvironmentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEnvironmentValue(value) => write!(
                f,
                "invalid environment value `{value}`; expected dev|test|live or none"
            ),
        }
    }
}

impl Error for EnvironmentError {}

/// Environment variable access.
pub trait VarSource {
    fn var(&self, name: &str) -> Option<String>;
    fn set_var(&self, name: &str, value: &str);
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl VarSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn set_var(&self, name: &str, value: &str) {
        std::env::set_var(name, value);
    }
}

/// In-memory variables, isolated from the process environment.
#[derive(Debug, Default)]
pub struct MapEnv {
    vars: RefCell<BTreeMap<String, String>>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let env = Self::new();
        for (name, value) in pairs {
            env.set_var(name, value);
        }
        env
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        self.vars.borrow_mut().remove(name)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.vars.borrow().clone()
    }
}

impl VarSource for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.borrow().get(name).cloned()
    }

    fn set_var(&self, name: &str, value: &str) {
        self.vars
            .borrow_mut()
            .insert(name.to_string(), value.to_string());
    }
}

/// Mutable per-session bag used for temporary environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionBag {
    values: BTreeMap<String, String>,
}

impl SessionBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn clear(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Whether `key` holds a truthy flag (`1`, `true`, `yes`, `on`).
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some_and(is_truthy)
    }
}

/// Returns whether a flag-like string is truthy.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Environment type resolution state held by a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentResolver {
    explicit: Option<EnvironmentType>,
}

impl EnvironmentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn explicit(&self) -> Option<EnvironmentType> {
        self.explicit
    }

    /// Sets or clears the explicit override.
    ///
    /// Leaves the current value untouched when `value` is invalid.
    pub fn set(&mut self, value: Option<&str>) -> Result<(), EnvironmentError> {
        self.explicit = value.map(EnvironmentType::parse).transpose()?;
        Ok(())
    }

    /// Resolves explicit > session > variable > `live`.
    pub fn resolve(&self, vars: &dyn VarSource, session: Option<&SessionBag>) -> EnvironmentType {
        if let Some(explicit) = self.explicit {
            return explicit;
        }
        if let Some(from_session) = session.and_then(session_environment) {
            return from_session;
        }
        if let Some(raw) = vars.var(ENVIRONMENT_TYPE_VAR) {
            match EnvironmentType::parse(raw.trim()) {
                Ok(value) => return value,
                Err(err) => warn!(
                    "event=environment_resolve module=environment status=error var={ENVIRONMENT_TYPE_VAR} error={err}"
                ),
            }
        }
        EnvironmentType::Live
    }
}

fn session_environment(session: &SessionBag) -> Option<EnvironmentType> {
    if session.is_set(SESSION_DEV_KEY) {
        return Some(EnvironmentType::Dev);
    }
    if session.is_set(SESSION_TEST_KEY) {
        return Some(EnvironmentType::Test);
    }
    None
}

/// Loads `KEY=value` lines from `path` into `vars`.
///
/// Blank lines and `#` comments are skipped; single or double quotes around
/// a value are stripped; variables that already have a value are kept.
/// Returns the number of variables set.
pub fn load_env_file(path: &Path, vars: &dyn VarSource) -> std::io::Result<usize> {
    let raw = fs::read_to_string(path)?;
    let mut applied = 0;
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(captures) = ENV_LINE.captures(trimmed) else {
            continue;
        };
        let name = &captures[1];
        if vars.var(name).is_some() {
            continue;
        }
        vars.set_var(name, &unquote(&captures[2]));
        applied += 1;
    }
    Ok(applied)
}

fn unquote(raw: &str) -> String {
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    match raw.find(" #") {
        Some(index) => raw[..index].trim_end().to_string(),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        load_env_file, EnvironmentError, EnvironmentResolver, EnvironmentType, MapEnv,
        SessionBag, VarSource, ENVIRONMENT_TYPE_VAR, SESSION_DEV_KEY, SESSION_TEST_KEY,
    };
    use std::fs;

    #[test]
    fn defaults_to_live() {
        let resolver = EnvironmentResolver::new();
        assert_eq!(resolver.resolve(&MapEnv::new(), None), EnvironmentType::Live);
    }

    #[test]
    fn priority_is_explicit_then_session_then_variable() {
        let vars = MapEnv::from_pairs([(ENVIRONMENT_TYPE_VAR, "live")]);
        let mut session = SessionBag::new();
        session.set(SESSION_TEST_KEY, "1");
        let mut resolver = EnvironmentResolver::new();

        assert_eq!(resolver.resolve(&vars, None), EnvironmentType::Live);
        assert_eq!(resolver.resolve(&vars, Some(&session)), EnvironmentType::Test);
        session.set(SESSION_DEV_KEY, "true");
        assert_eq!(resolver.resolve(&vars, Some(&session)), EnvironmentType::Dev);

        resolver.set(Some("live")).expect("live is valid");
        assert_eq!(resolver.resolve(&vars, Some(&session)), EnvironmentType::Live);
        resolver.set(None).expect("clearing is valid");
        assert_eq!(resolver.resolve(&vars, Some(&session)), EnvironmentType::Dev);
    }

    #[test]
    fn invalid_explicit_value_leaves_state_unchanged() {
        let mut resolver = EnvironmentResolver::new();
        resolver.set(Some("dev")).expect("dev is valid");
        let err = resolver.set(Some("staging")).expect_err("staging is invalid");
        assert_eq!(
            err,
            EnvironmentError::InvalidEnvironmentValue("staging".to_string())
        );
        assert_eq!(resolver.explicit(), Some(EnvironmentType::Dev));
    }

    #[test]
    fn invalid_variable_value_falls_back_to_live() {
        let vars = MapEnv::from_pairs([(ENVIRONMENT_TYPE_VAR, "staging")]);
        assert_eq!(
            EnvironmentResolver::new().resolve(&vars, None),
            EnvironmentType::Live
        );
    }

    #[test]
    fn env_file_does_not_override_existing_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# comment\nAPP_DATABASE_NAME=\"site db\"\nexport APP_ENVIRONMENT_TYPE=dev\nAPP_DATABASE_SERVER=localhost # inline\n\nnot a line\n",
        )
        .expect("write .env");
        let vars = MapEnv::from_pairs([(ENVIRONMENT_TYPE_VAR, "test")]);

        let applied = load_env_file(&path, &vars).expect("load");
        assert_eq!(applied, 2);
        assert_eq!(vars.var("APP_DATABASE_NAME").as_deref(), Some("site db"));
        assert_eq!(vars.var("APP_DATABASE_SERVER").as_deref(), Some("localhost"));
        assert_eq!(vars.var(ENVIRONMENT_TYPE_VAR).as_deref(), Some("test"));
    }
}
