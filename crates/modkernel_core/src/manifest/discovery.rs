//! Class/module discovery and manifest caching.
//!
//! # Responsibility
//! - Turn a root path into class and module manifests.
//! - Serve repeated boots from a cache provider until a flush is requested.
//!
//! # Invariants
//! - A class may be declared by exactly one module.
//! - Cache failures never fail discovery; they are logged and skipped.
//!
//! Filesystem layout read by [`FsDiscovery`]: `module.json` in the root
//! directory and in each immediate subdirectory.

use super::class::{ClassManifest, ClassRecord};
use super::module::{Module, ModuleManifest};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

/// File name marking a directory as a module.
pub const MODULE_MARKER: &str = "module.json";

/// Class and module manifests produced by one discovery run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredManifests {
    pub classes: ClassManifest,
    pub modules: ModuleManifest,
}

/// Discovery service contract.
pub trait Discovery {
    fn discover(&self, root: &Path) -> Result<DiscoveredManifests, DiscoveryError>;
}

/// Cache provider contract keyed by discovery root.
pub trait ManifestCache {
    fn load(&self, key: &str) -> Option<DiscoveredManifests>;
    fn store(&self, key: &str, manifests: &DiscoveredManifests) -> Result<(), DiscoveryError>;
    fn clear(&self) -> Result<(), DiscoveryError>;
}

/// Discovery and cache errors.
#[derive(Debug)]
pub enum DiscoveryError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    DuplicateClass {
        class: String,
        first_module: String,
        second_module: String,
    },
}

impl Display for DiscoveryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "failed to read `{}`: {source}", path.display()),
            Self::Parse { path, source } => {
                write!(f, "failed to parse `{}`: {source}", path.display())
            }
            Self::DuplicateClass {
                class,
                first_module,
                second_module,
            } => write!(
                f,
                "class `{class}` is declared by both `{first_module}` and `{second_module}`"
            ),
        }
    }
}

impl Error for DiscoveryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::DuplicateClass { .. } => None,
        }
    }
}

/// Runs discovery through `cache`.
///
/// With `flush` the cache is cleared and discovery always runs; otherwise a
/// cached result for `root` is returned when present.
pub fn discover_cached(
    discovery: &dyn Discovery,
    cache: &dyn ManifestCache,
    root: &Path,
    flush: bool,
) -> Result<DiscoveredManifests, DiscoveryError> {
    let key = root.to_string_lossy().into_owned();
    if flush {
        if let Err(err) = cache.clear() {
            warn!("event=manifest_cache module=manifest status=error op=clear error={err}");
        }
    } else if let Some(hit) = cache.load(&key) {
        debug!("event=manifest_cache module=manifest status=ok op=hit root={key}");
        return Ok(hit);
    }

    let discovered = discovery.discover(root)?;
    if let Err(err) = cache.store(&key, &discovered) {
        warn!("event=manifest_cache module=manifest status=error op=store error={err}");
    }
    Ok(discovered)
}

/// Declaration format of `module.json`.
#[derive(Debug, Deserialize)]
struct ModuleDeclaration {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    project: bool,
    #[serde(default)]
    classes: Vec<ClassRecord>,
    #[serde(default)]
    config: Map<String, Value>,
}

/// Filesystem discovery over `module.json` declarations.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDiscovery;

impl Discovery for FsDiscovery {
    fn discover(&self, root: &Path) -> Result<DiscoveredManifests, DiscoveryError> {
        let mut candidates = vec![root.to_path_buf()];
        let entries = fs::read_dir(root).map_err(|source| DiscoveryError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let mut subdirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DiscoveryError::Io {
                path: root.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                subdirs.push(path);
            }
        }
        subdirs.sort();
        candidates.extend(subdirs);

        let mut manifests = DiscoveredManifests::default();
        for dir in candidates {
            let marker = dir.join(MODULE_MARKER);
            if !marker.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&marker).map_err(|source| DiscoveryError::Io {
                path: marker.clone(),
                source,
            })?;
            let declaration: ModuleDeclaration =
                serde_json::from_str(&raw).map_err(|source| DiscoveryError::Parse {
                    path: marker.clone(),
                    source,
                })?;
            register_declaration(&mut manifests, &dir, declaration)?;
        }
        debug!(
            "event=discovery module=manifest status=ok root={} classes={} modules={}",
            root.display(),
            manifests.classes.len(),
            manifests.modules.len()
        );
        Ok(manifests)
    }
}

fn register_declaration(
    manifests: &mut DiscoveredManifests,
    dir: &Path,
    declaration: ModuleDeclaration,
) -> Result<(), DiscoveryError> {
    let name = declaration.name.unwrap_or_else(|| {
        dir.file_name()
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string())
    });

    for mut record in declaration.classes {
        if let Some(existing) = manifests.classes.get(&record.name) {
            return Err(DiscoveryError::DuplicateClass {
                class: record.name.clone(),
                first_module: existing.module.clone().unwrap_or_default(),
                second_module: name,
            });
        }
        record.module = Some(name.clone());
        manifests.classes.add_class(record);
    }

    manifests.modules.add_module(Module {
        name,
        path: dir.to_path_buf(),
        project: declaration.project,
        config: declaration.config,
    });
    Ok(())
}

/// Discovery over a fixed, in-memory result.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    manifests: DiscoveredManifests,
    runs: Cell<usize>,
}

impl StaticDiscovery {
    pub fn new(classes: ClassManifest, modules: ModuleManifest) -> Self {
        Self {
            manifests: DiscoveredManifests { classes, modules },
            runs: Cell::new(0),
        }
    }

    /// Number of times `discover` ran.
    pub fn runs(&self) -> usize {
        self.runs.get()
    }
}

impl Discovery for StaticDiscovery {
    fn discover(&self, _root: &Path) -> Result<DiscoveredManifests, DiscoveryError> {
        self.runs.set(self.runs.get() + 1);
        Ok(self.manifests.clone())
    }
}

/// Process-lifetime cache held in memory.
#[derive(Debug, Default)]
pub struct MemoryManifestCache {
    entries: RefCell<HashMap<String, DiscoveredManifests>>,
}

impl MemoryManifestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl ManifestCache for MemoryManifestCache {
    fn load(&self, key: &str) -> Option<DiscoveredManifests> {
        self.entries.borrow().get(key).cloned()
    }

    fn store(&self, key: &str, manifests: &DiscoveredManifests) -> Result<(), DiscoveryError> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), manifests.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), DiscoveryError> {
        self.entries.borrow_mut().clear();
        Ok(())
    }
}

/// Cache persisted as one JSON file per root under `dir`.
#[derive(Debug, Clone)]
pub struct FileManifestCache {
    dir: PathBuf,
}

impl FileManifestCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// One file per key; the key bytes are hex-encoded so distinct roots
    /// never share a file.
    fn entry_path(&self, key: &str) -> PathBuf {
        let encoded: String = key.bytes().map(|byte| format!("{byte:02x}")).collect();
        self.dir.join(format!("manifest-{encoded}.json"))
    }
}

impl ManifestCache for FileManifestCache {
    fn load(&self, key: &str) -> Option<DiscoveredManifests> {
        let path = self.entry_path(key);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(manifests) => Some(manifests),
            Err(err) => {
                warn!(
                    "event=manifest_cache module=manifest status=error op=load path={} error={err}",
                    path.display()
                );
                None
            }
        }
    }

    fn store(&self, key: &str, manifests: &DiscoveredManifests) -> Result<(), DiscoveryError> {
        fs::create_dir_all(&self.dir).map_err(|source| DiscoveryError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.entry_path(key);
        let raw = serde_json::to_string(manifests).map_err(|source| DiscoveryError::Parse {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, raw).map_err(|source| DiscoveryError::Io { path, source })
    }

    fn clear(&self) -> Result<(), DiscoveryError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(DiscoveryError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_cache_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("manifest") && name.ends_with(".json"));
            if is_cache_file {
                fs::remove_file(&path).map_err(|source| DiscoveryError::Io { path, source })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        discover_cached, Discovery, DiscoveryError, FileManifestCache, FsDiscovery,
        ManifestCache, MemoryManifestCache, StaticDiscovery,
    };
    use crate::manifest::class::{ClassManifest, ClassRecord};
    use crate::manifest::module::ModuleManifest;
    use std::fs;
    use std::path::Path;

    fn write_module(dir: &Path, body: &str) {
        fs::create_dir_all(dir).expect("module dir");
        fs::write(dir.join("module.json"), body).expect("module.json");
    }

    #[test]
    fn fs_discovery_reads_root_and_subdirectories() {
        let root = tempfile::tempdir().expect("tempdir");
        write_module(
            root.path(),
            r#"{"name": "app", "project": true, "classes": [{"name": "Page", "parent": "Widget"}]}"#,
        );
        write_module(
            &root.path().join("core"),
            r#"{"classes": [{"name": "Widget"}], "config": {"Widget": {"colour": "red"}}}"#,
        );

        let found = FsDiscovery.discover(root.path()).expect("discovery");
        assert_eq!(found.classes.len(), 2);
        assert_eq!(
            found.classes.get("page").and_then(|c| c.module.as_deref()),
            Some("app")
        );
        let core = found.modules.module("core").expect("core module");
        assert!(!core.project);
        assert_eq!(core.config["Widget"]["colour"], "red");
    }

    #[test]
    fn fs_discovery_rejects_duplicate_classes() {
        let root = tempfile::tempdir().expect("tempdir");
        write_module(&root.path().join("a"), r#"{"classes": [{"name": "Widget"}]}"#);
        write_module(&root.path().join("b"), r#"{"classes": [{"name": "widget"}]}"#);

        let err = FsDiscovery
            .discover(root.path())
            .expect_err("duplicate class must fail");
        assert!(matches!(err, DiscoveryError::DuplicateClass { .. }));
    }

    #[test]
    fn fs_discovery_reports_parse_errors_with_path() {
        let root = tempfile::tempdir().expect("tempdir");
        write_module(root.path(), "{not json");
        let err = FsDiscovery.discover(root.path()).expect_err("parse must fail");
        assert!(err.to_string().contains("module.json"));
    }

    #[test]
    fn cached_discovery_skips_rerun_until_flush() {
        let discovery = StaticDiscovery::new(
            ClassManifest::from_records([ClassRecord::new("Widget")]),
            ModuleManifest::new(),
        );
        let cache = MemoryManifestCache::new();
        let root = Path::new("/site");

        discover_cached(&discovery, &cache, root, false).expect("first run");
        discover_cached(&discovery, &cache, root, false).expect("cached run");
        assert_eq!(discovery.runs(), 1);

        discover_cached(&discovery, &cache, root, true).expect("flush run");
        assert_eq!(discovery.runs(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn file_cache_round_trips_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = FileManifestCache::new(dir.path().join("cache"));
        let discovery = StaticDiscovery::new(
            ClassManifest::from_records([ClassRecord::new("Widget")]),
            ModuleManifest::new(),
        );
        let found = discovery.discover(Path::new("/site")).expect("discover");

        cache.store("/site", &found).expect("store");
        assert_eq!(cache.load("/site"), Some(found));
        cache.clear().expect("clear");
        assert!(cache.load("/site").is_none());
    }

    #[test]
    fn file_cache_keeps_similar_roots_apart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = FileManifestCache::new(dir.path().join("cache"));
        let nested = StaticDiscovery::new(
            ClassManifest::from_records([ClassRecord::new("NestedSite")]),
            ModuleManifest::new(),
        )
        .discover(Path::new("/srv/a/b"))
        .expect("discover nested");
        let flat = StaticDiscovery::new(
            ClassManifest::from_records([ClassRecord::new("FlatSite")]),
            ModuleManifest::new(),
        )
        .discover(Path::new("/srv/a_b"))
        .expect("discover flat");

        cache.store("/srv/a/b", &nested).expect("store nested");
        assert!(cache.load("/srv/a_b").is_none());

        cache.store("/srv/a_b", &flat).expect("store flat");
        assert_eq!(cache.load("/srv/a/b"), Some(nested));
        assert_eq!(cache.load("/srv/a_b"), Some(flat));
    }
}
