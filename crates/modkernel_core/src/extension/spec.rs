//! Extension specifications as written in config.
//!
//! A specification is either a bare name (`Painter`) or a name with
//! constructor arguments (`Painter("red", 'matte')`). Config lists of
//! specifications merge across classes; a keyed `null` removes an entry
//! declared by a less specific class.

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fmt::{Display, Formatter};

static SPEC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_\\]*)\s*(?:\((.*)\))?\s*$")
        .expect("extension spec pattern is valid")
});

static ARG_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""([^"]*)"|'([^']*)'|([^,\s]+)"#).expect("extension arg pattern is valid")
});

/// Parsed extension specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl ExtensionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Parses `Name` or `Name(args...)`; `None` when malformed.
    pub fn parse(raw: &str) -> Option<Self> {
        let captures = SPEC_PATTERN.captures(raw)?;
        let name = captures.get(1)?.as_str().to_string();
        let args = captures
            .get(2)
            .map(|inner| {
                ARG_PATTERN
                    .captures_iter(inner.as_str())
                    .filter_map(|arg| {
                        arg.get(1)
                            .or_else(|| arg.get(2))
                            .or_else(|| arg.get(3))
                            .map(|value| value.as_str().to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self { name, args })
    }

    /// Lowercase key used to dedupe and look up extension instances.
    pub fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    /// Whether a raw config entry names `name`, either exactly or as
    /// `name(...)`. Case-insensitive.
    pub fn raw_matches(candidate: &str, name: &str) -> bool {
        let name = name.trim().to_ascii_lowercase();
        match Self::parse(candidate) {
            Some(spec) => spec.key() == name,
            None => candidate.trim().eq_ignore_ascii_case(&name),
        }
    }
}

impl Display for ExtensionSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.args.is_empty() {
            return f.write_str(&self.name);
        }
        let args: Vec<String> = self.args.iter().map(|arg| format!("\"{arg}\"")).collect();
        write!(f, "{}({})", self.name, args.join(", "))
    }
}

/// One merged entry of an `extensions` config value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionEntry {
    pub key: String,
    /// `None` when a more specific class nulled the entry.
    pub spec: Option<ExtensionSpec>,
    /// Class whose config declared the entry.
    pub declared_by: String,
}

/// Ordered merge of `extensions` values along an ancestry chain.
#[derive(Debug, Clone, Default)]
pub struct ExtensionEntries {
    entries: Vec<ExtensionEntry>,
}

impl ExtensionEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one class's `extensions` value.
    ///
    /// Lists append (keyed by extension name), maps override by key and a
    /// `null` map value removes the entry.
    pub fn merge_value(&mut self, declared_by: &str, value: &Value) {
        match value {
            Value::Array(items) => {
                for item in items {
                    if let Value::String(raw) = item {
                        self.merge_raw(declared_by, None, raw);
                    }
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    match item {
                        Value::String(raw) => self.merge_raw(declared_by, Some(key), raw),
                        Value::Null => self.upsert(ExtensionEntry {
                            key: key.to_ascii_lowercase(),
                            spec: None,
                            declared_by: declared_by.to_string(),
                        }),
                        _ => {}
                    }
                }
            }
            Value::String(raw) => self.merge_raw(declared_by, None, raw),
            _ => {}
        }
    }

    /// Entries that are still enabled, in merge order.
    pub fn active(&self) -> impl Iterator<Item = (&ExtensionEntry, &ExtensionSpec)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.spec.as_ref().map(|spec| (entry, spec)))
    }

    pub fn specs(&self) -> Vec<ExtensionSpec> {
        self.active().map(|(_, spec)| spec.clone()).collect()
    }

    fn merge_raw(&mut self, declared_by: &str, key: Option<&String>, raw: &str) {
        let Some(spec) = ExtensionSpec::parse(raw) else {
            warn!(
                "event=extension_config module=extension status=error class={declared_by} error_code=malformed_spec spec={raw}"
            );
            return;
        };
        let key = key.map_or_else(|| spec.key(), |value| value.to_ascii_lowercase());
        self.upsert(ExtensionEntry {
            key,
            spec: Some(spec),
            declared_by: declared_by.to_string(),
        });
    }

    fn upsert(&mut self, entry: ExtensionEntry) {
        match self.entries.iter_mut().find(|existing| existing.key == entry.key) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }
}
