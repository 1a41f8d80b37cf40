//! Stack document model.
//!
//! A stack document is a plain `serde_yaml::Value` tree. Anything that must not
//! leak into the serialized stack (which fragment an entity came from) lives in
//! a [`Provenance`] side-table next to it.

pub mod cache;
pub mod loader;
pub mod template;
pub mod update;

pub use cache::FileCache;
pub use loader::{LoadedDocument, StackSources};

use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SERVICES: &str = "services";
pub const TASKS: &str = "tasks";
pub const CONFIGS: &str = "configs";
pub const SECRETS: &str = "secrets";
pub const VOLUMES: &str = "volumes";
pub const NETWORKS: &str = "networks";
pub const VERSION: &str = "version";

/// Sections whose entries get a provenance record.
pub const TRACKED_SECTIONS: [&str; 4] = [SERVICES, TASKS, CONFIGS, SECRETS];

/// Key marking a mapping to be deep-merged over its parent, overriding it.
pub const OVERRIDE_KEY: &str = "<<<";

/// Source fragment of every top-level entity, keyed by `(section, name)`.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    entries: BTreeMap<(String, String), PathBuf>,
    fallback: PathBuf,
}

impl Provenance {
    /// Create an empty table; unknown entities resolve to `fallback`.
    pub fn new(fallback: impl Into<PathBuf>) -> Self {
        Self { entries: BTreeMap::new(), fallback: fallback.into() }
    }

    /// Record (or overwrite) the fragment an entity came from.
    pub fn record(&mut self, section: &str, name: &str, fragment: &Path) {
        self.entries.insert((section.to_string(), name.to_string()), fragment.to_path_buf());
    }

    /// Fragment an entity came from.
    pub fn source_of(&self, section: &str, name: &str) -> &Path {
        self.entries
            .get(&(section.to_string(), name.to_string()))
            .map(PathBuf::as_path)
            .unwrap_or(&self.fallback)
    }

    /// Carry a record over to a renamed entity.
    pub fn alias(&mut self, section: &str, from: &str, to: &str) {
        let source = self.source_of(section, from).to_path_buf();
        self.record(section, to, &source);
    }
}

/// Deep-merge `overlay` into `base`.
///
/// Mappings merge recursively; every other value in `overlay` replaces the
/// value at the same path in `base`.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = value.is_mapping()
                    && base_map.get(&key).map(Value::is_mapping).unwrap_or(false);
                match base_map.get_mut(&key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Render a mapping key as the string it is sorted and addressed by.
pub fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim_end().to_string(),
    }
}

/// Return a copy of `value` with every mapping's keys in sorted order.
pub fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut entries: Vec<(&Value, &Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| key_string(k));
            let mut sorted = Mapping::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k.clone(), sort_keys(v));
            }
            Value::Mapping(sorted)
        }
        Value::Sequence(seq) => Value::Sequence(seq.iter().map(sort_keys).collect()),
        Value::Tagged(tagged) => {
            let mut tagged = tagged.as_ref().clone();
            tagged.value = sort_keys(&tagged.value);
            Value::Tagged(Box::new(tagged))
        }
        other => other.clone(),
    }
}

/// Borrow a top-level section as a mapping.
pub fn section<'a>(doc: &'a Value, name: &str) -> Option<&'a Mapping> {
    doc.get(name).and_then(Value::as_mapping)
}

/// Turn `value` into an empty mapping unless it already is one.
pub fn ensure_mapping(value: &mut Value) -> &mut Mapping {
    if !value.is_mapping() {
        *value = Value::Mapping(Mapping::new());
    }
    match value {
        Value::Mapping(map) => map,
        _ => unreachable!("value was just made a mapping"),
    }
}

/// Borrow a top-level section mutably, creating it when missing.
pub fn section_mut<'a>(doc: &'a mut Value, name: &str) -> &'a mut Mapping {
    let root = ensure_mapping(doc);
    let entry = root.entry(Value::from(name)).or_insert(Value::Null);
    ensure_mapping(entry)
}

/// Names of the entries in a section, in document order.
pub fn entry_names(doc: &Value, name: &str) -> Vec<String> {
    section(doc, name).map(|m| m.keys().map(key_string).collect()).unwrap_or_default()
}

/// Whether a value is absent, null, or an empty mapping/sequence.
pub fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Mapping(m)) => m.is_empty(),
        Some(Value::Sequence(s)) => s.is_empty(),
        _ => false,
    }
}

/// Truthiness in the sense used by descriptor flags (`external: true`, `x-trace: false`).
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_deep_merge_mappings_recurse() {
        let mut base = yaml("services: {web: {image: nginx, ports: [80]}}");
        deep_merge(&mut base, yaml("services: {web: {ports: [443]}, db: {image: pg}}"));
        assert_eq!(base, yaml("services: {web: {image: nginx, ports: [443]}, db: {image: pg}}"));
    }

    #[test]
    fn test_deep_merge_scalar_replaces_mapping() {
        let mut base = yaml("a: {b: 1}");
        deep_merge(&mut base, yaml("a: plain"));
        assert_eq!(base, yaml("a: plain"));
    }

    #[test]
    fn test_sort_keys_is_recursive() {
        let sorted = sort_keys(&yaml("b: {z: 1, a: 2}\na: [{y: 1, x: 2}]"));
        let rendered = serde_yaml::to_string(&sorted).unwrap();
        assert_eq!(rendered, "a:\n- x: 2\n  y: 1\nb:\n  a: 2\n  z: 1\n");
    }

    #[test]
    fn test_section_mut_creates_missing() {
        let mut doc = Value::Null;
        section_mut(&mut doc, CONFIGS).insert("a".into(), Value::Null);
        assert_eq!(entry_names(&doc, CONFIGS), vec!["a".to_string()]);
    }

    #[test]
    fn test_provenance_fallback() {
        let mut provenance = Provenance::new("/stack/manifest.yml");
        provenance.record(SERVICES, "web", Path::new("/stack/web.yml"));
        assert_eq!(provenance.source_of(SERVICES, "web"), Path::new("/stack/web.yml"));
        assert_eq!(provenance.source_of(SERVICES, "db"), Path::new("/stack/manifest.yml"));
    }
}
