//! Fragment discovery and merging.
//!
//! An entry fragment names other fragments through `includes`. Header
//! fragments are prepended as raw text to every compose fragment before it is
//! parsed; compose fragments are parsed and deep-merged in discovery order.

use super::cache::FileCache;
use super::template;
use super::{deep_merge, key_string, Provenance, OVERRIDE_KEY, TRACKED_SECTIONS};
use crate::error::{DsppError, Result};
use crate::paths;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Prefix of the unique keys that stand in for `<<<` until the merge is done.
const OVERRIDE_MARKER: &str = "<<<#";

/// Kind of an included fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// Raw text prepended to every compose fragment.
    Header,
    /// Parsed and merged into the stack.
    Compose,
}

/// The fragment set of one stack.
#[derive(Debug, Clone)]
pub struct StackSources {
    pub project_root: PathBuf,
    pub entry: PathBuf,
    pub stack_name: String,
    pub header_files: Vec<PathBuf>,
    pub compose_files: Vec<PathBuf>,
}

/// Result of merging all compose fragments.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub document: Value,
    pub provenance: Provenance,
}

impl StackSources {
    /// Walk `includes` from the entry fragment.
    #[instrument(skip_all, fields(entry = %entry.display()))]
    pub fn discover(project_root: &Path, entry: &Path, cache: &FileCache) -> Result<Self> {
        let project_root = paths::normalize(project_root);
        let entry = if entry.is_absolute() {
            paths::normalize(entry)
        } else {
            paths::normalize(&project_root.join(entry))
        };

        let manifest = read_manifest(&entry, cache)?;
        let stack_name = manifest
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                entry.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
            });

        let mut sources = Self {
            project_root,
            entry: entry.clone(),
            stack_name,
            header_files: Vec::new(),
            compose_files: Vec::new(),
        };
        sources.visit(&entry, cache)?;

        info!(
            stack = %sources.stack_name,
            compose = sources.compose_files.len(),
            headers = sources.header_files.len(),
            "Fragments discovered"
        );
        Ok(sources)
    }

    fn visit(&mut self, file: &Path, cache: &FileCache) -> Result<()> {
        if self.compose_files.iter().any(|f| f == file) {
            return Ok(());
        }
        debug!(file = %file.display(), "Parsing entries");
        self.compose_files.push(file.to_path_buf());

        let manifest = read_manifest(file, cache)?;
        let Some(includes) = manifest.get("includes").and_then(Value::as_sequence) else {
            return Ok(());
        };

        let base = file.parent().unwrap_or(&self.project_root).to_path_buf();
        for line in includes {
            let (kind, pattern) = match parse_include(line) {
                Some(include) => include,
                None => {
                    warn!(file = %file.display(), include = ?line, "Ignoring malformed include");
                    continue;
                }
            };

            let matches = expand(&base, &pattern)?;
            if matches.is_empty() {
                warn!("Empty expansion from {}", pattern);
            }

            for path in matches {
                match kind {
                    FragmentKind::Header => {
                        if !self.header_files.contains(&path) {
                            self.header_files.push(path);
                        }
                    }
                    FragmentKind::Compose => self.visit(&path, cache)?,
                }
            }
        }
        Ok(())
    }

    /// Concatenated header text, one header per block.
    pub fn header_text(&self, cache: &FileCache) -> Result<String> {
        let mut env = String::new();
        for header in &self.header_files {
            env.push_str(&cache.read_to_string(header)?);
            env.push('\n');
        }
        Ok(env)
    }

    /// Parse and merge every compose fragment.
    #[instrument(skip(self, cache, defines), fields(stack = %self.stack_name))]
    pub fn load(
        &self,
        cache: &FileCache,
        defines: &BTreeMap<String, String>,
    ) -> Result<LoadedDocument> {
        let env = self.header_text(cache)?;
        let scope = template::context(defines);
        let mut out = Value::Mapping(Default::default());
        let mut provenance = Provenance::new(&self.entry);
        let mut markers = 0usize;

        for compose_file in &self.compose_files {
            let body = format!("{}{}", env, cache.read_to_string(compose_file)?);
            let body = template::render(&body, &scope);

            let mut doc = parse_fragment(compose_file, &body)?;
            if doc.is_null() {
                continue;
            }
            mark_overrides(&mut doc, &mut markers);

            for section in TRACKED_SECTIONS {
                if let Some(entries) = doc.get(section).and_then(Value::as_mapping) {
                    for name in entries.keys() {
                        provenance.record(section, &key_string(name), compose_file);
                    }
                }
            }
            deep_merge(&mut out, doc);
        }

        apply_overrides(&mut out);
        Ok(LoadedDocument { document: out, provenance })
    }
}

fn parse_include(line: &Value) -> Option<(FragmentKind, String)> {
    match line {
        Value::String(path) => Some((FragmentKind::Compose, path.clone())),
        Value::Mapping(map) => {
            let path = map.get("path")?.as_str()?.to_string();
            let kind = match map.get("type").and_then(Value::as_str).unwrap_or("compose") {
                "header" => FragmentKind::Header,
                "compose" => FragmentKind::Compose,
                _ => return None,
            };
            Some((kind, path))
        }
        _ => None,
    }
}

fn expand(base: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        base.join(pattern)
    };
    let full = full.to_string_lossy().into_owned();
    let entries = glob::glob(&full).map_err(|e| DsppError::ParseFailure {
        path: PathBuf::from(&full),
        reason: format!("invalid include pattern: {}", e),
    })?;

    let mut matches: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .map(|path| paths::normalize(&path))
        .collect();
    matches.sort();
    Ok(matches)
}

/// Parse fragment text into a document, applying YAML-native `<<` merges.
pub fn parse_fragment(path: &Path, body: &str) -> Result<Value> {
    let failure = |e: serde_yaml::Error| DsppError::ParseFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let mut doc: Value = serde_yaml::from_str(body).map_err(failure)?;
    doc.apply_merge().map_err(failure)?;
    Ok(doc)
}

/// Read only what discovery needs (`name`, `includes`) from a fragment.
///
/// A fragment may use anchors defined in headers it does not see yet; when the
/// full parse fails, the top-level `name` and `includes` blocks are parsed on
/// their own.
fn read_manifest(path: &Path, cache: &FileCache) -> Result<Value> {
    let body = cache.read_to_string(path)?;
    if let Ok(doc) = serde_yaml::from_str::<Value>(&body) {
        return Ok(doc);
    }

    let snippet: String = ["name", "includes"]
        .iter()
        .filter_map(|key| top_level_block(&body, key))
        .collect::<Vec<_>>()
        .join("\n");
    serde_yaml::from_str(&snippet).map_err(|e| DsppError::ParseFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Extract the lines of one column-zero key and its indented block.
fn top_level_block(body: &str, key: &str) -> Option<String> {
    let mut lines = body.lines();
    let prefix = format!("{}:", key);
    let first = lines.by_ref().find(|line| line.starts_with(&prefix))?;

    let mut block = vec![first];
    for line in lines {
        let top_level = !line.is_empty() && !line.starts_with(&[' ', '\t', '#', '-'][..]);
        if top_level {
            break;
        }
        block.push(line);
    }
    Some(block.join("\n"))
}

/// Rename every `<<<` key to a unique, ordered marker so that overrides from
/// different fragments survive the merge side by side.
fn mark_overrides(value: &mut Value, counter: &mut usize) {
    match value {
        Value::Mapping(map) => {
            if let Some(drop) = map.remove(OVERRIDE_KEY) {
                *counter += 1;
                map.insert(Value::from(format!("{}{:06}", OVERRIDE_MARKER, counter)), drop);
            }
            for (_, v) in map.iter_mut() {
                mark_overrides(v, counter);
            }
        }
        Value::Sequence(seq) => seq.iter_mut().for_each(|v| mark_overrides(v, counter)),
        _ => {}
    }
}

/// Splice every marker's mapping over its parent, innermost first, in marker order.
fn apply_overrides(value: &mut Value) {
    let drops = match value {
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                apply_overrides(v);
            }
            let mut markers: Vec<Value> = map
                .keys()
                .filter(|k| k.as_str().map(|s| s.starts_with(OVERRIDE_MARKER)).unwrap_or(false))
                .cloned()
                .collect();
            markers.sort_by_key(key_string);
            markers.into_iter().filter_map(|k| map.remove(&k)).collect::<Vec<_>>()
        }
        Value::Sequence(seq) => {
            seq.iter_mut().for_each(apply_overrides);
            return;
        }
        _ => return,
    };

    for drop in drops {
        match drop {
            Value::Sequence(items) => items.into_iter().for_each(|item| deep_merge(value, item)),
            Value::Mapping(_) => deep_merge(value, drop),
            other => warn!(value = ?other, "Ignoring non-mapping override"),
        }
    }
}
