//! Object resolution: turning config and secret descriptors into CAS entries.
//!
//! Descriptors are resolved layer by layer along the [`DescriptorGraph`].
//! Within a layer, content is produced concurrently (files, commands,
//! generators) and then fed to the CAS in name order, so the outcome does not
//! depend on which command finished first. After each layer every service and
//! task reference to a resolved logical name is rewritten to the canonical
//! name, with the line's target appended to the reference's own target.

pub mod descriptor;
pub mod exec;
pub mod generator;
pub mod graph;

pub use descriptor::{BundleLine, Descriptor, Format};
pub use generator::{FnGenerator, GenerateContext, Generator, GeneratorRegistry, StaticGenerator};
pub use graph::DescriptorGraph;

use crate::cas::{self, CasStore};
use crate::document::{self, FileCache, Provenance, CONFIGS, SERVICES, TASKS};
use crate::error::{DsppError, Result};
use crate::interpolate::{self, Scope};
use crate::paths;
use futures::stream::{self, StreamExt};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Trace shown in place of content that is not valid UTF-8.
pub const BINARY_TRACE: &str = "<binary>";

/// Number of hex characters of the content hash in a canonical name.
pub const CANONICAL_HASH_LEN: usize = 5;

/// Number of hex characters of the path hash in a directory fan-out name.
const FANOUT_HASH_LEN: usize = 4;

/// One resolved output of a descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLine {
    pub hash: String,
    /// CAS path of the content
    pub path: String,
    /// `{logical_name}-{hash prefix}`
    pub canonical_name: String,
    /// Pre-hash value kept for diagnostics
    pub trace: Option<Value>,
    /// Suffix appended to the target of every reference
    pub target: String,
    pub mode: Option<Value>,
}

/// Resolved lines by logical descriptor name.
pub type ResolvedMap = BTreeMap<String, Vec<ResolvedLine>>;

/// Content produced for one line, before it is hashed.
#[derive(Debug)]
pub(crate) struct Artifact {
    name: String,
    body: Vec<u8>,
    trace: Option<Value>,
    target: String,
}

/// Outcome of resolving one descriptor.
pub(crate) enum Resolution {
    /// Lines taken from already resolved sources.
    Spliced(Vec<ResolvedLine>),
    /// Content not yet fed to the CAS.
    Produced(Vec<Artifact>),
}

/// `{name}-{first 5 hex of hash}`.
pub fn canonical_name(name: &str, hash: &str) -> String {
    format!("{}-{}", name, &hash[..CANONICAL_HASH_LEN.min(hash.len())])
}

/// Name of one file of a directory fan-out.
pub fn fanout_name(base: &str, rel_path: &str) -> String {
    let hash = cas::digest(rel_path.as_bytes());
    format!("{}_{}", base, &hash[..FANOUT_HASH_LEN])
}

fn fragment_dir(project_root: &Path, fragment: &Path) -> PathBuf {
    let dir = fragment.parent().unwrap_or(project_root);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        project_root.join(dir)
    }
}

fn serialize_failed(name: &str, e: impl std::fmt::Display) -> DsppError {
    DsppError::SerializeFailed { reason: format!("{}: {}", name, e) }
}

/// Serialize `contents` according to `format`.
pub fn serialize(name: &str, format: Option<Format>, contents: &Value) -> Result<Vec<u8>> {
    let text = match format.unwrap_or(Format::Raw) {
        Format::Json => {
            serde_json::to_string_pretty(contents).map_err(|e| serialize_failed(name, e))?
        }
        Format::Yaml => serde_yaml::to_string(&document::sort_keys(contents))
            .map_err(|e| serialize_failed(name, e))?,
        Format::Toml => toml::to_string(&document::sort_keys(contents))
            .map_err(|e| serialize_failed(name, e))?,
        Format::Raw => match interpolate::scalar_to_string(contents) {
            Some(text) => text,
            None => serde_json::to_string(contents).map_err(|e| serialize_failed(name, e))?,
        },
    };
    Ok(text.into_bytes())
}

/// Parse command output in `format` so it can be re-serialized canonically.
fn parse_output(name: &str, format: Format, stdout: &[u8]) -> Result<Value> {
    let parse_failed = |reason: String| DsppError::InvalidDescriptor {
        name: name.to_string(),
        reason: format!("command output is not valid {:?}: {}", format, reason),
    };
    match format {
        Format::Json => {
            let json: serde_json::Value =
                serde_json::from_slice(stdout).map_err(|e| parse_failed(e.to_string()))?;
            serde_yaml::to_value(json).map_err(|e| parse_failed(e.to_string()))
        }
        Format::Yaml => serde_yaml::from_slice(stdout).map_err(|e| parse_failed(e.to_string())),
        Format::Toml => {
            let text = std::str::from_utf8(stdout).map_err(|e| parse_failed(e.to_string()))?;
            let parsed: toml::Value =
                toml::from_str(text).map_err(|e| parse_failed(e.to_string()))?;
            serde_yaml::to_value(parsed).map_err(|e| parse_failed(e.to_string()))
        }
        Format::Raw => Ok(Value::from(String::from_utf8_lossy(stdout).into_owned())),
    }
}

/// Interpolation scope built from mapping `args`.
fn args_scope(args: Option<&Value>) -> Option<Scope<'_>> {
    match args {
        Some(value @ Value::Mapping(_)) => Some(Scope::new().layer(value)),
        _ => None,
    }
}

/// Resolves descriptors of one stack into CAS entries.
#[derive(Debug)]
pub struct ObjectResolver<'a> {
    project_root: &'a Path,
    stack_name: &'a str,
    cache: &'a FileCache,
    generators: &'a GeneratorRegistry,
    concurrency: usize,
}

impl<'a> ObjectResolver<'a> {
    pub fn new(
        project_root: &'a Path,
        stack_name: &'a str,
        cache: &'a FileCache,
        generators: &'a GeneratorRegistry,
        concurrency: usize,
    ) -> Self {
        Self { project_root, stack_name, cache, generators, concurrency: concurrency.max(1) }
    }

    fn file_artifact(
        &self,
        name: String,
        path: &Path,
        target: String,
        keep_trace: bool,
        args: Option<&Value>,
    ) -> Result<Artifact> {
        let bytes = self.cache.read(path)?;
        let (body, trace) = match std::str::from_utf8(&bytes) {
            Ok(text) => {
                let text = match args_scope(args) {
                    Some(scope) => match interpolate::interpolate_str(text, &scope)? {
                        Value::String(s) => s,
                        other => String::from_utf8(serialize(&name, None, &other)?)
                            .unwrap_or_default(),
                    },
                    None => text.to_string(),
                };
                let trace = keep_trace.then(|| Value::from(text.as_str()));
                (text.into_bytes(), trace)
            }
            Err(_) => ((*bytes).clone(), keep_trace.then(|| Value::from(BINARY_TRACE))),
        };
        Ok(Artifact { name, body, trace, target })
    }

    /// Produce the content of a non-bundle descriptor.
    async fn produce(
        &self,
        name: &str,
        descriptor: &Descriptor,
        fragment: &Path,
        keep_trace: bool,
    ) -> Result<Vec<Artifact>> {
        let cwd = fragment_dir(self.project_root, fragment);
        let mut contents = descriptor.contents.clone();
        let mut generated: Option<Vec<u8>> = None;

        if let Some(stdout) = exec::run(name, descriptor, &cwd).await? {
            match descriptor.format() {
                Some(format) if format != Format::Raw => {
                    contents = Some(parse_output(name, format, &stdout)?)
                }
                _ => generated = Some(stdout),
            }
        } else if let Some(require) = &descriptor.require {
            let ctx = GenerateContext {
                name: name.to_string(),
                stack_name: self.stack_name.to_string(),
                project_root: self.project_root.to_path_buf(),
                fragment: fragment.to_path_buf(),
            };
            let args = descriptor.args.clone().unwrap_or(Value::Null);
            contents = Some(self.generators.require(require, &ctx, &args, self.cache).await?);
        }

        if let Some(body) = generated {
            let trace = match String::from_utf8(body.clone()) {
                Ok(text) => Value::from(text),
                Err(_) => Value::from(BINARY_TRACE),
            };
            let trace = keep_trace.then_some(trace);
            return Ok(vec![Artifact { name: name.to_string(), body, trace, target: String::new() }]);
        }

        if let Some(directory) = &descriptor.directory {
            let dir = paths::resolve_within(self.project_root, fragment, directory)?;
            return self.fan_out(name, descriptor, directory, &dir, keep_trace);
        }

        if let Some(mut contents) = contents {
            if let Some(scope) = args_scope(descriptor.args.as_ref()) {
                interpolate::interpolate_value(&mut contents, &scope)?;
            }
            let body = serialize(name, descriptor.format(), &contents)?;
            let trace = keep_trace.then_some(contents);
            return Ok(vec![Artifact { name: name.to_string(), body, trace, target: String::new() }]);
        }

        if let Some(file) = &descriptor.file {
            let path = paths::resolve_within(self.project_root, fragment, file)?;
            let artifact = self.file_artifact(
                name.to_string(),
                &path,
                String::new(),
                keep_trace,
                descriptor.args.as_ref(),
            )?;
            return Ok(vec![artifact]);
        }

        Err(DsppError::MissingContent { name: name.to_string(), fragment: fragment.to_path_buf() })
    }

    /// One artifact per file under `dir`, each targeted at its relative path.
    fn fan_out(
        &self,
        name: &str,
        descriptor: &Descriptor,
        directory: &str,
        dir: &Path,
        keep_trace: bool,
    ) -> Result<Vec<Artifact>> {
        let pattern = dir.join("**").join("*");
        let entries = glob::glob(&pattern.to_string_lossy()).map_err(|e| {
            DsppError::InvalidDescriptor { name: name.to_string(), reason: e.to_string() }
        })?;
        let mut files: Vec<PathBuf> =
            entries.filter_map(|entry| entry.ok()).filter(|path| path.is_file()).collect();
        files.sort();
        debug!(descriptor = name, files = files.len(), "Expanding directory");

        files
            .iter()
            .map(|path| {
                let rel = paths::to_posix(path.strip_prefix(dir).unwrap_or(path));
                let synthetic = paths::to_posix(&Path::new(directory).join(&rel));
                self.file_artifact(
                    fanout_name(name, &synthetic),
                    path,
                    format!("/{}", rel),
                    keep_trace,
                    descriptor.args.as_ref(),
                )
            })
            .collect()
    }

    /// Resolve a single descriptor against the lines of earlier layers.
    ///
    /// Bundles splice the lines of their sources and never produce content
    /// of their own; everything else yields artifacts still to be hashed.
    pub(crate) async fn resolve(
        &self,
        name: &str,
        descriptor: &Descriptor,
        fragment: &Path,
        keep_trace: bool,
        resolved: &ResolvedMap,
    ) -> Result<Resolution> {
        if let Some(bundle) = &descriptor.bundle {
            return splice(name, bundle, resolved).map(Resolution::Spliced);
        }
        let artifacts = self.produce(name, descriptor, fragment, keep_trace).await?;
        Ok(Resolution::Produced(artifacts))
    }

    /// Resolve every descriptor of `section` (`configs` or `secrets`) in place.
    ///
    /// Logical entries are replaced by canonical ones and every service and
    /// task reference is rewritten. Externals pass through untouched.
    #[instrument(skip_all, fields(section = section))]
    pub async fn resolve_section(
        &self,
        doc: &mut Value,
        section: &str,
        provenance: &mut Provenance,
        cas: &mut CasStore,
    ) -> Result<ResolvedMap> {
        let mut descriptors = BTreeMap::new();
        if let Some(entries) = document::section(doc, section) {
            for (key, value) in entries {
                let name = document::key_string(key);
                let descriptor = Descriptor::from_value(&name, value)?;
                descriptors.insert(name, descriptor);
            }
        }

        let layers = DescriptorGraph::build(&descriptors)?.layers()?;
        let mut resolved = ResolvedMap::new();

        for (depth, layer) in layers.iter().enumerate() {
            let sources: &Provenance = provenance;
            let (descriptors_ref, earlier) = (&descriptors, &resolved);
            let resolutions: Vec<Result<Resolution>> = stream::iter(layer.iter())
                .map(|name| async move {
                    let descriptor = &descriptors_ref[name];
                    let keep_trace = descriptor.trace && section == CONFIGS;
                    let fragment = sources.source_of(section, name);
                    self.resolve(name, descriptor, fragment, keep_trace, earlier).await
                })
                .buffered(self.concurrency)
                .collect()
                .await;

            let mut layer_lines = ResolvedMap::new();
            for (name, resolution) in layer.iter().zip(resolutions) {
                let descriptor = &descriptors[name];
                let lines = match resolution? {
                    Resolution::Spliced(lines) => lines,
                    Resolution::Produced(artifacts) => {
                        let lines = feed(artifacts, descriptor, cas);
                        emit_entries(doc, section, descriptor, &lines, provenance, name);
                        lines
                    }
                };
                document::section_mut(doc, section).remove(name.as_str());
                layer_lines.insert(name.clone(), lines);
            }

            rewrite_references(doc, section, &layer_lines);
            info!(layer = depth, descriptors = layer.len(), "Resolved {}", section);
            resolved.extend(layer_lines);
        }

        Ok(resolved)
    }
}

/// Hash artifacts into the CAS.
fn feed(artifacts: Vec<Artifact>, descriptor: &Descriptor, cas: &mut CasStore) -> Vec<ResolvedLine> {
    artifacts
        .into_iter()
        .map(|artifact| {
            let entry = cas.feed(artifact.body);
            ResolvedLine {
                canonical_name: canonical_name(&artifact.name, &entry.hash),
                hash: entry.hash,
                path: entry.path,
                trace: artifact.trace,
                target: artifact.target,
                mode: descriptor.mode.clone(),
            }
        })
        .collect()
}

/// Lines of a bundle: its sources' lines under the bundle's targets.
fn splice(name: &str, bundle: &[BundleLine], resolved: &ResolvedMap) -> Result<Vec<ResolvedLine>> {
    let mut lines = Vec::new();
    for bundle_line in bundle {
        let source_lines =
            resolved.get(&bundle_line.source).ok_or_else(|| DsppError::UnknownBundleSource {
                bundle: name.to_string(),
                reference: bundle_line.source.clone(),
            })?;
        let prefix = bundle_line.target.as_deref().unwrap_or("");
        for line in source_lines {
            lines.push(ResolvedLine {
                target: format!("{}{}", prefix, line.target),
                mode: bundle_line.mode.clone().or_else(|| line.mode.clone()),
                ..line.clone()
            });
        }
    }
    Ok(lines)
}

/// Add the canonical section entries for freshly hashed lines.
fn emit_entries(
    doc: &mut Value,
    section: &str,
    descriptor: &Descriptor,
    lines: &[ResolvedLine],
    provenance: &mut Provenance,
    logical_name: &str,
) {
    let entries = document::section_mut(doc, section);
    for line in lines {
        let mut entry = Mapping::new();
        if let Some(name) = &descriptor.name {
            entry.insert(Value::from("name"), Value::from(name.as_str()));
        }
        entry.insert(Value::from("file"), Value::from(line.path.as_str()));
        if let Some(trace) = &line.trace {
            entry.insert(Value::from("x-trace"), trace.clone());
        }
        entries.insert(Value::from(line.canonical_name.as_str()), Value::Mapping(entry));
        provenance.alias(section, logical_name, &line.canonical_name);
    }
}

/// Expand one service/task reference into one reference per line.
fn expand_reference(reference: &Value, lines: &[ResolvedLine]) -> Vec<Value> {
    lines
        .iter()
        .map(|line| {
            let mut out = match reference {
                Value::Mapping(map) => map.clone(),
                _ if line.target.is_empty() && line.mode.is_none() => {
                    return Value::from(line.canonical_name.as_str())
                }
                _ => Mapping::new(),
            };

            let base = out.get("target").and_then(Value::as_str).unwrap_or("");
            let target = format!("{}{}", base, line.target);
            out.insert(Value::from("source"), Value::from(line.canonical_name.as_str()));
            if !target.is_empty() {
                out.insert(Value::from("target"), Value::from(target));
            }
            if document::is_empty(out.get("mode")) {
                if let Some(mode) = &line.mode {
                    out.insert(Value::from("mode"), mode.clone());
                }
            }
            Value::Mapping(out)
        })
        .collect()
}

fn reference_source(reference: &Value) -> Option<&str> {
    match reference {
        Value::String(name) => Some(name),
        Value::Mapping(map) => map.get("source").and_then(Value::as_str),
        _ => None,
    }
}

/// Point every service and task reference to a resolved name at its canonical lines.
pub fn rewrite_references(doc: &mut Value, section: &str, lines: &ResolvedMap) {
    if lines.is_empty() {
        return;
    }
    for owner in [SERVICES, TASKS] {
        let Some(Value::Mapping(entities)) = doc.get_mut(owner) else { continue };
        for (_, entity) in entities.iter_mut() {
            let Some(Value::Sequence(refs)) = entity.get_mut(section) else { continue };
            let rewritten: Vec<Value> = refs
                .iter()
                .flat_map(|reference| match reference_source(reference).and_then(|s| lines.get(s)) {
                    Some(resolved) => expand_reference(reference, resolved),
                    None => vec![reference.clone()],
                })
                .collect();
            *refs = rewritten;
        }
    }
}
