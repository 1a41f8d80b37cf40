//! Stack compilation.
//!
//! ```text
//! fragments ─▶ merge ─▶ interpolate ─▶ env_file ─▶ volume remap ─▶ resolve ─▶ slices
//! ```
//!
//! A [`Compiler`] owns the fragment set, generators and secrets provider.
//! Each `compile()` gets its own file cache so separate compiles never share state.

use crate::cas::CasStore;
use crate::config::Config;
use crate::document::{
    self, key_string, FileCache, Provenance, StackSources, CONFIGS, NETWORKS, SECRETS, SERVICES,
    TASKS, VERSION, VOLUMES,
};
use crate::error::{DsppError, Result};
use crate::format::{format_stack, FormattedStack};
use crate::interpolate::{interpolate_value, Scope};
use crate::resolver::{GeneratorRegistry, ObjectResolver, ResolvedMap};
use crate::secrets::{self, DefaultSecretsProvider, SecretsProvider};
use crate::volumes;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Deployable entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Service,
    Task,
}

impl EntityKind {
    /// Section of the stack holding entities of this kind.
    pub fn section(self) -> &'static str {
        match self {
            EntityKind::Service => SERVICES,
            EntityKind::Task => TASKS,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Service => write!(f, "service"),
            EntityKind::Task => write!(f, "task"),
        }
    }
}

/// Output of a full compile.
#[derive(Debug)]
pub struct CompiledStack {
    pub document: Value,
    pub provenance: Provenance,
    /// Staged artifacts; nothing is on disk until `cas.write()`
    pub cas: CasStore,
    pub configs: ResolvedMap,
    pub secrets: ResolvedMap,
}

/// The canonical state of one service or task.
#[derive(Debug, Clone)]
pub struct EntitySlice {
    pub kind: EntityKind,
    pub name: String,
    pub stack_revision: String,
    pub compiled: String,
}

/// Per-entity slices and their union.
#[derive(Debug)]
pub struct LocalAnalysis {
    /// Union of every selected slice
    pub stack: Value,
    pub slices: Vec<EntitySlice>,
    pub compiled: CompiledStack,
}

/// Selection of entities for slicing.
#[derive(Debug, Clone, Default)]
pub struct SliceFilter {
    pub pattern: Option<String>,
    pub tasks_only: bool,
}

impl SliceFilter {
    pub fn new(pattern: Option<&str>) -> Self {
        Self { pattern: pattern.map(str::to_string), tasks_only: false }
    }

    pub fn tasks_only(mut self, tasks_only: bool) -> Self {
        self.tasks_only = tasks_only;
        self
    }

    pub fn is_active(&self) -> bool {
        self.pattern.is_some()
    }

    fn regex(&self) -> Result<Regex> {
        Regex::new(self.pattern.as_deref().unwrap_or(".*")).map_err(|e| DsppError::InvalidConfig {
            reason: format!("invalid filter: {}", e),
        })
    }
}

/// Compiles one stack.
pub struct Compiler {
    sources: StackSources,
    config: Config,
    generators: GeneratorRegistry,
    secrets: Arc<dyn SecretsProvider>,
    defines: BTreeMap<String, String>,
}

impl fmt::Debug for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiler")
            .field("stack", &self.sources.stack_name)
            .field("compose_files", &self.sources.compose_files.len())
            .field("header_files", &self.sources.header_files.len())
            .finish()
    }
}

fn process_env() -> Value {
    let env: Mapping = std::env::vars().map(|(k, v)| (Value::from(k), Value::from(v))).collect();
    Value::Mapping(env)
}

/// Names referenced by an entity's `configs`/`secrets` list.
fn referenced_sources(entity: &Value, section: &str) -> Vec<String> {
    let Some(refs) = entity.get(section).and_then(Value::as_sequence) else { return Vec::new() };
    refs.iter()
        .filter_map(|r| match r {
            Value::String(name) => Some(name.clone()),
            Value::Mapping(map) => map.get("source").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .collect()
}

/// Volume names mounted by an entity, in long or short syntax.
fn referenced_volumes(entity: &Value) -> Vec<String> {
    let Some(mounts) = entity.get(VOLUMES).and_then(Value::as_sequence) else { return Vec::new() };
    mounts
        .iter()
        .filter_map(|m| match m {
            Value::String(short) => short.split(':').next().map(str::to_string),
            Value::Mapping(map) => map.get("source").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .collect()
}

/// Networks joined by an entity, as a list or a mapping.
fn referenced_networks(entity: &Value) -> Vec<String> {
    match entity.get(NETWORKS) {
        Some(Value::Sequence(seq)) => seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        Some(Value::Mapping(map)) => map.keys().map(key_string).collect(),
        _ => Vec::new(),
    }
}

fn copy_entries(from: &Value, into: &mut Value, section: &str, names: Vec<String>) {
    let Some(entries) = document::section(from, section) else { return };
    for name in names {
        if let Some(entry) = entries.get(name.as_str()) {
            document::section_mut(into, section).insert(Value::from(name), entry.clone());
        }
    }
}

impl Compiler {
    /// Discover the fragments of the stack rooted at `entry`.
    pub fn new(project_root: &Path, entry: &Path, config: Config) -> Result<Self> {
        let cache = FileCache::new();
        let sources = StackSources::discover(project_root, entry, &cache)?;
        let secrets = Arc::new(DefaultSecretsProvider::new(&sources.project_root)?);
        Ok(Self {
            sources,
            config,
            generators: GeneratorRegistry::new(),
            secrets,
            defines: BTreeMap::new(),
        })
    }

    /// Template values for `${ctx.key}`.
    pub fn with_defines(mut self, defines: BTreeMap<String, String>) -> Self {
        self.defines = defines;
        self
    }

    pub fn with_generators(mut self, generators: GeneratorRegistry) -> Self {
        self.generators = generators;
        self
    }

    pub fn with_secrets_provider(mut self, provider: Arc<dyn SecretsProvider>) -> Self {
        self.secrets = provider;
        self
    }

    pub fn sources(&self) -> &StackSources {
        &self.sources
    }

    pub fn stack_name(&self) -> &str {
        &self.sources.stack_name
    }

    pub fn project_root(&self) -> &Path {
        &self.sources.project_root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A CAS rooted in this project's cache directory.
    pub fn cas(&self) -> CasStore {
        CasStore::new(&self.sources.project_root, &self.config.cache_dir)
    }

    /// Run the whole pipeline.
    #[instrument(skip(self), fields(stack = %self.sources.stack_name))]
    pub async fn compile(&self) -> Result<CompiledStack> {
        let stack_name = self.stack_name();
        info!(
            "Working with stack '{}' from {} files and {} env files",
            stack_name,
            self.sources.compose_files.len(),
            self.sources.header_files.len()
        );

        let cache = FileCache::new();
        let loaded = self.sources.load(&cache, &self.defines)?;
        let mut doc = loaded.document;
        let mut provenance = loaded.provenance;
        let mut cas = self.cas();

        let secret_values = self.secrets.resolve(&secrets::sources(&doc)?).await?;

        let snapshot = doc.clone();
        let base = Scope::new()
            .local("env", process_env())
            .layer(&snapshot)
            .local("stack_name", stack_name)
            .local("secrets", secret_values);
        interpolate_value(&mut doc, &base)?;

        self.interpolate_tasks(&mut doc, &base)?;
        self.interpolate_services(&mut doc, &base, &provenance, &mut cas)?;

        let renamed = volumes::remap(&mut doc)?;
        debug!(volumes = renamed.len(), "Remapped volumes");

        let resolver = ObjectResolver::new(
            &self.sources.project_root,
            stack_name,
            &cache,
            &self.generators,
            self.config.concurrency,
        );
        let configs = resolver.resolve_section(&mut doc, CONFIGS, &mut provenance, &mut cas).await?;
        let secrets = resolver.resolve_section(&mut doc, SECRETS, &mut provenance, &mut cas).await?;

        Ok(CompiledStack { document: doc, provenance, cas, configs, secrets })
    }

    fn interpolate_tasks(&self, doc: &mut Value, base: &Scope<'_>) -> Result<()> {
        let Some(Value::Mapping(tasks)) = doc.get_mut(TASKS) else { return Ok(()) };
        for (name, task) in tasks.iter_mut() {
            let name = key_string(name);
            let snapshot = task.clone();
            let scope = base
                .clone()
                .layer(&snapshot)
                .local("task_name", name.as_str())
                .local("service_name", name.as_str());
            interpolate_value(task, &scope)?;
        }
        Ok(())
    }

    fn interpolate_services(
        &self,
        doc: &mut Value,
        base: &Scope<'_>,
        provenance: &Provenance,
        cas: &mut CasStore,
    ) -> Result<()> {
        let Some(Value::Mapping(services)) = doc.get_mut(SERVICES) else { return Ok(()) };
        for (name, service) in services.iter_mut() {
            let name = key_string(name);
            let fragment = provenance.source_of(SERVICES, &name);
            self.feed_env_files(service, fragment, cas)?;

            let snapshot = service.clone();
            let scope = base.clone().layer(&snapshot).local("service_name", name.as_str());
            interpolate_value(service, &scope)?;
        }
        Ok(())
    }

    /// Replace `env_file` entries with their CAS paths.
    fn feed_env_files(&self, service: &mut Value, fragment: &Path, cas: &mut CasStore) -> Result<()> {
        let root = &self.sources.project_root;
        match service.get_mut("env_file") {
            Some(Value::String(file)) => {
                *file = cas.env(root, fragment, file)?;
            }
            Some(Value::Sequence(files)) => {
                for file in files.iter_mut() {
                    if let Value::String(path) = file {
                        *path = cas.env(root, fragment, path)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Compile and cut the stack into per-entity slices.
    #[instrument(skip(self, filter), fields(stack = %self.sources.stack_name))]
    pub async fn analyze_local(&self, filter: &SliceFilter) -> Result<LocalAnalysis> {
        let pattern = filter.regex()?;
        let compiled = self.compile().await?;
        let input = &compiled.document;
        let version = input.get(VERSION).cloned().unwrap_or(Value::Null);

        let mut stack = Value::Mapping(Mapping::new());
        if !version.is_null() {
            section_insert(&mut stack, VERSION, version.clone());
        }
        let mut slices = Vec::new();

        for kind in [EntityKind::Service, EntityKind::Task] {
            if filter.tasks_only && kind != EntityKind::Task {
                continue;
            }
            let Some(entities) = document::section(input, kind.section()) else { continue };

            for (key, entity) in entities {
                let name = key_string(key);
                if !pattern.is_match(&name) {
                    continue;
                }

                let mut slice = Value::Mapping(Mapping::new());
                if !version.is_null() {
                    section_insert(&mut slice, VERSION, version.clone());
                }
                document::section_mut(&mut slice, kind.section())
                    .insert(Value::from(name.as_str()), entity.clone());
                copy_entries(input, &mut slice, CONFIGS, referenced_sources(entity, CONFIGS));
                copy_entries(input, &mut slice, SECRETS, referenced_sources(entity, SECRETS));
                copy_entries(input, &mut slice, VOLUMES, referenced_volumes(entity));
                copy_entries(input, &mut slice, NETWORKS, referenced_networks(entity));

                let FormattedStack { stack_revision, compiled: text } =
                    format_stack(self.stack_name(), &slice)?;
                document::deep_merge(&mut stack, slice);
                slices.push(EntitySlice { kind, name, stack_revision, compiled: text });
            }
        }

        if filter.is_active() {
            info!("Found {} matching items", slices.len());
        }
        Ok(LocalAnalysis { stack, slices, compiled })
    }

    /// Canonical text of the (optionally filtered) stack.
    pub async fn parse(&self, filter: &SliceFilter) -> Result<String> {
        let analysis = self.analyze_local(filter).await?;
        Ok(format_stack(self.stack_name(), &analysis.stack)?.compiled)
    }

    /// Resolved content of one logical config.
    pub async fn config_content(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let compiled = self.compile().await?;
        let content = compiled
            .configs
            .get(name)
            .and_then(|lines| lines.first())
            .and_then(|line| compiled.cas.get(&line.path))
            .map(<[u8]>::to_vec);
        Ok(content)
    }

    /// Where compiled artifacts are stored.
    pub fn cas_dir(&self) -> PathBuf {
        self.sources.project_root.join(crate::paths::cas_dir(&self.config.cache_dir))
    }
}

fn section_insert(doc: &mut Value, key: &str, value: Value) {
    document::ensure_mapping(doc).insert(Value::from(key), value);
}
