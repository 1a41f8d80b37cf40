//! Named content generators for `require` descriptors.
//!
//! Generators are registered ahead of a compile; nothing is loaded
//! dynamically. A `require` pointing at a `.yml`, `.yaml` or `.json` file is
//! read as data instead of looked up here.

use crate::document::loader::parse_fragment;
use crate::document::FileCache;
use crate::error::{DsppError, Result};
use crate::paths;
use async_trait::async_trait;
use serde_yaml::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a generator knows about the descriptor it runs for.
#[derive(Debug, Clone)]
pub struct GenerateContext {
    pub name: String,
    pub stack_name: String,
    pub project_root: PathBuf,
    pub fragment: PathBuf,
}

/// Produces the `contents` of a descriptor.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, ctx: &GenerateContext, args: &Value) -> Result<Value>;
}

/// A generator returning a fixed value.
pub struct StaticGenerator(pub Value);

#[async_trait]
impl Generator for StaticGenerator {
    async fn generate(&self, _ctx: &GenerateContext, _args: &Value) -> Result<Value> {
        Ok(self.0.clone())
    }
}

/// A generator backed by a synchronous closure.
pub struct FnGenerator<F>(pub F);

#[async_trait]
impl<F> Generator for FnGenerator<F>
where
    F: Fn(&GenerateContext, &Value) -> Result<Value> + Send + Sync,
{
    async fn generate(&self, ctx: &GenerateContext, args: &Value) -> Result<Value> {
        (self.0)(ctx, args)
    }
}

/// Generators by the name used in `require`.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn Generator>>,
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.generators.keys().collect();
        names.sort();
        f.debug_struct("GeneratorRegistry").field("generators", &names).finish()
    }
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, generator: impl Generator + 'static) {
        self.generators.insert(name.into(), Arc::new(generator));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Generator>> {
        self.generators.get(name).cloned()
    }

    /// Whether a `require` target is a data file rather than a generator name.
    pub fn is_data_file(require: &str) -> bool {
        let lower = require.to_ascii_lowercase();
        [".yml", ".yaml", ".json"].iter().any(|ext| lower.ends_with(ext))
    }

    /// Run the generator or read the data file named by `require`.
    pub async fn require(
        &self,
        require: &str,
        ctx: &GenerateContext,
        args: &Value,
        cache: &FileCache,
    ) -> Result<Value> {
        if Self::is_data_file(require) {
            return load_data_file(&ctx.project_root, &ctx.fragment, require, cache);
        }
        let generator = self
            .get(require)
            .ok_or_else(|| DsppError::UnknownGenerator { name: require.to_string() })?;
        generator.generate(ctx, args).await
    }
}

fn load_data_file(root: &Path, fragment: &Path, rel: &str, cache: &FileCache) -> Result<Value> {
    let path = paths::resolve_within(root, fragment, rel)?;
    let body = cache.read_to_string(&path)?;

    if rel.to_ascii_lowercase().ends_with(".json") {
        let json: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            DsppError::ParseFailure { path: path.clone(), reason: e.to_string() }
        })?;
        return serde_yaml::to_value(json)
            .map_err(|e| DsppError::ParseFailure { path, reason: e.to_string() });
    }
    parse_fragment(&path, &body)
}
