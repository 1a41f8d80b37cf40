//! Config and secret descriptors.

use crate::document::truthy;
use crate::error::{DsppError, Result};
use serde::Deserialize;
use serde_yaml::Value;

fn default_trace() -> bool {
    true
}

/// Serialization applied to `contents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
    Toml,
    Raw,
}

impl Format {
    fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "json" => Format::Json,
            "yaml" | "yml" => Format::Yaml,
            "toml" => Format::Toml,
            _ => Format::Raw,
        }
    }
}

/// One line of a `bundle` descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct BundleLine {
    pub source: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub mode: Option<Value>,
}

/// A declarative recipe for one config or secret.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Descriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub contents: Option<Value>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub require: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
    /// Program and arguments, as a list or a whitespace-separated string.
    #[serde(default)]
    pub exec: Option<Value>,
    /// Command line run through the shell.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub env: Option<Value>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub bundle: Option<Vec<BundleLine>>,
    #[serde(default)]
    pub external: Option<Value>,
    #[serde(default)]
    pub mode: Option<Value>,
    #[serde(rename = "x-trace", default = "default_trace")]
    pub trace: bool,
}

impl Descriptor {
    /// Read a descriptor from its document entry.
    pub fn from_value(name: &str, value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self { trace: true, ..Self::default() });
        }
        serde_yaml::from_value(value.clone()).map_err(|e| DsppError::InvalidDescriptor {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn is_external(&self) -> bool {
        truthy(self.external.as_ref())
    }

    pub fn format(&self) -> Option<Format> {
        self.format.as_deref().map(Format::parse)
    }

    /// Names of the descriptors a bundle splices in.
    pub fn bundle_sources(&self) -> impl Iterator<Item = &str> {
        self.bundle.iter().flatten().map(|line| line.source.as_str())
    }

    /// Environment for exec/shell, stringifying scalar values.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let Some(Value::Mapping(map)) = &self.env else { return Vec::new() };
        map.iter()
            .filter_map(|(k, v)| {
                let key = k.as_str()?.to_string();
                let value = crate::interpolate::scalar_to_string(v).unwrap_or_default();
                Some((key, value))
            })
            .collect()
    }

    /// Positional arguments, when `args` is a sequence.
    pub fn argv(&self) -> Vec<String> {
        match &self.args {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .map(|v| {
                    crate::interpolate::scalar_to_string(v)
                        .unwrap_or_else(|| serde_json::to_string(v).unwrap_or_default())
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}
