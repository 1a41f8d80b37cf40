//! Canonical stack serialization.
//!
//! Top-level sections come in a fixed order, empty sections are dropped and
//! every mapping is key-sorted, so equal stacks always serialize to equal
//! bytes. The header line carries a short revision hash of the body.

use crate::cas;
use crate::document::{self, CONFIGS, NETWORKS, SECRETS, SERVICES, TASKS, VERSION, VOLUMES};
use crate::error::{DsppError, Result};
use serde_yaml::{Mapping, Value};

/// Version stamped into compiled stack headers.
pub const DSPP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Output order of top-level sections, after `version`.
pub const SECTION_ORDER: [&str; 6] = [CONFIGS, SECRETS, NETWORKS, VOLUMES, SERVICES, TASKS];

const REVISION_LEN: usize = 5;

/// A canonically serialized stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedStack {
    pub stack_revision: String,
    /// Header line followed by the YAML body
    pub compiled: String,
}

/// Serialize `stack` canonically under `stack_name`.
pub fn format_stack(stack_name: &str, stack: &Value) -> Result<FormattedStack> {
    let mut ordered = Mapping::new();

    if let Some(version) = stack.get(VERSION).filter(|v| !v.is_null()) {
        ordered.insert(Value::from(VERSION), version.clone());
    }
    for section in SECTION_ORDER {
        let value = stack.get(section);
        if document::is_empty(value) {
            continue;
        }
        if let Some(value) = value {
            ordered.insert(Value::from(section), document::sort_keys(value));
        }
    }

    let body = if ordered.is_empty() {
        String::new()
    } else {
        serde_yaml::to_string(&Value::Mapping(ordered))
            .map_err(|e| DsppError::SerializeFailed { reason: e.to_string() })?
    };

    let hash = cas::digest(body.as_bytes());
    let stack_revision = hash[..REVISION_LEN].to_string();
    let compiled =
        format!("# {} @{} (dspp v{})\n{}", stack_name, stack_revision, DSPP_VERSION, body);

    Ok(FormattedStack { stack_revision, compiled })
}
