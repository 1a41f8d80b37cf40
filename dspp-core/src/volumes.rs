//! Content-derived volume identities.
//!
//! Every non-external volume is renamed after a hash of its spec, so two
//! volumes with the same spec converge and an unchanged spec never forces the
//! orchestrator to recreate a volume. Service and task mounts are rewritten to
//! the new names, in both long (`{source, target}`) and short
//! (`name:/path[:mode]`) syntax.

use crate::cas;
use crate::document::{self, key_string, truthy, SERVICES, TASKS, VOLUMES};
use crate::error::{DsppError, Result};
use serde_yaml::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Number of hex characters of the spec hash in a volume identity.
const VOLUME_HASH_LEN: usize = 12;

/// `vol-<hash of the canonical JSON of the spec>`.
pub fn volume_identity(spec: &Value) -> Result<String> {
    let canonical = serde_json::to_string(&document::sort_keys(spec))
        .map_err(|e| DsppError::SerializeFailed { reason: format!("volume spec: {}", e) })?;
    let hash = cas::digest(canonical.as_bytes());
    Ok(format!("vol-{}", &hash[..VOLUME_HASH_LEN]))
}

fn remap_mount(mount: &mut Value, renamed: &BTreeMap<String, String>) {
    match mount {
        Value::Mapping(map) => {
            let Some(source) = map.get("source").and_then(Value::as_str) else { return };
            if let Some(identity) = renamed.get(source) {
                map.insert(Value::from("source"), Value::from(identity.as_str()));
            }
        }
        Value::String(short) => {
            let (source, rest) = short.split_once(':').unwrap_or((short.as_str(), ""));
            if let Some(identity) = renamed.get(source) {
                let rewritten =
                    if rest.is_empty() { identity.clone() } else { format!("{}:{}", identity, rest) };
                *short = rewritten;
            }
        }
        _ => {}
    }
}

/// Rename non-external volumes to their identity and rewrite every mount.
///
/// Returns the rename map, logical name to identity.
pub fn remap(doc: &mut Value) -> Result<BTreeMap<String, String>> {
    let mut renamed = BTreeMap::new();
    let Some(volumes) = document::section(doc, VOLUMES) else { return Ok(renamed) };

    let mut remapped = serde_yaml::Mapping::new();
    for (key, spec) in volumes {
        let name = key_string(key);
        if truthy(spec.get("external")) {
            remapped.insert(key.clone(), spec.clone());
            continue;
        }
        let identity = volume_identity(spec)?;
        debug!(volume = %name, identity = %identity, "Remapped volume");
        remapped.insert(Value::from(identity.as_str()), spec.clone());
        renamed.insert(name, identity);
    }
    *document::section_mut(doc, VOLUMES) = remapped;

    for owner in [SERVICES, TASKS] {
        let Some(Value::Mapping(entities)) = doc.get_mut(owner) else { continue };
        for (_, entity) in entities.iter_mut() {
            let Some(Value::Sequence(mounts)) = entity.get_mut(VOLUMES) else { continue };
            for mount in mounts.iter_mut() {
                remap_mount(mount, &renamed);
            }
        }
    }

    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_identical_specs_converge() {
        let mut doc = yaml(
            "volumes:\n  a: {driver: local, labels: {x: '1', y: '2'}}\n  b: {labels: {y: '2', x: '1'}, driver: local}\n  c: {driver: nfs}\n  shared: {external: true}",
        );
        let renamed = remap(&mut doc).unwrap();

        assert_eq!(renamed["a"], renamed["b"]);
        assert_ne!(renamed["a"], renamed["c"]);
        assert!(renamed.get("shared").is_none());
        assert!(renamed["a"].starts_with("vol-"));
        assert_eq!(renamed["a"].len(), 4 + VOLUME_HASH_LEN);

        let names = document::entry_names(&doc, VOLUMES);
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"shared".to_string()));
    }

    #[test]
    fn test_mounts_rewritten() {
        let mut doc = yaml(
            "volumes: {data: {driver: local}, ext: {external: true}}\n\
             services:\n  db:\n    volumes:\n      - {type: volume, source: data, target: /var/lib/db}\n      - data:/backup:ro\n      - ./local:/src\n      - ext:/ext\n\
             tasks:\n  migrate:\n    volumes:\n      - data:/data",
        );
        let renamed = remap(&mut doc).unwrap();
        let id = renamed["data"].as_str();

        let mounts = &doc["services"]["db"]["volumes"];
        assert_eq!(mounts[0]["source"], Value::from(id));
        assert_eq!(mounts[1], Value::from(format!("{}:/backup:ro", id)));
        assert_eq!(mounts[2], Value::from("./local:/src"));
        assert_eq!(mounts[3], Value::from("ext:/ext"));
        assert_eq!(doc["tasks"]["migrate"]["volumes"][0], Value::from(format!("{}:/data", id)));
    }

    #[test]
    fn test_spec_change_changes_identity() {
        let before = volume_identity(&yaml("{driver: local}")).unwrap();
        let after = volume_identity(&yaml("{driver: local, driver_opts: {type: tmpfs}}")).unwrap();
        assert_ne!(before, after);
        assert_eq!(before, volume_identity(&yaml("{driver: local}")).unwrap());
    }
}
