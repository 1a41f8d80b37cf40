//! Dependency graph (DAG) over descriptors.
//!
//! A bundle depends on every descriptor it splices in. Descriptors are grouped
//! into layers with Kahn's algorithm: every descriptor in a layer only depends
//! on descriptors of earlier layers, so each layer can resolve concurrently
//! once the previous one is done.

use super::descriptor::Descriptor;
use crate::error::{DsppError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Resolution layers over a descriptor set.
#[derive(Debug, Clone)]
pub struct DescriptorGraph {
    /// Adjacency list: source -> [bundles depending on it]
    edges: HashMap<String, BTreeSet<String>>,
    /// Number of unresolved sources per descriptor
    in_degree: BTreeMap<String, usize>,
}

impl DescriptorGraph {
    /// Build the graph. Externals are passthrough and never part of it.
    pub fn build(descriptors: &BTreeMap<String, Descriptor>) -> Result<Self> {
        let mut edges: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut in_degree = BTreeMap::new();

        for (name, descriptor) in descriptors {
            if descriptor.is_external() {
                continue;
            }
            let sources: BTreeSet<&str> = descriptor.bundle_sources().collect();
            for source in &sources {
                let known = descriptors.get(*source).map(|d| !d.is_external()).unwrap_or(false);
                if !known {
                    return Err(DsppError::UnknownBundleSource {
                        bundle: name.clone(),
                        reference: source.to_string(),
                    });
                }
                edges.entry(source.to_string()).or_default().insert(name.clone());
            }
            in_degree.insert(name.clone(), sources.len());
        }

        Ok(Self { edges, in_degree })
    }

    /// Descriptors grouped in dependency order, sorted by name within a layer.
    pub fn layers(&self) -> Result<Vec<Vec<String>>> {
        // Kahn's algorithm, one frontier at a time
        let mut in_degree = self.in_degree.clone();
        let mut layers = Vec::new();
        let mut frontier: Vec<String> =
            in_degree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| n.clone()).collect();
        let mut processed = 0;

        while !frontier.is_empty() {
            processed += frontier.len();
            let mut next = BTreeSet::new();

            for name in &frontier {
                for dependent in self.edges.get(name).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(dependent.clone());
                        }
                    }
                }
            }

            layers.push(std::mem::take(&mut frontier));
            frontier = next.into_iter().collect();
        }

        if processed != self.in_degree.len() {
            let done: BTreeSet<&String> = layers.iter().flatten().collect();
            let descriptors =
                self.in_degree.keys().filter(|n| !done.contains(n)).cloned().collect();
            return Err(DsppError::CircularDependency { descriptors });
        }

        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    fn descriptors(pairs: &[(&str, &str)]) -> BTreeMap<String, Descriptor> {
        pairs
            .iter()
            .map(|(name, body)| {
                let value: Value = serde_yaml::from_str(body).unwrap();
                (name.to_string(), Descriptor::from_value(name, &value).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_layers_follow_bundles() {
        let set = descriptors(&[
            ("nginx", "{bundle: [{source: site}, {source: certs}]}"),
            ("site", "{directory: site}"),
            ("certs", "{file: certs.pem}"),
            ("all", "{bundle: [{source: nginx}]}"),
            ("shared", "{external: true}"),
        ]);
        let layers = DescriptorGraph::build(&set).unwrap().layers().unwrap();
        assert_eq!(
            layers,
            vec![
                vec!["certs".to_string(), "site".to_string()],
                vec!["nginx".to_string()],
                vec!["all".to_string()],
            ]
        );
    }

    #[test]
    fn test_cycle_detected() {
        let set = descriptors(&[
            ("a", "{bundle: [{source: b}]}"),
            ("b", "{bundle: [{source: a}]}"),
            ("c", "{contents: x}"),
        ]);
        let err = DescriptorGraph::build(&set).unwrap().layers().unwrap_err();
        match err {
            DsppError::CircularDependency { descriptors } => {
                assert_eq!(descriptors, vec!["a".to_string(), "b".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_and_external_sources() {
        let set = descriptors(&[("a", "{bundle: [{source: missing}]}")]);
        assert!(matches!(
            DescriptorGraph::build(&set).unwrap_err(),
            DsppError::UnknownBundleSource { .. }
        ));

        let set = descriptors(&[("a", "{bundle: [{source: ext}]}"), ("ext", "{external: true}")]);
        assert!(DescriptorGraph::build(&set).is_err());
    }
}
