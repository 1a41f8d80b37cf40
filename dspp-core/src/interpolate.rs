//! Token interpolation over document leaves.
//!
//! Tokens are `$$name` and `$${dotted.path}`. A token that resolves to a
//! scalar is substituted in place and the leaf is scanned again, so chains of
//! references settle. A token that resolves to a mapping, sequence or null
//! replaces the whole leaf. Unresolved tokens stay verbatim so that a later
//! walk with a richer scope can pick them up.

use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::borrow::Cow;
use std::sync::OnceLock;

use crate::error::{DsppError, Result};

/// Upper bound on substitutions performed on a single leaf.
pub const MAX_SUBSTITUTIONS: usize = 64;

fn token_pattern() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(r"(?i)\$\$(?:\{([^}]+)\}|([a-z0-9._-]+))").expect("token pattern is valid")
    })
}

/// One step of a lookup path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Split `a.b['c'][0]` into segments. Returns `None` for malformed paths.
pub fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.trim().chars();
    // Whether the previous segment was closed by a bracket.
    let mut after_bracket = false;

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if current.is_empty() && !after_bracket {
                    return None;
                }
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                after_bracket = false;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(c) => inner.push(c),
                        None => return None,
                    }
                }
                let inner = inner.trim();
                let quoted = inner.len() >= 2
                    && ((inner.starts_with('\'') && inner.ends_with('\''))
                        || (inner.starts_with('"') && inner.ends_with('"')));
                if quoted {
                    segments.push(Segment::Key(inner[1..inner.len() - 1].to_string()));
                } else if let Ok(index) = inner.parse::<usize>() {
                    segments.push(Segment::Index(index));
                } else if inner.is_empty() {
                    return None;
                } else {
                    segments.push(Segment::Key(inner.to_string()));
                }
                after_bracket = true;
            }
            c => {
                current.push(c);
                after_bracket = false;
            }
        }
    }

    if !current.is_empty() {
        segments.push(Segment::Key(current));
    } else if !after_bracket {
        return None;
    }
    Some(segments)
}

/// Follow `segments` from `root`.
pub fn dive<'v>(root: &'v Value, segments: &[Segment]) -> Option<&'v Value> {
    let mut current = root;
    for segment in segments {
        current = match (current, segment) {
            (Value::Mapping(map), Segment::Key(key)) => map.get(key.as_str())?,
            (Value::Mapping(map), Segment::Index(index)) => map
                .get(index.to_string().as_str())
                .or_else(|| map.get(Value::from(*index as u64)))?,
            (Value::Sequence(seq), Segment::Index(index)) => seq.get(*index)?,
            (Value::Sequence(seq), Segment::Key(key)) => seq.get(key.parse::<usize>().ok()?)?,
            (Value::Tagged(tagged), _) => dive(&tagged.value, std::slice::from_ref(segment))?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve a dotted path against a single value.
pub fn lookup_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    dive(root, &parse_path(path)?)
}

/// String form of a scalar; `None` for structured values and null.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Composite lookup scope.
///
/// Layers are mappings; the first path segment picks the most recently added
/// layer that defines it, the rest of the path dives into that value.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    layers: Vec<Cow<'a, Value>>,
}

impl<'a> Scope<'a> {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Add a borrowed layer that shadows everything added before it.
    pub fn layer(mut self, value: &'a Value) -> Self {
        self.layers.push(Cow::Borrowed(value));
        self
    }

    /// Add an owned layer that shadows everything added before it.
    pub fn owned(mut self, value: Value) -> Self {
        self.layers.push(Cow::Owned(value));
        self
    }

    /// Add a single named local.
    pub fn local(self, key: &str, value: impl Into<Value>) -> Self {
        let mut map = Mapping::new();
        map.insert(Value::from(key), value.into());
        self.owned(Value::Mapping(map))
    }

    /// Resolve a path; `None` when no layer defines it.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let segments = parse_path(path)?;
        let (first, rest) = segments.split_first()?;
        self.layers.iter().rev().find_map(|layer| {
            let head = dive(layer.as_ref(), std::slice::from_ref(first))?;
            dive(head, rest)
        })
    }
}

/// Interpolate one string leaf.
///
/// Returns the replacement value: a string when every substitution was a
/// scalar, or the structured value a token resolved to.
pub fn interpolate_str(input: &str, scope: &Scope<'_>) -> Result<Value> {
    let pattern = token_pattern();
    let mut current = input.to_string();
    let mut cursor = 0;
    let mut substitutions = 0;

    loop {
        let Some((range, key)) = pattern.captures_at(&current, cursor).and_then(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1).or_else(|| caps.get(2))?.as_str().to_string();
            Some((whole.range(), key))
        }) else {
            break;
        };

        let Some(resolved) = scope.lookup(&key) else {
            cursor = range.end;
            continue;
        };

        let Some(text) = scalar_to_string(resolved) else {
            return Ok(resolved.clone());
        };

        substitutions += 1;
        if substitutions > MAX_SUBSTITUTIONS {
            return Err(DsppError::InterpolationDepth {
                leaf: input.to_string(),
                depth: MAX_SUBSTITUTIONS,
            });
        }
        cursor = range.start;
        current.replace_range(range, &text);
    }

    Ok(Value::String(current))
}

/// Interpolate every string leaf of `value` in place. Mapping keys are left alone.
pub fn interpolate_value(value: &mut Value, scope: &Scope<'_>) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.contains("$$") {
                *value = interpolate_str(s, scope)?;
            }
        }
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                interpolate_value(v, scope)?;
            }
        }
        Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                interpolate_value(v, scope)?;
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, scope)?,
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    const BODY: &str = "Hi $$name, $${env['color']} is great";

    #[test]
    fn test_basic_interpolation() {
        let dict = yaml("{name: Joe, env: {color: blue}}");
        let scope = Scope::new().layer(&dict);
        assert_eq!(interpolate_str(BODY, &scope).unwrap(), Value::from("Hi Joe, blue is great"));
    }

    #[test]
    fn test_incomplete_interpolation() {
        let dict = yaml("{env: {color: blue}}");
        let scope = Scope::new().layer(&dict);
        assert_eq!(
            interpolate_str(BODY, &scope).unwrap(),
            Value::from("Hi $$name, blue is great")
        );
    }

    #[test]
    fn test_full_object_remap() {
        let dict = yaml("{env: {color: blue}}");
        let scope = Scope::new().layer(&dict);
        let result = interpolate_str("noize $$env noize", &scope).unwrap();
        assert_eq!(result, yaml("{color: blue}"));
    }

    #[test]
    fn test_chain_reaches_fixpoint() {
        let dict = yaml("a: $$b\nb: $${c}\nc: literal");
        let scope = Scope::new().layer(&dict);
        assert_eq!(interpolate_str("$$a", &scope).unwrap(), Value::from("literal"));
    }

    #[test]
    fn test_cycle_hits_depth_guard() {
        let dict = yaml("{a: $$b, b: $$a}");
        let scope = Scope::new().layer(&dict);
        let err = interpolate_str("$$a", &scope).unwrap_err();
        assert!(matches!(err, DsppError::InterpolationDepth { .. }));
    }

    #[test]
    fn test_later_layers_shadow_earlier() {
        let doc = yaml("{stack_name: from-doc, version: '3.8'}");
        let scope = Scope::new().layer(&doc).local("stack_name", "app");
        assert_eq!(
            interpolate_str("$$stack_name@$$version", &scope).unwrap(),
            Value::from("app@3.8")
        );
    }

    #[test]
    fn test_numbers_are_stringified() {
        let dict = yaml("{port: 8080}");
        let scope = Scope::new().layer(&dict);
        assert_eq!(interpolate_str("$$port", &scope).unwrap(), Value::from("8080"));
    }

    #[test]
    fn test_interpolate_value_walks_tree() {
        let scope_doc = yaml("{registry: r.example.com, labels: {team: core}}");
        let scope = Scope::new().layer(&scope_doc);
        let mut value = yaml("{image: '$$registry/web', deploy: {labels: '$$labels'}, keep: 3}");
        interpolate_value(&mut value, &scope).unwrap();
        assert_eq!(
            value,
            yaml("{image: r.example.com/web, deploy: {labels: {team: core}}, keep: 3}")
        );
    }

    #[test]
    fn test_parse_path_forms() {
        assert_eq!(
            parse_path("a.b[0]['c.d']").unwrap(),
            vec![
                Segment::Key("a".into()),
                Segment::Key("b".into()),
                Segment::Index(0),
                Segment::Key("c.d".into()),
            ]
        );
        assert!(parse_path("a..b").is_none());
        assert!(parse_path("a.").is_none());
        assert!(parse_path("a[0").is_none());
    }

    #[test]
    fn test_lookup_path_into_sequence() {
        let doc = yaml("{hosts: [alpha, beta]}");
        assert_eq!(lookup_path(&doc, "hosts.1"), Some(&Value::from("beta")));
        assert_eq!(lookup_path(&doc, "hosts[0]"), Some(&Value::from("alpha")));
        assert_eq!(lookup_path(&doc, "hosts[5]"), None);
    }
}
