//! Template pass over raw fragment text.
//!
//! Before a fragment is parsed, single-dollar `${ctx.key}` tokens are replaced
//! from the compile-time defines. Only plain lookup paths are accepted; there
//! is no expression evaluation. `$${...}` belongs to document interpolation and
//! is never touched here, and unknown `${...}` tokens stay verbatim.

use crate::interpolate::{lookup_path, scalar_to_string};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Build the template scope `{ctx: {key: value, ...}}` from defines.
pub fn context(defines: &BTreeMap<String, String>) -> Value {
    let ctx: Mapping = defines
        .iter()
        .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
        .collect();
    let mut root = Mapping::new();
    root.insert(Value::from("ctx"), Value::Mapping(ctx));
    Value::Mapping(root)
}

fn is_plain_path(expr: &str) -> bool {
    !expr.is_empty()
        && expr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '[' | ']' | '\'' | '"'))
}

/// Render `body` against `scope`.
pub fn render(body: &str, scope: &Value) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(pos) = rest.find("${") {
        let escaped = if pos > 0 { rest.as_bytes()[pos - 1] == b'$' } else { out.ends_with('$') };
        let Some(close) = rest[pos..].find('}') else { break };
        let token = &rest[pos..pos + close + 1];
        let expr = token[2..token.len() - 1].trim();

        out.push_str(&rest[..pos]);
        let replacement = if escaped || !is_plain_path(expr) {
            None
        } else {
            lookup_path(scope, expr).map(|value| {
                scalar_to_string(value).unwrap_or_else(|| {
                    serde_json::to_string(value).unwrap_or_default()
                })
            })
        };
        match replacement {
            Some(text) => out.push_str(&text),
            None => out.push_str(token),
        }
        rest = &rest[pos + close + 1..];
    }

    out.push_str(rest);
    out
}
