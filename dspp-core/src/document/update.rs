//! In-place edits of scalar values in compose fragments.
//!
//! Fragments are edited line by line rather than re-serialized, so comments,
//! anchors and layout survive. Keys only reachable through flow style
//! (`web: {image: x}`) fall back to a parse and re-emit of the fragment, which
//! drops its comments.

use super::loader::StackSources;
use crate::error::{DsppError, Result};
use serde_yaml::Value;
use std::path::PathBuf;
use tracing::info;

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn is_content(line: &str) -> bool {
    let trimmed = line.trim_start();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// Split a `key: value` line; returns the key text and the byte offset of the value.
fn split_key(line: &str) -> Option<(String, usize)> {
    let indent = indent_of(line);
    let body = &line[indent..];
    let colon = body.find(": ").or_else(|| body.ends_with(':').then(|| body.len() - 1))?;
    let key = body[..colon].trim().trim_matches(|c| c == '"' || c == '\'').to_string();
    Some((key, indent + colon + 1))
}

/// Find the line holding the last key of `path`.
fn locate(lines: &[&str], path: &[&str]) -> Option<usize> {
    let (mut start, mut end) = (0, lines.len());
    let mut parent_indent: Option<usize> = None;
    let mut found = None;

    for key in path {
        let child_indent = lines[start..end]
            .iter()
            .find(|l| is_content(l))
            .map(|l| indent_of(l))
            .filter(|indent| parent_indent.map(|p| *indent > p).unwrap_or(true))?;

        let index = (start..end).find(|&i| {
            is_content(lines[i])
                && indent_of(lines[i]) == child_indent
                && split_key(lines[i]).map(|(k, _)| k == *key).unwrap_or(false)
        })?;

        let block_end = (index + 1..end)
            .find(|&i| is_content(lines[i]) && indent_of(lines[i]) <= child_indent)
            .unwrap_or(end);

        found = Some(index);
        parent_indent = Some(child_indent);
        start = index + 1;
        end = block_end;
    }
    found
}

/// Render `value` as a YAML scalar, quoted when needed.
fn render_scalar(value: &str) -> String {
    serde_yaml::to_string(&Value::from(value))
        .map(|s| s.trim_end().to_string())
        .unwrap_or_else(|_| value.to_string())
}

/// Replace the scalar at `path` in one fragment body. `None` when not found.
pub fn update_body(body: &str, path: &[&str], value: &str) -> Option<String> {
    let lines: Vec<&str> = body.lines().collect();
    let index = locate(&lines, path)?;
    let line = lines[index];
    let (_, value_at) = split_key(line)?;

    let current = line[value_at..].trim();
    if current.is_empty() || current.starts_with('&') || current.starts_with('*') {
        return None;
    }
    let comment = line[value_at..].find(" #").map(|at| &line[value_at + at..]).unwrap_or("");

    let replaced = format!("{} {}{}", &line[..value_at], render_scalar(value), comment);
    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    out[index] = replaced;

    let mut text = out.join("\n");
    if body.ends_with('\n') {
        text.push('\n');
    }
    Some(text)
}

/// Set the scalar at `path` by re-serializing the whole fragment.
pub fn update_parsed(body: &str, path: &[&str], value: &str) -> Option<String> {
    let mut doc: Value = serde_yaml::from_str(body).ok()?;
    let mut node = &mut doc;
    for key in path {
        node = node.as_mapping_mut()?.get_mut(*key)?;
    }
    if node.is_mapping() || node.is_sequence() || node.is_null() {
        return None;
    }
    *node = Value::from(value);
    serde_yaml::to_string(&doc).ok()
}

impl StackSources {
    /// Set `dotted_path` to `value` in every compose fragment that defines it.
    pub fn update(&self, dotted_path: &str, value: &str) -> Result<Vec<PathBuf>> {
        let path: Vec<&str> = dotted_path.split('.').collect();
        let mut touched = Vec::new();

        for compose_file in &self.compose_files {
            let body = std::fs::read_to_string(compose_file)
                .map_err(|e| DsppError::io(compose_file.clone(), e))?;
            let updated = update_body(&body, &path, value).or_else(|| update_parsed(&body, &path, value));
            let Some(updated) = updated else { continue };

            std::fs::write(compose_file, updated)
                .map_err(|e| DsppError::io(compose_file.clone(), e))?;
            info!("Set {} to {} in {}", dotted_path, value, compose_file.display());
            touched.push(compose_file.clone());
        }

        if touched.is_empty() {
            return Err(DsppError::UpdatePathNotFound { path: dotted_path.to_string() });
        }
        Ok(touched)
    }
}
