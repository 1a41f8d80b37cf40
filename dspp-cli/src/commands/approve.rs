//! Diff display and interactive confirmation

use async_trait::async_trait;
use colored::Colorize;
use dspp_core::reconcile::Approver;
use dspp_core::{DsppError, Result};
use similar::{ChangeTag, TextDiff};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffStyle {
    Unified,
    SideBySide,
}

impl DiffStyle {
    fn toggle(self) -> Self {
        match self {
            DiffStyle::Unified => DiffStyle::SideBySide,
            DiffStyle::SideBySide => DiffStyle::Unified,
        }
    }
}

/// Shows the diff on stderr, then asks (or, with `commit`, approves directly).
pub struct DiffApprover {
    commit: bool,
}

impl DiffApprover {
    pub fn new(commit: bool) -> Self {
        Self { commit }
    }
}

fn temp_with(contents: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new().map_err(DsppError::internal)?;
    file.write_all(contents.as_bytes()).map_err(|e| DsppError::io(file.path(), e))?;
    Ok(file)
}

/// Run an external diff tool. `false` when it could not be started.
async fn external_diff(style: DiffStyle, before: &Path, next: &Path) -> bool {
    let mut command = match style {
        DiffStyle::Unified => {
            let mut git = Command::new("git");
            git.args(["diff", "--no-index", "--color"]).arg(before).arg(next);
            git
        }
        DiffStyle::SideBySide => {
            let mut diff = Command::new("diff");
            diff.arg("-y").arg(before).arg(next);
            diff
        }
    };
    // Both tools exit 1 when the files differ. Stdout is kept for command output.
    command.stdout(std::io::stderr()).status().await.is_ok()
}

/// Changed lines of a unified diff, `-`/`+` prefixed, in document order.
fn changed_lines(current: &str, compiled: &str) -> Vec<(ChangeTag, String)> {
    TextDiff::from_lines(current, compiled)
        .iter_all_changes()
        .filter(|change| change.tag() != ChangeTag::Equal)
        .map(|change| {
            let sign = if change.tag() == ChangeTag::Delete { '-' } else { '+' };
            (change.tag(), format!("{}{}", sign, change.value().trim_end_matches('\n')))
        })
        .collect()
}

/// Line diff used when no diff tool is installed.
fn fallback_diff(current: &str, compiled: &str) {
    for (tag, line) in changed_lines(current, compiled) {
        match tag {
            ChangeTag::Delete => eprintln!("{}", line.red()),
            _ => eprintln!("{}", line.green()),
        }
    }
}

async fn prompt(question: &str) -> Result<Option<String>> {
    eprint!("{}", question);
    std::io::stderr().flush().map_err(|e| DsppError::io("<stderr>", e))?;

    let mut answer = String::new();
    let read = BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await
        .map_err(|e| DsppError::io("<stdin>", e))?;
    Ok((read > 0).then(|| answer.trim().to_lowercase()))
}

#[async_trait]
impl Approver for DiffApprover {
    async fn approve(&self, current: &str, compiled: &str) -> Result<bool> {
        let before = temp_with(current)?;
        let next = temp_with(compiled)?;
        let mut style = DiffStyle::Unified;

        loop {
            if !external_diff(style, before.path(), next.path()).await {
                fallback_diff(current, compiled);
            }
            if self.commit {
                return Ok(true);
            }

            let Some(answer) = prompt("Confirm [y/N/q] (q : toggle diff style): ").await? else {
                return Ok(false);
            };
            if answer != "q" {
                return Ok(answer == "y");
            }
            style = style.toggle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_style_toggle() {
        assert_eq!(DiffStyle::Unified.toggle(), DiffStyle::SideBySide);
        assert_eq!(DiffStyle::SideBySide.toggle().toggle(), DiffStyle::SideBySide);
    }

    #[test]
    fn test_changed_lines_follow_insertions() {
        let current = "a: 1\nb: 2\nc: 3\n";
        let compiled = "a: 1\nnew: 0\nb: 2\nc: 4\n";
        let lines: Vec<String> = changed_lines(current, compiled).into_iter().map(|(_, l)| l).collect();
        assert_eq!(lines, vec!["+new: 0", "-c: 3", "+c: 4"]);
    }

    #[test]
    fn test_temp_file_contents() {
        let file = temp_with("a: 1\n").unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "a: 1\n");
    }
}
