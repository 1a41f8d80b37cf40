//! Subprocess generation for `exec` and `shell` descriptors.

use super::descriptor::Descriptor;
use crate::error::{DsppError, Result};
use serde_yaml::Value;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Build the command a descriptor asks for, if any.
fn command_for(name: &str, descriptor: &Descriptor) -> Result<Option<Command>> {
    let argv = descriptor.argv();

    if let Some(exec) = &descriptor.exec {
        let mut parts: Vec<String> = match exec {
            Value::String(line) => line.split_whitespace().map(str::to_string).collect(),
            Value::Sequence(seq) => seq
                .iter()
                .filter_map(crate::interpolate::scalar_to_string)
                .collect(),
            _ => Vec::new(),
        };
        if parts.is_empty() {
            return Err(DsppError::InvalidDescriptor {
                name: name.to_string(),
                reason: "exec must be a command string or list".to_string(),
            });
        }
        let program = parts.remove(0);
        let mut cmd = Command::new(program);
        cmd.args(parts).args(argv);
        return Ok(Some(cmd));
    }

    if let Some(line) = &descriptor.shell {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string());
        let mut cmd = Command::new(shell);
        // Positional args land in $1.. after the $0 placeholder.
        cmd.arg("-c").arg(line).arg(name).args(argv);
        return Ok(Some(cmd));
    }

    Ok(None)
}

/// Run the descriptor's command in `cwd` and capture its stdout.
///
/// Returns `None` when the descriptor has neither `exec` nor `shell`.
pub async fn run(name: &str, descriptor: &Descriptor, cwd: &Path) -> Result<Option<Vec<u8>>> {
    let Some(mut cmd) = command_for(name, descriptor)? else { return Ok(None) };

    cmd.current_dir(cwd)
        .envs(descriptor.env_pairs())
        .stdin(if descriptor.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let spawn_failed = |e: std::io::Error| DsppError::ExecFailed {
        name: name.to_string(),
        status: "spawn failure".to_string(),
        stderr: e.to_string(),
    };
    let mut child = cmd.spawn().map_err(spawn_failed)?;

    // Stdin is fed while stdout drains, so a filter echoing its input cannot fill the pipe.
    let stdin = child.stdin.take();
    let feed = async move {
        let (Some(input), Some(mut stdin)) = (&descriptor.stdin, stdin) else { return Ok(()) };
        // `stdin` drops at the end of the block, so the child sees EOF.
        match stdin.write_all(input.as_bytes()).await {
            // The child may exit without reading all of its input.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output.map_err(spawn_failed)?;
    fed.map_err(spawn_failed)?;
    if !output.status.success() {
        return Err(DsppError::ExecFailed {
            name: name.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    debug!(descriptor = name, size = output.stdout.len(), "Captured command output");
    Ok(Some(output.stdout))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(body: &str) -> Descriptor {
        let value: Value = serde_yaml::from_str(body).unwrap();
        Descriptor::from_value("gen", &value).unwrap()
    }

    #[tokio::test]
    async fn test_exec_with_args_and_env() {
        let temp = TempDir::new().unwrap();
        let d = descriptor("{exec: [printf, '%s-%s'], args: [a, b]}");
        let out = run("gen", &d, temp.path()).await.unwrap().unwrap();
        assert_eq!(out, b"a-b");

        let d = descriptor("{shell: 'printf \"$GREETING $1\"', args: [ops], env: {GREETING: hi}}");
        let out = run("gen", &d, temp.path()).await.unwrap().unwrap();
        assert_eq!(out, b"hi ops");
    }

    #[tokio::test]
    async fn test_stdin_is_fed() {
        let temp = TempDir::new().unwrap();
        let d = descriptor("{exec: cat, stdin: 'from stdin'}");
        assert_eq!(run("gen", &d, temp.path()).await.unwrap().unwrap(), b"from stdin");
    }

    #[tokio::test]
    async fn test_large_stdin_does_not_deadlock() {
        let temp = TempDir::new().unwrap();
        let input = "x".repeat(1 << 20);
        let mut d = descriptor("{exec: cat}");
        d.stdin = Some(input.clone());

        let out = tokio::time::timeout(std::time::Duration::from_secs(10), run("gen", &d, temp.path()))
            .await
            .expect("exec blocked on a full pipe")
            .unwrap()
            .unwrap();
        assert_eq!(out.len(), input.len());
    }

    #[tokio::test]
    async fn test_runs_in_fragment_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("marker"), "here").unwrap();
        let d = descriptor("{exec: cat marker}");
        assert_eq!(run("gen", &d, temp.path()).await.unwrap().unwrap(), b"here");
    }

    #[tokio::test]
    async fn test_failure_and_absence() {
        let temp = TempDir::new().unwrap();
        let err = run("gen", &descriptor("{shell: 'echo boom >&2; exit 3'}"), temp.path())
            .await
            .unwrap_err();
        match err {
            DsppError::ExecFailed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(run("gen", &descriptor("{contents: x}"), temp.path()).await.unwrap().is_none());
    }
}
