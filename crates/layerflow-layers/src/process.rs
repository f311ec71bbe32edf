//! Spawning layer CLIs and classifying how they fail.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use layerflow_core::error::{LayerflowError, Result};
use layerflow_core::types::LayerKind;

/// Stderr longer than this is cut before it lands in an error message.
const MAX_STDERR: usize = 2000;

/// Find `name` as given (if it contains a path separator) or on `PATH`.
pub fn resolve_binary(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

/// One CLI invocation.
#[derive(Debug, Clone)]
pub struct CliInvocation {
    pub layer: LayerKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl CliInvocation {
    pub fn new(layer: LayerKind, program: impl Into<PathBuf>) -> Self {
        Self {
            layer,
            program: program.into(),
            args: vec![],
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Run to completion and return stdout.
    ///
    /// The child is killed if the returned future is dropped, so a timeout
    /// or cancellation in the caller never leaves a process behind.
    pub async fn run(&self) -> Result<String> {
        debug!(layer = %self.layer, program = %self.program.display(), args = ?self.args, "Spawning layer CLI");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .kill_on_drop(true)
            .stdin(if self.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        if let (Some(input), Some(mut stdin)) = (&self.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(
            self.layer,
            output.status.code(),
            if stderr.trim().is_empty() { &stdout } else { &stderr },
        ))
    }

    fn spawn_error(&self, e: std::io::Error) -> LayerflowError {
        if e.kind() == std::io::ErrorKind::NotFound {
            LayerflowError::LayerUnavailable {
                layer: self.layer,
                reason: format!("'{}' not found", self.program.display()),
            }
        } else {
            LayerflowError::Transport(format!(
                "failed to start '{}': {}",
                self.program.display(),
                e
            ))
        }
    }
}

/// Map a non-zero exit to an error kind from what the CLI printed.
pub fn classify_failure(layer: LayerKind, code: Option<i32>, stderr: &str) -> LayerflowError {
    let mut message = stderr.trim().to_string();
    if message.len() > MAX_STDERR {
        let mut cut = MAX_STDERR;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push_str("... (truncated)");
    }

    let lower = message.to_lowercase();
    if lower.contains("rate limit")
        || lower.contains("429")
        || lower.contains("quota")
        || lower.contains("resource_exhausted")
    {
        return LayerflowError::RateLimited { layer, message };
    }

    let code = code.map_or("signal".to_string(), |c| c.to_string());
    LayerflowError::StepExecution {
        step: layer.to_string(),
        message: format!("exit {}: {}", code, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_failure(LayerKind::Gemini, Some(1), "Error: 429 RESOURCE_EXHAUSTED");
        assert!(matches!(err, LayerflowError::RateLimited { layer: LayerKind::Gemini, .. }));

        let err = classify_failure(LayerKind::Claude, Some(1), "API usage quota reached");
        assert!(err.is_retryable());
        assert!(matches!(err, LayerflowError::RateLimited { .. }));
    }

    #[test]
    fn test_classify_generic_failure() {
        let err = classify_failure(LayerKind::Claude, Some(2), "  unknown flag --foo \n");
        match err {
            LayerflowError::StepExecution { message, .. } => {
                assert_eq!(message, "exit 2: unknown flag --foo");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_classify_truncates_long_output() {
        let noisy = "é".repeat(MAX_STDERR);
        let err = classify_failure(LayerKind::Claude, None, &noisy);
        let text = err.to_string();
        assert!(text.contains("exit signal"));
        assert!(text.ends_with("(truncated)"));
    }

    #[test]
    fn test_resolve_binary() {
        assert!(resolve_binary("").is_none());
        assert!(resolve_binary("layerflow-surely-missing-binary").is_none());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        assert_eq!(resolve_binary(path.to_str().unwrap()), Some(path));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout_and_stdin() {
        let out = CliInvocation::new(LayerKind::Claude, "cat")
            .stdin("hello layer")
            .run()
            .await
            .unwrap();
        assert_eq!(out, "hello layer");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_missing_program_is_unavailable() {
        let err = CliInvocation::new(LayerKind::Gemini, "/nonexistent/gemini-cli")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LayerflowError::LayerUnavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let err = CliInvocation::new(LayerKind::Gemini, "sh")
            .args(["-c", "echo 'Too many requests: rate limit' >&2; exit 3"])
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LayerflowError::RateLimited { .. }));
    }
}
