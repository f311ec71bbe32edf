use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use layerflow_core::config::CliLayerConfig;
use layerflow_core::error::{LayerflowError, Result};
use layerflow_core::traits::Layer;
use layerflow_core::types::{Action, LayerKind, LayerOutput, ResolvedStep};

use crate::process::{resolve_binary, CliInvocation};
use crate::prompt;

/// Search and grounding layer backed by the `gemini` CLI.
pub struct GeminiLayer {
    binary: String,
    resolved: Option<PathBuf>,
    model: Option<String>,
    extra_args: Vec<String>,
    timeout: Option<Duration>,
    max_concurrency: Option<usize>,
}

impl GeminiLayer {
    pub fn new(config: &CliLayerConfig) -> Self {
        let binary = config.binary_or("gemini").to_string();
        Self {
            resolved: resolve_binary(&binary),
            binary,
            model: config.model.clone(),
            extra_args: config.extra_args.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            max_concurrency: config.max_concurrency,
        }
    }

    fn invocation(&self, program: PathBuf, step: &ResolvedStep) -> CliInvocation {
        let mut cmd = CliInvocation::new(LayerKind::Gemini, program);
        let model = step.input_str("model").or(self.model.as_deref());
        if let Some(model) = model {
            cmd = cmd.arg("-m").arg(model);
        }
        cmd.args(self.extra_args.iter().cloned())
            .arg("-p")
            .arg(prompt::render(step))
    }

    fn unavailable(&self) -> LayerflowError {
        LayerflowError::LayerUnavailable {
            layer: LayerKind::Gemini,
            reason: format!("'{}' not found on PATH", self.binary),
        }
    }
}

impl Layer for GeminiLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Gemini
    }

    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.resolved {
                Some(_) => Ok(()),
                None => Err(self.unavailable()),
            }
        })
    }

    fn is_available(&self) -> bool {
        self.resolved.is_some()
    }

    fn execute(&self, step: ResolvedStep) -> BoxFuture<'_, Result<LayerOutput>> {
        Box::pin(async move {
            let program = self.resolved.clone().ok_or_else(|| self.unavailable())?;
            debug!(step_id = %step.id, action = %step.action, "Calling gemini CLI");
            let stdout = self.invocation(program, &step).run().await?;
            let text = stdout.trim();
            if text.is_empty() {
                return Err(LayerflowError::StepExecution {
                    step: step.id.clone(),
                    message: "gemini returned no output".into(),
                });
            }
            Ok(LayerOutput::text(text))
        })
    }

    fn estimated_duration(&self, step: &ResolvedStep) -> Duration {
        match step.action {
            Action::Search | Action::Ground => Duration::from_secs(20),
            _ => Duration::from_secs(10),
        }
    }

    fn default_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| LayerKind::Gemini.default_timeout())
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
            .unwrap_or_else(|| LayerKind::Gemini.default_concurrency())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_step(input: serde_json::Value) -> ResolvedStep {
        ResolvedStep {
            id: "search".into(),
            replaces: None,
            layer: LayerKind::Gemini,
            action: Action::Search,
            input: input.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_invocation_passes_prompt_as_arg() {
        let layer = GeminiLayer::new(&CliLayerConfig {
            model: Some("gemini-2.5-pro".into()),
            ..CliLayerConfig::default()
        });
        let cmd = layer.invocation(PathBuf::from("gemini"), &search_step(json!({"query": "tokio"})));
        assert_eq!(&cmd.args[..3], ["-m", "gemini-2.5-pro", "-p"]);
        assert!(cmd.args[3].starts_with("Search the web"));
        assert!(cmd.args[3].ends_with("tokio"));
        assert!(cmd.stdin.is_none());
    }

    #[test]
    fn test_step_model_overrides_config() {
        let layer = GeminiLayer::new(&CliLayerConfig::default());
        let cmd = layer.invocation(
            PathBuf::from("gemini"),
            &search_step(json!({"query": "x", "model": "gemini-2.5-flash"})),
        );
        assert_eq!(cmd.args[1], "gemini-2.5-flash");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_with_stub_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("gemini");
        std::fs::write(&script, "#!/bin/sh\necho \"results for: $2\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let layer = GeminiLayer::new(&CliLayerConfig {
            binary: Some(script.to_string_lossy().into_owned()),
            ..CliLayerConfig::default()
        });
        assert!(layer.is_available());
        layer.initialize().await.unwrap();

        let output = layer.execute(search_step(json!({"query": "tokio"}))).await.unwrap();
        let text = output.data.as_str().unwrap();
        assert!(text.starts_with("results for: Search the web"));
    }
}
