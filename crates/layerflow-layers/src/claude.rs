use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use layerflow_core::config::CliLayerConfig;
use layerflow_core::error::{LayerflowError, Result};
use layerflow_core::traits::Layer;
use layerflow_core::types::{Action, LayerKind, LayerOutput, ResolvedStep};

use crate::process::{resolve_binary, CliInvocation};
use crate::prompt;

/// Reasoning layer backed by the `claude` CLI in print mode.
pub struct ClaudeLayer {
    binary: String,
    resolved: Option<PathBuf>,
    model: Option<String>,
    extra_args: Vec<String>,
    timeout: Option<Duration>,
    max_concurrency: Option<usize>,
}

impl ClaudeLayer {
    pub fn new(config: &CliLayerConfig) -> Self {
        let binary = config.binary_or("claude").to_string();
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
        let mut cmd = CliInvocation::new(LayerKind::Claude, program).args(["-p", "--output-format", "json"]);
        let model = step.input_str("model").or(self.model.as_deref());
        if let Some(model) = model {
            cmd = cmd.arg("--model").arg(model);
        }
        cmd.args(self.extra_args.iter().cloned())
            .stdin(prompt::render(step))
    }
}

/// The JSON envelope printed by `claude -p --output-format json`.
#[derive(Debug, Deserialize)]
struct ClaudeEnvelope {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

/// Turn CLI stdout into a layer output. Non-JSON output is taken as text.
pub fn parse_output(stdout: &str) -> Result<LayerOutput> {
    let trimmed = stdout.trim();
    let envelope: ClaudeEnvelope = match serde_json::from_str(trimmed) {
        Ok(envelope) => envelope,
        Err(_) => return Ok(LayerOutput::text(trimmed)),
    };

    if envelope.is_error {
        return Err(LayerflowError::StepExecution {
            step: LayerKind::Claude.to_string(),
            message: envelope
                .result
                .or(envelope.subtype)
                .unwrap_or_else(|| "claude reported an error".into()),
        });
    }

    let tokens = envelope
        .usage
        .map(|u| u.input_tokens + u.output_tokens + u.cache_read_input_tokens);
    Ok(LayerOutput::text(envelope.result.unwrap_or_default())
        .with_usage(tokens, envelope.total_cost_usd))
}

impl Layer for ClaudeLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Claude
    }

    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.resolved.is_some() {
                Ok(())
            } else {
                Err(LayerflowError::LayerUnavailable {
                    layer: LayerKind::Claude,
                    reason: format!("'{}' not found on PATH", self.binary),
                })
            }
        })
    }

    fn is_available(&self) -> bool {
        self.resolved.is_some()
    }

    fn execute(&self, step: ResolvedStep) -> BoxFuture<'_, Result<LayerOutput>> {
        Box::pin(async move {
            let program = self.resolved.clone().ok_or_else(|| LayerflowError::LayerUnavailable {
                layer: LayerKind::Claude,
                reason: format!("'{}' not found on PATH", self.binary),
            })?;
            debug!(step_id = %step.id, action = %step.action, "Calling claude CLI");
            let stdout = self.invocation(program, &step).run().await?;
            parse_output(&stdout)
        })
    }

    fn estimated_duration(&self, step: &ResolvedStep) -> Duration {
        match step.action {
            Action::Code | Action::Review => Duration::from_secs(60),
            _ => Duration::from_secs(30),
        }
    }

    fn default_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| LayerKind::Claude.default_timeout())
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
            .unwrap_or_else(|| LayerKind::Claude.default_concurrency())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json_envelope() {
        let stdout = r#"{"type":"result","subtype":"success","is_error":false,
            "result":"The answer is 42.","total_cost_usd":0.0123,
            "usage":{"input_tokens":100,"output_tokens":20,"cache_read_input_tokens":5}}"#;
        let output = parse_output(stdout).unwrap();
        assert_eq!(output.data, json!("The answer is 42."));
        assert_eq!(output.tokens_used, Some(125));
        assert_eq!(output.cost, Some(0.0123));
    }

    #[test]
    fn test_parse_error_envelope() {
        let stdout = r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#;
        let err = parse_output(stdout).unwrap_err();
        assert!(err.to_string().contains("error_max_turns"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_plain_text() {
        let output = parse_output("  just text\n").unwrap();
        assert_eq!(output.data, json!("just text"));
        assert_eq!(output.tokens_used, None);
    }

    #[test]
    fn test_invocation_args() {
        let config = CliLayerConfig {
            model: Some("sonnet".into()),
            extra_args: vec!["--verbose".into()],
            ..CliLayerConfig::default()
        };
        let layer = ClaudeLayer::new(&config);
        let mut input = serde_json::Map::new();
        input.insert("prompt".into(), json!("hi"));
        let step = ResolvedStep {
            id: "a".into(),
            replaces: None,
            layer: LayerKind::Claude,
            action: Action::Reason,
            input,
        };
        let cmd = layer.invocation(PathBuf::from("claude"), &step);
        assert_eq!(
            cmd.args,
            vec!["-p", "--output-format", "json", "--model", "sonnet", "--verbose"]
        );
        assert!(cmd.stdin.unwrap().ends_with("hi"));
    }

    #[test]
    fn test_missing_binary_unavailable() {
        let config = CliLayerConfig {
            binary: Some("/nonexistent/claude".into()),
            ..CliLayerConfig::default()
        };
        let layer = ClaudeLayer::new(&config);
        assert!(!layer.is_available());
        assert_eq!(layer.max_concurrency(), 2);
        assert_eq!(layer.default_timeout(), Duration::from_secs(120));
    }
}
