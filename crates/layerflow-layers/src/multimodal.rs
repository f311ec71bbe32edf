use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use layerflow_core::config::ApiLayerConfig;
use layerflow_core::error::{LayerflowError, Result};
use layerflow_core::traits::Layer;
use layerflow_core::types::{Action, LayerKind, LayerOutput, ResolvedStep};

use crate::prompt;

/// Inline request data is capped by the API at 20 MB per request.
const MAX_INLINE_BYTES: u64 = 20 * 1024 * 1024;

/// File and media layer backed by the Gemini `generateContent` REST API.
pub struct MultimodalLayer {
    http: Client,
    config: ApiLayerConfig,
}

impl MultimodalLayer {
    pub fn new(config: ApiLayerConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn api_key(&self) -> Result<&str> {
        self.config
            .resolved_api_key()
            .ok_or_else(|| LayerflowError::LayerUnavailable {
                layer: LayerKind::Multimodal,
                reason: "no API key configured".into(),
            })
    }

    async fn build_request(&self, step: &ResolvedStep) -> Result<GenerateContentRequest> {
        let files = attached_files(step)?;
        if files.is_empty() && needs_file(step.action) {
            return Err(LayerflowError::InvalidInput(format!(
                "Step '{}': action '{}' needs a 'file' or 'files' input",
                step.id, step.action
            )));
        }

        let mut parts = vec![Part::Text {
            text: prompt::render(step),
        }];
        let mut total = 0;
        for path in &files {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                LayerflowError::InvalidInput(format!("cannot read '{}': {}", path.display(), e))
            })?;
            total += bytes.len() as u64;
            if total > MAX_INLINE_BYTES {
                return Err(LayerflowError::InvalidInput(format!(
                    "attachments exceed {} bytes",
                    MAX_INLINE_BYTES
                )));
            }
            debug!(step_id = %step.id, file = %path.display(), bytes = bytes.len(), "Attaching file");
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: mime_for(path),
                    data: BASE64_STANDARD.encode(bytes),
                },
            });
        }

        Ok(GenerateContentRequest {
            contents: vec![Content {
                role: "user".into(),
                parts,
            }],
            generation_config: GenerationConfig {
                max_output_tokens: self.config.max_tokens,
            },
        })
    }

    fn cost_for(&self, tokens: u64) -> Option<f64> {
        self.config
            .cost_per_1k_tokens
            .map(|price| tokens as f64 / 1000.0 * price)
    }
}

fn needs_file(action: Action) -> bool {
    matches!(
        action,
        Action::ProcessFile | Action::DescribeImage | Action::Transcribe
    )
}

/// Paths named by the `file` and `files` inputs.
fn attached_files(step: &ResolvedStep) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if let Some(file) = step.input.get("file") {
        match file {
            Value::String(path) => files.push(PathBuf::from(path)),
            _ => return Err(LayerflowError::InvalidInput("'file' must be a path string".into())),
        }
    }
    if let Some(list) = step.input.get("files") {
        let Value::Array(items) = list else {
            return Err(LayerflowError::InvalidInput("'files' must be a list of paths".into()));
        };
        for item in items {
            let path = item.as_str().ok_or_else(|| {
                LayerflowError::InvalidInput("'files' must be a list of paths".into())
            })?;
            files.push(PathBuf::from(path));
        }
    }
    Ok(files)
}

fn mime_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

// ── Request types ────────────────────────────────────────────────

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Debug)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

// ── Response types ───────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct UsageMetadata {
    #[serde(default, rename = "totalTokenCount")]
    total_token_count: u64,
}

#[derive(Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

/// Text of the first candidate plus total token usage.
fn parse_response(body: &str) -> Result<(String, Option<u64>)> {
    let parsed: GenerateContentResponse = serde_json::from_str(body)?;
    let tokens = parsed.usage_metadata.map(|u| u.total_token_count);
    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(LayerflowError::StepExecution {
            step: LayerKind::Multimodal.to_string(),
            message: "response contained no text".into(),
        });
    }
    Ok((text, tokens))
}

/// 429 is a rate limit, 5xx is transient, any other 4xx is the caller's fault.
fn map_http_error(status: StatusCode, body: &str) -> LayerflowError {
    let message = serde_json::from_str::<ErrorWrapper>(body)
        .map(|w| match (w.error.status, w.error.message) {
            (Some(s), Some(m)) => format!("{}: {}", s, m),
            (_, Some(m)) => m,
            (Some(s), None) => s,
            (None, None) => body.to_string(),
        })
        .unwrap_or_else(|_| body.to_string());
    let message = format!("HTTP {}: {}", status.as_u16(), message);

    if status == StatusCode::TOO_MANY_REQUESTS {
        LayerflowError::RateLimited {
            layer: LayerKind::Multimodal,
            message,
        }
    } else if status.is_server_error() {
        LayerflowError::Transport(message)
    } else {
        LayerflowError::InvalidInput(message)
    }
}

impl Layer for MultimodalLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Multimodal
    }

    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.api_key()?;
            Ok(())
        })
    }

    fn is_available(&self) -> bool {
        self.config.resolved_api_key().is_some()
    }

    fn execute(&self, step: ResolvedStep) -> BoxFuture<'_, Result<LayerOutput>> {
        Box::pin(async move {
            let api_key = self.api_key()?;
            let body = self.build_request(&step).await?;
            let model = step.input_str("model").unwrap_or(&self.config.model);
            let url = format!(
                "{}/models/{}:generateContent",
                self.config.base_url.trim_end_matches('/'),
                model
            );

            debug!(step_id = %step.id, model, action = %step.action, "Calling multimodal API");
            let response = self
                .http
                .post(&url)
                .query(&[("key", api_key)])
                .json(&body)
                .send()
                .await
                .map_err(|e| LayerflowError::Transport(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| LayerflowError::Transport(e.to_string()))?;
            if !status.is_success() {
                let err = map_http_error(status, &text);
                warn!(step_id = %step.id, status = status.as_u16(), error = %err, "Multimodal API error");
                return Err(err);
            }

            let (answer, tokens) = parse_response(&text)?;
            let cost = tokens.and_then(|t| self.cost_for(t));
            Ok(LayerOutput::text(answer).with_usage(tokens, cost))
        })
    }

    fn cost(&self, step: &ResolvedStep) -> Option<f64> {
        // Roughly four characters per token, plus the output budget.
        let prompt_tokens = prompt::render(step).len() as u64 / 4;
        self.cost_for(prompt_tokens + self.config.max_tokens as u64)
    }

    fn estimated_duration(&self, step: &ResolvedStep) -> Duration {
        match step.action {
            Action::Transcribe => Duration::from_secs(120),
            Action::ProcessFile | Action::DescribeImage => Duration::from_secs(45),
            _ => Duration::from_secs(20),
        }
    }

    fn default_timeout(&self) -> Duration {
        self.config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| LayerKind::Multimodal.default_timeout())
    }

    fn max_concurrency(&self) -> usize {
        self.config
            .max_concurrency
            .unwrap_or_else(|| LayerKind::Multimodal.default_concurrency())
    }
}
