use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, LayerflowError};

/// Backend that executes a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Reasoning CLI.
    #[serde(alias = "reasoning")]
    Claude,
    /// Search / grounding CLI.
    #[serde(alias = "search")]
    Gemini,
    /// Multimodal HTTP API.
    Multimodal,
}

impl LayerKind {
    pub const ALL: [LayerKind; 3] = [LayerKind::Claude, LayerKind::Gemini, LayerKind::Multimodal];

    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Claude => "claude",
            LayerKind::Gemini => "gemini",
            LayerKind::Multimodal => "multimodal",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerKind {
    type Err = LayerflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" | "reasoning" => Ok(LayerKind::Claude),
            "gemini" | "search" => Ok(LayerKind::Gemini),
            "multimodal" => Ok(LayerKind::Multimodal),
            other => Err(LayerflowError::Config(format!("Unknown layer: {}", other))),
        }
    }
}

/// Operation a step asks its layer to perform.
///
/// The set is closed: every action lists the layers that accept it, and a
/// graph pairing an action with any other layer is rejected at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Reason,
    Code,
    Review,
    Summarize,
    Search,
    Ground,
    Analyze,
    ProcessFile,
    DescribeImage,
    Transcribe,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Reason => "reason",
            Action::Code => "code",
            Action::Review => "review",
            Action::Summarize => "summarize",
            Action::Search => "search",
            Action::Ground => "ground",
            Action::Analyze => "analyze",
            Action::ProcessFile => "process_file",
            Action::DescribeImage => "describe_image",
            Action::Transcribe => "transcribe",
        }
    }

    /// Layers able to run this action.
    pub fn layers(&self) -> &'static [LayerKind] {
        match self {
            Action::Reason | Action::Code | Action::Review => &[LayerKind::Claude],
            Action::Summarize => &[LayerKind::Claude, LayerKind::Gemini],
            Action::Search | Action::Ground => &[LayerKind::Gemini],
            Action::Analyze => &[LayerKind::Gemini, LayerKind::Multimodal],
            Action::ProcessFile | Action::DescribeImage | Action::Transcribe => {
                &[LayerKind::Multimodal]
            }
        }
    }

    pub fn supported_by(&self, layer: LayerKind) -> bool {
        self.layers().contains(&layer)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the scheduler walks the phases of a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One step at a time, phase by phase, in declaration order.
    Sequential,
    /// Every ready step runs at once, bounded by per-layer concurrency.
    Parallel,
    /// Parallel if any phase is wider than one step, otherwise sequential.
    #[default]
    Adaptive,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = LayerflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            "adaptive" => Ok(ExecutionMode::Adaptive),
            other => Err(LayerflowError::Config(format!(
                "Unknown execution mode: {}",
                other
            ))),
        }
    }
}

/// A step with every input reference substituted, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedStep {
    pub id: String,
    /// Id of the step this one replaces, when dispatched as a fallback.
    pub replaces: Option<String>,
    pub layer: LayerKind,
    pub action: Action,
    pub input: serde_json::Map<String, serde_json::Value>,
}

impl ResolvedStep {
    /// Look up a string input field.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input.get(key).and_then(|v| v.as_str())
    }
}

/// What a layer returns for a successful call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerOutput {
    pub data: serde_json::Value,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

impl LayerOutput {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            tokens_used: None,
            cost: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(serde_json::Value::String(text.into()))
    }

    pub fn with_usage(mut self, tokens_used: Option<u64>, cost: Option<f64>) -> Self {
        self.tokens_used = tokens_used;
        self.cost = cost;
        self
    }
}

/// Bookkeeping attached to every step outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub layer: LayerKind,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Layer calls made, including retries. Zero if never dispatched.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl StepMetadata {
    pub fn new(layer: LayerKind) -> Self {
        Self {
            layer,
            duration_ms: 0,
            tokens_used: None,
            cost: None,
            attempts: 0,
            fallback_used: false,
            fallback_step_id: None,
            error_kind: None,
        }
    }

    /// Whether the layer was actually called for this step.
    pub fn executed(&self) -> bool {
        self.attempts > 0
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: StepMetadata,
}

impl StepResult {
    pub fn succeeded(layer: LayerKind, output: LayerOutput, duration_ms: u64, attempts: u32) -> Self {
        let mut metadata = StepMetadata::new(layer);
        metadata.duration_ms = duration_ms;
        metadata.tokens_used = output.tokens_used;
        metadata.cost = output.cost;
        metadata.attempts = attempts;
        Self {
            success: true,
            data: Some(output.data),
            error: None,
            metadata,
        }
    }

    pub fn failed(layer: LayerKind, error: &LayerflowError, duration_ms: u64, attempts: u32) -> Self {
        let mut metadata = StepMetadata::new(layer);
        metadata.duration_ms = duration_ms;
        metadata.attempts = attempts;
        metadata.error_kind = Some(error.kind());
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            metadata,
        }
    }

    /// A step bypassed because an upstream step failed.
    pub fn skipped(layer: LayerKind, failed_dependency: &str) -> Self {
        let mut metadata = StepMetadata::new(layer);
        metadata.error_kind = Some(ErrorKind::Skipped);
        Self {
            success: false,
            data: None,
            error: Some(format!("Skipped: dependency '{}' failed", failed_dependency)),
            metadata,
        }
    }

    /// A step the run never reached because it halted first.
    pub fn not_executed(layer: LayerKind, reason: &str) -> Self {
        let mut metadata = StepMetadata::new(layer);
        metadata.error_kind = Some(ErrorKind::NotExecuted);
        Self {
            success: false,
            data: None,
            error: Some(format!("Not executed: {}", reason)),
            metadata,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.metadata.error_kind
    }
}

/// Totals for a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub steps_completed: usize,
    pub steps_failed: usize,
    #[serde(default)]
    pub steps_skipped: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    /// Mode actually used (adaptive resolves to one of the other two).
    pub mode: ExecutionMode,
    pub phases: Vec<Vec<String>>,
}

/// Aggregate outcome of `execute_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub results: BTreeMap<String, StepResult>,
    pub metadata: WorkflowMetadata,
}

impl WorkflowResult {
    pub fn get(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    /// Ids of steps whose slot holds a fallback's result.
    pub fn fallbacks_used(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.metadata.fallback_used)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_kind_aliases() {
        let layer: LayerKind = serde_json::from_str("\"reasoning\"").unwrap();
        assert_eq!(layer, LayerKind::Claude);
        let layer: LayerKind = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(layer, LayerKind::Gemini);
        assert_eq!("Multimodal".parse::<LayerKind>().unwrap(), LayerKind::Multimodal);
        assert!("openai".parse::<LayerKind>().is_err());
    }

    #[test]
    fn test_action_layers() {
        assert!(Action::Search.supported_by(LayerKind::Gemini));
        assert!(!Action::Search.supported_by(LayerKind::Claude));
        assert!(Action::Summarize.supported_by(LayerKind::Claude));
        assert!(Action::ProcessFile.supported_by(LayerKind::Multimodal));
        assert!(!Action::Code.supported_by(LayerKind::Multimodal));
    }

    #[test]
    fn test_action_serde_names() {
        let action: Action = serde_json::from_str("\"process_file\"").unwrap();
        assert_eq!(action, Action::ProcessFile);
        assert_eq!(serde_json::to_string(&Action::DescribeImage).unwrap(), "\"describe_image\"");
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("PARALLEL".parse::<ExecutionMode>().unwrap(), ExecutionMode::Parallel);
        assert_eq!(ExecutionMode::default(), ExecutionMode::Adaptive);
        assert!("eager".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_step_result_constructors() {
        let ok = StepResult::succeeded(
            LayerKind::Gemini,
            LayerOutput::text("found").with_usage(Some(12), Some(0.01)),
            40,
            1,
        );
        assert!(ok.success);
        assert_eq!(ok.data, Some(serde_json::json!("found")));
        assert_eq!(ok.metadata.tokens_used, Some(12));
        assert!(ok.metadata.executed());

        let skipped = StepResult::skipped(LayerKind::Claude, "search");
        assert!(!skipped.success);
        assert_eq!(skipped.error_kind(), Some(ErrorKind::Skipped));
        assert!(!skipped.metadata.executed());

        let failed = StepResult::failed(
            LayerKind::Claude,
            &LayerflowError::InvalidInput("empty prompt".into()),
            3,
            1,
        );
        assert_eq!(failed.error_kind(), Some(ErrorKind::InvalidInput));
        assert!(failed.error.unwrap().contains("empty prompt"));
    }
}
