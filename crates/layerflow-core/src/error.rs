use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::LayerKind;

#[derive(Debug, Error)]
pub enum LayerflowError {
    // Graph structure errors (raised before any step runs)
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}': action '{action}' is not supported by layer '{layer}'")]
    UnsupportedAction {
        step: String,
        layer: LayerKind,
        action: String,
    },

    #[error("Invalid fallback for step '{step}': {reason}")]
    InvalidFallback { step: String, reason: String },

    #[error("Step '{step}' references '{reference}', which is not a completed upstream step")]
    UnresolvedReference { step: String, reference: String },

    // Per-step errors
    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    StepTimeout { step: String, timeout_ms: u64 },

    #[error("Step execution failed: {step}: {message}")]
    StepExecution { step: String, message: String },

    #[error("Layer '{layer}' is rate limited: {message}")]
    RateLimited { layer: LayerKind, message: String },

    #[error("Layer '{layer}' unavailable: {reason}")]
    LayerUnavailable { layer: LayerKind, reason: String },

    #[error("Invalid step input: {0}")]
    InvalidInput(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Workflow cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LayerflowError {
    /// Whether another attempt against the same layer may succeed.
    ///
    /// Unavailable layers and malformed input are never retried; the former
    /// goes straight to the fallback manager.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LayerflowError::StepTimeout { .. }
                | LayerflowError::StepExecution { .. }
                | LayerflowError::RateLimited { .. }
                | LayerflowError::Transport(_)
        )
    }

    /// Whether this error describes the graph itself rather than a step run.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            LayerflowError::DependencyCycle { .. }
                | LayerflowError::UnknownDependency { .. }
                | LayerflowError::DuplicateStep(_)
                | LayerflowError::UnsupportedAction { .. }
                | LayerflowError::InvalidFallback { .. }
                | LayerflowError::UnresolvedReference { .. }
        )
    }

    /// Classification recorded in a failed step's metadata.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LayerflowError::StepTimeout { .. } => ErrorKind::Timeout,
            LayerflowError::RateLimited { .. } => ErrorKind::RateLimited,
            LayerflowError::LayerUnavailable { .. } => ErrorKind::LayerUnavailable,
            LayerflowError::InvalidInput(_) | LayerflowError::UnresolvedReference { .. } => {
                ErrorKind::InvalidInput
            }
            LayerflowError::Transport(_) | LayerflowError::Io(_) => ErrorKind::Transport,
            LayerflowError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Execution,
        }
    }
}

/// Serializable failure class attached to a `StepResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Execution,
    RateLimited,
    LayerUnavailable,
    InvalidInput,
    Transport,
    Cancelled,
    /// A dependency failed and `continue_on_error` was set.
    Skipped,
    /// The run halted before this step was dispatched.
    NotExecuted,
}

pub type Result<T> = std::result::Result<T, LayerflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LayerflowError::StepTimeout {
            step: "a".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(LayerflowError::Transport("reset".into()).is_retryable());
        assert!(LayerflowError::RateLimited {
            layer: LayerKind::Gemini,
            message: "429".into()
        }
        .is_retryable());

        assert!(!LayerflowError::InvalidInput("bad".into()).is_retryable());
        assert!(!LayerflowError::LayerUnavailable {
            layer: LayerKind::Claude,
            reason: "not installed".into()
        }
        .is_retryable());
        assert!(!LayerflowError::Cancelled.is_retryable());
    }

    #[test]
    fn test_cycle_message_names_ids() {
        let err = LayerflowError::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
        assert!(err.is_structural());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(LayerflowError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            LayerflowError::LayerUnavailable {
                layer: LayerKind::Multimodal,
                reason: "no key".into()
            }
            .kind(),
            ErrorKind::LayerUnavailable
        );
        assert_eq!(
            LayerflowError::StepExecution {
                step: "x".into(),
                message: "exit 1".into()
            }
            .kind(),
            ErrorKind::Execution
        );
    }
}
