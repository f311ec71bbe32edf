use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use layerflow_core::error::{ErrorKind, Result};
use layerflow_core::event::{EventBus, WorkflowEvent};
use layerflow_core::graph::{Step, TaskGraph};
use layerflow_core::types::{ResolvedStep, StepResult};

use crate::context::RunContext;
use crate::executor::StepExecutor;
use crate::template::resolve_input;

/// A fallback step with its input already resolved.
#[derive(Debug, Clone)]
pub struct PreparedFallback<'g> {
    pub step: &'g Step,
    pub resolved: ResolvedStep,
}

/// Replaces a failed step with its configured alternative.
///
/// A fallback runs once, without retries, and never triggers a fallback of
/// its own. Its outcome is recorded under the original step's id.
pub struct FallbackManager {
    event_bus: Arc<EventBus>,
}

impl FallbackManager {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self { event_bus }
    }

    /// Resolve the fallback for `original`, if the graph defines one.
    ///
    /// The fallback receives the original's resolved input overlaid with its
    /// own. Must be called while the original's dependencies are recorded.
    pub fn prepare<'g>(
        &self,
        graph: &'g TaskGraph,
        original: &ResolvedStep,
        results: &HashMap<String, StepResult>,
    ) -> Result<Option<PreparedFallback<'g>>> {
        let Some(step) = graph.fallback_for(&original.id) else {
            return Ok(None);
        };

        let own = match resolve_input(&step.id, &step.input, results) {
            Ok(input) => input,
            Err(e) if e.is_structural() => return Err(e),
            Err(e) => {
                warn!(step_id = %original.id, fallback_id = %step.id, error = %e, "Fallback input unusable, fallback disabled");
                return Ok(None);
            }
        };

        let mut input = original.input.clone();
        input.extend(own);

        Ok(Some(PreparedFallback {
            step,
            resolved: ResolvedStep {
                id: step.id.clone(),
                replaces: Some(original.id.clone()),
                layer: step.layer,
                action: step.action,
                input,
            },
        }))
    }

    /// Whether a primary outcome should hand over to the fallback.
    pub fn should_trigger(primary: &StepResult) -> bool {
        !primary.success && primary.error_kind() != Some(ErrorKind::Cancelled)
    }

    /// Run `fallback` if `primary` failed, returning the result for the
    /// original step's slot.
    pub async fn recover(
        &self,
        executor: &StepExecutor,
        ctx: &RunContext,
        primary: StepResult,
        fallback: PreparedFallback<'_>,
    ) -> StepResult {
        if !Self::should_trigger(&primary) {
            return primary;
        }

        let original_id = fallback.resolved.replaces.clone().unwrap_or_default();
        info!(
            step_id = %original_id,
            fallback_id = %fallback.step.id,
            layer = %fallback.step.layer,
            error = primary.error.as_deref().unwrap_or(""),
            "Triggering fallback"
        );
        self.event_bus.publish(WorkflowEvent::FallbackTriggered {
            run_id: ctx.run_id(),
            step_id: original_id,
            fallback_id: fallback.step.id.clone(),
            layer: fallback.step.layer,
        });

        let outcome = executor
            .execute(ctx, fallback.step, fallback.resolved, 0)
            .await;
        merge(&primary, &fallback.step.id, outcome)
    }
}

/// Fold the primary attempt's cost in time and calls into the fallback's result.
fn merge(primary: &StepResult, fallback_id: &str, mut outcome: StepResult) -> StepResult {
    outcome.metadata.fallback_used = true;
    outcome.metadata.fallback_step_id = Some(fallback_id.to_string());
    outcome.metadata.duration_ms += primary.metadata.duration_ms;
    outcome.metadata.attempts += primary.metadata.attempts;
    if !outcome.success {
        let primary_error = primary.error.as_deref().unwrap_or("unknown error");
        let fallback_error = outcome.error.take().unwrap_or_default();
        outcome.error = Some(format!(
            "{}; fallback '{}' also failed: {}",
            primary_error, fallback_id, fallback_error
        ));
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerflow_core::error::LayerflowError;
    use layerflow_core::input::InputValue;
    use layerflow_core::types::{Action, LayerKind, LayerOutput};
    use serde_json::json;

    fn original() -> ResolvedStep {
        let mut input = serde_json::Map::new();
        input.insert("query".into(), json!("rust async"));
        input.insert("depth".into(), json!(2));
        ResolvedStep {
            id: "search".into(),
            replaces: None,
            layer: LayerKind::Gemini,
            action: Action::Search,
            input,
        }
    }

    #[test]
    fn test_prepare_overlays_input() {
        let graph = TaskGraph::new(vec![Step::new("search", LayerKind::Gemini, Action::Search)])
            .with_fallback(
                "search",
                Step::new("search_fb", LayerKind::Claude, Action::Reason)
                    .with_input("depth", InputValue::literal(json!(1))),
            );
        let manager = FallbackManager::new(Arc::new(EventBus::default()));
        let prepared = manager
            .prepare(&graph, &original(), &HashMap::new())
            .unwrap()
            .unwrap();

        assert_eq!(prepared.resolved.id, "search_fb");
        assert_eq!(prepared.resolved.replaces.as_deref(), Some("search"));
        assert_eq!(prepared.resolved.layer, LayerKind::Claude);
        assert_eq!(prepared.resolved.input["query"], json!("rust async"));
        assert_eq!(prepared.resolved.input["depth"], json!(1));
    }

    #[test]
    fn test_prepare_without_fallback() {
        let graph = TaskGraph::new(vec![Step::new("search", LayerKind::Gemini, Action::Search)]);
        let manager = FallbackManager::new(Arc::new(EventBus::default()));
        assert!(manager.prepare(&graph, &original(), &HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_should_trigger() {
        let err = LayerflowError::Transport("reset".into());
        assert!(FallbackManager::should_trigger(&StepResult::failed(LayerKind::Gemini, &err, 5, 3)));
        assert!(!FallbackManager::should_trigger(&StepResult::failed(
            LayerKind::Gemini,
            &LayerflowError::Cancelled,
            5,
            1
        )));
        assert!(!FallbackManager::should_trigger(&StepResult::succeeded(
            LayerKind::Gemini,
            LayerOutput::text("ok"),
            5,
            1
        )));
    }

    #[test]
    fn test_merge_sums_and_marks() {
        let primary = StepResult::failed(LayerKind::Gemini, &LayerflowError::Transport("reset".into()), 30, 3);
        let outcome = StepResult::succeeded(LayerKind::Claude, LayerOutput::text("answer"), 12, 1);
        let merged = merge(&primary, "search_fb", outcome);
        assert!(merged.success);
        assert!(merged.metadata.fallback_used);
        assert_eq!(merged.metadata.fallback_step_id.as_deref(), Some("search_fb"));
        assert_eq!(merged.metadata.duration_ms, 42);
        assert_eq!(merged.metadata.attempts, 4);
        assert_eq!(merged.metadata.layer, LayerKind::Claude);
    }

    #[test]
    fn test_merge_keeps_both_errors() {
        let primary = StepResult::failed(LayerKind::Gemini, &LayerflowError::Transport("reset".into()), 30, 3);
        let outcome = StepResult::failed(
            LayerKind::Claude,
            &LayerflowError::LayerUnavailable {
                layer: LayerKind::Claude,
                reason: "no client registered".into(),
            },
            0,
            0,
        );
        let merged = merge(&primary, "search_fb", outcome);
        assert!(!merged.success);
        let error = merged.error.unwrap();
        assert!(error.contains("reset"));
        assert!(error.contains("search_fb"));
        assert_eq!(merged.metadata.error_kind, Some(ErrorKind::LayerUnavailable));
    }
}
