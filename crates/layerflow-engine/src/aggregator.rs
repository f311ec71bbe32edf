use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use layerflow_core::error::ErrorKind;
use layerflow_core::graph::TaskGraph;
use layerflow_core::types::{ExecutionMode, StepResult, WorkflowMetadata, WorkflowResult};

/// Builds the final `WorkflowResult` from the per-step outcomes of a run.
pub struct ResultAggregator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    mode: ExecutionMode,
    phases: Vec<Vec<String>>,
}

impl ResultAggregator {
    pub fn new(run_id: Uuid, mode: ExecutionMode, phases: Vec<Vec<String>>) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            mode,
            phases,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Every step of `graph` gets a slot: steps the run never reached are
    /// recorded as not executed with `unreached_reason`.
    ///
    /// The run succeeds only if every slot succeeded. Tokens and cost are
    /// summed over steps that actually called a layer.
    pub fn finish(
        self,
        graph: &TaskGraph,
        mut recorded: HashMap<String, StepResult>,
        unreached_reason: &str,
        total_duration_ms: u64,
    ) -> WorkflowResult {
        let mut results = BTreeMap::new();
        for step in &graph.steps {
            let result = recorded
                .remove(&step.id)
                .unwrap_or_else(|| StepResult::not_executed(step.layer, unreached_reason));
            results.insert(step.id.clone(), result);
        }

        let steps_completed = results.values().filter(|r| r.success).count();
        let steps_failed = results.len() - steps_completed;
        let steps_skipped = results
            .values()
            .filter(|r| r.error_kind() == Some(ErrorKind::Skipped))
            .count();

        let executed: Vec<&StepResult> = results
            .values()
            .filter(|r| r.metadata.executed())
            .collect();
        let total_tokens = sum_present(executed.iter().map(|r| r.metadata.tokens_used));
        let total_cost = sum_present(executed.iter().map(|r| r.metadata.cost));

        WorkflowResult {
            success: steps_failed == 0,
            results,
            metadata: WorkflowMetadata {
                run_id: self.run_id,
                started_at: self.started_at,
                total_duration_ms,
                steps_completed,
                steps_failed,
                steps_skipped,
                total_tokens,
                total_cost,
                mode: self.mode,
                phases: self.phases,
            },
        }
    }
}

/// Sum the values that are present, or `None` if none are.
fn sum_present<T, I>(values: I) -> Option<T>
where
    T: std::iter::Sum<T>,
    I: Iterator<Item = Option<T>>,
{
    let mut present = values.flatten().peekable();
    present.peek()?;
    Some(present.sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerflow_core::error::LayerflowError;
    use layerflow_core::graph::Step;
    use layerflow_core::types::{Action, LayerKind, LayerOutput};

    fn graph() -> TaskGraph {
        TaskGraph::new(vec![
            Step::new("a", LayerKind::Gemini, Action::Search),
            Step::new("b", LayerKind::Claude, Action::Summarize).depends_on(["a"]),
            Step::new("c", LayerKind::Claude, Action::Review).depends_on(["b"]),
            Step::new("d", LayerKind::Claude, Action::Reason),
        ])
    }

    #[test]
    fn test_all_succeeded() {
        let mut recorded = HashMap::new();
        for (id, tokens) in [("a", 10), ("b", 20), ("c", 5), ("d", 1)] {
            recorded.insert(
                id.to_string(),
                StepResult::succeeded(
                    LayerKind::Claude,
                    LayerOutput::text(id).with_usage(Some(tokens), Some(0.5)),
                    3,
                    1,
                ),
            );
        }
        let agg = ResultAggregator::new(Uuid::new_v4(), ExecutionMode::Sequential, vec![]);
        let result = agg.finish(&graph(), recorded, "unused", 12);

        assert!(result.success);
        assert_eq!(result.metadata.steps_completed, 4);
        assert_eq!(result.metadata.steps_failed, 0);
        assert_eq!(result.metadata.total_tokens, Some(36));
        assert_eq!(result.metadata.total_cost, Some(2.0));
        assert_eq!(result.metadata.total_duration_ms, 12);
    }

    #[test]
    fn test_failures_skips_and_unreached() {
        let mut recorded = HashMap::new();
        recorded.insert(
            "a".to_string(),
            StepResult::failed(LayerKind::Gemini, &LayerflowError::Transport("reset".into()), 9, 3),
        );
        recorded.insert("b".to_string(), StepResult::skipped(LayerKind::Claude, "a"));
        recorded.insert(
            "d".to_string(),
            StepResult::succeeded(LayerKind::Claude, LayerOutput::text("ok"), 2, 1),
        );
        let agg = ResultAggregator::new(Uuid::new_v4(), ExecutionMode::Parallel, vec![]);
        let result = agg.finish(&graph(), recorded, "workflow halted", 20);

        assert!(!result.success);
        assert_eq!(result.results.len(), 4);
        assert_eq!(result.metadata.steps_completed, 1);
        assert_eq!(result.metadata.steps_failed, 3);
        assert_eq!(result.metadata.steps_skipped, 1);
        assert_eq!(result.get("c").unwrap().error_kind(), Some(ErrorKind::NotExecuted));
        assert!(result.get("c").unwrap().error.as_deref().unwrap().contains("workflow halted"));
        assert_eq!(result.metadata.total_tokens, None);
    }

    #[test]
    fn test_empty_graph_succeeds() {
        let agg = ResultAggregator::new(Uuid::new_v4(), ExecutionMode::Sequential, vec![]);
        let result = agg.finish(&TaskGraph::default(), HashMap::new(), "", 0);
        assert!(result.success);
        assert!(result.results.is_empty());
    }
}
