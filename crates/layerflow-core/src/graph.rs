use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LayerflowError, Result};
use crate::input::{InputValue, StepOutputRef};
use crate::types::{Action, LayerKind};

/// One unit of work bound to a layer and an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within its graph.
    pub id: String,
    pub layer: LayerKind,
    pub action: Action,
    #[serde(default)]
    pub input: BTreeMap<String, InputValue>,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    /// Overrides the layer's default timeout.
    #[serde(default, alias = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Extra attempts after the first one. Overrides the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl Step {
    pub fn new(id: impl Into<String>, layer: LayerKind, action: Action) -> Self {
        Self {
            id: id.into(),
            layer,
            action,
            input: BTreeMap::new(),
            depends_on: vec![],
            timeout_ms: None,
            retries: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: InputValue) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    /// Add a string input, parsing any `{{...}}` references in it.
    pub fn with_text(self, key: impl Into<String>, text: &str) -> Self {
        self.with_input(key, InputValue::text(text))
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// All upstream references made by this step's input.
    pub fn references(&self) -> Vec<&StepOutputRef> {
        self.input.values().flat_map(|v| v.references()).collect()
    }
}

/// A workflow: steps, their dependency edges, and per-step fallbacks.
///
/// Built once by the caller and never mutated while it runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub steps: Vec<Step>,
    /// Whole-run deadline.
    #[serde(default, alias = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, alias = "continueOnError")]
    pub continue_on_error: bool,
    /// Replacement step per original step id.
    #[serde(default, alias = "fallbackStrategies")]
    pub fallback_strategies: BTreeMap<String, Step>,
}

impl TaskGraph {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, step_id: impl Into<String>, fallback: Step) -> Self {
        self.fallback_strategies.insert(step_id.into(), fallback);
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn fallback_for(&self, id: &str) -> Option<&Step> {
        self.fallback_strategies.get(id)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a graph from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Structural checks that need no ordering: unique ids, supported
    /// actions, known dependencies, and well-formed fallbacks.
    ///
    /// Cycles and reference reachability are checked by the resolver.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(LayerflowError::DuplicateStep(step.id.clone()));
            }
            check_action(step)?;
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(LayerflowError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for (original_id, fallback) in &self.fallback_strategies {
            let original = self.step(original_id).ok_or_else(|| LayerflowError::InvalidFallback {
                step: original_id.clone(),
                reason: "no step with this id".into(),
            })?;
            if fallback.id == *original_id {
                return Err(LayerflowError::InvalidFallback {
                    step: original_id.clone(),
                    reason: "fallback id must differ from the step it replaces".into(),
                });
            }
            if let Some(extra) = fallback
                .depends_on
                .iter()
                .find(|d| !original.depends_on.contains(d))
            {
                return Err(LayerflowError::InvalidFallback {
                    step: original_id.clone(),
                    reason: format!("fallback adds dependency '{}'", extra),
                });
            }
            check_action(fallback)?;
        }

        Ok(())
    }
}

fn check_action(step: &Step) -> Result<()> {
    if step.action.supported_by(step.layer) {
        Ok(())
    } else {
        Err(LayerflowError::UnsupportedAction {
            step: step.id.clone(),
            layer: step.layer,
            action: step.action.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_then_summarize() -> TaskGraph {
        TaskGraph::new(vec![
            Step::new("search", LayerKind::Gemini, Action::Search).with_text("query", "rust"),
            Step::new("summarize", LayerKind::Claude, Action::Summarize)
                .with_text("text", "{{search}}")
                .depends_on(["search"]),
        ])
    }

    #[test]
    fn test_parse_camel_case_graph() {
        let json = r#"{
            "steps": [
                {"id": "search", "layer": "gemini", "action": "search", "dependsOn": []},
                {"id": "summarize", "layer": "claude", "action": "summarize",
                 "dependsOn": ["search"], "input": {"text": "{{search}}"}}
            ],
            "continueOnError": true,
            "fallbackStrategies": {
                "search": {"id": "search_fallback", "layer": "claude", "action": "reason"}
            }
        }"#;
        let graph = TaskGraph::from_json_str(json).unwrap();
        assert_eq!(graph.steps.len(), 2);
        assert!(graph.continue_on_error);
        assert_eq!(graph.steps[1].depends_on, vec!["search"]);
        assert_eq!(graph.steps[1].references()[0].step_id, "search");
        assert_eq!(graph.fallback_for("search").unwrap().id, "search_fallback");
        graph.validate().unwrap();
    }

    #[test]
    fn test_duplicate_step() {
        let graph = TaskGraph::new(vec![
            Step::new("a", LayerKind::Claude, Action::Reason),
            Step::new("a", LayerKind::Claude, Action::Code),
        ]);
        assert!(matches!(graph.validate(), Err(LayerflowError::DuplicateStep(id)) if id == "a"));
    }

    #[test]
    fn test_unknown_dependency() {
        let graph = TaskGraph::new(vec![
            Step::new("a", LayerKind::Claude, Action::Reason).depends_on(["ghost"]),
        ]);
        match graph.validate() {
            Err(LayerflowError::UnknownDependency { step, dependency }) => {
                assert_eq!(step, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected UnknownDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_action() {
        let graph = TaskGraph::new(vec![Step::new("a", LayerKind::Claude, Action::Search)]);
        assert!(matches!(
            graph.validate(),
            Err(LayerflowError::UnsupportedAction { .. })
        ));
    }

    #[test]
    fn test_fallback_rules() {
        let same_id = search_then_summarize()
            .with_fallback("search", Step::new("search", LayerKind::Claude, Action::Reason));
        assert!(matches!(
            same_id.validate(),
            Err(LayerflowError::InvalidFallback { .. })
        ));

        let new_dep = search_then_summarize().with_fallback(
            "search",
            Step::new("fb", LayerKind::Claude, Action::Reason).depends_on(["summarize"]),
        );
        assert!(matches!(
            new_dep.validate(),
            Err(LayerflowError::InvalidFallback { reason, .. }) if reason.contains("summarize")
        ));

        let missing = search_then_summarize()
            .with_fallback("nope", Step::new("fb", LayerKind::Claude, Action::Reason));
        assert!(missing.validate().is_err());

        let ok = search_then_summarize().with_fallback(
            "summarize",
            Step::new("summarize_fb", LayerKind::Gemini, Action::Summarize).depends_on(["search"]),
        );
        ok.validate().unwrap();
    }
}
