//! Mock layers and fixtures shared by layerflow tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use layerflow_core::config::AppConfig;
use layerflow_core::error::{LayerflowError, Result};
use layerflow_core::graph::{Step, TaskGraph};
use layerflow_core::registry::LayerRegistry;
use layerflow_core::traits::Layer;
use layerflow_core::types::{Action, LayerKind, LayerOutput, ResolvedStep};

/// Error a mock layer can be told to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Transport,
    RateLimited,
    InvalidInput,
    Execution,
}

impl MockFailure {
    fn to_error(self, layer: LayerKind, step_id: &str) -> LayerflowError {
        match self {
            MockFailure::Transport => LayerflowError::Transport(format!("mock transport failure in {}", step_id)),
            MockFailure::RateLimited => LayerflowError::RateLimited {
                layer,
                message: "mock quota exhausted".into(),
            },
            MockFailure::InvalidInput => LayerflowError::InvalidInput(format!("mock rejected {}", step_id)),
            MockFailure::Execution => LayerflowError::StepExecution {
                step: step_id.to_string(),
                message: "mock execution failure".into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StepScript {
    response: Option<LayerOutput>,
    /// Failure and how many calls it applies to (`None` means every call).
    failure: Option<(MockFailure, Option<u32>)>,
    delay: Option<Duration>,
}

/// A scriptable in-memory layer.
///
/// By default every call succeeds with `"<step id> output"` and 10 tokens.
/// Per-step responses, failures, and delays override that. Every call is
/// recorded, along with the peak number of calls in flight at once.
pub struct MockLayer {
    kind: LayerKind,
    available: AtomicBool,
    scripts: HashMap<String, StepScript>,
    delay: Duration,
    max_concurrency: Option<usize>,
    calls: Mutex<Vec<ResolvedStep>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockLayer {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            available: AtomicBool::new(true),
            scripts: HashMap::new(),
            delay: Duration::ZERO,
            max_concurrency: None,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Return `data` for `step_id`.
    pub fn with_response(mut self, step_id: &str, data: serde_json::Value) -> Self {
        self.script(step_id).response = Some(LayerOutput::new(data));
        self
    }

    pub fn with_output(mut self, step_id: &str, output: LayerOutput) -> Self {
        self.script(step_id).response = Some(output);
        self
    }

    /// Fail every call for `step_id`.
    pub fn failing(mut self, step_id: &str, failure: MockFailure) -> Self {
        self.script(step_id).failure = Some((failure, None));
        self
    }

    /// Fail the first `times` calls for `step_id`, then succeed.
    pub fn failing_times(mut self, step_id: &str, failure: MockFailure, times: u32) -> Self {
        self.script(step_id).failure = Some((failure, Some(times)));
        self
    }

    /// Sleep before answering any call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_step_delay(mut self, step_id: &str, delay: Duration) -> Self {
        self.script(step_id).delay = Some(delay);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    /// Report unavailable from the readiness probe.
    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every step this layer received, in call order.
    pub fn calls(&self) -> Vec<ResolvedStep> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn calls_for(&self, step_id: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|s| s.id == step_id).count())
            .unwrap_or(0)
    }

    /// Ids in call order.
    pub fn call_order(&self) -> Vec<String> {
        self.calls().into_iter().map(|s| s.id).collect()
    }

    /// Most calls that were in flight at the same moment.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn script(&mut self, step_id: &str) -> &mut StepScript {
        self.scripts.entry(step_id.to_string()).or_default()
    }

    fn record(&self, step: &ResolvedStep) -> u32 {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.push(step.clone());
        calls.iter().filter(|s| s.id == step.id).count() as u32
    }
}

/// Tracks in-flight calls; decrements on drop so cancelled calls count too.
struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Layer for MockLayer {
    fn kind(&self) -> LayerKind {
        self.kind
    }

    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_available() {
                Ok(())
            } else {
                Err(LayerflowError::LayerUnavailable {
                    layer: self.kind,
                    reason: "mock marked unavailable".into(),
                })
            }
        })
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn execute(&self, step: ResolvedStep) -> BoxFuture<'_, Result<LayerOutput>> {
        Box::pin(async move {
            let call = self.record(&step);
            let _guard = ActiveGuard::enter(&self.active, &self.peak);
            let script = self.scripts.get(&step.id).cloned().unwrap_or_default();

            let delay = script.delay.unwrap_or(self.delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if let Some((failure, times)) = script.failure {
                if times.map_or(true, |t| call <= t) {
                    return Err(failure.to_error(self.kind, &step.id));
                }
            }

            Ok(script.response.unwrap_or_else(|| {
                LayerOutput::text(format!("{} output", step.id)).with_usage(Some(10), None)
            }))
        })
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
            .unwrap_or_else(|| self.kind.default_concurrency())
    }
}

/// Register each mock under its own kind.
pub fn registry_with(layers: &[Arc<MockLayer>]) -> LayerRegistry {
    let mut registry = LayerRegistry::new();
    for layer in layers {
        registry.register_arc(layer.clone());
    }
    registry
}

/// Engine settings with millisecond backoff so retry tests stay fast.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.retry.initial_backoff_ms = 1;
    config.engine.retry.max_backoff_ms = 5;
    config
}

/// Write `content` to a config file inside a fresh temp dir.
///
/// Keep the returned dir alive for as long as the path is used.
pub fn temp_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("layerflow.toml");
    std::fs::write(&path, content).expect("write config");
    (dir, path)
}

/// `search` (gemini) feeding `summarize` (claude).
pub fn search_then_summarize() -> TaskGraph {
    TaskGraph::new(vec![
        Step::new("search", LayerKind::Gemini, Action::Search).with_text("query", "rust async runtimes"),
        Step::new("summarize", LayerKind::Claude, Action::Summarize)
            .with_text("text", "{{search}}")
            .depends_on(["search"]),
    ])
}

/// `a` fans out to `b` and `c`, which join at `d`. All on claude.
pub fn diamond() -> TaskGraph {
    TaskGraph::new(vec![
        Step::new("a", LayerKind::Claude, Action::Reason).with_text("prompt", "plan"),
        Step::new("b", LayerKind::Claude, Action::Reason)
            .with_text("prompt", "left: {{a}}")
            .depends_on(["a"]),
        Step::new("c", LayerKind::Claude, Action::Reason)
            .with_text("prompt", "right: {{a}}")
            .depends_on(["a"]),
        Step::new("d", LayerKind::Claude, Action::Review)
            .with_text("prompt", "{{b}} + {{c}}")
            .depends_on(["b", "c"]),
    ])
}

/// `n` independent gemini searches.
pub fn independent_searches(n: usize) -> TaskGraph {
    TaskGraph::new(
        (0..n)
            .map(|i| {
                Step::new(format!("s{}", i), LayerKind::Gemini, Action::Search)
                    .with_input("query", layerflow_core::input::InputValue::literal(json!(format!("q{}", i))))
            })
            .collect(),
    )
}
