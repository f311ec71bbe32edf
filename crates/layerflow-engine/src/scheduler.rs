use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use layerflow_core::config::AppConfig;
use layerflow_core::error::Result;
use layerflow_core::event::{EventBus, WorkflowEvent};
use layerflow_core::graph::{Step, TaskGraph};
use layerflow_core::registry::LayerRegistry;
use layerflow_core::input::InputValue;
use layerflow_core::types::{ExecutionMode, LayerKind, ResolvedStep, StepResult, WorkflowResult};

use crate::aggregator::ResultAggregator;
use crate::context::RunContext;
use crate::executor::{RetryPolicy, StepExecutor};
use crate::fallback::{FallbackManager, PreparedFallback};
use crate::resolver::{self, ExecutionPlan};
use crate::template::resolve_input;

/// Runs task graphs against a set of layers.
///
/// Dispatch follows the resolved phases. In parallel mode a step starts as
/// soon as all of its dependencies have results, bounded by each layer's
/// concurrency limit; sequential mode runs one step at a time in phase
/// order. When a run halts on a failure, steps already calling a layer
/// finish and steps still waiting for a concurrency slot are recorded as
/// not executed. The engine holds no per-run state, so one instance can
/// serve concurrent runs.
pub struct WorkflowEngine {
    registry: LayerRegistry,
    executor: StepExecutor,
    fallbacks: FallbackManager,
    event_bus: Arc<EventBus>,
    default_mode: ExecutionMode,
    workflow_timeout: Option<Duration>,
}

impl WorkflowEngine {
    pub fn new(registry: LayerRegistry) -> Self {
        Self::from_config(registry, &AppConfig::default())
    }

    pub fn from_config(registry: LayerRegistry, config: &AppConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
        let mut executor = StepExecutor::new(
            RetryPolicy::from(&config.engine.retry),
            config.engine.default_retries,
        )
        .with_event_bus(event_bus.clone());
        for kind in LayerKind::ALL {
            if let Some(timeout) = config.layer_timeout(kind) {
                executor = executor.with_layer_timeout(kind, timeout);
            }
        }

        Self {
            registry,
            executor,
            fallbacks: FallbackManager::new(event_bus.clone()),
            event_bus,
            default_mode: config.engine.default_mode,
            workflow_timeout: config.workflow_timeout(),
        }
    }

    /// Publish run events on a caller-owned bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.executor = self.executor.with_event_bus(event_bus.clone());
        self.fallbacks = FallbackManager::new(event_bus.clone());
        self.event_bus = event_bus;
        self
    }

    /// Deadline for graphs that do not set their own.
    pub fn with_workflow_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_timeout = Some(timeout);
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    pub fn default_mode(&self) -> ExecutionMode {
        self.default_mode
    }

    /// Validate `graph` and compute its phases without running anything.
    pub fn plan(&self, graph: &TaskGraph) -> Result<ExecutionPlan> {
        resolver::plan(graph)
    }

    /// Rough critical-path duration and summed cost of `graph`, from each
    /// layer's own estimates. Inputs that reference other steps are left out
    /// of the estimate. Steps whose layer is not registered count as zero.
    pub fn estimate(&self, graph: &TaskGraph) -> Result<PlanEstimate> {
        let plan = resolver::plan(graph)?;
        let mut estimate = PlanEstimate::default();
        for phase in &plan.phases {
            let mut slowest = Duration::ZERO;
            for step in phase.iter().filter_map(|id| graph.step(id)) {
                let Some(layer) = self.registry.get(step.layer) else {
                    continue;
                };
                let shape = literal_shape(step);
                slowest = slowest.max(layer.estimated_duration(&shape));
                if let Some(cost) = layer.cost(&shape) {
                    *estimate.cost.get_or_insert(0.0) += cost;
                }
            }
            estimate.duration += slowest;
        }
        Ok(estimate)
    }

    /// Run `graph`, probing layer availability first.
    ///
    /// Structural problems (cycles, unknown dependencies, bad references,
    /// bad fallbacks) return `Err` before any layer is called. Step failures
    /// never do: they are reported in the returned result.
    pub async fn execute_workflow(
        &self,
        graph: &TaskGraph,
        mode: ExecutionMode,
    ) -> Result<WorkflowResult> {
        let ctx = RunContext::probe(self.registry.clone());
        self.execute_workflow_with(graph, mode, &ctx).await
    }

    /// Run `graph` with an explicit context, e.g. a fixed availability
    /// snapshot or an externally owned cancellation token.
    pub async fn execute_workflow_with(
        &self,
        graph: &TaskGraph,
        mode: ExecutionMode,
        ctx: &RunContext,
    ) -> Result<WorkflowResult> {
        let plan = resolver::plan(graph)?;
        let mode = plan.effective_mode(mode);
        let start = Instant::now();
        let aggregator = ResultAggregator::new(ctx.run_id(), mode, plan.phases.clone());

        info!(
            run_id = %ctx.run_id(),
            mode = %mode,
            steps = graph.steps.len(),
            phases = plan.phases.len(),
            "Starting workflow"
        );
        self.event_bus.publish(WorkflowEvent::WorkflowStarted {
            run_id: ctx.run_id(),
            mode,
            steps: graph.steps.len(),
        });

        let deadline = graph
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.workflow_timeout);
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = deadline.map(|deadline| {
            let cancel = ctx.cancel_token().clone();
            let timed_out = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        });

        let outcome = self.run(graph, &plan, mode, ctx).await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        let state = outcome?;

        let reason = if timed_out.load(Ordering::SeqCst) {
            let ms = deadline.map_or(0, |d| d.as_millis() as u64);
            warn!(run_id = %ctx.run_id(), timeout_ms = ms, "Workflow timed out");
            format!("workflow timed out after {}ms", ms)
        } else if ctx.is_cancelled() {
            "workflow cancelled".to_string()
        } else if let Some(failed) = &state.halted_by {
            halt_reason(failed)
        } else {
            "step was never scheduled".to_string()
        };

        let total_duration_ms = start.elapsed().as_millis() as u64;
        let result = aggregator.finish(graph, state.results, &reason, total_duration_ms);

        info!(
            run_id = %ctx.run_id(),
            success = result.success,
            completed = result.metadata.steps_completed,
            failed = result.metadata.steps_failed,
            duration_ms = total_duration_ms,
            "Workflow finished"
        );
        self.event_bus.publish(WorkflowEvent::WorkflowFinished {
            run_id: ctx.run_id(),
            success: result.success,
            total_duration_ms,
        });

        Ok(result)
    }

    async fn run(
        &self,
        graph: &TaskGraph,
        plan: &ExecutionPlan,
        mode: ExecutionMode,
        ctx: &RunContext,
    ) -> Result<RunState> {
        let limits = LayerLimits::new(ctx.registry());
        let max_in_flight = match mode {
            ExecutionMode::Sequential => 1,
            _ => usize::MAX,
        };

        let mut pending: Vec<&Step> = plan
            .phases
            .iter()
            .flatten()
            .filter_map(|id| graph.step(id))
            .collect();
        let mut state = RunState::default();
        let mut announced = 0;
        let mut in_flight = FuturesUnordered::new();

        loop {
            let mut i = 0;
            while i < pending.len()
                && in_flight.len() < max_in_flight
                && state.halted_by.is_none()
                && !ctx.is_cancelled()
            {
                let step = pending[i];
                if !step.depends_on.iter().all(|d| state.results.contains_key(d)) {
                    i += 1;
                    continue;
                }
                pending.remove(i);
                self.announce_phases(ctx, plan, &step.id, &mut announced);

                if let Some(failed) = step
                    .depends_on
                    .iter()
                    .find(|d| !state.results[d.as_str()].success)
                {
                    debug!(step_id = %step.id, dependency = %failed, "Skipping step");
                    let skipped = StepResult::skipped(step.layer, failed);
                    self.record(ctx, graph, &mut state, &limits, step.id.clone(), skipped);
                    continue;
                }

                match self.prepare(graph, step, &state.results)? {
                    Dispatch::Ready(resolved, fallback) => {
                        in_flight.push(self.run_step(ctx, step, resolved, fallback, &limits));
                    }
                    Dispatch::Rejected(result) => {
                        self.record(ctx, graph, &mut state, &limits, step.id.clone(), result);
                    }
                }
            }

            match in_flight.next().await {
                Some((step_id, result)) => {
                    self.record(ctx, graph, &mut state, &limits, step_id, result)
                }
                None => break,
            }
        }

        Ok(state)
    }

    /// Resolve a ready step's input, and its fallback's.
    fn prepare<'g>(
        &self,
        graph: &'g TaskGraph,
        step: &Step,
        results: &HashMap<String, StepResult>,
    ) -> Result<Dispatch<'g>> {
        let input = match resolve_input(&step.id, &step.input, results) {
            Ok(input) => input,
            Err(e) if e.is_structural() => return Err(e),
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "Step input could not be resolved");
                return Ok(Dispatch::Rejected(StepResult::failed(step.layer, &e, 0, 0)));
            }
        };

        let resolved = ResolvedStep {
            id: step.id.clone(),
            replaces: None,
            layer: step.layer,
            action: step.action,
            input,
        };
        let fallback = self.fallbacks.prepare(graph, &resolved, results)?;
        Ok(Dispatch::Ready(resolved, fallback))
    }

    async fn run_step(
        &self,
        ctx: &RunContext,
        step: &Step,
        resolved: ResolvedStep,
        fallback: Option<PreparedFallback<'_>>,
        limits: &LayerLimits,
    ) -> (String, StepResult) {
        let primary = {
            let _permit = limits.acquire(step.layer).await;
            if let Some(failed) = limits.halted_by() {
                debug!(step_id = %step.id, halted_by = %failed, "Run halted while step was queued");
                let result = StepResult::not_executed(step.layer, &halt_reason(failed));
                return (step.id.clone(), result);
            }
            let retries = self.executor.retries_for(step);
            self.executor.execute(ctx, step, resolved, retries).await
        };

        let result = match fallback {
            Some(fallback) if FallbackManager::should_trigger(&primary) => {
                let _permit = limits.acquire(fallback.step.layer).await;
                self.fallbacks
                    .recover(&self.executor, ctx, primary, fallback)
                    .await
            }
            _ => primary,
        };
        (step.id.clone(), result)
    }

    fn record(
        &self,
        ctx: &RunContext,
        graph: &TaskGraph,
        state: &mut RunState,
        limits: &LayerLimits,
        step_id: String,
        result: StepResult,
    ) {
        self.event_bus.publish(WorkflowEvent::StepFinished {
            run_id: ctx.run_id(),
            step_id: step_id.clone(),
            success: result.success,
            duration_ms: result.metadata.duration_ms,
            error_kind: result.error_kind(),
        });
        if !result.success && !graph.continue_on_error && state.halted_by.is_none() {
            warn!(step_id = %step_id, "Step failed, halting workflow");
            state.halted_by = Some(step_id.clone());
            limits.halt(&step_id);
        }
        state.results.insert(step_id, result);
    }

    fn announce_phases(
        &self,
        ctx: &RunContext,
        plan: &ExecutionPlan,
        step_id: &str,
        announced: &mut usize,
    ) {
        let Some(phase) = plan.phase_of(step_id) else {
            return;
        };
        while *announced <= phase {
            let index = *announced;
            debug!(run_id = %ctx.run_id(), phase = index, "Entering phase");
            self.event_bus.publish(WorkflowEvent::PhaseStarted {
                run_id: ctx.run_id(),
                index,
                step_ids: plan.phases[index].clone(),
            });
            *announced += 1;
        }
    }
}

#[derive(Default)]
struct RunState {
    results: HashMap<String, StepResult>,
    /// First failed step when the run stops on error.
    halted_by: Option<String>,
}

enum Dispatch<'g> {
    Ready(ResolvedStep, Option<PreparedFallback<'g>>),
    /// Input resolution failed; the step is recorded without a layer call.
    Rejected(StepResult),
}

/// Estimated cost of a graph before it runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanEstimate {
    /// Sum over phases of the slowest step in each.
    pub duration: Duration,
    /// `None` when no layer reports a cost.
    pub cost: Option<f64>,
}

/// A step as its layer would see it, with only literal inputs.
fn literal_shape(step: &Step) -> ResolvedStep {
    let input = step
        .input
        .iter()
        .filter_map(|(key, value)| match value {
            InputValue::Literal(v) => Some((key.clone(), v.clone())),
            _ => None,
        })
        .collect();
    ResolvedStep {
        id: step.id.clone(),
        replaces: None,
        layer: step.layer,
        action: step.action,
        input,
    }
}

fn halt_reason(failed: &str) -> String {
    format!("workflow halted after step '{}' failed", failed)
}

/// One semaphore per registered layer, sized by its concurrency limit.
/// Once the run halts, steps that get a permit must not call their layer.
struct LayerLimits {
    semaphores: HashMap<LayerKind, Semaphore>,
    halted_by: OnceLock<String>,
}

impl LayerLimits {
    fn new(registry: &LayerRegistry) -> Self {
        let semaphores = registry
            .kinds()
            .into_iter()
            .filter_map(|kind| {
                let layer = registry.get(kind)?;
                Some((kind, Semaphore::new(layer.max_concurrency().max(1))))
            })
            .collect();
        Self {
            semaphores,
            halted_by: OnceLock::new(),
        }
    }

    fn halt(&self, step_id: &str) {
        let _ = self.halted_by.set(step_id.to_string());
    }

    fn halted_by(&self) -> Option<&str> {
        self.halted_by.get().map(String::as_str)
    }

    async fn acquire(&self, kind: LayerKind) -> Option<SemaphorePermit<'_>> {
        match self.semaphores.get(&kind) {
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        }
    }
}
