use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use layerflow_core::config::RetryConfig;
use layerflow_core::error::{LayerflowError, Result};
use layerflow_core::event::{EventBus, WorkflowEvent};
use layerflow_core::graph::Step;
use layerflow_core::types::{LayerKind, LayerOutput, ResolvedStep, StepResult};

use crate::context::RunContext;

/// Backoff bounds between attempts of one step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Exponential backoff with 0.8x–1.2x jitter so that steps failing together
/// do not retry in lockstep.
pub fn calculate_backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base = policy.initial_backoff.as_millis() as u64;
    let ms = base
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(policy.max_backoff.as_millis() as u64);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Runs one step against its layer with a timeout and bounded retries.
pub struct StepExecutor {
    retry: RetryPolicy,
    default_retries: u32,
    timeouts: HashMap<LayerKind, Duration>,
    event_bus: Arc<EventBus>,
}

impl StepExecutor {
    pub fn new(retry: RetryPolicy, default_retries: u32) -> Self {
        Self {
            retry,
            default_retries,
            timeouts: HashMap::new(),
            event_bus: Arc::new(EventBus::default()),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Override the default timeout for every step on `layer`.
    pub fn with_layer_timeout(mut self, layer: LayerKind, timeout: Duration) -> Self {
        self.timeouts.insert(layer, timeout);
        self
    }

    /// Extra attempts for `step` after its first one.
    pub fn retries_for(&self, step: &Step) -> u32 {
        step.retries.unwrap_or(self.default_retries)
    }

    /// Execute `resolved` with up to `retries` extra attempts.
    ///
    /// Never returns an error: every outcome, including an unavailable layer
    /// or cancellation, is captured in the returned `StepResult`.
    pub async fn execute(
        &self,
        ctx: &RunContext,
        step: &Step,
        resolved: ResolvedStep,
        retries: u32,
    ) -> StepResult {
        let start = Instant::now();
        let layer_kind = resolved.layer;

        let Some(layer) = ctx.available_layer(layer_kind) else {
            let reason = if ctx.registry().get(layer_kind).is_some() {
                "reported unavailable"
            } else {
                "no client registered"
            };
            warn!(step_id = %resolved.id, layer = %layer_kind, reason, "Layer unavailable");
            let err = LayerflowError::LayerUnavailable {
                layer: layer_kind,
                reason: reason.to_string(),
            };
            return StepResult::failed(layer_kind, &err, elapsed_ms(start), 0);
        };

        if !layer.can_handle(&resolved) {
            let err = LayerflowError::InvalidInput(format!(
                "layer '{}' declined action '{}'",
                layer_kind, resolved.action
            ));
            return StepResult::failed(layer_kind, &err, elapsed_ms(start), 0);
        }

        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .or_else(|| self.timeouts.get(&layer_kind).copied())
            .unwrap_or_else(|| layer.default_timeout());

        self.event_bus.publish(WorkflowEvent::StepStarted {
            run_id: ctx.run_id(),
            step_id: resolved.id.clone(),
            layer: layer_kind,
        });

        let mut attempts = 0;
        loop {
            if ctx.is_cancelled() {
                let err = LayerflowError::Cancelled;
                return StepResult::failed(layer_kind, &err, elapsed_ms(start), attempts);
            }
            attempts += 1;
            debug!(step_id = %resolved.id, layer = %layer_kind, attempt = attempts, "Dispatching step");

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel_token().cancelled() => Err(LayerflowError::Cancelled),
                r = tokio::time::timeout(timeout, layer.execute(resolved.clone())) => match r {
                    Ok(result) => result,
                    Err(_) => Err(LayerflowError::StepTimeout {
                        step: resolved.id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                },
            };

            let err = match outcome.and_then(|o| ensure_output(&resolved.id, o)) {
                Ok(output) => return self.success(&resolved, output, start, attempts),
                Err(e) => e,
            };

            if err.is_retryable() && attempts <= retries {
                let backoff = calculate_backoff(attempts - 1, &self.retry);
                warn!(
                    step_id = %resolved.id,
                    attempt = attempts,
                    max_retries = retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Retrying step"
                );
                self.event_bus.publish(WorkflowEvent::StepRetrying {
                    run_id: ctx.run_id(),
                    step_id: resolved.id.clone(),
                    attempt: attempts,
                    backoff_ms: backoff.as_millis() as u64,
                    error: err.to_string(),
                });

                let cancelled = tokio::select! {
                    _ = ctx.cancel_token().cancelled() => true,
                    _ = tokio::time::sleep(backoff) => false,
                };
                if !cancelled {
                    continue;
                }
                let err = LayerflowError::Cancelled;
                return StepResult::failed(layer_kind, &err, elapsed_ms(start), attempts);
            }

            warn!(step_id = %resolved.id, layer = %layer_kind, attempts, error = %err, "Step failed");
            return StepResult::failed(layer_kind, &err, elapsed_ms(start), attempts);
        }
    }

    fn success(
        &self,
        resolved: &ResolvedStep,
        output: LayerOutput,
        start: Instant,
        attempts: u32,
    ) -> StepResult {
        let duration_ms = elapsed_ms(start);
        info!(step_id = %resolved.id, layer = %resolved.layer, duration_ms, attempts, "Step succeeded");
        StepResult::succeeded(resolved.layer, output, duration_ms, attempts)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Validate a layer's raw output before it is recorded.
pub fn ensure_output(step_id: &str, output: LayerOutput) -> Result<LayerOutput> {
    if output.data.is_null() {
        return Err(LayerflowError::StepExecution {
            step: step_id.to_string(),
            message: "layer returned no data".into(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        for _ in 0..20 {
            let first = calculate_backoff(0, &policy).as_millis();
            assert!((80..=120).contains(&first), "first backoff {}", first);

            let third = calculate_backoff(2, &policy).as_millis();
            assert!((320..=480).contains(&third), "third backoff {}", third);

            let capped = calculate_backoff(10, &policy).as_millis();
            assert!(capped <= 1200, "capped backoff {}", capped);
        }
    }

    #[test]
    fn test_backoff_no_overflow() {
        let policy = RetryPolicy::default();
        let d = calculate_backoff(64, &policy);
        assert!(d <= Duration::from_millis(36_000));
    }

    #[test]
    fn test_retries_for_step() {
        let executor = StepExecutor::new(RetryPolicy::default(), 2);
        let step = Step::new("a", LayerKind::Claude, layerflow_core::types::Action::Reason);
        assert_eq!(executor.retries_for(&step), 2);
        assert_eq!(executor.retries_for(&step.clone().with_retries(0)), 0);
    }

    #[test]
    fn test_ensure_output_rejects_null() {
        assert!(ensure_output("a", LayerOutput::new(serde_json::Value::Null)).is_err());
        assert!(ensure_output("a", LayerOutput::text("ok")).is_ok());
    }
}
