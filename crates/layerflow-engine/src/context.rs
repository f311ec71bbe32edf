use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use layerflow_core::registry::{Availability, LayerRegistry};
use layerflow_core::traits::Layer;
use layerflow_core::types::LayerKind;

/// Read-only state for a single workflow run.
///
/// Carries the layer clients, the availability snapshot taken before the
/// run, and the run's cancellation token. Build one per `execute_workflow`
/// call; nothing in it is mutated by the scheduler.
pub struct RunContext {
    run_id: Uuid,
    registry: LayerRegistry,
    availability: Availability,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(registry: LayerRegistry, availability: Availability) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            registry,
            availability,
            cancel: CancellationToken::new(),
        }
    }

    /// Build a context by probing every registered layer now.
    pub fn probe(registry: LayerRegistry) -> Self {
        let availability = registry.probe();
        Self::new(registry, availability)
    }

    /// Use a caller-owned token so the run can be cancelled externally.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    /// The client for `kind`, if registered and reported available.
    pub fn available_layer(&self, kind: LayerKind) -> Option<Arc<dyn Layer>> {
        if self.availability.is_available(kind) {
            self.registry.get(kind)
        } else {
            None
        }
    }
}
