use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{LayerKind, LayerOutput, ResolvedStep};

/// Layer: a backend executor the scheduler treats as an opaque capability.
///
/// One instance per backend is shared by every concurrent step of a run, so
/// implementations must be safe to call from several tasks at once. Dropping
/// the future returned by `execute` must release any child process or socket.
pub trait Layer: Send + Sync + 'static {
    /// Which backend this is.
    fn kind(&self) -> LayerKind;

    /// Idempotent setup. Fails if the backend is unreachable.
    fn initialize(&self) -> BoxFuture<'_, Result<()>>;

    /// Fast readiness probe. Must not block.
    fn is_available(&self) -> bool;

    /// Whether this layer accepts the given step shape.
    fn can_handle(&self, step: &ResolvedStep) -> bool {
        step.action.supported_by(self.kind())
    }

    /// Perform the work.
    fn execute(&self, step: ResolvedStep) -> BoxFuture<'_, Result<LayerOutput>>;

    /// Estimated cost in USD, if the backend bills per call.
    fn cost(&self, step: &ResolvedStep) -> Option<f64> {
        let _ = step;
        None
    }

    /// Expected wall time for the step.
    fn estimated_duration(&self, step: &ResolvedStep) -> Duration {
        let _ = step;
        self.default_timeout() / 4
    }

    /// Timeout applied when a step does not set its own.
    fn default_timeout(&self) -> Duration {
        self.kind().default_timeout()
    }

    /// How many steps may call this layer at once.
    fn max_concurrency(&self) -> usize {
        self.kind().default_concurrency()
    }
}

impl LayerKind {
    /// File-processing calls run far longer than text search.
    pub fn default_timeout(&self) -> Duration {
        match self {
            LayerKind::Claude => Duration::from_secs(120),
            LayerKind::Gemini => Duration::from_secs(60),
            LayerKind::Multimodal => Duration::from_secs(300),
        }
    }

    pub fn default_concurrency(&self) -> usize {
        match self {
            LayerKind::Claude => 2,
            LayerKind::Gemini => 4,
            LayerKind::Multimodal => 2,
        }
    }
}
