pub mod aggregator;
pub mod context;
pub mod executor;
pub mod fallback;
pub mod resolver;
pub mod scheduler;
pub mod template;

pub use aggregator::ResultAggregator;
pub use context::RunContext;
pub use executor::{calculate_backoff, RetryPolicy, StepExecutor};
pub use fallback::FallbackManager;
pub use resolver::{plan, resolve_phases, ExecutionPlan};
pub use scheduler::{PlanEstimate, WorkflowEngine};
pub use template::resolve_input;
