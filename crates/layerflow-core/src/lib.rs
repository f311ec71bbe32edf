pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod input;
pub mod registry;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, LayerflowError, Result};
pub use event::{EventBus, WorkflowEvent};
pub use graph::{Step, TaskGraph};
pub use input::{InputValue, StepOutputRef, TextSegment};
pub use registry::{Availability, LayerRegistry};
pub use traits::Layer;
pub use types::*;
