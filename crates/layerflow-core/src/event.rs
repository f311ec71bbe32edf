use serde::Serialize;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::types::{ExecutionMode, LayerKind};

/// Progress notifications emitted while a workflow runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        run_id: Uuid,
        mode: ExecutionMode,
        steps: usize,
    },
    PhaseStarted {
        run_id: Uuid,
        index: usize,
        step_ids: Vec<String>,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
        layer: LayerKind,
    },
    StepRetrying {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    FallbackTriggered {
        run_id: Uuid,
        step_id: String,
        fallback_id: String,
        layer: LayerKind,
    },
    StepFinished {
        run_id: Uuid,
        step_id: String,
        success: bool,
        duration_ms: u64,
        error_kind: Option<ErrorKind>,
    },
    WorkflowFinished {
        run_id: Uuid,
        success: bool,
        total_duration_ms: u64,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let run_id = Uuid::new_v4();
        bus.publish(WorkflowEvent::WorkflowFinished {
            run_id,
            success: true,
            total_duration_ms: 5,
        });
        match rx.recv().await.unwrap() {
            WorkflowEvent::WorkflowFinished { success, .. } => assert!(success),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(WorkflowEvent::StepStarted {
            run_id: Uuid::new_v4(),
            step_id: "a".into(),
            layer: LayerKind::Claude,
        });
    }
}
