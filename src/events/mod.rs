//! Lifecycle events and event handling.
//!
//! The runner emits an event for every stage transition, enabling
//! observability into a pipeline run without coupling the runner to any
//! particular sink.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{RunId, SubjectId, TaskId};

/// Lifecycle events emitted during a pipeline run.
#[derive(Debug, Clone)]
pub enum Event {
    /// A stage has started execution.
    StageStarted {
        task_id: TaskId,
        subject: SubjectId,
        timestamp: Instant,
    },

    /// A stage completed successfully.
    StageCompleted {
        task_id: TaskId,
        subject: SubjectId,
        duration: Duration,
        timestamp: Instant,
    },

    /// A stage failed.
    StageFailed {
        task_id: TaskId,
        subject: SubjectId,
        error: String,
        timestamp: Instant,
    },

    /// A stage was skipped because its outputs are already complete.
    StageSkipped {
        task_id: TaskId,
        subject: SubjectId,
        timestamp: Instant,
    },

    /// A stage could not run because upstream requirements are missing.
    StageBlocked {
        task_id: TaskId,
        subject: SubjectId,
        timestamp: Instant,
    },

    /// A pipeline run finished.
    RunCompleted {
        subject: SubjectId,
        run_id: RunId,
        success: bool,
        duration: Duration,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::StageStarted { timestamp, .. } => *timestamp,
            Event::StageCompleted { timestamp, .. } => *timestamp,
            Event::StageFailed { timestamp, .. } => *timestamp,
            Event::StageSkipped { timestamp, .. } => *timestamp,
            Event::StageBlocked { timestamp, .. } => *timestamp,
            Event::RunCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Create a StageStarted event.
    pub fn stage_started(task_id: TaskId, subject: SubjectId) -> Self {
        Event::StageStarted {
            task_id,
            subject,
            timestamp: Instant::now(),
        }
    }

    /// Create a StageCompleted event.
    pub fn stage_completed(task_id: TaskId, subject: SubjectId, duration: Duration) -> Self {
        Event::StageCompleted {
            task_id,
            subject,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a StageFailed event.
    pub fn stage_failed(task_id: TaskId, subject: SubjectId, error: String) -> Self {
        Event::StageFailed {
            task_id,
            subject,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a StageSkipped event.
    pub fn stage_skipped(task_id: TaskId, subject: SubjectId) -> Self {
        Event::StageSkipped {
            task_id,
            subject,
            timestamp: Instant::now(),
        }
    }

    /// Create a StageBlocked event.
    pub fn stage_blocked(task_id: TaskId, subject: SubjectId) -> Self {
        Event::StageBlocked {
            task_id,
            subject,
            timestamp: Instant::now(),
        }
    }

    /// Create a RunCompleted event.
    pub fn run_completed(
        subject: SubjectId,
        run_id: RunId,
        success: bool,
        duration: Duration,
    ) -> Self {
        Event::RunCompleted {
            subject,
            run_id,
            success,
            duration,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Test handler that records received events.
    struct RecordingHandler {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        async fn events(&self) -> Vec<Event> {
            self.events.lock().await.clone()
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: &Event) {
            self.events.lock().await.push(event.clone());
        }
    }

    /// Test handler that counts events.
    struct CountingHandler {
        count: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_all_handlers() {
        let bus = EventBus::new();
        let first = Arc::new(CountingHandler {
            count: AtomicU32::new(0),
        });
        let second = Arc::new(CountingHandler {
            count: AtomicU32::new(0),
        });
        bus.register(first.clone()).await;
        bus.register(second.clone()).await;

        bus.emit(Event::stage_started(
            TaskId::new("preparation"),
            SubjectId::new("sub01"),
        ))
        .await;

        assert_eq!(first.count.load(Ordering::SeqCst), 1);
        assert_eq!(second.count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count().await, 2);
    }

    #[tokio::test]
    async fn test_recorded_event_carries_identifiers() {
        let bus = EventBus::new();
        let handler = Arc::new(RecordingHandler::new());
        bus.register(handler.clone()).await;

        bus.emit(Event::stage_failed(
            TaskId::new("masking"),
            SubjectId::new("sub01"),
            "5tt2gmwmi exited with code 1".to_string(),
        ))
        .await;

        let events = handler.events().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::StageFailed { task_id, error, .. } => {
                assert_eq!(task_id.as_str(), "masking");
                assert!(error.contains("5tt2gmwmi"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emit_without_handlers_is_fine() {
        let bus = EventBus::new();
        bus.emit(Event::stage_skipped(
            TaskId::new("preparation"),
            SubjectId::new("sub01"),
        ))
        .await;
        assert_eq!(bus.handler_count().await, 0);
    }
}
