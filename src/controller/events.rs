//! Event recorders
//!
//! `KubeRecorder` publishes through the events API; `MemoryRecorder` keeps
//! events in memory for tests and dry runs.

use crate::domain::ports::{EventKind, EventRecorder};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Publishes events to the API server
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeRecorder {
    async fn publish(
        &self,
        reference: ObjectReference,
        kind: EventKind,
        reason: &str,
        message: String,
    ) {
        let object = reference.name.clone().unwrap_or_default();
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message),
            action: reason.to_string(),
            secondary: None,
        };
        match recorder.publish(event).await {
            Ok(()) => debug!(object = %object, reason = %reason, "Event published"),
            Err(e) => warn!(object = %object, reason = %reason, error = %e, "Failed to publish event"),
        }
    }
}

/// One recorded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

/// In-memory event sink
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons in publication order
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn publish(
        &self,
        reference: ObjectReference,
        kind: EventKind,
        reason: &str,
        message: String,
    ) {
        self.events.lock().push(RecordedEvent {
            object: reference.name.unwrap_or_default(),
            kind,
            reason: reason.to_string(),
            message,
        });
    }
}
