//! Workflow event stream
//!
//! Every state transition of a run is reported as a [`WorkflowEvent`] through
//! the configured [`EventSink`]. Events power observability and the resume
//! collectors; they are not the persistence mechanism (snapshots are).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::step::{StepFailureMeta, StepResult};
use crate::workflow::WorkflowError;

/// A timestamped event from one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub workflow_id: String,

    pub ts: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: EventKind,
}

impl WorkflowEvent {
    /// Create an event stamped with the current time
    pub fn now(workflow_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            ts: Utc::now(),
            kind,
        }
    }

    /// The step key, for step-scoped events
    pub fn step_key(&self) -> Option<&str> {
        match &self.kind {
            EventKind::StepStart { step_key, .. }
            | EventKind::StepComplete { step_key, .. }
            | EventKind::StepRetry { step_key, .. } => step_key.as_deref(),
            EventKind::StepCacheHit { step_key, .. }
            | EventKind::StepCacheMiss { step_key, .. }
            | EventKind::PersistSuccess { step_key }
            | EventKind::PersistError { step_key, .. }
            | EventKind::HookAfterStep { step_key }
            | EventKind::HookAfterStepError { step_key, .. } => Some(step_key),
            _ => None,
        }
    }

    /// Whether this event ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::WorkflowSuccess
                | EventKind::WorkflowError { .. }
                | EventKind::WorkflowCancelled { .. }
        )
    }
}

/// Event payloads, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStart,

    WorkflowSuccess,

    WorkflowError {
        error: WorkflowError,
    },

    WorkflowCancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_step_key: Option<String>,
    },

    StepStart {
        name: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_key: Option<String>,
    },

    /// A step finished; carries the decoded result and its failure meta
    StepComplete {
        name: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_key: Option<String>,

        duration_ms: u64,

        result: StepResult,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<StepFailureMeta>,
    },

    /// A keyed step was served from the replay cache; the operation did not run
    StepCacheHit {
        name: String,
        step_key: String,
    },

    StepCacheMiss {
        name: String,
        step_key: String,
    },

    /// An intermediate retry attempt failed; only the final outcome is cached
    StepRetry {
        name: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_key: Option<String>,

        attempt: u32,

        delay_ms: u64,

        error: WorkflowError,
    },

    PersistSuccess {
        step_key: String,
    },

    /// A checkpoint write failed; the run continues (fail-open)
    PersistError {
        step_key: String,
        message: String,
    },

    HookBeforeStart,

    HookBeforeStartError {
        message: String,
    },

    HookAfterStep {
        step_key: String,
    },

    HookAfterStepError {
        step_key: String,
        message: String,
    },
}

/// Receiver for workflow events
///
/// Implementations must be cheap and non-blocking; the engine emits from the
/// hot path of every step. Closures work directly:
///
/// ```
/// use durably::workflow::{EventSink, WorkflowEvent};
///
/// let sink = |event: &WorkflowEvent| {
///     tracing::debug!(workflow_id = %event.workflow_id, "event");
/// };
/// let _: &dyn EventSink = &sink;
/// ```
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &WorkflowEvent);
}

impl<F> EventSink for F
where
    F: Fn(&WorkflowEvent) + Send + Sync,
{
    fn emit(&self, event: &WorkflowEvent) {
        self(event)
    }
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &WorkflowEvent) {}
}

/// Sink that buffers events in memory, for tests and inspection
#[derive(Debug, Default)]
pub struct BufferSink {
    events: parking_lot::Mutex<Vec<WorkflowEvent>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events emitted so far
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }

    /// Count events matching a predicate
    pub fn count(&self, predicate: impl Fn(&WorkflowEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for BufferSink {
    fn emit(&self, event: &WorkflowEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_tags() {
        let event = WorkflowEvent::now(
            "wf-1",
            EventKind::StepCacheHit {
                name: "fetch".to_string(),
                step_key: "fetch".to_string(),
            },
        );

        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"type\":\"step_cache_hit\""));
        assert!(encoded.contains("\"workflow_id\":\"wf-1\""));

        let parsed: WorkflowEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_step_key_accessor() {
        let event = WorkflowEvent::now(
            "wf-1",
            EventKind::StepComplete {
                name: "fetch".to_string(),
                step_key: Some("fetch".to_string()),
                duration_ms: 12,
                result: StepResult::ok(json!(1)),
                meta: None,
            },
        );
        assert_eq!(event.step_key(), Some("fetch"));

        let start = WorkflowEvent::now("wf-1", EventKind::WorkflowStart);
        assert_eq!(start.step_key(), None);
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::now("wf", EventKind::WorkflowSuccess).is_terminal());
        assert!(WorkflowEvent::now(
            "wf",
            EventKind::WorkflowCancelled {
                reason: None,
                last_step_key: None
            }
        )
        .is_terminal());
        assert!(!WorkflowEvent::now("wf", EventKind::WorkflowStart).is_terminal());
    }

    #[test]
    fn test_buffer_sink_records() {
        let sink = BufferSink::new();
        sink.emit(&WorkflowEvent::now("wf", EventKind::WorkflowStart));
        sink.emit(&WorkflowEvent::now("wf", EventKind::WorkflowSuccess));

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.count(|e| e.is_terminal()), 1);
    }
}
