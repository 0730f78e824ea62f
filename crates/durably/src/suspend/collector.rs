//! Event-stream collectors for resume state
//!
//! Collectors subscribe to the event stream as an [`EventSink`], record every
//! completed step, and can produce a [`ResumeState`] at any time. The
//! approval collector additionally surfaces pending approvals and lets the
//! orchestrator inject decisions into its own recording.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::step::{decode_result, encode_result, error_from_cached, StepResult};
use crate::workflow::{EventKind, EventSink, ResumeState, WorkflowError, WorkflowEvent};

/// Records every `step_complete` and yields resume state on demand
#[derive(Default)]
pub struct ResumeStateCollector {
    steps: Mutex<IndexMap<String, StepResult>>,
}

impl ResumeStateCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A resume-state snapshot of everything recorded so far
    pub fn resume_state(&self) -> ResumeState {
        ResumeState {
            steps: self.steps.lock().clone(),
        }
    }

    /// Number of keyed steps recorded
    pub fn step_count(&self) -> usize {
        self.steps.lock().len()
    }
}

impl EventSink for ResumeStateCollector {
    fn emit(&self, event: &WorkflowEvent) {
        if let EventKind::StepComplete {
            step_key: Some(key),
            result,
            meta,
            ..
        } = &event.kind
        {
            self.steps
                .lock()
                .insert(key.clone(), encode_result(result.clone(), meta.as_ref()));
        }
    }
}

/// A pending approval observed in the event stream
#[derive(Debug, Clone, PartialEq)]
pub struct PendingApprovalInfo {
    pub step_key: String,
    pub reason: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Resume-state collector that also tracks pending approvals
///
/// Injecting a decision mutates the collector's own recording, so the next
/// [`resume_state`](Self::resume_state) call already carries the approved
/// value.
#[derive(Default)]
pub struct ApprovalStateCollector {
    steps: Mutex<IndexMap<String, StepResult>>,
}

impl ApprovalStateCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume_state(&self) -> ResumeState {
        ResumeState {
            steps: self.steps.lock().clone(),
        }
    }

    /// Steps currently suspended on an approval
    pub fn pending_approvals(&self) -> Vec<PendingApprovalInfo> {
        self.steps
            .lock()
            .iter()
            .filter_map(|(_, encoded)| {
                let (result, _meta) = decode_result(encoded);
                let StepResult::Err { error, cause } = result else {
                    return None;
                };
                match error_from_cached(&error, cause.as_ref()) {
                    WorkflowError::PendingApproval {
                        step_key,
                        reason,
                        metadata,
                    } => Some(PendingApprovalInfo {
                        step_key,
                        reason,
                        metadata,
                    }),
                    _ => None,
                }
            })
            .collect()
    }

    pub fn has_pending_approvals(&self) -> bool {
        !self.pending_approvals().is_empty()
    }

    /// Replace a recorded step with an approved value
    pub fn inject_approval(&self, step_key: impl Into<String>, value: Value) {
        self.steps
            .lock()
            .insert(step_key.into(), StepResult::Ok(value));
    }
}

impl EventSink for ApprovalStateCollector {
    fn emit(&self, event: &WorkflowEvent) {
        if let EventKind::StepComplete {
            step_key: Some(key),
            result,
            meta,
            ..
        } = &event.kind
        {
            self.steps
                .lock()
                .insert(key.clone(), encode_result(result.clone(), meta.as_ref()));
        }
    }
}
