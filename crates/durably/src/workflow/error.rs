//! Error taxonomy exposed to workflow callers
//!
//! The engine composes user-domain step errors with its own fixed variants
//! (concurrency, persistence, versioning, cancellation) and the suspension
//! signals used by the human-in-the-loop protocol. Everything is one
//! serializable tagged union so failed steps can be cached in snapshots and
//! replayed losslessly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a run collided with another run of the same workflow id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    /// Another run of this id is active in this process
    InProcess,

    /// Another process holds the lease for this id
    CrossProcess,
}

impl std::fmt::Display for ConcurrencyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess => write!(f, "in-process"),
            Self::CrossProcess => write!(f, "cross-process"),
        }
    }
}

/// Store operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceOp {
    Load,
    Save,
    Delete,
}

impl std::fmt::Display for PersistenceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Save => write!(f, "save"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Terminal error of a workflow run
///
/// User-domain failures travel in the [`Step`](Self::Step) variant; the other
/// variants are fixed engine outcomes. The suspension variants
/// ([`PendingApproval`](Self::PendingApproval), [`PendingHook`](Self::PendingHook),
/// [`ApprovalRejected`](Self::ApprovalRejected)) are structurally ordinary step
/// errors; callers pattern-match them to drive resume logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowError {
    /// Deterministic domain failure returned by user code
    #[error("step failed: {error}")]
    Step {
        /// Caller-defined error value (string or tagged record)
        error: Value,

        /// Structured diagnostic data preserved across replay
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<Value>,
    },

    /// A failure the engine could not classify
    #[error("unexpected failure: {message}")]
    Unexpected {
        message: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<Value>,
    },

    /// Stored snapshot was produced by a different workflow-logic version
    #[error("workflow version mismatch: stored {stored}, requested {requested}")]
    VersionMismatch { stored: i64, requested: i64 },

    /// Another run of the same workflow id is already executing
    #[error("workflow already running ({reason})")]
    ConcurrentExecution { reason: ConcurrencyScope },

    /// A snapshot or lease backend operation failed
    #[error("persistence failure during {operation}: {message}")]
    Persistence {
        operation: PersistenceOp,
        message: String,
    },

    /// The external cancellation signal stopped the run
    #[error("workflow cancelled")]
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_step_key: Option<String>,
    },

    /// A step is waiting for a human approval; persist and come back
    #[error("step {step_key} is waiting for approval")]
    PendingApproval {
        step_key: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,

        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },

    /// A step is waiting for an external callback identified by a hook id
    #[error("step {step_key} is waiting for hook {hook_id}")]
    PendingHook {
        hook_id: String,
        step_key: String,

        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },

    /// The approval gating a step was rejected
    #[error("approval for step {step_key} was rejected: {reason}")]
    ApprovalRejected { step_key: String, reason: String },

    /// A step exceeded its deadline
    #[error("step timed out after {timeout_ms}ms")]
    StepTimeout {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_key: Option<String>,

        timeout_ms: u64,
    },
}

impl WorkflowError {
    /// Create a domain step error from any serializable value
    pub fn step(error: impl Serialize) -> Self {
        Self::Step {
            error: to_value_lossy(error),
            cause: None,
        }
    }

    /// Create a domain step error with a structured cause
    pub fn step_with_cause(error: impl Serialize, cause: impl Serialize) -> Self {
        Self::Step {
            error: to_value_lossy(error),
            cause: Some(to_value_lossy(cause)),
        }
    }

    /// Create an unclassified failure
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
            cause: None,
        }
    }

    /// Create a pending-approval suspension signal for a step key
    pub fn pending_approval(step_key: impl Into<String>) -> Self {
        Self::PendingApproval {
            step_key: step_key.into(),
            reason: None,
            metadata: Map::new(),
        }
    }

    /// Create a pending-hook suspension signal for a hook id
    pub fn pending_hook(hook_id: impl Into<String>) -> Self {
        let hook_id = hook_id.into();
        let step_key = format!("{}{}", crate::suspend::HOOK_KEY_PREFIX, hook_id);
        Self::PendingHook {
            hook_id,
            step_key,
            metadata: Map::new(),
        }
    }

    /// Create an approval-rejected error
    pub fn approval_rejected(step_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ApprovalRejected {
            step_key: step_key.into(),
            reason: reason.into(),
        }
    }

    /// Set the reason on a pending-approval error
    pub fn with_reason(mut self, value: impl Into<String>) -> Self {
        if let Self::PendingApproval { reason, .. } = &mut self {
            *reason = Some(value.into());
        }
        self
    }

    /// Set the metadata on a pending-approval or pending-hook error
    pub fn with_metadata(mut self, value: Map<String, Value>) -> Self {
        match &mut self {
            Self::PendingApproval { metadata, .. } | Self::PendingHook { metadata, .. } => {
                *metadata = value;
            }
            _ => {}
        }
        self
    }

    /// Whether this error means "persist me and come back with more input"
    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::PendingApproval { .. } | Self::PendingHook { .. })
    }

    /// Whether this error came from the cancellation signal
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The domain cause, when one was attached
    pub fn cause(&self) -> Option<&Value> {
        match self {
            Self::Step { cause, .. } | Self::Unexpected { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unexpected {
            message: format!("{err:#}"),
            cause: Some(serde_json::json!({
                "uncaught_exception": err.chain().map(|e| e.to_string()).collect::<Vec<_>>(),
            })),
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unexpected {
            message: format!("serialization error: {err}"),
            cause: None,
        }
    }
}

fn to_value_lossy(value: impl Serialize) -> Value {
    match serde_json::to_value(&value) {
        Ok(v) => v,
        Err(e) => Value::String(format!("unserializable error value: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_error_display() {
        let err = WorkflowError::step("PaymentDeclined");
        assert_eq!(err.to_string(), "step failed: \"PaymentDeclined\"");
    }

    #[test]
    fn test_tagged_serialization() {
        let err = WorkflowError::step_with_cause("PaymentDeclined", json!({"code": 402}));
        let encoded = serde_json::to_string(&err).unwrap();
        assert!(encoded.contains("\"type\":\"step\""));

        let parsed: WorkflowError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(err, parsed);
    }

    #[test]
    fn test_pending_hook_step_key() {
        let err = WorkflowError::pending_hook("abc");
        match err {
            WorkflowError::PendingHook { step_key, .. } => assert_eq!(step_key, "hook:abc"),
            _ => panic!("expected PendingHook"),
        }
    }

    #[test]
    fn test_suspension_predicates() {
        assert!(WorkflowError::pending_approval("a").is_suspension());
        assert!(WorkflowError::pending_hook("h").is_suspension());
        assert!(!WorkflowError::step("x").is_suspension());

        let cancelled = WorkflowError::Cancelled {
            reason: None,
            last_step_key: None,
        };
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_suspension());
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: WorkflowError = anyhow::anyhow!("boom").into();
        match err {
            WorkflowError::Unexpected { message, cause } => {
                assert!(message.contains("boom"));
                assert!(cause.is_some());
            }
            _ => panic!("expected Unexpected"),
        }
    }

    #[test]
    fn test_concurrency_scope_round_trip() {
        let err = WorkflowError::ConcurrentExecution {
            reason: ConcurrencyScope::CrossProcess,
        };
        let encoded = serde_json::to_value(&err).unwrap();
        assert_eq!(encoded["reason"], "cross_process");

        let parsed: WorkflowError = serde_json::from_value(encoded).unwrap();
        assert_eq!(err, parsed);
    }
}
